use serde::{Deserialize, Serialize};

use crate::{config::ScalingConfig, record::Record};

/// Number of scaled features per record.
pub const FEATURE_DIM: usize = 18;

/// Scaled features; the array type pins the length to [`FEATURE_DIM`].
pub type FeatureVector = [f64; FEATURE_DIM];

/// A normalized record with its unscaled failure flag and source offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Scaled features in schema order.
    pub features: FeatureVector,
    /// Raw failure flag, used only as a filter key.
    pub failure_flag: String,
    /// Offset of the source message.
    pub offset: i64,
}

impl NormalizedRecord {
    /// Whether the record is eligible for the autoencoder (`failure_flag == "false"`).
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.failure_flag == crate::record::HEALTHY_FLAG
    }
}

/// Stateless min-max scaler mapping each field's range onto [-1, 1].
///
/// Out-of-range inputs scale outside [-1, 1]; values are never clamped.
#[derive(Debug, Clone, Default)]
pub struct FeatureNormalizer {
    scaling: ScalingConfig,
}

impl FeatureNormalizer {
    /// Creates a normalizer over validated ranges.
    #[must_use]
    pub const fn new(scaling: ScalingConfig) -> Self {
        Self { scaling }
    }

    /// Scales one value of the feature at `index`.
    #[must_use]
    pub fn scale(&self, index: usize, value: f64) -> f64 {
        let range = self.scaling.range(index);
        (value - range.min) / (range.max - range.min) * 2.0 - 1.0
    }

    /// Scales every feature of `record` and carries the failure flag through.
    #[must_use]
    pub fn normalize(&self, record: &Record) -> (FeatureVector, String) {
        let raw = record.features();
        let features = std::array::from_fn(|index| self.scale(index, raw[index]));
        (features, record.failure_occurred.clone())
    }

    /// Normalizes and tags the result with its source offset.
    #[must_use]
    pub fn normalize_at(&self, record: &Record, offset: i64) -> NormalizedRecord {
        let (features, failure_flag) = self.normalize(record);
        NormalizedRecord {
            features,
            failure_flag,
            offset,
        }
    }
}
