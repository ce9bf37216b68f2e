use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{layer::DenseLayer, TrainingSummary};
use crate::{error::ModelError, normalizer::FEATURE_DIM};

/// Current artifact document version.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Persisted autoencoder: topology, parameters and training provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Document version, checked on load.
    pub format_version: u32,
    /// Model file name the artifact is stored under.
    pub model_file: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Width of the input vector.
    pub input_dim: usize,
    /// L1 activity coefficient used during training.
    pub l1_activity: f64,
    /// Dense layers in forward order.
    pub layers: Vec<DenseLayer>,
    /// Summary of the training run that produced the weights.
    #[serde(default)]
    pub summary: Option<TrainingSummary>,
}

impl ModelArtifact {
    /// Serialises to pretty JSON.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses and validates a JSON document.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let artifact: Self = serde_json::from_slice(bytes)?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Checks the version and that layer shapes chain from input back to input width.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::UnsupportedFormat(self.format_version));
        }
        if self.input_dim != FEATURE_DIM {
            return Err(ModelError::Shape(format!(
                "artifact input_dim {} != {FEATURE_DIM}",
                self.input_dim
            )));
        }
        let mut width = self.input_dim;
        for (index, layer) in self.layers.iter().enumerate() {
            layer.check()?;
            if layer.inputs() != width {
                return Err(ModelError::Shape(format!(
                    "layer {index} expects {} inputs but receives {width}",
                    layer.inputs()
                )));
            }
            width = layer.units();
        }
        if self.layers.is_empty() || width != FEATURE_DIM {
            return Err(ModelError::Shape(format!(
                "artifact must reconstruct {FEATURE_DIM} features, final width is {width}"
            )));
        }
        Ok(())
    }
}
