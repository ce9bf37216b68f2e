//! Dense autoencoder trained to reconstruct healthy feature vectors.

/// Persisted model document.
pub mod artifact;
/// Dense layers and activations.
pub mod layer;
/// Adam optimiser state.
pub mod optimizer;

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use ndarray::{Array2, Axis};
use rand::{rngs::SmallRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    config::ModelConfig,
    error::{ModelError, PipelineResult},
    normalizer::{FeatureVector, NormalizedRecord, FEATURE_DIM},
};

pub use artifact::{ModelArtifact, ARTIFACT_FORMAT_VERSION};
pub use layer::{Activation, DenseLayer, LayerConfig};
use optimizer::{Adam, Gradient};

/// Outcome of [`Autoencoder::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Samples seen per epoch.
    pub samples: usize,
    /// Epochs run.
    pub epochs: usize,
    /// Samples per gradient step.
    pub batch_size: usize,
    /// Mean batch loss of each epoch, in order.
    pub epoch_losses: Vec<f64>,
}

impl TrainingSummary {
    /// Loss of the last epoch.
    #[must_use]
    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_losses.last().copied()
    }
}

/// Reconstruction of one scored record.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    /// Offset of the source message.
    pub offset: i64,
    /// Reconstructed feature vector.
    pub reconstruction: FeatureVector,
    /// Mean squared error between input and reconstruction.
    pub error: f64,
}

impl InferenceOutput {
    /// UTF-8 payload published for this record.
    #[must_use]
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InferenceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, value) in self.reconstruction.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str("]")
    }
}

/// Hook fired once per completed inference batch.
///
/// Invocations come from the single pipeline task, one at a time, in batch order.
#[async_trait]
pub trait BatchObserver: Send {
    /// Receives the outputs of batch `batch` only.
    async fn on_batch_end(&mut self, batch: usize, outputs: &[InferenceOutput])
        -> PipelineResult<()>;
}

/// Stack of dense layers mapping 18 features back onto themselves.
#[derive(Debug, Clone)]
pub struct Autoencoder {
    layers: Vec<DenseLayer>,
    config: ModelConfig,
}

impl Autoencoder {
    /// Fresh model with seeded Glorot weights.
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        if config.layers.last().map(|layer| layer.units) != Some(FEATURE_DIM) {
            return Err(ModelError::Shape(format!(
                "topology must end with {FEATURE_DIM} units"
            )));
        }
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let mut inputs = FEATURE_DIM;
        let mut layers = Vec::with_capacity(config.layers.len());
        for layer in &config.layers {
            layers.push(DenseLayer::glorot(inputs, *layer, &mut rng));
            inputs = layer.units;
        }
        Ok(Self {
            layers,
            config: config.clone(),
        })
    }

    /// Rebuilds a trained model; `config` supplies batch size for inference.
    pub fn from_artifact(artifact: &ModelArtifact, config: &ModelConfig) -> Result<Self, ModelError> {
        artifact.validate()?;
        let mut config = config.clone();
        config.layers = artifact.layers.iter().map(DenseLayer::config).collect();
        config.l1_activity = artifact.l1_activity;
        Ok(Self {
            layers: artifact.layers.clone(),
            config,
        })
    }

    /// Snapshot of the current parameters.
    #[must_use]
    pub fn to_artifact(
        &self,
        model_file: impl Into<String>,
        summary: Option<TrainingSummary>,
    ) -> ModelArtifact {
        ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_file: model_file.into(),
            created_at: Utc::now(),
            input_dim: FEATURE_DIM,
            l1_activity: self.config.l1_activity,
            layers: self.layers.clone(),
            summary,
        }
    }

    /// Layer topology.
    #[must_use]
    pub fn topology(&self) -> Vec<LayerConfig> {
        self.layers.iter().map(DenseLayer::config).collect()
    }

    /// Inference batch size.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Trains on `(x, x)` pairs in the given order.
    pub fn fit(&mut self, samples: &[FeatureVector]) -> Result<TrainingSummary, ModelError> {
        self.fit_with(samples, |_, _| {})
    }

    /// Like [`Self::fit`], calling `on_epoch(epoch, mean_loss)` after each epoch.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit_with(
        &mut self,
        samples: &[FeatureVector],
        mut on_epoch: impl FnMut(usize, f64),
    ) -> Result<TrainingSummary, ModelError> {
        if samples.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let batch_size = self.config.batch_size.max(1);
        let mut optimizer = Adam::new(&self.config, &self.layers);
        let mut epoch_losses = Vec::with_capacity(self.config.epochs);

        for epoch in 1..=self.config.epochs {
            let mut total = 0.0;
            let mut batches = 0_usize;
            for chunk in samples.chunks(batch_size) {
                let (loss, gradients) = self.gradients(&to_matrix(chunk));
                optimizer.step(&mut self.layers, &gradients);
                total += loss;
                batches += 1;
            }
            let mean = total / batches as f64;
            on_epoch(epoch, mean);
            epoch_losses.push(mean);
        }

        Ok(TrainingSummary {
            samples: samples.len(),
            epochs: self.config.epochs,
            batch_size,
            epoch_losses,
        })
    }

    /// Reconstructs each input vector.
    #[must_use]
    pub fn reconstruct(&self, inputs: &[FeatureVector]) -> Vec<FeatureVector> {
        if inputs.is_empty() {
            return Vec::new();
        }
        let output = self.forward(to_matrix(inputs));
        output
            .outer_iter()
            .map(|row| std::array::from_fn(|column| row[column]))
            .collect()
    }

    /// Reconstructs records and measures their reconstruction error.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, records: &[NormalizedRecord]) -> Vec<InferenceOutput> {
        let inputs: Vec<FeatureVector> = records.iter().map(|record| record.features).collect();
        self.reconstruct(&inputs)
            .into_iter()
            .zip(records)
            .map(|(reconstruction, record)| {
                let error = reconstruction
                    .iter()
                    .zip(&record.features)
                    .map(|(out, input)| (out - input).powi(2))
                    .sum::<f64>()
                    / FEATURE_DIM as f64;
                InferenceOutput {
                    offset: record.offset,
                    reconstruction,
                    error,
                }
            })
            .collect()
    }

    /// Scores one batch and hands the outputs to `observer`.
    pub async fn infer_batch(
        &self,
        batch: usize,
        records: &[NormalizedRecord],
        observer: &mut dyn BatchObserver,
    ) -> PipelineResult<usize> {
        let outputs = self.score(records);
        observer.on_batch_end(batch, &outputs).await?;
        Ok(outputs.len())
    }

    fn forward(&self, input: Array2<f64>) -> Array2<f64> {
        self.layers
            .iter()
            .fold(input, |current, layer| layer.forward(&current).1)
    }

    /// Loss (MSE plus L1 activity on the first layer) and per-layer gradients.
    #[allow(clippy::cast_precision_loss)]
    fn gradients(&self, batch: &Array2<f64>) -> (f64, Vec<Gradient>) {
        let rows = batch.nrows() as f64;
        let l1 = self.config.l1_activity;

        // activations[i] is the input of layer i; the last entry is the output.
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut current = batch.clone();
        for layer in &self.layers {
            let (z, activated) = layer.forward(&current);
            activations.push(current);
            pre_activations.push(z);
            current = activated;
        }
        activations.push(current);

        let output = &activations[self.layers.len()];
        let residual = output - batch;
        let mut loss = residual.mapv(|r| r * r).sum() / (rows * FEATURE_DIM as f64);
        if l1 > 0.0 {
            loss += l1 * activations[1].mapv(f64::abs).sum() / rows;
        }

        let mut upstream = residual * (2.0 / (rows * FEATURE_DIM as f64));
        let mut gradients = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate().rev() {
            if index == 0 && l1 > 0.0 {
                upstream = upstream + activations[1].mapv(|a| l1 * sign(a) / rows);
            }
            let delta = upstream
                * layer
                    .activation
                    .derivative(&pre_activations[index], &activations[index + 1]);
            gradients.push(Gradient {
                weights: activations[index].t().dot(&delta),
                biases: delta.sum_axis(Axis(0)),
            });
            upstream = delta.dot(&layer.weights.t());
        }
        gradients.reverse();
        (loss, gradients)
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn to_matrix(rows: &[FeatureVector]) -> Array2<f64> {
    Array2::from_shape_fn((rows.len(), FEATURE_DIM), |(row, column)| rows[row][column])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(epochs: usize) -> ModelConfig {
        ModelConfig {
            epochs,
            ..ModelConfig::default()
        }
    }

    fn healthy(features: FeatureVector, offset: i64) -> NormalizedRecord {
        NormalizedRecord {
            features,
            failure_flag: "false".into(),
            offset,
        }
    }

    #[test]
    fn default_topology_matches_production_model() {
        let model = Autoencoder::new(&ModelConfig::default()).unwrap();
        let units: Vec<usize> = model.topology().iter().map(|layer| layer.units).collect();
        assert_eq!(units, vec![14, 7, 7, 18]);
        assert_eq!(model.topology()[0].activation, Activation::Tanh);
        assert_eq!(model.topology()[3].activation, Activation::Relu);
    }

    #[test]
    fn training_reduces_loss_on_constant_signal() {
        let mut model = Autoencoder::new(&small_config(30)).unwrap();
        let samples = vec![[0.5; FEATURE_DIM]; 40];
        let mut seen = Vec::new();
        let summary = model
            .fit_with(&samples, |epoch, loss| seen.push((epoch, loss)))
            .unwrap();
        assert_eq!(summary.epochs, 30);
        assert_eq!(summary.samples, 40);
        assert_eq!(seen.len(), 30);
        assert_eq!(seen[0].0, 1);
        let first = summary.epoch_losses[0];
        let last = summary.final_loss().unwrap();
        assert!(last < first, "loss did not fall: {first} -> {last}");
    }

    #[test]
    fn empty_training_set_is_an_error() {
        let mut model = Autoencoder::new(&ModelConfig::default()).unwrap();
        assert!(matches!(model.fit(&[]), Err(ModelError::EmptyTrainingSet)));
    }

    #[test]
    fn same_seed_gives_same_weights() {
        let a = Autoencoder::new(&ModelConfig::default()).unwrap();
        let b = Autoencoder::new(&ModelConfig::default()).unwrap();
        assert_eq!(a.layers, b.layers);
    }

    #[test]
    fn artifact_round_trip_preserves_inference() {
        let mut model = Autoencoder::new(&small_config(3)).unwrap();
        let samples = vec![[0.25; FEATURE_DIM]; 8];
        let summary = model.fit(&samples).unwrap();
        let artifact = model.to_artifact("model.json", Some(summary));
        let bytes = artifact.to_json_bytes().unwrap();

        let restored = ModelArtifact::from_json_bytes(&bytes).unwrap();
        assert_eq!(restored.model_file, "model.json");
        let reloaded = Autoencoder::from_artifact(&restored, &ModelConfig::default()).unwrap();
        let record = healthy([0.1; FEATURE_DIM], 4);
        let before = model.score(std::slice::from_ref(&record));
        let after = reloaded.score(std::slice::from_ref(&record));
        for (x, y) in before[0].reconstruction.iter().zip(&after[0].reconstruction) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_eq!(after[0].offset, 4);
    }

    #[test]
    fn artifact_with_broken_shape_is_rejected() {
        let model = Autoencoder::new(&ModelConfig::default()).unwrap();
        let mut artifact = model.to_artifact("m", None);
        artifact.layers.remove(1);
        assert!(matches!(artifact.validate(), Err(ModelError::Shape(_))));

        let mut artifact = model.to_artifact("m", None);
        artifact.format_version = 99;
        assert!(matches!(
            artifact.validate(),
            Err(ModelError::UnsupportedFormat(99))
        ));
    }

    #[test]
    fn output_text_is_bracketed_and_space_separated() {
        let mut reconstruction = [0.0; FEATURE_DIM];
        reconstruction[0] = 0.5;
        reconstruction[17] = 1.25;
        let output = InferenceOutput {
            offset: 0,
            reconstruction,
            error: 0.0,
        };
        let text = output.to_text();
        assert!(text.starts_with("[0.5 0 "));
        assert!(text.ends_with(" 1.25]"));
        assert_eq!(text.split(' ').count(), FEATURE_DIM);
    }

    struct Recorder(Vec<(usize, usize)>);

    #[async_trait]
    impl BatchObserver for Recorder {
        async fn on_batch_end(
            &mut self,
            batch: usize,
            outputs: &[InferenceOutput],
        ) -> PipelineResult<()> {
            self.0.push((batch, outputs.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn observer_sees_only_its_batch() {
        let model = Autoencoder::new(&ModelConfig::default()).unwrap();
        let mut recorder = Recorder(Vec::new());
        let records: Vec<_> = (0..3).map(|i| healthy([0.0; FEATURE_DIM], i)).collect();
        model.infer_batch(0, &records[..2], &mut recorder).await.unwrap();
        model.infer_batch(1, &records[2..], &mut recorder).await.unwrap();
        assert_eq!(recorder.0, vec![(0, 2), (1, 1)]);
    }
}
