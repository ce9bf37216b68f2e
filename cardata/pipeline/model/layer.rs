use ndarray::{Array1, Array2};
use rand::{rngs::SmallRng, Rng};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Element-wise activation applied after a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Hyperbolic tangent.
    Tanh,
    /// Rectified linear unit.
    Relu,
}

impl Activation {
    /// Applies the activation to pre-activations `z`.
    #[must_use]
    pub fn apply(self, z: &Array2<f64>) -> Array2<f64> {
        match self {
            Self::Tanh => z.mapv(f64::tanh),
            Self::Relu => z.mapv(|v| v.max(0.0)),
        }
    }

    /// Derivative with respect to `z`, given `activated = apply(z)`.
    #[must_use]
    pub fn derivative(self, z: &Array2<f64>, activated: &Array2<f64>) -> Array2<f64> {
        match self {
            Self::Tanh => activated.mapv(|a| 1.0 - a * a),
            Self::Relu => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
        }
    }
}

/// One dense layer in the configured topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerConfig {
    /// Output width.
    pub units: usize,
    /// Activation after the affine transform.
    pub activation: Activation,
}

impl LayerConfig {
    /// Creates a layer description.
    #[must_use]
    pub const fn new(units: usize, activation: Activation) -> Self {
        Self { units, activation }
    }
}

/// Fully connected layer: `activation(input . weights + biases)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub(crate) weights: Array2<f64>,
    pub(crate) biases: Array1<f64>,
    pub(crate) activation: Activation,
}

impl DenseLayer {
    /// Glorot-uniform weights and zero biases.
    pub fn glorot(inputs: usize, config: LayerConfig, rng: &mut SmallRng) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let limit = (6.0 / (inputs + config.units) as f64).sqrt();
        let weights = Array2::from_shape_fn((inputs, config.units), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            biases: Array1::zeros(config.units),
            activation: config.activation,
        }
    }

    /// Builds a layer from trained parameters.
    pub fn from_parts(
        weights: Array2<f64>,
        biases: Array1<f64>,
        activation: Activation,
    ) -> Result<Self, ModelError> {
        let layer = Self {
            weights,
            biases,
            activation,
        };
        layer.check()?;
        Ok(layer)
    }

    /// Input width.
    #[must_use]
    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    /// Output width.
    #[must_use]
    pub fn units(&self) -> usize {
        self.weights.ncols()
    }

    /// Activation function.
    #[must_use]
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    /// Topology entry for this layer.
    #[must_use]
    pub fn config(&self) -> LayerConfig {
        LayerConfig::new(self.units(), self.activation)
    }

    /// Returns `(pre_activation, activation)` for a batch of rows.
    pub(crate) fn forward(&self, input: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let z = input.dot(&self.weights) + &self.biases;
        let activated = self.activation.apply(&z);
        (z, activated)
    }

    pub(crate) fn check(&self) -> Result<(), ModelError> {
        if self.biases.len() != self.units() {
            return Err(ModelError::Shape(format!(
                "layer has {} weight columns but {} biases",
                self.units(),
                self.biases.len()
            )));
        }
        if self.weights.iter().chain(self.biases.iter()).any(|v| !v.is_finite()) {
            return Err(ModelError::Shape("layer parameters must be finite".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn relu_and_tanh_derivatives() {
        let z = array![[-1.0, 0.0, 2.0]];
        let relu = Activation::Relu.apply(&z);
        assert_eq!(relu, array![[0.0, 0.0, 2.0]]);
        assert_eq!(Activation::Relu.derivative(&z, &relu), array![[0.0, 0.0, 1.0]]);

        let tanh = Activation::Tanh.apply(&z);
        let slope = Activation::Tanh.derivative(&z, &tanh);
        assert!((slope[[0, 1]] - 1.0).abs() < 1e-12);
        assert!(slope[[0, 2]] < 0.1);
    }

    #[test]
    fn glorot_weights_stay_within_limit() {
        let mut rng = SmallRng::seed_from_u64(7);
        let layer = DenseLayer::glorot(18, LayerConfig::new(14, Activation::Tanh), &mut rng);
        let limit = (6.0_f64 / 32.0).sqrt();
        assert_eq!((layer.inputs(), layer.units()), (18, 14));
        assert!(layer.weights.iter().all(|w| w.abs() <= limit));
        assert!(layer.biases.iter().all(|b| *b == 0.0));
    }

    #[test]
    fn mismatched_bias_length_is_rejected() {
        let err = DenseLayer::from_parts(Array2::zeros((3, 2)), Array1::zeros(3), Activation::Relu)
            .unwrap_err();
        assert!(matches!(err, ModelError::Shape(_)));
    }

    #[test]
    fn activation_names_are_lowercase() {
        let layer: LayerConfig = serde_json::from_str(r#"{"units":7,"activation":"relu"}"#).unwrap();
        assert_eq!(layer, LayerConfig::new(7, Activation::Relu));
    }
}
