use ndarray::{Array1, Array2};

use super::layer::DenseLayer;
use crate::config::ModelConfig;

/// Per-layer parameter gradients.
#[derive(Debug, Clone)]
pub struct Gradient {
    /// dL/dW.
    pub weights: Array2<f64>,
    /// dL/db.
    pub biases: Array1<f64>,
}

#[derive(Debug, Clone)]
struct Moments {
    weights_m: Array2<f64>,
    weights_v: Array2<f64>,
    biases_m: Array1<f64>,
    biases_v: Array1<f64>,
}

/// Adam with bias-corrected step size.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    moments: Vec<Moments>,
}

impl Adam {
    /// Zeroed moment estimates shaped like `layers`.
    #[must_use]
    pub fn new(config: &ModelConfig, layers: &[DenseLayer]) -> Self {
        let moments = layers
            .iter()
            .map(|layer| Moments {
                weights_m: Array2::zeros(layer.weights.raw_dim()),
                weights_v: Array2::zeros(layer.weights.raw_dim()),
                biases_m: Array1::zeros(layer.biases.len()),
                biases_v: Array1::zeros(layer.biases.len()),
            })
            .collect();
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            step: 0,
            moments,
        }
    }

    /// Applies one update; `gradients` is indexed like `layers`.
    pub fn step(&mut self, layers: &mut [DenseLayer], gradients: &[Gradient]) {
        self.step = self.step.saturating_add(1);
        let corrected = self.learning_rate * (1.0 - self.beta2.powi(self.step)).sqrt()
            / (1.0 - self.beta1.powi(self.step));
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for ((layer, gradient), moments) in layers.iter_mut().zip(gradients).zip(&mut self.moments) {
            moments.weights_m = &moments.weights_m * beta1 + &gradient.weights * (1.0 - beta1);
            moments.weights_v =
                &moments.weights_v * beta2 + &gradient.weights.mapv(|g| g * g) * (1.0 - beta2);
            layer.weights = &layer.weights
                - &(&moments.weights_m * corrected / moments.weights_v.mapv(|v| v.sqrt() + epsilon));

            moments.biases_m = &moments.biases_m * beta1 + &gradient.biases * (1.0 - beta1);
            moments.biases_v =
                &moments.biases_v * beta2 + &gradient.biases.mapv(|g| g * g) * (1.0 - beta2);
            layer.biases = &layer.biases
                - &(&moments.biases_m * corrected / moments.biases_v.mapv(|v| v.sqrt() + epsilon));
        }
    }

    /// Updates applied so far.
    #[must_use]
    pub const fn steps(&self) -> i32 {
        self.step
    }
}
