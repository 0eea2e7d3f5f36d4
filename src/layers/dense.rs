use rand::Rng;

use crate::{math::matrix::Matrix, activation::activation::ActivationFunction};
use crate::layers::param::{Param, Parameters};

#[derive(Debug)]
pub struct Layer{
    pub size: usize,
    pub weights: Param,
    pub biases: Param,
    pub activator: ActivationFunction,
    inputs: Option<Matrix>,
    pre_neurons: Option<Matrix>,  // pre-activation values (z = xW + b) needed for correct derivative
}

impl Layer {
    /// Builds a `input_size → size` layer named `scope/weights`, `scope/biases`.
    pub fn new<R: Rng>(
        scope: &str,
        size: usize,
        input_size: usize,
        activation: ActivationFunction,
        trainable: bool,
        rng: &mut R,
    ) -> Layer {
        let weights = match activation {
            ActivationFunction::ReLU => Matrix::he(input_size, size, rng),
            _ => Matrix::xavier(input_size, size, rng),
        };

        Layer {
            size,
            weights: Param::new(format!("{scope}/weights"), weights, trainable),
            biases: Param::new(format!("{scope}/biases"), Matrix::zeros(1, size), trainable),
            activator: activation,
            inputs: None,
            pre_neurons: None,
        }
    }

    /// Batched forward pass `[b, in] → [b, size]`; caches what backprop needs.
    pub fn feed_from(&mut self, input: &Matrix) -> Matrix {
        let z = (input * &self.weights.value).add_row(&self.biases.value);
        let a = z.map(|x| self.activator.function(x));
        self.inputs = Some(input.clone());
        self.pre_neurons = Some(z);
        a
    }

    /// Accumulates weight/bias gradients from `delta` (∂L/∂a for this layer,
    /// shape `[b, size]`) and returns ∂L/∂input.
    pub fn backward(&mut self, delta: &Matrix) -> Matrix {
        let (inputs, z) = match (&self.inputs, &self.pre_neurons) {
            (Some(inputs), Some(z)) => (inputs, z),
            _ => panic!("Layer::backward called before feed_from"),
        };
        // δ = error ⊙ σ'(z)
        let layer_delta = delta.hadamard(&z.map(|x| self.activator.derivative(x)));

        let weights_grad = &inputs.transpose() * &layer_delta;
        let biases_grad = layer_delta.sum_rows();
        let input_delta = &layer_delta * &self.weights.value.transpose();

        self.weights.accumulate(&weights_grad);
        self.biases.accumulate(&biases_grad);
        input_delta
    }
}

impl Parameters for Layer {
    fn params(&self) -> Vec<&Param> {
        vec![&self.weights, &self.biases]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.biases]
    }
}
