use crate::math::matrix::Matrix;

/// A named trainable tensor together with its accumulated gradient.
///
/// Names are slash-separated scopes (`decoder/w_out`, `cnn/top/weights`) and
/// double as checkpoint keys, so they must be unique within a model.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub value: Matrix,
    pub grad: Matrix,
    /// Frozen params never receive gradients and are skipped by optimizers.
    pub trainable: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Matrix, trainable: bool) -> Param {
        let grad = Matrix::zeros(value.rows, value.cols);
        Param { name: name.into(), value, grad, trainable }
    }

    pub fn accumulate(&mut self, grad: &Matrix) {
        if self.trainable {
            self.grad.add_assign(grad);
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = Matrix::zeros(self.value.rows, self.value.cols);
    }
}

/// Anything that owns [`Param`]s: layers, extractors, decoders.
pub trait Parameters {
    fn params(&self) -> Vec<&Param>;
    fn params_mut(&mut self) -> Vec<&mut Param>;
}
