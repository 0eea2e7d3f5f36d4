use crate::layers::param::Param;
use crate::optim::update::UpdateRule;

pub struct Sgd {
    pub learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Sgd {
        Sgd { learning_rate }
    }
}

impl UpdateRule for Sgd {
    /// θ ← θ - lr · g
    fn step(&mut self, param: &mut Param) {
        let lr = self.learning_rate;
        param.value = param.value.zip_map(&param.grad, |w, g| w - lr * g);
    }
}
