use std::collections::HashMap;

use crate::layers::param::Param;
use crate::math::matrix::Matrix;
use crate::optim::update::UpdateRule;

/// Adam (Kingma & Ba, 2015) with per-parameter moment estimates keyed by
/// parameter name.
pub struct Adam {
    pub learning_rate: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
    moments: HashMap<String, Moments>,
}

struct Moments {
    m: Matrix,
    v: Matrix,
    t: i32,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Adam {
        Adam {
            learning_rate,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
            moments: HashMap::new(),
        }
    }
}

impl UpdateRule for Adam {
    fn step(&mut self, param: &mut Param) {
        let (b1, b2) = (self.beta_1, self.beta_2);
        let state = self.moments.entry(param.name.clone()).or_insert_with(|| Moments {
            m: Matrix::zeros(param.value.rows, param.value.cols),
            v: Matrix::zeros(param.value.rows, param.value.cols),
            t: 0,
        });

        state.t += 1;
        state.m = state.m.zip_map(&param.grad, |m, g| b1 * m + (1.0 - b1) * g);
        state.v = state.v.zip_map(&param.grad, |v, g| b2 * v + (1.0 - b2) * g * g);

        let m_hat_scale = 1.0 / (1.0 - b1.powi(state.t));
        let v_hat_scale = 1.0 / (1.0 - b2.powi(state.t));
        let (lr, eps) = (self.learning_rate, self.epsilon);
        let delta = state.m.zip_map(&state.v, |m, v| {
            lr * (m * m_hat_scale) / ((v * v_hat_scale).sqrt() + eps)
        });
        param.value = param.value.clone() - delta;
    }
}
