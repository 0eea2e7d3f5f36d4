use serde::{Deserialize, Serialize};

use crate::error::{CaptionError, CaptionResult};
use crate::layers::param::Param;
use crate::optim::{adam::Adam, sgd::Sgd};

/// Per-parameter update rule; gradients are already accumulated in
/// `param.grad`.
pub trait UpdateRule {
    fn step(&mut self, param: &mut Param);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f64) -> Box<dyn UpdateRule> {
        match self {
            OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate)),
            OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
        }
    }
}

/// L2 norm over the gradients of every trainable param in the group.
pub fn global_norm(params: &[&mut Param]) -> f64 {
    params.iter()
        .filter(|p| p.trainable)
        .map(|p| p.grad.sum_squares())
        .sum::<f64>()
        .sqrt()
}

/// One parameter group's update rule with optional global-norm clipping and
/// a count of the updates it has applied.
pub struct UpdateOp {
    rule: Box<dyn UpdateRule>,
    max_grad_norm: Option<f64>,
    updates: u64,
}

impl UpdateOp {
    pub fn new(rule: Box<dyn UpdateRule>, max_grad_norm: Option<f64>) -> UpdateOp {
        UpdateOp { rule, max_grad_norm, updates: 0 }
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Clips, applies and clears the gradients of `params`. Returns the
    /// global gradient norm measured before clipping. A non-finite norm is
    /// refused before any parameter changes.
    pub fn apply(&mut self, mut params: Vec<&mut Param>) -> CaptionResult<f64> {
        let norm = finite_norm(&params)?;
        let clip = match self.max_grad_norm {
            Some(max) if norm > max && norm > 0.0 => max / norm,
            _ => 1.0,
        };

        for param in params.iter_mut().filter(|p| p.trainable) {
            if clip != 1.0 {
                param.grad = param.grad.scale(clip);
            }
            self.rule.step(param);
            param.zero_grad();
        }

        self.updates += 1;
        Ok(norm)
    }
}

fn finite_norm(params: &[&mut Param]) -> CaptionResult<f64> {
    let norm = global_norm(params);
    if !norm.is_finite() {
        return Err(CaptionError::Computation(format!("non-finite gradient norm {norm}")));
    }
    Ok(norm)
}

/// Gradient norms observed during one joint update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateReport {
    pub primary_norm: f64,
    pub secondary_norm: Option<f64>,
}

/// The two parameter groups updated jointly on every training step.
///
/// `primary` (decoder and projections) always runs and its update count is
/// the global step. `secondary` (feature extractor) exists only when the
/// extractor is fine-tuned in a training run.
pub struct UpdatePair {
    pub primary: UpdateOp,
    pub secondary: Option<UpdateOp>,
}

impl UpdatePair {
    pub fn global_step(&self) -> u64 {
        self.primary.updates
    }

    /// Continues counting from a restored global step.
    pub fn resume_from(&mut self, global_step: u64) {
        self.primary.updates = global_step;
    }

    /// Updates both groups, or neither when either gradient norm is
    /// non-finite.
    pub fn apply(&mut self, primary: Vec<&mut Param>, secondary: Vec<&mut Param>) -> CaptionResult<UpdateReport> {
        if self.secondary.is_some() {
            finite_norm(&secondary)?;
        }
        let primary_norm = self.primary.apply(primary)?;
        let secondary_norm = match self.secondary.as_mut() {
            Some(op) => Some(op.apply(secondary)?),
            None => None,
        };
        Ok(UpdateReport { primary_norm, secondary_norm })
    }
}
