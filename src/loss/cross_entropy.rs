/// Sparse softmax cross-entropy over one row of logits.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Numerically stable softmax of a logit row.
    pub fn softmax(logits: &[f64]) -> Vec<f64> {
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|&z| (z - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / sum).collect()
    }

    /// L = logsumexp(z) - z[label]
    pub fn loss(logits: &[f64], label: usize) -> f64 {
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + logits.iter().map(|&z| (z - max).exp()).sum::<f64>().ln();
        lse - logits[label]
    }

    /// ∂L/∂z_i = softmax(z)_i - 1[i == label]
    pub fn derivative(logits: &[f64], label: usize) -> Vec<f64> {
        let mut grad = CrossEntropyLoss::softmax(logits);
        grad[label] -= 1.0;
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let loss = CrossEntropyLoss::loss(&[0.0; 4], 2);
        assert!((loss - 4.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn gradient_sums_to_zero() {
        let grad = CrossEntropyLoss::derivative(&[1.0, -2.0, 0.5], 0);
        assert!(grad.iter().sum::<f64>().abs() < 1e-12);
        assert!(grad[0] < 0.0);
    }
}
