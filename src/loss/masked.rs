use crate::data::dictionary::PAD;
use crate::error::{CaptionError, CaptionResult};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::math::matrix::Matrix;

/// Reconstruction loss of one batch plus its gradient w.r.t. the logits.
#[derive(Debug, Clone)]
pub struct MaskedLoss {
    pub value: f64,
    pub d_logits: Matrix,
}

/// Masked token-level cross-entropy over a flattened caption batch.
///
/// Labels are the encoder-target captions flattened row-major, so row
/// `b * T + t` of the logits is scored against `labels[b * T + t]`.
/// The batch loss is `sum(ce ⊙ mask) / sum(mask)` with `mask = sign(label)`.
pub struct MaskedSequenceLoss;

impl MaskedSequenceLoss {
    pub fn flatten(targets: &[Vec<usize>]) -> Vec<usize> {
        targets.iter().flatten().copied().collect()
    }

    pub fn mask(labels: &[usize]) -> Vec<f64> {
        labels.iter().map(|&l| if l == PAD { 0.0 } else { 1.0 }).collect()
    }

    pub fn per_token(logits: &Matrix, labels: &[usize]) -> CaptionResult<Vec<f64>> {
        Self::check(logits, labels)?;
        Ok(labels.iter().enumerate()
            .map(|(i, &label)| CrossEntropyLoss::loss(logits.row(i), label))
            .collect())
    }

    /// Reduces per-token losses with the padding mask.
    ///
    /// A mask summing to zero means the batch held no real tokens; that is a
    /// batch construction fault and is reported rather than turned into NaN.
    pub fn reduce(per_token: &[f64], mask: &[f64]) -> CaptionResult<f64> {
        let denom: f64 = mask.iter().sum();
        if denom == 0.0 {
            return Err(CaptionError::config(
                "batch contains only padding tokens; masked loss is undefined",
            ));
        }
        let num: f64 = per_token.iter().zip(mask.iter()).map(|(l, m)| l * m).sum();
        Ok(num / denom)
    }

    pub fn compute(logits: &Matrix, labels: &[usize]) -> CaptionResult<MaskedLoss> {
        let per_token = Self::per_token(logits, labels)?;
        let mask = Self::mask(labels);
        let value = Self::reduce(&per_token, &mask)?;
        let denom: f64 = mask.iter().sum();

        let mut d_logits = Matrix::zeros(logits.rows, logits.cols);
        for (i, &label) in labels.iter().enumerate() {
            if mask[i] == 0.0 {
                continue;
            }
            d_logits.data[i] = CrossEntropyLoss::derivative(logits.row(i), label)
                .into_iter()
                .map(|g| g / denom)
                .collect();
        }

        Ok(MaskedLoss { value, d_logits })
    }

    fn check(logits: &Matrix, labels: &[usize]) -> CaptionResult<()> {
        if logits.rows != labels.len() {
            return Err(CaptionError::Shape {
                slot: "logits",
                expected: format!("{} rows", labels.len()),
                actual: format!("{} rows", logits.rows),
            });
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= logits.cols) {
            return Err(CaptionError::config(format!(
                "label {bad} outside vocabulary of size {}",
                logits.cols
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_example_scenario() {
        let labels = MaskedSequenceLoss::flatten(&[vec![5, 7, 0], vec![3, 0, 0]]);
        let mask = MaskedSequenceLoss::mask(&labels);
        assert_eq!(mask, vec![1.0, 1.0, 0.0, 1.0, 0.0, 0.0]);

        let ce = [0.2, 0.4, 0.9, 0.5, 0.3, 0.1];
        let loss = MaskedSequenceLoss::reduce(&ce, &mask).unwrap();
        assert!((loss - 1.1 / 3.0).abs() < 1e-12);
        assert!((loss - 0.3667).abs() < 1e-4);
    }

    #[test]
    fn fully_padded_batch_is_a_configuration_error() {
        let labels = vec![0, 0, 0];
        let logits = Matrix::zeros(3, 4);
        let err = MaskedSequenceLoss::compute(&logits, &labels).unwrap_err();
        assert!(matches!(err, CaptionError::Configuration(_)));
    }

    #[test]
    fn loss_is_non_negative_and_zero_for_confident_hits() {
        let labels = vec![1, 2, 0];
        let logits = Matrix::from_data(vec![
            vec![-1e3, 1e3, -1e3],
            vec![-1e3, -1e3, 1e3],
            vec![0.0, 0.0, 0.0],
        ]);
        let loss = MaskedSequenceLoss::compute(&logits, &labels).unwrap();
        assert!(loss.value >= 0.0);
        assert!(loss.value < 1e-12);

        let random = Matrix::from_data(vec![vec![0.3, -0.1, 0.2]; 3]);
        assert!(MaskedSequenceLoss::compute(&random, &labels).unwrap().value > 0.0);
    }

    #[test]
    fn padded_rows_get_no_gradient() {
        let labels = vec![1, 0];
        let logits = Matrix::from_data(vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        let loss = MaskedSequenceLoss::compute(&logits, &labels).unwrap();
        assert_eq!(loss.d_logits.data[1], vec![0.0, 0.0]);
        assert!(loss.d_logits.data[0][1] < 0.0);
    }

    #[test]
    fn out_of_vocab_label_rejected() {
        let logits = Matrix::zeros(1, 2);
        assert!(MaskedSequenceLoss::compute(&logits, &[5]).is_err());
    }
}
