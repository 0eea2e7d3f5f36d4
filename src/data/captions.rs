use crate::data::batch::CaptionPair;
use crate::data::dictionary::PAD;
use crate::error::{CaptionError, CaptionResult};
use crate::math::matrix::Matrix;

/// Padded caption tensors for one (possibly expanded) batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionTensors {
    /// Targets the loss scores against, `[rows, T]`.
    pub encoder_targets: Vec<Vec<usize>>,
    /// Teacher-forcing inputs fed to the decoder, `[rows, T]`.
    pub decoder_inputs: Vec<Vec<usize>>,
    pub lengths: Vec<usize>,
    pub cluster_vectors: Option<Matrix>,
}

impl CaptionTensors {
    pub fn rows(&self) -> usize {
        self.lengths.len()
    }

    pub fn timesteps(&self) -> usize {
        self.decoder_inputs.first().map_or(0, Vec::len)
    }
}

/// Flattens per-image caption groups into padded tensors.
///
/// Rows are caption-major: caption `j` of image `i` lands at row `j * b + i`,
/// matching the layout of [`expand_features`](crate::model::features::expand_features).
/// Only the first `k` captions of each group are used.
pub fn prepare_captions(
    groups: &[Vec<CaptionPair>],
    k: usize,
    use_cluster_vectors: bool,
) -> CaptionResult<CaptionTensors> {
    if let Some((i, g)) = groups.iter().enumerate().find(|(_, g)| g.len() < k) {
        return Err(CaptionError::config(format!(
            "image {i} has {} captions, {k} required per image",
            g.len()
        )));
    }

    let b = groups.len();
    let ordered: Vec<&CaptionPair> = (0..k)
        .flat_map(|j| groups.iter().map(move |g| &g[j]))
        .collect();
    debug_assert_eq!(ordered.len(), b * k);

    let max_len = ordered.iter().map(|c| c.decoder_input.len()).max().unwrap_or(0);
    let pad = |seq: &[usize]| {
        let mut row = seq.to_vec();
        row.resize(max_len, PAD);
        row
    };

    let cluster_vectors = if use_cluster_vectors {
        let rows = ordered
            .iter()
            .enumerate()
            .map(|(r, c)| {
                c.cluster_vector.clone().ok_or_else(|| {
                    CaptionError::config(format!("caption row {r} has no cluster vector"))
                })
            })
            .collect::<CaptionResult<Vec<_>>>()?;
        Some(Matrix::from_data(rows))
    } else {
        None
    };

    Ok(CaptionTensors {
        encoder_targets: ordered.iter().map(|c| pad(&c.target)).collect(),
        decoder_inputs: ordered.iter().map(|c| pad(&c.decoder_input)).collect(),
        lengths: ordered.iter().map(|c| c.decoder_input.len()).collect(),
        cluster_vectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(tokens: &[usize]) -> CaptionPair {
        let mut decoder_input = vec![1];
        decoder_input.extend(tokens);
        let mut target = tokens.to_vec();
        target.push(2);
        CaptionPair { decoder_input, target, cluster_vector: Some(vec![tokens[0] as f64]) }
    }

    #[test]
    fn caption_major_layout_and_padding() {
        let groups = vec![
            vec![pair(&[10]), pair(&[11, 12])],
            vec![pair(&[20, 21, 22]), pair(&[23])],
        ];
        let t = prepare_captions(&groups, 2, true).unwrap();
        assert_eq!(t.rows(), 4);
        assert_eq!(t.timesteps(), 4);
        // rows: (img0,c0) (img1,c0) (img0,c1) (img1,c1)
        assert_eq!(t.lengths, vec![2, 4, 3, 2]);
        assert_eq!(t.encoder_targets[0], vec![10, 2, 0, 0]);
        assert_eq!(t.decoder_inputs[2], vec![1, 11, 12, 0]);
        let cv = t.cluster_vectors.unwrap();
        assert_eq!(cv.data, vec![vec![10.0], vec![20.0], vec![11.0], vec![23.0]]);
    }

    #[test]
    fn short_group_is_rejected() {
        let groups = vec![vec![pair(&[4])], vec![pair(&[5]), pair(&[6])]];
        assert!(prepare_captions(&groups, 2, false).is_err());
    }

    #[test]
    fn missing_cluster_vector_is_rejected() {
        let mut p = pair(&[4]);
        p.cluster_vector = None;
        assert!(prepare_captions(&[vec![p]], 1, true).is_err());
        assert!(prepare_captions(&[vec![pair(&[4])]], 1, false).unwrap().cluster_vectors.is_none());
    }
}
