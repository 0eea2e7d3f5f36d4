use crate::math::matrix::Matrix;

/// One caption in teacher-forcing form.
///
/// `decoder_input` is `[BOS, w1 .. wn]`, `target` is `[w1 .. wn, EOS]`; both
/// have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionPair {
    pub decoder_input: Vec<usize>,
    pub target: Vec<usize>,
    pub cluster_vector: Option<Vec<f64>>,
}

/// One training unit as produced by a [`BatchSource`](crate::data::BatchSource).
///
/// `images` holds one row per image: either flattened `side×side×3` pixels
/// (HWC order) or a precomputed feature vector, depending on the run's
/// input plan. `captions[i]` are the captions drawn for image `i`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub image_ids: Vec<String>,
    pub images: Matrix,
    pub captions: Vec<Vec<CaptionPair>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.rows
    }

    pub fn is_empty(&self) -> bool {
        self.images.rows == 0
    }
}
