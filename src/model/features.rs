use crate::error::{CaptionError, CaptionResult};
use crate::math::matrix::Matrix;
use crate::model::extractor::FeatureExtractor;
use crate::model::input_plan::ImageSlot;
use crate::model::phase::Phase;

/// Repeats every feature row once per caption, caption-major: row `r` of
/// the result is `features[r % b]`, so `b * k` rows in total.
pub fn expand_features(features: &Matrix, k: usize) -> Matrix {
    let mut data = Vec::with_capacity(features.rows * k);
    for _ in 0..k {
        data.extend(features.data.iter().cloned());
    }
    Matrix { rows: features.rows * k, cols: features.cols, data }
}

/// Adjoint of [`expand_features`]: sums the gradients of the `k` copies of
/// each original row.
pub fn collapse_gradients(d_expanded: &Matrix, b: usize) -> Matrix {
    let mut out = Matrix::zeros(b, d_expanded.cols);
    for (r, row) in d_expanded.data.iter().enumerate() {
        for (acc, g) in out.data[r % b].iter_mut().zip(row.iter()) {
            *acc += g;
        }
    }
    out
}

/// Produces the per-row features the embedding projection consumes.
///
/// With precomputed features the image slot already holds them and the
/// extractor is left untouched; with raw images the extractor runs once per
/// image and its output is tiled afterwards, so extraction is never repeated
/// per caption.
#[derive(Debug, Clone, Copy)]
pub struct FeaturePipeline {
    image: ImageSlot,
    captions_per_image: usize,
}

impl FeaturePipeline {
    pub fn new(image: ImageSlot, captions_per_image: usize) -> FeaturePipeline {
        FeaturePipeline { image, captions_per_image: captions_per_image.max(1) }
    }

    pub fn feeds_extractor(&self) -> bool {
        matches!(self.image, ImageSlot::RawImage { .. })
    }

    pub fn captions_per_image(&self) -> usize {
        self.captions_per_image
    }

    pub fn features(
        &self,
        extractor: &mut dyn FeatureExtractor,
        images: &Matrix,
        phase: Phase,
    ) -> CaptionResult<Matrix> {
        let features = match self.image {
            ImageSlot::RawImage { .. } => extractor.forward(images, phase)?,
            ImageSlot::PrecomputedFeature { .. } => images.clone(),
        };
        if features.cols != extractor.feature_size() {
            return Err(CaptionError::Shape {
                slot: "image features",
                expected: extractor.feature_size().to_string(),
                actual: features.cols.to_string(),
            });
        }
        Ok(features)
    }

    pub fn expand(&self, features: &Matrix) -> Matrix {
        if self.captions_per_image > 1 {
            expand_features(features, self.captions_per_image)
        } else {
            features.clone()
        }
    }

    pub fn collapse(&self, d_features: &Matrix, b: usize) -> Matrix {
        if self.captions_per_image > 1 {
            collapse_gradients(d_features, b)
        } else {
            d_features.clone()
        }
    }
}
