use crate::error::{CaptionError, CaptionResult};
use crate::math::matrix::Matrix;
use crate::train::train_config::TrainingConfiguration;

/// Which image representation a run is fed. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    /// `[batch, side, side, channels]` pixels, flattened HWC per row.
    RawImage { side: usize, channels: usize },
    /// `[batch, width]` features computed ahead of time by a frozen extractor.
    PrecomputedFeature { width: usize },
}

impl ImageSlot {
    pub fn width(&self) -> usize {
        match *self {
            ImageSlot::RawImage { side, channels } => side * side * channels,
            ImageSlot::PrecomputedFeature { width } => width,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSlot {
    WithClusterVectors { width: usize },
    Without,
}

/// Cluster-vector input after binding. Runs without cluster vectors get a
/// `[rows, 0]` placeholder so every step sees the same shape of input.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterInput {
    Live(Matrix),
    Placeholder(Matrix),
}

impl ClusterInput {
    pub fn live(&self) -> Option<&Matrix> {
        match self {
            ClusterInput::Live(m) => Some(m),
            ClusterInput::Placeholder(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundInputs {
    pub images: Matrix,
    pub cluster: ClusterInput,
}

/// Resolved input slots of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPlan {
    pub image: ImageSlot,
    pub cluster: ClusterSlot,
}

impl InputPlan {
    pub fn resolve(config: &TrainingConfiguration) -> InputPlan {
        let image = if config.fine_tune {
            ImageSlot::RawImage { side: config.image_size, channels: 3 }
        } else {
            ImageSlot::PrecomputedFeature { width: config.cnn_feature_size }
        };
        let cluster = if config.use_cluster_vectors || config.prior.needs_cluster_vectors() {
            ClusterSlot::WithClusterVectors { width: config.cluster_vector_size }
        } else {
            ClusterSlot::Without
        };
        InputPlan { image, cluster }
    }

    pub fn raw_images(&self) -> bool {
        matches!(self.image, ImageSlot::RawImage { .. })
    }

    pub fn uses_cluster_vectors(&self) -> bool {
        matches!(self.cluster, ClusterSlot::WithClusterVectors { .. })
    }

    /// Checks a batch against the declared slots. `caption_rows` is the row
    /// count of the caption tensors the cluster input must line up with.
    pub fn bind(
        &self,
        images: &Matrix,
        cluster: Option<&Matrix>,
        caption_rows: usize,
    ) -> CaptionResult<BoundInputs> {
        let width = self.image.width();
        if images.rows > 0 && images.cols != width {
            return Err(CaptionError::Shape {
                slot: "image",
                expected: format!("[batch, {width}]"),
                actual: format!("[{}, {}]", images.rows, images.cols),
            });
        }
        if let Some((r, len)) = ragged_row(images, width) {
            return Err(CaptionError::Shape {
                slot: "image",
                expected: format!("{width} values per row"),
                actual: format!("row {r} has {len}"),
            });
        }

        let cluster = match (self.cluster, cluster) {
            (ClusterSlot::WithClusterVectors { width }, Some(cv)) => {
                if cv.shape() != (caption_rows, width) {
                    return Err(CaptionError::Shape {
                        slot: "cluster vectors",
                        expected: format!("[{caption_rows}, {width}]"),
                        actual: format!("[{}, {}]", cv.rows, cv.cols),
                    });
                }
                if let Some((r, len)) = ragged_row(cv, width) {
                    return Err(CaptionError::Shape {
                        slot: "cluster vectors",
                        expected: format!("{width} values per row"),
                        actual: format!("row {r} has {len}"),
                    });
                }
                ClusterInput::Live(cv.clone())
            }
            (ClusterSlot::WithClusterVectors { .. }, None) => {
                return Err(CaptionError::config("run expects cluster vectors but batch has none"));
            }
            (ClusterSlot::Without, _) => ClusterInput::Placeholder(Matrix::zeros(caption_rows, 0)),
        };

        Ok(BoundInputs { images: images.clone(), cluster })
    }
}

/// First row whose length differs from `width`. `Matrix::from_data` takes
/// its column count from row 0 only, so externally built rows can be ragged.
fn ragged_row(m: &Matrix, width: usize) -> Option<(usize, usize)> {
    m.data
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != width)
        .map(|(r, row)| (r, row.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::train_config::PriorFamily;

    #[test]
    fn plan_follows_configuration() {
        let cfg = TrainingConfiguration { fine_tune: true, ..Default::default() };
        let plan = InputPlan::resolve(&cfg);
        assert_eq!(plan.image, ImageSlot::RawImage { side: 224, channels: 3 });
        assert_eq!(plan.image.width(), 224 * 224 * 3);
        assert_eq!(plan.cluster, ClusterSlot::Without);

        let cfg = TrainingConfiguration { prior: PriorFamily::Gmm, ..Default::default() };
        let plan = InputPlan::resolve(&cfg);
        assert_eq!(plan.image, ImageSlot::PrecomputedFeature { width: 4096 });
        assert_eq!(plan.cluster, ClusterSlot::WithClusterVectors { width: 90 });
    }

    #[test]
    fn bind_rejects_wrong_image_width() {
        let plan = InputPlan {
            image: ImageSlot::PrecomputedFeature { width: 4 },
            cluster: ClusterSlot::Without,
        };
        let err = plan.bind(&Matrix::zeros(2, 3), None, 2).unwrap_err();
        assert!(matches!(err, CaptionError::Shape { slot: "image", .. }));
    }

    #[test]
    fn placeholder_has_matching_rank() {
        let plan = InputPlan {
            image: ImageSlot::PrecomputedFeature { width: 4 },
            cluster: ClusterSlot::Without,
        };
        let bound = plan.bind(&Matrix::zeros(2, 4), None, 6).unwrap();
        assert_eq!(bound.cluster, ClusterInput::Placeholder(Matrix::zeros(6, 0)));
        assert!(bound.cluster.live().is_none());
    }

    #[test]
    fn live_cluster_vectors_checked() {
        let plan = InputPlan {
            image: ImageSlot::PrecomputedFeature { width: 1 },
            cluster: ClusterSlot::WithClusterVectors { width: 2 },
        };
        let images = Matrix::zeros(1, 1);
        assert!(plan.bind(&images, None, 1).is_err());
        assert!(plan.bind(&images, Some(&Matrix::zeros(1, 3)), 1).is_err());
        let bound = plan.bind(&images, Some(&Matrix::zeros(1, 2)), 1).unwrap();
        assert!(bound.cluster.live().is_some());
    }

    #[test]
    fn ragged_rows_are_shape_errors() {
        let plan = InputPlan {
            image: ImageSlot::PrecomputedFeature { width: 2 },
            cluster: ClusterSlot::WithClusterVectors { width: 3 },
        };
        let images = Matrix::zeros(2, 2);
        let ragged_cv = Matrix::from_data(vec![vec![0.1, 0.2, 0.3], vec![0.1, 0.2, 0.3, 0.4]]);
        let err = plan.bind(&images, Some(&ragged_cv), 2).unwrap_err();
        assert!(matches!(err, CaptionError::Shape { slot: "cluster vectors", .. }));

        let ragged_images = Matrix::from_data(vec![vec![1.0, 2.0], vec![3.0]]);
        let cv = Matrix::zeros(2, 3);
        let err = plan.bind(&ragged_images, Some(&cv), 2).unwrap_err();
        assert!(matches!(err, CaptionError::Shape { slot: "image", .. }));
    }
}
