use std::collections::BTreeMap;
use std::path::Path;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::activation::activation::ActivationFunction;
use crate::error::{CaptionError, CaptionResult};
use crate::layers::dense::Layer;
use crate::layers::param::{Param, Parameters};
use crate::math::matrix::Matrix;
use crate::model::phase::Phase;
use crate::train::train_config::TrainingConfiguration;

/// Image feature extractor contract.
///
/// `forward` returns the named embedding layer's output, one row per image.
/// `backward` receives ∂L/∂features and accumulates gradients into the
/// extractor's trainable params.
pub trait FeatureExtractor: Parameters {
    fn input_size(&self) -> usize;

    fn feature_size(&self) -> usize;

    fn forward(&mut self, images: &Matrix, phase: Phase) -> CaptionResult<Matrix>;

    fn backward(&mut self, d_features: &Matrix) -> CaptionResult<()>;

    /// One-time pretrained initialization from a weight archive.
    fn load_weights(&mut self, path: &Path) -> CaptionResult<()>;

    /// Extra loss terms (e.g. weight decay) added to the total loss.
    fn regularization_loss(&self) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorConfig {
    pub image_side: usize,
    pub pool_grid: usize,
    pub hidden_size: usize,
    pub feature_size: usize,
    pub train_feature_layers: bool,
    pub train_top_layers: bool,
    /// Keep probability; `None` disables dropout.
    pub dropout_keep: Option<f64>,
    /// L2 coefficient; `None` disables weight decay.
    pub weight_decay: Option<f64>,
}

impl ExtractorConfig {
    /// Dropout and weight decay only apply while the extractor is trained.
    pub fn from_training(config: &TrainingConfiguration) -> ExtractorConfig {
        let training = config.trains_extractor();
        ExtractorConfig {
            image_side: config.image_size,
            pool_grid: config.pool_grid,
            hidden_size: config.cnn_hidden_size,
            feature_size: config.cnn_feature_size,
            train_feature_layers: training && config.fine_tune_fe,
            train_top_layers: training && config.fine_tune_top,
            dropout_keep: training.then_some(config.cnn_dropout),
            weight_decay: training.then_some(config.weight_decay),
        }
    }

    /// Both layer groups trainable.
    pub fn fully_trainable(&self) -> bool {
        self.train_feature_layers && self.train_top_layers
    }
}

/// Average-pools the image to a `grid × grid × 3` map, then applies a ReLU
/// feature layer and a ReLU top layer whose output is the embedding.
pub struct PooledExtractor {
    config: ExtractorConfig,
    features: Layer,
    top: Layer,
    rng: StdRng,
    dropout_mask: Option<Matrix>,
}

impl PooledExtractor {
    pub fn new(config: ExtractorConfig, seed: u64) -> PooledExtractor {
        let mut rng = StdRng::seed_from_u64(seed);
        let pooled = config.pool_grid * config.pool_grid * 3;
        let features = Layer::new(
            "cnn/features",
            config.hidden_size,
            pooled,
            ActivationFunction::ReLU,
            config.train_feature_layers,
            &mut rng,
        );
        let top = Layer::new(
            "cnn/top",
            config.feature_size,
            config.hidden_size,
            ActivationFunction::ReLU,
            config.train_top_layers,
            &mut rng,
        );
        PooledExtractor { config, features, top, rng, dropout_mask: None }
    }

    fn pool(&self, images: &Matrix) -> Matrix {
        let side = self.config.image_side;
        let grid = self.config.pool_grid;
        let cell = side / grid;
        let norm = 1.0 / (cell * cell) as f64;

        let mut out = Matrix::zeros(images.rows, grid * grid * 3);
        for (row, pooled) in images.data.iter().zip(out.data.iter_mut()) {
            for y in 0..side {
                for x in 0..side {
                    let target = ((y / cell) * grid + x / cell) * 3;
                    let source = (y * side + x) * 3;
                    for c in 0..3 {
                        pooled[target + c] += row[source + c] * norm;
                    }
                }
            }
        }
        out
    }

    fn weights(&self) -> impl Iterator<Item = &Param> {
        [&self.features.weights, &self.top.weights].into_iter().filter(|p| p.trainable)
    }
}

impl Parameters for PooledExtractor {
    fn params(&self) -> Vec<&Param> {
        let mut params = self.features.params();
        params.extend(self.top.params());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.features.params_mut();
        params.extend(self.top.params_mut());
        params
    }
}

impl FeatureExtractor for PooledExtractor {
    fn input_size(&self) -> usize {
        self.config.image_side * self.config.image_side * 3
    }

    fn feature_size(&self) -> usize {
        self.config.feature_size
    }

    fn forward(&mut self, images: &Matrix, phase: Phase) -> CaptionResult<Matrix> {
        if images.cols != self.input_size() {
            return Err(CaptionError::Shape {
                slot: "extractor input",
                expected: self.input_size().to_string(),
                actual: images.cols.to_string(),
            });
        }

        let pooled = self.pool(images);
        let mut hidden = self.features.feed_from(&pooled);

        self.dropout_mask = match (phase, self.config.dropout_keep) {
            (Phase::Train, Some(keep)) if keep < 1.0 => {
                // Inverted dropout: survivors are scaled by 1/keep.
                let mut mask = Matrix::zeros(hidden.rows, hidden.cols);
                for x in mask.data.iter_mut().flatten() {
                    *x = if self.rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 };
                }
                hidden = hidden.hadamard(&mask);
                Some(mask)
            }
            _ => None,
        };

        Ok(self.top.feed_from(&hidden))
    }

    fn backward(&mut self, d_features: &Matrix) -> CaptionResult<()> {
        let mut d_hidden = self.top.backward(d_features);
        if let Some(mask) = &self.dropout_mask {
            d_hidden = d_hidden.hadamard(mask);
        }
        self.features.backward(&d_hidden);

        if let Some(wd) = self.config.weight_decay {
            for layer in [&mut self.features, &mut self.top] {
                let decay = layer.weights.value.scale(wd);
                layer.weights.accumulate(&decay);
            }
        }
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> CaptionResult<()> {
        let file = std::fs::File::open(path).map_err(|e| {
            CaptionError::resource(format!("cannot open weight file '{}': {e}", path.display()))
        })?;
        let weights: BTreeMap<String, Matrix> =
            serde_json::from_reader(std::io::BufReader::new(file))?;

        for param in self.params_mut() {
            let value = weights.get(&param.name).ok_or_else(|| {
                CaptionError::config(format!("weight file lacks '{}'", param.name))
            })?;
            if value.shape() != param.value.shape() || !value.is_well_formed() {
                return Err(CaptionError::Shape {
                    slot: "pretrained weight",
                    expected: format!("{:?}", param.value.shape()),
                    actual: format!("{:?}", value.shape()),
                });
            }
            param.value = value.clone();
        }
        tracing::info!(path = %path.display(), "loaded pretrained extractor weights");
        Ok(())
    }

    fn regularization_loss(&self) -> f64 {
        match self.config.weight_decay {
            Some(wd) => 0.5 * wd * self.weights().map(|p| p.value.sum_squares()).sum::<f64>(),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExtractorConfig {
        ExtractorConfig {
            image_side: 4,
            pool_grid: 2,
            hidden_size: 5,
            feature_size: 6,
            train_feature_layers: true,
            train_top_layers: false,
            dropout_keep: None,
            weight_decay: None,
        }
    }

    #[test]
    fn pooling_averages_cells() {
        let ex = PooledExtractor::new(config(), 1);
        // Red channel = 1 in the top-left 2×2 cell only.
        let mut pixels = vec![0.0; 4 * 4 * 3];
        for y in 0..2 {
            for x in 0..2 {
                pixels[(y * 4 + x) * 3] = 1.0;
            }
        }
        let pooled = ex.pool(&Matrix::from_data(vec![pixels]));
        assert_eq!(pooled.cols, 12);
        assert!((pooled.data[0][0] - 1.0).abs() < 1e-12);
        assert_eq!(pooled.data[0][3], 0.0);
    }

    #[test]
    fn forward_shape_and_frozen_top() {
        let mut ex = PooledExtractor::new(config(), 1);
        let images = Matrix::filled(2, 48, 0.5);
        let out = ex.forward(&images, Phase::Train).unwrap();
        assert_eq!(out.shape(), (2, 6));

        ex.backward(&Matrix::filled(2, 6, 1.0)).unwrap();
        assert_eq!(ex.top.weights.grad.sum_squares(), 0.0);
    }

    #[test]
    fn load_weights_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.json");
        let source = PooledExtractor::new(config(), 7);
        let map: BTreeMap<String, Matrix> =
            source.params().iter().map(|p| (p.name.clone(), p.value.clone())).collect();
        std::fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();

        let mut target = PooledExtractor::new(config(), 8);
        target.load_weights(&path).unwrap();
        assert_eq!(target.top.weights.value, source.top.weights.value);

        let missing = dir.path().join("nope.json");
        assert!(matches!(target.load_weights(&missing), Err(CaptionError::Resource(_))));
    }

    #[test]
    fn weight_decay_counts_trainable_weights_only() {
        let mut cfg = config();
        cfg.weight_decay = Some(0.1);
        let ex = PooledExtractor::new(cfg, 2);
        let expected = 0.05 * ex.features.weights.value.sum_squares();
        assert!((ex.regularization_loss() - expected).abs() < 1e-12);
    }
}
