use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaptionError, CaptionResult};
use crate::optim::update::OptimizerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Training,
    Inference,
}

/// Latent prior family used by the decoder.
///
/// `Gmm` and `Ag` condition the prior on the cluster vector and therefore
/// need cluster vectors to be fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorFamily {
    Gaussian,
    Gmm,
    Ag,
}

impl PriorFamily {
    pub fn needs_cluster_vectors(self) -> bool {
        matches!(self, PriorFamily::Gmm | PriorFamily::Ag)
    }
}

/// Resolved run options. Loaded once at startup, validated, then only read.
///
/// Every field has a default so a JSON file only needs the options it
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfiguration {
    pub mode: RunMode,

    // ── Batching / epochs ──────────────────────────────────────────────
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Approximate number of examples per epoch; see `train_loop`.
    pub num_ex_per_epoch: usize,
    /// Captions per image used in training; >1 tiles image features.
    pub num_captions: usize,

    // ── Feature extractor ──────────────────────────────────────────────
    /// Feed raw images through the extractor and train it jointly.
    pub fine_tune: bool,
    /// Feature layers trainable.
    pub fine_tune_fe: bool,
    /// Top layers trainable.
    pub fine_tune_top: bool,
    pub image_size: usize,
    pub cnn_feature_size: usize,
    pub pool_grid: usize,
    pub cnn_hidden_size: usize,
    /// Dropout keep probability, used only while fine-tuning in training.
    pub cnn_dropout: f64,
    pub weight_decay: f64,

    // ── Decoder ────────────────────────────────────────────────────────
    pub prior: PriorFamily,
    pub use_cluster_vectors: bool,
    pub cluster_vector_size: usize,
    pub embed_size: usize,
    pub decoder_hidden_size: usize,
    pub latent_size: usize,
    pub kl_anneal_steps: u64,
    pub max_caption_length: usize,

    // ── Optimization ───────────────────────────────────────────────────
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub cnn_learning_rate: f64,
    pub max_grad_norm: Option<f64>,

    // ── Initialization / checkpoints ───────────────────────────────────
    pub restore: bool,
    pub load_pretrained: bool,
    pub image_net_weights_path: PathBuf,
    pub checkpoint: String,
    pub checkpoint_dir: PathBuf,
    pub max_checkpoints_to_keep: usize,
    pub save_params: bool,

    // ── Misc ───────────────────────────────────────────────────────────
    pub output_dir: PathBuf,
    pub log_every: u64,
    pub seed: u64,
}

impl Default for TrainingConfiguration {
    fn default() -> Self {
        TrainingConfiguration {
            mode: RunMode::Training,
            batch_size: 32,
            num_epochs: 10,
            num_ex_per_epoch: 10_000,
            num_captions: 1,
            fine_tune: false,
            fine_tune_fe: false,
            fine_tune_top: false,
            image_size: 224,
            cnn_feature_size: 4096,
            pool_grid: 7,
            cnn_hidden_size: 256,
            cnn_dropout: 0.5,
            weight_decay: 5e-4,
            prior: PriorFamily::Gaussian,
            use_cluster_vectors: false,
            cluster_vector_size: 90,
            embed_size: 256,
            decoder_hidden_size: 256,
            latent_size: 64,
            kl_anneal_steps: 10_000,
            max_caption_length: 20,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            cnn_learning_rate: 1e-4,
            max_grad_norm: Some(5.0),
            restore: false,
            load_pretrained: true,
            image_net_weights_path: PathBuf::from("weights/extractor.json"),
            checkpoint: "last_run".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_checkpoints_to_keep: 1,
            save_params: false,
            output_dir: PathBuf::from("captions"),
            log_every: 500,
            seed: 42,
        }
    }
}

impl TrainingConfiguration {
    pub fn load_json(path: &Path) -> CaptionResult<TrainingConfiguration> {
        let file = std::fs::File::open(path).map_err(|e| {
            CaptionError::resource(format!("cannot open config '{}': {e}", path.display()))
        })?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save_json(&self, path: &Path) -> CaptionResult<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn is_training(&self) -> bool {
        self.mode == RunMode::Training
    }

    /// Image features are tiled per caption only in training runs.
    pub fn expands_captions(&self) -> bool {
        self.num_captions > 1 && self.is_training()
    }

    /// Captions drawn per image by the batch sources of this run.
    pub fn captions_per_image(&self) -> usize {
        if self.expands_captions() { self.num_captions } else { 1 }
    }

    /// The extractor gets its own optimizer only when it is fed live images
    /// in a training run.
    pub fn trains_extractor(&self) -> bool {
        self.fine_tune && self.is_training()
    }

    /// Rejects option combinations that cannot describe a coherent run.
    pub fn validate(&self) -> CaptionResult<()> {
        if self.restore && self.load_pretrained {
            return Err(CaptionError::config(
                "`restore` and `load_pretrained` are mutually exclusive",
            ));
        }
        if self.prior.needs_cluster_vectors() && !self.use_cluster_vectors {
            return Err(CaptionError::config(format!(
                "prior {:?} conditions on cluster vectors; set `use_cluster_vectors`",
                self.prior
            )));
        }
        if self.batch_size == 0 {
            return Err(CaptionError::config("`batch_size` must be at least 1"));
        }
        if self.num_captions == 0 {
            return Err(CaptionError::config("`num_captions` must be at least 1"));
        }
        if self.max_checkpoints_to_keep == 0 {
            return Err(CaptionError::config("`max_checkpoints_to_keep` must be at least 1"));
        }
        if !(self.cnn_dropout > 0.0 && self.cnn_dropout <= 1.0) {
            return Err(CaptionError::config("`cnn_dropout` keep probability must be in (0, 1]"));
        }
        if self.checkpoint.trim().is_empty() {
            return Err(CaptionError::config("`checkpoint` name must not be empty"));
        }
        if self.pool_grid == 0 || self.image_size % self.pool_grid != 0 {
            return Err(CaptionError::config(format!(
                "`image_size` {} must be a positive multiple of `pool_grid` {}",
                self.image_size, self.pool_grid
            )));
        }
        if self.kl_anneal_steps == 0 {
            return Err(CaptionError::config("`kl_anneal_steps` must be at least 1"));
        }
        if self.is_training() && (self.num_epochs == 0 || self.num_ex_per_epoch == 0) {
            return Err(CaptionError::config(
                "training needs positive `num_epochs` and `num_ex_per_epoch`",
            ));
        }
        if !self.fine_tune && (self.fine_tune_fe || self.fine_tune_top) {
            tracing::warn!(
                "fine_tune_fe/fine_tune_top have no effect without fine_tune; extractor stays frozen"
            );
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.ckpt.json", self.checkpoint))
    }

    pub fn params_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.params.json", self.checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrainingConfiguration {
        TrainingConfiguration { load_pretrained: false, ..Default::default() }
    }

    #[test]
    fn defaults_validate() {
        assert!(TrainingConfiguration::default().validate().is_ok());
    }

    #[test]
    fn restore_and_pretrained_are_exclusive() {
        let cfg = TrainingConfiguration { restore: true, load_pretrained: true, ..base() };
        assert!(matches!(cfg.validate(), Err(CaptionError::Configuration(_))));
    }

    #[test]
    fn mixture_prior_requires_cluster_vectors() {
        let cfg = TrainingConfiguration { prior: PriorFamily::Gmm, ..base() };
        assert!(cfg.validate().is_err());
        let cfg = TrainingConfiguration {
            prior: PriorFamily::Ag,
            use_cluster_vectors: true,
            ..base()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: TrainingConfiguration =
            serde_json::from_str(r#"{"batch_size": 4, "prior": "gmm", "mode": "inference"}"#).unwrap();
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.prior, PriorFamily::Gmm);
        assert_eq!(cfg.mode, RunMode::Inference);
        assert_eq!(cfg.cnn_feature_size, 4096);
    }

    #[test]
    fn caption_expansion_only_in_training() {
        let mut cfg = TrainingConfiguration { num_captions: 5, ..base() };
        assert_eq!(cfg.captions_per_image(), 5);
        cfg.mode = RunMode::Inference;
        assert!(!cfg.expands_captions());
        assert_eq!(cfg.captions_per_image(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn save_json_reports_flush_failure() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        assert!(matches!(base().save_json(full), Err(CaptionError::Io(_))));
    }
}
