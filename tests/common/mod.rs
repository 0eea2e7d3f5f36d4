#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use caption_vae::data::{Batch, BatchSource, DataProvider, Dictionary, SourceOptions};
use caption_vae::layers::{Param, Parameters};
use caption_vae::math::Matrix;
use caption_vae::model::{
    Decoder, DecoderGradients, DecoderInput, DecoderOutput, ExtractorConfig, LatentDecoder,
    LatentDecoderConfig, PooledExtractor,
};
use caption_vae::optim::OptimizerKind;
use caption_vae::train::TrainingConfiguration;
use caption_vae::{CaptionError, CaptionResult};

pub const FEATURES: usize = 4;

pub const CAPTIONS: [&str; 4] = ["a dog runs", "a cat sits", "the dog sits", "a cat runs"];

pub fn dictionary() -> Dictionary {
    Dictionary::build(CAPTIONS.iter().copied(), 1)
}

/// Small precomputed-feature configuration writing checkpoints to `dir`.
pub fn config(dir: &Path) -> TrainingConfiguration {
    TrainingConfiguration {
        batch_size: 2,
        num_epochs: 1,
        num_ex_per_epoch: 3,
        load_pretrained: false,
        cnn_feature_size: FEATURES,
        embed_size: 3,
        decoder_hidden_size: 5,
        latent_size: 2,
        kl_anneal_steps: 10,
        optimizer: OptimizerKind::Sgd,
        learning_rate: 0.05,
        cnn_learning_rate: 0.05,
        checkpoint_dir: dir.join("ckpt"),
        output_dir: dir.join("captions"),
        max_caption_length: 6,
        log_every: 1,
        ..TrainingConfiguration::default()
    }
}

/// Extractor whose layers are marked trainable regardless of the run.
pub fn extractor(config: &TrainingConfiguration) -> PooledExtractor {
    PooledExtractor::new(
        ExtractorConfig {
            image_side: 2,
            pool_grid: 1,
            hidden_size: 3,
            feature_size: config.cnn_feature_size,
            train_feature_layers: true,
            train_top_layers: true,
            dropout_keep: None,
            weight_decay: None,
        },
        3,
    )
}

pub fn decoder(config: &TrainingConfiguration) -> LatentDecoder {
    LatentDecoder::new(LatentDecoderConfig::from_training(config, dictionary().vocab_size()), 5)
}

/// One batch per pair of captions, one caption per image.
pub fn batches(count: usize) -> Vec<Batch> {
    let dict = dictionary();
    (0..count)
        .map(|n| {
            let ids = vec![format!("img{}", 2 * n), format!("img{}", 2 * n + 1)];
            let images = Matrix::from_data(vec![
                vec![0.1 * n as f64, 0.2, 0.3, 0.4],
                vec![0.4, 0.3, 0.2 * n as f64, 0.1],
            ]);
            let captions = vec![
                vec![dict.encode(CAPTIONS[(2 * n) % 4], None)],
                vec![dict.encode(CAPTIONS[(2 * n + 1) % 4], None)],
            ];
            Batch { image_ids: ids, images, captions }
        })
        .collect()
}

/// Counters shared between a [`VecSource`] and the test that created it.
#[derive(Debug, Default, Clone)]
pub struct SourceProbe {
    pub restarts: Rc<Cell<usize>>,
    pub pulled: Rc<Cell<usize>>,
    pub closed: Rc<Cell<usize>>,
}

/// In-memory batch source; optionally fails on the `n`-th pull.
pub struct VecSource {
    batches: Vec<Batch>,
    cursor: usize,
    fail_at: Option<usize>,
    probe: SourceProbe,
}

impl VecSource {
    pub fn new(batches: Vec<Batch>, probe: SourceProbe) -> VecSource {
        VecSource { batches, cursor: 0, fail_at: None, probe }
    }

    pub fn failing_at(mut self, pull: usize) -> VecSource {
        self.fail_at = Some(pull);
        self
    }
}

impl BatchSource for VecSource {
    fn restart(&mut self) -> CaptionResult<()> {
        self.probe.restarts.set(self.probe.restarts.get() + 1);
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> CaptionResult<Option<Batch>> {
        let pulled = self.probe.pulled.get() + 1;
        self.probe.pulled.set(pulled);
        if self.fail_at == Some(pulled) {
            return Err(CaptionError::Computation("storage read failed".into()));
        }
        let batch = self.batches.get(self.cursor).cloned();
        self.cursor += 1;
        Ok(batch)
    }

    fn close(&mut self) -> CaptionResult<()> {
        self.probe.closed.set(self.probe.closed.get() + 1);
        Ok(())
    }
}

/// Provider handing out [`VecSource`]s over fixed batch lists.
pub struct FakeProvider {
    pub dictionary: Dictionary,
    pub train: Vec<Batch>,
    pub validation: Vec<Batch>,
    pub test: Vec<Batch>,
    pub train_probe: SourceProbe,
    pub validation_probe: SourceProbe,
    pub test_probe: SourceProbe,
    pub fail_train_at: Option<usize>,
    pub options: RefCell<Vec<SourceOptions>>,
}

impl FakeProvider {
    pub fn new(train: Vec<Batch>, validation: Vec<Batch>, test: Vec<Batch>) -> FakeProvider {
        FakeProvider {
            dictionary: dictionary(),
            train,
            validation,
            test,
            train_probe: SourceProbe::default(),
            validation_probe: SourceProbe::default(),
            test_probe: SourceProbe::default(),
            fail_train_at: None,
            options: RefCell::new(Vec::new()),
        }
    }
}

impl DataProvider for FakeProvider {
    fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    fn train_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        self.options.borrow_mut().push(options);
        let source = VecSource::new(self.train.clone(), self.train_probe.clone());
        Ok(match self.fail_train_at {
            Some(n) => Box::new(source.failing_at(n)),
            None => Box::new(source),
        })
    }

    fn validation_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        self.options.borrow_mut().push(options);
        Ok(Box::new(VecSource::new(self.validation.clone(), self.validation_probe.clone())))
    }

    fn test_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        self.options.borrow_mut().push(options);
        Ok(Box::new(VecSource::new(self.test.clone(), self.test_probe.clone())))
    }
}

/// Wraps a decoder and records every annealing step it is handed.
pub struct RecordingDecoder<D> {
    pub inner: D,
    pub anneal_steps: Rc<RefCell<Vec<u64>>>,
}

impl<D: Decoder> RecordingDecoder<D> {
    pub fn new(inner: D) -> (RecordingDecoder<D>, Rc<RefCell<Vec<u64>>>) {
        let steps = Rc::new(RefCell::new(Vec::new()));
        (RecordingDecoder { inner, anneal_steps: steps.clone() }, steps)
    }
}

impl<D: Decoder> Parameters for RecordingDecoder<D> {
    fn params(&self) -> Vec<&Param> {
        self.inner.params()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.inner.params_mut()
    }
}

impl<D: Decoder> Decoder for RecordingDecoder<D> {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn forward(&mut self, input: DecoderInput<'_>) -> CaptionResult<DecoderOutput> {
        self.anneal_steps.borrow_mut().push(input.anneal_step);
        self.inner.forward(input)
    }

    fn backward(&mut self, d_logits: &Matrix) -> CaptionResult<DecoderGradients> {
        self.inner.backward(d_logits)
    }
}

pub fn snapshot(params: Vec<&Param>) -> Vec<(String, Matrix)> {
    params.into_iter().map(|p| (p.name.clone(), p.value.clone())).collect()
}
