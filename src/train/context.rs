use std::fmt;

use crate::data::batch::Batch;
use crate::data::captions::{prepare_captions, CaptionTensors};
use crate::error::{CaptionError, CaptionResult};
use crate::loss::masked::MaskedSequenceLoss;
use crate::model::captioner::Captioner;
use crate::model::decoder::Decoder;
use crate::model::extractor::FeatureExtractor;
use crate::model::features::FeaturePipeline;
use crate::model::input_plan::{BoundInputs, ImageSlot, InputPlan};
use crate::model::phase::Phase;
use crate::optim::update::{UpdateOp, UpdatePair, UpdateReport};
use crate::train::checkpoint::{CheckpointRecord, CheckpointStore, TrainingState};
use crate::train::train_config::TrainingConfiguration;

/// Lifecycle stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Initializing,
    TrainingEpoch,
    Validating,
    Checkpointing,
    Inferring,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Initializing => "initializing",
            Stage::TrainingEpoch => "training_epoch",
            Stage::Validating => "validating",
            Stage::Checkpointing => "checkpointing",
            Stage::Inferring => "inferring",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Result of one joint training step.
#[derive(Debug, Clone, Copy)]
pub struct StepReport {
    /// Masked reconstruction loss.
    pub reconstruction: f64,
    /// Reconstruction plus regularization; the quantity differentiated.
    pub total: f64,
    /// Annealing value the decoder saw during this step.
    pub anneal_step: u64,
    /// Global step after the update.
    pub global_step: u64,
    pub norms: UpdateReport,
}

/// Everything a run mutates, constructed once and passed by reference
/// through the loop, validation, checkpointing and inference.
pub struct TrainingContext {
    config: TrainingConfiguration,
    pub plan: InputPlan,
    pub model: Captioner,
    pub optimizers: UpdatePair,
    store: CheckpointStore,
    epochs_completed: usize,
    stage: Stage,
    stage_history: Vec<Stage>,
}

impl TrainingContext {
    /// Validates the configuration, resolves the input plan and wires the
    /// collaborators into a model with its optimizers.
    pub fn build(
        config: TrainingConfiguration,
        extractor: Box<dyn FeatureExtractor>,
        decoder: Box<dyn Decoder>,
    ) -> CaptionResult<TrainingContext> {
        config.validate()?;
        let plan = InputPlan::resolve(&config);

        if extractor.feature_size() != config.cnn_feature_size {
            return Err(CaptionError::Shape {
                slot: "extractor output",
                expected: config.cnn_feature_size.to_string(),
                actual: extractor.feature_size().to_string(),
            });
        }
        if let ImageSlot::RawImage { .. } = plan.image {
            if extractor.input_size() != plan.image.width() {
                return Err(CaptionError::Shape {
                    slot: "extractor input",
                    expected: plan.image.width().to_string(),
                    actual: extractor.input_size().to_string(),
                });
            }
        }

        let pipeline = FeaturePipeline::new(plan.image, config.captions_per_image());
        let cluster_width = plan.uses_cluster_vectors().then_some(config.cluster_vector_size);
        let model = Captioner::new(
            extractor,
            decoder,
            pipeline,
            config.embed_size,
            cluster_width,
            config.seed,
        );

        let primary = UpdateOp::new(config.optimizer.build(config.learning_rate), config.max_grad_norm);
        let secondary = config.trains_extractor().then(|| {
            UpdateOp::new(config.optimizer.build(config.cnn_learning_rate), config.max_grad_norm)
        });

        tracing::info!(
            image = ?plan.image,
            cluster = ?plan.cluster,
            captions_per_image = pipeline.captions_per_image(),
            fine_tune = secondary.is_some(),
            "input plan resolved"
        );

        Ok(TrainingContext {
            store: CheckpointStore::new(config.checkpoint_dir.clone()),
            config,
            plan,
            model,
            optimizers: UpdatePair { primary, secondary },
            epochs_completed: 0,
            stage: Stage::Idle,
            stage_history: vec![Stage::Idle],
        })
    }

    /// The resolved configuration; fixed for the lifetime of the run.
    pub fn config(&self) -> &TrainingConfiguration {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order, starting with `Idle`.
    pub fn stage_history(&self) -> &[Stage] {
        &self.stage_history
    }

    pub fn enter(&mut self, stage: Stage) {
        if self.stage != stage {
            tracing::debug!(from = %self.stage, to = %stage, "stage transition");
        }
        self.stage = stage;
        self.stage_history.push(stage);
    }

    pub fn global_step(&self) -> u64 {
        self.optimizers.global_step()
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn mark_epoch_completed(&mut self, epoch: usize) {
        self.epochs_completed = epoch;
    }

    pub fn state(&self) -> TrainingState {
        TrainingState {
            global_step: self.global_step(),
            epochs_completed: self.epochs_completed,
        }
    }

    /// Annealing input for the step about to run: the update it produces
    /// will be global step `global_step + 1`.
    pub fn anneal_step(&self) -> u64 {
        self.global_step() + 1
    }

    /// Both extractor groups are trained end to end in this run.
    fn extractor_fully_trained(&self) -> bool {
        self.config.trains_extractor() && self.config.fine_tune_fe && self.config.fine_tune_top
    }

    /// Loads pretrained extractor weights on a fresh run, or the named
    /// checkpoint on a resumed one. Inference runs restore through the
    /// inference collaborator instead.
    pub fn initialize(&mut self) -> CaptionResult<()> {
        self.enter(Stage::Initializing);
        if !self.config.is_training() {
            return Ok(());
        }
        if self.config.restore {
            self.restore_checkpoint()?;
        } else if self.config.load_pretrained {
            let path = self.config.image_net_weights_path.clone();
            if !path.is_file() {
                return Err(CaptionError::resource(format!(
                    "pretrained weight file '{}' not found",
                    path.display()
                )));
            }
            self.model.extractor.load_weights(&path)?;
        }
        Ok(())
    }

    /// Turns a batch into bound inputs and padded caption tensors.
    pub fn prepare(&self, batch: &Batch) -> CaptionResult<(BoundInputs, CaptionTensors)> {
        let k = self.model.pipeline.captions_per_image();
        let captions = prepare_captions(&batch.captions, k, self.plan.uses_cluster_vectors())?;
        let bound = self.plan.bind(&batch.images, captions.cluster_vectors.as_ref(), captions.rows())?;
        Ok((bound, captions))
    }

    /// One joint update of both parameter groups on `batch`.
    pub fn train_step(&mut self, batch: &Batch) -> CaptionResult<StepReport> {
        let (bound, captions) = self.prepare(batch)?;
        let anneal_step = self.anneal_step();

        let pass = self.model.forward(&bound, &captions, anneal_step, Phase::Train)?;
        let labels = MaskedSequenceLoss::flatten(&captions.encoder_targets);
        let loss = MaskedSequenceLoss::compute(&pass.logits, &labels)?;
        let total = loss.value + pass.regularization;
        if !total.is_finite() {
            return Err(CaptionError::Computation(format!(
                "non-finite loss {total} at step {anneal_step}"
            )));
        }

        let train_extractor = self.optimizers.secondary.is_some();
        self.model.backward(&loss.d_logits, train_extractor)?;

        let (primary, extractor) = self.model.param_groups_mut();
        let norms = self.optimizers.apply(primary, extractor)?;

        Ok(StepReport {
            reconstruction: loss.value,
            total,
            anneal_step,
            global_step: self.global_step(),
            norms,
        })
    }

    /// Reconstruction loss of `batch` without touching any parameter.
    pub fn eval_step(&mut self, batch: &Batch) -> CaptionResult<f64> {
        let (bound, captions) = self.prepare(batch)?;
        let pass = self.model.forward(&bound, &captions, self.global_step(), Phase::Eval)?;
        let labels = MaskedSequenceLoss::flatten(&captions.encoder_targets);
        let per_token = MaskedSequenceLoss::per_token(&pass.logits, &labels)?;
        let loss = MaskedSequenceLoss::reduce(&per_token, &MaskedSequenceLoss::mask(&labels))?;
        if !loss.is_finite() {
            return Err(CaptionError::Computation(format!("non-finite validation loss {loss}")));
        }
        Ok(loss)
    }

    /// Overwrites the configured checkpoint slot with the current state.
    pub fn save_checkpoint(&self) -> CaptionResult<()> {
        let record = CheckpointRecord::capture(
            self.state(),
            self.model.checkpoint_params(self.extractor_fully_trained()),
        );
        let path = self.store.save(&self.config.checkpoint, &record)?;
        tracing::info!(
            path = %path.display(),
            global_step = record.state.global_step,
            epoch = record.state.epochs_completed,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Loads the configured checkpoint; the global step and epoch count
    /// continue from the persisted values.
    pub fn restore_checkpoint(&mut self) -> CaptionResult<TrainingState> {
        let record = self.store.load(&self.config.checkpoint)?;
        let fully = self.extractor_fully_trained();
        record.apply_to(self.model.checkpoint_params_mut(fully))?;
        self.optimizers.resume_from(record.state.global_step);
        self.epochs_completed = record.state.epochs_completed;
        tracing::info!(
            checkpoint = %self.config.checkpoint,
            global_step = record.state.global_step,
            epochs_completed = record.state.epochs_completed,
            "checkpoint restored"
        );
        Ok(record.state)
    }
}
