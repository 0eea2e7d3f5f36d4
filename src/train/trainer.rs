use crate::data::source::{BatchSource, DataProvider, SourceOptions};
use crate::error::CaptionResult;
use crate::infer::{Inference, InferenceContext, InferenceReport};
use crate::model::decoder::Decoder;
use crate::model::extractor::FeatureExtractor;
use crate::train::checkpoint::TrainingState;
use crate::train::context::{Stage, TrainingContext};
use crate::train::epoch_stats::TrainingReport;
use crate::train::loop_fn::train_loop;
use crate::train::train_config::{RunMode, TrainingConfiguration};

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub mode: RunMode,
    pub training: Option<TrainingReport>,
    pub inference: Option<InferenceReport>,
    pub state: TrainingState,
    pub stages: Vec<Stage>,
}

/// Builds the training context and drives a whole run: initialization,
/// then either the epoch loop or the inference handoff.
///
/// Every batch source opened here is closed exactly once before returning,
/// whether the run succeeded or failed.
pub fn run(
    config: TrainingConfiguration,
    extractor: Box<dyn FeatureExtractor>,
    decoder: Box<dyn Decoder>,
    provider: &mut dyn DataProvider,
    inference: &mut dyn Inference,
) -> CaptionResult<RunOutcome> {
    let mut ctx = TrainingContext::build(config, extractor, decoder)?;
    let mode = ctx.config().mode;

    if ctx.config().save_params {
        std::fs::create_dir_all(&ctx.config().checkpoint_dir)?;
        let path = ctx.config().params_path();
        ctx.config().save_json(&path)?;
        tracing::info!(path = %path.display(), "run parameters saved");
    }

    let options = SourceOptions {
        batch_size: ctx.config().batch_size,
        use_cluster_vectors: ctx.plan.uses_cluster_vectors(),
        num_captions: ctx.config().captions_per_image(),
        raw_images: ctx.plan.raw_images(),
    };

    ctx.initialize()?;

    let (training, inference_report) = match mode {
        RunMode::Training => {
            let mut train = provider.train_source(options)?;
            let mut validation = match provider.validation_source(options) {
                Ok(source) => source,
                Err(e) => {
                    let _ = close_all(&mut [&mut train]);
                    return Err(e);
                }
            };

            let val_source: &mut dyn BatchSource = validation.as_mut();
            let result = train_loop(&mut ctx, train.as_mut(), Some(val_source));
            let closed = close_all(&mut [&mut train, &mut validation]);
            let report = result?;
            closed?;
            (Some(report), None)
        }
        RunMode::Inference => {
            let mut validation = provider.validation_source(options)?;
            let mut test = match provider.test_source(options) {
                Ok(source) => source,
                Err(e) => {
                    let _ = close_all(&mut [&mut validation]);
                    return Err(e);
                }
            };

            ctx.enter(Stage::Inferring);
            let result = inference.run(InferenceContext {
                training: &mut ctx,
                dictionary: provider.dictionary(),
                validation: validation.as_mut(),
                test: test.as_mut(),
            });
            let closed = close_all(&mut [&mut validation, &mut test]);
            let report = result?;
            closed?;
            (None, Some(report))
        }
    };

    ctx.enter(Stage::Done);
    tracing::info!(
        mode = ?mode,
        global_step = ctx.global_step(),
        epochs_completed = ctx.epochs_completed(),
        "run finished"
    );

    Ok(RunOutcome {
        mode,
        training,
        inference: inference_report,
        state: ctx.state(),
        stages: ctx.stage_history().to_vec(),
    })
}

/// Closes every source, returning the first failure. Later sources are
/// still closed after an earlier one fails.
fn close_all(sources: &mut [&mut Box<dyn BatchSource>]) -> CaptionResult<()> {
    let mut first_err = None;
    for source in sources.iter_mut() {
        if let Err(e) = source.close() {
            tracing::warn!(error = %e, "failed to close batch source");
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
