use std::time::Instant;

use crate::data::source::BatchSource;
use crate::error::{CaptionError, CaptionResult};
use crate::train::context::{Stage, TrainingContext};
use crate::train::epoch_stats::{EpochStats, TrainingReport};

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Approximate epoch boundary: checked once per batch, so the last batch of
/// an epoch may overshoot the budget by up to one batch of examples.
pub fn epoch_budget_reached(processed_batches: usize, batch_size: usize, budget: usize) -> bool {
    processed_batches * batch_size > budget
}

/// Runs the remaining epochs of `ctx`: a training pass, a validation pass
/// and a checkpoint per epoch.
///
/// A resumed context starts after its persisted epoch count. Fails on the
/// first step error; the last saved checkpoint is the recovery point.
pub fn train_loop(
    ctx: &mut TrainingContext,
    train: &mut dyn BatchSource,
    mut validation: Option<&mut dyn BatchSource>,
) -> CaptionResult<TrainingReport> {
    let total_epochs = ctx.config().num_epochs;
    let mut report = TrainingReport::default();

    if ctx.epochs_completed() >= total_epochs {
        tracing::warn!(
            epochs_completed = ctx.epochs_completed(),
            total_epochs,
            "checkpoint already covers every requested epoch"
        );
    }

    for epoch in ctx.epochs_completed() + 1..=total_epochs {
        let t_start = Instant::now();

        // ── One budgeted pass over the training source ────────────────────
        ctx.enter(Stage::TrainingEpoch);
        let pass = run_one_epoch(ctx, train)?;

        // ── Validation ────────────────────────────────────────────────────
        ctx.enter(Stage::Validating);
        let val_loss = match validation.as_deref_mut() {
            Some(source) => validate(ctx, source)?,
            None => None,
        };

        // ── Checkpoint ────────────────────────────────────────────────────
        ctx.mark_epoch_completed(epoch);
        ctx.enter(Stage::Checkpointing);
        ctx.save_checkpoint()?;

        let stats = EpochStats {
            epoch,
            total_epochs,
            train_loss: pass.last_loss,
            mean_train_loss: pass.total_loss / pass.batches as f64,
            batches: pass.batches,
            val_loss,
            global_step: ctx.global_step(),
            elapsed_ms: t_start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            epoch,
            total_epochs,
            train_loss = stats.train_loss,
            mean_train_loss = stats.mean_train_loss,
            val_loss = ?stats.val_loss,
            global_step = stats.global_step,
            elapsed_ms = stats.elapsed_ms,
            "epoch complete"
        );
        report.epochs.push(stats);
    }

    Ok(report)
}

/// Mean reconstruction loss over every batch of `source`, without updates.
/// `None` when the source yields nothing.
pub fn validate(ctx: &mut TrainingContext, source: &mut dyn BatchSource) -> CaptionResult<Option<f64>> {
    source.restart()?;
    let mut total = 0.0;
    let mut batches = 0usize;
    while let Some(batch) = source.next_batch()? {
        total += ctx.eval_step(&batch)?;
        batches += 1;
    }

    if batches == 0 {
        tracing::warn!("validation source yielded no batches");
        return Ok(None);
    }
    let mean = total / batches as f64;
    tracing::info!(val_loss = mean, batches, "validation complete");
    Ok(Some(mean))
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

struct EpochPass {
    batches: usize,
    last_loss: f64,
    total_loss: f64,
}

/// Pulls batches until the example budget is exceeded, restarting the
/// source whenever it runs dry.
fn run_one_epoch(ctx: &mut TrainingContext, source: &mut dyn BatchSource) -> CaptionResult<EpochPass> {
    let batch_size = ctx.config().batch_size;
    let budget = ctx.config().num_ex_per_epoch;
    let log_every = ctx.config().log_every.max(1);

    let mut pass = EpochPass { batches: 0, last_loss: 0.0, total_loss: 0.0 };
    let mut since_restart = 0usize;
    source.restart()?;

    loop {
        let batch = match source.next_batch()? {
            Some(batch) => batch,
            None if since_restart == 0 => {
                return Err(CaptionError::config(
                    "training source yielded no batches after a restart",
                ));
            }
            None => {
                source.restart()?;
                since_restart = 0;
                continue;
            }
        };
        since_restart += 1;

        let step = ctx.train_step(&batch)?;
        pass.batches += 1;
        pass.last_loss = step.reconstruction;
        pass.total_loss += step.reconstruction;

        if step.global_step % log_every == 0 {
            tracing::info!(
                global_step = step.global_step,
                loss = step.reconstruction,
                total_loss = step.total,
                grad_norm = step.norms.primary_norm,
                extractor_grad_norm = ?step.norms.secondary_norm,
                "training step"
            );
        }

        if epoch_budget_reached(pass.batches, batch_size, budget) {
            break;
        }
    }

    Ok(pass)
}
