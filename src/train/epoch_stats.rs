use serde::{Deserialize, Serialize};

/// Per-epoch training statistics emitted by `train_loop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number; resumed runs continue the persisted count.
    pub epoch: usize,
    /// Total epochs requested for this run.
    pub total_epochs: usize,
    /// Reconstruction loss of the last batch of the epoch.
    pub train_loss: f64,
    /// Mean reconstruction loss over the epoch's batches.
    pub mean_train_loss: f64,
    /// Batches consumed before the example budget was exceeded.
    pub batches: usize,
    /// Mean validation loss, if the validation source yielded any batch.
    pub val_loss: Option<f64>,
    /// Global step at the end of the epoch.
    pub global_step: u64,
    /// Wall-clock duration of this single epoch in milliseconds.
    pub elapsed_ms: u64,
}

/// Everything `train_loop` observed, one entry per completed epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochStats> {
        self.epochs.last()
    }

    /// Training loss of the last batch of the last completed epoch.
    pub fn final_train_loss(&self) -> Option<f64> {
        self.last().map(|s| s.train_loss)
    }
}
