pub mod checkpoint;
pub mod context;
pub mod epoch_stats;
pub mod loop_fn;
pub mod train_config;
pub mod trainer;

pub use checkpoint::{CheckpointRecord, CheckpointStore, TrainingState};
pub use context::{Stage, StepReport, TrainingContext};
pub use epoch_stats::{EpochStats, TrainingReport};
pub use loop_fn::{epoch_budget_reached, train_loop, validate};
pub use train_config::{PriorFamily, RunMode, TrainingConfiguration};
pub use trainer::{run, RunOutcome};
