pub mod cross_entropy;
pub mod masked;

pub use cross_entropy::CrossEntropyLoss;
pub use masked::{MaskedLoss, MaskedSequenceLoss};
