pub mod adam;
pub mod sgd;
pub mod update;

pub use adam::Adam;
pub use sgd::Sgd;
pub use update::{OptimizerKind, UpdateOp, UpdatePair, UpdateReport, UpdateRule};
