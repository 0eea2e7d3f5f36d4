pub mod math;
pub mod activation;
pub mod error;
pub mod layers;
pub mod loss;
pub mod optim;
pub mod data;
pub mod model;
pub mod train;
pub mod infer;

// Convenience re-exports
pub use math::matrix::Matrix;
pub use activation::activation::ActivationFunction;
pub use error::{CaptionError, CaptionResult};
pub use layers::dense::Layer;
pub use loss::masked::MaskedSequenceLoss;
pub use optim::update::{UpdateOp, UpdatePair};
pub use data::source::{BatchSource, DataProvider};
pub use model::input_plan::InputPlan;
pub use train::context::{Stage, TrainingContext};
pub use train::train_config::TrainingConfiguration;
pub use train::trainer::run;
pub use infer::{GreedyInference, Inference};
