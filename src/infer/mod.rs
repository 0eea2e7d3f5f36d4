pub mod greedy;

use std::path::PathBuf;

use crate::data::dictionary::Dictionary;
use crate::data::source::BatchSource;
use crate::error::CaptionResult;
use crate::train::context::TrainingContext;

pub use greedy::{GeneratedCaption, GreedyInference};

/// What an inference collaborator is handed: the live model with its input
/// plan and restore capability, the vocabulary, and the evaluation sources.
pub struct InferenceContext<'a> {
    pub training: &'a mut TrainingContext,
    pub dictionary: &'a Dictionary,
    pub validation: &'a mut dyn BatchSource,
    pub test: &'a mut dyn BatchSource,
}

#[derive(Debug, Clone, Default)]
pub struct InferenceReport {
    /// Captions generated across all splits.
    pub captions: usize,
    pub files: Vec<PathBuf>,
}

/// Caption generation and output formatting.
pub trait Inference {
    fn run(&mut self, ctx: InferenceContext<'_>) -> CaptionResult<InferenceReport>;
}
