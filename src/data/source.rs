use crate::data::batch::Batch;
use crate::data::dictionary::Dictionary;
use crate::error::CaptionResult;

/// Pull-based, finite stream of batches.
///
/// A source is exhausted once `next_batch` returns `None`; it yields more
/// only after an explicit `restart`.
pub trait BatchSource {
    fn restart(&mut self) -> CaptionResult<()>;

    fn next_batch(&mut self) -> CaptionResult<Option<Batch>>;

    /// Releases any external storage handle. Called once, after the run's
    /// training or inference loop finishes.
    fn close(&mut self) -> CaptionResult<()> {
        Ok(())
    }
}

/// Options the sources of one run are opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOptions {
    pub batch_size: usize,
    pub use_cluster_vectors: bool,
    /// Captions drawn per image in each batch.
    pub num_captions: usize,
    /// Whether images come as raw pixels (fine-tuning) or feature vectors.
    pub raw_images: bool,
}

pub trait DataProvider {
    fn dictionary(&self) -> &Dictionary;

    fn train_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>>;

    fn validation_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>>;

    fn test_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>>;
}
