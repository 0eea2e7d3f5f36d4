pub mod captioner;
pub mod decoder;
pub mod extractor;
pub mod features;
pub mod input_plan;
pub mod phase;

pub use captioner::{Captioner, ForwardPass};
pub use decoder::{Decoder, DecoderGradients, DecoderInput, DecoderOutput, LatentDecoder, LatentDecoderConfig};
pub use extractor::{ExtractorConfig, FeatureExtractor, PooledExtractor};
pub use features::{collapse_gradients, expand_features, FeaturePipeline};
pub use input_plan::{BoundInputs, ClusterInput, ClusterSlot, ImageSlot, InputPlan};
pub use phase::Phase;
