pub mod batch;
pub mod captions;
pub mod dictionary;
pub mod image;
pub mod manifest;
pub mod source;

pub use batch::{Batch, CaptionPair};
pub use captions::{prepare_captions, CaptionTensors};
pub use dictionary::Dictionary;
pub use manifest::{Manifest, ManifestProvider};
pub use source::{BatchSource, DataProvider, SourceOptions};
