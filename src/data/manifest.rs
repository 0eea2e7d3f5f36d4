use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::batch::{Batch, CaptionPair};
use crate::data::dictionary::Dictionary;
use crate::data::image::ImageStore;
use crate::data::source::{BatchSource, DataProvider, SourceOptions};
use crate::error::{CaptionError, CaptionResult};
use crate::math::matrix::Matrix;

/// On-disk dataset description.
///
/// ```json
/// {
///   "image_root": "images",
///   "train": [{ "id": "1", "path": "1.jpg", "features": [..],
///               "captions": [{ "text": "a dog", "cluster_vector": [..] }] }],
///   "val": [...],
///   "test": [...]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Image directory, relative to the manifest file.
    #[serde(default)]
    pub image_root: Option<PathBuf>,
    pub train: Vec<ImageRecord>,
    #[serde(default)]
    pub val: Vec<ImageRecord>,
    #[serde(default)]
    pub test: Vec<ImageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Precomputed extractor features, used when not fine-tuning.
    #[serde(default)]
    pub features: Option<Vec<f64>>,
    #[serde(default)]
    pub captions: Vec<CaptionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionRecord {
    pub text: String,
    #[serde(default)]
    pub cluster_vector: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Split {
    Train,
    Validation,
    Test,
}

/// [`DataProvider`] backed by a JSON [`Manifest`].
pub struct ManifestProvider {
    manifest: Manifest,
    image_root: PathBuf,
    dictionary: Dictionary,
    image_size: usize,
    feature_width: usize,
    seed: u64,
}

impl ManifestProvider {
    pub fn open(
        path: &Path,
        image_size: usize,
        feature_width: usize,
        seed: u64,
    ) -> CaptionResult<ManifestProvider> {
        let file = std::fs::File::open(path).map_err(|e| {
            CaptionError::resource(format!("cannot open manifest '{}': {e}", path.display()))
        })?;
        let manifest: Manifest = serde_json::from_reader(std::io::BufReader::new(file))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let image_root = match &manifest.image_root {
            Some(root) => base.join(root),
            None => base.to_path_buf(),
        };
        Ok(ManifestProvider::from_manifest(manifest, image_root, image_size, feature_width, seed))
    }

    pub fn from_manifest(
        manifest: Manifest,
        image_root: PathBuf,
        image_size: usize,
        feature_width: usize,
        seed: u64,
    ) -> ManifestProvider {
        let dictionary = Dictionary::build(
            manifest.train.iter().flat_map(|r| r.captions.iter().map(|c| c.text.as_str())),
            1,
        );
        tracing::info!(
            train = manifest.train.len(),
            val = manifest.val.len(),
            test = manifest.test.len(),
            vocab = dictionary.vocab_size(),
            "loaded manifest"
        );
        ManifestProvider { manifest, image_root, dictionary, image_size, feature_width, seed }
    }

    fn source(&self, split: Split, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        let (records, seed_offset) = match split {
            Split::Train => (&self.manifest.train, 0),
            Split::Validation => (&self.manifest.val, 1),
            Split::Test => (&self.manifest.test, 2),
        };
        let needs_captions = split != Split::Test;

        let mut encoded = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for record in records {
            if needs_captions && record.captions.len() < options.num_captions {
                skipped += 1;
                continue;
            }
            encoded.push(EncodedRecord {
                id: record.id.clone(),
                path: record.path.clone(),
                features: record.features.clone(),
                captions: record
                    .captions
                    .iter()
                    .map(|c| self.dictionary.encode(&c.text, c.cluster_vector.clone()))
                    .collect(),
            });
        }
        if skipped > 0 {
            tracing::warn!(?split, skipped, "images with fewer than {} captions skipped", options.num_captions);
        }

        let images = if options.raw_images {
            Some(ImageStore::open(&self.image_root, self.image_size)?)
        } else {
            None
        };

        let mut source = ManifestSource {
            records: encoded,
            options,
            feature_width: self.feature_width,
            images,
            order: Vec::new(),
            cursor: 0,
            shuffle: split == Split::Train,
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(seed_offset)),
            captions_per_image: if needs_captions { options.num_captions } else { 0 },
        };
        source.restart()?;
        Ok(Box::new(source))
    }
}

impl DataProvider for ManifestProvider {
    fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    fn train_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        self.source(Split::Train, options)
    }

    fn validation_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        self.source(Split::Validation, options)
    }

    fn test_source(&mut self, options: SourceOptions) -> CaptionResult<Box<dyn BatchSource>> {
        self.source(Split::Test, options)
    }
}

struct EncodedRecord {
    id: String,
    path: Option<PathBuf>,
    features: Option<Vec<f64>>,
    captions: Vec<CaptionPair>,
}

pub struct ManifestSource {
    records: Vec<EncodedRecord>,
    options: SourceOptions,
    feature_width: usize,
    images: Option<ImageStore>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    rng: StdRng,
    captions_per_image: usize,
}

impl ManifestSource {
    fn image_row(&self, record: &EncodedRecord) -> CaptionResult<Vec<f64>> {
        match &self.images {
            Some(store) => {
                let path = record.path.as_ref().ok_or_else(|| {
                    CaptionError::resource(format!("image '{}' has no path", record.id))
                })?;
                store.load_rgb(path)
            }
            None => {
                let features = record.features.as_ref().ok_or_else(|| {
                    CaptionError::resource(format!(
                        "image '{}' has no precomputed features",
                        record.id
                    ))
                })?;
                if features.len() != self.feature_width {
                    return Err(CaptionError::Shape {
                        slot: "image features",
                        expected: self.feature_width.to_string(),
                        actual: features.len().to_string(),
                    });
                }
                Ok(features.clone())
            }
        }
    }
}

impl BatchSource for ManifestSource {
    fn restart(&mut self) -> CaptionResult<()> {
        self.order = (0..self.records.len()).collect();
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> CaptionResult<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.options.batch_size).min(self.order.len());
        let picked: Vec<usize> = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let mut image_ids = Vec::with_capacity(picked.len());
        let mut rows = Vec::with_capacity(picked.len());
        let mut captions = Vec::with_capacity(picked.len());
        for idx in picked {
            let record = &self.records[idx];
            rows.push(self.image_row(record)?);
            image_ids.push(record.id.clone());

            let k = self.captions_per_image;
            let group: Vec<CaptionPair> = if self.shuffle {
                record.captions.choose_multiple(&mut self.rng, k).cloned().collect()
            } else {
                record.captions.iter().take(k).cloned().collect()
            };
            captions.push(group);
        }

        Ok(Some(Batch { image_ids, images: Matrix::from_data(rows), captions }))
    }

    fn close(&mut self) -> CaptionResult<()> {
        if let Some(store) = self.images.as_mut() {
            store.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, captions: &[&str]) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            path: None,
            features: Some(vec![id.len() as f64; 3]),
            captions: captions
                .iter()
                .map(|t| CaptionRecord { text: t.to_string(), cluster_vector: None })
                .collect(),
        }
    }

    fn provider() -> ManifestProvider {
        let manifest = Manifest {
            image_root: None,
            train: vec![
                record("a", &["a dog", "the dog"]),
                record("bb", &["a cat", "the cat"]),
                record("ccc", &["a cow"]),
            ],
            val: vec![record("v", &["a dog"])],
            test: vec![record("t", &[])],
        };
        ManifestProvider::from_manifest(manifest, PathBuf::from("."), 4, 3, 9)
    }

    fn options(num_captions: usize) -> SourceOptions {
        SourceOptions { batch_size: 2, use_cluster_vectors: false, num_captions, raw_images: false }
    }

    #[test]
    fn batches_cover_split_then_exhaust() {
        let mut p = provider();
        let mut src = p.train_source(options(1)).unwrap();
        let first = src.next_batch().unwrap().unwrap();
        let second = src.next_batch().unwrap().unwrap();
        assert_eq!(first.len() + second.len(), 3);
        assert!(src.next_batch().unwrap().is_none());

        src.restart().unwrap();
        assert!(src.next_batch().unwrap().is_some());
    }

    #[test]
    fn multi_caption_skips_short_images() {
        let mut p = provider();
        let mut src = p.train_source(options(2)).unwrap();
        let batch = src.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.captions.iter().all(|g| g.len() == 2));
        assert!(src.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_split_needs_no_captions() {
        let mut p = provider();
        let mut src = p.test_source(options(1)).unwrap();
        let batch = src.next_batch().unwrap().unwrap();
        assert_eq!(batch.image_ids, vec!["t".to_string()]);
        assert!(batch.captions[0].is_empty());
    }

    #[test]
    fn feature_width_is_checked() {
        let mut p = provider();
        p.feature_width = 5;
        let mut src = p.validation_source(options(1)).unwrap();
        assert!(matches!(src.next_batch(), Err(CaptionError::Shape { .. })));
    }
}
