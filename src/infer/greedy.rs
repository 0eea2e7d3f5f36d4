use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::data::batch::Batch;
use crate::data::dictionary::{Dictionary, BOS, EOS, PAD};
use crate::data::source::BatchSource;
use crate::error::{CaptionError, CaptionResult};
use crate::infer::{Inference, InferenceContext, InferenceReport};
use crate::math::matrix::Matrix;
use crate::model::decoder::DecoderInput;
use crate::model::phase::Phase;
use crate::train::context::TrainingContext;
use crate::train::train_config::TrainingConfiguration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCaption {
    pub image_id: String,
    pub caption: String,
}

/// Restores the configured checkpoint and greedily decodes one caption per
/// image of the validation and test sources.
///
/// Output goes to `<output_dir>/<checkpoint>_<split>.json`.
#[derive(Debug, Clone)]
pub struct GreedyInference {
    output_dir: PathBuf,
    max_len: usize,
}

impl GreedyInference {
    pub fn new(output_dir: impl Into<PathBuf>, max_len: usize) -> GreedyInference {
        GreedyInference { output_dir: output_dir.into(), max_len }
    }

    pub fn from_training(config: &TrainingConfiguration) -> GreedyInference {
        GreedyInference::new(config.output_dir.clone(), config.max_caption_length)
    }

    /// Token ids (without BOS/EOS) for every image of `batch`.
    fn decode_batch(&self, ctx: &mut TrainingContext, batch: &Batch) -> CaptionResult<Vec<Vec<usize>>> {
        let b = batch.len();
        if b == 0 {
            return Ok(Vec::new());
        }

        let cluster = if ctx.plan.uses_cluster_vectors() {
            let rows = batch
                .captions
                .iter()
                .zip(batch.image_ids.iter())
                .map(|(group, id)| {
                    group.first().and_then(|c| c.cluster_vector.clone()).ok_or_else(|| {
                        CaptionError::config(format!("image '{id}' has no cluster vector to condition on"))
                    })
                })
                .collect::<CaptionResult<Vec<_>>>()?;
            Some(Matrix::from_data(rows))
        } else {
            None
        };

        let bound = ctx.plan.bind(&batch.images, cluster.as_ref(), b)?;
        let (embedding, cluster_embedding) = ctx.model.encode(&bound, Phase::Eval)?;
        let anneal_step = ctx.global_step();

        let mut sequences = vec![vec![BOS]; b];
        let mut outputs = vec![Vec::new(); b];
        let mut finished = vec![false; b];

        for t in 1..=self.max_len {
            let lengths = vec![t; b];
            let out = ctx.model.decoder.forward(DecoderInput {
                embedding: &embedding,
                cluster_embedding: cluster_embedding.as_ref(),
                captions: &sequences,
                lengths: &lengths,
                anneal_step,
                phase: Phase::Eval,
            })?;

            for i in 0..b {
                let next = if finished[i] { PAD } else { argmax(out.logits.row(i * t + t - 1)) };
                if !finished[i] {
                    if next == EOS {
                        finished[i] = true;
                    } else {
                        outputs[i].push(next);
                    }
                }
                sequences[i].push(next);
            }
            if finished.iter().all(|&f| f) {
                break;
            }
        }

        Ok(outputs)
    }

    fn caption_split(
        &self,
        ctx: &mut TrainingContext,
        dictionary: &Dictionary,
        source: &mut dyn BatchSource,
    ) -> CaptionResult<Vec<GeneratedCaption>> {
        source.restart()?;
        let mut captions = Vec::new();
        while let Some(batch) = source.next_batch()? {
            let decoded = self.decode_batch(ctx, &batch)?;
            captions.extend(batch.image_ids.iter().zip(decoded.iter()).map(|(id, ids)| {
                GeneratedCaption { image_id: id.clone(), caption: dictionary.decode(ids) }
            }));
        }
        Ok(captions)
    }
}

impl Inference for GreedyInference {
    fn run(&mut self, ctx: InferenceContext<'_>) -> CaptionResult<InferenceReport> {
        let InferenceContext { training, dictionary, validation, test } = ctx;
        training.restore_checkpoint()?;
        fs::create_dir_all(&self.output_dir)?;

        let mut report = InferenceReport::default();
        for (split, source) in [("val", validation), ("test", test)] {
            let captions = self.caption_split(training, dictionary, source)?;
            let path = self
                .output_dir
                .join(format!("{}_{split}.json", training.config().checkpoint));
            let mut writer = BufWriter::new(fs::File::create(&path)?);
            serde_json::to_writer_pretty(&mut writer, &captions)?;
            writer.flush()?;

            tracing::info!(split, captions = captions.len(), path = %path.display(), "captions written");
            report.captions += captions.len();
            report.files.push(path);
        }
        Ok(report)
    }
}

/// Index of the maximum element in a slice.
fn argmax(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
