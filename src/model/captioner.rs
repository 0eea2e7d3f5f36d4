use rand::{rngs::StdRng, SeedableRng};

use crate::activation::activation::ActivationFunction;
use crate::data::captions::CaptionTensors;
use crate::error::{CaptionError, CaptionResult};
use crate::layers::dense::Layer;
use crate::layers::param::{Param, Parameters};
use crate::math::matrix::Matrix;
use crate::model::decoder::{Decoder, DecoderInput};
use crate::model::extractor::FeatureExtractor;
use crate::model::features::FeaturePipeline;
use crate::model::input_plan::BoundInputs;
use crate::model::phase::Phase;

/// Output of one forward pass through the whole captioner.
pub struct ForwardPass {
    pub logits: Matrix,
    /// Decoder latent term plus extractor weight decay.
    pub regularization: f64,
}

/// Extractor, embedding projections and decoder wired together.
pub struct Captioner {
    pub extractor: Box<dyn FeatureExtractor>,
    pub pipeline: FeaturePipeline,
    /// Image features → decoder embedding space (`imf_emb`).
    pub image_projection: Layer,
    /// Cluster vectors → decoder embedding space (`cv_emb`).
    pub cluster_projection: Option<Layer>,
    pub decoder: Box<dyn Decoder>,
    images_in_batch: usize,
}

impl Captioner {
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        decoder: Box<dyn Decoder>,
        pipeline: FeaturePipeline,
        embed_size: usize,
        cluster_width: Option<usize>,
        seed: u64,
    ) -> Captioner {
        let mut rng = StdRng::seed_from_u64(seed);
        let image_projection = Layer::new(
            "imf_emb",
            embed_size,
            extractor.feature_size(),
            ActivationFunction::Identity,
            true,
            &mut rng,
        );
        let cluster_projection = cluster_width.map(|width| {
            Layer::new("cv_emb", embed_size, width, ActivationFunction::Identity, true, &mut rng)
        });
        Captioner {
            extractor,
            pipeline,
            image_projection,
            cluster_projection,
            decoder,
            images_in_batch: 0,
        }
    }

    /// Image (and cluster) embeddings for every caption row.
    pub fn encode(
        &mut self,
        inputs: &BoundInputs,
        phase: Phase,
    ) -> CaptionResult<(Matrix, Option<Matrix>)> {
        let features = self.pipeline.features(self.extractor.as_mut(), &inputs.images, phase)?;
        self.images_in_batch = features.rows;
        let expanded = self.pipeline.expand(&features);
        let embedding = self.image_projection.feed_from(&expanded);

        let cluster = match (&mut self.cluster_projection, inputs.cluster.live()) {
            (Some(projection), Some(cv)) => Some(projection.feed_from(cv)),
            _ => None,
        };
        Ok((embedding, cluster))
    }

    pub fn forward(
        &mut self,
        inputs: &BoundInputs,
        captions: &CaptionTensors,
        anneal_step: u64,
        phase: Phase,
    ) -> CaptionResult<ForwardPass> {
        let (embedding, cluster) = self.encode(inputs, phase)?;
        if embedding.rows != captions.rows() {
            return Err(CaptionError::Shape {
                slot: "caption rows",
                expected: format!("{} (images × captions per image)", embedding.rows),
                actual: captions.rows().to_string(),
            });
        }

        let out = self.decoder.forward(DecoderInput {
            embedding: &embedding,
            cluster_embedding: cluster.as_ref(),
            captions: &captions.decoder_inputs,
            lengths: &captions.lengths,
            anneal_step,
            phase,
        })?;

        Ok(ForwardPass {
            logits: out.logits,
            regularization: out.regularization + self.extractor.regularization_loss(),
        })
    }

    /// Backpropagates ∂L/∂logits of the last forward pass. The extractor
    /// only receives gradients when `train_extractor` is set.
    pub fn backward(&mut self, d_logits: &Matrix, train_extractor: bool) -> CaptionResult<()> {
        let grads = self.decoder.backward(d_logits)?;

        if let (Some(projection), Some(d_cluster)) =
            (self.cluster_projection.as_mut(), grads.cluster_embedding.as_ref())
        {
            projection.backward(d_cluster);
        }

        let d_features = self.image_projection.backward(&grads.embedding);
        if train_extractor && self.pipeline.feeds_extractor() {
            let d_images = self.pipeline.collapse(&d_features, self.images_in_batch);
            self.extractor.backward(&d_images)?;
        }
        Ok(())
    }

    /// Decoder, image projection and cluster projection.
    pub fn primary_params(&self) -> Vec<&Param> {
        let mut params = self.image_projection.params();
        if let Some(projection) = &self.cluster_projection {
            params.extend(projection.params());
        }
        params.extend(self.decoder.params());
        params
    }

    /// Split borrow of both update groups: (primary, extractor).
    pub fn param_groups_mut(&mut self) -> (Vec<&mut Param>, Vec<&mut Param>) {
        let mut primary = self.image_projection.params_mut();
        if let Some(projection) = self.cluster_projection.as_mut() {
            primary.extend(projection.params_mut());
        }
        primary.extend(self.decoder.params_mut());
        (primary, self.extractor.params_mut())
    }

    /// Parameters persisted in a checkpoint.
    ///
    /// Every trainable parameter is saved. Extractor parameters are added
    /// wholesale unless both extractor groups are trainable, so frozen
    /// pretrained weights survive a resume.
    pub fn checkpoint_params(&self, extractor_fully_trainable: bool) -> Vec<&Param> {
        let mut params = self.primary_params();
        params.extend(
            self.extractor
                .params()
                .into_iter()
                .filter(|p| p.trainable || !extractor_fully_trainable),
        );
        params
    }

    pub fn checkpoint_params_mut(&mut self, extractor_fully_trainable: bool) -> Vec<&mut Param> {
        let (mut primary, extractor) = self.param_groups_mut();
        primary.extend(extractor.into_iter().filter(|p| p.trainable || !extractor_fully_trainable));
        primary
    }
}
