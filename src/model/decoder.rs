use rand::{rngs::StdRng, SeedableRng};

use crate::error::{CaptionError, CaptionResult};
use crate::layers::param::{Param, Parameters};
use crate::math::matrix::Matrix;
use crate::model::phase::Phase;
use crate::train::train_config::{PriorFamily, TrainingConfiguration};

/// Everything the decoder sees for one batch.
pub struct DecoderInput<'a> {
    /// Projected image embedding, `[rows, embed]`.
    pub embedding: &'a Matrix,
    /// Projected cluster vectors, `[rows, embed]`, when the run uses them.
    pub cluster_embedding: Option<&'a Matrix>,
    /// Padded teacher-forcing inputs, `[rows, T]`.
    pub captions: &'a [Vec<usize>],
    pub lengths: &'a [usize],
    /// Current training step; drives the latent-term weighting.
    pub anneal_step: u64,
    pub phase: Phase,
}

pub struct DecoderOutput {
    /// Per-timestep vocabulary logits, `[rows * T, vocab]`, example-major.
    pub logits: Matrix,
    /// Latent regularization already weighted for `anneal_step`.
    pub regularization: f64,
}

pub struct DecoderGradients {
    pub embedding: Matrix,
    pub cluster_embedding: Option<Matrix>,
}

/// Sequence decoder contract. `backward` takes ∂L/∂logits of the last
/// `forward`, adds the gradient of its own regularization term, and returns
/// the gradients w.r.t. its conditioning inputs.
pub trait Decoder: Parameters {
    fn vocab_size(&self) -> usize;

    fn forward(&mut self, input: DecoderInput<'_>) -> CaptionResult<DecoderOutput>;

    fn backward(&mut self, d_logits: &Matrix) -> CaptionResult<DecoderGradients>;
}

#[derive(Debug, Clone, Copy)]
pub struct LatentDecoderConfig {
    pub vocab_size: usize,
    pub embed_size: usize,
    pub hidden_size: usize,
    pub latent_size: usize,
    pub prior: PriorFamily,
    pub kl_anneal_steps: u64,
}

impl LatentDecoderConfig {
    pub fn from_training(config: &TrainingConfiguration, vocab_size: usize) -> LatentDecoderConfig {
        LatentDecoderConfig {
            vocab_size,
            embed_size: config.embed_size,
            hidden_size: config.decoder_hidden_size,
            latent_size: config.latent_size,
            prior: config.prior,
            kl_anneal_steps: config.kl_anneal_steps,
        }
    }
}

/// Conditional latent-variable caption decoder.
///
/// `z ~ N(mu(c), exp(logvar(c)))` with `c` the image (+ cluster)
/// embedding. Each step's hidden state is
/// `tanh(E[x_t] + c·W_c + z·W_z + b_h)` and logits are `h·W_o + b_o`.
/// The KL term against the prior is ramped in linearly over
/// `kl_anneal_steps`.
pub struct LatentDecoder {
    config: LatentDecoderConfig,
    token_embedding: Param,
    w_cond: Param,
    w_latent: Param,
    b_hidden: Param,
    w_mu: Param,
    b_mu: Param,
    w_logvar: Param,
    b_logvar: Param,
    w_out: Param,
    b_out: Param,
    /// Projects the cluster embedding to the prior mean (mixture priors).
    w_prior: Option<Param>,
    rng: StdRng,
    cache: Option<ForwardCache>,
}

struct ForwardCache {
    cond: Matrix,
    cluster: Option<Matrix>,
    mu: Matrix,
    logvar: Matrix,
    eps: Matrix,
    z: Matrix,
    prior_mean: Matrix,
    hidden: Matrix,
    captions: Vec<Vec<usize>>,
    lengths: Vec<usize>,
    timesteps: usize,
    kl_weight: f64,
}

impl LatentDecoder {
    pub fn new(config: LatentDecoderConfig, seed: u64) -> LatentDecoder {
        let mut rng = StdRng::seed_from_u64(seed);
        let (v, e, h, z) = (config.vocab_size, config.embed_size, config.hidden_size, config.latent_size);
        let p = |name: &str, value: Matrix| Param::new(format!("decoder/{name}"), value, true);

        LatentDecoder {
            token_embedding: p("token_embedding", Matrix::random(v, h, 0.1, &mut rng)),
            w_cond: p("w_cond", Matrix::xavier(e, h, &mut rng)),
            w_latent: p("w_latent", Matrix::xavier(z, h, &mut rng)),
            b_hidden: p("b_hidden", Matrix::zeros(1, h)),
            w_mu: p("w_mu", Matrix::xavier(e, z, &mut rng)),
            b_mu: p("b_mu", Matrix::zeros(1, z)),
            w_logvar: p("w_logvar", Matrix::xavier(e, z, &mut rng).scale(0.1)),
            b_logvar: p("b_logvar", Matrix::zeros(1, z)),
            w_out: p("w_out", Matrix::xavier(h, v, &mut rng)),
            b_out: p("b_out", Matrix::zeros(1, v)),
            w_prior: config
                .prior
                .needs_cluster_vectors()
                .then(|| p("w_prior", Matrix::xavier(e, z, &mut rng))),
            config,
            rng,
            cache: None,
        }
    }

    /// Linear ramp from 0 to 1 over `kl_anneal_steps`.
    pub fn kl_weight(&self, step: u64) -> f64 {
        (step as f64 / self.config.kl_anneal_steps.max(1) as f64).min(1.0)
    }

    fn check_input(&self, input: &DecoderInput<'_>) -> CaptionResult<usize> {
        let rows = input.embedding.rows;
        if input.embedding.cols != self.config.embed_size {
            return Err(CaptionError::Shape {
                slot: "decoder embedding",
                expected: self.config.embed_size.to_string(),
                actual: input.embedding.cols.to_string(),
            });
        }
        if input.captions.len() != rows || input.lengths.len() != rows {
            return Err(CaptionError::Shape {
                slot: "decoder captions",
                expected: format!("{rows} rows"),
                actual: format!("{} captions, {} lengths", input.captions.len(), input.lengths.len()),
            });
        }
        let timesteps = input.captions.first().map_or(0, Vec::len);
        if input.captions.iter().any(|c| c.len() != timesteps)
            || input.lengths.iter().any(|&l| l > timesteps)
        {
            return Err(CaptionError::config("decoder captions must be padded to one length"));
        }
        if let Some(&bad) = input.captions.iter().flatten().find(|&&t| t >= self.config.vocab_size) {
            return Err(CaptionError::config(format!("token {bad} outside vocabulary")));
        }
        Ok(timesteps)
    }
}

impl Parameters for LatentDecoder {
    fn params(&self) -> Vec<&Param> {
        let mut params = vec![
            &self.token_embedding, &self.w_cond, &self.w_latent, &self.b_hidden,
            &self.w_mu, &self.b_mu, &self.w_logvar, &self.b_logvar,
            &self.w_out, &self.b_out,
        ];
        params.extend(self.w_prior.as_ref());
        params
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![
            &mut self.token_embedding, &mut self.w_cond, &mut self.w_latent, &mut self.b_hidden,
            &mut self.w_mu, &mut self.b_mu, &mut self.w_logvar, &mut self.b_logvar,
            &mut self.w_out, &mut self.b_out,
        ];
        params.extend(self.w_prior.as_mut());
        params
    }
}

impl Decoder for LatentDecoder {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&mut self, input: DecoderInput<'_>) -> CaptionResult<DecoderOutput> {
        let timesteps = self.check_input(&input)?;
        let rows = input.embedding.rows;
        let latent = self.config.latent_size;

        let cond = match input.cluster_embedding {
            Some(c) if c.shape() == input.embedding.shape() => input.embedding.clone() + c.clone(),
            Some(c) => {
                return Err(CaptionError::Shape {
                    slot: "cluster embedding",
                    expected: format!("{:?}", input.embedding.shape()),
                    actual: format!("{:?}", c.shape()),
                })
            }
            None => input.embedding.clone(),
        };

        let prior_mean = match (&self.w_prior, input.cluster_embedding) {
            (Some(w), Some(c)) => c * &w.value,
            (Some(_), None) => {
                return Err(CaptionError::config(format!(
                    "prior {:?} needs a cluster embedding",
                    self.config.prior
                )))
            }
            (None, _) => Matrix::zeros(rows, latent),
        };

        let mu = (&cond * &self.w_mu.value).add_row(&self.b_mu.value);
        let logvar = (&cond * &self.w_logvar.value).add_row(&self.b_logvar.value);
        let eps = match input.phase {
            Phase::Train => Matrix::standard_normal(rows, latent, &mut self.rng),
            Phase::Eval => Matrix::zeros(rows, latent),
        };
        let sigma = logvar.map(|l| (0.5 * l).exp());
        let z = mu.clone() + sigma.hadamard(&eps);

        let ctx = ((&cond * &self.w_cond.value) + (&z * &self.w_latent.value))
            .add_row(&self.b_hidden.value);

        let mut hidden = Matrix::zeros(rows * timesteps, self.config.hidden_size);
        for b in 0..rows {
            for t in 0..input.lengths[b] {
                let token = input.captions[b][t];
                let out = &mut hidden.data[b * timesteps + t];
                for ((h, c), e) in out.iter_mut()
                    .zip(ctx.data[b].iter())
                    .zip(self.token_embedding.value.data[token].iter())
                {
                    *h = (c + e).tanh();
                }
            }
        }
        let logits = (&hidden * &self.w_out.value).add_row(&self.b_out.value);

        let kl: f64 = (0..rows)
            .map(|b| {
                (0..latent)
                    .map(|j| {
                        let lv = logvar.data[b][j];
                        let diff = mu.data[b][j] - prior_mean.data[b][j];
                        0.5 * (lv.exp() + diff * diff - 1.0 - lv)
                    })
                    .sum::<f64>()
            })
            .sum::<f64>()
            / rows.max(1) as f64;
        let kl_weight = self.kl_weight(input.anneal_step);

        self.cache = Some(ForwardCache {
            cond,
            cluster: input.cluster_embedding.cloned(),
            mu,
            logvar,
            eps,
            z,
            prior_mean,
            hidden,
            captions: input.captions.to_vec(),
            lengths: input.lengths.to_vec(),
            timesteps,
            kl_weight,
        });

        Ok(DecoderOutput { logits, regularization: kl_weight * kl })
    }

    fn backward(&mut self, d_logits: &Matrix) -> CaptionResult<DecoderGradients> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| CaptionError::config("decoder backward called before forward"))?;
        let rows = cache.cond.rows;
        let timesteps = cache.timesteps;
        if d_logits.shape() != (rows * timesteps, self.config.vocab_size) {
            return Err(CaptionError::Shape {
                slot: "logit gradients",
                expected: format!("[{}, {}]", rows * timesteps, self.config.vocab_size),
                actual: format!("{:?}", d_logits.shape()),
            });
        }

        // Output projection.
        self.w_out.accumulate(&(&cache.hidden.transpose() * d_logits));
        self.b_out.accumulate(&d_logits.sum_rows());
        let d_hidden = d_logits * &self.w_out.value.transpose();

        // Recurrent-free per-step cell; positions past a sequence's length
        // were never computed and get no gradient.
        let mut d_ctx = Matrix::zeros(rows, self.config.hidden_size);
        let mut d_tokens = Matrix::zeros(self.config.vocab_size, self.config.hidden_size);
        for b in 0..rows {
            for t in 0..cache.lengths[b] {
                let r = b * timesteps + t;
                let token = cache.captions[b][t];
                for j in 0..self.config.hidden_size {
                    let h = cache.hidden.data[r][j];
                    let d_pre = d_hidden.data[r][j] * (1.0 - h * h);
                    d_tokens.data[token][j] += d_pre;
                    d_ctx.data[b][j] += d_pre;
                }
            }
        }
        self.token_embedding.accumulate(&d_tokens);

        let cond_t = cache.cond.transpose();
        self.w_cond.accumulate(&(&cond_t * &d_ctx));
        self.w_latent.accumulate(&(&cache.z.transpose() * &d_ctx));
        self.b_hidden.accumulate(&d_ctx.sum_rows());
        let mut d_cond = &d_ctx * &self.w_cond.value.transpose();
        let d_z = &d_ctx * &self.w_latent.value.transpose();

        // Reparameterization plus the weighted KL term (mean over rows).
        let scale = cache.kl_weight / rows.max(1) as f64;
        let diff = cache.mu.clone() - cache.prior_mean.clone();
        let d_mu = d_z.clone() + diff.scale(scale);
        let half_sigma = cache.logvar.map(|l| 0.5 * (0.5 * l).exp());
        let d_logvar = d_z.hadamard(&cache.eps).hadamard(&half_sigma)
            + cache.logvar.map(|l| scale * 0.5 * (l.exp() - 1.0));

        self.w_mu.accumulate(&(&cond_t * &d_mu));
        self.b_mu.accumulate(&d_mu.sum_rows());
        self.w_logvar.accumulate(&(&cond_t * &d_logvar));
        self.b_logvar.accumulate(&d_logvar.sum_rows());
        d_cond.add_assign(&(&d_mu * &self.w_mu.value.transpose()));
        d_cond.add_assign(&(&d_logvar * &self.w_logvar.value.transpose()));

        let cluster_embedding = match &cache.cluster {
            Some(cluster) => {
                let mut d_cluster = d_cond.clone();
                if let Some(w_prior) = self.w_prior.as_mut() {
                    let d_prior = diff.scale(-scale);
                    w_prior.accumulate(&(&cluster.transpose() * &d_prior));
                    d_cluster.add_assign(&(&d_prior * &w_prior.value.transpose()));
                }
                Some(d_cluster)
            }
            None => None,
        };

        Ok(DecoderGradients { embedding: d_cond, cluster_embedding })
    }
}
