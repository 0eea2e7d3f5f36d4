/// Whether a forward pass belongs to a gradient step or to evaluation.
///
/// Stochastic pieces (dropout, latent sampling) are active only in `Train`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}
