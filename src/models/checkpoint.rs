//! Gradient checkpointing for transformer blocks
//!
//! candle records every op of a forward pass in the graph, so saving memory
//! means splitting a segment in two phases: a forward on a detached input that
//! keeps nothing, and a recompute with the graph attached when the gradient of
//! that segment is needed. `run` only ever hands out attached tensors, so an
//! ordinary `backward()` on a model output reaches every parameter.

use candle_core::backprop::GradStore;
use candle_core::Tensor;

use crate::error::Result;

/// A forward body and the input it was first run on
pub struct Checkpointed<F>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    body: F,
    input: Tensor,
}

impl<F> Checkpointed<F>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    pub fn new(body: F, input: &Tensor) -> Self {
        Self {
            body,
            input: input.clone(),
        }
    }

    /// Output values only; no activation of the segment stays referenced
    pub fn forward(&self) -> Result<Tensor> {
        Ok((self.body)(&self.input.detach())?.detach())
    }

    /// Same computation with the graph attached to the original input
    pub fn recompute(&self) -> Result<Tensor> {
        (self.body)(&self.input)
    }

    /// Recompute the segment and backpropagate `grad_output` through it
    pub fn backward(&self, grad_output: &Tensor) -> Result<GradStore> {
        let output = self.recompute()?;
        Ok((output * grad_output.detach())?.sum_all()?.backward()?)
    }
}

/// Run `body` on `input`, through a checkpointed segment when `enabled`.
/// The result stays attached to `input` and to the parameters of `body`.
pub fn run<F>(body: F, input: &Tensor, enabled: bool) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    if enabled {
        Checkpointed::new(body, input).recompute()
    } else {
        body(input)
    }
}
