//! Transformer blocks for image-like data
//!
//! `SpatialTransformer` projects a `(b, c, h, w)` feature map to a token
//! sequence `(b, h * w, inner)`, runs a stack of `BasicTransformerBlock`s on it
//! and projects back. `proj_out` starts at zero, so a freshly built transformer
//! is the identity.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn as nn;

use super::attention::{build_attention, AttentionLayer};
use super::checkpoint::{self, Checkpointed};
use super::feed_forward::FeedForward;
use super::projection::{ConceptInjection, ProjectionBuilder};
use super::util::{layer_norm, normalize, zero_conv2d, zero_linear, LayerNorm};
use crate::config::{AttentionConfig, SpatialTransformerConfig};
use crate::error::{InfusionError, Result};

/// One optional value shared by every block, or one per block
#[derive(Debug, Clone)]
pub enum PerBlock<T> {
    Shared(Option<T>),
    Each(Vec<Option<T>>),
}

impl<T> Default for PerBlock<T> {
    fn default() -> Self {
        PerBlock::Shared(None)
    }
}

impl<T> PerBlock<T> {
    pub fn none() -> Self {
        PerBlock::Shared(None)
    }

    pub fn shared(value: T) -> Self {
        PerBlock::Shared(Some(value))
    }

    pub fn each(values: Vec<Option<T>>) -> Self {
        PerBlock::Each(values)
    }

    pub fn for_block(&self, index: usize) -> Option<&T> {
        match self {
            PerBlock::Shared(value) => value.as_ref(),
            PerBlock::Each(values) => values.get(index).and_then(Option::as_ref),
        }
    }

    fn check_depth(&self, depth: usize, what: &str) -> Result<()> {
        match self {
            PerBlock::Each(values) if values.len() != depth => Err(InfusionError::Conditioning(
                format!("{} {} values given for {} blocks", values.len(), what, depth),
            )),
            _ => Ok(()),
        }
    }
}

/// Self-attention, cross-attention and feed-forward, each with a residual
pub struct BasicTransformerBlock {
    attn1: Box<dyn AttentionLayer>,
    attn2: Box<dyn AttentionLayer>,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    disable_self_attn: bool,
    checkpoint: bool,
    training: bool,
}

impl BasicTransformerBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        dim: usize,
        n_heads: usize,
        d_head: usize,
        dropout: f32,
        context_dim: Option<usize>,
        gated_ff: bool,
        checkpoint: bool,
        disable_self_attn: bool,
        attention: &AttentionConfig,
        projections: &dyn ProjectionBuilder,
    ) -> Result<Self> {
        // attn1 is a self-attention unless disable_self_attn
        let attn1 = build_attention(
            vs.pp("attn1"),
            dim,
            if disable_self_attn { context_dim } else { None },
            n_heads,
            d_head,
            dropout,
            attention,
            projections,
        )?;
        let attn2 = build_attention(
            vs.pp("attn2"),
            dim,
            context_dim,
            n_heads,
            d_head,
            dropout,
            attention,
            projections,
        )?;
        let ff = FeedForward::new(vs.pp("ff"), dim, None, 4, gated_ff, dropout)?;
        let norm1 = layer_norm(dim, 1e-5, vs.pp("norm1"))?;
        let norm2 = layer_norm(dim, 1e-5, vs.pp("norm2"))?;
        let norm3 = layer_norm(dim, 1e-5, vs.pp("norm3"))?;

        Ok(Self {
            attn1,
            attn2,
            ff,
            norm1,
            norm2,
            norm3,
            disable_self_attn,
            checkpoint,
            training: false,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.attn1.set_training(training);
        self.attn2.set_training(training);
    }

    /// Stays attached to the graph in every mode. Callers that want to drop
    /// the activations of a block between forward and backward drive
    /// [`Self::checkpoint_segment`] themselves.
    pub fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        injection: &ConceptInjection,
    ) -> Result<Tensor> {
        checkpoint::run(
            |xs| self.forward_body(xs, context, injection),
            xs,
            self.checkpoint && self.training,
        )
    }

    pub fn checkpoint_segment<'a>(
        &'a self,
        xs: &Tensor,
        context: Option<&'a Tensor>,
        injection: &'a ConceptInjection,
    ) -> Checkpointed<impl Fn(&Tensor) -> Result<Tensor> + 'a> {
        Checkpointed::new(move |xs: &Tensor| self.forward_body(xs, context, injection), xs)
    }

    /// The pure forward computation, safe to evaluate twice
    pub fn forward_body(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        injection: &ConceptInjection,
    ) -> Result<Tensor> {
        let self_injection;
        let (context1, injection1) = if self.disable_self_attn {
            (context, injection)
        } else {
            self_injection = injection.without_concept_tokens();
            (None, &self_injection)
        };

        let residual = xs;
        let xs = self.norm1.forward(xs)?;
        let xs = (self.attn1.forward(&xs, context1, None, injection1)? + residual)?;

        let residual = &xs;
        let xs_norm = self.norm2.forward(&xs)?;
        let xs = (self.attn2.forward(&xs_norm, context, None, injection)? + residual)?;

        let residual = &xs;
        let xs_norm = self.norm3.forward(&xs)?;
        let xs = self.ff.forward_t(&xs_norm, self.training)?;
        Ok((xs + residual)?)
    }
}

/// Projection layer type
enum Proj {
    Conv2d(nn::Conv2d),
    Linear(nn::Linear),
}

impl Module for Proj {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Proj::Conv2d(conv) => conv.forward(xs),
            Proj::Linear(linear) => linear.forward(xs),
        }
    }
}

/// Transformer block for image-like data.
/// Project the input, reshape to `(b, t, d)`, apply the blocks, reshape back.
/// `use_linear` swaps the 1x1 convolutions for linear projections.
pub struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Proj,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Proj,
}

impl SpatialTransformer {
    pub fn new(
        vs: nn::VarBuilder,
        config: SpatialTransformerConfig,
        attention: &AttentionConfig,
        projections: &dyn ProjectionBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let in_channels = config.in_channels;
        let inner_dim = config.inner_dim();

        let norm = normalize(in_channels, config.num_groups, vs.pp("norm"))?;

        let proj_in = if config.use_linear {
            Proj::Linear(nn::linear(in_channels, inner_dim, vs.pp("proj_in"))?)
        } else {
            Proj::Conv2d(nn::conv2d(
                in_channels,
                inner_dim,
                1,
                Default::default(),
                vs.pp("proj_in"),
            )?)
        };

        let vs_tb = vs.pp("transformer_blocks");
        let mut transformer_blocks = Vec::with_capacity(config.depth);
        for index in 0..config.depth {
            let context_dim = config.context_dim.as_ref().and_then(|dims| dims.for_block(index));
            transformer_blocks.push(BasicTransformerBlock::new(
                vs_tb.pp(index.to_string()),
                inner_dim,
                config.n_heads,
                config.d_head,
                config.dropout,
                context_dim,
                config.gated_ff,
                config.use_checkpoint,
                config.disable_self_attn,
                attention,
                projections,
            )?);
        }

        let proj_out = if config.use_linear {
            Proj::Linear(zero_linear(inner_dim, in_channels, vs.pp("proj_out"))?)
        } else {
            Proj::Conv2d(zero_conv2d(inner_dim, in_channels, vs.pp("proj_out"))?)
        };

        Ok(Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        for block in self.transformer_blocks.iter_mut() {
            block.set_training(training);
        }
    }

    /// Without a context every block self-attends in both stages.
    ///
    /// Per-block `concept_token_idx` values replace `injection.concept_token_idx`;
    /// a block with none falls back to the injection's own indices.
    pub fn forward(
        &self,
        xs: &Tensor,
        context: &PerBlock<Tensor>,
        concept_token_idx: &PerBlock<Vec<usize>>,
        injection: &ConceptInjection,
    ) -> Result<Tensor> {
        let depth = self.depth();
        context.check_depth(depth, "context")?;
        concept_token_idx.check_depth(depth, "concept_token_idx")?;

        let (batch, channel, height, width) = xs.dims4()?;
        let residual = xs;

        let xs = self.norm.forward(xs)?;
        let mut xs = match &self.proj_in {
            Proj::Conv2d(_) => {
                let xs = self.proj_in.forward(&xs)?;
                let inner_dim = xs.dim(1)?;
                xs.permute((0, 2, 3, 1))?
                    .reshape((batch, height * width, inner_dim))?
            }
            Proj::Linear(_) => {
                let xs = xs
                    .permute((0, 2, 3, 1))?
                    .reshape((batch, height * width, channel))?;
                self.proj_in.forward(&xs)?
            }
        };

        for (index, block) in self.transformer_blocks.iter().enumerate() {
            let block_injection = injection.with_concept_token_idx(
                concept_token_idx
                    .for_block(index)
                    .or(injection.concept_token_idx.as_ref())
                    .cloned(),
            );
            xs = block.forward(&xs, context.for_block(index), &block_injection)?;
        }

        let xs = match &self.proj_out {
            Proj::Conv2d(_) => {
                let inner_dim = xs.dim(2)?;
                let xs = xs
                    .reshape((batch, height, width, inner_dim))?
                    .permute((0, 3, 1, 2))?;
                self.proj_out.forward(&xs)?
            }
            Proj::Linear(_) => {
                let xs = self.proj_out.forward(&xs)?;
                xs.reshape((batch, height, width, channel))?
                    .permute((0, 3, 1, 2))?
            }
        };

        Ok((xs + residual)?)
    }

    /// Get the number of transformer blocks
    pub fn depth(&self) -> usize {
        self.transformer_blocks.len()
    }
}
