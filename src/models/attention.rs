//! Cross-attention with concept-injected key/value projections
//!
//! Two implementations share the projection stage:
//! `CrossAttention` computes the similarity matrix explicitly and supports
//! masks, `MemoryEfficientCrossAttention` runs the batched kernel and splits a
//! doubled batch into an original and a "super" branch when a context is given.
//! Which one a block uses is decided once, from `AttentionConfig::mode`.

use candle_core::{DType, Module, Tensor, D};
use candle_nn as nn;
use log::debug;

use super::kernel::memory_efficient_attention;
use super::projection::{
    ConceptInjection, ContextProjection, ProjectionArgs, ProjectionBuilder, ProjectionRole,
};
use super::util::max_neg_value;
use crate::config::{AttentionConfig, AttentionMode, AttnPrecision, KernelOp};
use crate::error::{InfusionError, Result};

/// Common interface of both attention implementations
pub trait AttentionLayer: Send + Sync {
    /// `xs`: `(b, n, query_dim)`, `context`: `(b, m, context_dim)`, `None` for self-attention.
    fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        injection: &ConceptInjection,
    ) -> Result<Tensor>;

    fn set_training(&mut self, training: bool);
}

/// Build the attention layer selected by `config.mode`
#[allow(clippy::too_many_arguments)]
pub fn build_attention(
    vs: nn::VarBuilder,
    query_dim: usize,
    context_dim: Option<usize>,
    heads: usize,
    dim_head: usize,
    dropout: f32,
    config: &AttentionConfig,
    projections: &dyn ProjectionBuilder,
) -> Result<Box<dyn AttentionLayer>> {
    let layer: Box<dyn AttentionLayer> = match config.mode {
        AttentionMode::Softmax => Box::new(CrossAttention::new(
            vs,
            query_dim,
            context_dim,
            heads,
            dim_head,
            dropout,
            config.precision,
            projections,
        )?),
        AttentionMode::SoftmaxXformers => Box::new(MemoryEfficientCrossAttention::new(
            vs,
            query_dim,
            context_dim,
            heads,
            dim_head,
            dropout,
            config.kernel,
            projections,
        )?),
    };
    Ok(layer)
}

enum KeyValue {
    /// Self-attention layers project with plain linears
    Plain { to_k: nn::Linear, to_v: nn::Linear },
    /// Cross-attention layers delegate to the context projection
    Context {
        to_k: Box<dyn ContextProjection>,
        to_v: Box<dyn ContextProjection>,
    },
}

/// Projection stage shared by both attention implementations
struct Projections {
    to_q: nn::Linear,
    kv: KeyValue,
    to_out: nn::Linear,
    dropout: nn::Dropout,
    heads: usize,
    training: bool,
}

impl Projections {
    #[allow(clippy::too_many_arguments)]
    fn new(
        vs: &nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        dropout: f32,
        projections: &dyn ProjectionBuilder,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let to_q = nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_q"))?;
        let kv = match context_dim {
            None => KeyValue::Plain {
                to_k: nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_k"))?,
                to_v: nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_v"))?,
            },
            Some(context_dim) => KeyValue::Context {
                to_k: projections.build(context_dim, inner_dim, ProjectionRole::Key, vs.pp("to_k"))?,
                to_v: projections.build(context_dim, inner_dim, ProjectionRole::Value, vs.pp("to_v"))?,
            },
        };
        let to_out = nn::linear(inner_dim, query_dim, vs.pp("to_out").pp("0"))?;

        Ok(Self {
            to_q,
            kv,
            to_out,
            dropout: nn::Dropout::new(dropout),
            heads,
            training: false,
        })
    }

    fn query_key_value(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        injection: &ConceptInjection,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let q = self.to_q.forward(xs)?;
        let (k, v) = match (&self.kv, context) {
            (KeyValue::Plain { to_k, to_v }, context) => {
                let source = context.unwrap_or(xs);
                (to_k.forward(source)?, to_v.forward(source)?)
            }
            (KeyValue::Context { to_k, to_v }, Some(context)) => {
                let k = to_k.project(context, &injection.projection_args(ProjectionRole::Key))?;
                let v = to_v.project(context, &injection.projection_args(ProjectionRole::Value))?;
                (k, v)
            }
            (KeyValue::Context { to_k, to_v }, None) => {
                let args = ProjectionArgs::default();
                (to_k.project(xs, &args)?, to_v.project(xs, &args)?)
            }
        };
        Ok((q, k, v))
    }

    /// `(b, n, h * d)` -> `(b * h, n, d)`
    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        Ok(xs
            .reshape((batch_size, seq_len, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .reshape((batch_size * self.heads, seq_len, dim / self.heads))?)
    }

    /// `(b * h, n, d)` -> `(b, n, h * d)`
    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        Ok(xs
            .reshape((batch_size / self.heads, self.heads, seq_len, dim))?
            .transpose(1, 2)?
            .reshape((batch_size / self.heads, seq_len, dim * self.heads))?)
    }

    fn output(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.to_out.forward(xs)?;
        Ok(self.dropout.forward(&xs, self.training)?)
    }
}

/// Reference attention: explicit similarity, optional mask, softmax
pub struct CrossAttention {
    proj: Projections,
    scale: f64,
    precision: AttnPrecision,
}

impl CrossAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        dropout: f32,
        precision: AttnPrecision,
        projections: &dyn ProjectionBuilder,
    ) -> Result<Self> {
        debug!(
            "Setting up CrossAttention. Query dim is {}, context_dim is {:?} and using {} heads.",
            query_dim, context_dim, heads
        );
        let proj = Projections::new(&vs, query_dim, context_dim, heads, dim_head, dropout, projections)?;
        Ok(Self {
            proj,
            scale: 1.0 / f64::sqrt(dim_head as f64),
            precision,
        })
    }

    fn attention(&self, query: &Tensor, key: &Tensor, value: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let sim = match self.precision {
            AttnPrecision::Fp32 => {
                let query = query.to_dtype(DType::F32)?;
                let key = key.to_dtype(DType::F32)?;
                query.matmul(&key.t()?)?
            }
            AttnPrecision::Ambient => query.matmul(&key.t()?)?,
        };
        let sim = (sim * self.scale)?;
        let sim = match mask {
            Some(mask) => self.apply_mask(&sim, mask)?,
            None => sim,
        };

        // softmax_last_dim is forward-only
        let probs = nn::ops::softmax(&sim, D::Minus1)?;
        Ok(probs.to_dtype(value.dtype())?.matmul(value)?)
    }

    /// `mask`: `(b, ...)` flattened to `(b, j)`; false entries get the lowest finite score
    fn apply_mask(&self, sim: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let heads = self.proj.heads;
        let batch = mask.dim(0)?;
        let mask = mask.flatten_from(1)?.to_dtype(DType::U8)?;
        let keys = mask.dim(1)?;
        let mask = mask
            .unsqueeze(1)?
            .broadcast_as((batch, heads, keys))?
            .reshape((batch * heads, 1, keys))?
            .broadcast_as(sim.shape())?
            .contiguous()?;
        let neg = Tensor::full(max_neg_value(sim.dtype()), sim.shape(), sim.device())?
            .to_dtype(sim.dtype())?;
        Ok(mask.where_cond(sim, &neg)?)
    }
}

impl AttentionLayer for CrossAttention {
    fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        injection: &ConceptInjection,
    ) -> Result<Tensor> {
        let (q, k, v) = self.proj.query_key_value(xs, context, injection)?;
        let q = self.proj.reshape_heads_to_batch_dim(&q)?;
        let k = self.proj.reshape_heads_to_batch_dim(&k)?;
        let v = self.proj.reshape_heads_to_batch_dim(&v)?;

        let out = self.attention(&q, &k, &v, mask)?;
        let out = self.proj.reshape_batch_dim_to_heads(&out)?;
        self.proj.output(&out)
    }

    fn set_training(&mut self, training: bool) {
        self.proj.training = training;
    }
}

/// Batched-kernel attention with the original / super branch split
pub struct MemoryEfficientCrossAttention {
    proj: Projections,
    op: KernelOp,
}

impl MemoryEfficientCrossAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        dropout: f32,
        op: KernelOp,
        projections: &dyn ProjectionBuilder,
    ) -> Result<Self> {
        debug!(
            "Setting up MemoryEfficientCrossAttention. Query dim is {}, context_dim is {:?} and using {} heads.",
            query_dim, context_dim, heads
        );
        let proj = Projections::new(&vs, query_dim, context_dim, heads, dim_head, dropout, projections)?;
        Ok(Self {
            proj,
            op: op.resolve(),
        })
    }

    /// The batch holds `[original; super]`. Both branches attend with the
    /// original half's queries: `[attn(q1, k1, v1); attn(q1, k2, v2)]`.
    fn dual_branch(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let batch = q.dim(0)?;
        if batch % 2 != 0 {
            return Err(InfusionError::Shape(format!(
                "dual-branch attention needs an even batch, got {batch}"
            )));
        }
        let half = batch / 2;
        let q1 = self.proj.reshape_heads_to_batch_dim(&q.narrow(0, 0, half)?)?;
        let k1 = self.proj.reshape_heads_to_batch_dim(&k.narrow(0, 0, half)?)?;
        let v1 = self.proj.reshape_heads_to_batch_dim(&v.narrow(0, 0, half)?)?;
        let k2 = self.proj.reshape_heads_to_batch_dim(&k.narrow(0, half, half)?)?;
        let v2 = self.proj.reshape_heads_to_batch_dim(&v.narrow(0, half, half)?)?;

        let original = memory_efficient_attention(&q1, &k1, &v1, None, self.op)?;
        let superposed = memory_efficient_attention(&q1, &k2, &v2, None, self.op)?;
        Ok(Tensor::cat(&[&original, &superposed], 0)?)
    }
}

impl AttentionLayer for MemoryEfficientCrossAttention {
    fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        injection: &ConceptInjection,
    ) -> Result<Tensor> {
        if mask.is_some() {
            return Err(InfusionError::NotImplemented(
                "attention masks on the memory-efficient attention path",
            ));
        }

        let (q, k, v) = self.proj.query_key_value(xs, context, injection)?;
        let out = match context {
            Some(_) => self.dual_branch(&q, &k, &v)?,
            None => {
                let q = self.proj.reshape_heads_to_batch_dim(&q)?;
                let k = self.proj.reshape_heads_to_batch_dim(&k)?;
                let v = self.proj.reshape_heads_to_batch_dim(&v)?;
                memory_efficient_attention(&q, &k, &v, None, self.op)?
            }
        };
        let out = self.proj.reshape_batch_dim_to_heads(&out)?;
        self.proj.output(&out)
    }

    fn set_training(&mut self, training: bool) {
        self.proj.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::projection::testing::RecordingBuilder;
    use crate::models::projection::LinearProjectionBuilder;
    use candle_core::{Device, IndexOp};

    fn varmap_vb(varmap: &nn::VarMap) -> nn::VarBuilder<'static> {
        nn::VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
    }

    fn softmax_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        Ok(nn::ops::softmax_last_dim(&scores)?.matmul(v)?)
    }

    #[test]
    fn self_attention_shapes_match_across_paths() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let vb = varmap_vb(&varmap);
        let reference = CrossAttention::new(
            vb.pp("attn"), 32, None, 4, 8, 0.0, AttnPrecision::Fp32, &LinearProjectionBuilder,
        )?;
        // same prefix, so both layers read the same variables
        let efficient = MemoryEfficientCrossAttention::new(
            vb.pp("attn"), 32, None, 4, 8, 0.0, KernelOp::Chunked { block_size: 5 }, &LinearProjectionBuilder,
        )?;

        let xs = Tensor::randn(0f32, 1f32, (3, 11, 32), &device)?;
        let injection = ConceptInjection::default();
        let a = reference.forward(&xs, None, None, &injection)?;
        let b = efficient.forward(&xs, None, None, &injection)?;
        assert_eq!(a.dims(), &[3, 11, 32]);
        assert_eq!(b.dims(), &[3, 11, 32]);
        assert!(max_diff(&a, &b)? < 1e-4);
        Ok(())
    }

    #[test]
    fn reference_path_trains_every_projection() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let attn = CrossAttention::new(
            varmap_vb(&varmap), 16, Some(12), 2, 8, 0.0, AttnPrecision::Fp32, &LinearProjectionBuilder,
        )?;
        let xs = Tensor::randn(0f32, 1f32, (2, 6, 16), &device)?;
        let context = Tensor::randn(0f32, 1f32, (2, 5, 12), &device)?;

        let ys = attn.forward(&xs, Some(&context), None, &ConceptInjection::default())?;
        let grads = ys.sqr()?.sum_all()?.backward()?;

        let data = varmap.data().lock().unwrap();
        for name in ["to_q.weight", "to_k.weight", "to_v.weight", "to_out.0.weight", "to_out.0.bias"] {
            let grad = grads
                .get(data[name].as_tensor())
                .unwrap_or_else(|| panic!("{name} has no gradient"));
            assert!(grad.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0, "{name}");
        }
        Ok(())
    }

    #[test]
    fn masked_keys_get_no_weight() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let attn = CrossAttention::new(
            varmap_vb(&varmap), 16, Some(12), 2, 8, 0.0, AttnPrecision::Fp32, &LinearProjectionBuilder,
        )?;
        let injection = ConceptInjection::default();

        let xs = Tensor::randn(0f32, 1f32, (2, 6, 16), &device)?;
        let context = Tensor::randn(0f32, 1f32, (2, 5, 12), &device)?;
        let mask = Tensor::new(&[[1u8, 1, 0, 1, 1], [1, 1, 0, 1, 1]], &device)?;

        // perturb the masked key/value position only
        let noise = (Tensor::randn(0f32, 1f32, (2, 1, 12), &device)? * 10.0)?;
        let perturbed = Tensor::cat(
            &[
                context.narrow(1, 0, 2)?,
                (context.narrow(1, 2, 1)? + &noise)?,
                context.narrow(1, 3, 2)?,
            ],
            1,
        )?;

        let base = attn.forward(&xs, Some(&context), Some(&mask), &injection)?;
        let moved = attn.forward(&xs, Some(&perturbed), Some(&mask), &injection)?;
        assert!(max_diff(&base, &moved)? < 1e-5);

        // without the mask the same perturbation is visible
        let base = attn.forward(&xs, Some(&context), None, &injection)?;
        let moved = attn.forward(&xs, Some(&perturbed), None, &injection)?;
        assert!(max_diff(&base, &moved)? > 1e-3);
        Ok(())
    }

    #[test]
    fn ambient_precision_matches_fp32_for_f32_inputs() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let vb = varmap_vb(&varmap);
        let fp32 = CrossAttention::new(vb.pp("a"), 16, None, 2, 8, 0.0, AttnPrecision::Fp32, &LinearProjectionBuilder)?;
        let ambient = CrossAttention::new(vb.pp("a"), 16, None, 2, 8, 0.0, AttnPrecision::Ambient, &LinearProjectionBuilder)?;

        let xs = Tensor::randn(0f32, 1f32, (1, 4, 16), &device)?;
        let injection = ConceptInjection::default();
        let a = fp32.forward(&xs, None, None, &injection)?;
        let b = ambient.forward(&xs, None, None, &injection)?;
        assert!(max_diff(&a, &b)? < 1e-6);
        Ok(())
    }

    #[test]
    fn mask_is_rejected_on_memory_efficient_path() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let attn = MemoryEfficientCrossAttention::new(
            varmap_vb(&varmap), 16, None, 2, 8, 0.0, KernelOp::default(), &LinearProjectionBuilder,
        )?;
        let xs = Tensor::randn(0f32, 1f32, (2, 4, 16), &device)?;
        let mask = Tensor::ones((2, 4), DType::U8, &device)?;

        let result = attn.forward(&xs, None, Some(&mask), &ConceptInjection::default());
        assert!(matches!(result, Err(InfusionError::NotImplemented(_))));
        Ok(())
    }

    #[test]
    fn dual_branch_reuses_first_half_query() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let (heads, dim_head) = (2, 8);
        let attn = MemoryEfficientCrossAttention::new(
            varmap_vb(&varmap), 16, Some(12), heads, dim_head, 0.0, KernelOp::Chunked { block_size: 3 }, &LinearProjectionBuilder,
        )?;
        let injection = ConceptInjection::default();

        // [original; super] halves of two samples each
        let xs = Tensor::randn(0f32, 1f32, (4, 6, 16), &device)?;
        let context = Tensor::randn(0f32, 1f32, (4, 5, 12), &device)?;
        let out = attn.forward(&xs, Some(&context), None, &injection)?;
        assert_eq!(out.dims(), &[4, 6, 16]);

        let (q, k, v) = attn.proj.query_key_value(&xs, Some(&context), &injection)?;
        let split = |t: &Tensor, start: usize| -> Result<Tensor> {
            attn.proj.reshape_heads_to_batch_dim(&t.narrow(0, start, 2)?)
        };
        let (q1, q2) = (split(&q, 0)?, split(&q, 2)?);
        let (k1, k2) = (split(&k, 0)?, split(&k, 2)?);
        let (v1, v2) = (split(&v, 0)?, split(&v, 2)?);
        let finish = |t: Tensor| -> Result<Tensor> {
            let t = attn.proj.reshape_batch_dim_to_heads(&t)?;
            Ok(attn.proj.to_out.forward(&t)?)
        };

        let original = finish(softmax_attention(&q1, &k1, &v1)?)?;
        let superposed = finish(softmax_attention(&q1, &k2, &v2)?)?;
        let second_half_self = finish(softmax_attention(&q2, &k2, &v2)?)?;

        assert!(max_diff(&out.i(0..2)?, &original)? < 1e-4);
        assert!(max_diff(&out.i(2..4)?, &superposed)? < 1e-4);
        assert!(max_diff(&out.i(2..4)?, &second_half_self)? > 1e-3);
        Ok(())
    }

    #[test]
    fn dual_branch_rejects_odd_batch() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let attn = MemoryEfficientCrossAttention::new(
            varmap_vb(&varmap), 16, Some(12), 2, 8, 0.0, KernelOp::default(), &LinearProjectionBuilder,
        )?;
        let xs = Tensor::randn(0f32, 1f32, (3, 4, 16), &device)?;
        let context = Tensor::randn(0f32, 1f32, (3, 5, 12), &device)?;
        let result = attn.forward(&xs, Some(&context), None, &ConceptInjection::default());
        assert!(matches!(result, Err(InfusionError::Shape(_))));
        Ok(())
    }

    #[test]
    fn injection_reaches_context_projections() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let builder = RecordingBuilder::default();
        let config = AttentionConfig {
            mode: AttentionMode::Softmax,
            ..Default::default()
        };
        let attn = build_attention(varmap_vb(&varmap), 16, Some(12), 2, 8, 0.0, &config, &builder)?;

        let xs = Tensor::randn(0f32, 1f32, (2, 4, 16), &device)?;
        let context = Tensor::randn(0f32, 1f32, (2, 5, 12), &device)?;
        let injection = ConceptInjection {
            target_input: Some(context.clone()),
            c_inv: Some(Tensor::ones((12, 12), DType::F32, &device)?),
            beta: 0.5,
            tau: 0.2,
            concept_token_idx: Some(vec![3]),
            context_super: Some(context.clone()),
        };
        attn.forward(&xs, Some(&context), None, &injection)?;

        let calls = builder.calls();
        assert_eq!(calls.len(), 2);
        let key = calls.iter().find(|c| c.role == ProjectionRole::Key).unwrap();
        let value = calls.iter().find(|c| c.role == ProjectionRole::Value).unwrap();
        assert!(key.has_input_super);
        assert!(!value.has_input_super);
        for call in [key, value] {
            assert_eq!(call.concept_token_idx, Some(vec![3]));
            assert!(call.has_target_input && call.has_c_inv);
            assert_eq!((call.beta, call.tau), (0.5, 0.2));
        }
        Ok(())
    }

    #[test]
    fn self_attention_layer_never_calls_context_projection() -> Result<()> {
        let device = Device::Cpu;
        let varmap = nn::VarMap::new();
        let builder = RecordingBuilder::default();
        let attn = build_attention(varmap_vb(&varmap), 16, None, 2, 8, 0.0, &AttentionConfig::default(), &builder)?;

        let xs = Tensor::randn(0f32, 1f32, (2, 4, 16), &device)?;
        let out = attn.forward(&xs, None, None, &ConceptInjection::default())?;
        assert_eq!(out.dims(), &[2, 4, 16]);
        assert!(builder.calls().is_empty());
        Ok(())
    }
}
