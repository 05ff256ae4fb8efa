//! Batched attention kernel used by the memory-efficient attention path
//!
//! Inputs are `(batch * heads, seq, dim_head)`; the scale is `dim_head^-0.5`.
//! The chunked operator never materialises more than one
//! `block_size x block_size` slab of scores per batch entry.

use candle_core::{DType, Result, Tensor};

use crate::config::KernelOp;

pub const DEFAULT_BLOCK_SIZE: usize = 64;

pub fn memory_efficient_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&Tensor>,
    op: KernelOp,
) -> Result<Tensor> {
    match op {
        KernelOp::Chunked { block_size } => chunked_attention(q, k, v, bias, block_size.max(1)),
        KernelOp::Flash => flash_attention(q, k, v, bias),
    }
}

fn chunked_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&Tensor>,
    block_size: usize,
) -> Result<Tensor> {
    let in_dtype = q.dtype();
    let device = q.device();
    let (batch_heads, q_len, head_dim) = q.dims3()?;
    let (_, kv_len, _) = k.dims3()?;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let q = (q.to_dtype(DType::F32)? * scale)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;
    let bias = match bias {
        Some(bias) => Some(
            bias.to_dtype(DType::F32)?
                .broadcast_as((batch_heads, q_len, kv_len))?,
        ),
        None => None,
    };

    let mut outputs = Vec::with_capacity(q_len.div_ceil(block_size));
    for q_start in (0..q_len).step_by(block_size) {
        let q_rows = block_size.min(q_len - q_start);
        let q_block = q.narrow(1, q_start, q_rows)?.contiguous()?;

        let mut acc = Tensor::zeros((batch_heads, q_rows, head_dim), DType::F32, device)?;
        let mut row_max = Tensor::full(f32::NEG_INFINITY, (batch_heads, q_rows, 1), device)?;
        let mut row_sum = Tensor::zeros((batch_heads, q_rows, 1), DType::F32, device)?;

        for kv_start in (0..kv_len).step_by(block_size) {
            let kv_rows = block_size.min(kv_len - kv_start);
            let k_block = k.narrow(1, kv_start, kv_rows)?.contiguous()?;
            let v_block = v.narrow(1, kv_start, kv_rows)?.contiguous()?;

            let mut scores = q_block.matmul(&k_block.t()?)?;
            if let Some(bias) = &bias {
                let bias_block = bias.narrow(1, q_start, q_rows)?.narrow(2, kv_start, kv_rows)?;
                scores = (scores + bias_block)?;
            }

            // online softmax: rescale what has been accumulated so far
            let new_max = row_max.maximum(&scores.max_keepdim(2)?)?;
            let exp_scores = scores.broadcast_sub(&new_max)?.exp()?;
            let correction = (&row_max - &new_max)?.exp()?;

            row_sum = ((row_sum * &correction)? + exp_scores.sum_keepdim(2)?)?;
            acc = (acc.broadcast_mul(&correction)? + exp_scores.matmul(&v_block)?)?;
            row_max = new_max;
        }

        outputs.push(acc.broadcast_div(&row_sum)?);
    }

    Tensor::cat(&outputs, 1)?.to_dtype(in_dtype)
}

#[cfg(feature = "flash-attn")]
fn flash_attention(q: &Tensor, k: &Tensor, v: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    if bias.is_some() {
        return chunked_attention(q, k, v, bias, DEFAULT_BLOCK_SIZE);
    }
    let init_dtype = q.dtype();
    let (_, _, head_dim) = q.dims3()?;
    let scale = 1.0 / (head_dim as f32).sqrt();
    // (b * h, seq, d) -> (b * h, seq, 1, d)
    let q = q.to_dtype(DType::F16)?.unsqueeze(2)?;
    let k = k.to_dtype(DType::F16)?.unsqueeze(2)?;
    let v = v.to_dtype(DType::F16)?.unsqueeze(2)?;
    candle_flash_attn::flash_attn(&q, &k, &v, scale, false)?
        .squeeze(2)?
        .to_dtype(init_dtype)
}

#[cfg(not(feature = "flash-attn"))]
fn flash_attention(q: &Tensor, k: &Tensor, v: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    chunked_attention(q, k, v, bias, DEFAULT_BLOCK_SIZE)
}
