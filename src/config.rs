//! Layer configuration
//!
//! Everything the layers need to know at construction time lives here,
//! including the attention strategy and similarity precision. Nothing is read
//! from the process environment during a forward pass.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::InfusionError;

/// Precision used for the query/key similarity in the reference attention path
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "String", into = "String")]
pub enum AttnPrecision {
    /// Upcast queries and keys to f32 before the similarity product
    #[default]
    Fp32,
    /// Keep whatever dtype the activations arrive in
    Ambient,
}

impl AttnPrecision {
    pub const ENV_VAR: &'static str = "ATTN_PRECISION";

    /// `"fp32"` forces full precision, any other value keeps the ambient dtype
    pub fn parse(value: &str) -> Self {
        if value == "fp32" {
            AttnPrecision::Fp32
        } else {
            AttnPrecision::Ambient
        }
    }

    /// Read `ATTN_PRECISION` once, defaulting to fp32 when unset
    pub fn from_env() -> Self {
        std::env::var(Self::ENV_VAR)
            .map(|value| Self::parse(&value))
            .unwrap_or_default()
    }
}

impl From<String> for AttnPrecision {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<AttnPrecision> for String {
    fn from(value: AttnPrecision) -> Self {
        match value {
            AttnPrecision::Fp32 => "fp32".to_string(),
            AttnPrecision::Ambient => "ambient".to_string(),
        }
    }
}

/// Which attention implementation the transformer blocks are built with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttentionMode {
    /// Explicit similarity matrix + softmax
    #[serde(rename = "softmax")]
    Softmax,
    /// Fused batched kernel with dual-branch splitting
    #[serde(rename = "softmax-xformers")]
    SoftmaxXformers,
}

impl AttentionMode {
    /// The batched kernel is always compiled in, so it is the default choice
    pub fn auto() -> Self {
        AttentionMode::SoftmaxXformers
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionMode::Softmax => "softmax",
            AttentionMode::SoftmaxXformers => "softmax-xformers",
        }
    }
}

impl Default for AttentionMode {
    fn default() -> Self {
        Self::auto()
    }
}

/// Operator used by the fused attention kernel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelOp {
    /// Online-softmax over key blocks of `block_size`
    Chunked { block_size: usize },
    /// candle-flash-attn, needs the `flash-attn` feature and a CUDA device
    Flash,
}

impl Default for KernelOp {
    fn default() -> Self {
        KernelOp::Chunked {
            block_size: crate::models::kernel::DEFAULT_BLOCK_SIZE,
        }
    }
}

impl KernelOp {
    pub fn is_available(&self) -> bool {
        match self {
            KernelOp::Chunked { block_size } => *block_size > 0,
            KernelOp::Flash => cfg!(feature = "flash-attn"),
        }
    }

    /// Capability check done once when a layer is built
    pub fn resolve(self) -> Self {
        if self.is_available() {
            return self;
        }
        let fallback = KernelOp::default();
        warn!("Attention kernel {:?} unavailable, falling back to {:?}", self, fallback);
        fallback
    }
}

/// Attention settings shared by every block; dropout is per transformer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AttentionConfig {
    pub mode: AttentionMode,
    pub precision: AttnPrecision,
    pub kernel: KernelOp,
}

/// Context width: one value for every block or one per block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContextDims {
    Single(usize),
    PerBlock(Vec<usize>),
}

impl ContextDims {
    pub fn for_block(&self, index: usize) -> Option<usize> {
        match self {
            ContextDims::Single(dim) => Some(*dim),
            ContextDims::PerBlock(dims) => dims.get(index).copied(),
        }
    }
}

impl From<usize> for ContextDims {
    fn from(dim: usize) -> Self {
        ContextDims::Single(dim)
    }
}

/// Configuration for SpatialTransformer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpatialTransformerConfig {
    pub in_channels: usize,
    pub n_heads: usize,
    pub d_head: usize,
    pub depth: usize,
    pub dropout: f32,
    pub context_dim: Option<ContextDims>,
    pub disable_self_attn: bool,
    pub use_linear: bool,
    pub use_checkpoint: bool,
    pub num_groups: usize,
    pub gated_ff: bool,
}

impl Default for SpatialTransformerConfig {
    fn default() -> Self {
        Self {
            in_channels: 320,
            n_heads: 8,
            d_head: 40,
            depth: 1,
            dropout: 0.0,
            context_dim: None,
            disable_self_attn: false,
            use_linear: false,
            use_checkpoint: true,
            num_groups: 32,
            gated_ff: true,
        }
    }
}

impl SpatialTransformerConfig {
    pub fn inner_dim(&self) -> usize {
        self.n_heads * self.d_head
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.depth == 0 {
            return Err(InfusionError::Config("depth must be at least 1".to_string()));
        }
        if self.num_groups == 0 || self.in_channels % self.num_groups != 0 {
            return Err(InfusionError::Config(format!(
                "in_channels {} is not divisible by num_groups {}",
                self.in_channels, self.num_groups
            )));
        }
        if let Some(ContextDims::PerBlock(dims)) = &self.context_dim {
            if dims.len() != self.depth {
                return Err(InfusionError::Config(format!(
                    "{} context dims given for depth {}",
                    dims.len(),
                    self.depth
                )));
            }
        }
        Ok(())
    }
}

/// Top-level config file layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct InfusionConfig {
    pub spatial: SpatialTransformerConfig,
    pub attention: AttentionConfig,
}

pub fn load_config(path: &Path) -> Result<InfusionConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: InfusionConfig = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;
    config.spatial.validate()?;

    Ok(config)
}
