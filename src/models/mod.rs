//! Model implementations for concept-injected attention
//!
//! Leaf-first: helpers, feed-forward, context projection, attention kernel,
//! the two attention layers, checkpointing and the transformer blocks.

pub mod attention;
pub mod checkpoint;
pub mod feed_forward;
pub mod kernel;
pub mod projection;
pub mod transformer;
pub mod util;

// Re-export key types
pub use crate::config::{AttentionMode, AttnPrecision, KernelOp};
pub use attention::{build_attention, AttentionLayer, CrossAttention, MemoryEfficientCrossAttention};
pub use checkpoint::Checkpointed;
pub use feed_forward::{FeedForward, GeGlu};
pub use kernel::memory_efficient_attention;
pub use projection::{
    ConceptInjection, ContextProjection, LinearProjection, LinearProjectionBuilder, ProjectionArgs,
    ProjectionBuilder, ProjectionRole,
};
pub use transformer::{BasicTransformerBlock, PerBlock, SpatialTransformer};
