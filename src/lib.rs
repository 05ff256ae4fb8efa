pub mod config;
pub mod error;
pub mod models;

// Re-export common types
pub use config::{load_config, AttentionConfig, InfusionConfig, SpatialTransformerConfig};
pub use error::{InfusionError, Result};
pub use models::{
    AttentionLayer, AttentionMode, AttnPrecision, BasicTransformerBlock, ConceptInjection,
    CrossAttention, FeedForward, MemoryEfficientCrossAttention, PerBlock, SpatialTransformer,
};

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
