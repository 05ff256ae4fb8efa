//! Error types for the attention layers

/// Errors raised while building or running the transformer layers
#[derive(thiserror::Error, Debug)]
pub enum InfusionError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("Shape error: {0}")]
    Shape(String),
    #[error("Invalid conditioning: {0}")]
    Conditioning(String),
    #[error("Invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, InfusionError>;
