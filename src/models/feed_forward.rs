//! Position-wise feed-forward block with optional gated GELU

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn as nn;

/// Gated GELU: projects to twice the width, gates one half with the other
#[derive(Debug, Clone)]
pub struct GeGlu {
    proj: nn::Linear,
}

impl GeGlu {
    pub fn new(vs: nn::VarBuilder, dim_in: usize, dim_out: usize) -> Result<Self> {
        let proj = nn::linear(dim_in, dim_out * 2, vs.pp("proj"))?;
        Ok(Self { proj })
    }
}

impl Module for GeGlu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.proj.forward(xs)?;
        let chunks = hidden.chunk(2, D::Minus1)?;
        &chunks[0] * chunks[1].gelu_erf()?
    }
}

#[derive(Debug, Clone)]
enum ProjectIn {
    GeGlu(GeGlu),
    Gelu(nn::Linear),
}

impl Module for ProjectIn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            ProjectIn::GeGlu(geglu) => geglu.forward(xs),
            ProjectIn::Gelu(linear) => linear.forward(xs)?.gelu_erf(),
        }
    }
}

/// `net.0` (activation), `net.1` (dropout), `net.2` (output projection)
#[derive(Debug, Clone)]
pub struct FeedForward {
    project_in: ProjectIn,
    dropout: nn::Dropout,
    linear: nn::Linear,
}

impl FeedForward {
    pub fn new(
        vs: nn::VarBuilder,
        dim: usize,
        dim_out: Option<usize>,
        mult: usize,
        glu: bool,
        dropout: f32,
    ) -> Result<Self> {
        let inner_dim = dim * mult;
        let dim_out = dim_out.unwrap_or(dim);
        let vs = vs.pp("net");
        let project_in = if glu {
            ProjectIn::GeGlu(GeGlu::new(vs.pp("0"), dim, inner_dim)?)
        } else {
            ProjectIn::Gelu(nn::linear(dim, inner_dim, vs.pp("0").pp("0"))?)
        };
        let linear = nn::linear(inner_dim, dim_out, vs.pp("2"))?;
        Ok(Self {
            project_in,
            dropout: nn::Dropout::new(dropout),
            linear,
        })
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.project_in.forward(xs)?;
        let xs = self.dropout.forward(&xs, train)?;
        self.linear.forward(&xs)
    }
}
