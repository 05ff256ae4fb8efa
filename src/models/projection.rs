//! Context projection used for concept-injected keys and values
//!
//! The attention layers never look inside the projection. They hand it the
//! context tensor plus the concept-injection parameters and expect
//! `(b, m, heads * dim_head)` back. `LinearProjection` is the plain linear
//! layer, which is what a rank-one editor reduces to when nothing is injected.

use candle_core::{Module, Tensor};
use candle_nn as nn;

use super::util::uniform_init;
use crate::error::Result;

/// Parameters steering the key/value projections of cross-attention.
///
/// Passed by value from the spatial transformer down to every projection call.
#[derive(Debug, Clone)]
pub struct ConceptInjection {
    pub target_input: Option<Tensor>,
    pub c_inv: Option<Tensor>,
    pub beta: f64,
    pub tau: f64,
    pub concept_token_idx: Option<Vec<usize>>,
    /// Augmented context, only forwarded to the key projection as `input_super`
    pub context_super: Option<Tensor>,
}

impl Default for ConceptInjection {
    fn default() -> Self {
        Self {
            target_input: None,
            c_inv: None,
            beta: 0.75,
            tau: 0.1,
            concept_token_idx: None,
            context_super: None,
        }
    }
}

impl ConceptInjection {
    pub fn with_concept_token_idx(&self, concept_token_idx: Option<Vec<usize>>) -> Self {
        Self {
            concept_token_idx,
            ..self.clone()
        }
    }

    pub fn without_concept_tokens(&self) -> Self {
        self.with_concept_token_idx(None)
    }

    /// Arguments for one projection call; keys also receive `input_super`
    pub fn projection_args(&self, role: ProjectionRole) -> ProjectionArgs<'_> {
        ProjectionArgs {
            concept_token_idx: self.concept_token_idx.as_deref(),
            target_input: self.target_input.as_ref(),
            c_inv: self.c_inv.as_ref(),
            beta: self.beta,
            tau: self.tau,
            input_super: match role {
                ProjectionRole::Key => self.context_super.as_ref(),
                ProjectionRole::Value => None,
            },
        }
    }
}

/// Borrowed view of the injection parameters for a single projection call
#[derive(Debug, Clone, Copy)]
pub struct ProjectionArgs<'a> {
    pub concept_token_idx: Option<&'a [usize]>,
    pub target_input: Option<&'a Tensor>,
    pub c_inv: Option<&'a Tensor>,
    pub beta: f64,
    pub tau: f64,
    pub input_super: Option<&'a Tensor>,
}

impl Default for ProjectionArgs<'_> {
    fn default() -> Self {
        Self {
            concept_token_idx: None,
            target_input: None,
            c_inv: None,
            beta: 0.75,
            tau: 0.1,
            input_super: None,
        }
    }
}

/// Whether a projection produces keys (locked) or values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionRole {
    Key,
    Value,
}

pub trait ContextProjection: Send + Sync {
    fn project(&self, context: &Tensor, args: &ProjectionArgs<'_>) -> Result<Tensor>;
}

/// Creates the key/value projections of every cross-attention layer
pub trait ProjectionBuilder {
    fn build(
        &self,
        in_features: usize,
        out_features: usize,
        role: ProjectionRole,
        vs: nn::VarBuilder,
    ) -> Result<Box<dyn ContextProjection>>;
}

/// Bias-free linear projection that ignores the injection parameters
#[derive(Debug, Clone)]
pub struct LinearProjection {
    linear: nn::Linear,
}

impl LinearProjection {
    pub fn new(in_features: usize, out_features: usize, vs: nn::VarBuilder) -> Result<Self> {
        let weight = vs.get_with_hints(
            (out_features, in_features),
            "weight",
            uniform_init(in_features),
        )?;
        Ok(Self {
            linear: nn::Linear::new(weight, None),
        })
    }
}

impl ContextProjection for LinearProjection {
    fn project(&self, context: &Tensor, _args: &ProjectionArgs<'_>) -> Result<Tensor> {
        Ok(self.linear.forward(context)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearProjectionBuilder;

impl ProjectionBuilder for LinearProjectionBuilder {
    fn build(
        &self,
        in_features: usize,
        out_features: usize,
        _role: ProjectionRole,
        vs: nn::VarBuilder,
    ) -> Result<Box<dyn ContextProjection>> {
        Ok(Box::new(LinearProjection::new(in_features, out_features, vs)?))
    }
}

/// Projection doubles that record what the attention layers pass them
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedCall {
        pub role: ProjectionRole,
        pub concept_token_idx: Option<Vec<usize>>,
        pub has_target_input: bool,
        pub has_c_inv: bool,
        pub beta: f64,
        pub tau: f64,
        pub has_input_super: bool,
    }

    pub struct RecordingProjection {
        inner: LinearProjection,
        role: ProjectionRole,
        calls: Arc<Mutex<Vec<RecordedCall>>>,
    }

    impl ContextProjection for RecordingProjection {
        fn project(&self, context: &Tensor, args: &ProjectionArgs<'_>) -> Result<Tensor> {
            self.calls.lock().unwrap().push(RecordedCall {
                role: self.role,
                concept_token_idx: args.concept_token_idx.map(|idx| idx.to_vec()),
                has_target_input: args.target_input.is_some(),
                has_c_inv: args.c_inv.is_some(),
                beta: args.beta,
                tau: args.tau,
                has_input_super: args.input_super.is_some(),
            });
            self.inner.project(context, args)
        }
    }

    #[derive(Default, Clone)]
    pub struct RecordingBuilder {
        pub calls: Arc<Mutex<Vec<RecordedCall>>>,
    }

    impl RecordingBuilder {
        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProjectionBuilder for RecordingBuilder {
        fn build(
            &self,
            in_features: usize,
            out_features: usize,
            role: ProjectionRole,
            vs: nn::VarBuilder,
        ) -> Result<Box<dyn ContextProjection>> {
            Ok(Box::new(RecordingProjection {
                inner: LinearProjection::new(in_features, out_features, vs)?,
                role,
                calls: self.calls.clone(),
            }))
        }
    }
}
