//! Black-box components that contribute fluxes without exposing a rate law.

use crate::error::ModelError;
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};

/// Stoichiometry of surrogate outputs: output name → compound → coefficient.
pub type SurrogateStoichiometry = IndexMap<String, IndexMap<String, f64>>;

/// A predictive component whose outputs are fed into the same
/// flux/stoichiometry machinery as ordinary reactions.
pub trait Surrogate {
    /// Names of the model quantities fed to [`Surrogate::predict`], in order.
    fn args(&self) -> &[String];

    /// Default stoichiometry of each predicted flux.
    fn stoichiometries(&self) -> &SurrogateStoichiometry;

    /// Predicts named fluxes from the input values bound to [`Surrogate::args`].
    fn predict(&self, inputs: &[f64]) -> IndexMap<String, f64>;
}

/// Affine surrogate `y = W x + b`.
#[derive(Debug, Clone)]
pub struct LinearSurrogate {
    args: Vec<String>,
    outputs: Vec<String>,
    weights: DMatrix<f64>,
    bias: DVector<f64>,
    stoichiometries: SurrogateStoichiometry,
}

impl LinearSurrogate {
    /// `weights` has one row per output and one column per input.
    pub fn new(
        args: Vec<String>,
        outputs: Vec<String>,
        weights: DMatrix<f64>,
        bias: DVector<f64>,
        stoichiometries: SurrogateStoichiometry,
    ) -> Result<Self, ModelError> {
        if weights.ncols() != args.len() {
            return Err(ModelError::DimensionMismatch {
                expected: args.len(),
                actual: weights.ncols(),
            });
        }
        if weights.nrows() != outputs.len() {
            return Err(ModelError::DimensionMismatch {
                expected: outputs.len(),
                actual: weights.nrows(),
            });
        }
        if bias.len() != outputs.len() {
            return Err(ModelError::DimensionMismatch {
                expected: outputs.len(),
                actual: bias.len(),
            });
        }
        Ok(Self {
            args,
            outputs,
            weights,
            bias,
            stoichiometries,
        })
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }
}

impl Surrogate for LinearSurrogate {
    fn args(&self) -> &[String] {
        &self.args
    }

    fn stoichiometries(&self) -> &SurrogateStoichiometry {
        &self.stoichiometries
    }

    fn predict(&self, inputs: &[f64]) -> IndexMap<String, f64> {
        let x = DVector::from_column_slice(inputs);
        let y = &self.weights * x + &self.bias;
        self.outputs.iter().cloned().zip(y.iter().copied()).collect()
    }
}
