use std::{
    error::Error,
    fmt::{self, Display},
};

use ndarray::ShapeError;

/// The result type used across the optimizer crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// Failures raised by the optimizer.
///
/// Every variant is fatal to the call that produced it, nothing is retried internally.
#[derive(Debug)]
pub enum OptimErr {
    /// A hyperparameter outside of its documented domain.
    InvalidConfig(String),
    /// The slot at `index` carries a sparse gradient.
    UnsupportedGradient { index: usize },
    /// `capturable` is set but the slot at `index` doesn't live on a single accelerator.
    DevicePrecondition { index: usize },
    /// The step counter at `index` is not a zero-dimensional real tensor.
    StepNotScalarCell { index: usize },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// Complex storage that can't be reinterpreted as real pairs.
    NonContiguous,
    /// Buffer length and shape disagree while building a tensor.
    Layout(String),
    Serde(String),
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            OptimErr::UnsupportedGradient { index } => {
                write!(f, "NAdamW does not support sparse gradients (param {index})")
            }
            OptimErr::DevicePrecondition { index } => write!(
                f,
                "if capturable=true, params and state steps must live on the same accelerator (param {index})"
            ),
            OptimErr::StepNotScalarCell { index } => write!(
                f,
                "state step {index} must be a singleton tensor, the state was produced by an incompatible version"
            ),
            OptimErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what}: got {got:?}, expected {expected:?}"
            ),
            OptimErr::NonContiguous => {
                f.write_str("complex storage is not contiguous, can't view it as real pairs")
            }
            OptimErr::Layout(msg) => write!(f, "layout error: {msg}"),
            OptimErr::Serde(msg) => write!(f, "state dict error: {msg}"),
        }
    }
}

impl Error for OptimErr {}

impl From<ShapeError> for OptimErr {
    fn from(value: ShapeError) -> Self {
        Self::Layout(value.to_string())
    }
}

impl From<serde_json::Error> for OptimErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}
