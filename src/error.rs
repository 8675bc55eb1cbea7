use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;
use rand_distr::{NormalError, uniform::Error as UniformError};

/// The result type used across the entire crate.
pub type Result<T> = std::result::Result<T, PsErr>;

/// Every failure the parameter-server core can surface.
#[derive(Debug)]
pub enum PsErr {
    /// A hyper-parameter or call argument is outside its documented range.
    InvalidArgument {
        what: &'static str,
        value: String,
        expected: &'static str,
    },
    /// A tensor or experiment name is not a valid qualified name.
    InvalidName { name: String },
    /// The computation graph contains a module this core can't drive.
    UnsupportedModule { name: String, reason: String },
    /// Two tensors were registered under the same name.
    DuplicateTensor { name: String },
    /// The operation is not allowed in the current state of the model.
    State(String),
    /// A buffer, gradient or slice doesn't have the expected size.
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// The store doesn't know the tensor.
    UnknownTensor { name: String },
    /// A fanned-out operation failed, aborting the whole phase.
    Collective {
        phase: &'static str,
        source: Box<PsErr>,
    },
    Io(io::Error),
    Serialization(String),
}

impl PsErr {
    /// Builds an `InvalidArgument` error from any displayable value.
    ///
    /// # Arguments
    /// * `what` - The name of the offending argument.
    /// * `value` - The offending value.
    /// * `expected` - The constraint the value should satisfy.
    ///
    /// # Returns
    /// A new `PsErr::InvalidArgument`.
    pub fn invalid<V: Display>(what: &'static str, value: V, expected: &'static str) -> Self {
        Self::InvalidArgument {
            what,
            value: value.to_string(),
            expected,
        }
    }

    /// Wraps this error as the failure of a collective phase.
    ///
    /// # Arguments
    /// * `phase` - The name of the aborted phase.
    ///
    /// # Returns
    /// A new `PsErr::Collective`, or `self` if it already is one.
    pub fn collective(self, phase: &'static str) -> Self {
        match self {
            Self::Collective { .. } => self,
            other => Self::Collective {
                phase,
                source: Box::new(other),
            },
        }
    }
}

impl Display for PsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument {
                what,
                value,
                expected,
            } => write!(f, "{what} must be {expected}; {value} is invalid"),
            Self::InvalidName { name } => {
                write!(f, "{name:?} is not a valid qualified name")
            }
            Self::UnsupportedModule { name, reason } => {
                write!(f, "module {name:?} is not supported: {reason}")
            }
            Self::DuplicateTensor { name } => {
                write!(f, "tensor {name:?} is registered more than once")
            }
            Self::State(msg) => f.write_str(msg),
            Self::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch in {what}: got {got}, expected {expected}"),
            Self::UnknownTensor { name } => write!(f, "the store has no tensor named {name:?}"),
            Self::Collective { phase, source } => {
                write!(f, "collective {phase} failed: {source}")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl Error for PsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Collective { source, .. } => Some(source.as_ref()),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PsErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<NormalError> for PsErr {
    fn from(value: NormalError) -> Self {
        Self::invalid("normal distribution", value, "a finite mean and a positive finite spread")
    }
}

impl From<UniformError> for PsErr {
    fn from(value: UniformError) -> Self {
        Self::invalid("uniform distribution", value, "a non-empty finite range")
    }
}

impl From<ShapeError> for PsErr {
    fn from(value: ShapeError) -> Self {
        Self::State(format!("incompatible tensor layout: {value}"))
    }
}

impl From<serde_json::Error> for PsErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<bincode::Error> for PsErr {
    fn from(value: bincode::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
