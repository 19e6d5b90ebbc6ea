pub mod field;
pub mod grid;
pub mod progress;

pub use field::*;
pub use grid::*;
pub use progress::*;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No channel named '{0}'")]
    MissingChannel(String),

    #[error("Channel '{0}' has a different element type")]
    TypeMismatch(String),

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),
}
