#![doc = include_str!("../README.md")]
mod linalg;
mod solver;

pub use linalg::{LinearSolver, SparseQr};
pub use solver::{
    LmOptions, LmState, LmStats, LmStatus, LmWorkspace, initialize, solve,
};

use core::fmt::{self, Display, Formatter};
use faer::sparse::SymbolicSparseColMat;

/// A nonlinear least-squares problem with a fixed Jacobian sparsity pattern.
///
/// The solver drives `½‖r(x)‖²` to a (local) minimum. Implementors must keep
/// the pattern returned by [`jac_symbolic`](Self::jac_symbolic) unchanged for
/// as long as any state/workspace initialized from this system is in use;
/// a structural change requires a fresh [`initialize`].
pub trait LeastSquaresSystem {
    /// The scalar type, `f64` in practice.
    type Real: num_traits::Float;

    /// Number of columns of the Jacobian.
    fn n_variables(&self) -> usize;

    /// Number of residuals, i.e. rows of the Jacobian.
    fn n_residuals(&self) -> usize;

    /// The column-compressed sparsity pattern of the Jacobian.
    fn jac_symbolic(&self) -> &SymbolicSparseColMat<usize>;

    /// Write all `n_residuals` residual values for `x` into `out`.
    fn residual(&self, x: &[Self::Real], out: &mut [Self::Real]);

    /// Write the Jacobian values for `x` into `nzval`.
    ///
    /// `nzval` has one entry per structural nonzero of
    /// [`jac_symbolic`](Self::jac_symbolic), in column-major order.
    fn jacobian(&self, x: &[Self::Real], nzval: &mut [Self::Real]);
}

/// Reasons the solver can fail outright. Non-convergence is not among them:
/// running out of iterations is reported through [`LmStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmError {
    /// The initial guess does not have one entry per variable.
    DimensionMismatch {
        /// Number of variables in the system.
        expected: usize,
        /// Length of the supplied initial guess.
        actual: usize,
    },
    /// Damping bounds must satisfy `0 < lambda_min <= lambda_max`.
    InvalidOptions,
    /// The augmented sparsity pattern could not be created.
    Pattern,
    /// Sparse QR could not factor the augmented system.
    Factorization,
}

impl Display for LmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LmError::DimensionMismatch { expected, actual } => write!(
                f,
                "initial guess has {actual} entries but the system has {expected} variables"
            ),
            LmError::InvalidOptions => {
                f.write_str("damping bounds must satisfy 0 < lambda_min <= lambda_max")
            }
            LmError::Pattern => f.write_str("could not build the augmented sparsity pattern"),
            LmError::Factorization => f.write_str("sparse QR factorization failed"),
        }
    }
}

impl std::error::Error for LmError {}

pub type LmResult<T> = Result<T, error_stack::Report<LmError>>;
