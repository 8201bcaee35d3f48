#![doc = include_str!("../README.md")]

pub use crate::compile::CompiledProblem;
pub use crate::constraints::Constraint;
pub use crate::datatypes::{Arc, Circle, Line, PointId, Shape};
pub use crate::sketch::{ConflictEntry, ConflictReport, FreedomAnalysis, Sketch};

/// Lowering a constraint list into a fixed-pattern least-squares problem.
mod compile;
/// Each kind of geometric constraint we support.
mod constraints;
/// Geometric data (points, lines, circles, arcs).
pub mod datatypes;
/// The sketch controller: owns the parameters, shapes, constraints and the
/// cached solver.
mod sketch;

use faer::linalg::svd::SvdError;
use faer::sparse::CreationError;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A sketch needs at least one point and one constraint before it can
    /// be compiled.
    #[error("cannot solve an empty sketch; add at least one point and one constraint")]
    EmptySketch,
    /// The cached problem is stale. Structural edits (new points, shapes or
    /// constraints) require a `solve` before residuals can be inspected.
    #[error("sketch structure changed since the last solve; call solve() first")]
    StructureDirty,
    /// You referred to a point that was never added to this sketch.
    #[error("point {0} does not exist in this sketch")]
    UnknownPoint(PointId),
    /// Faer: could not create the sparsity pattern.
    #[error("could not create matrix: {0}")]
    Matrix(#[from] CreationError),
    /// Faer: could not decompose the Jacobian.
    #[error("something went wrong doing SVD in faer")]
    Svd(SvdError),
    /// The least-squares engine failed.
    #[error("{0}")]
    Engine(Box<dyn std::error::Error>),
}
