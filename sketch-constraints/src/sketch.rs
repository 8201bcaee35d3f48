use std::ops::Range;

use lm_faer::{LmOptions, LmState, LmStats, LmWorkspace};
use tracing::debug;

use crate::compile::{CompiledProblem, SketchProblem};
use crate::datatypes::{PointId, Shape, slot_x, slot_y};
use crate::{Constraint, Error};

/// Rank analysis of the compiled Jacobian.
mod analysis;

pub use analysis::FreedomAnalysis;

/// Everything that must be rebuilt together when the sketch's structure
/// changes: the compiled problem, the engine state/workspace sized for it,
/// and a residual scratch buffer for conflict reporting.
pub(crate) struct SolverCache {
    pub(crate) compiled: CompiledProblem,
    pub(crate) state: LmState<f64>,
    pub(crate) workspace: LmWorkspace<f64>,
    pub(crate) residuals: Vec<f64>,
    pub(crate) jac_scratch: Vec<f64>,
}

/// A 2D parametric sketch: points, shapes, constraints, and the cached
/// solver that keeps interactive re-solves cheap.
///
/// Two private flags track what went stale since the last solve.
/// Structural edits (`add_point`, `add_shape`, `add_constraint`) invalidate
/// the compiled problem; `set_point` only invalidates the parameter mirror
/// inside the solver state. [`solve`](Self::solve) arbitrates: recompile and
/// reallocate on structural changes, re-mirror on value changes, reuse
/// everything otherwise.
pub struct Sketch {
    /// Parameter vector: point `p` owns entries `2(p−1)` and `2(p−1)+1`.
    x: Vec<f64>,
    shapes: Vec<Shape>,
    constraints: Vec<Constraint>,
    cache: Option<SolverCache>,
    structure_dirty: bool,
    value_dirty: bool,
}

/// One violated constraint in a [`ConflictReport`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConflictEntry {
    /// Index into the sketch's constraint list.
    pub constraint_index: usize,
    /// Constraint kind, e.g. `"Distance"`.
    pub kind: &'static str,
    /// 2-norm of this constraint's residual rows.
    pub residual_norm: f64,
}

/// Which constraints remain violated after a solve, worst first.
#[derive(Clone, Debug)]
pub struct ConflictReport {
    /// 2-norm of the full residual vector.
    pub residual_norm: f64,
    /// Whether the overall residual exceeds the tolerance.
    pub conflicted: bool,
    /// Violated constraints, sorted descending by residual norm and
    /// truncated to the requested maximum.
    pub entries: Vec<ConflictEntry>,
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new()
    }
}

impl Sketch {
    pub fn new() -> Self {
        Self {
            x: Vec::new(),
            shapes: Vec::new(),
            constraints: Vec::new(),
            cache: None,
            structure_dirty: true,
            value_dirty: false,
        }
    }

    /// Append a point at an initial guess position. Returns its 1-based id.
    pub fn add_point(&mut self, x: f64, y: f64) -> PointId {
        self.x.push(x);
        self.x.push(y);
        self.structure_dirty = true;
        (self.x.len() / 2) as PointId
    }

    pub fn n_points(&self) -> usize {
        self.x.len() / 2
    }

    /// Current coordinates of a point.
    pub fn point(&self, p: PointId) -> Result<(f64, f64), Error> {
        if p == 0 || 2 * (p as usize) > self.x.len() {
            return Err(Error::UnknownPoint(p));
        }
        Ok((self.x[slot_x(p)], self.x[slot_y(p)]))
    }

    /// Declare a shape. Returns its index in the shape list.
    pub fn add_shape(&mut self, shape: Shape) -> usize {
        self.shapes.push(shape);
        self.structure_dirty = true;
        self.shapes.len() - 1
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Append a constraint, after degeneracy rewrites. Returns the range of
    /// constraint indices actually appended; rewrites can shrink a request
    /// to zero constraints (e.g. `Coincident(p, p)`) or expand it.
    pub fn add_constraint(&mut self, constraint: Constraint) -> Range<usize> {
        let start = self.constraints.len();
        self.structure_dirty = true;
        self.push_rewritten(constraint);
        start..self.constraints.len()
    }

    /// Degeneracy rewrites, applied at insert time so the compiled Jacobian
    /// keeps stable rank: a zero-length line carries no direction, so axis,
    /// parallel and normal constraints on it reduce to endpoint
    /// coincidence, and self-coincidence drops out entirely.
    fn push_rewritten(&mut self, constraint: Constraint) {
        match constraint {
            Constraint::Horizontal(l) | Constraint::Vertical(l) if l.is_degenerate() => {
                self.push_rewritten(Constraint::Coincident(l.p1, l.p2));
            }
            Constraint::Normal(_, l) if l.is_degenerate() => {
                self.push_rewritten(Constraint::Coincident(l.p1, l.p2));
            }
            Constraint::Parallel(a, b) | Constraint::Perpendicular(a, b)
                if a.is_degenerate() || b.is_degenerate() =>
            {
                if a.is_degenerate() {
                    self.push_rewritten(Constraint::Coincident(a.p1, a.p2));
                }
                if b.is_degenerate() {
                    self.push_rewritten(Constraint::Coincident(b.p1, b.p2));
                }
            }
            Constraint::Coincident(p, q) if p == q => {}
            other => self.constraints.push(other),
        }
    }

    /// Overwrite a point's coordinates (a drag edit). Performs no
    /// allocation and leaves the compiled problem untouched.
    pub fn set_point(&mut self, p: PointId, x: f64, y: f64) -> Result<(), Error> {
        if p == 0 || 2 * (p as usize) > self.x.len() {
            return Err(Error::UnknownPoint(p));
        }
        self.x[slot_x(p)] = x;
        self.x[slot_y(p)] = y;
        self.value_dirty = true;
        Ok(())
    }

    /// Whether a structural edit happened since the last solve.
    pub fn structure_dirty(&self) -> bool {
        self.structure_dirty
    }

    /// Whether a point moved since the last solve.
    pub fn value_dirty(&self) -> bool {
        self.value_dirty
    }

    /// Solve the sketch, updating every point's coordinates in place.
    ///
    /// Recompiles the problem and reallocates the solver workspace only if
    /// the structure changed; a value-only change re-mirrors the parameter
    /// vector; otherwise state and workspace are reused as-is (the warm
    /// start that makes dragging cheap). Inconsistent constraints are not an
    /// error: the solve converges in the least-squares sense and the
    /// violation is visible through [`conflicts`](Self::conflicts).
    pub fn solve(&mut self, options: &LmOptions<f64>) -> Result<LmStats<f64>, Error> {
        if self.structure_dirty || self.cache.is_none() {
            let compiled = CompiledProblem::compile(&self.constraints, self.n_points())?;
            let (state, workspace) = {
                let problem = SketchProblem {
                    compiled: &compiled,
                    constraints: &self.constraints,
                };
                lm_faer::initialize(&problem, &self.x, options)
                    .map_err(|report| Error::Engine(Box::new(report.into_error())))?
            };
            let m = compiled.n_residuals();
            let nnz = compiled.jac_symbolic().col_ptr()[compiled.n_variables()];
            debug!(m, n = compiled.n_variables(), "rebuilt solver cache");
            self.cache = Some(SolverCache {
                compiled,
                state,
                workspace,
                residuals: vec![0.0; m],
                jac_scratch: vec![0.0; nnz],
            });
            self.structure_dirty = false;
            self.value_dirty = false;
        } else if self.value_dirty {
            if let Some(cache) = self.cache.as_mut() {
                cache.state.x.copy_from_slice(&self.x);
            }
            self.value_dirty = false;
        }

        let Some(SolverCache {
            compiled,
            state,
            workspace,
            ..
        }) = self.cache.as_mut()
        else {
            return Err(Error::EmptySketch);
        };
        let problem = SketchProblem {
            compiled,
            constraints: &self.constraints,
        };
        let stats = lm_faer::solve(&problem, state, workspace, options)
            .map_err(|report| Error::Engine(Box::new(report.into_error())))?;
        self.x.copy_from_slice(&state.x);
        Ok(stats)
    }

    /// Whether the solve left a residual above `tol`, i.e. at least one
    /// constraint could not be satisfied.
    pub fn has_conflict(&self, stats: &LmStats<f64>, tol: f64) -> bool {
        stats.residual_norm() > tol
    }

    /// Report which constraints remain violated, worst first, at most
    /// `max_items` of them.
    ///
    /// Uses the residuals of the last solve; if points moved since
    /// (`set_point`), residuals are re-evaluated at the live coordinates.
    /// Calling this after a structural edit is an error: the cached row
    /// assignment no longer describes the constraint list.
    pub fn conflicts(&mut self, tol: f64, max_items: usize) -> Result<ConflictReport, Error> {
        if self.structure_dirty {
            return Err(Error::StructureDirty);
        }
        let Some(SolverCache {
            compiled,
            workspace,
            residuals,
            ..
        }) = self.cache.as_mut()
        else {
            return Err(Error::StructureDirty);
        };

        let resid: &[f64] = if self.value_dirty {
            compiled.residual(&self.constraints, &self.x, residuals.as_mut_slice());
            residuals.as_slice()
        } else {
            workspace.residual()
        };

        let mut entries = Vec::new();
        for (i, constraint) in self.constraints.iter().enumerate() {
            let start = compiled.row_offset(i);
            let norm = resid[start..start + constraint.residual_dim()]
                .iter()
                .map(|r| r * r)
                .sum::<f64>()
                .sqrt();
            if norm > tol {
                entries.push(ConflictEntry {
                    constraint_index: i,
                    kind: constraint.kind(),
                    residual_norm: norm,
                });
            }
        }
        entries.sort_by(|a, b| b.residual_norm.total_cmp(&a.residual_norm));
        entries.truncate(max_items);

        let residual_norm = resid.iter().map(|r| r * r).sum::<f64>().sqrt();
        Ok(ConflictReport {
            residual_norm,
            conflicted: residual_norm > tol,
            entries,
        })
    }

    /// The compiled problem currently backing this sketch, if any.
    pub(crate) fn compiled(&self) -> Option<&CompiledProblem> {
        self.cache.as_ref().map(|cache| &cache.compiled)
    }
}
