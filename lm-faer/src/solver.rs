use error_stack::{Report, ResultExt};
use faer::Mat;
use faer::sparse::{Pair, SparseColMatRef, SymbolicSparseColMat};
use faer_traits::ComplexField;
use num_traits::{Float, NumCast, One, ToPrimitive, Zero};
use tracing::{debug, trace};

use crate::{LeastSquaresSystem, LinearSolver, LmError, LmResult, SparseQr};

/// How a solve ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LmStatus {
    /// Gradient or residual tolerance met.
    Converged,
    /// The proposed step shrank below `step_tol`.
    StepTol,
    /// Iteration budget exhausted without meeting a tolerance.
    MaxIters,
}

/// Tolerances and damping bounds for [`solve`].
#[derive(Clone, Copy, Debug)]
pub struct LmOptions<T> {
    /// Iteration budget. Interactive callers keep this small to cap latency.
    pub max_iters: usize,
    /// Absolute residual tolerance.
    pub atol: T,
    /// Residual tolerance relative to the starting residual norm.
    pub rtol: T,
    /// Infinity-norm tolerance on the gradient `Jᵀr`.
    pub gtol: T,
    /// Terminate when the step 2-norm falls below this.
    pub step_tol: T,
    /// Starting damping parameter.
    pub lambda_init: T,
    /// Lower damping clamp. Must be positive: the `√λ·I` block is what
    /// keeps the augmented system full column rank.
    pub lambda_min: T,
    /// Upper damping clamp.
    pub lambda_max: T,
}

impl<T: Float> Default for LmOptions<T> {
    fn default() -> Self {
        Self {
            max_iters: 50,
            atol: T::from(1e-8).expect("type must support 1e-8 for default tolerance"),
            rtol: T::from(1e-8).expect("type must support 1e-8 for default tolerance"),
            gtol: T::from(1e-8).expect("type must support 1e-8 for default tolerance"),
            step_tol: T::from(1e-12).expect("type must support 1e-12 for default step tolerance"),
            lambda_init: T::from(1e-3).expect("type must support 1e-3 for default damping"),
            lambda_min: T::from(1e-12).expect("type must support 1e-12 for damping bound"),
            lambda_max: T::from(1e12).expect("type must support 1e12 for damping bound"),
        }
    }
}

impl<T: Float> LmOptions<T> {
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }
    pub fn with_atol(mut self, atol: T) -> Self {
        self.atol = atol;
        self
    }
    pub fn with_rtol(mut self, rtol: T) -> Self {
        self.rtol = rtol;
        self
    }
    pub fn with_gtol(mut self, gtol: T) -> Self {
        self.gtol = gtol;
        self
    }
    pub fn with_step_tol(mut self, step_tol: T) -> Self {
        self.step_tol = step_tol;
        self
    }
    pub fn with_lambda_init(mut self, lambda_init: T) -> Self {
        self.lambda_init = lambda_init;
        self
    }
    pub fn with_lambda_bounds(mut self, lambda_min: T, lambda_max: T) -> Self {
        self.lambda_min = lambda_min;
        self.lambda_max = lambda_max;
        self
    }
}

/// Outcome of one [`solve`] call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LmStats<T> {
    /// Completed outer iterations.
    pub iters: usize,
    /// Final cost `½‖r‖²`.
    pub cost: T,
    /// Final `‖Jᵀr‖∞`.
    pub grad_norm: T,
    /// 2-norm of the last computed step.
    pub step_norm: T,
    pub status: LmStatus,
}

impl<T: Float> LmStats<T> {
    /// The residual 2-norm, `√(2·cost)`.
    pub fn residual_norm(&self) -> T {
        (self.cost + self.cost).sqrt()
    }
}

/// The part of the solver state that survives between solves: the current
/// parameter vector.
#[derive(Clone, Debug)]
pub struct LmState<T> {
    /// Current parameters; updated in place by [`solve`].
    pub x: Vec<T>,
}

/// Preallocated storage for a fixed problem structure.
///
/// Holds the Jacobian value array, the augmented `[J; √λ·I]` pattern and
/// values, the iteration buffers, and the QR factorization with its cached
/// symbolic analysis. Reusable across any number of solves until the
/// problem's sparsity pattern changes.
#[derive(Debug)]
pub struct LmWorkspace<T> {
    m: usize,
    n: usize,
    /// Jacobian values for the problem's fixed pattern, column-major.
    jac_vals: Vec<T>,
    /// Pattern of the augmented system: the Jacobian stacked on top of an
    /// `n×n` diagonal damping block.
    aug_sym: SymbolicSparseColMat<usize>,
    aug_vals: Vec<T>,
    /// Position of each column's damping entry in `aug_vals`.
    diag_idx: Vec<usize>,
    r: Vec<T>,
    r_trial: Vec<T>,
    g: Vec<T>,
    step: Vec<T>,
    x_trial: Vec<T>,
    rhs: Mat<T>,
    qr: SparseQr<T>,
}

impl<T> LmWorkspace<T> {
    /// Residuals at the state's current parameters.
    ///
    /// [`solve`] maintains this buffer so that on return it always holds
    /// `r(state.x)`, which lets callers report per-residual error without
    /// re-evaluating.
    pub fn residual(&self) -> &[T] {
        &self.r
    }
}

/// Validate the problem against an initial guess and allocate everything a
/// solve needs: state, buffers, the augmented pattern, and the QR solver.
///
/// The returned pair may be reused across [`solve`] calls for as long as the
/// system's sparsity pattern is unchanged.
pub fn initialize<S>(
    system: &S,
    x0: &[S::Real],
    options: &LmOptions<S::Real>,
) -> LmResult<(LmState<S::Real>, LmWorkspace<S::Real>)>
where
    S: LeastSquaresSystem,
    S::Real: ComplexField<Real = S::Real> + Float,
{
    let n = system.n_variables();
    let m = system.n_residuals();
    if x0.len() != n {
        return Err(Report::new(LmError::DimensionMismatch {
            expected: n,
            actual: x0.len(),
        }));
    }
    if !(options.lambda_min > S::Real::zero()) || options.lambda_max < options.lambda_min {
        return Err(Report::new(LmError::InvalidOptions));
    }

    let jac = system.jac_symbolic();
    debug_assert_eq!(jac.nrows(), m);
    debug_assert_eq!(jac.ncols(), n);
    let col_ptr = jac.col_ptr();
    let row_idx = jac.row_idx();
    let nnz = col_ptr[n];

    // Augmented pattern: every column keeps its Jacobian entries and gains
    // one damping entry at row m + col.
    let mut cells: Vec<Pair<usize, usize>> = Vec::with_capacity(nnz + n);
    for col in 0..n {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            cells.push(Pair {
                row: row_idx[idx],
                col,
            });
        }
        cells.push(Pair { row: m + col, col });
    }
    let (aug_sym, _) = SymbolicSparseColMat::try_new_from_indices(m + n, n, &cells)
        .change_context(LmError::Pattern)?;

    // The damping entry has the largest row index in its column, so it is
    // the last entry of each augmented column.
    let aug_col_ptr = aug_sym.col_ptr();
    let diag_idx: Vec<usize> = (0..n).map(|col| aug_col_ptr[col + 1] - 1).collect();
    let aug_nnz = aug_col_ptr[n];
    debug_assert_eq!(aug_nnz, nnz + n);

    let zero = S::Real::zero();
    Ok((
        LmState { x: x0.to_vec() },
        LmWorkspace {
            m,
            n,
            jac_vals: vec![zero; nnz],
            aug_sym,
            aug_vals: vec![zero; aug_nnz],
            diag_idx,
            r: vec![zero; m],
            r_trial: vec![zero; m],
            g: vec![zero; n],
            step: vec![zero; n],
            x_trial: vec![zero; n],
            rhs: Mat::zeros(m + n, 1),
            qr: SparseQr::default(),
        },
    ))
}

/// Run the damped least-squares iteration until a tolerance is met or the
/// iteration budget runs out. `state.x` is updated in place; non-convergence
/// is reported through the returned [`LmStats`], never as an error.
pub fn solve<S>(
    system: &S,
    state: &mut LmState<S::Real>,
    workspace: &mut LmWorkspace<S::Real>,
    options: &LmOptions<S::Real>,
) -> LmResult<LmStats<S::Real>>
where
    S: LeastSquaresSystem,
    S::Real: ComplexField<Real = S::Real> + Float,
{
    let m = workspace.m;
    let n = workspace.n;
    debug_assert_eq!(state.x.len(), n);

    let zero = S::Real::zero();
    let two = S::Real::one() + S::Real::one();
    let half = S::Real::one() / two;
    let shrink_above = NumCast::from(0.75).expect("type must support 0.75");
    let grow_below = NumCast::from(0.25).expect("type must support 0.25");

    let sym = system.jac_symbolic();
    debug_assert_eq!(sym.col_ptr()[n], workspace.jac_vals.len());

    system.residual(&state.x, &mut workspace.r);
    system.jacobian(&state.x, &mut workspace.jac_vals);
    let mut cost = half_squared_norm(&workspace.r);
    gradient(sym, &workspace.jac_vals, &workspace.r, &mut workspace.g);
    let mut grad_norm = inf_norm(&workspace.g);
    let r_norm_0 = (two * cost).sqrt();
    let mut lambda = options
        .lambda_init
        .max(options.lambda_min)
        .min(options.lambda_max);
    let mut step_norm = zero;
    let mut iters = 0;

    let status = loop {
        if grad_norm <= options.gtol
            || (two * cost).sqrt() <= options.atol + options.rtol * r_norm_0
        {
            break LmStatus::Converged;
        }
        if iters >= options.max_iters {
            break LmStatus::MaxIters;
        }

        // Refresh the augmented system: the Jacobian block column by column,
        // then √λ on the damping diagonal.
        let sqrt_lambda = lambda.sqrt();
        let jac_col_ptr = sym.col_ptr();
        let aug_col_ptr = workspace.aug_sym.col_ptr();
        for col in 0..n {
            let js = jac_col_ptr[col];
            let je = jac_col_ptr[col + 1];
            let dst = aug_col_ptr[col];
            workspace.aug_vals[dst..dst + (je - js)]
                .copy_from_slice(&workspace.jac_vals[js..je]);
            workspace.aug_vals[workspace.diag_idx[col]] = sqrt_lambda;
        }
        for i in 0..m {
            workspace.rhs[(i, 0)] = -workspace.r[i];
        }
        for i in 0..n {
            workspace.rhs[(m + i, 0)] = zero;
        }

        let aug = SparseColMatRef::new(workspace.aug_sym.as_ref(), &workspace.aug_vals);
        workspace.qr.factor(&aug)?;
        workspace.qr.solve_in_place(workspace.rhs.as_mut())?;
        for i in 0..n {
            workspace.step[i] = workspace.rhs[(i, 0)];
        }
        step_norm = two_norm(&workspace.step);

        // An infinitesimal step terminates with the current x intact; the
        // trial point is never evaluated.
        if step_norm <= options.step_tol {
            break LmStatus::StepTol;
        }

        for i in 0..n {
            workspace.x_trial[i] = state.x[i] + workspace.step[i];
        }
        system.residual(&workspace.x_trial, &mut workspace.r_trial);
        let cost_trial = half_squared_norm(&workspace.r_trial);

        // Reduction predicted by the damped quadratic model,
        // ½·Σ stepᵢ·(λ·stepᵢ − gᵢ).
        let mut pred = zero;
        for i in 0..n {
            pred = pred + workspace.step[i] * (lambda * workspace.step[i] - workspace.g[i]);
        }
        pred = half * pred;

        if pred <= zero {
            lambda = (two * lambda).min(options.lambda_max);
        } else {
            let rho = (cost - cost_trial) / pred;
            if cost_trial < cost {
                state.x.copy_from_slice(&workspace.x_trial);
                workspace.r.copy_from_slice(&workspace.r_trial);
                system.jacobian(&state.x, &mut workspace.jac_vals);
                gradient(sym, &workspace.jac_vals, &workspace.r, &mut workspace.g);
                grad_norm = inf_norm(&workspace.g);
                cost = cost_trial;
                if rho > shrink_above {
                    lambda = (lambda * half).max(options.lambda_min);
                } else if rho < grow_below {
                    lambda = (two * lambda).min(options.lambda_max);
                }
            } else {
                // Equal cost rejects too; accepting it could cycle on flat
                // regions.
                lambda = (two * lambda).min(options.lambda_max);
            }
        }

        trace!(
            iter = iters,
            cost = cost.to_f64().unwrap_or(f64::NAN),
            lambda = lambda.to_f64().unwrap_or(f64::NAN),
            "lm iteration"
        );
        iters += 1;
    };

    debug!(
        iters,
        status = ?status,
        cost = cost.to_f64().unwrap_or(f64::NAN),
        "lm solve finished"
    );
    Ok(LmStats {
        iters,
        cost,
        grad_norm,
        step_norm,
        status,
    })
}

fn half_squared_norm<T: Float>(v: &[T]) -> T {
    let mut acc = T::zero();
    for &vi in v {
        acc = acc + vi * vi;
    }
    acc / (T::one() + T::one())
}

fn two_norm<T: Float>(v: &[T]) -> T {
    let mut acc = T::zero();
    for &vi in v {
        acc = acc + vi * vi;
    }
    acc.sqrt()
}

fn inf_norm<T: Float>(v: &[T]) -> T {
    v.iter().fold(T::zero(), |a, &b| a.max(b.abs()))
}

/// `g = Jᵀr` over the fixed pattern.
fn gradient<T: Float>(sym: &SymbolicSparseColMat<usize>, vals: &[T], r: &[T], g: &mut [T]) {
    let col_ptr = sym.col_ptr();
    let row_idx = sym.row_idx();
    for (col, gc) in g.iter_mut().enumerate() {
        let mut acc = T::zero();
        for idx in col_ptr[col]..col_ptr[col + 1] {
            acc = acc + vals[idx] * r[row_idx[idx]];
        }
        *gc = acc;
    }
}
