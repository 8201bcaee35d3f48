use error_stack::ResultExt;
use faer::{
    mat::MatMut,
    prelude::SolveLstsq,
    sparse::{
        SparseColMatRef,
        linalg::solvers::{Qr, SymbolicQr},
    },
};
use faer_traits::ComplexField;

use crate::{LmError, LmResult};

/// Identity of a CSC pattern. Two matrices with the same identity share the
/// same structure, so a cached symbolic factorization applies to both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PatternId {
    nrows: usize,
    ncols: usize,
    nnz: usize,
    col_ptr: *const usize,
    row_idx: *const usize,
}

fn pattern_id<T>(a: &SparseColMatRef<'_, usize, T>) -> PatternId {
    let sym = a.symbolic();
    let col_ptr = sym.col_ptr();
    PatternId {
        nrows: a.nrows(),
        ncols: a.ncols(),
        nnz: col_ptr[a.ncols()],
        col_ptr: col_ptr.as_ptr(),
        row_idx: sym.row_idx().as_ptr(),
    }
}

/// Seam between the outer iteration and the factorization backend.
pub trait LinearSolver<T: ComplexField<Real = T>, M> {
    fn factor(&mut self, a: &M) -> LmResult<()>;
    /// Least-squares solve in place: the solution lands in the top
    /// `ncols(A)` rows of `rhs`.
    fn solve_in_place(&mut self, rhs: MatMut<T>) -> LmResult<()>;
}

/// Sparse QR with a cached symbolic analysis.
///
/// The column ordering and elimination structure only depend on the sparsity
/// pattern, so they are computed once per pattern and reused across numeric
/// refactorizations. Don't share one `SparseQr` across threads; create one
/// per worker and reuse it within that worker.
#[derive(Debug)]
pub struct SparseQr<T> {
    symbolic: Option<SymbolicQr<usize>>,
    qr: Option<Qr<usize, T>>,
    id: Option<PatternId>,
}

impl<T> Default for SparseQr<T> {
    fn default() -> Self {
        Self {
            symbolic: None,
            qr: None,
            id: None,
        }
    }
}

impl<T: ComplexField<Real = T>> LinearSolver<T, SparseColMatRef<'_, usize, T>> for SparseQr<T> {
    fn factor(&mut self, a: &SparseColMatRef<'_, usize, T>) -> LmResult<()> {
        let now = pattern_id(a);

        if self.id != Some(now) {
            self.symbolic = Some(
                SymbolicQr::try_new(a.symbolic())
                    .attach_printable("QR symbolic factorization failed")
                    .change_context(LmError::Factorization)?,
            );
            self.id = Some(now);
        }

        let symbolic = self
            .symbolic
            .as_ref()
            .ok_or(LmError::Factorization)
            .attach_printable("symbolic factorization not available")?;

        self.qr = Some(
            Qr::try_new_with_symbolic(symbolic.clone(), *a)
                .attach_printable("numeric QR factorization failed")
                .change_context(LmError::Factorization)?,
        );

        Ok(())
    }

    fn solve_in_place(&mut self, mut rhs: MatMut<T>) -> LmResult<()> {
        let qr = self
            .qr
            .as_ref()
            .ok_or(LmError::Factorization)
            .attach_printable("QR factorization not available for solve")?;

        qr.solve_lstsq_in_place(rhs.as_mut());
        Ok(())
    }
}
