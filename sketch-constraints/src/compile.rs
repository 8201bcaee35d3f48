use faer::sparse::{Pair, SymbolicSparseColMat};
use lm_faer::LeastSquaresSystem;
use tracing::debug;

use crate::{Constraint, Error};

// Most constraints touch at most 8 columns; round scratch capacity to that.
const NONZEROES_PER_CONSTRAINT: usize = 8;

/// A constraint list lowered to a fixed-pattern least-squares problem.
///
/// Compiling assigns each constraint a contiguous block of residual rows (a
/// prefix sum of [`Constraint::residual_dim`]), builds the column-compressed
/// sparsity pattern of the Jacobian, and precomputes one value-array
/// position per structural write so that residual and Jacobian evaluation
/// are straight scatter loops with no search and no allocation.
pub struct CompiledProblem {
    m: usize,
    n: usize,
    /// First residual row of each constraint.
    row_offsets: Vec<usize>,
    sym: SymbolicSparseColMat<usize>,
    /// Value-array positions each constraint writes, flattened in the
    /// constraints' canonical layout order.
    slots: Vec<usize>,
    /// Bounds of each constraint's span in `slots`; one extra entry at the
    /// end.
    slot_offsets: Vec<usize>,
}

impl CompiledProblem {
    pub fn compile(constraints: &[Constraint], n_points: usize) -> Result<Self, Error> {
        let n = 2 * n_points;
        let m: usize = constraints.iter().map(|c| c.residual_dim()).sum();
        if n == 0 || m == 0 {
            return Err(Error::EmptySketch);
        }

        // First pass: assign rows and collect every structural write, in
        // each constraint's canonical order.
        let mut layout: Vec<(usize, usize)> =
            Vec::with_capacity(NONZEROES_PER_CONSTRAINT * constraints.len());
        let mut row_offsets = Vec::with_capacity(constraints.len());
        let mut slot_offsets = Vec::with_capacity(constraints.len() + 1);
        let mut scratch = Vec::with_capacity(NONZEROES_PER_CONSTRAINT);
        let mut row = 0;
        for constraint in constraints {
            row_offsets.push(row);
            slot_offsets.push(layout.len());
            scratch.clear();
            constraint.jacobian_layout(&mut scratch);
            for &(local_row, col) in &scratch {
                debug_assert!(local_row < constraint.residual_dim());
                layout.push((row + local_row, col));
            }
            row += constraint.residual_dim();
        }
        slot_offsets.push(layout.len());
        debug_assert_eq!(row, m);

        // Compress to CSC. Duplicate cells (shapes sharing a point within
        // one constraint) merge into a single structural nonzero.
        let cells: Vec<Pair<usize, usize>> = layout
            .iter()
            .map(|&(row, col)| Pair { row, col })
            .collect();
        let (sym, _) = SymbolicSparseColMat::try_new_from_indices(m, n, &cells)?;

        // Second pass: map each structural write back to its position in
        // the value array. Every layout entry exists in the pattern by
        // construction.
        let col_ptr = sym.col_ptr();
        let row_idx = sym.row_idx();
        let mut slots = Vec::with_capacity(layout.len());
        for &(row, col) in &layout {
            let start = col_ptr[col];
            let pos = row_idx[start..col_ptr[col + 1]]
                .iter()
                .position(|&r| r == row)
                .expect("structural nonzero must exist in the compiled pattern");
            slots.push(start + pos);
        }

        debug!(
            m,
            n,
            nnz = col_ptr[n],
            constraints = constraints.len(),
            "compiled sketch constraint system"
        );
        Ok(Self {
            m,
            n,
            row_offsets,
            sym,
            slots,
            slot_offsets,
        })
    }

    pub fn n_residuals(&self) -> usize {
        self.m
    }

    pub fn n_variables(&self) -> usize {
        self.n
    }

    pub fn jac_symbolic(&self) -> &SymbolicSparseColMat<usize> {
        &self.sym
    }

    /// First residual row of constraint `i`.
    pub(crate) fn row_offset(&self, i: usize) -> usize {
        self.row_offsets[i]
    }

    /// Evaluate all residuals at `x` into `out` (length `m`).
    pub fn residual(&self, constraints: &[Constraint], x: &[f64], out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.m);
        out.fill(0.0);
        for (i, constraint) in constraints.iter().enumerate() {
            let start = self.row_offsets[i];
            constraint.residual_into(x, &mut out[start..start + constraint.residual_dim()]);
        }
    }

    /// Evaluate the Jacobian at `x` into the pattern's value array.
    pub fn jacobian(&self, constraints: &[Constraint], x: &[f64], nzval: &mut [f64]) {
        nzval.fill(0.0);
        for (i, constraint) in constraints.iter().enumerate() {
            let slots = &self.slots[self.slot_offsets[i]..self.slot_offsets[i + 1]];
            constraint.jacobian_into(x, slots, nzval);
        }
    }
}

/// Borrowed view tying a compiled problem to the sketch's live constraint
/// list; this is what the LM engine sees.
pub(crate) struct SketchProblem<'a> {
    pub(crate) compiled: &'a CompiledProblem,
    pub(crate) constraints: &'a [Constraint],
}

impl LeastSquaresSystem for SketchProblem<'_> {
    type Real = f64;

    fn n_variables(&self) -> usize {
        self.compiled.n
    }

    fn n_residuals(&self) -> usize {
        self.compiled.m
    }

    fn jac_symbolic(&self) -> &SymbolicSparseColMat<usize> {
        &self.compiled.sym
    }

    fn residual(&self, x: &[f64], out: &mut [f64]) {
        self.compiled.residual(self.constraints, x, out);
    }

    fn jacobian(&self, x: &[f64], nzval: &mut [f64]) {
        self.compiled.jacobian(self.constraints, x, nzval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::Line;

    #[test]
    fn rows_follow_insertion_order() {
        let constraints = [
            Constraint::FixedPoint(1, 0.0, 0.0),
            Constraint::Horizontal(Line::new(1, 2)),
            Constraint::Coincident(2, 3),
            Constraint::Vertical(Line::new(2, 3)),
        ];
        let compiled = CompiledProblem::compile(&constraints, 3).unwrap();

        assert_eq!(compiled.n_residuals(), 2 + 1 + 2 + 1);
        assert_eq!(compiled.n_variables(), 6);
        assert_eq!(compiled.row_offsets, vec![0, 2, 3, 5]);
    }

    #[test]
    fn empty_systems_are_rejected() {
        assert!(matches!(
            CompiledProblem::compile(&[], 3),
            Err(Error::EmptySketch)
        ));
        assert!(matches!(
            CompiledProblem::compile(&[Constraint::FixedPoint(1, 0.0, 0.0)], 0),
            Err(Error::EmptySketch)
        ));
    }

    #[test]
    fn shared_point_merges_into_one_nonzero() {
        // Both lines of the parallel constraint use point 2, so its two
        // columns each appear once in the pattern but twice in the slot
        // table.
        let constraints = [Constraint::Parallel(Line::new(1, 2), Line::new(2, 3))];
        let compiled = CompiledProblem::compile(&constraints, 3).unwrap();

        // One row, 6 distinct columns.
        assert_eq!(compiled.n_residuals(), 1);
        assert_eq!(compiled.sym.col_ptr()[compiled.n_variables()], 6);
        assert_eq!(compiled.slots.len(), 8);
    }

    #[test]
    fn compiled_jacobian_matches_finite_differences() {
        let constraints = [
            Constraint::FixedPoint(1, 0.1, -0.2),
            Constraint::Distance(1, 2, 2.0),
            Constraint::Parallel(Line::new(1, 2), Line::new(2, 3)),
        ];
        let compiled = CompiledProblem::compile(&constraints, 3).unwrap();
        let x = [0.3, -1.2, 2.0, 1.5, -0.7, 0.4];
        let m = compiled.n_residuals();
        let n = compiled.n_variables();

        let nnz = compiled.sym.col_ptr()[n];
        let mut vals = vec![0.0; nnz];
        compiled.jacobian(&constraints, &x, &mut vals);

        // Expand CSC into a dense matrix for comparison.
        let mut dense = vec![vec![0.0; n]; m];
        let col_ptr = compiled.sym.col_ptr();
        let row_idx = compiled.sym.row_idx();
        for col in 0..n {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                dense[row_idx[idx]][col] = vals[idx];
            }
        }

        let h = 1e-5;
        let mut probe = x.to_vec();
        let mut plus = vec![0.0; m];
        let mut minus = vec![0.0; m];
        for col in 0..n {
            probe[col] = x[col] + h;
            compiled.residual(&constraints, &probe, &mut plus);
            probe[col] = x[col] - h;
            compiled.residual(&constraints, &probe, &mut minus);
            probe[col] = x[col];
            for row in 0..m {
                let numeric = (plus[row] - minus[row]) / (2.0 * h);
                assert!(
                    (dense[row][col] - numeric).abs() < 1e-6,
                    "row {row} col {col}: analytic {}, numeric {numeric}",
                    dense[row][col],
                );
            }
        }
    }
}
