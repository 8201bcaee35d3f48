use faer::sparse::SparseColMatRef;

use crate::{Error, Sketch};

/// How much freedom the current constraint set leaves the sketch.
///
/// An underconstrained sketch still solves; the leftover degrees of freedom
/// just mean some points stay wherever their guesses (or the previous
/// solution) put them.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedomAnalysis {
    /// Number of independent directions the points can move in without
    /// violating any constraint, to first order.
    pub degrees_of_freedom: usize,
}

impl FreedomAnalysis {
    pub fn is_underconstrained(&self) -> bool {
        self.degrees_of_freedom > 0
    }
}

impl Sketch {
    /// Rank analysis of the compiled Jacobian at the current coordinates.
    ///
    /// This densifies the Jacobian and runs a full SVD, so it is much more
    /// expensive than a solve; call it for diagnostics, not per frame.
    /// Requires a compiled problem, i.e. a `solve` since the last
    /// structural edit.
    pub fn freedom_analysis(&mut self) -> Result<FreedomAnalysis, Error> {
        if self.structure_dirty() {
            return Err(Error::StructureDirty);
        }
        let Some(cache) = self.cache.as_mut() else {
            return Err(Error::StructureDirty);
        };

        let compiled = &cache.compiled;
        compiled.jacobian(&self.constraints, &self.x, &mut cache.jac_scratch);

        // Faer has no sparse SVD, so go dense for the rank computation.
        let dense =
            SparseColMatRef::new(compiled.jac_symbolic().as_ref(), &cache.jac_scratch).to_dense();
        let svd = dense.svd().map_err(Error::Svd)?;
        let sigma = svd.S().column_vector();

        // Singular values near zero mean unconstrained directions. "Near" is
        // measured relative to the largest singular value.
        let largest = sigma.iter().copied().fold(0.0_f64, f64::max);
        let tolerance = 1e-8 * largest;
        let rank = sigma.iter().filter(|&&s| s > tolerance).count();

        Ok(FreedomAnalysis {
            degrees_of_freedom: compiled.n_variables() - rank,
        })
    }
}
