//! The flat, index-addressed NLP evaluation interface.
use nalgebra::DVector;
use sprs::TriMat;

use crate::error::{Error, Result};

/// A nonlinear program addressed purely by primal and constraint positions.
///
/// Vector valued calls return dense vectors of the stated length, matrix valued calls return
/// coordinate format matrices. The objective is always minimized. Equality constraints are
/// reported as residuals with zero bounds, so `constraints_lb()[i] == constraints_ub()[i] == 0`
/// for every equality row.
pub trait Nlp {
    fn n_primals(&self) -> usize;
    fn n_constraints(&self) -> usize;
    fn n_eq_constraints(&self) -> usize;
    fn n_ineq_constraints(&self) -> usize {
        self.n_constraints() - self.n_eq_constraints()
    }
    fn nnz_jacobian(&self) -> usize;
    fn nnz_jacobian_eq(&self) -> usize;
    fn nnz_jacobian_ineq(&self) -> usize {
        self.nnz_jacobian() - self.nnz_jacobian_eq()
    }
    /// Number of structural nonzeros in the lower triangle of the Hessian of the Lagrangian.
    fn nnz_hessian_lag(&self) -> Result<usize>;

    fn primals_lb(&self) -> DVector<f64>;
    fn primals_ub(&self) -> DVector<f64>;
    fn constraints_lb(&self) -> DVector<f64>;
    fn constraints_ub(&self) -> DVector<f64>;
    fn init_primals(&self) -> DVector<f64>;
    fn init_duals(&self) -> DVector<f64>;
    fn init_duals_eq(&self) -> DVector<f64>;

    fn set_primals(&mut self, primals: &[f64]) -> Result<()>;
    fn get_primals(&self) -> DVector<f64>;
    fn set_duals(&mut self, duals: &[f64]) -> Result<()>;
    fn get_duals(&self) -> DVector<f64>;
    fn set_duals_eq(&mut self, duals: &[f64]) -> Result<()>;
    fn get_duals_eq(&self) -> DVector<f64>;
    fn set_obj_factor(&mut self, obj_factor: f64);
    fn get_obj_factor(&self) -> f64;

    fn evaluate_objective(&mut self) -> Result<f64>;
    fn evaluate_grad_objective(&mut self) -> Result<DVector<f64>>;

    /// Evaluate all constraint residuals into `out`, which must have length `n_constraints()`.
    fn evaluate_constraints_into(&mut self, out: &mut [f64]) -> Result<()>;

    fn evaluate_constraints(&mut self) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.n_constraints());
        self.evaluate_constraints_into(out.as_mut_slice())?;
        Ok(out)
    }

    /// Evaluate the equality residuals into `out`, which must have length `n_eq_constraints()`.
    fn evaluate_eq_constraints_into(&mut self, out: &mut [f64]) -> Result<()>;

    fn evaluate_eq_constraints(&mut self) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.n_eq_constraints());
        self.evaluate_eq_constraints_into(out.as_mut_slice())?;
        Ok(out)
    }

    fn evaluate_ineq_constraints(&mut self) -> Result<DVector<f64>>;

    fn evaluate_jacobian(&mut self) -> Result<TriMat<f64>>;
    fn evaluate_jacobian_eq(&mut self) -> Result<TriMat<f64>>;
    fn evaluate_jacobian_ineq(&mut self) -> Result<TriMat<f64>>;

    /// Lower triangle of `obj_factor * ∇²f + Σ λ_i ∇²g_i` at the current primals and duals.
    fn evaluate_hessian_lag(&mut self) -> Result<TriMat<f64>>;
}

/// A cached value that is either up to date or must be recomputed on the next read.
#[derive(Clone, Debug)]
pub(crate) enum Cache<T> {
    Valid(T),
    Stale,
}

impl<T> Cache<T> {
    pub(crate) fn invalidate(&mut self) {
        *self = Cache::Stale;
    }

    pub(crate) fn get_or_try_insert_with<E>(
        &mut self,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<&T, E> {
        if let Cache::Stale = self {
            *self = Cache::Valid(f()?);
        }
        match self {
            Cache::Valid(value) => Ok(value),
            Cache::Stale => unreachable!("cache was filled above"),
        }
    }
}

pub(crate) fn check_len(operation: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::BufferSize {
            operation,
            expected,
            found,
        })
    }
}

/// `[head; tail]`
pub(crate) fn concat(head: &DVector<f64>, tail: &[f64]) -> DVector<f64> {
    DVector::from_iterator(
        head.len() + tail.len(),
        head.iter().chain(tail.iter()).copied(),
    )
}

/// Append the triplets of `src` to `dst`, shifting rows by `row_offset`.
pub(crate) fn append_triplets(dst: &mut TriMat<f64>, src: &TriMat<f64>, row_offset: usize) {
    for ((&r, &c), &v) in src.row_inds().iter().zip(src.col_inds()).zip(src.data()) {
        dst.add_triplet(r + row_offset, c, v);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_recomputes_only_when_stale() {
        let mut cache = Cache::Stale;
        let mut calls = 0;
        let mut read = |cache: &mut Cache<i32>| {
            *cache
                .get_or_try_insert_with(|| {
                    calls += 1;
                    Ok::<_, Error>(42)
                })
                .unwrap()
        };
        assert_eq!(read(&mut cache), 42);
        assert_eq!(read(&mut cache), 42);
        cache.invalidate();
        assert_eq!(read(&mut cache), 42);
        drop(read);
        assert_eq!(calls, 2);
    }

    #[test]
    fn append_shifts_rows() {
        let src = TriMat::from_triplets((2, 3), vec![0, 1], vec![2, 0], vec![1.0, 2.0]);
        let mut dst = TriMat::new((4, 3));
        dst.add_triplet(0, 0, 5.0);
        append_triplets(&mut dst, &src, 2);
        assert_eq!(dst.row_inds(), &[0, 2, 3]);
        assert_eq!(dst.col_inds(), &[0, 2, 0]);
        assert_eq!(dst.data(), &[5.0, 1.0, 2.0]);
    }

    #[test]
    fn buffer_length_is_checked() {
        assert!(check_len("op", 3, 3).is_ok());
        assert!(matches!(
            check_len("op", 3, 2),
            Err(Error::BufferSize {
                expected: 3,
                found: 2,
                ..
            })
        ));
    }
}
