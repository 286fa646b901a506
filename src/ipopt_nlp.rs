//! Solve any [`Nlp`] with [IPOPT](https://coin-or.github.io/Ipopt/index.html).
//!
//! Requires the `ipopt` feature.
use std::cell::RefCell;

use ipopt::{BasicProblem, ConstrainedProblem, Ipopt};
use sprs::TriMat;

use crate::error::{Error, Result};
use crate::nlp::Nlp;

/// Wrapper struct that fixes the sparsity structures of an [`Nlp`] at its current primals and
/// forwards the IPOPT callbacks.
///
/// NLPs without a Hessian of the Lagrangian (like [`GreyBoxNlp`](crate::GreyBoxNlp)) report no
/// Hessian nonzeros; [`IpoptNlp::into_solver`] configures the limited-memory approximation for
/// them.
pub struct IpoptNlp<N> {
    nlp: RefCell<N>,
    has_hessian: bool,
    jac_row_vec: Vec<i32>,
    jac_col_vec: Vec<i32>,
    hess_row_vec: Vec<i32>,
    hess_col_vec: Vec<i32>,
}

fn indices(m: &TriMat<f64>) -> (Vec<i32>, Vec<i32>) {
    (
        m.row_inds().iter().map(|&r| r as i32).collect(),
        m.col_inds().iter().map(|&c| c as i32).collect(),
    )
}

impl<N: Nlp> IpoptNlp<N> {
    pub fn new(mut nlp: N) -> Result<Self> {
        let (jac_row_vec, jac_col_vec) = indices(&nlp.evaluate_jacobian()?);
        let (has_hessian, (hess_row_vec, hess_col_vec)) = match nlp.evaluate_hessian_lag() {
            Ok(hess) => (true, indices(&hess)),
            Err(Error::NotImplemented(_)) => (false, (Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };
        Ok(Self {
            nlp: RefCell::new(nlp),
            has_hessian,
            jac_row_vec,
            jac_col_vec,
            hess_row_vec,
            hess_col_vec,
        })
    }

    /// Whether exact second derivatives are available to the solver.
    pub fn has_hessian(&self) -> bool {
        self.has_hessian
    }

    /// Create the IPOPT solver for this problem. Without exact second derivatives the
    /// `hessian_approximation` option is set to `limited-memory`.
    pub fn into_solver(self) -> Result<Ipopt<Self>> {
        let has_hessian = self.has_hessian;
        let mut ipopt =
            Ipopt::new(self).map_err(|e| Error::Engine(format!("cannot create IPOPT: {e:?}")))?;
        if !has_hessian {
            log::debug!("no exact Hessian available, using limited-memory approximation");
            ipopt.set_option("hessian_approximation", "limited-memory");
        }
        Ok(ipopt)
    }

    pub fn into_inner(self) -> N {
        self.nlp.into_inner()
    }

    fn with_primals(&self, x: &[f64], new_x: bool, f: impl FnOnce(&mut N) -> Result<()>) -> bool {
        let mut nlp = self.nlp.borrow_mut();
        let evaluate = || {
            if new_x {
                nlp.set_primals(x)?;
            }
            f(&mut nlp)
        };
        match evaluate() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("NLP evaluation failed: {e}");
                false
            }
        }
    }
}

impl<N: Nlp> BasicProblem for IpoptNlp<N> {
    fn num_variables(&self) -> usize {
        self.nlp.borrow().n_primals()
    }

    fn bounds(&self, x_l: &mut [f64], x_u: &mut [f64]) -> bool {
        let nlp = self.nlp.borrow();
        x_l.copy_from_slice(nlp.primals_lb().as_slice());
        x_u.copy_from_slice(nlp.primals_ub().as_slice());
        true
    }

    fn initial_point(&self, x: &mut [f64]) -> bool {
        x.copy_from_slice(self.nlp.borrow().init_primals().as_slice());
        true
    }

    fn objective(&self, x: &[f64], new_x: bool, obj: &mut f64) -> bool {
        self.with_primals(x, new_x, |nlp| {
            *obj = nlp.evaluate_objective()?;
            Ok(())
        })
    }

    fn objective_grad(&self, x: &[f64], new_x: bool, grad_f: &mut [f64]) -> bool {
        self.with_primals(x, new_x, |nlp| {
            grad_f.copy_from_slice(nlp.evaluate_grad_objective()?.as_slice());
            Ok(())
        })
    }
}

impl<N: Nlp> ConstrainedProblem for IpoptNlp<N> {
    fn num_constraints(&self) -> usize {
        self.nlp.borrow().n_constraints()
    }

    fn num_constraint_jacobian_non_zeros(&self) -> usize {
        self.jac_row_vec.len()
    }

    fn constraint(&self, x: &[f64], new_x: bool, g: &mut [f64]) -> bool {
        self.with_primals(x, new_x, |nlp| nlp.evaluate_constraints_into(g))
    }

    fn constraint_bounds(&self, g_l: &mut [f64], g_u: &mut [f64]) -> bool {
        let nlp = self.nlp.borrow();
        g_l.copy_from_slice(nlp.constraints_lb().as_slice());
        g_u.copy_from_slice(nlp.constraints_ub().as_slice());
        true
    }

    fn constraint_jacobian_indices(&self, rows: &mut [i32], cols: &mut [i32]) -> bool {
        rows.copy_from_slice(&self.jac_row_vec);
        cols.copy_from_slice(&self.jac_col_vec);
        true
    }

    fn constraint_jacobian_values(&self, x: &[f64], new_x: bool, vals: &mut [f64]) -> bool {
        let expected = self.jac_row_vec.len();
        self.with_primals(x, new_x, |nlp| {
            let jac = nlp.evaluate_jacobian()?;
            if jac.nnz() != expected {
                return Err(Error::Engine(format!(
                    "Jacobian structure changed from {expected} to {} nonzeros",
                    jac.nnz()
                )));
            }
            vals.copy_from_slice(jac.data());
            Ok(())
        })
    }

    fn num_hessian_non_zeros(&self) -> usize {
        self.hess_row_vec.len()
    }

    fn hessian_indices(&self, rows: &mut [i32], cols: &mut [i32]) -> bool {
        rows.copy_from_slice(&self.hess_row_vec);
        cols.copy_from_slice(&self.hess_col_vec);
        true
    }

    fn hessian_values(
        &self,
        x: &[f64],
        new_x: bool,
        obj_factor: f64,
        lambda: &[f64],
        vals: &mut [f64],
    ) -> bool {
        self.with_primals(x, new_x, |nlp| {
            nlp.set_obj_factor(obj_factor);
            nlp.set_duals(lambda)?;
            vals.copy_from_slice(nlp.evaluate_hessian_lag()?.data());
            Ok(())
        })
    }
}
