//! Grey-box models: externally supplied residual functions contributing additional primals and
//! equality constraints to an NLP.
use std::rc::Rc;

use nalgebra::DVector;
use num_dual::{Dual64, DualNum};
use sprs::TriMat;

use crate::error::{Error, Result};
use crate::model::{GreyBoxData, VarId};
use crate::symbols::PositionMap;

/// An opaque function with derivatives, `r(u) = 0`, over named inputs `u`.
pub trait ExternalGreyBoxModel {
    fn input_names(&self) -> Vec<String>;

    fn equality_constraint_names(&self) -> Vec<String>;

    /// Residuals at `inputs`, one per equality constraint.
    fn evaluate_equality_constraints(&self, inputs: &[f64]) -> DVector<f64>;

    /// Jacobian of the residuals at `inputs` with shape `(n_constraints, n_inputs)`.
    ///
    /// The sparsity structure (order and count of triplets) must not depend on `inputs`.
    fn evaluate_jacobian_equality_constraints(&self, inputs: &[f64]) -> TriMat<f64>;

    /// Initial multipliers of the equality constraints. Defaults to zeros.
    fn initial_duals(&self) -> Option<DVector<f64>> {
        None
    }

    /// Receive the current multipliers of the equality constraints.
    fn set_equality_constraint_multipliers(&self, _duals: &[f64]) {}
}

/// Residual functions written generically over dual numbers.
pub trait GreyBoxFunction {
    fn input_names(&self) -> Vec<String>;

    fn equality_constraint_names(&self) -> Vec<String>;

    fn residuals<D: DualNum<f64> + Copy>(&self, inputs: &[D]) -> Vec<D>;
}

/// Turns a [`GreyBoxFunction`] into an [`ExternalGreyBoxModel`] whose Jacobian is computed by
/// automatic differentiation.
///
/// The sparsity structure is detected once, from the given inputs and from points shifted
/// away from them: every entry whose derivative is nonzero (or not a number) at any of these
/// points becomes structural.
pub struct AdGreyBox<T> {
    function: T,
    n_constraints: usize,
    jac_row_vec: Vec<usize>,
    jac_col_vec: Vec<usize>,
}

/// Offsets of the additional structure detection points.
const STRUCTURE_SHIFTS: [f64; 2] = [0.377_964_473, -0.711_237_034];

impl<T: GreyBoxFunction> AdGreyBox<T> {
    pub fn new(function: T, inputs: &[f64]) -> Self {
        let mut points = vec![inputs.to_vec()];
        for shift in STRUCTURE_SHIFTS {
            points.push(
                inputs
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| x + shift * (1.0 + 0.131 * i as f64))
                    .collect(),
            );
        }

        let mut jac_row_vec = Vec::new();
        let mut jac_col_vec = Vec::new();
        let mut n_constraints = function.equality_constraint_names().len();
        for i in 0..inputs.len() {
            let mut structural = vec![false; n_constraints];
            for x in &points {
                let column = column(&function, x, i);
                if column.len() > structural.len() {
                    structural.resize(column.len(), false);
                }
                for (s, c) in structural.iter_mut().zip(column) {
                    *s |= c != 0.0;
                }
            }
            n_constraints = structural.len();
            for (j, _) in structural.into_iter().enumerate().filter(|(_, s)| *s) {
                jac_row_vec.push(j);
                jac_col_vec.push(i);
            }
        }
        Self {
            function,
            n_constraints,
            jac_row_vec,
            jac_col_vec,
        }
    }

    pub fn nnz_jacobian(&self) -> usize {
        self.jac_row_vec.len()
    }
}

fn column<T: GreyBoxFunction>(function: &T, inputs: &[f64], i: usize) -> Vec<f64> {
    let mut x: Vec<Dual64> = inputs.iter().copied().map(Dual64::from).collect();
    x[i] = Dual64::new(inputs[i], 1.0);
    function.residuals(&x).into_iter().map(|r| r.eps).collect()
}

impl<T: GreyBoxFunction> ExternalGreyBoxModel for AdGreyBox<T> {
    fn input_names(&self) -> Vec<String> {
        self.function.input_names()
    }

    fn equality_constraint_names(&self) -> Vec<String> {
        self.function.equality_constraint_names()
    }

    fn evaluate_equality_constraints(&self, inputs: &[f64]) -> DVector<f64> {
        DVector::from_vec(self.function.residuals(inputs))
    }

    fn evaluate_jacobian_equality_constraints(&self, inputs: &[f64]) -> TriMat<f64> {
        let mut jac =
            TriMat::with_capacity((self.n_constraints, inputs.len()), self.nnz_jacobian());
        // structure is column-major, so each column is differentiated once
        let mut current = None;
        let mut values = Vec::new();
        for (&r, &c) in self.jac_row_vec.iter().zip(&self.jac_col_vec) {
            if current != Some(c) {
                values = column(&self.function, inputs, c);
                current = Some(c);
            }
            jac.add_triplet(r, c, values[r]);
        }
        jac
    }
}

/// Evaluation helper for one active grey-box data instance inside a merged index space.
pub struct GreyBoxHelper {
    name: String,
    external: Rc<dyn ExternalGreyBoxModel>,
    primal_indices: Vec<usize>,
    constraint_names: Vec<String>,
    nnz_jacobian: usize,
    init_duals: DVector<f64>,
}

impl GreyBoxHelper {
    /// Resolve the merged positions of the data's inputs and detect the Jacobian structure at
    /// `primals`.
    pub fn new(
        data: &GreyBoxData,
        positions: &PositionMap<VarId>,
        primals: &[f64],
    ) -> Result<Self> {
        let primal_indices = data
            .inputs
            .iter()
            .map(|&v| positions.get(v).ok_or(Error::UnknownVariable(v)))
            .collect::<Result<Vec<_>>>()?;
        let constraint_names = data.external.equality_constraint_names();
        let mut helper = Self {
            name: data.name.clone(),
            external: Rc::clone(&data.external),
            primal_indices,
            constraint_names,
            nnz_jacobian: 0,
            init_duals: DVector::zeros(0),
        };
        let n = helper.n_constraints();
        helper.init_duals = match helper.external.initial_duals() {
            Some(duals) if duals.len() != n => {
                return Err(helper.error(format!(
                    "{} initial duals for {n} equality constraints",
                    duals.len()
                )))
            }
            Some(duals) => duals,
            None => DVector::zeros(n),
        };
        let inputs = helper.inputs(primals);
        helper.nnz_jacobian = helper.checked_jacobian(&inputs)?.nnz();
        Ok(helper)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_primals(&self) -> usize {
        self.primal_indices.len()
    }

    pub fn n_constraints(&self) -> usize {
        self.constraint_names.len()
    }

    pub fn nnz_jacobian(&self) -> usize {
        self.nnz_jacobian
    }

    /// Merged positions of the inputs, in input order.
    pub fn primal_indices(&self) -> &[usize] {
        &self.primal_indices
    }

    pub fn constraints_lb(&self) -> DVector<f64> {
        DVector::zeros(self.n_constraints())
    }

    pub fn constraints_ub(&self) -> DVector<f64> {
        DVector::zeros(self.n_constraints())
    }

    pub fn init_duals(&self) -> &DVector<f64> {
        &self.init_duals
    }

    /// Qualified constraint names, `data.constraint`.
    pub fn constraint_names(&self) -> impl Iterator<Item = String> + '_ {
        self.constraint_names
            .iter()
            .map(move |c| format!("{}.{c}", self.name))
    }

    fn inputs(&self, primals: &[f64]) -> Vec<f64> {
        self.primal_indices.iter().map(|&i| primals[i]).collect()
    }

    fn error(&self, message: String) -> Error {
        Error::GreyBox {
            name: self.name.clone(),
            message,
        }
    }

    fn checked_jacobian(&self, inputs: &[f64]) -> Result<TriMat<f64>> {
        let jac = self.external.evaluate_jacobian_equality_constraints(inputs);
        if jac.shape() != (self.n_constraints(), self.n_primals()) {
            return Err(self.error(format!(
                "Jacobian has shape {:?}, expected {:?}",
                jac.shape(),
                (self.n_constraints(), self.n_primals())
            )));
        }
        Ok(jac)
    }

    /// Residuals at the merged primal vector.
    pub fn evaluate_constraints(&self, primals: &[f64]) -> Result<DVector<f64>> {
        let residuals = self
            .external
            .evaluate_equality_constraints(&self.inputs(primals));
        if residuals.len() != self.n_constraints() {
            return Err(self.error(format!(
                "{} residuals for {} equality constraints",
                residuals.len(),
                self.n_constraints()
            )));
        }
        Ok(residuals)
    }

    /// Jacobian at the merged primal vector, with columns in the merged index space and rows
    /// local to this helper.
    pub fn evaluate_jacobian(&self, primals: &[f64]) -> Result<TriMat<f64>> {
        let local = self.checked_jacobian(&self.inputs(primals))?;
        if local.nnz() != self.nnz_jacobian {
            return Err(self.error(format!(
                "Jacobian structure changed from {} to {} nonzeros",
                self.nnz_jacobian,
                local.nnz()
            )));
        }
        let mut jac = TriMat::with_capacity((self.n_constraints(), primals.len()), local.nnz());
        for ((&r, &c), &v) in local.row_inds().iter().zip(local.col_inds()).zip(local.data()) {
            jac.add_triplet(r, self.primal_indices[c], v);
        }
        Ok(jac)
    }

    pub fn set_duals(&self, duals: &[f64]) {
        self.external.set_equality_constraint_multipliers(duals);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Model;
    use crate::test_utils::{to_dense, Pressure};
    use approx::assert_relative_eq;

    #[test]
    fn ad_grey_box_detects_structure() {
        let gb = AdGreyBox::new(Pressure, &[1.0, 2.0, 3.0]);
        assert_eq!(gb.nnz_jacobian(), 3);
        let jac = gb.evaluate_jacobian_equality_constraints(&[2.0, 3.0, 4.0]);
        let dense = to_dense(&jac);
        // p - t / v
        assert_relative_eq!(dense[0][0], 1.0);
        assert_relative_eq!(dense[0][1], -1.0 / 4.0);
        assert_relative_eq!(dense[0][2], 3.0 / 16.0);
        let r = gb.evaluate_equality_constraints(&[2.0, 3.0, 4.0]);
        assert_relative_eq!(r[0], 2.0 - 0.75);
    }

    /// `a b = 0`
    struct Product;

    impl GreyBoxFunction for Product {
        fn input_names(&self) -> Vec<String> {
            vec!["a".into(), "b".into()]
        }

        fn equality_constraint_names(&self) -> Vec<String> {
            vec!["product".into()]
        }

        fn residuals<D: DualNum<f64> + Copy>(&self, inputs: &[D]) -> Vec<D> {
            vec![inputs[0] * inputs[1]]
        }
    }

    #[test]
    fn structure_survives_vanishing_derivatives() {
        let gb = AdGreyBox::new(Product, &[0.0, 0.0]);
        assert_eq!(gb.nnz_jacobian(), 2);
        let dense = to_dense(&gb.evaluate_jacobian_equality_constraints(&[1.0, 2.0]));
        assert_eq!(dense, vec![vec![2.0, 1.0]]);
    }

    #[test]
    fn helper_maps_inputs_to_merged_positions() {
        let mut m = Model::new("m");
        let gb = m.add_grey_box("gb", Rc::new(AdGreyBox::new(Pressure, &[1.0, 2.0, 3.0])));
        let data = &m.grey_box(gb).data[0];
        let mut positions = PositionMap::default();
        positions.insert(data.inputs[0], 4);
        positions.insert(data.inputs[1], 0);
        positions.insert(data.inputs[2], 2);

        let primals = [3.0, 0.0, 4.0, 0.0, 2.0];
        let helper = GreyBoxHelper::new(data, &positions, &primals).unwrap();
        assert_eq!(helper.primal_indices(), &[4, 0, 2]);
        assert_eq!(helper.n_constraints(), 1);
        assert_eq!(helper.nnz_jacobian(), 3);
        assert_eq!(
            helper.constraint_names().collect::<Vec<_>>(),
            vec!["gb.state".to_string()]
        );
        assert_relative_eq!(helper.evaluate_constraints(&primals).unwrap()[0], 2.0 - 0.75);

        let jac = helper.evaluate_jacobian(&primals).unwrap();
        assert_eq!(jac.shape(), (1, 5));
        let dense = to_dense(&jac);
        assert_relative_eq!(dense[0][4], 1.0);
        assert_relative_eq!(dense[0][0], -1.0 / 4.0);
    }

    #[test]
    fn helper_requires_known_inputs() {
        let mut m = Model::new("m");
        let gb = m.add_grey_box("gb", Rc::new(AdGreyBox::new(Pressure, &[1.0, 2.0, 3.0])));
        let data = &m.grey_box(gb).data[0];
        let positions = PositionMap::default();
        assert!(matches!(
            GreyBoxHelper::new(data, &positions, &[]),
            Err(Error::UnknownVariable(v)) if v == data.inputs[0]
        ));
    }
}
