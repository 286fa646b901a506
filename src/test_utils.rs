use std::cell::Cell;
use std::rc::Rc;

use nalgebra::DVector;
use num_dual::DualNum;
use sprs::TriMat;

use crate::greybox::{ExternalGreyBoxModel, GreyBoxFunction};
use crate::model::{ConId, Constraint, Model, Sense, VarId};

/// Dense copy of a triplet matrix, summing duplicate entries.
pub(crate) fn to_dense(m: &TriMat<f64>) -> Vec<Vec<f64>> {
    let (rows, cols) = m.shape();
    let mut dense = vec![vec![0.0; cols]; rows];
    for ((&r, &c), &v) in m.row_inds().iter().zip(m.col_inds()).zip(m.data()) {
        dense[r][c] += v;
    }
    dense
}

/// `p - t / v = 0`
pub(crate) struct Pressure;

impl GreyBoxFunction for Pressure {
    fn input_names(&self) -> Vec<String> {
        vec!["p".into(), "t".into(), "v".into()]
    }

    fn equality_constraint_names(&self) -> Vec<String> {
        vec!["state".into()]
    }

    fn residuals<D: DualNum<f64> + Copy>(&self, inputs: &[D]) -> Vec<D> {
        vec![inputs[0] - inputs[1] / inputs[2]]
    }
}

/// `a + 2 b = 0` with counters for evaluations and received multipliers.
#[derive(Default)]
pub(crate) struct Counting {
    pub evaluations: Rc<Cell<usize>>,
    pub jacobians: Rc<Cell<usize>>,
    pub multipliers: Rc<Cell<usize>>,
    pub last_duals: Rc<Cell<f64>>,
}

impl ExternalGreyBoxModel for Counting {
    fn input_names(&self) -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn equality_constraint_names(&self) -> Vec<String> {
        vec!["sum".into()]
    }

    fn evaluate_equality_constraints(&self, inputs: &[f64]) -> DVector<f64> {
        self.evaluations.set(self.evaluations.get() + 1);
        DVector::from_element(1, inputs[0] + 2.0 * inputs[1])
    }

    fn evaluate_jacobian_equality_constraints(&self, inputs: &[f64]) -> TriMat<f64> {
        self.jacobians.set(self.jacobians.get() + 1);
        TriMat::from_triplets((1, inputs.len()), vec![0, 0], vec![0, 1], vec![1.0, 2.0])
    }

    fn initial_duals(&self) -> Option<DVector<f64>> {
        Some(DVector::from_element(1, 0.5))
    }

    fn set_equality_constraint_multipliers(&self, duals: &[f64]) {
        self.multipliers.set(self.multipliers.get() + 1);
        self.last_duals.set(duals[0]);
    }
}

pub(crate) struct ThreeVar {
    pub model: Model,
    pub x1: VarId,
    pub x2: VarId,
    pub x3: VarId,
    pub con1: ConId,
    pub con2: ConId,
}

/// min x1 x2 + x3²  s.t.  x1 x2 + x3 = 4,  x1 + x3² <= 10
pub(crate) fn three_var_model() -> ThreeVar {
    let mut model = Model::new("three");
    let x1 = model.add_bounded_var("x1", Some(0.0), None);
    let x2 = model.add_var("x2");
    let x3 = model.add_bounded_var("x3", None, Some(5.0));
    for (v, value) in [(x1, 1.0), (x2, 1.0), (x3, 2.0)] {
        model.set_value(v, value);
    }
    model.add_objective("obj", x1 * x2 + x3.powi(2), Sense::Minimize);
    let con1 = model.add_constraint("con1", Constraint::eq(x1 * x2 + x3, 4.0));
    let con2 = model.add_constraint("con2", Constraint::le(x1 + x3.powi(2), 10.0));
    ThreeVar {
        model,
        x1,
        x2,
        x3,
        con1,
        con2,
    }
}
