//! NLPs over models containing grey-box blocks.
//!
//! The primal space of a [`GreyBoxNlp`] is the primal space of the underlying [`ModelNlp`]
//! followed by the grey-box inputs the writer never saw. Its constraints are the base
//! constraints followed by the equality constraints of every active grey-box data instance,
//! in declaration order.
use nalgebra::DVector;
use sprs::TriMat;

use crate::backend::{EngineLoader, ModelWriter};
use crate::config::AdapterConfig;
use crate::error::{Error, Result};
use crate::exchange::{ExchangeEngine, ExchangeLoader, ExchangeWriter};
use crate::greybox::GreyBoxHelper;
use crate::model::{ConId, Model, ObjId, VarId};
use crate::model_nlp::{ModelNlp, SymbolicNlp};
use crate::nlp::{append_triplets, check_len, concat, Cache, Nlp};
use crate::symbols::PositionMap;

pub struct GreyBoxNlp<E = ExchangeEngine> {
    base: ModelNlp<E>,
    vardata_to_idx: PositionMap<VarId>,
    n_greybox_primals: usize,
    greybox_primals_lb: Box<[f64]>,
    greybox_primals_ub: Box<[f64]>,
    init_greybox_primals: Box<[f64]>,
    greybox_primals: Vec<f64>,
    helpers: Vec<GreyBoxHelper>,
    n_greybox_cons: usize,
    nnz_greybox_jac: usize,
    init_greybox_duals: Vec<f64>,
    greybox_duals: Vec<f64>,
    greybox_duals_synced: bool,
    cached_greybox_con: Cache<DVector<f64>>,
    cached_greybox_jac: Cache<TriMat<f64>>,
}

impl GreyBoxNlp<ExchangeEngine> {
    pub fn new(model: Model) -> Result<Self> {
        Self::with_config(model, &AdapterConfig::default())
    }

    pub fn with_config(model: Model, config: &AdapterConfig) -> Result<Self> {
        let loader = ExchangeLoader {
            library_path_var: config.library_path_var.clone(),
        };
        Self::with_backend(model, &ExchangeWriter, &loader, config)
    }
}

impl<E: Nlp> GreyBoxNlp<E> {
    /// Build the base NLP with the writer descending into grey-box blocks, then append the
    /// remaining grey-box inputs and equality constraints.
    pub fn with_backend<W, L>(
        model: Model,
        writer: &W,
        loader: &L,
        config: &AdapterConfig,
    ) -> Result<Self>
    where
        W: ModelWriter,
        L: EngineLoader<Engine = E>,
    {
        let config = config.clone().with_descend_into_grey_boxes(true);
        let base = ModelNlp::with_backend(model, writer, loader, &config)?;

        let mut vardata_to_idx = base.var_positions().clone();
        let mut greybox_vars = Vec::new();
        for (_, block) in base.model().grey_boxes() {
            for data in block.active_data() {
                for &v in &data.inputs {
                    if !vardata_to_idx.contains(v) {
                        vardata_to_idx.push_next(v);
                        greybox_vars.push(v);
                    }
                }
            }
        }

        let model = base.model();
        let greybox_primals_lb: Box<[f64]> = greybox_vars
            .iter()
            .map(|&v| model.var(v).lb.unwrap_or(f64::NEG_INFINITY))
            .collect();
        let greybox_primals_ub: Box<[f64]> = greybox_vars
            .iter()
            .map(|&v| model.var(v).ub.unwrap_or(f64::INFINITY))
            .collect();
        let init_greybox_primals: Box<[f64]> = greybox_vars
            .iter()
            .map(|&v| model.var(v).value.unwrap_or(0.0))
            .collect();

        let primals = concat(&base.init_primals(), &init_greybox_primals);
        let mut helpers = Vec::new();
        for (_, block) in model.grey_boxes() {
            for data in block.active_data() {
                helpers.push(GreyBoxHelper::new(data, &vardata_to_idx, primals.as_slice())?);
            }
        }
        let n_greybox_cons = helpers.iter().map(GreyBoxHelper::n_constraints).sum();
        let nnz_greybox_jac = helpers.iter().map(GreyBoxHelper::nnz_jacobian).sum();
        let init_greybox_duals: Vec<f64> = helpers
            .iter()
            .flat_map(|h| h.init_duals().iter().copied())
            .collect();

        log::debug!(
            "appended {} grey-box primals and {} grey-box constraints from {} data instances",
            greybox_vars.len(),
            n_greybox_cons,
            helpers.len()
        );
        Ok(Self {
            n_greybox_primals: greybox_vars.len(),
            greybox_primals: init_greybox_primals.to_vec(),
            greybox_primals_lb,
            greybox_primals_ub,
            init_greybox_primals,
            base,
            vardata_to_idx,
            helpers,
            n_greybox_cons,
            nnz_greybox_jac,
            greybox_duals: init_greybox_duals.clone(),
            init_greybox_duals,
            greybox_duals_synced: false,
            cached_greybox_con: Cache::Stale,
            cached_greybox_jac: Cache::Stale,
        })
    }

    pub fn base(&self) -> &ModelNlp<E> {
        &self.base
    }

    pub fn helpers(&self) -> &[GreyBoxHelper] {
        &self.helpers
    }

    /// Number of primals appended after the base primals.
    pub fn n_greybox_primals(&self) -> usize {
        self.n_greybox_primals
    }

    pub fn n_greybox_constraints(&self) -> usize {
        self.n_greybox_cons
    }

    fn split_primals(&self) -> usize {
        self.n_primals() - self.n_greybox_primals
    }

    fn push_greybox_duals(&mut self) {
        if self.greybox_duals_synced {
            return;
        }
        let mut offset = 0;
        for helper in &self.helpers {
            let n = helper.n_constraints();
            helper.set_duals(&self.greybox_duals[offset..offset + n]);
            offset += n;
        }
        self.greybox_duals_synced = true;
    }

    fn greybox_constraints(&mut self) -> Result<&DVector<f64>> {
        self.push_greybox_duals();
        let Self {
            base,
            greybox_primals,
            helpers,
            n_greybox_cons,
            cached_greybox_con,
            ..
        } = self;
        cached_greybox_con.get_or_try_insert_with(|| {
            let primals = concat(&base.get_primals(), greybox_primals);
            let mut residuals = Vec::with_capacity(*n_greybox_cons);
            for helper in helpers.iter() {
                residuals.extend(helper.evaluate_constraints(primals.as_slice())?.iter());
            }
            log::trace!("evaluated {} grey-box residuals", residuals.len());
            Ok(DVector::from_vec(residuals))
        })
    }

    /// Stacked grey-box Jacobian with columns in the merged primal space.
    fn greybox_jacobian(&mut self) -> Result<&TriMat<f64>> {
        self.push_greybox_duals();
        let Self {
            base,
            greybox_primals,
            helpers,
            n_greybox_cons,
            nnz_greybox_jac,
            cached_greybox_jac,
            ..
        } = self;
        cached_greybox_jac.get_or_try_insert_with(|| {
            let primals = concat(&base.get_primals(), greybox_primals);
            let mut jac =
                TriMat::with_capacity((*n_greybox_cons, primals.len()), *nnz_greybox_jac);
            let mut row_offset = 0;
            for helper in helpers.iter() {
                append_triplets(
                    &mut jac,
                    &helper.evaluate_jacobian(primals.as_slice())?,
                    row_offset,
                );
                row_offset += helper.n_constraints();
            }
            log::trace!("evaluated grey-box Jacobian with {} nonzeros", jac.nnz());
            Ok(jac)
        })
    }

    /// Base Jacobian rows followed by the grey-box rows, widened to the merged primal space.
    fn stacked_jacobian(&mut self, base: TriMat<f64>, nnz: usize) -> Result<TriMat<f64>> {
        let base_rows = base.rows();
        let mut jac =
            TriMat::with_capacity((base_rows + self.n_greybox_cons, self.n_primals()), nnz);
        append_triplets(&mut jac, &base, 0);
        append_triplets(&mut jac, self.greybox_jacobian()?, base_rows);
        Ok(jac)
    }
}

impl<E: Nlp> SymbolicNlp for GreyBoxNlp<E> {
    fn model(&self) -> &Model {
        self.base.model()
    }

    fn get_objective(&self) -> ObjId {
        self.base.get_objective()
    }

    fn var_positions(&self) -> &PositionMap<VarId> {
        &self.vardata_to_idx
    }

    fn con_positions(&self) -> &PositionMap<ConId> {
        self.base.con_positions()
    }

    /// Base constraint names followed by `data.constraint` for every grey-box constraint.
    fn constraint_names(&self) -> Result<Vec<String>> {
        let mut names = self.base.constraint_names()?;
        for helper in &self.helpers {
            names.extend(helper.constraint_names());
        }
        Ok(names)
    }

    fn get_constraints_scaling(&self) -> Result<Option<DVector<f64>>> {
        Ok(self.base.get_constraints_scaling()?.map(|scaling| {
            concat(&scaling, &vec![1.0; self.n_greybox_cons])
        }))
    }
}

impl<E: Nlp> Nlp for GreyBoxNlp<E> {
    fn n_primals(&self) -> usize {
        self.base.n_primals() + self.n_greybox_primals
    }

    fn n_constraints(&self) -> usize {
        self.base.n_constraints() + self.n_greybox_cons
    }

    fn n_eq_constraints(&self) -> usize {
        self.base.n_eq_constraints() + self.n_greybox_cons
    }

    fn n_ineq_constraints(&self) -> usize {
        self.base.n_ineq_constraints()
    }

    fn nnz_jacobian(&self) -> usize {
        self.base.nnz_jacobian() + self.nnz_greybox_jac
    }

    fn nnz_jacobian_eq(&self) -> usize {
        self.base.nnz_jacobian_eq() + self.nnz_greybox_jac
    }

    fn nnz_jacobian_ineq(&self) -> usize {
        self.base.nnz_jacobian_ineq()
    }

    fn nnz_hessian_lag(&self) -> Result<usize> {
        Err(Error::NotImplemented("nnz_hessian_lag for grey-box NLPs"))
    }

    fn primals_lb(&self) -> DVector<f64> {
        concat(&self.base.primals_lb(), &self.greybox_primals_lb)
    }

    fn primals_ub(&self) -> DVector<f64> {
        concat(&self.base.primals_ub(), &self.greybox_primals_ub)
    }

    fn constraints_lb(&self) -> DVector<f64> {
        concat(&self.base.constraints_lb(), &vec![0.0; self.n_greybox_cons])
    }

    fn constraints_ub(&self) -> DVector<f64> {
        concat(&self.base.constraints_ub(), &vec![0.0; self.n_greybox_cons])
    }

    fn init_primals(&self) -> DVector<f64> {
        concat(&self.base.init_primals(), &self.init_greybox_primals)
    }

    fn init_duals(&self) -> DVector<f64> {
        concat(&self.base.init_duals(), &self.init_greybox_duals)
    }

    fn init_duals_eq(&self) -> DVector<f64> {
        concat(&self.base.init_duals_eq(), &self.init_greybox_duals)
    }

    fn set_primals(&mut self, primals: &[f64]) -> Result<()> {
        check_len("set_primals", self.n_primals(), primals.len())?;
        let (base, greybox) = primals.split_at(self.split_primals());
        self.base.set_primals(base)?;
        self.greybox_primals.copy_from_slice(greybox);
        self.cached_greybox_con.invalidate();
        self.cached_greybox_jac.invalidate();
        Ok(())
    }

    fn get_primals(&self) -> DVector<f64> {
        concat(&self.base.get_primals(), &self.greybox_primals)
    }

    fn set_duals(&mut self, duals: &[f64]) -> Result<()> {
        check_len("set_duals", self.n_constraints(), duals.len())?;
        self.greybox_duals_synced = false;
        let (base, greybox) = duals.split_at(self.base.n_constraints());
        self.base.set_duals(base)?;
        self.greybox_duals.copy_from_slice(greybox);
        Ok(())
    }

    fn get_duals(&self) -> DVector<f64> {
        concat(&self.base.get_duals(), &self.greybox_duals)
    }

    fn set_duals_eq(&mut self, duals: &[f64]) -> Result<()> {
        check_len("set_duals_eq", self.n_eq_constraints(), duals.len())?;
        self.greybox_duals_synced = false;
        let (base, greybox) = duals.split_at(self.base.n_eq_constraints());
        self.base.set_duals_eq(base)?;
        self.greybox_duals.copy_from_slice(greybox);
        Ok(())
    }

    fn get_duals_eq(&self) -> DVector<f64> {
        concat(&self.base.get_duals_eq(), &self.greybox_duals)
    }

    fn set_obj_factor(&mut self, obj_factor: f64) {
        self.base.set_obj_factor(obj_factor)
    }

    fn get_obj_factor(&self) -> f64 {
        self.base.get_obj_factor()
    }

    fn evaluate_objective(&mut self) -> Result<f64> {
        self.base.evaluate_objective()
    }

    fn evaluate_grad_objective(&mut self) -> Result<DVector<f64>> {
        let grad = self.base.evaluate_grad_objective()?;
        Ok(concat(&grad, &vec![0.0; self.n_greybox_primals]))
    }

    fn evaluate_constraints_into(&mut self, out: &mut [f64]) -> Result<()> {
        check_len("evaluate_constraints", self.n_constraints(), out.len())?;
        let (base, greybox) = out.split_at_mut(self.base.n_constraints());
        self.base.evaluate_constraints_into(base)?;
        greybox.copy_from_slice(self.greybox_constraints()?.as_slice());
        Ok(())
    }

    fn evaluate_eq_constraints_into(&mut self, out: &mut [f64]) -> Result<()> {
        check_len("evaluate_eq_constraints", self.n_eq_constraints(), out.len())?;
        let (base, greybox) = out.split_at_mut(self.base.n_eq_constraints());
        self.base.evaluate_eq_constraints_into(base)?;
        greybox.copy_from_slice(self.greybox_constraints()?.as_slice());
        Ok(())
    }

    fn evaluate_ineq_constraints(&mut self) -> Result<DVector<f64>> {
        self.base.evaluate_ineq_constraints()
    }

    fn evaluate_jacobian(&mut self) -> Result<TriMat<f64>> {
        let base = self.base.evaluate_jacobian()?;
        self.stacked_jacobian(base, self.nnz_jacobian())
    }

    fn evaluate_jacobian_eq(&mut self) -> Result<TriMat<f64>> {
        let base = self.base.evaluate_jacobian_eq()?;
        self.stacked_jacobian(base, self.nnz_jacobian_eq())
    }

    fn evaluate_jacobian_ineq(&mut self) -> Result<TriMat<f64>> {
        let base = self.base.evaluate_jacobian_ineq()?;
        let mut jac = TriMat::with_capacity((base.rows(), self.n_primals()), base.nnz());
        append_triplets(&mut jac, &base, 0);
        Ok(jac)
    }

    fn evaluate_hessian_lag(&mut self) -> Result<TriMat<f64>> {
        Err(Error::NotImplemented("evaluate_hessian_lag for grey-box NLPs"))
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::greybox::AdGreyBox;
    use crate::model::{Constraint, GreyBoxId, Sense};
    use crate::test_utils::{to_dense, three_var_model, Counting, Pressure, ThreeVar};
    use approx::assert_relative_eq;
    use serial_test::serial;

    struct Fixture {
        model: Model,
        x: VarId,
        gb: GreyBoxId,
        counter: Counting,
    }

    /// min x²  s.t.  x >= 1,  grey box a + 2 b = 0 with a in [0, inf), b in (-inf, 5]
    fn fixture() -> Fixture {
        let mut model = Model::new("gb");
        let x = model.add_var("x");
        model.set_value(x, 2.0);
        model.add_objective("obj", x.powi(2), Sense::Minimize);
        model.add_constraint("lower", Constraint::ge(x, 1.0));
        let counter = Counting::default();
        let external = Counting {
            evaluations: Rc::clone(&counter.evaluations),
            jacobians: Rc::clone(&counter.jacobians),
            multipliers: Rc::clone(&counter.multipliers),
            last_duals: Rc::clone(&counter.last_duals),
        };
        let gb = model.add_grey_box("gb", Rc::new(external));
        let inputs = model.grey_box(gb).data[0].inputs.clone();
        model.set_bounds(inputs[0], Some(0.0), None);
        model.set_bounds(inputs[1], None, Some(5.0));
        model.set_value(inputs[0], 3.0);
        Fixture {
            model,
            x,
            gb,
            counter,
        }
    }

    #[test]
    #[serial]
    fn appends_grey_box_primals_and_constraints() {
        let Fixture { model, x, gb, .. } = fixture();
        let inputs = model.grey_box(gb).data[0].inputs.clone();
        let nlp = GreyBoxNlp::new(model).unwrap();
        assert_eq!(nlp.base().n_primals(), 1);
        assert_eq!(nlp.n_primals(), 3);
        assert_eq!(nlp.n_greybox_primals(), 2);
        assert_eq!(nlp.n_constraints(), 2);
        assert_eq!(nlp.n_eq_constraints(), 1);
        assert_eq!(nlp.n_ineq_constraints(), 1);
        assert_eq!(nlp.nnz_jacobian(), 3);
        assert_eq!(nlp.nnz_jacobian_eq(), 2);
        assert_eq!(nlp.get_primal_indices([x, inputs[0], inputs[1]]).unwrap(), vec![0, 1, 2]);

        assert_eq!(
            nlp.primals_lb().as_slice(),
            &[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY]
        );
        assert_eq!(nlp.primals_ub().as_slice(), &[f64::INFINITY, f64::INFINITY, 5.0]);
        assert_eq!(nlp.init_primals().as_slice(), &[2.0, 3.0, 0.0]);
        assert_eq!(nlp.constraints_lb().as_slice(), &[1.0, 0.0]);
        assert_eq!(nlp.constraints_ub().as_slice(), &[f64::INFINITY, 0.0]);
        assert_eq!(nlp.init_duals().as_slice(), &[0.0, 0.5]);
        assert_eq!(nlp.init_duals_eq().as_slice(), &[0.5]);
        assert_eq!(
            nlp.variable_names().unwrap(),
            vec!["x", "gb.inputs[a]", "gb.inputs[b]"]
        );
        assert_eq!(nlp.constraint_names().unwrap(), vec!["lower", "gb.sum"]);
    }

    #[test]
    #[serial]
    fn inputs_seen_by_the_writer_stay_in_the_base() {
        let Fixture { mut model, x, gb, .. } = fixture();
        let inputs = model.grey_box(gb).data[0].inputs.clone();
        model.add_grey_box_constraint(gb, "link", Constraint::eq(inputs[0] - x, 0.0));
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        assert_eq!(nlp.base().n_primals(), 2);
        assert_eq!(nlp.n_greybox_primals(), 1);
        assert_eq!(nlp.helpers()[0].primal_indices(), &[1, 2]);
        assert_eq!(nlp.n_constraints(), 3);
        assert_eq!(
            nlp.constraint_names().unwrap(),
            vec!["lower", "gb.link", "gb.sum"]
        );

        nlp.set_primals(&[1.0, 2.0, 3.0]).unwrap();
        let g = nlp.evaluate_constraints().unwrap();
        assert_eq!(g.as_slice(), &[1.0, 1.0, 8.0]);
        assert_eq!(nlp.evaluate_eq_constraints().unwrap().as_slice(), &[1.0, 8.0]);
        assert_eq!(nlp.evaluate_ineq_constraints().unwrap().as_slice(), &[1.0]);
    }

    #[test]
    #[serial]
    fn residuals_are_cached_until_primals_change() {
        let Fixture { model, counter, .. } = fixture();
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        nlp.set_primals(&[2.0, 1.0, 1.0]).unwrap();
        let first = nlp.evaluate_constraints().unwrap();
        let second = nlp.evaluate_constraints().unwrap();
        assert_eq!(first, second);
        assert_eq!(counter.evaluations.get(), 1);
        nlp.evaluate_eq_constraints().unwrap();
        assert_eq!(counter.evaluations.get(), 1);

        nlp.set_primals(&[2.0, 1.0, 2.0]).unwrap();
        let third = nlp.evaluate_constraints().unwrap();
        assert_eq!(counter.evaluations.get(), 2);
        assert_relative_eq!(third[1], 5.0);
    }

    #[test]
    #[serial]
    fn output_buffers_must_match_merged_count() {
        let Fixture { model, .. } = fixture();
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        let mut out = [0.0; 1];
        assert!(matches!(
            nlp.evaluate_constraints_into(&mut out),
            Err(Error::BufferSize {
                expected: 2,
                found: 1,
                ..
            })
        ));
        let mut out = [0.0; 2];
        assert!(matches!(
            nlp.evaluate_eq_constraints_into(&mut out),
            Err(Error::BufferSize { expected: 1, .. })
        ));
        nlp.evaluate_constraints_into(&mut out).unwrap();
        assert_eq!(out, [2.0, 3.0]);
    }

    #[test]
    #[serial]
    fn hessian_is_not_implemented() {
        let Fixture { model, .. } = fixture();
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        assert!(matches!(nlp.nnz_hessian_lag(), Err(Error::NotImplemented(_))));
        assert!(matches!(
            nlp.evaluate_hessian_lag(),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    #[serial]
    fn jacobian_rows_are_offset() {
        let Fixture { model, x, .. } = fixture();
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        let jac = nlp.evaluate_jacobian().unwrap();
        assert_eq!(jac.shape(), (2, 3));
        assert_eq!(jac.nnz(), nlp.nnz_jacobian());
        let dense = to_dense(&jac);
        assert_eq!(dense, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 2.0]]);

        let jac = nlp.evaluate_jacobian_eq().unwrap();
        assert_eq!(to_dense(&jac), vec![vec![0.0, 1.0, 2.0]]);
        let jac = nlp.evaluate_jacobian_ineq().unwrap();
        assert_eq!(to_dense(&jac), vec![vec![1.0, 0.0, 0.0]]);

        let grad = nlp.evaluate_grad_objective().unwrap();
        assert_eq!(grad.as_slice(), &[4.0, 0.0, 0.0]);
        let sub = nlp.extract_subvector_grad_objective([x]).unwrap();
        assert_eq!(sub.as_slice(), &[4.0]);
    }

    #[test]
    #[serial]
    fn duals_are_split_and_pushed_once() {
        let Fixture { model, counter, .. } = fixture();
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        nlp.set_duals(&[1.0, 2.0]).unwrap();
        assert_eq!(nlp.get_duals().as_slice(), &[1.0, 2.0]);
        assert_eq!(nlp.get_duals_eq().as_slice(), &[2.0]);
        assert_eq!(counter.multipliers.get(), 0);

        nlp.evaluate_constraints().unwrap();
        nlp.evaluate_jacobian().unwrap();
        assert_eq!(counter.multipliers.get(), 1);
        assert_relative_eq!(counter.last_duals.get(), 2.0);

        nlp.set_duals_eq(&[7.0]).unwrap();
        nlp.evaluate_constraints().unwrap();
        assert_eq!(counter.multipliers.get(), 2);
        assert_relative_eq!(counter.last_duals.get(), 7.0);
        assert_eq!(nlp.get_duals().as_slice(), &[1.0, 7.0]);

        assert!(matches!(
            nlp.set_duals(&[1.0]),
            Err(Error::BufferSize { .. })
        ));
    }

    #[test]
    #[serial]
    fn without_grey_boxes_the_composition_is_the_base() {
        let ThreeVar { model, .. } = three_var_model();
        let mut nlp = GreyBoxNlp::new(model).unwrap();
        assert_eq!(nlp.n_greybox_primals(), 0);
        assert_eq!(nlp.n_primals(), nlp.base().n_primals());
        nlp.set_primals(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(nlp.get_primals().as_slice(), &[1.0, 2.0, 3.0]);
        nlp.set_duals(&[0.5, 0.25]).unwrap();
        assert_eq!(nlp.get_duals().as_slice(), &[0.5, 0.25]);
        assert_eq!(
            nlp.evaluate_constraints().unwrap(),
            nlp.base.evaluate_constraints().unwrap()
        );
    }

    #[test]
    #[serial]
    fn ad_grey_boxes_and_inactive_data() {
        let mut model = Model::new("ad");
        let z = model.add_var("z");
        model.add_objective("obj", z, Sense::Minimize);
        let gb = model.add_indexed_grey_box("state", 0..2, |_| {
            Rc::new(AdGreyBox::new(Pressure, &[1.0, 2.0, 3.0]))
        });
        model.set_grey_box_data_active(gb, 0, false);
        let inputs = model.grey_box(gb).data[1].inputs.clone();
        for v in inputs {
            model.set_value(v, 1.0);
        }
        model.set_scaling_factor(z, 2.0);

        let mut nlp = GreyBoxNlp::new(model).unwrap();
        assert_eq!(nlp.n_primals(), 4);
        assert_eq!(nlp.helpers().len(), 1);
        assert_eq!(nlp.constraint_names().unwrap(), vec!["state[1].state"]);
        assert_eq!(
            nlp.get_primals_scaling().unwrap().unwrap().as_slice(),
            &[2.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(
            nlp.get_constraints_scaling().unwrap().unwrap().as_slice(),
            &[1.0]
        );

        nlp.set_primals(&[0.0, 4.0, 6.0, 2.0]).unwrap();
        assert_relative_eq!(nlp.evaluate_constraints().unwrap()[0], 1.0);
        let dense = to_dense(&nlp.evaluate_jacobian().unwrap());
        assert_relative_eq!(dense[0][1], 1.0);
        assert_relative_eq!(dense[0][2], -0.5);
        assert_relative_eq!(dense[0][3], 1.5);
    }
}
