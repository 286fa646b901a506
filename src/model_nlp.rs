//! NLPs built from symbolic models.
use ahash::AHashMap;
use nalgebra::DVector;
use sprs::TriMat;

use crate::backend::{EngineLoader, ModelWriter};
use crate::config::AdapterConfig;
use crate::environ::{merged_search_path, ScopedEnv};
use crate::error::{Error, Result};
use crate::exchange::{ExchangeEngine, ExchangeLoader, ExchangeWriter};
use crate::model::{Component, ConId, Entity, Model, ObjId, VarId};
use crate::nlp::Nlp;
use crate::symbols::PositionMap;

/// Symbolic queries over an [`Nlp`] whose primals and constraints correspond to entities of a
/// [`Model`].
///
/// Entity lists may mix scalar entities and indexed containers; containers expand into their
/// elements in insertion order.
pub trait SymbolicNlp: Nlp {
    fn model(&self) -> &Model;

    /// The single active objective of the model.
    fn get_objective(&self) -> ObjId;

    fn var_positions(&self) -> &PositionMap<VarId>;

    fn con_positions(&self) -> &PositionMap<ConId>;

    /// Model variables in primal order.
    fn get_model_variables(&self) -> Result<Vec<VarId>> {
        self.var_positions().ordered_keys()
    }

    /// Model constraints in constraint order.
    fn get_model_constraints(&self) -> Result<Vec<ConId>> {
        self.con_positions().ordered_keys()
    }

    fn variable_names(&self) -> Result<Vec<String>> {
        Ok(self
            .get_model_variables()?
            .into_iter()
            .map(|v| self.model().var(v).name.clone())
            .collect())
    }

    fn constraint_names(&self) -> Result<Vec<String>> {
        Ok(self
            .get_model_constraints()?
            .into_iter()
            .map(|c| self.model().constraint(c).name.clone())
            .collect())
    }

    /// Primal positions of the given variables.
    fn get_primal_indices<'a, I>(&self, vars: I) -> Result<Vec<usize>>
    where
        I: IntoIterator,
        I::Item: Into<Component<'a, VarId>>,
    {
        let positions = self.var_positions();
        let mut indices = Vec::new();
        for component in vars {
            let component: Component<'a, VarId> = component.into();
            for v in component.data() {
                indices.push(positions.get(v).ok_or(Error::UnknownVariable(v))?);
            }
        }
        Ok(indices)
    }

    /// Constraint positions of the given constraints.
    fn get_constraint_indices<'a, I>(&self, cons: I) -> Result<Vec<usize>>
    where
        I: IntoIterator,
        I::Item: Into<Component<'a, ConId>>,
    {
        let positions = self.con_positions();
        let mut indices = Vec::new();
        for component in cons {
            let component: Component<'a, ConId> = component.into();
            for c in component.data() {
                indices.push(positions.get(c).ok_or(Error::UnknownConstraint(c))?);
            }
        }
        Ok(indices)
    }

    /// Scaling factor of the objective, if the model's `scaling_factor` suffix holds one.
    fn get_obj_scaling(&self) -> Option<f64> {
        self.model().scaling_factor()?.get(self.get_objective())
    }

    /// Primal scaling factors, defaulting to 1, or `None` without a `scaling_factor` suffix.
    fn get_primals_scaling(&self) -> Result<Option<DVector<f64>>> {
        let Some(suffix) = self.model().scaling_factor() else {
            return Ok(None);
        };
        let mut scaling = DVector::from_element(self.n_primals(), 1.0);
        for (i, v) in self.get_model_variables()?.into_iter().enumerate() {
            if let Some(factor) = suffix.get(v) {
                scaling[i] = factor;
            }
        }
        Ok(Some(scaling))
    }

    /// Constraint scaling factors, defaulting to 1, or `None` without a `scaling_factor`
    /// suffix.
    fn get_constraints_scaling(&self) -> Result<Option<DVector<f64>>> {
        let Some(suffix) = self.model().scaling_factor() else {
            return Ok(None);
        };
        let mut scaling = DVector::from_element(self.n_constraints(), 1.0);
        for (i, c) in self.get_model_constraints()?.into_iter().enumerate() {
            if let Some(factor) = suffix.get(c) {
                scaling[i] = factor;
            }
        }
        Ok(Some(scaling))
    }

    /// Entries of the objective gradient for the given variables, in the given order.
    fn extract_subvector_grad_objective<'a, I>(&mut self, vars: I) -> Result<DVector<f64>>
    where
        I: IntoIterator,
        I::Item: Into<Component<'a, VarId>>,
    {
        let indices = self.get_primal_indices(vars)?;
        let grad = self.evaluate_grad_objective()?;
        Ok(select(&grad, &indices))
    }

    /// Residuals of the given constraints, in the given order.
    fn extract_subvector_constraints<'a, I>(&mut self, cons: I) -> Result<DVector<f64>>
    where
        I: IntoIterator,
        I::Item: Into<Component<'a, ConId>>,
    {
        let indices = self.get_constraint_indices(cons)?;
        let residuals = self.evaluate_constraints()?;
        Ok(select(&residuals, &indices))
    }

    /// Rows `cons` and columns `vars` of the constraint Jacobian.
    fn extract_submatrix_jacobian<'a, 'b, IV, IC>(
        &mut self,
        vars: IV,
        cons: IC,
    ) -> Result<TriMat<f64>>
    where
        IV: IntoIterator,
        IV::Item: Into<Component<'a, VarId>>,
        IC: IntoIterator,
        IC::Item: Into<Component<'b, ConId>>,
    {
        let primal_indices = self.get_primal_indices(vars)?;
        let constraint_indices = self.get_constraint_indices(cons)?;
        let jac = self.evaluate_jacobian()?;
        Ok(extract_submatrix(&jac, &constraint_indices, &primal_indices))
    }

    /// Rows `rows` and columns `cols` of the Hessian of the Lagrangian.
    ///
    /// The lower triangle returned by [`Nlp::evaluate_hessian_lag`] is mirrored first, so any
    /// block of the symmetric matrix can be requested.
    fn extract_submatrix_hessian_lag<'a, 'b, IR, IC>(
        &mut self,
        rows: IR,
        cols: IC,
    ) -> Result<TriMat<f64>>
    where
        IR: IntoIterator,
        IR::Item: Into<Component<'a, VarId>>,
        IC: IntoIterator,
        IC::Item: Into<Component<'b, VarId>>,
    {
        let row_indices = self.get_primal_indices(rows)?;
        let col_indices = self.get_primal_indices(cols)?;
        let hess = symmetric(&self.evaluate_hessian_lag()?);
        Ok(extract_submatrix(&hess, &row_indices, &col_indices))
    }
}

fn select(full: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(indices.len(), indices.iter().map(|&i| full[i]))
}

/// Full symmetric storage of a matrix given by its lower triangle.
fn symmetric(lower: &TriMat<f64>) -> TriMat<f64> {
    let mut full = TriMat::with_capacity(lower.shape(), 2 * lower.nnz());
    for ((&r, &c), &v) in lower.row_inds().iter().zip(lower.col_inds()).zip(lower.data()) {
        full.add_triplet(r, c, v);
        if r != c {
            full.add_triplet(c, r, v);
        }
    }
    full
}

/// Keep the triplets of `full` whose row is in `rows` and whose column is in `cols`, renumbered
/// by their rank in those lists.
///
/// A position listed more than once maps to its last occurrence.
pub(crate) fn extract_submatrix(
    full: &TriMat<f64>,
    rows: &[usize],
    cols: &[usize],
) -> TriMat<f64> {
    let rank = |positions: &[usize]| -> AHashMap<usize, usize> {
        positions
            .iter()
            .enumerate()
            .map(|(k, &p)| (p, k))
            .collect()
    };
    let row_rank = rank(rows);
    let col_rank = rank(cols);
    let mut sub = TriMat::new((rows.len(), cols.len()));
    for ((r, c), &v) in full.row_inds().iter().zip(full.col_inds()).zip(full.data()) {
        if let (Some(&i), Some(&j)) = (row_rank.get(r), col_rank.get(c)) {
            sub.add_triplet(i, j, v);
        }
    }
    sub
}

/// An NLP over a symbolic model, evaluated by an engine loaded from the model's exchange
/// artifact.
pub struct ModelNlp<E = ExchangeEngine> {
    engine: E,
    model: Model,
    objective: ObjId,
    vardata_to_idx: PositionMap<VarId>,
    condata_to_idx: PositionMap<ConId>,
}

impl ModelNlp<ExchangeEngine> {
    /// Build an NLP with the exchange writer and engine and the default configuration.
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

impl<E: Nlp> ModelNlp<E> {
    /// Build an NLP from a model.
    ///
    /// The model must have exactly one active objective. The artifact lives in a temporary
    /// directory that is removed before this returns.
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
        let objectives = model.active_objectives();
        let [objective] = objectives[..] else {
            return Err(Error::UnsupportedObjectiveCount {
                found: objectives.len(),
            });
        };

        let dir = tempfile::Builder::new().prefix("model-nlp").tempdir()?;
        let path = dir.path().join(&config.artifact_name);
        let (artifact, symbols) =
            writer.write(&model, &path, &|_: Entity| true, &config.writer)?;
        let (vardata_to_idx, condata_to_idx) = symbols.position_maps()?;

        // the engine discovers external function libraries through the primary variable
        let search_path = merged_search_path(
            &config.library_path_var,
            &config.fallback_library_path_var,
        );
        let engine = {
            let _env = ScopedEnv::set(&config.library_path_var, &search_path);
            loader.load(&artifact)?
        };

        log::debug!(
            "built NLP for model {:?}: {} primals, {} constraints ({} equalities)",
            model.name(),
            engine.n_primals(),
            engine.n_constraints(),
            engine.n_eq_constraints()
        );
        Ok(Self {
            engine,
            model,
            objective,
            vardata_to_idx,
            condata_to_idx,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Take the model back, dropping the engine.
    pub fn into_model(self) -> Model {
        self.model
    }
}

impl<E: Nlp> SymbolicNlp for ModelNlp<E> {
    fn model(&self) -> &Model {
        &self.model
    }

    fn get_objective(&self) -> ObjId {
        self.objective
    }

    fn var_positions(&self) -> &PositionMap<VarId> {
        &self.vardata_to_idx
    }

    fn con_positions(&self) -> &PositionMap<ConId> {
        &self.condata_to_idx
    }
}

impl<E: Nlp> Nlp for ModelNlp<E> {
    fn n_primals(&self) -> usize {
        self.engine.n_primals()
    }

    fn n_constraints(&self) -> usize {
        self.engine.n_constraints()
    }

    fn n_eq_constraints(&self) -> usize {
        self.engine.n_eq_constraints()
    }

    fn n_ineq_constraints(&self) -> usize {
        self.engine.n_ineq_constraints()
    }

    fn nnz_jacobian(&self) -> usize {
        self.engine.nnz_jacobian()
    }

    fn nnz_jacobian_eq(&self) -> usize {
        self.engine.nnz_jacobian_eq()
    }

    fn nnz_jacobian_ineq(&self) -> usize {
        self.engine.nnz_jacobian_ineq()
    }

    fn nnz_hessian_lag(&self) -> Result<usize> {
        self.engine.nnz_hessian_lag()
    }

    fn primals_lb(&self) -> DVector<f64> {
        self.engine.primals_lb()
    }

    fn primals_ub(&self) -> DVector<f64> {
        self.engine.primals_ub()
    }

    fn constraints_lb(&self) -> DVector<f64> {
        self.engine.constraints_lb()
    }

    fn constraints_ub(&self) -> DVector<f64> {
        self.engine.constraints_ub()
    }

    fn init_primals(&self) -> DVector<f64> {
        self.engine.init_primals()
    }

    fn init_duals(&self) -> DVector<f64> {
        self.engine.init_duals()
    }

    fn init_duals_eq(&self) -> DVector<f64> {
        self.engine.init_duals_eq()
    }

    fn set_primals(&mut self, primals: &[f64]) -> Result<()> {
        self.engine.set_primals(primals)
    }

    fn get_primals(&self) -> DVector<f64> {
        self.engine.get_primals()
    }

    fn set_duals(&mut self, duals: &[f64]) -> Result<()> {
        self.engine.set_duals(duals)
    }

    fn get_duals(&self) -> DVector<f64> {
        self.engine.get_duals()
    }

    fn set_duals_eq(&mut self, duals: &[f64]) -> Result<()> {
        self.engine.set_duals_eq(duals)
    }

    fn get_duals_eq(&self) -> DVector<f64> {
        self.engine.get_duals_eq()
    }

    fn set_obj_factor(&mut self, obj_factor: f64) {
        self.engine.set_obj_factor(obj_factor)
    }

    fn get_obj_factor(&self) -> f64 {
        self.engine.get_obj_factor()
    }

    fn evaluate_objective(&mut self) -> Result<f64> {
        self.engine.evaluate_objective()
    }

    fn evaluate_grad_objective(&mut self) -> Result<DVector<f64>> {
        self.engine.evaluate_grad_objective()
    }

    fn evaluate_constraints_into(&mut self, out: &mut [f64]) -> Result<()> {
        self.engine.evaluate_constraints_into(out)
    }

    fn evaluate_eq_constraints_into(&mut self, out: &mut [f64]) -> Result<()> {
        self.engine.evaluate_eq_constraints_into(out)
    }

    fn evaluate_ineq_constraints(&mut self) -> Result<DVector<f64>> {
        self.engine.evaluate_ineq_constraints()
    }

    fn evaluate_jacobian(&mut self) -> Result<TriMat<f64>> {
        self.engine.evaluate_jacobian()
    }

    fn evaluate_jacobian_eq(&mut self) -> Result<TriMat<f64>> {
        self.engine.evaluate_jacobian_eq()
    }

    fn evaluate_jacobian_ineq(&mut self) -> Result<TriMat<f64>> {
        self.engine.evaluate_jacobian_ineq()
    }

    fn evaluate_hessian_lag(&mut self) -> Result<TriMat<f64>> {
        self.engine.evaluate_hessian_lag()
    }
}
