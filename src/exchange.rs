//! Reference writer and evaluation engine for a JSON exchange artifact.
//!
//! [`ExchangeWriter`] serializes the active part of a [`Model`] with every variable leaf
//! replaced by its primal position. [`ExchangeEngine`] reads the artifact back and evaluates
//! values and derivatives with forward mode automatic differentiation from [num-dual]. Sparsity
//! structures are taken from the set of variables each expression references.
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use nalgebra::DVector;
use num_dual::{Dual64, HyperDual64};
use serde::{Deserialize, Serialize};
use sprs::TriMat;

use crate::backend::{EngineLoader, EntityFilter, ModelWriter, WriterOptions};
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::model::{Entity, Model, Sense, VarId};
use crate::nlp::{check_len, Nlp};
use crate::symbols::SymbolMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactVar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lb: Option<f64>,
    pub ub: Option<f64>,
    pub init: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactCon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub body: Expr<usize>,
    pub lb: Option<f64>,
    pub ub: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactObjective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub expr: Expr<usize>,
    pub sense: Sense,
}

/// Contents of an exchange artifact. Missing bounds are unbounded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub variables: Vec<ArtifactVar>,
    pub constraints: Vec<ArtifactCon>,
    pub objective: ArtifactObjective,
}

/// Writes the active objective and active constraints of a model.
///
/// Variables are those referenced by written expressions, ordered by handle.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExchangeWriter;

impl ModelWriter for ExchangeWriter {
    fn write(
        &self,
        model: &Model,
        path: &Path,
        filter: EntityFilter<'_>,
        options: &WriterOptions,
    ) -> Result<(PathBuf, SymbolMap)> {
        let objectives: Vec<_> = model
            .active_objectives()
            .into_iter()
            .filter(|&o| filter(Entity::Obj(o)))
            .collect();
        let [objective] = objectives[..] else {
            return Err(Error::UnsupportedObjectiveCount {
                found: objectives.len(),
            });
        };
        let constraints: Vec<_> = model
            .constraints()
            .filter(|(id, con)| {
                con.active
                    && (con.parent.is_none() || options.descend_into_grey_boxes)
                    && filter(Entity::Con(*id))
            })
            .collect();

        let mut referenced = BTreeSet::new();
        let mut collect = |expr: &Expr| -> Result<()> {
            for v in expr.leaves() {
                if !model.owns(v) {
                    return Err(Error::UnknownVariable(v));
                }
                referenced.insert(v);
            }
            Ok(())
        };
        collect(&model.objective(objective).expr)?;
        for (_, con) in &constraints {
            collect(&con.constraint.body)?;
        }

        let positions: AHashMap<VarId, usize> = referenced
            .iter()
            .enumerate()
            .map(|(i, v)| (*v, i))
            .collect();
        let to_position = |v: &VarId| positions.get(v).copied().ok_or(Error::UnknownVariable(*v));
        let name = |name: &str| options.symbolic_names.then(|| name.to_string());

        let mut symbols = SymbolMap::new();
        let variables = referenced
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                symbols.insert(format!("v{i}"), v);
                let data = model.var(v);
                ArtifactVar {
                    name: name(&data.name),
                    lb: data.lb,
                    ub: data.ub,
                    init: data.value,
                }
            })
            .collect();
        let constraints = constraints
            .iter()
            .enumerate()
            .map(|(i, (id, con))| {
                symbols.insert(format!("c{i}"), *id);
                Ok(ArtifactCon {
                    name: name(&con.name),
                    body: con.constraint.body.try_map_leaves(&mut |v: &VarId| to_position(v))?,
                    lb: con.constraint.lb,
                    ub: con.constraint.ub,
                })
            })
            .collect::<Result<_>>()?;
        symbols.insert("o0", objective);
        let obj = model.objective(objective);
        let artifact = Artifact {
            variables,
            constraints,
            objective: ArtifactObjective {
                name: name(&obj.name),
                expr: obj.expr.try_map_leaves(&mut |v: &VarId| to_position(v))?,
                sense: obj.sense,
            },
        };

        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer(file, &artifact)?;
        log::debug!(
            "wrote {} variables and {} constraints of model {:?} to {}",
            artifact.variables.len(),
            artifact.constraints.len(),
            model.name(),
            path.display()
        );
        Ok((path.to_path_buf(), symbols))
    }
}

/// Loads [`ExchangeEngine`]s, recording the external libraries advertised in
/// `library_path_var` at load time.
#[derive(Clone, Debug)]
pub struct ExchangeLoader {
    pub library_path_var: String,
}

impl Default for ExchangeLoader {
    fn default() -> Self {
        Self {
            library_path_var: "AMPLFUNC".to_string(),
        }
    }
}

impl EngineLoader for ExchangeLoader {
    type Engine = ExchangeEngine;

    fn load(&self, artifact: &Path) -> Result<ExchangeEngine> {
        let reader = BufReader::new(File::open(artifact)?);
        let artifact: Artifact = serde_json::from_reader(reader)?;
        let mut engine = ExchangeEngine::new(artifact)?;
        engine.external_libraries = std::env::var(&self.library_path_var)
            .map(|paths| {
                paths
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(engine)
    }
}

/// Evaluates an [`Artifact`] with forward mode AD.
///
/// Constraints keep their artifact order. Rows with equal finite bounds form the equality
/// partition and are reported as `body - rhs` with zero bounds. Maximization objectives are
/// negated.
#[derive(Clone, Debug)]
pub struct ExchangeEngine {
    primals_lb: DVector<f64>,
    primals_ub: DVector<f64>,
    init_primals: DVector<f64>,
    bodies: Vec<Expr<usize>>,
    body_leaves: Vec<Vec<usize>>,
    rhs: DVector<f64>,
    con_lb: DVector<f64>,
    con_ub: DVector<f64>,
    eq_rows: Vec<usize>,
    ineq_rows: Vec<usize>,
    objective: Expr<usize>,
    objective_leaves: Vec<usize>,
    obj_sign: f64,
    hess_structure: Vec<(usize, usize)>,
    hess_index: AHashMap<(usize, usize), usize>,
    primals: DVector<f64>,
    duals: DVector<f64>,
    obj_factor: f64,
    external_libraries: Vec<String>,
}

impl ExchangeEngine {
    pub fn new(artifact: Artifact) -> Result<Self> {
        let n = artifact.variables.len();
        let check_leaves = |expr: &Expr<usize>| -> Result<Vec<usize>> {
            let leaves = expr.leaves();
            match leaves.last() {
                Some(&i) if i >= n => Err(Error::Artifact(format!(
                    "variable position {i} out of range for {n} variables"
                ))),
                _ => Ok(leaves),
            }
        };

        let objective_leaves = check_leaves(&artifact.objective.expr)?;
        let body_leaves = artifact
            .constraints
            .iter()
            .map(|c| check_leaves(&c.body))
            .collect::<Result<Vec<_>>>()?;

        let m = artifact.constraints.len();
        let mut rhs = DVector::zeros(m);
        let mut con_lb = DVector::from_element(m, f64::NEG_INFINITY);
        let mut con_ub = DVector::from_element(m, f64::INFINITY);
        let mut eq_rows = Vec::new();
        let mut ineq_rows = Vec::new();
        for (i, con) in artifact.constraints.iter().enumerate() {
            match (con.lb, con.ub) {
                (Some(l), Some(u)) if l == u => {
                    rhs[i] = l;
                    con_lb[i] = 0.0;
                    con_ub[i] = 0.0;
                    eq_rows.push(i);
                }
                (lb, ub) => {
                    if let Some(l) = lb {
                        con_lb[i] = l;
                    }
                    if let Some(u) = ub {
                        con_ub[i] = u;
                    }
                    ineq_rows.push(i);
                }
            }
        }

        let mut pairs = BTreeSet::new();
        for leaves in body_leaves.iter().chain(std::iter::once(&objective_leaves)) {
            for (a, &row) in leaves.iter().enumerate() {
                for &col in &leaves[..=a] {
                    pairs.insert((row, col));
                }
            }
        }
        let hess_structure: Vec<_> = pairs.into_iter().collect();
        let hess_index = hess_structure
            .iter()
            .enumerate()
            .map(|(k, &rc)| (rc, k))
            .collect();

        let bound = |b: Option<f64>, default: f64| b.unwrap_or(default);
        let primals_lb = DVector::from_iterator(
            n,
            artifact.variables.iter().map(|v| bound(v.lb, f64::NEG_INFINITY)),
        );
        let primals_ub = DVector::from_iterator(
            n,
            artifact.variables.iter().map(|v| bound(v.ub, f64::INFINITY)),
        );
        let init_primals =
            DVector::from_iterator(n, artifact.variables.iter().map(|v| bound(v.init, 0.0)));

        Ok(Self {
            primals: init_primals.clone(),
            primals_lb,
            primals_ub,
            init_primals,
            bodies: artifact.constraints.into_iter().map(|c| c.body).collect(),
            body_leaves,
            rhs,
            con_lb,
            con_ub,
            eq_rows,
            ineq_rows,
            objective: artifact.objective.expr,
            objective_leaves,
            obj_sign: match artifact.objective.sense {
                Sense::Minimize => 1.0,
                Sense::Maximize => -1.0,
            },
            hess_structure,
            hess_index,
            duals: DVector::zeros(m),
            obj_factor: 1.0,
            external_libraries: Vec::new(),
        })
    }

    /// External function libraries advertised to the engine when it was loaded.
    pub fn external_libraries(&self) -> &[String] {
        &self.external_libraries
    }

    fn residual(&self, row: usize) -> f64 {
        let x = self.primals.as_slice();
        let value: f64 = self.bodies[row].eval(&|i: &usize| x[*i]);
        value - self.rhs[row]
    }

    fn partial(&self, expr: &Expr<usize>, col: usize) -> f64 {
        let x = self.primals.as_slice();
        let d: Dual64 = expr.eval(&|i: &usize| {
            if *i == col {
                Dual64::new(x[*i], 1.0)
            } else {
                Dual64::from(x[*i])
            }
        });
        d.eps
    }

    fn second_partial(&self, expr: &Expr<usize>, row: usize, col: usize) -> f64 {
        let x = self.primals.as_slice();
        let h: HyperDual64 = expr.eval(&|i: &usize| {
            let eps1 = if *i == row { 1.0 } else { 0.0 };
            let eps2 = if *i == col { 1.0 } else { 0.0 };
            HyperDual64::new(x[*i], eps1, eps2, 0.0)
        });
        h.eps1eps2
    }

    /// Jacobian of the given rows; row `k` of the result is constraint `rows[k]`.
    fn jacobian_rows(&self, rows: &[usize]) -> TriMat<f64> {
        let nnz = rows.iter().map(|&r| self.body_leaves[r].len()).sum();
        let mut jac = TriMat::with_capacity((rows.len(), self.n_primals()), nnz);
        for (k, &row) in rows.iter().enumerate() {
            for &col in &self.body_leaves[row] {
                jac.add_triplet(k, col, self.partial(&self.bodies[row], col));
            }
        }
        jac
    }

    fn nnz_rows(&self, rows: &[usize]) -> usize {
        rows.iter().map(|&r| self.body_leaves[r].len()).sum()
    }
}

impl Nlp for ExchangeEngine {
    fn n_primals(&self) -> usize {
        self.init_primals.len()
    }

    fn n_constraints(&self) -> usize {
        self.bodies.len()
    }

    fn n_eq_constraints(&self) -> usize {
        self.eq_rows.len()
    }

    fn nnz_jacobian(&self) -> usize {
        self.body_leaves.iter().map(Vec::len).sum()
    }

    fn nnz_jacobian_eq(&self) -> usize {
        self.nnz_rows(&self.eq_rows)
    }

    fn nnz_hessian_lag(&self) -> Result<usize> {
        Ok(self.hess_structure.len())
    }

    fn primals_lb(&self) -> DVector<f64> {
        self.primals_lb.clone()
    }

    fn primals_ub(&self) -> DVector<f64> {
        self.primals_ub.clone()
    }

    fn constraints_lb(&self) -> DVector<f64> {
        self.con_lb.clone()
    }

    fn constraints_ub(&self) -> DVector<f64> {
        self.con_ub.clone()
    }

    fn init_primals(&self) -> DVector<f64> {
        self.init_primals.clone()
    }

    fn init_duals(&self) -> DVector<f64> {
        DVector::zeros(self.n_constraints())
    }

    fn init_duals_eq(&self) -> DVector<f64> {
        DVector::zeros(self.n_eq_constraints())
    }

    fn set_primals(&mut self, primals: &[f64]) -> Result<()> {
        check_len("set_primals", self.n_primals(), primals.len())?;
        self.primals.copy_from_slice(primals);
        Ok(())
    }

    fn get_primals(&self) -> DVector<f64> {
        self.primals.clone()
    }

    fn set_duals(&mut self, duals: &[f64]) -> Result<()> {
        check_len("set_duals", self.n_constraints(), duals.len())?;
        self.duals.copy_from_slice(duals);
        Ok(())
    }

    fn get_duals(&self) -> DVector<f64> {
        self.duals.clone()
    }

    fn set_duals_eq(&mut self, duals: &[f64]) -> Result<()> {
        check_len("set_duals_eq", self.n_eq_constraints(), duals.len())?;
        for (&row, &d) in self.eq_rows.iter().zip(duals) {
            self.duals[row] = d;
        }
        Ok(())
    }

    fn get_duals_eq(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.eq_rows.len(),
            self.eq_rows.iter().map(|&row| self.duals[row]),
        )
    }

    fn set_obj_factor(&mut self, obj_factor: f64) {
        self.obj_factor = obj_factor;
    }

    fn get_obj_factor(&self) -> f64 {
        self.obj_factor
    }

    fn evaluate_objective(&mut self) -> Result<f64> {
        let x = self.primals.as_slice();
        let value: f64 = self.objective.eval(&|i: &usize| x[*i]);
        Ok(self.obj_sign * value)
    }

    fn evaluate_grad_objective(&mut self) -> Result<DVector<f64>> {
        let mut grad = DVector::zeros(self.n_primals());
        for &col in &self.objective_leaves {
            grad[col] = self.obj_sign * self.partial(&self.objective, col);
        }
        Ok(grad)
    }

    fn evaluate_constraints_into(&mut self, out: &mut [f64]) -> Result<()> {
        check_len("evaluate_constraints", self.n_constraints(), out.len())?;
        for (row, o) in out.iter_mut().enumerate() {
            *o = self.residual(row);
        }
        Ok(())
    }

    fn evaluate_eq_constraints_into(&mut self, out: &mut [f64]) -> Result<()> {
        check_len("evaluate_eq_constraints", self.n_eq_constraints(), out.len())?;
        for (&row, o) in self.eq_rows.iter().zip(out.iter_mut()) {
            *o = self.residual(row);
        }
        Ok(())
    }

    fn evaluate_ineq_constraints(&mut self) -> Result<DVector<f64>> {
        Ok(DVector::from_iterator(
            self.ineq_rows.len(),
            self.ineq_rows.iter().map(|&row| self.residual(row)),
        ))
    }

    fn evaluate_jacobian(&mut self) -> Result<TriMat<f64>> {
        let rows: Vec<_> = (0..self.n_constraints()).collect();
        Ok(self.jacobian_rows(&rows))
    }

    fn evaluate_jacobian_eq(&mut self) -> Result<TriMat<f64>> {
        Ok(self.jacobian_rows(&self.eq_rows))
    }

    fn evaluate_jacobian_ineq(&mut self) -> Result<TriMat<f64>> {
        Ok(self.jacobian_rows(&self.ineq_rows))
    }

    fn evaluate_hessian_lag(&mut self) -> Result<TriMat<f64>> {
        let mut values = vec![0.0; self.hess_structure.len()];
        let weighted = std::iter::once((
            self.obj_factor * self.obj_sign,
            &self.objective,
            &self.objective_leaves,
        ))
        .chain(
            self.bodies
                .iter()
                .zip(&self.body_leaves)
                .zip(self.duals.iter())
                .map(|((body, leaves), &lambda)| (lambda, body, leaves)),
        );
        for (weight, expr, leaves) in weighted {
            if weight == 0.0 {
                continue;
            }
            for (a, &row) in leaves.iter().enumerate() {
                for &col in &leaves[..=a] {
                    values[self.hess_index[&(row, col)]] +=
                        weight * self.second_partial(expr, row, col);
                }
            }
        }
        let (rows, cols) = self.hess_structure.iter().copied().unzip();
        let n = self.n_primals();
        Ok(TriMat::from_triplets((n, n), rows, cols, values))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Constraint;
    use crate::test_utils::to_dense;
    use approx::assert_relative_eq;

    fn write_and_load(model: &Model, options: &WriterOptions) -> (ExchangeEngine, SymbolMap) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.nlp.json");
        let (path, symbols) = ExchangeWriter
            .write(model, &path, &|_: Entity| true, options)
            .unwrap();
        let reader = BufReader::new(File::open(path).unwrap());
        let artifact: Artifact = serde_json::from_reader(reader).unwrap();
        (ExchangeEngine::new(artifact).unwrap(), symbols)
    }

    // min x0 x3 (x0 + x1 + x2) + x2  s.t.  x0 x1 x2 x3 >= 25,  x0² + x1² + x2² + x3² = 40
    fn hs071() -> (Model, Vec<VarId>) {
        let mut m = Model::new("hs071");
        let x: Vec<_> = (0..4)
            .map(|i| m.add_bounded_var(format!("x{i}"), Some(1.0), Some(5.0)))
            .collect();
        for (v, init) in x.iter().zip([1.0, 5.0, 5.0, 1.0]) {
            m.set_value(*v, init);
        }
        m.add_objective(
            "obj",
            x[0] * x[3] * (x[0] + x[1] + x[2]) + x[2],
            Sense::Minimize,
        );
        m.add_constraint("prod", Constraint::ge(x[0] * x[1] * x[2] * x[3], 25.0));
        let norm: Expr = Expr::sum(x.iter().map(|v| v.powi(2)));
        m.add_constraint("norm", Constraint::eq(norm, 40.0));
        (m, x)
    }

    #[test]
    fn writes_symbols_for_written_entities() {
        let (m, x) = hs071();
        let (engine, symbols) = write_and_load(&m, &WriterOptions::default());
        assert_eq!(engine.n_primals(), 4);
        assert_eq!(engine.n_constraints(), 2);
        for (i, v) in x.iter().enumerate() {
            assert_eq!(symbols.get(&format!("v{i}")), Some(Entity::Var(*v)));
        }
        assert!(matches!(symbols.get("o0"), Some(Entity::Obj(_))));
    }

    #[test]
    fn partitions_equality_constraints() {
        let (m, _) = hs071();
        let (mut engine, _) = write_and_load(&m, &WriterOptions::default());
        assert_eq!(engine.n_eq_constraints(), 1);
        assert_eq!(engine.n_ineq_constraints(), 1);
        assert_eq!(engine.constraints_lb().as_slice(), &[25.0, 0.0]);
        assert_eq!(engine.constraints_ub().as_slice(), &[f64::INFINITY, 0.0]);
        let g = engine.evaluate_constraints().unwrap();
        assert_relative_eq!(g[0], 25.0);
        assert_relative_eq!(g[1], 52.0 - 40.0);
        assert_eq!(engine.evaluate_eq_constraints().unwrap().as_slice(), &[g[1]]);
        assert_eq!(engine.evaluate_ineq_constraints().unwrap().as_slice(), &[g[0]]);
    }

    #[test]
    fn evaluates_derivatives() {
        let (m, _) = hs071();
        let (mut engine, _) = write_and_load(&m, &WriterOptions::default());
        let x = [1.0, 5.0, 5.0, 1.0];
        let grad = engine.evaluate_grad_objective().unwrap();
        let expected = [
            x[0] * x[3] + x[3] * (x[0] + x[1] + x[2]),
            x[0] * x[3],
            x[0] * x[3] + 1.0,
            x[0] * (x[0] + x[1] + x[2]),
        ];
        for (g, e) in grad.iter().zip(expected) {
            assert_relative_eq!(*g, e);
        }

        let jac = engine.evaluate_jacobian().unwrap();
        assert_eq!(jac.nnz(), engine.nnz_jacobian());
        assert_eq!(jac.nnz(), 8);
        let dense = to_dense(&jac);
        assert_relative_eq!(dense[0][0], x[1] * x[2] * x[3]);
        assert_relative_eq!(dense[1][3], 2.0 * x[3]);

        engine.set_duals(&[0.0, 1.0]).unwrap();
        engine.set_obj_factor(0.0);
        let hess = engine.evaluate_hessian_lag().unwrap();
        assert_eq!(hess.nnz(), engine.nnz_hessian_lag().unwrap());
        let dense = to_dense(&hess);
        for i in 0..4 {
            assert_relative_eq!(dense[i][i], 2.0);
        }
        assert_relative_eq!(dense[3][0], 0.0);
        for ((&r, &c), _) in hess.row_inds().iter().zip(hess.col_inds()).zip(hess.data()) {
            assert!(r >= c);
        }
    }

    #[test]
    fn maximization_is_negated() {
        let mut m = Model::new("max");
        let x = m.add_var("x");
        m.set_value(x, 2.0);
        m.add_objective("obj", x.powi(2), Sense::Maximize);
        let (mut engine, _) = write_and_load(&m, &WriterOptions::default());
        assert_relative_eq!(engine.evaluate_objective().unwrap(), -4.0);
        assert_relative_eq!(engine.evaluate_grad_objective().unwrap()[0], -4.0);
    }

    #[test]
    fn grey_box_constraints_need_descent() {
        let mut m = Model::new("gb");
        let x = m.add_var("x");
        let gb = m.add_indexed_grey_box("gb", 0..0, |_: &i32| unreachable!());
        m.add_objective("obj", x, Sense::Minimize);
        let y = m.add_var("y");
        m.add_grey_box_constraint(gb, "link", Constraint::eq(x - y, 0.0));

        let (engine, _) = write_and_load(&m, &WriterOptions::default());
        assert_eq!(engine.n_constraints(), 0);
        assert_eq!(engine.n_primals(), 1);

        let options = WriterOptions {
            descend_into_grey_boxes: true,
            ..Default::default()
        };
        let (engine, symbols) = write_and_load(&m, &options);
        assert_eq!(engine.n_constraints(), 1);
        assert_eq!(symbols.get("v1"), Some(Entity::Var(y)));
    }

    #[test]
    fn filter_and_activation_exclude_entities() {
        let (mut m, _) = hs071();
        let prod = m.constraints().map(|(id, _)| id).next().unwrap();
        m.set_constraint_active(prod, false);
        let (engine, _) = write_and_load(&m, &WriterOptions::default());
        assert_eq!(engine.n_constraints(), 1);
        assert_eq!(engine.n_eq_constraints(), 1);
    }

    #[test]
    fn rejects_out_of_range_positions() {
        let artifact = Artifact {
            variables: vec![ArtifactVar {
                name: None,
                lb: None,
                ub: None,
                init: None,
            }],
            constraints: vec![],
            objective: ArtifactObjective {
                name: None,
                expr: Expr::Var(3),
                sense: Sense::Minimize,
            },
        };
        assert!(matches!(ExchangeEngine::new(artifact), Err(Error::Artifact(_))));
    }
}
