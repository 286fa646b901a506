//! Symbolic optimization models.
//!
//! A [`Model`] is an arena of variables, constraints, objectives and grey-box blocks. Entities
//! are addressed through small `Copy` handles ([`VarId`], [`ConId`], [`ObjId`],
//! [`GreyBoxId`]) whose identity combines a process-unique model tag with the slot in the
//! arena. Two entities may share a display name, and a handle from one model never resolves in
//! another.
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::expr::Expr;
use crate::greybox::ExternalGreyBoxModel;

static NEXT_MODEL_TAG: AtomicU64 = AtomicU64::new(0);

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            model: u64,
            slot: usize,
        }

        impl $name {
            /// Slot of this entity inside its owning model.
            pub fn slot(&self) -> usize {
                self.slot
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}@{}"), self.slot, self.model)
            }
        }
    };
}

define_handle!(
    /// Handle of a scalar variable (or one element of an indexed variable).
    VarId,
    "var"
);
define_handle!(
    /// Handle of a scalar constraint (or one element of an indexed constraint).
    ConId,
    "con"
);
define_handle!(
    /// Handle of an objective.
    ObjId,
    "obj"
);
define_handle!(
    /// Handle of a grey-box block.
    GreyBoxId,
    "greybox"
);

/// Any entity that can appear in a symbol map or a scaling suffix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Entity {
    Var(VarId),
    Con(ConId),
    Obj(ObjId),
}

impl From<VarId> for Entity {
    fn from(v: VarId) -> Self {
        Entity::Var(v)
    }
}

impl From<ConId> for Entity {
    fn from(c: ConId) -> Self {
        Entity::Con(c)
    }
}

impl From<ObjId> for Entity {
    fn from(o: ObjId) -> Self {
        Entity::Obj(o)
    }
}

/// Either a single entity or all the elements of an indexed container.
///
/// Indexed containers expand into their elements in insertion order.
#[derive(Copy, Clone, Debug)]
pub enum Component<'a, T> {
    Data(T),
    Indexed(&'a [T]),
}

impl<'a, T: Copy> Component<'a, T> {
    /// Iterate over the scalar entities this component stands for.
    pub fn data(&self) -> std::iter::Copied<std::slice::Iter<'_, T>> {
        match self {
            Component::Data(t) => std::slice::from_ref(t).iter().copied(),
            Component::Indexed(ts) => ts.iter().copied(),
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self, Component::Indexed(_))
    }
}

macro_rules! impl_component_from {
    ($id:ty, $indexed:ty) => {
        impl From<$id> for Component<'_, $id> {
            fn from(id: $id) -> Self {
                Component::Data(id)
            }
        }

        impl From<&$id> for Component<'_, $id> {
            fn from(id: &$id) -> Self {
                Component::Data(*id)
            }
        }

        impl<'a> From<&'a $indexed> for Component<'a, $id> {
            fn from(indexed: &'a $indexed) -> Self {
                Component::Indexed(indexed.values())
            }
        }
    };
}

impl_component_from!(VarId, IndexedVar);
impl_component_from!(ConId, IndexedCon);

/// An indexed family of variables.
#[derive(Clone, Debug)]
pub struct IndexedVar {
    name: String,
    data: Vec<VarId>,
}

/// An indexed family of constraints.
#[derive(Clone, Debug)]
pub struct IndexedCon {
    name: String,
    data: Vec<ConId>,
}

macro_rules! impl_indexed {
    ($indexed:ident, $id:ty) => {
        impl $indexed {
            pub fn name(&self) -> &str {
                &self.name
            }

            pub fn values(&self) -> &[$id] {
                &self.data
            }

            pub fn len(&self) -> usize {
                self.data.len()
            }

            pub fn is_empty(&self) -> bool {
                self.data.is_empty()
            }

            pub fn get(&self, i: usize) -> Option<$id> {
                self.data.get(i).copied()
            }
        }

        impl std::ops::Index<usize> for $indexed {
            type Output = $id;
            fn index(&self, i: usize) -> &$id {
                &self.data[i]
            }
        }
    };
}

impl_indexed!(IndexedVar, VarId);
impl_indexed!(IndexedCon, ConId);

#[derive(Clone, Debug)]
pub struct VarData {
    pub name: String,
    pub lb: Option<f64>,
    pub ub: Option<f64>,
    pub value: Option<f64>,
    /// The grey-box block owning this variable, if any.
    pub owner: Option<GreyBoxId>,
}

/// Body and bounds of a constraint `lb <= body <= ub`.
#[derive(Clone, Debug)]
pub struct Constraint {
    pub body: Expr,
    pub lb: Option<f64>,
    pub ub: Option<f64>,
}

impl Constraint {
    /// `body == rhs`
    pub fn eq(body: impl Into<Expr>, rhs: f64) -> Self {
        Self {
            body: body.into(),
            lb: Some(rhs),
            ub: Some(rhs),
        }
    }

    /// `body <= ub`
    pub fn le(body: impl Into<Expr>, ub: f64) -> Self {
        Self {
            body: body.into(),
            lb: None,
            ub: Some(ub),
        }
    }

    /// `body >= lb`
    pub fn ge(body: impl Into<Expr>, lb: f64) -> Self {
        Self {
            body: body.into(),
            lb: Some(lb),
            ub: None,
        }
    }

    /// `lb <= body <= ub`
    pub fn range(lb: Option<f64>, body: impl Into<Expr>, ub: Option<f64>) -> Self {
        Self {
            body: body.into(),
            lb,
            ub,
        }
    }

    pub fn is_equality(&self) -> bool {
        matches!((self.lb, self.ub), (Some(l), Some(u)) if l == u)
    }
}

#[derive(Clone, Debug)]
pub struct ConData {
    pub name: String,
    pub constraint: Constraint,
    pub active: bool,
    /// Set for constraints declared inside a grey-box block.
    pub parent: Option<GreyBoxId>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Sense {
    Minimize,
    Maximize,
}

#[derive(Clone, Debug)]
pub struct ObjData {
    pub name: String,
    pub expr: Expr,
    pub sense: Sense,
    pub active: bool,
}

/// One instance of a grey-box block, owning one input variable per external input.
#[derive(Clone)]
pub struct GreyBoxData {
    pub name: String,
    pub active: bool,
    pub inputs: Vec<VarId>,
    pub external: Rc<dyn ExternalGreyBoxModel>,
}

impl fmt::Debug for GreyBoxData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreyBoxData")
            .field("name", &self.name)
            .field("active", &self.active)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// A scalar or indexed grey-box component.
#[derive(Clone, Debug)]
pub struct GreyBoxBlock {
    pub name: String,
    pub data: Vec<GreyBoxData>,
}

impl GreyBoxBlock {
    pub fn active_data(&self) -> impl Iterator<Item = &GreyBoxData> {
        self.data.iter().filter(|d| d.active)
    }
}

/// User attached scaling factors, keyed by entity.
#[derive(Clone, Debug, Default)]
pub struct ScalingSuffix {
    factors: AHashMap<Entity, f64>,
}

impl ScalingSuffix {
    pub fn get(&self, entity: impl Into<Entity>) -> Option<f64> {
        self.factors.get(&entity.into()).copied()
    }

    pub fn contains(&self, entity: impl Into<Entity>) -> bool {
        self.factors.contains_key(&entity.into())
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}

/// A concrete algebraic optimization model.
#[derive(Debug)]
pub struct Model {
    tag: u64,
    name: String,
    vars: Vec<VarData>,
    cons: Vec<ConData>,
    objs: Vec<ObjData>,
    grey_boxes: Vec<GreyBoxBlock>,
    scaling_factor: Option<ScalingSuffix>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tag: NEXT_MODEL_TAG.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            vars: Vec::new(),
            cons: Vec::new(),
            objs: Vec::new(),
            grey_boxes: Vec::new(),
            scaling_factor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /*
     * Variables
     */

    pub fn add_var(&mut self, name: impl Into<String>) -> VarId {
        self.add_bounded_var(name, None, None)
    }

    pub fn add_bounded_var(
        &mut self,
        name: impl Into<String>,
        lb: Option<f64>,
        ub: Option<f64>,
    ) -> VarId {
        self.push_var(VarData {
            name: name.into(),
            lb,
            ub,
            value: None,
            owner: None,
        })
    }

    /// Add one variable per key, named `name[key]`.
    pub fn add_indexed_var<K: fmt::Display>(
        &mut self,
        name: impl Into<String>,
        keys: impl IntoIterator<Item = K>,
    ) -> IndexedVar {
        let name = name.into();
        let data = keys
            .into_iter()
            .map(|k| self.add_var(format!("{name}[{k}]")))
            .collect();
        IndexedVar { name, data }
    }

    fn push_var(&mut self, data: VarData) -> VarId {
        self.vars.push(data);
        VarId {
            model: self.tag,
            slot: self.vars.len() - 1,
        }
    }

    /// Return the data of a variable.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different model.
    pub fn var(&self, id: VarId) -> &VarData {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        &self.vars[id.slot]
    }

    /// Mutable access to the data of a variable.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different model.
    pub fn var_mut(&mut self, id: VarId) -> &mut VarData {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        &mut self.vars[id.slot]
    }

    pub fn set_value(&mut self, id: VarId, value: f64) {
        self.var_mut(id).value = Some(value);
    }

    pub fn set_bounds(&mut self, id: VarId, lb: Option<f64>, ub: Option<f64>) {
        let var = self.var_mut(id);
        var.lb = lb;
        var.ub = ub;
    }

    pub fn vars(&self) -> impl Iterator<Item = (VarId, &VarData)> {
        let tag = self.tag;
        self.vars
            .iter()
            .enumerate()
            .map(move |(slot, v)| (VarId { model: tag, slot }, v))
    }

    pub fn n_vars(&self) -> usize {
        self.vars.len()
    }

    /*
     * Constraints
     */

    pub fn add_constraint(&mut self, name: impl Into<String>, constraint: Constraint) -> ConId {
        self.push_con(name.into(), constraint, None)
    }

    /// Add one constraint per key, named `name[key]`.
    pub fn add_indexed_constraint<K: fmt::Display>(
        &mut self,
        name: impl Into<String>,
        keys: impl IntoIterator<Item = K>,
        mut rule: impl FnMut(&K) -> Constraint,
    ) -> IndexedCon {
        let name = name.into();
        let data = keys
            .into_iter()
            .map(|k| {
                let constraint = rule(&k);
                self.push_con(format!("{name}[{k}]"), constraint, None)
            })
            .collect();
        IndexedCon { name, data }
    }

    /// Add an ordinary constraint declared inside a grey-box block.
    pub fn add_grey_box_constraint(
        &mut self,
        grey_box: GreyBoxId,
        name: impl Into<String>,
        constraint: Constraint,
    ) -> ConId {
        let name = format!("{}.{}", self.grey_box(grey_box).name, name.into());
        self.push_con(name, constraint, Some(grey_box))
    }

    fn push_con(
        &mut self,
        name: String,
        constraint: Constraint,
        parent: Option<GreyBoxId>,
    ) -> ConId {
        self.cons.push(ConData {
            name,
            constraint,
            active: true,
            parent,
        });
        ConId {
            model: self.tag,
            slot: self.cons.len() - 1,
        }
    }

    /// Return the data of a constraint.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different model.
    pub fn constraint(&self, id: ConId) -> &ConData {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        &self.cons[id.slot]
    }

    pub fn set_constraint_active(&mut self, id: ConId, active: bool) {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        self.cons[id.slot].active = active;
    }

    pub fn constraints(&self) -> impl Iterator<Item = (ConId, &ConData)> {
        let tag = self.tag;
        self.cons
            .iter()
            .enumerate()
            .map(move |(slot, c)| (ConId { model: tag, slot }, c))
    }

    /*
     * Objectives
     */

    pub fn add_objective(
        &mut self,
        name: impl Into<String>,
        expr: impl Into<Expr>,
        sense: Sense,
    ) -> ObjId {
        self.objs.push(ObjData {
            name: name.into(),
            expr: expr.into(),
            sense,
            active: true,
        });
        ObjId {
            model: self.tag,
            slot: self.objs.len() - 1,
        }
    }

    /// Return the data of an objective.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different model.
    pub fn objective(&self, id: ObjId) -> &ObjData {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        &self.objs[id.slot]
    }

    pub fn set_objective_active(&mut self, id: ObjId, active: bool) {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        self.objs[id.slot].active = active;
    }

    pub fn active_objectives(&self) -> Vec<ObjId> {
        let tag = self.tag;
        self.objs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.active)
            .map(|(slot, _)| ObjId { model: tag, slot })
            .collect()
    }

    /*
     * Grey-box blocks
     */

    /// Add a scalar grey-box block. One input variable named `name.inputs[input]` is created
    /// for every input of the external model.
    pub fn add_grey_box(
        &mut self,
        name: impl Into<String>,
        external: Rc<dyn ExternalGreyBoxModel>,
    ) -> GreyBoxId {
        let name = name.into();
        let id = self.push_grey_box(name.clone());
        let data = self.grey_box_data(id, name, external);
        self.grey_boxes[id.slot].data.push(data);
        id
    }

    /// Add an indexed grey-box block with one data instance per key, named `name[key]`.
    pub fn add_indexed_grey_box<K: fmt::Display>(
        &mut self,
        name: impl Into<String>,
        keys: impl IntoIterator<Item = K>,
        mut rule: impl FnMut(&K) -> Rc<dyn ExternalGreyBoxModel>,
    ) -> GreyBoxId {
        let name = name.into();
        let id = self.push_grey_box(name.clone());
        for k in keys {
            let data = self.grey_box_data(id, format!("{name}[{k}]"), rule(&k));
            self.grey_boxes[id.slot].data.push(data);
        }
        id
    }

    fn push_grey_box(&mut self, name: String) -> GreyBoxId {
        self.grey_boxes.push(GreyBoxBlock {
            name,
            data: Vec::new(),
        });
        GreyBoxId {
            model: self.tag,
            slot: self.grey_boxes.len() - 1,
        }
    }

    fn grey_box_data(
        &mut self,
        owner: GreyBoxId,
        name: String,
        external: Rc<dyn ExternalGreyBoxModel>,
    ) -> GreyBoxData {
        let inputs = external
            .input_names()
            .into_iter()
            .map(|input| {
                self.push_var(VarData {
                    name: format!("{name}.inputs[{input}]"),
                    lb: None,
                    ub: None,
                    value: None,
                    owner: Some(owner),
                })
            })
            .collect();
        GreyBoxData {
            name,
            active: true,
            inputs,
            external,
        }
    }

    /// Return a grey-box block.
    ///
    /// # Panics
    ///
    /// Panics if `id` was issued by a different model.
    pub fn grey_box(&self, id: GreyBoxId) -> &GreyBoxBlock {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        &self.grey_boxes[id.slot]
    }

    /// Activate or deactivate the `index`-th data instance of a grey-box block.
    pub fn set_grey_box_data_active(&mut self, id: GreyBoxId, index: usize, active: bool) {
        assert_eq!(id.model, self.tag, "{id} belongs to another model");
        self.grey_boxes[id.slot].data[index].active = active;
    }

    pub fn grey_boxes(&self) -> impl Iterator<Item = (GreyBoxId, &GreyBoxBlock)> {
        let tag = self.tag;
        self.grey_boxes
            .iter()
            .enumerate()
            .map(move |(slot, g)| (GreyBoxId { model: tag, slot }, g))
    }

    /*
     * Scaling
     */

    /// Attach a scaling factor to an entity, creating the `scaling_factor` suffix if needed.
    pub fn set_scaling_factor(&mut self, entity: impl Into<Entity>, factor: f64) {
        self.scaling_factor
            .get_or_insert_with(ScalingSuffix::default)
            .factors
            .insert(entity.into(), factor);
    }

    /// The `scaling_factor` suffix, if one was declared.
    pub fn scaling_factor(&self) -> Option<&ScalingSuffix> {
        self.scaling_factor.as_ref()
    }

    /// Declare an empty `scaling_factor` suffix.
    pub fn declare_scaling_factor(&mut self) {
        self.scaling_factor.get_or_insert_with(ScalingSuffix::default);
    }

    /// Display name of an entity.
    pub fn entity_name(&self, entity: Entity) -> &str {
        match entity {
            Entity::Var(v) => &self.var(v).name,
            Entity::Con(c) => &self.constraint(c).name,
            Entity::Obj(o) => &self.objective(o).name,
        }
    }

    /// Whether `entity` was issued by this model.
    pub fn owns(&self, entity: impl Into<Entity>) -> bool {
        match entity.into() {
            Entity::Var(v) => v.model == self.tag && v.slot < self.vars.len(),
            Entity::Con(c) => c.model == self.tag && c.slot < self.cons.len(),
            Entity::Obj(o) => o.model == self.tag && o.slot < self.objs.len(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handles_are_distinct_across_models() {
        let mut m1 = Model::new("m1");
        let mut m2 = Model::new("m2");
        let x1 = m1.add_var("x");
        let x2 = m2.add_var("x");
        assert_eq!(x1.slot(), x2.slot());
        assert_ne!(x1, x2);
        assert!(m1.owns(x1));
        assert!(!m1.owns(x2));
    }

    #[test]
    fn indexed_components_expand_in_order() {
        let mut m = Model::new("m");
        let y = m.add_var("y");
        let x = m.add_indexed_var("x", 1..=3);
        assert_eq!(m.var(x[1]).name, "x[2]");
        let c: Component<'_, VarId> = (&x).into();
        assert!(c.is_indexed());
        assert_eq!(c.data().collect::<Vec<_>>(), x.values());
        let c: Component<'_, VarId> = y.into();
        assert_eq!(c.data().collect::<Vec<_>>(), vec![y]);
    }

    #[test]
    fn objectives_track_activation() {
        let mut m = Model::new("m");
        let x = m.add_var("x");
        let o1 = m.add_objective("o1", x, Sense::Minimize);
        let o2 = m.add_objective("o2", x * 2.0, Sense::Minimize);
        assert_eq!(m.active_objectives(), vec![o1, o2]);
        m.set_objective_active(o1, false);
        assert_eq!(m.active_objectives(), vec![o2]);
    }
}
