//! Algebraic expressions over model variables.
//!
//! [`Expr`] is generic over its leaf type: models build `Expr<VarId>` through operator
//! overloading, the exchange artifact stores `Expr<usize>` with leaves replaced by primal
//! positions. Evaluation is generic over [`DualNum`] so the same tree yields values, gradients
//! and Hessians.
use std::ops::{Add, Div, Mul, Neg, Sub};

use num_dual::DualNum;
use serde::{Deserialize, Serialize};

use crate::model::VarId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr<V = VarId> {
    Const(f64),
    Var(V),
    Neg(Box<Expr<V>>),
    Add(Box<Expr<V>>, Box<Expr<V>>),
    Sub(Box<Expr<V>>, Box<Expr<V>>),
    Mul(Box<Expr<V>>, Box<Expr<V>>),
    Div(Box<Expr<V>>, Box<Expr<V>>),
    Powi(Box<Expr<V>>, i32),
    Powf(Box<Expr<V>>, f64),
    Exp(Box<Expr<V>>),
    Ln(Box<Expr<V>>),
    Sin(Box<Expr<V>>),
    Cos(Box<Expr<V>>),
    Sqrt(Box<Expr<V>>),
    Sum(Vec<Expr<V>>),
}

impl<V> Expr<V> {
    pub fn powi(self, n: i32) -> Self {
        Expr::Powi(Box::new(self), n)
    }

    pub fn powf(self, p: f64) -> Self {
        Expr::Powf(Box::new(self), p)
    }

    pub fn exp(self) -> Self {
        Expr::Exp(Box::new(self))
    }

    pub fn ln(self) -> Self {
        Expr::Ln(Box::new(self))
    }

    pub fn sin(self) -> Self {
        Expr::Sin(Box::new(self))
    }

    pub fn cos(self) -> Self {
        Expr::Cos(Box::new(self))
    }

    pub fn sqrt(self) -> Self {
        Expr::Sqrt(Box::new(self))
    }

    /// Sum of a sequence of terms.
    pub fn sum<T: Into<Expr<V>>>(terms: impl IntoIterator<Item = T>) -> Self {
        Expr::Sum(terms.into_iter().map(Into::into).collect())
    }

    /// Evaluate the expression, resolving leaves through `leaf`.
    pub fn eval<D, F>(&self, leaf: &F) -> D
    where
        D: DualNum<f64> + Copy,
        F: Fn(&V) -> D,
    {
        match self {
            Expr::Const(c) => D::from(*c),
            Expr::Var(v) => leaf(v),
            Expr::Neg(a) => -a.eval(leaf),
            Expr::Add(a, b) => a.eval(leaf) + b.eval(leaf),
            Expr::Sub(a, b) => a.eval(leaf) - b.eval(leaf),
            Expr::Mul(a, b) => a.eval(leaf) * b.eval(leaf),
            Expr::Div(a, b) => a.eval(leaf) / b.eval(leaf),
            Expr::Powi(a, n) => a.eval(leaf).powi(*n),
            Expr::Powf(a, p) => a.eval(leaf).powf(*p),
            Expr::Exp(a) => a.eval(leaf).exp(),
            Expr::Ln(a) => a.eval(leaf).ln(),
            Expr::Sin(a) => a.eval(leaf).sin(),
            Expr::Cos(a) => a.eval(leaf).cos(),
            Expr::Sqrt(a) => a.eval(leaf).sqrt(),
            Expr::Sum(terms) => terms
                .iter()
                .fold(D::from(0.0), |acc, t| acc + t.eval(leaf)),
        }
    }

    /// Visit every leaf in depth-first order.
    pub fn for_each_leaf(&self, f: &mut impl FnMut(&V)) {
        match self {
            Expr::Const(_) => {}
            Expr::Var(v) => f(v),
            Expr::Neg(a)
            | Expr::Powi(a, _)
            | Expr::Powf(a, _)
            | Expr::Exp(a)
            | Expr::Ln(a)
            | Expr::Sin(a)
            | Expr::Cos(a)
            | Expr::Sqrt(a) => a.for_each_leaf(f),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.for_each_leaf(f);
                b.for_each_leaf(f);
            }
            Expr::Sum(terms) => terms.iter().for_each(|t| t.for_each_leaf(f)),
        }
    }

    /// Rebuild the tree with every leaf replaced through `f`, stopping at the first error.
    pub fn try_map_leaves<W, E>(
        &self,
        f: &mut dyn FnMut(&V) -> Result<W, E>,
    ) -> Result<Expr<W>, E> {
        Ok(match self {
            Expr::Const(c) => Expr::Const(*c),
            Expr::Var(v) => Expr::Var(f(v)?),
            Expr::Neg(a) => Expr::Neg(Box::new(a.try_map_leaves(f)?)),
            Expr::Add(a, b) => Expr::Add(
                Box::new(a.try_map_leaves(f)?),
                Box::new(b.try_map_leaves(f)?),
            ),
            Expr::Sub(a, b) => Expr::Sub(
                Box::new(a.try_map_leaves(f)?),
                Box::new(b.try_map_leaves(f)?),
            ),
            Expr::Mul(a, b) => Expr::Mul(
                Box::new(a.try_map_leaves(f)?),
                Box::new(b.try_map_leaves(f)?),
            ),
            Expr::Div(a, b) => Expr::Div(
                Box::new(a.try_map_leaves(f)?),
                Box::new(b.try_map_leaves(f)?),
            ),
            Expr::Powi(a, n) => Expr::Powi(Box::new(a.try_map_leaves(f)?), *n),
            Expr::Powf(a, p) => Expr::Powf(Box::new(a.try_map_leaves(f)?), *p),
            Expr::Exp(a) => Expr::Exp(Box::new(a.try_map_leaves(f)?)),
            Expr::Ln(a) => Expr::Ln(Box::new(a.try_map_leaves(f)?)),
            Expr::Sin(a) => Expr::Sin(Box::new(a.try_map_leaves(f)?)),
            Expr::Cos(a) => Expr::Cos(Box::new(a.try_map_leaves(f)?)),
            Expr::Sqrt(a) => Expr::Sqrt(Box::new(a.try_map_leaves(f)?)),
            Expr::Sum(terms) => Expr::Sum(
                terms
                    .iter()
                    .map(|t| t.try_map_leaves(&mut *f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl<V: Copy + Ord> Expr<V> {
    /// Sorted, deduplicated leaves of the expression.
    pub fn leaves(&self) -> Vec<V> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |v| out.push(*v));
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl From<f64> for Expr {
    fn from(c: f64) -> Self {
        Expr::Const(c)
    }
}

impl From<VarId> for Expr {
    fn from(v: VarId) -> Self {
        Expr::Var(v)
    }
}

impl From<&VarId> for Expr {
    fn from(v: &VarId) -> Self {
        Expr::Var(*v)
    }
}

impl VarId {
    pub fn powi(self, n: i32) -> Expr {
        Expr::from(self).powi(n)
    }

    pub fn exp(self) -> Expr {
        Expr::from(self).exp()
    }

    pub fn ln(self) -> Expr {
        Expr::from(self).ln()
    }
}

macro_rules! impl_binary_op {
    ($op:ident, $method:ident, $variant:ident) => {
        impl<R: Into<Expr>> $op<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::$variant(Box::new(self), Box::new(rhs.into()))
            }
        }

        impl<R: Into<Expr>> $op<R> for VarId {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::$variant(Box::new(self.into()), Box::new(rhs.into()))
            }
        }

        impl $op<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(self.into()), Box::new(rhs))
            }
        }

        impl $op<VarId> for f64 {
            type Output = Expr;
            fn $method(self, rhs: VarId) -> Expr {
                Expr::$variant(Box::new(self.into()), Box::new(rhs.into()))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Sub);
impl_binary_op!(Mul, mul, Mul);
impl_binary_op!(Div, div, Div);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl Neg for VarId {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self.into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use num_dual::Dual64;

    #[test]
    fn evaluates_values_and_derivatives() {
        let mut m = Model::new("m");
        let x = m.add_var("x");
        let y = m.add_var("y");
        let e = x * y + (2.0 * x).exp() - y.powi(2) / 4.0;
        let at = |v: &VarId| if *v == x { 0.5 } else { 3.0 };
        let f: f64 = e.eval(&at);
        assert_relative_eq!(f, 1.5 + 1f64.exp() - 2.25);

        let dfdx: Dual64 = e.eval(&|v: &VarId| {
            if *v == x {
                Dual64::new(0.5, 1.0)
            } else {
                Dual64::from(3.0)
            }
        });
        assert_relative_eq!(dfdx.eps, 3.0 + 2.0 * 1f64.exp());
    }

    #[test]
    fn leaves_are_sorted_and_unique() {
        let mut m = Model::new("m");
        let x = m.add_var("x");
        let y = m.add_var("y");
        let e: Expr = Expr::sum([y * x, x.into(), y.powi(3)]);
        assert_eq!(e.leaves(), vec![x, y]);
    }

    #[test]
    fn maps_leaves_to_positions() {
        let mut m = Model::new("m");
        let x = m.add_var("x");
        let y = m.add_var("y");
        let e = (x - y).sin();
        let mapped: Expr<usize> = e
            .try_map_leaves(&mut |v| Ok::<_, ()>(if *v == x { 7 } else { 3 }))
            .unwrap();
        assert_eq!(mapped.leaves(), vec![3, 7]);
        let value: f64 = mapped.eval(&|i: &usize| *i as f64);
        assert_relative_eq!(value, 4f64.sin());
    }
}
