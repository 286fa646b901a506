//! # model-nlp - Index-mapping NLP interface for algebraic optimization models
//! This crate connects symbolic optimization models to flat NLP evaluation engines. A
//! [ModelWriter] serializes the active part of a [Model] into an exchange artifact and returns
//! the symbol table linking written symbols to model entities. An [EngineLoader] turns the
//! artifact into an evaluation engine implementing [Nlp]. [ModelNlp] keeps the symbol table as
//! position maps so that primals, constraints, gradients, Jacobians and Hessians can be
//! queried and sliced in terms of model entities instead of raw indices.
//!
//! [GreyBoxNlp] extends that index space with the inputs and equality constraints of grey-box
//! blocks, i.e. external models that only provide residuals and their Jacobian.
//!
//! Derivatives in the reference engine ([ExchangeEngine]) and in [AdGreyBox] are computed with
//! automatic differentiation from [num-dual].
//!
//! ## Example
//! ```
//! use model_nlp::{Constraint, Model, ModelNlp, Nlp, Sense, SymbolicNlp};
//! use approx::assert_relative_eq;
//!
//! let mut model = Model::new("example");
//! let x1 = model.add_bounded_var("x1", Some(0.0), None);
//! let x2 = model.add_var("x2");
//! let x3 = model.add_var("x3");
//! model.add_objective("obj", x1 * x2 + x3.powi(2), Sense::Minimize);
//! let con1 = model.add_constraint("con1", Constraint::eq(x1 * x2 + x3, 4.0));
//! model.add_constraint("con2", Constraint::le(x1 + x3.powi(2), 10.0));
//!
//! let mut nlp = ModelNlp::new(model)?;
//! assert_eq!(nlp.variable_names()?, ["x1", "x2", "x3"]);
//! assert_eq!(nlp.get_primal_indices([x3, x1])?, [2, 0]);
//!
//! nlp.set_primals(&[1.0, 2.0, 3.0])?;
//! let jac = nlp.extract_submatrix_jacobian([x3, x1], [con1])?;
//! assert_eq!(jac.shape(), (1, 2));
//! assert_relative_eq!(nlp.extract_subvector_constraints([con1])?[0], 1.0);
//! # Ok::<_, model_nlp::Error>(())
//! ```
//!
//! ## Solving with IPOPT
//! With the `ipopt` feature, `IpoptNlp` wraps any [Nlp] as an
//! [IPOPT](https://coin-or.github.io/Ipopt/index.html) problem.
//!
//! [num-dual]: https://docs.rs/num-dual

mod backend;
mod config;
mod environ;
mod error;
mod exchange;
mod expr;
mod greybox;
mod greybox_nlp;
mod model;
mod model_nlp;
mod nlp;
mod symbols;

#[cfg(feature = "ipopt")]
mod ipopt_nlp;
#[cfg(test)]
mod test_utils;

pub use backend::{EngineLoader, EntityFilter, ModelWriter, WriterOptions};
pub use config::AdapterConfig;
pub use error::{Error, Result};
pub use exchange::{
    Artifact, ArtifactCon, ArtifactObjective, ArtifactVar, ExchangeEngine, ExchangeLoader,
    ExchangeWriter,
};
pub use expr::Expr;
pub use greybox::{AdGreyBox, ExternalGreyBoxModel, GreyBoxFunction, GreyBoxHelper};
pub use greybox_nlp::GreyBoxNlp;
pub use model::{
    Component, ConData, ConId, Constraint, Entity, GreyBoxBlock, GreyBoxData, GreyBoxId,
    IndexedCon, IndexedVar, Model, ObjData, ObjId, ScalingSuffix, Sense, VarData, VarId,
};
pub use model_nlp::{ModelNlp, SymbolicNlp};
pub use nlp::Nlp;
pub use symbols::{PositionMap, SymbolMap};

#[cfg(feature = "ipopt")]
pub use ipopt_nlp::IpoptNlp;

#[cfg(feature = "ipopt")]
pub mod ipopt {
    //! Re-export of all functionalities in [ipopt-rs].
    pub use ipopt::*;
}
