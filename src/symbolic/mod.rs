// Symbolic algebra for state-space models

pub mod expr;
pub mod render;

pub use expr::{signed_pow, DerivativeError, Expr, VarId};
pub use render::{render, Language};
