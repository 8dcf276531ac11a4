// Algebraic expression tree
//
// Expressions are immutable values. Every constructor simplifies eagerly
// (zero/one elimination, constant folding) so that derivatives and generated
// code stay compact. Children are shared through `Arc`.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

/// Interned handle of a model variable
///
/// The symbol, units and calibration values live in the model's variable
/// table; the expression tree only carries the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub(crate) u32);

impl VarId {
    /// Position of the variable in its table
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A node of the expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(f64),
    Variable(VarId),
    Sum(Arc<Expr>, Arc<Expr>),
    Product(Arc<Expr>, Arc<Expr>),
    Power(Arc<Expr>, Arc<Expr>),
    /// `greater` if `probe > threshold`, otherwise `less`
    Conditional {
        probe: Arc<Expr>,
        threshold: Arc<Expr>,
        less: Arc<Expr>,
        greater: Arc<Expr>,
    },
}

/// Power whose derivative falls outside the supported rules
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeError {
    pub expr: Expr,
    pub variable: VarId,
}

/// Sign-preserving power: `-(-b)^e` for negative bases
///
/// Keeps fractional exponents defined when a state wanders below zero.
pub fn signed_pow(base: f64, exponent: f64) -> f64 {
    if base < 0.0 {
        -(-base).powf(exponent)
    } else {
        base.powf(exponent)
    }
}

impl Expr {
    pub fn constant(value: f64) -> Expr {
        Expr::Constant(value)
    }

    pub fn var(id: VarId) -> Expr {
        Expr::Variable(id)
    }

    pub fn zero() -> Expr {
        Expr::Constant(0.0)
    }

    pub fn one() -> Expr {
        Expr::Constant(1.0)
    }

    /// Value of a constant node
    pub fn as_constant(&self) -> Option<f64> {
        match self {
            Expr::Constant(v) => Some(*v),
            _ => None,
        }
    }

    /// Syntactic zero test; never evaluates anything
    pub fn is_zero(&self) -> bool {
        match self {
            Expr::Constant(v) => *v == 0.0,
            Expr::Variable(_) => false,
            Expr::Sum(l, r) => l.is_zero() && r.is_zero(),
            Expr::Product(l, r) => l.is_zero() || r.is_zero(),
            Expr::Power(_, _) => false,
            Expr::Conditional { less, greater, .. } => less.is_zero() && greater.is_zero(),
        }
    }

    pub fn sum(left: Expr, right: Expr) -> Expr {
        match (left.as_constant(), right.as_constant()) {
            (Some(a), Some(b)) => Expr::Constant(a + b),
            (Some(a), _) if a == 0.0 => right,
            (_, Some(b)) if b == 0.0 => left,
            _ => Expr::Sum(Arc::new(left), Arc::new(right)),
        }
    }

    pub fn difference(left: Expr, right: Expr) -> Expr {
        match (left.as_constant(), right.as_constant()) {
            (Some(a), Some(b)) => Expr::Constant(a - b),
            (_, Some(b)) if b == 0.0 => left,
            (Some(a), _) if a == 0.0 => Expr::negate(right),
            _ => Expr::Sum(Arc::new(left), Arc::new(Expr::negate(right))),
        }
    }

    pub fn product(left: Expr, right: Expr) -> Expr {
        match (left.as_constant(), right.as_constant()) {
            (Some(a), Some(b)) => Expr::Constant(a * b),
            (Some(a), _) if a == 1.0 => right,
            (_, Some(b)) if b == 1.0 => left,
            _ if left.is_zero() || right.is_zero() => Expr::zero(),
            _ => Expr::Product(Arc::new(left), Arc::new(right)),
        }
    }

    /// `left / right`, expressed as `left * right^-1` unless both are constants
    pub fn quotient(left: Expr, right: Expr) -> Expr {
        match (left.as_constant(), right.as_constant()) {
            (Some(a), Some(b)) if b != 0.0 => Expr::Constant(a / b),
            (_, Some(b)) if b == 1.0 => left,
            _ => Expr::product(left, Expr::power(right, Expr::Constant(-1.0))),
        }
    }

    pub fn power(base: Expr, exponent: Expr) -> Expr {
        if let (Some(b), Some(e)) = (base.as_constant(), exponent.as_constant()) {
            let folded = signed_pow(b, e);
            if folded.is_finite() {
                return Expr::Constant(folded);
            }
        }
        Expr::Power(Arc::new(base), Arc::new(exponent))
    }

    pub fn negate(expr: Expr) -> Expr {
        Expr::product(Expr::Constant(-1.0), expr)
    }

    /// `greater` if `probe > threshold`, else `less`
    pub fn conditional(
        probe: impl Into<Expr>,
        threshold: impl Into<Expr>,
        less: impl Into<Expr>,
        greater: impl Into<Expr>,
    ) -> Expr {
        let (probe, threshold) = (probe.into(), threshold.into());
        let (less, greater) = (less.into(), greater.into());
        if less.is_zero() && greater.is_zero() {
            return Expr::zero();
        }
        if let (Some(p), Some(t)) = (probe.as_constant(), threshold.as_constant()) {
            return if p > t { greater } else { less };
        }
        Expr::Conditional {
            probe: Arc::new(probe),
            threshold: Arc::new(threshold),
            less: Arc::new(less),
            greater: Arc::new(greater),
        }
    }

    /// Raise `self` to `exponent`
    pub fn pow(self, exponent: impl Into<Expr>) -> Expr {
        Expr::power(self, exponent.into())
    }

    /// Partial derivative with respect to `var`, simplified
    pub fn partial_derivative(&self, var: VarId) -> Result<Expr, DerivativeError> {
        match self {
            Expr::Constant(_) => Ok(Expr::zero()),
            Expr::Variable(id) => Ok(if *id == var { Expr::one() } else { Expr::zero() }),
            Expr::Sum(l, r) => Ok(Expr::sum(
                l.partial_derivative(var)?,
                r.partial_derivative(var)?,
            )),
            Expr::Product(l, r) => {
                let dl = l.partial_derivative(var)?;
                let dr = r.partial_derivative(var)?;
                Ok(Expr::sum(
                    Expr::product(dl, r.as_ref().clone()),
                    Expr::product(dr, l.as_ref().clone()),
                ))
            }
            Expr::Power(base, exponent) => {
                let db = base.partial_derivative(var)?;
                let de = exponent.partial_derivative(var)?;
                if db.is_zero() {
                    if de.is_zero() {
                        Ok(Expr::zero())
                    } else {
                        // exponent sensitivity is approximated without the log factor
                        Ok(Expr::product(de, self.clone()))
                    }
                } else if de.is_zero() && db.as_constant() == Some(1.0) {
                    let e = exponent.as_ref().clone();
                    let reduced = Expr::difference(e.clone(), Expr::one());
                    Ok(Expr::product(e, Expr::power(base.as_ref().clone(), reduced)))
                } else {
                    Err(DerivativeError {
                        expr: self.clone(),
                        variable: var,
                    })
                }
            }
            Expr::Conditional {
                probe,
                threshold,
                less,
                greater,
            } => Ok(Expr::conditional(
                probe.as_ref().clone(),
                threshold.as_ref().clone(),
                less.partial_derivative(var)?,
                greater.partial_derivative(var)?,
            )),
        }
    }

    /// Evaluate with a variable lookup
    pub fn eval(&self, lookup: &dyn Fn(VarId) -> f64) -> f64 {
        match self {
            Expr::Constant(v) => *v,
            Expr::Variable(id) => lookup(*id),
            Expr::Sum(l, r) => l.eval(lookup) + r.eval(lookup),
            Expr::Product(l, r) => l.eval(lookup) * r.eval(lookup),
            Expr::Power(b, e) => signed_pow(b.eval(lookup), e.eval(lookup)),
            Expr::Conditional {
                probe,
                threshold,
                less,
                greater,
            } => {
                if probe.eval(lookup) > threshold.eval(lookup) {
                    greater.eval(lookup)
                } else {
                    less.eval(lookup)
                }
            }
        }
    }

    /// Every variable the expression mentions, in first-seen order
    pub fn variables(&self) -> Vec<VarId> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<VarId>) {
        match self {
            Expr::Constant(_) => {}
            Expr::Variable(id) => {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
            Expr::Sum(l, r) | Expr::Product(l, r) | Expr::Power(l, r) => {
                l.collect_variables(out);
                r.collect_variables(out);
            }
            Expr::Conditional {
                probe,
                threshold,
                less,
                greater,
            } => {
                probe.collect_variables(out);
                threshold.collect_variables(out);
                less.collect_variables(out);
                greater.collect_variables(out);
            }
        }
    }
}

impl Default for Expr {
    fn default() -> Self {
        Expr::zero()
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Constant(value)
    }
}

impl From<VarId> for Expr {
    fn from(id: VarId) -> Self {
        Expr::Variable(id)
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = super::render::render(self, super::render::Language::Rust, &|id| id.to_string());
        f.write_str(&text)
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $ctor:path) => {
        impl<R: Into<Expr>> $trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                $ctor(self, rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                $ctor(self.clone(), rhs.into())
            }
        }

        impl<R: Into<Expr>> $trait<R> for VarId {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                $ctor(Expr::Variable(self), rhs.into())
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                $ctor(Expr::Constant(self), rhs)
            }
        }

        impl $trait<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                $ctor(Expr::Constant(self), rhs.clone())
            }
        }

        impl $trait<VarId> for f64 {
            type Output = Expr;
            fn $method(self, rhs: VarId) -> Expr {
                $ctor(Expr::Constant(self), Expr::Variable(rhs))
            }
        }
    };
}

impl_binary_op!(Add, add, Expr::sum);
impl_binary_op!(Sub, sub, Expr::difference);
impl_binary_op!(Mul, mul, Expr::product);
impl_binary_op!(Div, div, Expr::quotient);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::negate(self)
    }
}

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::negate(self.clone())
    }
}

impl Neg for VarId {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::negate(Expr::Variable(self))
    }
}

impl VarId {
    /// Raise the variable to `exponent`
    pub fn pow(self, exponent: impl Into<Expr>) -> Expr {
        Expr::power(Expr::Variable(self), exponent.into())
    }
}
