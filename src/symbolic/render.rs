// Source rendering for expression trees

use super::expr::{Expr, VarId};

/// Target language of rendered code
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Language {
    Rust,
    Cpp,
}

impl Language {
    pub fn file_extension(self) -> &'static str {
        match self {
            Language::Rust => "rs",
            Language::Cpp => "cpp",
        }
    }
}

/// Render `expr` as an expression of `language`, naming variables through `name`
pub fn render(expr: &Expr, language: Language, name: &dyn Fn(VarId) -> String) -> String {
    match expr {
        Expr::Constant(v) => literal(*v, language),
        Expr::Variable(id) => name(*id),
        Expr::Sum(l, r) => format!(
            "{} + {}",
            render(l, language, name),
            render(r, language, name)
        ),
        Expr::Product(l, r) => format!(
            "{} * {}",
            factor(l, language, name),
            factor(r, language, name)
        ),
        Expr::Power(b, e) => {
            let base = format!("({})", render(b, language, name));
            let exponent = render(e, language, name);
            match language {
                Language::Rust => format!(
                    "(if {b} < 0.0 {{ -f64::powf(-{b}, {e}) }} else {{ f64::powf({b}, {e}) }})",
                    b = base,
                    e = exponent
                ),
                Language::Cpp => format!(
                    "({b} < 0 ? -pow(-{b}, {e}) : pow({b}, {e}))",
                    b = base,
                    e = exponent
                ),
            }
        }
        Expr::Conditional {
            probe,
            threshold,
            less,
            greater,
        } => {
            let p = render(probe, language, name);
            let t = render(threshold, language, name);
            let lo = render(less, language, name);
            let hi = render(greater, language, name);
            match language {
                Language::Rust => format!("(if {} > {} {{ {} }} else {{ {} }})", p, t, hi, lo),
                Language::Cpp => format!("(({}) > ({}) ? ({}) : ({}))", p, t, hi, lo),
            }
        }
    }
}

// Operands of a product need parentheses around sums
fn factor(expr: &Expr, language: Language, name: &dyn Fn(VarId) -> String) -> String {
    match expr {
        Expr::Sum(_, _) => format!("({})", render(expr, language, name)),
        _ => render(expr, language, name),
    }
}

fn literal(v: f64, language: Language) -> String {
    if v.is_nan() {
        return match language {
            Language::Rust => "f64::NAN".to_string(),
            Language::Cpp => "NAN".to_string(),
        };
    }
    if v.is_infinite() {
        let text = match language {
            Language::Rust => "f64::INFINITY",
            Language::Cpp => "INFINITY",
        };
        return if v < 0.0 {
            format!("(-{})", text)
        } else {
            text.to_string()
        };
    }
    // Debug keeps a decimal point or exponent, valid in both languages
    let text = format!("{:?}", v);
    if v < 0.0 {
        format!("({})", text)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(id: VarId) -> String {
        ["x", "y"][id.index()].to_string()
    }

    #[test]
    fn test_render_precedence() {
        let (x, y) = (VarId(0), VarId(1));
        let e = (x + 1.0) * y;
        assert_eq!(render(&e, Language::Rust, &names), "(x + 1.0) * y");
        let d = x - y;
        assert_eq!(render(&d, Language::Cpp, &names), "x + (-1.0) * y");
    }

    #[test]
    fn test_render_signed_power() {
        let e = VarId(0).pow(0.5);
        assert_eq!(
            render(&e, Language::Cpp, &names),
            "((x) < 0 ? -pow(-(x), 0.5) : pow((x), 0.5))"
        );
        assert_eq!(
            render(&e, Language::Rust, &names),
            "(if (x) < 0.0 { -f64::powf(-(x), 0.5) } else { f64::powf((x), 0.5) })"
        );

        // literal bases need the receiver type spelled out
        let e = Expr::constant(2.0).pow(VarId(0));
        assert_eq!(
            render(&e, Language::Rust, &names),
            "(if (2.0) < 0.0 { -f64::powf(-(2.0), x) } else { f64::powf((2.0), x) })"
        );
    }

    #[test]
    fn test_render_conditional() {
        let e = Expr::conditional(VarId(0), 25.0, VarId(1), 0.0);
        assert_eq!(
            render(&e, Language::Rust, &names),
            "(if x > 25.0 { 0.0 } else { y })"
        );
    }

    #[test]
    fn test_render_literals() {
        assert_eq!(literal(1e-5, Language::Rust), "1e-5");
        assert_eq!(literal(-2.0, Language::Cpp), "(-2.0)");
        assert_eq!(literal(f64::INFINITY, Language::Cpp), "INFINITY");
    }
}
