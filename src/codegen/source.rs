// Plain-text rendering of a numeric model
//
// The output is an inspection artifact: the five model functions and the
// calibration matrices written in the chosen language.

use std::fmt::Write;

use crate::model::{KalmanModel, Param};
use crate::symbolic::{render, Expr, Language, VarId};

/// First line of every generated file
pub const AUTOGENERATED_HEADER: &str = "// This file is autogenerated by extrusion-kalman. Do not edit.";

/// Render the packing function, `f`, `dfdx`, `h`, `dhdx` and the
/// `x0`/`P0`/`Q`/`R`/`Wx` matrices of `model`
pub fn render_model(model: &KalmanModel, language: Language) -> String {
    let mut out = String::new();
    let r = Renderer { model, language };
    // writing into a String cannot fail
    let _ = r.write(&mut out);
    out
}

struct Renderer<'a> {
    model: &'a KalmanModel,
    language: Language,
}

impl Renderer<'_> {
    fn name(&self, id: VarId) -> String {
        self.model.symbol(id).to_string()
    }

    fn expr(&self, expr: &Expr) -> String {
        render(expr, self.language, &|id| self.name(id))
    }

    fn write(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "{}", AUTOGENERATED_HEADER)?;
        writeln!(out, "// Model: {}", self.model.name())?;
        writeln!(out)?;
        match self.language {
            Language::Rust => self.write_rust(out),
            Language::Cpp => self.write_cpp(out),
        }
    }

    fn write_rust(&self, out: &mut String) -> std::fmt::Result {
        let m = self.model;
        writeln!(out, "#![allow(unused_variables, non_snake_case, clippy::all)]")?;
        writeln!(out)?;
        writeln!(out, "use std::collections::BTreeMap;")?;
        writeln!(out)?;
        writeln!(out, "use nalgebra::{{DMatrix, DVector}};")?;
        writeln!(out)?;

        writeln!(out, "/// Packing function")?;
        writeln!(
            out,
            "pub fn packing(data: &BTreeMap<&str, f64>) -> Option<(DVector<f64>, DVector<f64>, f64)> {{"
        )?;
        let lookups = |vars: &[VarId]| {
            vars.iter()
                .map(|&v| format!("*data.get(\"{}\")?", self.name(v)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(out, "    let u = DVector::from_vec(vec![{}]);", lookups(m.uvars()))?;
        writeln!(out, "    let z = DVector::from_vec(vec![{}]);", lookups(m.zvars()))?;
        writeln!(out, "    let deltat = *data.get(\"{}\")?;", self.name(m.deltat()))?;
        writeln!(out, "    Some((u, z, deltat))")?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        let transition_args = "x: &DVector<f64>, u: &DVector<f64>, deltat: f64";
        writeln!(out, "/// State transition function")?;
        writeln!(out, "pub fn f({}) -> DVector<f64> {{", transition_args)?;
        self.rust_unpack(out, true)?;
        self.rust_vector(out, m.f(), m.xvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "/// State transition function gradient")?;
        writeln!(out, "pub fn dfdx({}) -> DMatrix<f64> {{", transition_args)?;
        self.rust_unpack(out, true)?;
        self.rust_matrix(out, m.dfdx(), m.xvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "/// Observation function")?;
        writeln!(out, "pub fn h(x: &DVector<f64>) -> DVector<f64> {{")?;
        self.rust_unpack(out, false)?;
        self.rust_vector(out, m.h(), m.zvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "/// Observation function gradient")?;
        writeln!(out, "pub fn dhdx(x: &DVector<f64>) -> DMatrix<f64> {{")?;
        self.rust_unpack(out, false)?;
        self.rust_matrix(out, m.dhdx(), m.zvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        let calibration = [
            ("Initial state", "x0", m.xvars(), Param::InitialValue, false),
            ("Initial state covariance", "p0", m.xvars(), Param::InitialCovariance, true),
            ("State noise", "q", m.xvars(), Param::Noise, true),
            ("Observation noise", "r", m.zvars(), Param::Noise, true),
            ("Update weights", "wx", m.xvars(), Param::UpdateWeight, true),
        ];
        for (title, fn_name, vars, param, diagonal) in calibration {
            writeln!(out, "/// {}", title)?;
            let ty = if diagonal { "DMatrix<f64>" } else { "DVector<f64>" };
            writeln!(out, "pub fn {}() -> {} {{", fn_name, ty)?;
            writeln!(out, "    let values = vec![")?;
            for &v in vars {
                let value = Expr::constant(m.variable(v).get(param));
                writeln!(out, "        {}, // {}", self.expr(&value), self.name(v))?;
            }
            writeln!(out, "    ];")?;
            if diagonal {
                writeln!(out, "    DMatrix::from_diagonal(&DVector::from_vec(values))")?;
            } else {
                writeln!(out, "    DVector::from_vec(values)")?;
            }
            writeln!(out, "}}")?;
            writeln!(out)?;
        }

        writeln!(out, "/// Other parameters")?;
        for (name, value) in m.params() {
            writeln!(
                out,
                "pub const {}: f64 = {};",
                name.to_uppercase(),
                self.expr(&Expr::constant(*value))
            )?;
        }
        Ok(())
    }

    fn rust_unpack(&self, out: &mut String, with_controls: bool) -> std::fmt::Result {
        let m = self.model;
        for (i, &v) in m.xvars().iter().enumerate() {
            writeln!(out, "    let {} = x[{}];", self.name(v), i)?;
        }
        if with_controls {
            for (i, &v) in m.uvars().iter().enumerate() {
                writeln!(out, "    let {} = u[{}];", self.name(v), i)?;
            }
            if self.name(m.deltat()) != "deltat" {
                writeln!(out, "    let {} = deltat;", self.name(m.deltat()))?;
            }
        }
        Ok(())
    }

    fn rust_vector(&self, out: &mut String, exprs: &[Expr], rows: &[VarId]) -> std::fmt::Result {
        writeln!(out, "    DVector::from_vec(vec![")?;
        for (expr, &var) in exprs.iter().zip(rows) {
            writeln!(out, "        {}, // {}", self.expr(expr), self.name(var))?;
        }
        writeln!(out, "    ])")
    }

    fn rust_matrix(&self, out: &mut String, matrix: &[Vec<Expr>], rows: &[VarId]) -> std::fmt::Result {
        let ncols = self.model.xvars().len();
        writeln!(out, "    DMatrix::from_row_slice({}, {}, &[", rows.len(), ncols)?;
        for (row, &var) in matrix.iter().zip(rows) {
            let cells: Vec<String> = row.iter().map(|e| self.expr(e)).collect();
            writeln!(out, "        {}, // {}", cells.join(", "), self.name(var))?;
        }
        writeln!(out, "    ])")
    }

    fn write_cpp(&self, out: &mut String) -> std::fmt::Result {
        let m = self.model;
        writeln!(out, "#include <cmath>")?;
        writeln!(out, "#include <map>")?;
        writeln!(out, "#include <string>")?;
        writeln!(out)?;
        writeln!(out, "#include <Eigen/Dense>")?;
        writeln!(out)?;
        writeln!(out, "namespace {} {{", m.name())?;
        writeln!(out)?;

        writeln!(out, "// Packing function")?;
        writeln!(
            out,
            "inline bool packing(const std::map<std::string, double>& data, Eigen::VectorXd& u, Eigen::VectorXd& z, double& deltat) {{"
        )?;
        let required: Vec<VarId> = m
            .uvars()
            .iter()
            .chain(m.zvars())
            .copied()
            .chain(std::iter::once(m.deltat()))
            .collect();
        for v in &required {
            writeln!(out, "    if (data.count(\"{}\") == 0) return false;", self.name(*v))?;
        }
        writeln!(out, "    u.resize({});", m.uvars().len())?;
        for (i, &v) in m.uvars().iter().enumerate() {
            writeln!(out, "    u({}) = data.at(\"{}\");", i, self.name(v))?;
        }
        writeln!(out, "    z.resize({});", m.zvars().len())?;
        for (i, &v) in m.zvars().iter().enumerate() {
            writeln!(out, "    z({}) = data.at(\"{}\");", i, self.name(v))?;
        }
        writeln!(out, "    deltat = data.at(\"{}\");", self.name(m.deltat()))?;
        writeln!(out, "    return true;")?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        let transition_args = "const Eigen::VectorXd& x, const Eigen::VectorXd& u, double deltat";
        writeln!(out, "// State transition function")?;
        writeln!(out, "inline Eigen::VectorXd f({}) {{", transition_args)?;
        self.cpp_unpack(out, true)?;
        self.cpp_vector(out, m.f(), m.xvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "// State transition function gradient")?;
        writeln!(out, "inline Eigen::MatrixXd dfdx({}) {{", transition_args)?;
        self.cpp_unpack(out, true)?;
        self.cpp_matrix(out, m.dfdx(), m.xvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "// Observation function")?;
        writeln!(out, "inline Eigen::VectorXd h(const Eigen::VectorXd& x) {{")?;
        self.cpp_unpack(out, false)?;
        self.cpp_vector(out, m.h(), m.zvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "// Observation function gradient")?;
        writeln!(out, "inline Eigen::MatrixXd dhdx(const Eigen::VectorXd& x) {{")?;
        self.cpp_unpack(out, false)?;
        self.cpp_matrix(out, m.dhdx(), m.zvars())?;
        writeln!(out, "}}")?;
        writeln!(out)?;

        let calibration = [
            ("Initial state", "x0", m.xvars(), Param::InitialValue, false),
            ("Initial state covariance", "P0", m.xvars(), Param::InitialCovariance, true),
            ("State noise", "Q", m.xvars(), Param::Noise, true),
            ("Observation noise", "R", m.zvars(), Param::Noise, true),
            ("Update weights", "Wx", m.xvars(), Param::UpdateWeight, true),
        ];
        for (title, fn_name, vars, param, diagonal) in calibration {
            writeln!(out, "// {}", title)?;
            let ty = if diagonal { "Eigen::MatrixXd" } else { "Eigen::VectorXd" };
            writeln!(out, "inline {} {}() {{", ty, fn_name)?;
            writeln!(out, "    Eigen::VectorXd values({});", vars.len())?;
            for (i, &v) in vars.iter().enumerate() {
                let value = Expr::constant(m.variable(v).get(param));
                writeln!(out, "    values({}) = {}; // {}", i, self.expr(&value), self.name(v))?;
            }
            if diagonal {
                writeln!(out, "    return values.asDiagonal();")?;
            } else {
                writeln!(out, "    return values;")?;
            }
            writeln!(out, "}}")?;
            writeln!(out)?;
        }

        writeln!(out, "// Other parameters")?;
        for (name, value) in m.params() {
            writeln!(
                out,
                "constexpr double {} = {};",
                name,
                self.expr(&Expr::constant(*value))
            )?;
        }
        writeln!(out)?;
        writeln!(out, "}} // namespace {}", m.name())
    }

    fn cpp_unpack(&self, out: &mut String, with_controls: bool) -> std::fmt::Result {
        let m = self.model;
        for (i, &v) in m.xvars().iter().enumerate() {
            writeln!(out, "    const double {} = x({});", self.name(v), i)?;
        }
        if with_controls {
            for (i, &v) in m.uvars().iter().enumerate() {
                writeln!(out, "    const double {} = u({});", self.name(v), i)?;
            }
            if self.name(m.deltat()) != "deltat" {
                writeln!(out, "    const double {} = deltat;", self.name(m.deltat()))?;
            }
        }
        Ok(())
    }

    fn cpp_vector(&self, out: &mut String, exprs: &[Expr], rows: &[VarId]) -> std::fmt::Result {
        writeln!(out, "    Eigen::VectorXd out({});", rows.len())?;
        for (i, (expr, &var)) in exprs.iter().zip(rows).enumerate() {
            writeln!(out, "    out({}) = {}; // {}", i, self.expr(expr), self.name(var))?;
        }
        writeln!(out, "    return out;")
    }

    fn cpp_matrix(&self, out: &mut String, matrix: &[Vec<Expr>], rows: &[VarId]) -> std::fmt::Result {
        let ncols = self.model.xvars().len();
        writeln!(out, "    Eigen::MatrixXd out = Eigen::MatrixXd::Zero({}, {});", rows.len(), ncols)?;
        for (i, (row, &var)) in matrix.iter().zip(rows).enumerate() {
            for (j, cell) in row.iter().enumerate() {
                if !cell.is_zero() {
                    writeln!(out, "    out({}, {}) = {}; // {}", i, j, self.expr(cell), self.name(var))?;
                }
            }
        }
        writeln!(out, "    return out;")
    }
}
