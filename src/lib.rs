pub mod symbolic;
pub mod model;
pub mod codegen;
pub mod kalman;
pub mod series;
pub mod analysis;
pub mod optimizer;
pub mod summary;
pub mod models;
pub mod output;
pub mod constants;
pub mod error;
pub mod config;
