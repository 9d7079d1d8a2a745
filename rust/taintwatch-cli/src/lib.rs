//! Taintwatch CLI library: load a program, run it under the engine, and
//! collect the report.

pub mod colors;
pub mod loader;
pub mod run;

pub use loader::{load_program, CliError};
pub use run::{analyse, analyse_code, Analysis, AnalysisOptions, EXIT_CLEAN, EXIT_ERROR, EXIT_MALICIOUS};
