//! Lowering of segmented parallel operations (map, scan, reduce, histogram) to GPU kernels.

use crate::config::LowerConfig;
use crate::error::ErrorReported;

pub mod config;
pub mod dsl;
pub mod error;
pub mod ir;
pub mod lower;
pub mod parser;
pub mod segop;
pub mod sim;

/// Reads, parses and lowers a descriptor file with the configuration taken from the
/// environment, returning the printed program.
pub fn compile(file_path: &str) -> Result<String, ErrorReported> {
    let config = LowerConfig::from_env().map_err(|err| error::emit_message(&err.to_string()))?;
    compile_with(file_path, &config)
}

pub fn compile_with(file_path: &str, config: &LowerConfig) -> Result<String, ErrorReported> {
    let source = parser::SourceCode::from_file(file_path)?;
    let module = parser::parse(&source)?;
    let program = lower::lower_module(config, &module).map_err(|err| err.emit(&source))?;
    Ok(ir::printer::print(&program))
}
