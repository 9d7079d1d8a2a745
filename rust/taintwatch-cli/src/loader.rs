//! Program loading: assembler text or a serialized code object.

use std::path::Path;
use std::rc::Rc;
use taintwatch_core::asm::{assemble, AsmError};
use taintwatch_core::CodeObject;
use taintwatch_engine::ConfigError;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("assembly failed: {0}")]
    Asm(#[from] AsmError),
    #[error("invalid code object in '{path}': {message}")]
    Json { path: String, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Load the program at `path`. Files ending in `.json` hold a serialized
/// [`CodeObject`]; anything else is assembler text.
pub fn load_program(path: &Path) -> Result<Rc<CodeObject>, CliError> {
    let display_path = path.display().to_string();
    let source = std::fs::read_to_string(path).map_err(|source| CliError::Read { path: display_path.clone(), source })?;
    let code = if path.extension().is_some_and(|ext| ext == "json") {
        let code: CodeObject = serde_json::from_str(&source)
            .map_err(|e| CliError::Json { path: display_path.clone(), message: e.to_string() })?;
        Rc::new(code)
    } else {
        assemble(&source, &display_path)?
    };
    debug!(path = %display_path, name = %code.name, "program loaded");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("taintwatch-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_loads_assembler_text_with_path_as_filename() {
        let path = temp_file("ok.twasm", ".code <module>\n LOAD_CONST None\n RETURN_VALUE\n");
        let code = load_program(&path).unwrap();
        assert_eq!(code.filename, path.display().to_string());
        assert_eq!(code.instructions.len(), 2);
    }

    #[test]
    fn test_json_code_object_round_trips_through_the_loader() {
        let assembled = assemble(".code <module>\n LOAD_CONST 1\n RETURN_VALUE\n", "main.py").unwrap();
        let path = temp_file("prog.json", &serde_json::to_string(&*assembled).unwrap());
        let loaded = load_program(&path).unwrap();
        assert_eq!(*loaded, *assembled);
    }

    #[test]
    fn test_missing_file_and_bad_json_are_errors() {
        let missing = std::env::temp_dir().join("taintwatch-definitely-missing.twasm");
        assert!(matches!(load_program(&missing), Err(CliError::Read { .. })));

        let bad = temp_file("bad.json", "{ not json");
        assert!(matches!(load_program(&bad), Err(CliError::Json { .. })));

        let unknown = temp_file("bad.twasm", ".code m\n FROBNICATE\n");
        assert!(matches!(load_program(&unknown), Err(CliError::Asm(_))));
    }
}
