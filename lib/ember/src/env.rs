//! `.env`-style configuration files.
//!
//! One `KEY=VALUE` per line, `#` starts a comment, surrounding whitespace is
//! trimmed. The file is parsed into a plain map without touching the process
//! environment, so values never leak into child processes.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("cannot load env file: {0}")]
    Env(#[from] dotenvy::Error),
}

/// Parse the file at `path` into a key/value map.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, EnvError> {
    let mut vars = HashMap::new();

    for item in dotenvy::from_path_iter(path)? {
        let (key, value) = item?;
        vars.insert(key, value);
    }

    Ok(vars)
}
