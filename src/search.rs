//! The Library Searcher (C3): resolve a logical library name to a concrete
//! archive path using ordered search directories.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Locate `name` on `search_paths`. First match wins, trying in order for
/// each path: `<name>.lib`, `lib<name>.a`, `<name>` literal; finally
/// `<name>.lib` relative to the process working directory.
pub fn find_library(name: &str, search_paths: &[PathBuf]) -> Result<PathBuf> {
    for dir in search_paths {
        for candidate in candidates(dir, name) {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    let cwd_candidate = PathBuf::from(format!("{}.lib", name));
    if cwd_candidate.is_file() {
        return Ok(cwd_candidate);
    }
    Err(Error::NotFound(name.to_string()))
}

fn candidates(dir: &Path, name: &str) -> [PathBuf; 3] {
    [
        dir.join(format!("{}.lib", name)),
        dir.join(format!("lib{}.a", name)),
        dir.join(name),
    ]
}
