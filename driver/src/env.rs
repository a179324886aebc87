use std::{io, path::PathBuf};

use dotenvy::dotenv;

/// Loads a `.env` from the working directory or its parents, so
/// `OVERLAY_SCENARIO` and `RUST_LOG` can live there. Returns the file that was
/// read, or `None` when there is none to read.
///
/// This runs before the subscriber exists, so a malformed file is handed back
/// for the caller to report.
pub fn load_dotenvy_vars_if_present() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(dotenvy::Error::Io(io::Error { .. })) => Ok(None),
        Err(e) => Err(e),
    }
}
