use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// A compilation unit: the file name shown in diagnostics plus the raw text.
/// Chunks keep a shared handle to their source so runtime traces can name it.
pub struct Source {
    pub fname: String,
    pub text: String,
}

impl Source {
    pub fn new(fname: impl Into<String>, text: impl Into<String>) -> Self {
        Self { fname: fname.into(), text: text.into() }
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Ok(Self { fname: path.display().to_string(), text })
    }
}

#[derive(Debug, Error)]
pub enum InterpretError {
    /// One or more errors were reported on stderr while compiling; nothing ran.
    #[error("compile error")]
    Compile,
    /// Execution aborted. The display text is the full stack trace, starting
    /// with `Error: <message>` and one `[file:line:column]` line per frame.
    #[error("{trace}")]
    Runtime { trace: String },
}
