//! The configuration surface a caller populates before calling [`crate::link`].
//!
//! These are plain Rust types with no JSON or CLI parsing attached — the
//! embedder (or an external config front end) is responsible for turning a
//! config file or argv into a [`Job`].

use crate::error::{Error, Result};
use std::fs;
use std::path::PathBuf;

/// Host executable format to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Pe,
    Elf,
}

/// What kind of binary to produce. Only `Executable` is fully implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Executable,
    SharedLibrary,
    StaticLibrary,
}

/// PE subsystem selection; meaningless for ELF targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Console,
    Windows,
}

/// One input to the link: either a file on disk or an in-memory byte range
/// with a caller-supplied label used for diagnostics.
#[derive(Debug, Clone)]
pub enum InputSource {
    Path(PathBuf),
    Memory { label: String, bytes: Vec<u8> },
}

impl InputSource {
    pub fn label(&self) -> &str {
        match self {
            InputSource::Path(p) => p.to_str().unwrap_or("<non-utf8 path>"),
            InputSource::Memory { label, .. } => label,
        }
    }

    pub(crate) fn read(&self) -> Result<Vec<u8>> {
        match self {
            InputSource::Path(p) => fs::read(p).map_err(Error::Io),
            InputSource::Memory { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

/// A pre-declared import: bind an undefined global symbol to a module/symbol
/// pair rather than letting resolution fail.
#[derive(Debug, Clone)]
pub struct ImportEntry {
    pub module: String,
    pub symbol: String,
    /// Stable ordinal within the link; assigned in configuration order when
    /// `None`.
    pub slot: Option<u32>,
}

/// Everything the resolver and emitters need beyond the raw input list.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub subsystem: Option<Subsystem>,
    pub image_base: Option<u64>,
    pub stack_size: Option<u64>,
    pub entry_point: Option<String>,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<String>,
    pub library_paths: Vec<PathBuf>,
    pub libraries: Vec<String>,
}

/// A single link invocation.
#[derive(Debug, Clone)]
pub struct Job {
    pub target: Target,
    pub output_kind: OutputKind,
    pub output_path: PathBuf,
    pub inputs: Vec<InputSource>,
    pub config: JobConfig,
}

impl Default for Subsystem {
    fn default() -> Self {
        Subsystem::Console
    }
}

impl Job {
    /// Validate the job is well-formed enough to attempt a link.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::InvalidArgument("job has no inputs".into()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("job has no output path".into()));
        }
        if self.output_kind != OutputKind::Executable {
            return Err(Error::Unsupported(
                "only Executable output is implemented".into(),
            ));
        }
        Ok(())
    }

    pub fn default_image_base(&self) -> u64 {
        self.config.image_base.unwrap_or(match self.target {
            Target::Pe => 0x1_4000_0000,
            Target::Elf => 0x0040_0000,
        })
    }
}
