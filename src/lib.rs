//! A static linker core: loads relocatable objects and archives, resolves
//! symbols across translation units, applies relocations, and emits a
//! bit-exact PE or ELF64 executable.
//!
//! The crate never touches the filesystem outside of [`link`]'s own input
//! reads and output write; callers own configuration parsing, CLI handling,
//! and process exit codes.

pub mod archive;
pub mod context;
pub mod elf;
pub mod error;
pub mod job;
pub mod pe;
pub mod reloc;
pub mod resolver;
pub mod ro;
pub mod search;
pub mod strtab;

pub use context::Context;
pub use error::{Error, Result};
pub use job::{ImportEntry, Job, JobConfig, OutputKind, Subsystem, Target};

use log::{debug, info};
use std::fs;

/// Run one link job end to end: load inputs, resolve symbols, apply
/// relocations, and write the chosen executable format to `job.output_path`.
///
/// On failure, any partially written output file at `job.output_path` is
/// removed before the error is returned.
pub fn link(job: Job) -> Result<()> {
    let result = link_inner(&job);
    if result.is_err() && job.output_path.exists() {
        debug!("removing partial output at {}", job.output_path.display());
        let _ = fs::remove_file(&job.output_path);
    }
    result
}

fn link_inner(job: &Job) -> Result<()> {
    info!(
        "starting link job: {} input(s) -> {}",
        job.inputs.len(),
        job.output_path.display()
    );
    let ctx = Context::create(job)?;

    let mut tus = Vec::new();
    for input in &job.inputs {
        let bytes = input.read()?;
        debug!("loading translation unit from {}", input.label());
        let tu = ro::load(&ctx, input.label().to_string(), &bytes)?;
        tus.push(tu);
    }

    let mut plan = resolver::resolve(&ctx, tus, job)?;

    match job.target {
        Target::Pe => pe::emit(&ctx, job, &mut plan)?,
        Target::Elf => elf::emit(&ctx, job, &mut plan)?,
    }

    info!("link job complete");
    Ok(())
}
