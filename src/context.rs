//! The Job Context (C4): owns the bump arena and the string interner that
//! every other component borrows from for the lifetime of one link.

use crate::error::Result;
use crate::job::{Job, JobConfig};
use std::cell::RefCell;
use string_interner::{DefaultSymbol, StringInterner};

const ARENA_PAGE_SIZE: usize = 64 * 1024;

/// A bump allocator with page-sized chunks, freed en masse on [`Arena::reset`].
///
/// Only used to hold section byte buffers that need a stable address for the
/// lifetime of the job; most data in this crate is owned directly by `Vec`s
/// and doesn't need the arena at all.
pub struct Arena {
    chunks: RefCell<Vec<Vec<u8>>>,
    cursor: RefCell<usize>,
}

impl Arena {
    fn new() -> Self {
        Arena {
            chunks: RefCell::new(vec![Vec::with_capacity(ARENA_PAGE_SIZE)]),
            cursor: RefCell::new(0),
        }
    }

    /// Copy `bytes` into the arena and return a slice with the arena's
    /// borrow-checked lifetime.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> &[u8] {
        let mut chunks = self.chunks.borrow_mut();
        let needs_new_chunk = {
            let last = chunks.last().unwrap();
            last.capacity() - last.len() < bytes.len()
        };
        if needs_new_chunk {
            let cap = bytes.len().max(ARENA_PAGE_SIZE);
            chunks.push(Vec::with_capacity(cap));
        }
        let chunk = chunks.last_mut().unwrap();
        let start = chunk.len();
        chunk.extend_from_slice(bytes);
        *self.cursor.borrow_mut() += bytes.len();

        // SAFETY: chunks are never reallocated in place (we only push new
        // ones) and never shrunk, so a slice into a chunk's backing storage
        // stays valid until `reset` drops the whole chunk vector. The
        // borrow above has already ended by the time we hand this slice out.
        let ptr = chunk.as_ptr();
        unsafe { std::slice::from_raw_parts(ptr.add(start), bytes.len()) }
    }

    /// Drop all chunks, invalidating every slice previously handed out.
    pub fn reset(&self) {
        self.chunks.borrow_mut().clear();
        self.chunks.borrow_mut().push(Vec::with_capacity(ARENA_PAGE_SIZE));
        *self.cursor.borrow_mut() = 0;
    }
}

/// Owns the arena, the string interner, and the validated job configuration
/// for one link invocation.
pub struct Context {
    arena: Arena,
    interner: RefCell<StringInterner>,
    pub config: JobConfig,
}

impl Context {
    /// Allocate a fresh context for `job`, validating it first.
    pub fn create(job: &Job) -> Result<Self> {
        job.validate()?;
        Ok(Context {
            arena: Arena::new(),
            interner: RefCell::new(StringInterner::default()),
            config: job.config.clone(),
        })
    }

    /// Intern a string, returning a stable, `Copy` handle. Equal content
    /// always yields an equal handle (Testable Property 2).
    pub fn intern(&self, s: &str) -> DefaultSymbol {
        self.interner.borrow_mut().get_or_intern(s)
    }

    /// Resolve a previously interned handle back to its string.
    ///
    /// Panics if `sym` was not produced by this context's `intern` — that
    /// would be an internal programming error, not a data-validation
    /// failure.
    pub fn resolve(&self, sym: DefaultSymbol) -> String {
        self.interner
            .borrow()
            .resolve(sym)
            .expect("symbol handle from a foreign interner")
            .to_string()
    }

    /// Copy `bytes` into the job's arena, returning a slice valid for the
    /// context's lifetime.
    pub fn arena_alloc(&self, bytes: &[u8]) -> &[u8] {
        self.arena.alloc_bytes(bytes)
    }

    /// Reset the arena, invalidating all previously allocated slices.
    pub fn destroy(&self) {
        self.arena.reset();
    }
}
