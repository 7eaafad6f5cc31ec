//! Purpose: Write-back staging cache for append-only files, backed by a
//! memory-mapped persistent-memory directory file.
//! Exports: `core` (directory layout, slot commit protocol, flusher, sweep,
//! errors) plus top-level re-exports of the handle types.
//! Role: Library backing the `pmstage` administrative binary and the
//! embedding storage engine.
//! Invariants: Acknowledged bytes survive a crash; commit visibility follows
//! reservation order; `flushed_eof <= cached_eof` holds on media at all times.
pub mod core;

pub use crate::core::cache::AppendCache;
pub use crate::core::directory::{Directory, DirectoryInfo, SlotInfo};
pub use crate::core::error::{to_exit_code, Error, ErrorKind};
