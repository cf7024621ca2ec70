// flowdump — NetFlow v5/v7 flow-archive processor

pub mod aggregate;
pub mod anon;
pub mod archive;
pub mod cli;
pub mod display;
pub mod filter;
pub mod flist;
pub mod output;
pub mod process;
pub mod record;
pub mod stats;
pub mod timewin;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level convenience re-exports for the most common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// Block-structured archive reader.
pub use archive::read::ArchiveReader;
/// Append-only archive writer with summary trailer.
pub use archive::write::ArchiveWriter;
/// Summary-trailer counters.
pub use archive::types::StatRecord;
/// Fixed-width in-memory flow record.
pub use record::MasterRecord;
/// Compiled flow filter.
pub use filter::FilterEngine;
/// Prefix-preserving address pseudonymizer.
pub use anon::CryptoPAn;
/// The record processing loop.
pub use process::{process_files, RunConfig, RunMode, RunResult};
