//! In-memory flow aggregation: key projection, the chained hash table and
//! Top-N selection, plus the date-sort buffer.

pub mod mask;
pub mod table;
pub mod topn;

pub use mask::AggrSpec;
pub use table::{FlowEntry, FlowKey, FlowTable, HASH_BITS, NUM_PREALLOC};
pub use topn::{top_n, OrderBy, SortBuffer};
