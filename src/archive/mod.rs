//! Block-structured flow-archive format: header/trailer types, the block
//! reader with short-read recovery, and the staging-buffer writer.

pub mod codec;
pub mod read;
pub mod types;
pub mod write;

pub use read::{read_file_info, read_stat_record, ArchiveReader, Block, STDIN_MARK};
pub use types::{
    ArchiveError, DataBlockHeader, FileHeader, StatRecord, BLOCK_HEADER_SIZE, BUFFSIZE,
    DATA_BLOCK_TYPE_1, FILE_HEADER_SIZE, IDENT_SIZE, LAYOUT_VERSION, MAGIC, MAX_BUFFER_SIZE,
    OUTPUT_BUFF_SIZE, OUTPUT_FLUSH_LIMIT, STAT_BLOCK_TYPE, STAT_RECORD_SIZE,
};
pub use write::{change_ident, ArchiveWriter, STDOUT_MARK};
