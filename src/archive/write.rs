//! Append-only archive writer with a staging buffer and summary trailer.
//!
//! Records are packed into a single staging buffer and written out as one
//! block when the buffer passes [`OUTPUT_FLUSH_LIMIT`]; one buffered write
//! per block keeps per-record syscall overhead off the hot path.
//!
//! A file destination is written as `<path>.tmp` and renamed into place by
//! [`ArchiveWriter::close`] after the summary trailer goes out, so a file at
//! the final path always carries its trailer.  The `-` sentinel streams the
//! header and blocks to stdout with no trailer and no rename.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::archive::types::{
    ArchiveError, DataBlockHeader, FileHeader, StatRecord, DATA_BLOCK_TYPE_1, OUTPUT_BUFF_SIZE,
    OUTPUT_FLUSH_LIMIT, STAT_BLOCK_TYPE,
};

/// Sentinel path: write the block stream to standard output.
pub const STDOUT_MARK: &str = "-";

pub struct ArchiveWriter {
    dst: Box<dyn Write>,
    staging: Vec<u8>,
    num_records: u32,
    /// Data blocks written so far.
    pub num_blocks: u32,
    to_stdout: bool,
    tmp_path: Option<PathBuf>,
    final_path: Option<PathBuf>,
}

impl ArchiveWriter {
    /// Create `<path>.tmp` and write the file header.
    pub fn create(path: &str, ident: &str) -> Result<Self, ArchiveError> {
        if path == STDOUT_MARK {
            return Self::stdout(ident);
        }
        let final_path = PathBuf::from(path);
        let tmp_path = final_path.with_extension("tmp");
        let f = File::create(&tmp_path)?;
        let mut dst: Box<dyn Write> = Box::new(BufWriter::new(f));
        dst.write_all(&FileHeader::new(ident).encode())?;
        Ok(ArchiveWriter {
            dst,
            staging: Vec::with_capacity(OUTPUT_BUFF_SIZE),
            num_records: 0,
            num_blocks: 0,
            to_stdout: false,
            tmp_path: Some(tmp_path),
            final_path: Some(final_path),
        })
    }

    /// Stream to stdout: file header now, blocks as they fill, no trailer.
    pub fn stdout(ident: &str) -> Result<Self, ArchiveError> {
        let mut dst: Box<dyn Write> = Box::new(io::stdout());
        dst.write_all(&FileHeader::new(ident).encode())?;
        Ok(ArchiveWriter {
            dst,
            staging: Vec::with_capacity(OUTPUT_BUFF_SIZE),
            num_records: 0,
            num_blocks: 0,
            to_stdout: true,
            tmp_path: None,
            final_path: None,
        })
    }

    /// Append one packed record (header, fields, addresses, extensions).
    /// The record's `mark` field is written as zero regardless of input.
    pub fn append_record(&mut self, record: &[u8]) -> Result<(), ArchiveError> {
        if self.staging.len() + record.len() > OUTPUT_BUFF_SIZE {
            self.flush_block()?;
        }
        let at = self.staging.len();
        self.staging.extend_from_slice(record);
        if record.len() >= 6 {
            self.staging[at + 4] = 0;
            self.staging[at + 5] = 0;
        }
        self.num_records += 1;
        if self.staging.len() > OUTPUT_FLUSH_LIMIT {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Write the staged records as one data block and reset the buffer.
    pub fn flush_block(&mut self) -> Result<(), ArchiveError> {
        if self.num_records == 0 {
            return Ok(());
        }
        let hdr = DataBlockHeader {
            size: self.staging.len() as u32,
            num_records: self.num_records,
            id: DATA_BLOCK_TYPE_1,
            pad: 0,
        };
        self.dst.write_all(&hdr.encode())?;
        self.dst.write_all(&self.staging)?;
        self.staging.clear();
        self.num_records = 0;
        self.num_blocks += 1;
        Ok(())
    }

    /// Flush the partial block, append the summary trailer and rename the
    /// temp file into place.  On stdout the trailer and rename are skipped.
    pub fn close(mut self, stat: &StatRecord) -> Result<(), ArchiveError> {
        self.flush_block()?;
        if !self.to_stdout {
            let mut stat = *stat;
            stat.numblocks = self.num_blocks;
            let hdr = DataBlockHeader {
                size: stat.encode().len() as u32,
                num_records: 0,
                id: STAT_BLOCK_TYPE,
                pad: 0,
            };
            self.dst.write_all(&hdr.encode())?;
            self.dst.write_all(&stat.encode())?;
        }
        self.dst.flush()?;
        drop(self.dst);
        if let (Some(tmp), Some(fin)) = (self.tmp_path, self.final_path) {
            fs::rename(tmp, fin)?;
        }
        Ok(())
    }
}

/// Rewrite the identifier of an existing archive in place.  The header is
/// validated first, so foreign files are never touched.
pub fn change_ident(path: &str, ident: &str) -> Result<(), ArchiveError> {
    use crate::archive::types::{FILE_HEADER_SIZE, IDENT_SIZE};
    use std::io::{Read, Seek, SeekFrom};

    let mut f = fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut hdr = [0u8; FILE_HEADER_SIZE];
    f.read_exact(&mut hdr)?;
    FileHeader::decode(&hdr)?;

    let mut field = [0u8; IDENT_SIZE];
    let bytes = ident.as_bytes();
    let n = bytes.len().min(IDENT_SIZE);
    field[..n].copy_from_slice(&bytes[..n]);
    f.seek(SeekFrom::Start(12))?;
    f.write_all(&field)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::read::{read_stat_record, ArchiveReader};
    use crate::record::MasterRecord;
    use tempfile::TempDir;

    #[test]
    fn close_writes_trailer_and_renames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.flows");
        let mut w = ArchiveWriter::create(path.to_str().unwrap(), "test").unwrap();
        w.append_record(&MasterRecord::default().encode()).unwrap();
        let stat = StatRecord {
            numflows: 1,
            ..StatRecord::default()
        };
        w.close(&stat).unwrap();

        assert!(path.exists(), "final path must exist after close");
        assert!(!path.with_extension("tmp").exists(), "tmp must be renamed");
        let back = read_stat_record(path.to_str().unwrap()).unwrap().unwrap();
        assert_eq!(back.numflows, 1);
        assert_eq!(back.numblocks, 1);
    }

    #[test]
    fn unclosed_writer_leaves_tmp_without_trailer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.flows");
        {
            let mut w = ArchiveWriter::create(path.to_str().unwrap(), "test").unwrap();
            w.append_record(&MasterRecord::default().encode()).unwrap();
            w.flush_block().unwrap();
            // dropped without close()
        }
        assert!(!path.exists());
        let tmp = path.with_extension("tmp");
        assert!(tmp.exists());
        assert!(read_stat_record(tmp.to_str().unwrap()).unwrap().is_none());
    }

    #[test]
    fn records_survive_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rt.flows");
        let recs: Vec<Vec<u8>> = (0..5)
            .map(|i| {
                MasterRecord {
                    srcport: 1000 + i,
                    ..MasterRecord::default()
                }
                .encode()
            })
            .collect();
        let mut w = ArchiveWriter::create(path.to_str().unwrap(), "rt").unwrap();
        for r in &recs {
            w.append_record(r).unwrap();
        }
        w.close(&StatRecord::default()).unwrap();

        let mut r = ArchiveReader::open(path.to_str().unwrap()).unwrap();
        let block = r.next_block().unwrap().unwrap();
        assert_eq!(block.header.num_records, 5);
        let flat: Vec<u8> = recs.concat();
        assert_eq!(block.payload, &flat[..]);
    }

    #[test]
    fn mark_field_zeroed_on_append() {
        use crate::archive::codec::{read_le16, write_le16};
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mark.flows");
        let mut bytes = MasterRecord::default().encode();
        write_le16(&mut bytes, 4, 0xBEEF);
        let mut w = ArchiveWriter::create(path.to_str().unwrap(), "m").unwrap();
        w.append_record(&bytes).unwrap();
        w.close(&StatRecord::default()).unwrap();

        let mut r = ArchiveReader::open(path.to_str().unwrap()).unwrap();
        let block = r.next_block().unwrap().unwrap();
        assert_eq!(read_le16(block.payload, 4), 0);
    }

    #[test]
    fn change_ident_rewrites_header_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("id.flows");
        let mut w = ArchiveWriter::create(path.to_str().unwrap(), "before").unwrap();
        w.append_record(&MasterRecord::default().encode()).unwrap();
        w.close(&StatRecord::default()).unwrap();

        change_ident(path.to_str().unwrap(), "after").unwrap();
        let (header, stat) =
            crate::archive::read::read_file_info(path.to_str().unwrap()).unwrap();
        assert_eq!(header.ident, "after");
        assert!(stat.is_some());
    }

    #[test]
    fn flush_threshold_splits_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.flows");
        let rec = MasterRecord::default().encode();
        let per_block = OUTPUT_FLUSH_LIMIT / rec.len() + 1;
        let mut w = ArchiveWriter::create(path.to_str().unwrap(), "big").unwrap();
        for _ in 0..per_block + 1 {
            w.append_record(&rec).unwrap();
        }
        w.close(&StatRecord::default()).unwrap();

        let mut r = ArchiveReader::open(path.to_str().unwrap()).unwrap();
        let mut data_blocks = 0;
        while let Some(b) = r.next_block().unwrap() {
            if b.header.id == DATA_BLOCK_TYPE_1 {
                data_blocks += 1;
            }
        }
        assert_eq!(data_blocks, 2);
    }
}
