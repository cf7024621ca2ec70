//! E2E Test Suite 06: Short-read recovery
//!
//! A pipe that delivers the archive in arbitrary small pieces must produce
//! exactly the same records as a file read in one go.

use std::io::{self, Read};
use std::net::Ipv4Addr;

use flowdump::archive::read::ArchiveReader;
use flowdump::archive::types::{DataBlockHeader, FileHeader, StatRecord, DATA_BLOCK_TYPE_1};
use flowdump::record::{FlowAddrs, MasterRecord, RecordCursor};
use flowdump::stats::update_stat;

/// Delivers its contents at most `chunk` bytes per read call.
struct ChunkedPipe {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Read for ChunkedPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn record(i: u32) -> MasterRecord {
    MasterRecord {
        srcport: (i % 60000) as u16,
        dstport: 443,
        prot: 6,
        first: 1_600_000_000 + i,
        last: 1_600_000_002 + i,
        d_pkts: i as u64,
        d_octets: (i * 13) as u64,
        addrs: FlowAddrs::V4 {
            src: u32::from(Ipv4Addr::new(10, 0, 0, 1)) + i,
            dst: u32::from(Ipv4Addr::new(172, 16, 0, 9)),
        },
        ..MasterRecord::default()
    }
}

/// An in-memory archive: header, two data blocks, stat trailer block.
fn archive_bytes(num_records: u32) -> Vec<u8> {
    let mut out = FileHeader::new("pipe").encode().to_vec();
    let mut stat = StatRecord::default();
    let half = num_records / 2;
    for range in [0..half, half..num_records] {
        let mut payload = Vec::new();
        let mut count = 0;
        for i in range {
            let r = record(i);
            update_stat(&mut stat, &r);
            payload.extend_from_slice(&r.encode());
            count += 1;
        }
        let hdr = DataBlockHeader {
            size: payload.len() as u32,
            num_records: count,
            id: DATA_BLOCK_TYPE_1,
            pad: 0,
        };
        out.extend_from_slice(&hdr.encode());
        out.extend_from_slice(&payload);
    }
    out
}

fn read_all(src: Box<dyn Read>) -> Vec<MasterRecord> {
    let mut reader = ArchiveReader::from_reader(src, "test").unwrap();
    let mut records = Vec::new();
    while let Some(block) = reader.next_block().unwrap() {
        if block.header.id != DATA_BLOCK_TYPE_1 {
            continue;
        }
        for item in RecordCursor::new(block.payload) {
            let (_, raw) = item.unwrap();
            records.push(MasterRecord::expand(raw).unwrap());
        }
    }
    records
}

#[test]
fn halved_delivery_matches_single_read() {
    let bytes = archive_bytes(40);
    let whole = read_all(Box::new(io::Cursor::new(bytes.clone())));

    // one read boundary right in the middle of the stream
    let half = bytes.len() / 2;
    struct TwoHalves {
        parts: Vec<Vec<u8>>,
        current: usize,
        pos: usize,
    }
    impl Read for TwoHalves {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            while self.current < self.parts.len() {
                let part = &self.parts[self.current];
                if self.pos < part.len() {
                    let n = buf.len().min(part.len() - self.pos);
                    buf[..n].copy_from_slice(&part[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
                self.current += 1;
                self.pos = 0;
            }
            Ok(0)
        }
    }
    let split = read_all(Box::new(TwoHalves {
        parts: vec![bytes[..half].to_vec(), bytes[half..].to_vec()],
        current: 0,
        pos: 0,
    }));

    assert_eq!(whole.len(), 40);
    assert_eq!(whole, split);
}

#[test]
fn dribbling_pipe_matches_single_read() {
    let bytes = archive_bytes(25);
    let whole = read_all(Box::new(io::Cursor::new(bytes.clone())));

    for chunk in [1, 3, 7, 16, 100] {
        let dribbled = read_all(Box::new(ChunkedPipe {
            data: bytes.clone(),
            pos: 0,
            chunk,
        }));
        assert_eq!(whole, dribbled, "chunk size {}", chunk);
    }
}

#[test]
fn chunked_header_still_validates() {
    let bytes = archive_bytes(4);
    let reader = ArchiveReader::from_reader(
        Box::new(ChunkedPipe {
            data: bytes,
            pos: 0,
            chunk: 5,
        }),
        "tiny-chunks",
    )
    .unwrap();
    assert_eq!(reader.header.ident, "pipe");
}
