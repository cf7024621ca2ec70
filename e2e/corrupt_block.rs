//! E2E Test Suite 05: Corrupt and foreign blocks
//!
//! A block with an unknown id is skipped with its record count charged to
//! `skipped_flows`, and processing continues with the blocks after it.
//! Oversized blocks abort the file but not the run.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use flowdump::archive::types::{
    DataBlockHeader, FileHeader, StatRecord, DATA_BLOCK_TYPE_1, MAX_BUFFER_SIZE,
};
use flowdump::archive::write::ArchiveWriter;
use flowdump::filter::FilterEngine;
use flowdump::flist::FileSequence;
use flowdump::output::{OutputLimits, OutputMode};
use flowdump::process::{process_files, RunConfig, RunMode};
use flowdump::record::{FlowAddrs, MasterRecord};
use flowdump::stats::update_stat;
use tempfile::TempDir;

fn record(i: u32) -> MasterRecord {
    MasterRecord {
        srcport: i as u16,
        prot: 6,
        first: 1_500_000_000 + i,
        last: 1_500_000_001 + i,
        d_pkts: 1,
        d_octets: 100,
        addrs: FlowAddrs::V4 {
            src: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            dst: u32::from(Ipv4Addr::new(10, 0, 0, 2)),
        },
        ..MasterRecord::default()
    }
}

fn block_bytes(id: u32, num_records: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = DataBlockHeader {
        size: payload.len() as u32,
        num_records,
        id,
        pad: 0,
    }
    .encode()
    .to_vec();
    out.extend_from_slice(payload);
    out
}

/// Hand-assemble an archive: header, a good block, a foreign block claiming
/// 7 records, another good block.
fn write_with_foreign_block(path: &Path) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(&FileHeader::new("corrupt").encode()).unwrap();

    let good1: Vec<u8> = (0..3).flat_map(|i| record(i).encode()).collect();
    f.write_all(&block_bytes(DATA_BLOCK_TYPE_1, 3, &good1)).unwrap();

    f.write_all(&block_bytes(0xDEAD, 7, &[0u8; 32])).unwrap();

    let good2: Vec<u8> = (10..12).flat_map(|i| record(i).encode()).collect();
    f.write_all(&block_bytes(DATA_BLOCK_TYPE_1, 2, &good2)).unwrap();
}

fn run_print(paths: Vec<std::path::PathBuf>) -> (StatRecord, u64, u64) {
    let cfg = RunConfig {
        mode: RunMode::Print,
        filter: FilterEngine::compile("any").unwrap(),
        twin: None,
        limitflows: 0,
        anon: None,
        output: OutputMode::resolve(Some("pipe"), false).unwrap(),
        limits: OutputLimits::default(),
    };
    let mut out = Vec::new();
    let result = process_files(FileSequence::from_paths(paths), &cfg, &mut out).unwrap();
    (
        result.stat,
        result.totals.total_flows,
        result.totals.skipped_flows,
    )
}

#[test]
fn foreign_block_is_skipped_and_counted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("foreign.flows");
    write_with_foreign_block(&path);

    let (stat, total, skipped) = run_print(vec![path]);
    // both good blocks processed, the foreign one charged as skipped
    assert_eq!(stat.numflows, 5);
    assert_eq!(total, 5);
    assert_eq!(skipped, 7);
}

#[test]
fn oversized_block_aborts_file_but_not_run() {
    let dir = TempDir::new().unwrap();
    let bad = dir.path().join("bad.flows");
    {
        let mut f = std::fs::File::create(&bad).unwrap();
        f.write_all(&FileHeader::new("bad").encode()).unwrap();
        let good: Vec<u8> = (0..2).flat_map(|i| record(i).encode()).collect();
        f.write_all(&block_bytes(DATA_BLOCK_TYPE_1, 2, &good)).unwrap();
        // declares more than the cap; payload never materializes
        let hdr = DataBlockHeader {
            size: (MAX_BUFFER_SIZE + 1) as u32,
            num_records: 9,
            id: DATA_BLOCK_TYPE_1,
            pad: 0,
        };
        f.write_all(&hdr.encode()).unwrap();
    }
    let good = dir.path().join("good.flows");
    {
        let mut w = ArchiveWriter::create(good.to_str().unwrap(), "ok").unwrap();
        let mut stat = StatRecord::default();
        for i in 0..4 {
            let r = record(i);
            w.append_record(&r.encode()).unwrap();
            update_stat(&mut stat, &r);
        }
        w.close(&stat).unwrap();
    }

    let (stat, _, skipped) = run_print(vec![bad, good]);
    // 2 records before the corruption plus the full second file
    assert_eq!(stat.numflows, 6);
    assert_eq!(skipped, 9);
}

#[test]
fn truncated_file_reports_and_continues() {
    let dir = TempDir::new().unwrap();
    let cut = dir.path().join("cut.flows");
    {
        let mut w = ArchiveWriter::create(cut.to_str().unwrap(), "cut").unwrap();
        let mut stat = StatRecord::default();
        for i in 0..4 {
            let r = record(i);
            w.append_record(&r.encode()).unwrap();
            update_stat(&mut stat, &r);
        }
        w.close(&stat).unwrap();
    }
    // chop the trailer and part of the data block
    let bytes = std::fs::read(&cut).unwrap();
    std::fs::write(&cut, &bytes[..bytes.len() - 160]).unwrap();

    let good = dir.path().join("whole.flows");
    {
        let mut w = ArchiveWriter::create(good.to_str().unwrap(), "ok").unwrap();
        let mut stat = StatRecord::default();
        let r = record(77);
        w.append_record(&r.encode()).unwrap();
        update_stat(&mut stat, &r);
        w.close(&stat).unwrap();
    }

    let (stat, _, _) = run_print(vec![cut, good]);
    // the whole second file still lands
    assert_eq!(stat.numflows, 1);
}
