//! E2E Test Suite 01: Pass-through copy
//!
//! Reads an archive with a pass-all filter and no aggregation, writes a new
//! archive, and verifies the record byte stream survives unchanged while the
//! summary trailer is regenerated from the records.

use std::net::Ipv4Addr;
use std::path::Path;

use flowdump::archive::read::{read_stat_record, ArchiveReader};
use flowdump::archive::types::{StatRecord, DATA_BLOCK_TYPE_1};
use flowdump::archive::write::ArchiveWriter;
use flowdump::filter::FilterEngine;
use flowdump::flist::FileSequence;
use flowdump::output::{OutputLimits, OutputMode};
use flowdump::process::{process_files, RunConfig, RunMode};
use flowdump::record::{FlowAddrs, MasterRecord};
use flowdump::stats::update_stat;
use tempfile::TempDir;

fn tcp_record(i: u32) -> MasterRecord {
    MasterRecord {
        srcport: (1024 + i) as u16,
        dstport: 80,
        prot: 6,
        tcp_flags: 0x12,
        first: 1_100_000_000 + i,
        last: 1_100_000_030 + i,
        msec_first: (i % 1000) as u16,
        msec_last: ((i + 500) % 1000) as u16,
        d_pkts: 10 + i as u64,
        d_octets: 1000 + i as u64,
        addrs: FlowAddrs::V4 {
            src: u32::from(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8)),
            dst: u32::from(Ipv4Addr::new(192, 168, 0, 1)),
        },
        ..MasterRecord::default()
    }
}

/// Write `records` as an archive with one data block per `per_block` records.
fn write_archive(path: &Path, records: &[MasterRecord], per_block: usize) -> StatRecord {
    let mut w = ArchiveWriter::create(path.to_str().unwrap(), "e2e").unwrap();
    let mut stat = StatRecord::default();
    for (i, r) in records.iter().enumerate() {
        w.append_record(&r.encode()).unwrap();
        update_stat(&mut stat, r);
        if (i + 1) % per_block == 0 {
            w.flush_block().unwrap();
        }
    }
    w.close(&stat).unwrap();
    stat
}

/// Concatenated payload bytes of all data blocks.
fn record_stream(path: &Path) -> Vec<u8> {
    let mut r = ArchiveReader::open(path.to_str().unwrap()).unwrap();
    let mut out = Vec::new();
    while let Some(block) = r.next_block().unwrap() {
        if block.header.id == DATA_BLOCK_TYPE_1 {
            out.extend_from_slice(block.payload);
        }
    }
    out
}

#[test]
fn pass_through_copy_preserves_record_bytes() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.flows");
    let output = dir.path().join("out.flows");

    let records: Vec<MasterRecord> = (0..100).map(tcp_record).collect();
    write_archive(&input, &records, 34); // 3 data blocks

    let cfg = RunConfig {
        mode: RunMode::Write {
            wfile: output.to_str().unwrap().to_owned(),
            ident: "copy".to_owned(),
            zero_flows: false,
        },
        filter: FilterEngine::compile("any").unwrap(),
        twin: None,
        limitflows: 0,
        anon: None,
        output: OutputMode::resolve(None, false).unwrap(),
        limits: OutputLimits::default(),
    };
    let mut sink = Vec::new();
    let result = process_files(
        FileSequence::from_paths(vec![input.clone()]),
        &cfg,
        &mut sink,
    )
    .unwrap();

    // identical record bytes, independent of block re-batching
    assert_eq!(record_stream(&input), record_stream(&output));

    // trailer regenerated from the records
    let trailer = read_stat_record(output.to_str().unwrap()).unwrap().unwrap();
    assert_eq!(trailer.numflows, 100);
    assert_eq!(trailer.numflows_tcp, 100);
    assert_eq!(trailer.numflows_udp, 0);
    assert_eq!(trailer.first_seen, 1_100_000_000);
    assert_eq!(trailer.last_seen, 1_100_000_030 + 99);
    assert_eq!(result.totals.total_flows, 100);
    assert_eq!(result.totals.skipped_flows, 0);
}

#[test]
fn trailer_window_encloses_every_record() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.flows");
    let records: Vec<MasterRecord> = (0..50).map(tcp_record).collect();
    let stat = write_archive(&input, &records, 10);

    for r in &records {
        assert!((stat.first_seen, stat.msec_first) <= (r.first, r.msec_first));
        assert!((stat.last_seen, stat.msec_last) >= (r.last, r.msec_last));
    }
}

#[test]
fn copy_of_a_copy_is_stable() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.flows");
    let b = dir.path().join("b.flows");
    let c = dir.path().join("c.flows");
    write_archive(&a, &(0..20).map(tcp_record).collect::<Vec<_>>(), 7);

    for (src, dst) in [(&a, &b), (&b, &c)] {
        let cfg = RunConfig {
            mode: RunMode::Write {
                wfile: dst.to_str().unwrap().to_owned(),
                ident: "again".to_owned(),
                zero_flows: false,
            },
            filter: FilterEngine::compile("any").unwrap(),
            twin: None,
            limitflows: 0,
            anon: None,
            output: OutputMode::resolve(None, false).unwrap(),
            limits: OutputLimits::default(),
        };
        let mut sink = Vec::new();
        process_files(FileSequence::from_paths(vec![src.clone()]), &cfg, &mut sink).unwrap();
    }
    assert_eq!(record_stream(&a), record_stream(&c));
    let ta = read_stat_record(a.to_str().unwrap()).unwrap().unwrap();
    let tc = read_stat_record(c.to_str().unwrap()).unwrap().unwrap();
    assert_eq!(ta.numflows, tc.numflows);
    assert_eq!(ta.numbytes, tc.numbytes);
}
