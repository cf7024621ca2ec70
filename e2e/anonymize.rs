//! E2E Test Suite 04: Write-time anonymization
//!
//! Records written with a Crypto-PAn key carry pseudonymized addresses that
//! preserve shared prefixes and are deterministic for the key; everything
//! else in the record is untouched.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use flowdump::anon::{parse_key, CryptoPAn};
use flowdump::archive::read::ArchiveReader;
use flowdump::archive::types::{StatRecord, DATA_BLOCK_TYPE_1};
use flowdump::archive::write::ArchiveWriter;
use flowdump::filter::FilterEngine;
use flowdump::flist::FileSequence;
use flowdump::output::{OutputLimits, OutputMode};
use flowdump::process::{process_files, RunConfig, RunMode};
use flowdump::record::{FlowAddrs, MasterRecord, RecordCursor};
use flowdump::stats::update_stat;
use tempfile::TempDir;

const KEY: &str = "abcdefghijklmnopqrstuvwxyz012345";

fn record(src: Ipv4Addr) -> MasterRecord {
    MasterRecord {
        srcport: 7777,
        dstport: 443,
        prot: 6,
        first: 1_400_000_000,
        last: 1_400_000_001,
        d_pkts: 1,
        d_octets: 64,
        addrs: FlowAddrs::V4 {
            src: u32::from(src),
            dst: u32::from(Ipv4Addr::new(198, 51, 100, 17)),
        },
        ..MasterRecord::default()
    }
}

fn write_archive(path: &Path, records: &[MasterRecord]) {
    let mut w = ArchiveWriter::create(path.to_str().unwrap(), "e2e").unwrap();
    let mut stat = StatRecord::default();
    for r in records {
        w.append_record(&r.encode()).unwrap();
        update_stat(&mut stat, r);
    }
    w.close(&stat).unwrap();
}

fn copy_anonymized(input: PathBuf, output: &Path) {
    let key = parse_key(KEY).unwrap();
    let cfg = RunConfig {
        mode: RunMode::Write {
            wfile: output.to_str().unwrap().to_owned(),
            ident: "anon".to_owned(),
            zero_flows: false,
        },
        filter: FilterEngine::compile("any").unwrap(),
        twin: None,
        limitflows: 0,
        anon: Some(CryptoPAn::new(&key)),
        output: OutputMode::resolve(None, false).unwrap(),
        limits: OutputLimits::default(),
    };
    let mut sink = Vec::new();
    process_files(FileSequence::from_paths(vec![input]), &cfg, &mut sink).unwrap();
}

fn read_records(path: &Path) -> Vec<MasterRecord> {
    let mut r = ArchiveReader::open(path.to_str().unwrap()).unwrap();
    let mut out = Vec::new();
    while let Some(block) = r.next_block().unwrap() {
        if block.header.id != DATA_BLOCK_TYPE_1 {
            continue;
        }
        for item in RecordCursor::new(block.payload) {
            let (_, raw) = item.unwrap();
            out.push(MasterRecord::expand(raw).unwrap());
        }
    }
    out
}

#[test]
fn neighbouring_addresses_share_31_anonymized_bits() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.flows");
    let output = dir.path().join("out.flows");
    write_archive(
        &input,
        &[
            record(Ipv4Addr::new(1, 2, 3, 4)),
            record(Ipv4Addr::new(1, 2, 3, 5)),
        ],
    );
    copy_anonymized(input, &output);

    let records = read_records(&output);
    assert_eq!(records.len(), 2);
    let a = records[0].addrs.src_u128() as u32;
    let b = records[1].addrs.src_u128() as u32;
    assert_ne!(a, u32::from(Ipv4Addr::new(1, 2, 3, 4)), "must be rewritten");
    // inputs differ only in the last bit, so the pseudonyms share 31 bits
    assert_eq!((a ^ b).leading_zeros(), 31);
}

#[test]
fn anonymization_is_deterministic_per_key() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.flows");
    let out1 = dir.path().join("out1.flows");
    let out2 = dir.path().join("out2.flows");
    write_archive(&input, &[record(Ipv4Addr::new(203, 0, 113, 99))]);

    copy_anonymized(input.clone(), &out1);
    copy_anonymized(input, &out2);
    assert_eq!(
        read_records(&out1)[0].addrs,
        read_records(&out2)[0].addrs
    );
}

#[test]
fn non_address_fields_survive_anonymization() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.flows");
    let output = dir.path().join("out.flows");
    let original = record(Ipv4Addr::new(10, 20, 30, 40));
    write_archive(&input, &[original]);
    copy_anonymized(input, &output);

    let copied = read_records(&output)[0];
    assert_eq!(copied.srcport, original.srcport);
    assert_eq!(copied.dstport, original.dstport);
    assert_eq!(copied.prot, original.prot);
    assert_eq!(copied.first, original.first);
    assert_eq!(copied.d_pkts, original.d_pkts);
    assert_eq!(copied.d_octets, original.d_octets);
    assert_ne!(copied.addrs, original.addrs);
}

#[test]
fn both_address_slots_are_rewritten() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.flows");
    let output = dir.path().join("out.flows");
    let original = record(Ipv4Addr::new(10, 20, 30, 40));
    write_archive(&input, &[original]);
    copy_anonymized(input, &output);

    let key = parse_key(KEY).unwrap();
    let pan = CryptoPAn::new(&key);
    let copied = read_records(&output)[0];
    assert_eq!(copied.addrs, pan.anonymize(original.addrs));
}
