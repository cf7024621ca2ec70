//! The record processing loop: pulls blocks, expands records, applies the
//! time window and filter, feeds the stat accumulator, and dispatches each
//! passing record to exactly one sink — the output archive, the aggregation
//! table, the element-stat table, the date-sort buffer, or the formatter.

use std::io::Write;

use anyhow::{Context, Result};

use crate::aggregate::mask::AggrSpec;
use crate::aggregate::table::{FlowEntry, FlowTable};
use crate::aggregate::topn::{top_n, OrderBy, SortBuffer};
use crate::anon::CryptoPAn;
use crate::archive::read::ArchiveReader;
use crate::archive::types::{ArchiveError, StatRecord, DATA_BLOCK_TYPE_1, STAT_BLOCK_TYPE};
use crate::archive::write::ArchiveWriter;
use crate::filter::FilterEngine;
use crate::flist::FileSequence;
use crate::logerr;
use crate::output::{OutputLimits, OutputMode};
use crate::record::{MasterRecord, RecordCursor};
use crate::stats::{update_stat, StatElement};

/// What happens to a record once it passes the filter.
pub enum RunMode {
    /// Copy passing records into a new archive.
    Write {
        wfile: String,
        ident: String,
        /// Write only the header and summary trailer.
        zero_flows: bool,
    },
    /// Fold records into the aggregation table under a key projection.
    Aggregate { spec: AggrSpec },
    /// Fold records into the table under a single-element key.
    ElementStat { element: StatElement },
    /// Buffer records for globally date-sorted printing.
    DateSort,
    /// Render records as they stream by.
    Print,
}

pub struct RunConfig {
    pub mode: RunMode,
    pub filter: FilterEngine,
    /// Inclusive time window; a record passes when it lies entirely inside.
    pub twin: Option<(u32, u32)>,
    /// Stop after this many records passed; 0 = unlimited.
    pub limitflows: u64,
    pub anon: Option<CryptoPAn>,
    pub output: OutputMode,
    pub limits: OutputLimits,
}

/// Run-wide bookkeeping, reported in the footer.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunTotals {
    /// Records seen, filtered or not.
    pub total_flows: u64,
    /// Records lost to corrupt or foreign blocks.
    pub skipped_flows: u64,
    /// Bytes consumed from all input streams.
    pub total_bytes: u64,
    /// Time span of all processed (not only matched) records.
    pub t_first: u32,
    pub t_last: u32,
}

pub struct RunResult {
    pub stat: StatRecord,
    pub totals: RunTotals,
    /// The aggregation or element-stat table, when one was active.
    pub table: Option<FlowTable>,
    /// The date-sort buffer, when sorting was active.
    pub sorted: Option<SortBuffer>,
}

/// Marker for allocation/init failures, so the binary can map them to the
/// dedicated exit code while run errors exit generically.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InitError(pub String);

/// The one active record sink of a run.
enum Sink {
    Writer { writer: ArchiveWriter, zero_flows: bool },
    Aggregate { spec: AggrSpec, table: FlowTable },
    Element { element: StatElement, table: FlowTable },
    Sort(SortBuffer),
    Print,
}

/// Walk all input files and process every record.
///
/// Failures on individual input files are logged and the walk continues;
/// a write error on the output archive is fatal and surfaced to the caller
/// with the file left trailer-less.
pub fn process_files(
    files: FileSequence,
    cfg: &RunConfig,
    out: &mut dyn Write,
) -> Result<RunResult> {
    let mut stat = StatRecord::default();
    let mut totals = RunTotals {
        t_first: u32::MAX,
        ..RunTotals::default()
    };

    let mut sink = match &cfg.mode {
        RunMode::Write {
            wfile,
            ident,
            zero_flows,
        } => Sink::Writer {
            writer: ArchiveWriter::create(wfile, ident)
                .with_context(|| format!("can't open '{}' for writing", wfile))?,
            zero_flows: *zero_flows,
        },
        RunMode::Aggregate { spec } => Sink::Aggregate {
            spec: *spec,
            table: FlowTable::init().map_err(|e| InitError(e.to_string()))?,
        },
        RunMode::ElementStat { element } => Sink::Element {
            element: *element,
            table: FlowTable::init().map_err(|e| InitError(e.to_string()))?,
        },
        RunMode::DateSort => Sink::Sort(SortBuffer::new()),
        RunMode::Print => Sink::Print,
    };
    // sorted output is limited at print time, not while collecting
    let limitflows = if matches!(sink, Sink::Sort(_)) {
        0
    } else {
        cfg.limitflows
    };

    let mut scratch = Vec::new();
    let mut done = false;

    for path in files {
        if done {
            break;
        }
        let path_str = path.to_string_lossy();
        let mut reader = match ArchiveReader::open(&path_str) {
            Ok(r) => r,
            Err(e) => {
                logerr!("Can't read from file '{}': {}", path_str, e);
                continue;
            }
        };

        loop {
            let block = match reader.next_block() {
                Ok(Some(b)) => b,
                Ok(None) => break,
                Err(e) => {
                    if let ArchiveError::OversizedBlock { records, .. } = e {
                        totals.skipped_flows += records as u64;
                    }
                    logerr!("Can't read from file '{}': {}", path_str, e);
                    break;
                }
            };

            if block.header.id != DATA_BLOCK_TYPE_1 {
                totals.skipped_flows += block.header.num_records as u64;
                if block.header.id != STAT_BLOCK_TYPE {
                    logerr!("Can't process block type {}", block.header.id);
                }
                continue;
            }

            // corruption inside a block aborts this file, not the run
            let mut abort_file = false;
            for item in RecordCursor::new(block.payload) {
                let (_, raw) = match item {
                    Ok(v) => v,
                    Err(e) => {
                        logerr!("File '{}': {}", path_str, e);
                        totals.skipped_flows += 1;
                        abort_file = true;
                        break;
                    }
                };
                totals.total_flows += 1;
                let master = match MasterRecord::expand(raw) {
                    Ok(m) => m,
                    Err(e) => {
                        logerr!("File '{}': {}", path_str, e);
                        totals.skipped_flows += 1;
                        abort_file = true;
                        break;
                    }
                };

                // span of everything processed, matched or not
                if master.first < totals.t_first {
                    totals.t_first = master.first;
                }
                if master.last > totals.t_last {
                    totals.t_last = master.last;
                }

                let mut pass = match cfg.twin {
                    Some((start, end)) => master.first >= start && master.last <= end,
                    None => true,
                };
                pass = pass && (limitflows == 0 || stat.numflows < limitflows);
                pass = pass && cfg.filter.eval(&master);
                if !pass {
                    continue;
                }

                update_stat(&mut stat, &master);

                match &mut sink {
                    Sink::Writer { writer, zero_flows } => {
                        if !*zero_flows {
                            if let Some(pan) = &cfg.anon {
                                scratch.clear();
                                scratch.extend_from_slice(raw);
                                pan.scramble_record(&mut scratch);
                                writer
                                    .append_record(&scratch)
                                    .context("failed to write output buffer to disk")?;
                            } else {
                                writer
                                    .append_record(raw)
                                    .context("failed to write output buffer to disk")?;
                            }
                        }
                    }
                    Sink::Aggregate { spec, table } => {
                        table.upsert(spec.project(&master), &master, spec.masked_record(&master));
                    }
                    Sink::Element { element, table } => {
                        let (k1, k2) = element.keys(&master);
                        table.upsert(k1, &master, master);
                        if let Some(k2) = k2 {
                            table.upsert(k2, &master, master);
                        }
                    }
                    Sink::Sort(buffer) => buffer.insert(&master),
                    Sink::Print => {
                        if cfg.limits.check(&master) {
                            writeln!(out, "{}", cfg.output.render(&master, 1, cfg.anon.as_ref()))?;
                        }
                    }
                }
            }

            if abort_file {
                break;
            }
            if limitflows != 0 && stat.numflows >= limitflows {
                done = true;
                break;
            }
        }
        totals.total_bytes += reader.bytes_read;
    }

    let (table, sorted) = match sink {
        Sink::Writer { writer, .. } => {
            writer.close(&stat).context("failed to finalize output file")?;
            (None, None)
        }
        Sink::Aggregate { table, .. } | Sink::Element { table, .. } => (Some(table), None),
        Sink::Sort(buffer) => (None, Some(buffer)),
        Sink::Print => (None, None),
    };

    Ok(RunResult {
        stat,
        totals,
        table,
        sorted,
    })
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// Print all aggregated flows (the `-a` report): insertion order, or time
/// order with `date_sorted`, bounded by `limitflows`.
pub fn report_aggregated(
    table: FlowTable,
    date_sorted: bool,
    limitflows: u64,
    output: &OutputMode,
    anon: Option<&CryptoPAn>,
    out: &mut dyn Write,
) -> Result<()> {
    let mut entries = table.into_entries();
    if date_sorted {
        entries.sort_by_key(|e| (e.first, e.msec_first));
    }
    let limit = if limitflows == 0 {
        entries.len()
    } else {
        limitflows as usize
    };
    for e in entries.iter().take(limit) {
        writeln!(out, "{}", output.render(&e.render_record(), e.flows, anon))?;
    }
    Ok(())
}

/// Print the Top-N flow-record statistic (`-s record`).
pub fn report_flow_stat(
    table: FlowTable,
    topn: usize,
    order: OrderBy,
    output: &OutputMode,
    anon: Option<&CryptoPAn>,
    out: &mut dyn Write,
) -> Result<()> {
    writeln!(out, "Top {} flows ordered by {:?}:", topn, order)?;
    if let Some(header) = output.header() {
        writeln!(out, "{}", header)?;
    }
    for e in top_n(table.into_entries(), topn, order) {
        writeln!(out, "{}", output.render(&e.render_record(), e.flows, anon))?;
    }
    Ok(())
}

/// Print records collected for date-sorted output, oldest first.
pub fn report_sorted(
    buffer: SortBuffer,
    limitflows: u64,
    output: &OutputMode,
    anon: Option<&CryptoPAn>,
    out: &mut dyn Write,
) -> Result<()> {
    let records = buffer.into_sorted();
    let limit = if limitflows == 0 {
        records.len()
    } else {
        limitflows as usize
    };
    for r in records.iter().take(limit) {
        writeln!(out, "{}", output.render(r, 1, anon))?;
    }
    Ok(())
}

impl FlowEntry {
    /// The record rendered for this group: the stored representative with
    /// the accumulated counters and time window patched in.
    pub fn render_record(&self) -> MasterRecord {
        MasterRecord {
            d_pkts: self.packets,
            d_octets: self.bytes,
            first: self.first,
            msec_first: self.msec_first,
            last: self.last,
            msec_last: self.msec_last,
            tcp_flags: self.tcp_flags,
            ..self.record
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::write::ArchiveWriter;
    use crate::record::FlowAddrs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_archive(dir: &TempDir, name: &str, records: &[MasterRecord]) -> PathBuf {
        let path = dir.path().join(name);
        let mut w = ArchiveWriter::create(path.to_str().unwrap(), "test").unwrap();
        let mut stat = StatRecord::default();
        for r in records {
            w.append_record(&r.encode()).unwrap();
            update_stat(&mut stat, r);
        }
        w.close(&stat).unwrap();
        path
    }

    fn rec(first: u32, prot: u8) -> MasterRecord {
        MasterRecord {
            first,
            last: first + 5,
            prot,
            d_pkts: 1,
            d_octets: 100,
            addrs: FlowAddrs::V4 { src: 1, dst: 2 },
            ..MasterRecord::default()
        }
    }

    fn print_cfg() -> RunConfig {
        RunConfig {
            mode: RunMode::Print,
            filter: FilterEngine::compile("any").unwrap(),
            twin: None,
            limitflows: 0,
            anon: None,
            output: OutputMode::resolve(Some("pipe"), false).unwrap(),
            limits: OutputLimits::default(),
        }
    }

    #[test]
    fn time_window_requires_full_containment() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(
            &dir,
            "a.flows",
            &[rec(100, 6), rec(200, 6), rec(298, 6)], // last one ends at 303
        );
        let cfg = RunConfig {
            twin: Some((150, 300)),
            ..print_cfg()
        };
        let mut out = Vec::new();
        let res =
            process_files(FileSequence::from_paths(vec![path]), &cfg, &mut out).unwrap();
        assert_eq!(res.stat.numflows, 1); // only the 200..205 record fits
        assert_eq!(res.totals.total_flows, 3);
        // processed span covers even non-matching records
        assert_eq!(res.totals.t_first, 100);
        assert_eq!(res.totals.t_last, 303);
    }

    #[test]
    fn limitflows_stops_the_walk() {
        let dir = TempDir::new().unwrap();
        let a = write_archive(&dir, "a.flows", &(0..10).map(|i| rec(i, 6)).collect::<Vec<_>>());
        let b = write_archive(&dir, "b.flows", &(0..10).map(|i| rec(i, 6)).collect::<Vec<_>>());
        let cfg = RunConfig {
            limitflows: 4,
            ..print_cfg()
        };
        let mut out = Vec::new();
        let res =
            process_files(FileSequence::from_paths(vec![a, b]), &cfg, &mut out).unwrap();
        assert_eq!(res.stat.numflows, 4);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 4);
    }

    #[test]
    fn unreadable_file_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let good = write_archive(&dir, "good.flows", &[rec(1, 6)]);
        let missing = dir.path().join("missing.flows");
        let cfg = print_cfg();
        let mut out = Vec::new();
        let res = process_files(
            FileSequence::from_paths(vec![missing, good]),
            &cfg,
            &mut out,
        )
        .unwrap();
        assert_eq!(res.stat.numflows, 1);
    }

    #[test]
    fn rejected_records_leave_no_trace() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, "a.flows", &[rec(1, 6), rec(2, 17)]);
        let cfg = RunConfig {
            filter: FilterEngine::compile("proto udp").unwrap(),
            ..print_cfg()
        };
        let mut out = Vec::new();
        let res =
            process_files(FileSequence::from_paths(vec![path]), &cfg, &mut out).unwrap();
        assert_eq!(res.stat.numflows, 1);
        assert_eq!(res.stat.numflows_tcp, 0);
        assert_eq!(res.stat.numflows_udp, 1);
        assert_eq!(res.stat.numbytes, 100);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[test]
    fn zero_flows_writes_only_trailer() {
        let dir = TempDir::new().unwrap();
        let input = write_archive(&dir, "in.flows", &[rec(1, 6), rec(2, 6)]);
        let outfile = dir.path().join("out.flows");
        let cfg = RunConfig {
            mode: RunMode::Write {
                wfile: outfile.to_str().unwrap().to_owned(),
                ident: "zero".to_owned(),
                zero_flows: true,
            },
            ..print_cfg()
        };
        let mut sink = Vec::new();
        let res =
            process_files(FileSequence::from_paths(vec![input]), &cfg, &mut sink).unwrap();
        assert_eq!(res.stat.numflows, 2);
        let stat = crate::archive::read::read_stat_record(outfile.to_str().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(stat.numflows, 2);
        assert_eq!(stat.numblocks, 0);
    }
}
