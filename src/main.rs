//! Binary entry point for the `flowdump` command-line tool.
//!
//! Handles post-parse validation, filter compilation, run-mode selection and
//! operation dispatch (write, aggregate, statistics, date-sort, print),
//! followed by the reports and the summary footer.
//!
//! # Control flow
//!
//! 1. `Cli::try_parse` processes all flags.
//! 2. [`run`] validates cross-option rules, compiles the filter, resolves
//!    the output format and drives the processing loop.
//! 3. Reports and the footer are printed from the returned tables.

use std::io::Write;

use clap::Parser;

use flowdump::aggregate::mask::{default_five_tuple, AggrSpec};
use flowdump::aggregate::topn::{top_n, OrderBy};
use flowdump::anon::{parse_key, CryptoPAn};
use flowdump::archive::read::read_file_info;
use flowdump::archive::types::StatRecord;
use flowdump::archive::write::change_ident;
use flowdump::cli::{validate, Cli};
use flowdump::display::{set_display_level, EXIT_ALLOC, EXIT_FILTER, EXIT_USAGE};
use flowdump::filter::FilterEngine;
use flowdump::flist::FileSequence;
use flowdump::logerr;
use flowdump::output::{OutputLimits, OutputMode};
use flowdump::process::{
    process_files, report_aggregated, report_flow_stat, report_sorted, InitError, RunConfig,
    RunMode, RunResult,
};
use flowdump::stats::{
    element_stat_lines, file_stat_lines, summary_line, sum_stat_records, StatElement, StatSpec,
};
use flowdump::timewin::{scan_time_frame, time_string};

/// Execute the operation selected by argument parsing.
///
/// Returns the process exit code (0 = success, 250 = init failure,
/// 254 = filter compile failure, 255 = usage error).
fn run(mut cli: Cli) -> i32 {
    if let Err(e) = validate(&mut cli) {
        logerr!("{}", e);
        return EXIT_USAGE;
    }
    if cli.quiet {
        set_display_level(1);
    }

    // ── Ident rewrite: -i together with only -r patches the file in place ──
    if cli.ident.is_some() && cli.rfile.is_some() && cli.wfile.is_none() {
        let ident = cli.ident.as_deref().unwrap_or_default();
        let rfile = cli.rfile.as_deref().unwrap_or_default();
        return match change_ident(rfile, ident) {
            Ok(()) => 0,
            Err(e) => {
                logerr!("Can't change ident of '{}': {}", rfile, e);
                1
            }
        };
    }

    // ── Input file sequence ────────────────────────────────────────────────
    if cli.rfile.is_none() && cli.rspec.is_none() && cli.mdirs.is_none() {
        logerr!("Expect data file(s): specify -r or -R");
        return EXIT_USAGE;
    }
    let files = match FileSequence::setup(
        cli.mdirs.as_deref(),
        cli.rfile.as_deref(),
        cli.rspec.as_deref(),
    ) {
        Ok(f) => f,
        Err(e) => {
            logerr!("{}", e);
            return EXIT_USAGE;
        }
    };

    // ── -I: merge and print the summary trailers, nothing else ─────────────
    if cli.print_stat {
        return print_file_stats(files);
    }

    // ── Filter: inline expression, -f file, or pass-all ────────────────────
    let filter_text = match (&cli.filter, &cli.ffile) {
        (Some(expr), _) => expr.clone(),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                logerr!("Can't read filter file '{}': {}", path, e);
                return EXIT_USAGE;
            }
        },
        (None, None) => "any".to_owned(),
    };
    let filter = match FilterEngine::compile(&filter_text) {
        Ok(f) => f,
        Err(e) => {
            logerr!("{}", e);
            return EXIT_FILTER;
        }
    };
    if cli.dump_filter {
        println!("{}", filter.dump());
        return 0;
    }
    if cli.syntax_only {
        return 0;
    }

    // ── Remaining option material ──────────────────────────────────────────
    let twin = match &cli.tstring {
        Some(t) => match scan_time_frame(t) {
            Ok(w) => Some(w),
            Err(e) => {
                logerr!("{}", e);
                return EXIT_USAGE;
            }
        },
        None => None,
    };
    let output = match OutputMode::resolve(cli.print_mode.as_deref(), cli.v6_long) {
        Ok(o) => o,
        Err(e) => {
            logerr!("{}", e);
            return EXIT_USAGE;
        }
    };
    let limits = match OutputLimits::parse(cli.packet_limit.as_deref(), cli.byte_limit.as_deref())
    {
        Ok(l) => l,
        Err(e) => {
            logerr!("{}", e);
            return EXIT_USAGE;
        }
    };
    let anon = match &cli.anon_key {
        Some(k) => match parse_key(k) {
            Ok(key) => Some(CryptoPAn::new(&key)),
            Err(e) => {
                logerr!("Invalid key for CryptoPAn: {}", e);
                return EXIT_USAGE;
            }
        },
        None => None,
    };
    let stat_spec = match cli.stat_type.as_deref().map(StatSpec::parse).transpose() {
        Ok(s) => s,
        Err(e) => {
            logerr!("{}", e);
            return EXIT_USAGE;
        }
    };
    let aggr_spec: Option<AggrSpec> = match &cli.aggr_mask {
        Some(expr) => match AggrSpec::parse(expr) {
            Ok(s) => Some(s),
            Err(e) => {
                logerr!("{}", e);
                logerr!("Option -A requires a ',' separated list out of 'srcip dstip srcport dstport srcas dstas proto srcip4/net dstip4/net srcip6/net dstip6/net'");
                return EXIT_USAGE;
            }
        },
        None => None,
    };
    // -O overrides the /order given inside -s
    let order = match &cli.order_by {
        Some(o) => match OrderBy::parse(o) {
            Some(o) => o,
            None => {
                logerr!("Order '{}' unknown!", o);
                return EXIT_USAGE;
            }
        },
        None => stat_spec.map(|s| s.order).unwrap_or_default(),
    };

    // ── Run-mode selection: write beats stats beats aggregation ────────────
    let mode = if let Some(wfile) = &cli.wfile {
        RunMode::Write {
            wfile: wfile.clone(),
            ident: cli.ident.clone().unwrap_or_else(|| "none".to_owned()),
            zero_flows: cli.zero_flows,
        }
    } else if let Some(spec) = &stat_spec {
        match spec.element {
            StatElement::Record => RunMode::Aggregate {
                spec: aggr_spec.unwrap_or_else(default_five_tuple),
            },
            element => RunMode::ElementStat { element },
        }
    } else if cli.aggregate || aggr_spec.is_some() {
        RunMode::Aggregate {
            spec: aggr_spec.unwrap_or_else(default_five_tuple),
        }
    } else if cli.date_sorted {
        RunMode::DateSort
    } else {
        RunMode::Print
    };

    // header only for direct record listings
    if stat_spec.is_none() && cli.wfile.is_none() && !cli.quiet {
        if let Some(header) = output.header() {
            println!("{}", header);
        }
    }

    let cfg = RunConfig {
        mode,
        filter,
        twin,
        limitflows: cli.limitflows.unwrap_or(0),
        anon,
        output,
        limits,
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let result = match process_files(files, &cfg, &mut out) {
        Ok(r) => r,
        Err(e) => {
            if e.downcast_ref::<InitError>().is_some() {
                logerr!("{}", e);
                return EXIT_ALLOC;
            }
            logerr!("{:#}", e);
            return 1;
        }
    };

    // ── Reports ────────────────────────────────────────────────────────────
    let RunResult {
        stat: run_stat,
        totals,
        table,
        sorted,
    } = result;
    if let Err(e) = run_reports(&cli, table, sorted, stat_spec, order, &cfg) {
        logerr!("{:#}", e);
        return 1;
    }

    // ── Summary footer ─────────────────────────────────────────────────────
    if cli.wfile.is_none() && !cli.quiet {
        if cfg.anon.is_some() {
            println!("IP addresses anonymized");
        }
        println!("{}", summary_line(&run_stat, cli.plain_numbers));
        println!(
            "Time window: {}",
            time_string(totals.t_first, totals.t_last)
        );
        println!(
            "Total flows processed: {}, skipped: {}, Bytes read: {}",
            totals.total_flows, totals.skipped_flows, totals.total_bytes
        );
    }
    0
}

/// Print the report matching the run mode, consuming the run's tables.
fn run_reports(
    cli: &Cli,
    table: Option<flowdump::aggregate::FlowTable>,
    sorted: Option<flowdump::aggregate::SortBuffer>,
    stat_spec: Option<StatSpec>,
    order: OrderBy,
    cfg: &RunConfig,
) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    if let Some(table) = table {
        match stat_spec {
            Some(StatSpec {
                element: StatElement::Record,
                ..
            }) => {
                let topn = effective_topn(cli.topn, table.len());
                report_flow_stat(table, topn, order, &cfg.output, cfg.anon.as_ref(), &mut out)?;
            }
            Some(StatSpec { element, .. }) => {
                let topn = effective_topn(cli.topn, table.len());
                let entries = top_n(table.into_entries(), topn, order);
                for line in element_stat_lines(element, order, &entries, cli.plain_numbers) {
                    writeln!(out, "{}", line)?;
                }
            }
            None => report_aggregated(
                table,
                cli.date_sorted,
                cli.limitflows.unwrap_or(0),
                &cfg.output,
                cfg.anon.as_ref(),
                &mut out,
            )?,
        }
    } else if let Some(buffer) = sorted {
        report_sorted(
            buffer,
            cli.limitflows.unwrap_or(0),
            &cfg.output,
            cfg.anon.as_ref(),
            &mut out,
        )?;
    }
    Ok(())
}

/// Top N bound: 0 means everything.
fn effective_topn(topn: u32, available: usize) -> usize {
    if topn == 0 {
        available
    } else {
        topn as usize
    }
}

/// The `-I` walk: sum the trailers of all input files and print them.
fn print_file_stats(files: FileSequence) -> i32 {
    let mut sum = StatRecord::default();
    let mut ident = String::from("none");
    let mut seen_any = false;
    for path in files {
        let path_str = path.to_string_lossy();
        match read_file_info(&path_str) {
            Ok((header, Some(stat))) => {
                if !seen_any {
                    ident = header.ident;
                    seen_any = true;
                }
                sum_stat_records(&mut sum, &stat);
            }
            Ok((_, None)) => {
                logerr!("File '{}' carries no summary trailer", path_str);
            }
            Err(e) => {
                logerr!("Error open file '{}': {}", path_str, e);
            }
        }
    }
    if !seen_any {
        return EXIT_ALLOC;
    }
    for line in file_stat_lines(&ident, &sum) {
        println!("{}", line);
    }
    0
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    let cli = match Cli::try_parse() {
        Ok(c) => c,
        Err(e) => {
            // --help / --version print to stdout and exit cleanly
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(cli));
}
