//! Argument definitions and post-parse validation.
//!
//! Parsing is declarative; the cross-option rules the parser cannot express
//! (mutual exclusions, ranges, mode conflicts) live in [`validate`] and map
//! to the usage-error exit code in the binary.

use anyhow::{bail, Result};
use clap::Parser;

use crate::displaylevel;

#[derive(Parser, Debug, Default)]
#[command(
    name = "flowdump",
    version,
    about = "Read, filter, aggregate and rewrite binary flow archives",
    arg_required_else_help = false
)]
pub struct Cli {
    /// Read input from a file; '-' reads stdin
    #[arg(short = 'r', value_name = "file")]
    pub rfile: Option<String>,

    /// Read a sequence of files: /any/dir, /dir/prefix or /dir/first:last
    #[arg(short = 'R', value_name = "expr")]
    pub rspec: Option<String>,

    /// Read the same files from multiple directories: /base/dir1:dir2:dir3
    #[arg(short = 'M', value_name = "dirs")]
    pub mdirs: Option<String>,

    /// Write passing records to a file; '-' streams to stdout
    #[arg(short = 'w', value_name = "file")]
    pub wfile: Option<String>,

    /// Read the filter expression from a file
    #[arg(short = 'f', value_name = "file")]
    pub ffile: Option<String>,

    /// Time window: yyyy/MM/dd.hh:mm:ss[-yyyy/MM/dd.hh:mm:ss]
    #[arg(short = 't', value_name = "time")]
    pub tstring: Option<String>,

    /// Aggregate flows over the full five-tuple
    #[arg(short = 'a')]
    pub aggregate: bool,

    /// Aggregation fields: ',' separated list of srcip dstip srcport
    /// dstport srcas dstas proto, or subnets like srcip4/24, srcip6/64
    #[arg(short = 'A', value_name = "expr")]
    pub aggr_mask: Option<String>,

    /// Generate statistics for <element>[/<order>], e.g. srcip/bytes or
    /// record/packets
    #[arg(short = 's', value_name = "expr")]
    pub stat_type: Option<String>,

    /// Order statistics by: flows packets bytes bps pps bpp
    #[arg(short = 'O', value_name = "order")]
    pub order_by: Option<String>,

    /// Number of Top N entries for statistics
    #[arg(short = 'n', value_name = "num", default_value_t = 10)]
    pub topn: u32,

    /// Limit the number of records processed
    #[arg(short = 'c', value_name = "num")]
    pub limitflows: Option<u64>,

    /// Output mode: raw line long extended pipe (append '6' for full IPv6,
    /// e.g. long6) or fmt:<template>
    #[arg(short = 'o', value_name = "mode")]
    pub print_mode: Option<String>,

    /// Pseudonymize IP addresses with this key: a 32 character string or a
    /// 64 digit hex string starting with 0x
    #[arg(short = 'K', value_name = "key")]
    pub anon_key: Option<String>,

    /// Packet limit for printed records: +num at least, -num at most
    #[arg(short = 'l', value_name = "expr", allow_hyphen_values = true)]
    pub packet_limit: Option<String>,

    /// Byte limit for printed records: +num at least, -num at most
    #[arg(short = 'L', value_name = "expr", allow_hyphen_values = true)]
    pub byte_limit: Option<String>,

    /// Identifier for the written archive; with only -r, rewrite the ident
    /// of an existing archive in place
    #[arg(short = 'i', value_name = "ident")]
    pub ident: Option<String>,

    /// Print the summary trailers of the input files and exit
    #[arg(short = 'I')]
    pub print_stat: bool,

    /// Print records date sorted across all input files
    #[arg(short = 'm')]
    pub date_sorted: bool,

    /// Plain numbers in the summary line (no K/M/G scaling)
    #[arg(short = 'N')]
    pub plain_numbers: bool,

    /// Suppress the header and the summary footer
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Write a dump file containing only the statistics record
    #[arg(short = 'z')]
    pub zero_flows: bool,

    /// Check the filter syntax and exit
    #[arg(short = 'Z')]
    pub syntax_only: bool,

    /// Dump the compiled filter and exit
    #[arg(short = 'X')]
    pub dump_filter: bool,

    /// Print IPv6 addresses in full length
    #[arg(short = '6')]
    pub v6_long: bool,

    /// Filter expression (defaults to 'any')
    pub filter: Option<String>,
}

/// Cross-option validation.  Errors exit with the usage code; some benign
/// conflicts only warn, mirroring the tolerant CLI tradition of the tool.
pub fn validate(cli: &mut Cli) -> Result<()> {
    if cli.rfile.is_some() && cli.rspec.is_some() {
        bail!("-r and -R are mutually exclusive. Please specify either -r or -R");
    }
    if cli.mdirs.is_some() && cli.rfile.is_none() && cli.rspec.is_none() {
        bail!("-M needs either -r or -R to specify the file or file list. Add '-R .' for all files in the directories.");
    }
    if let Some(0) = cli.limitflows {
        bail!("option -c needs a number > 0");
    }
    if let Some(ident) = &cli.ident {
        if ident.contains(' ') {
            bail!("ident must not contain spaces");
        }
    }

    let is_element_stat = cli
        .stat_type
        .as_deref()
        .map(|s| !s.to_ascii_lowercase().starts_with("record"))
        .unwrap_or(false);
    if is_element_stat && cli.aggr_mask.is_some() {
        displaylevel!(2, "Warning: aggregation ignored for element statistics\n");
        cli.aggr_mask = None;
    }
    if cli.aggregate && cli.stat_type.is_some() {
        displaylevel!(2, "Command line switch -s overwrites -a\n");
        cli.aggregate = false;
    }

    let record_stat = cli
        .stat_type
        .as_deref()
        .map(|s| s.to_ascii_lowercase().starts_with("record"))
        .unwrap_or(false);
    if (cli.aggregate || cli.aggr_mask.is_some() || record_stat)
        && !(1..=1000).contains(&cli.topn)
    {
        bail!("TopN for record statistics: 0 < topN <= 1000 only allowed for IP statistics");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("flowdump").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn positional_filter() {
        let cli = parse(&["-r", "in.flows", "proto tcp and src port 80"]);
        assert_eq!(cli.rfile.as_deref(), Some("in.flows"));
        assert_eq!(cli.filter.as_deref(), Some("proto tcp and src port 80"));
    }

    #[test]
    fn r_and_big_r_conflict() {
        let mut cli = parse(&["-r", "a", "-R", "b"]);
        assert!(validate(&mut cli).is_err());
    }

    #[test]
    fn mdirs_requires_a_file_spec() {
        let mut cli = parse(&["-M", "/x/a:b"]);
        assert!(validate(&mut cli).is_err());
        let mut cli = parse(&["-M", "/x/a:b", "-r", "cap"]);
        assert!(validate(&mut cli).is_ok());
    }

    #[test]
    fn limit_zero_rejected() {
        let mut cli = parse(&["-r", "a", "-c", "0"]);
        assert!(validate(&mut cli).is_err());
    }

    #[test]
    fn stat_overrides_aggregate() {
        let mut cli = parse(&["-r", "a", "-a", "-s", "record"]);
        validate(&mut cli).unwrap();
        assert!(!cli.aggregate);
    }

    #[test]
    fn element_stat_drops_aggr_mask() {
        let mut cli = parse(&["-r", "a", "-s", "srcip", "-A", "srcport"]);
        validate(&mut cli).unwrap();
        assert!(cli.aggr_mask.is_none());
    }

    #[test]
    fn topn_range_enforced_for_record_stats() {
        let mut cli = parse(&["-r", "a", "-s", "record", "-n", "5000"]);
        assert!(validate(&mut cli).is_err());
        let mut cli = parse(&["-r", "a", "-s", "srcip", "-n", "5000"]);
        assert!(validate(&mut cli).is_ok());
    }

    #[test]
    fn ident_with_spaces_rejected() {
        let mut cli = parse(&["-r", "a", "-i", "two words"]);
        assert!(validate(&mut cli).is_err());
    }

    #[test]
    fn negative_byte_limit_parses() {
        let cli = parse(&["-r", "a", "-L", "-500"]);
        assert_eq!(cli.byte_limit.as_deref(), Some("-500"));
    }
}
