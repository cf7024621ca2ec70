//! Record output: named format resolution, the pipe and raw renderers, and
//! the packet/byte print limits.
//!
//! Named formats: `raw`, `line`, `long`, `extended`, `pipe`; each accepts a
//! trailing `6` (e.g. `long6`) to widen IPv6 address columns.  `fmt:<tpl>`
//! compiles a user template.

pub mod format;

use anyhow::{anyhow, bail, Result};

use crate::anon::CryptoPAn;
use crate::record::{FlowAddrs, MasterRecord};
use crate::timewin::format_ts;

pub use format::{flags_str, proto_str, Formatter, FORMAT_EXTENDED, FORMAT_LINE, FORMAT_LONG};

/// Resolved output mode, ready to render records.
pub enum OutputMode {
    /// Labeled multi-line field dump.
    Raw,
    /// '|'-separated machine-readable columns.
    Pipe,
    /// A compiled format template (named or user-supplied).
    Fmt(Formatter),
}

impl OutputMode {
    /// Resolve a `-o` argument.  `None` means the default `line` format;
    /// `force_wide` turns on the v6-wide variant regardless of a `6` suffix.
    pub fn resolve(mode: Option<&str>, force_wide: bool) -> Result<OutputMode> {
        let mode = mode.unwrap_or("line");
        if let Some(template) = mode.strip_prefix("fmt:") {
            if template.trim().is_empty() {
                bail!("missing format description for user defined output format");
            }
            return Ok(OutputMode::Fmt(Formatter::compile(template, force_wide)?));
        }
        // a trailing '6' selects the v6-wide variant of a named format
        let (name, wide) = match mode.strip_suffix('6') {
            Some(base) if !base.is_empty() => (base, true),
            _ => (mode, force_wide),
        };
        match name.to_ascii_lowercase().as_str() {
            "raw" => Ok(OutputMode::Raw),
            "pipe" => Ok(OutputMode::Pipe),
            "line" => Ok(OutputMode::Fmt(Formatter::compile(FORMAT_LINE, wide)?)),
            "long" => Ok(OutputMode::Fmt(Formatter::compile(FORMAT_LONG, wide)?)),
            "extended" => Ok(OutputMode::Fmt(Formatter::compile(FORMAT_EXTENDED, wide)?)),
            other => Err(anyhow!("unknown output mode '{}'", other)),
        }
    }

    /// Header line, where the mode has one.
    pub fn header(&self) -> Option<String> {
        match self {
            OutputMode::Fmt(f) => Some(f.header()),
            _ => None,
        }
    }

    /// Render one record; `flows` is the aggregate count (1 for plain
    /// records).
    pub fn render(&self, r: &MasterRecord, flows: u64, anon: Option<&CryptoPAn>) -> String {
        match self {
            OutputMode::Raw => render_raw(r, flows, anon),
            OutputMode::Pipe => render_pipe(r, flows, anon),
            OutputMode::Fmt(f) => f.render(r, flows, anon),
        }
    }
}

fn anon_addrs(r: &MasterRecord, anon: Option<&CryptoPAn>) -> FlowAddrs {
    match anon {
        Some(pan) => pan.anonymize(r.addrs),
        None => r.addrs,
    }
}

/// Fixed pipe column order: af, first, msec_first, last, msec_last, prot,
/// src hi|lo, srcport, dst hi|lo, dstport, srcas, dstas, input, output,
/// tcp_flags, tos, packets, bytes.  Addresses print as two decimal 64-bit
/// words so the column count is family-independent.
fn render_pipe(r: &MasterRecord, _flows: u64, anon: Option<&CryptoPAn>) -> String {
    let addrs = anon_addrs(r, anon);
    let af = if addrs.is_v6() { 6 } else { 4 };
    let src = addrs.src_u128();
    let dst = addrs.dst_u128();
    format!(
        "{af}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        r.first,
        r.msec_first,
        r.last,
        r.msec_last,
        r.prot,
        (src >> 64) as u64,
        src as u64,
        r.srcport,
        (dst >> 64) as u64,
        dst as u64,
        r.dstport,
        r.srcas,
        r.dstas,
        r.input,
        r.output,
        r.tcp_flags,
        r.tos,
        r.d_pkts,
        r.d_octets
    )
}

fn render_raw(r: &MasterRecord, flows: u64, anon: Option<&CryptoPAn>) -> String {
    let addrs = anon_addrs(r, anon);
    format!(
        "\n\
         Flow Record:\n\
         \x20 Flags       = 0x{:04x}\n\
         \x20 size        = {}\n\
         \x20 srcaddr     = {}\n\
         \x20 dstaddr     = {}\n\
         \x20 first       = {} [{}]\n\
         \x20 last        = {} [{}]\n\
         \x20 msec_first  = {}\n\
         \x20 msec_last   = {}\n\
         \x20 prot        = {}\n\
         \x20 tcp_flags   = 0x{:02x}\n\
         \x20 tos         = {}\n\
         \x20 srcport     = {}\n\
         \x20 dstport     = {}\n\
         \x20 srcas       = {}\n\
         \x20 dstas       = {}\n\
         \x20 input       = {}\n\
         \x20 output      = {}\n\
         \x20 dPkts       = {}\n\
         \x20 dOctets     = {}\n\
         \x20 flows       = {}",
        r.flags,
        r.size,
        addrs.src_ip(),
        addrs.dst_ip(),
        r.first,
        format_ts(r.first, r.msec_first),
        r.last,
        format_ts(r.last, r.msec_last),
        r.msec_first,
        r.msec_last,
        r.prot,
        r.tcp_flags,
        r.tos,
        r.srcport,
        r.dstport,
        r.srcas,
        r.dstas,
        r.input,
        r.output,
        r.d_pkts,
        r.d_octets,
        flows
    )
}

// ── Print limits ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    AtLeast(u64),
    AtMost(u64),
}

/// Packet/byte display limits (`-l` / `-L`): records outside the bounds are
/// suppressed on the print path only.  `+N` means at least N, `-N` at most
/// N, a bare number means at least.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputLimits {
    packets: Option<Bound>,
    bytes: Option<Bound>,
}

fn parse_bound(s: &str) -> Result<Bound> {
    let (ctor, digits): (fn(u64) -> Bound, &str) = match s.as_bytes().first() {
        Some(b'+') => (Bound::AtLeast, &s[1..]),
        Some(b'-') => (Bound::AtMost, &s[1..]),
        _ => (Bound::AtLeast, s),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid limit '{}'", s))?;
    Ok(ctor(n))
}

impl OutputLimits {
    pub fn parse(packet_limit: Option<&str>, byte_limit: Option<&str>) -> Result<OutputLimits> {
        Ok(OutputLimits {
            packets: packet_limit.map(parse_bound).transpose()?,
            bytes: byte_limit.map(parse_bound).transpose()?,
        })
    }

    pub fn check(&self, r: &MasterRecord) -> bool {
        let hit = |bound: &Option<Bound>, value: u64| match bound {
            None => true,
            Some(Bound::AtLeast(n)) => value >= *n,
            Some(Bound::AtMost(n)) => value <= *n,
        };
        hit(&self.packets, r.d_pkts) && hit(&self.bytes, r.d_octets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn rec() -> MasterRecord {
        MasterRecord {
            srcport: 53,
            dstport: 1024,
            prot: 17,
            first: 1089541800,
            last: 1089541801,
            d_pkts: 3,
            d_octets: 404,
            addrs: FlowAddrs::V4 {
                src: u32::from(Ipv4Addr::new(10, 9, 8, 7)),
                dst: u32::from(Ipv4Addr::new(10, 1, 1, 1)),
            },
            ..MasterRecord::default()
        }
    }

    #[test]
    fn resolve_named_formats() {
        assert!(matches!(OutputMode::resolve(None, false).unwrap(), OutputMode::Fmt(_)));
        assert!(matches!(
            OutputMode::resolve(Some("raw"), false).unwrap(),
            OutputMode::Raw
        ));
        assert!(matches!(
            OutputMode::resolve(Some("pipe"), false).unwrap(),
            OutputMode::Pipe
        ));
        assert!(matches!(
            OutputMode::resolve(Some("long6"), false).unwrap(),
            OutputMode::Fmt(_)
        ));
        assert!(OutputMode::resolve(Some("sideways"), false).is_err());
    }

    #[test]
    fn resolve_user_format() {
        let m = OutputMode::resolve(Some("fmt:%ts %byt"), false).unwrap();
        let line = m.render(&rec(), 1, None);
        assert!(line.contains("2004-07-11"));
        assert!(OutputMode::resolve(Some("fmt:"), false).is_err());
        assert!(OutputMode::resolve(Some("fmt:%nope"), false).is_err());
    }

    #[test]
    fn pipe_column_count_is_family_independent() {
        let v4_line = render_pipe(&rec(), 1, None);
        let v6 = MasterRecord {
            addrs: FlowAddrs::V6 { src: 1, dst: 2 },
            ..rec()
        };
        let v6_line = render_pipe(&v6, 1, None);
        assert_eq!(v4_line.split('|').count(), v6_line.split('|').count());
        assert!(v4_line.starts_with("4|"));
        assert!(v6_line.starts_with("6|"));
    }

    #[test]
    fn pipe_fields_are_numeric() {
        let line = render_pipe(&rec(), 1, None);
        for field in line.split('|') {
            assert!(field.parse::<u64>().is_ok(), "non-numeric field {}", field);
        }
    }

    #[test]
    fn raw_dump_names_fields() {
        let s = render_raw(&rec(), 7, None);
        assert!(s.contains("Flow Record:"));
        assert!(s.contains("srcaddr     = 10.9.8.7"));
        assert!(s.contains("flows       = 7"));
    }

    #[test]
    fn limits_gate_print_path() {
        let limits = OutputLimits::parse(Some("+2"), None).unwrap();
        assert!(limits.check(&rec())); // 3 packets >= 2
        let limits = OutputLimits::parse(Some("+10"), None).unwrap();
        assert!(!limits.check(&rec()));
        let limits = OutputLimits::parse(None, Some("-500")).unwrap();
        assert!(limits.check(&rec())); // 404 bytes <= 500
        let limits = OutputLimits::parse(None, Some("-100")).unwrap();
        assert!(!limits.check(&rec()));
        assert!(OutputLimits::parse(Some("wat"), None).is_err());
    }

    #[test]
    fn default_limits_pass_everything() {
        assert!(OutputLimits::default().check(&rec()));
    }
}
