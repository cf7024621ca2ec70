//! The record-format template language.
//!
//! A format string is compiled once into literal spans and token handlers;
//! rendering a record is a single pass over the spans.  The token set is
//! closed — unknown tokens fail compilation, not rendering.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{bail, Result};

use crate::aggregate::topn::{bpp, bps, pps};
use crate::anon::CryptoPAn;
use crate::record::{FlowAddrs, MasterRecord};
use crate::stats::format_number;
use crate::timewin::format_ts;

/// Predefined `line` template.
pub const FORMAT_LINE: &str = "%ts %td %pr %sap -> %dap %pkt %byt %fl";
/// Predefined `long` template.
pub const FORMAT_LONG: &str = "%ts %td %pr %sap -> %dap %flg %tos %pkt %byt %fl";
/// Predefined `extended` template.
pub const FORMAT_EXTENDED: &str =
    "%ts %td %pr %sap -> %dap %flg %tos %pkt %byt %pps %bps %bpp %fl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Ts,
    Te,
    Td,
    Pr,
    Sa,
    Da,
    Sap,
    Dap,
    Sp,
    Dp,
    Sas,
    Das,
    In,
    Out,
    Pkt,
    Byt,
    Fl,
    Flg,
    Tos,
    Bps,
    Pps,
    Bpp,
}

// longest names first so %sap never parses as %sa + "p"
const TOKENS: &[(&str, Token)] = &[
    ("sap", Token::Sap),
    ("dap", Token::Dap),
    ("sas", Token::Sas),
    ("das", Token::Das),
    ("out", Token::Out),
    ("pkt", Token::Pkt),
    ("byt", Token::Byt),
    ("flg", Token::Flg),
    ("tos", Token::Tos),
    ("bps", Token::Bps),
    ("pps", Token::Pps),
    ("bpp", Token::Bpp),
    ("ts", Token::Ts),
    ("te", Token::Te),
    ("td", Token::Td),
    ("pr", Token::Pr),
    ("sa", Token::Sa),
    ("da", Token::Da),
    ("sp", Token::Sp),
    ("dp", Token::Dp),
    ("in", Token::In),
    ("fl", Token::Fl),
];

#[derive(Debug, Clone)]
enum Span {
    Literal(String),
    Field(Token),
}

impl Token {
    fn width(self, wide: bool) -> usize {
        match self {
            Token::Ts | Token::Te => 23,
            Token::Td => 9,
            Token::Pr => 5,
            Token::Sa | Token::Da => {
                if wide {
                    39
                } else {
                    16
                }
            }
            Token::Sap | Token::Dap => {
                if wide {
                    45
                } else {
                    21
                }
            }
            Token::Sp | Token::Dp => 5,
            Token::Sas | Token::Das => 6,
            Token::In | Token::Out => 5,
            Token::Pkt | Token::Byt => 8,
            Token::Fl => 5,
            Token::Flg => 6,
            Token::Tos => 3,
            Token::Bps | Token::Pps | Token::Bpp => 8,
        }
    }

    fn header(self) -> &'static str {
        match self {
            Token::Ts => "Date flow start",
            Token::Te => "Date flow end",
            Token::Td => "Duration",
            Token::Pr => "Proto",
            Token::Sa => "Src IP Addr",
            Token::Da => "Dst IP Addr",
            Token::Sap => "Src IP Addr:Port",
            Token::Dap => "Dst IP Addr:Port",
            Token::Sp => "Src Pt",
            Token::Dp => "Dst Pt",
            Token::Sas => "Src AS",
            Token::Das => "Dst AS",
            Token::In => "Input",
            Token::Out => "Output",
            Token::Pkt => "Packets",
            Token::Byt => "Bytes",
            Token::Fl => "Flows",
            Token::Flg => "Flags",
            Token::Tos => "Tos",
            Token::Bps => "bps",
            Token::Pps => "pps",
            Token::Bpp => "Bpp",
        }
    }

    fn left_aligned(self) -> bool {
        matches!(
            self,
            Token::Ts | Token::Te | Token::Sa | Token::Da | Token::Sap | Token::Dap
        )
    }
}

/// Protocol number to display name.
pub fn proto_str(prot: u8) -> String {
    match prot {
        1 => "ICMP".to_owned(),
        2 => "IGMP".to_owned(),
        6 => "TCP".to_owned(),
        17 => "UDP".to_owned(),
        41 => "IPv6".to_owned(),
        46 => "RSVP".to_owned(),
        47 => "GRE".to_owned(),
        50 => "ESP".to_owned(),
        51 => "AH".to_owned(),
        89 => "OSPF".to_owned(),
        other => other.to_string(),
    }
}

/// TCP flags as the fixed-order `UAPRSF` string, '.' for unset bits.
pub fn flags_str(flags: u8) -> String {
    let names = [b'U', b'A', b'P', b'R', b'S', b'F'];
    let bits = [0x20u8, 0x10, 0x08, 0x04, 0x02, 0x01];
    let mut out = [b'.'; 6];
    for i in 0..6 {
        if flags & bits[i] != 0 {
            out[i] = names[i];
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn v6_full(addr: u128) -> String {
    let seg = Ipv6Addr::from(addr).segments();
    format!(
        "{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}:{:04x}",
        seg[0], seg[1], seg[2], seg[3], seg[4], seg[5], seg[6], seg[7]
    )
}

fn addr_str(addrs: &FlowAddrs, src: bool, wide: bool) -> String {
    match *addrs {
        FlowAddrs::V4 { src: s, dst: d } => {
            Ipv4Addr::from(if src { s } else { d }).to_string()
        }
        FlowAddrs::V6 { src: s, dst: d } => {
            let a = if src { s } else { d };
            if wide {
                v6_full(a)
            } else {
                Ipv6Addr::from(a).to_string()
            }
        }
    }
}

fn addr_port_str(addrs: &FlowAddrs, port: u16, src: bool, wide: bool) -> String {
    // ':' joins v4 address and port; '.' keeps v6 output unambiguous
    let sep = if addrs.is_v6() { '.' } else { ':' };
    format!("{}{}{}", addr_str(addrs, src, wide), sep, port)
}

fn pad(s: &str, width: usize, left: bool) -> String {
    if left {
        format!("{:<width$}", s, width = width)
    } else {
        format!("{:>width$}", s, width = width)
    }
}

/// A compiled format: applied per record, header derived once.
pub struct Formatter {
    spans: Vec<Span>,
    wide: bool,
}

impl Formatter {
    /// Compile a template such as `"%ts %pr %sap -> %dap %byt"`.
    pub fn compile(fmt: &str, wide: bool) -> Result<Formatter> {
        let mut spans = Vec::new();
        let mut literal = String::new();
        let mut i = 0;
        while i < fmt.len() {
            match fmt[i..].chars().next() {
                Some('%') => {}
                Some(c) => {
                    literal.push(c);
                    i += c.len_utf8();
                    continue;
                }
                None => break,
            }
            let rest = &fmt[i + 1..];
            let hit = TOKENS.iter().find(|(name, _)| rest.starts_with(name));
            match hit {
                Some((name, token)) => {
                    if !literal.is_empty() {
                        spans.push(Span::Literal(std::mem::take(&mut literal)));
                    }
                    spans.push(Span::Field(*token));
                    i += 1 + name.len();
                }
                None => {
                    let end = rest
                        .char_indices()
                        .find(|(_, c)| c.is_whitespace())
                        .map(|(n, _)| n)
                        .unwrap_or(rest.len());
                    bail!("unknown format token '%{}'", &rest[..end]);
                }
            }
        }
        if !literal.is_empty() {
            spans.push(Span::Literal(literal));
        }
        Ok(Formatter { spans, wide })
    }

    /// The column-header line matching this format.
    pub fn header(&self) -> String {
        let mut out = String::new();
        for span in &self.spans {
            match span {
                Span::Literal(s) => out.push_str(s),
                Span::Field(t) => {
                    out.push_str(&pad(t.header(), t.width(self.wide), t.left_aligned()))
                }
            }
        }
        out
    }

    /// Render one record.  `flows` is the aggregate flow count (1 for plain
    /// records); `anon` pseudonymizes addresses at render time.
    pub fn render(&self, r: &MasterRecord, flows: u64, anon: Option<&CryptoPAn>) -> String {
        let addrs = match anon {
            Some(pan) => pan.anonymize(r.addrs),
            None => r.addrs,
        };
        let dur_ms = r.duration_ms();
        let mut out = String::new();
        for span in &self.spans {
            match span {
                Span::Literal(s) => out.push_str(s),
                Span::Field(t) => {
                    let value = match t {
                        Token::Ts => format_ts(r.first, r.msec_first),
                        Token::Te => format_ts(r.last, r.msec_last),
                        Token::Td => format!("{:.3}", dur_ms as f64 / 1000.0),
                        Token::Pr => proto_str(r.prot),
                        Token::Sa => addr_str(&addrs, true, self.wide),
                        Token::Da => addr_str(&addrs, false, self.wide),
                        Token::Sap => addr_port_str(&addrs, r.srcport, true, self.wide),
                        Token::Dap => addr_port_str(&addrs, r.dstport, false, self.wide),
                        Token::Sp => r.srcport.to_string(),
                        Token::Dp => r.dstport.to_string(),
                        Token::Sas => r.srcas.to_string(),
                        Token::Das => r.dstas.to_string(),
                        Token::In => r.input.to_string(),
                        Token::Out => r.output.to_string(),
                        Token::Pkt => format_number(r.d_pkts, false),
                        Token::Byt => format_number(r.d_octets, false),
                        Token::Fl => flows.to_string(),
                        Token::Flg => flags_str(r.tcp_flags),
                        Token::Tos => r.tos.to_string(),
                        Token::Bps => format_number(bps(r.d_octets, dur_ms), false),
                        Token::Pps => format_number(pps(r.d_pkts, dur_ms), false),
                        Token::Bpp => format_number(bpp(r.d_octets, r.d_pkts), false),
                    };
                    out.push_str(&pad(&value, t.width(self.wide), t.left_aligned()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> MasterRecord {
        MasterRecord {
            srcport: 1024,
            dstport: 80,
            prot: 6,
            tcp_flags: 0x13, // ACK|SYN|FIN
            first: 1089541800,
            last: 1089541810,
            d_pkts: 100,
            d_octets: 150_000,
            addrs: FlowAddrs::V4 {
                src: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
                dst: u32::from(Ipv4Addr::new(172, 16, 1, 2)),
            },
            ..MasterRecord::default()
        }
    }

    #[test]
    fn line_format_renders_all_fields() {
        let f = Formatter::compile(FORMAT_LINE, false).unwrap();
        let line = f.render(&rec(), 1, None);
        assert!(line.contains("2004-07-11"));
        assert!(line.contains("TCP"));
        assert!(line.contains("10.0.0.1:1024"));
        assert!(line.contains("172.16.1.2:80"));
        assert!(line.contains("->"));
        assert!(line.contains("150.0 K"));
    }

    #[test]
    fn unknown_token_fails_compile() {
        assert!(Formatter::compile("%ts %zz", false).is_err());
    }

    #[test]
    fn sap_wins_over_sa() {
        let f = Formatter::compile("%sap", false).unwrap();
        let line = f.render(&rec(), 1, None);
        assert!(line.contains("10.0.0.1:1024"));
    }

    #[test]
    fn header_matches_span_layout() {
        let f = Formatter::compile("%ts %pr %byt", false).unwrap();
        let h = f.header();
        assert!(h.contains("Date flow start"));
        assert!(h.contains("Proto"));
        assert!(h.contains("Bytes"));
    }

    #[test]
    fn v6_uses_dot_separator_and_wide_mode_expands() {
        let r = MasterRecord {
            addrs: FlowAddrs::V6 {
                src: u128::from(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
                dst: u128::from(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)),
            },
            srcport: 443,
            ..rec()
        };
        let narrow = Formatter::compile("%sap", false).unwrap().render(&r, 1, None);
        assert!(narrow.contains("2001:db8::1.443"));
        let wide = Formatter::compile("%sap", true).unwrap().render(&r, 1, None);
        assert!(wide.contains("2001:0db8:0000:0000:0000:0000:0000:0001.443"));
    }

    #[test]
    fn flags_string() {
        assert_eq!(flags_str(0x00), "......");
        assert_eq!(flags_str(0x13), ".A..SF");
        assert_eq!(flags_str(0x3F), "UAPRSF");
    }

    #[test]
    fn proto_names() {
        assert_eq!(proto_str(6), "TCP");
        assert_eq!(proto_str(17), "UDP");
        assert_eq!(proto_str(123), "123");
    }

    #[test]
    fn flows_column_shows_aggregate_count() {
        let f = Formatter::compile("%fl", false).unwrap();
        assert_eq!(f.render(&rec(), 42, None).trim(), "42");
    }

    #[test]
    fn render_time_anonymization_changes_addresses_only() {
        let key = b"abcdefghijklmnopqrstuvwxyz012345";
        let pan = CryptoPAn::new(key);
        let f = Formatter::compile("%sa %sp", false).unwrap();
        let plain = f.render(&rec(), 1, None);
        let anon = f.render(&rec(), 1, Some(&pan));
        assert_ne!(plain, anon);
        assert!(plain.ends_with("1024"));
        assert!(anon.ends_with("1024"));
    }
}
