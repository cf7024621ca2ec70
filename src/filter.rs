//! Flow filter expressions: compiler and per-record evaluator.
//!
//! A filter compiles once into an expression tree; evaluation is a pure
//! function of the expanded record, invoked exactly once per record by the
//! processing loop.  Grammar:
//!
//! ```text
//! expr      := and_expr ('or' and_expr)*
//! and_expr  := unary ('and' unary)*
//! unary     := 'not' unary | '(' expr ')' | primitive
//! primitive := 'any'
//!            | ['src'|'dst'] ('ip'|'host') ADDR
//!            | ['src'|'dst'] 'net' ADDR/BITS
//!            | ['src'|'dst'] 'port' [CMP] NUM
//!            | ['src'|'dst'] 'as' NUM
//!            | 'proto' ('tcp'|'udp'|'icmp'|NUM)
//!            | 'packets' CMP NUM
//!            | 'bytes' CMP NUM
//! CMP       := '=' | '==' | '<' | '>'
//! ```
//!
//! Unqualified `ip`/`net`/`port`/`as` match either direction.

use std::net::IpAddr;

use anyhow::{anyhow, bail, Result};

use crate::record::{FlowAddrs, MasterRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Lt,
    Gt,
}

impl Cmp {
    #[inline]
    fn matches(self, lhs: u64, rhs: u64) -> bool {
        match self {
            Cmp::Eq => lhs == rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Gt => lhs > rhs,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Any,
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Proto(u8),
    Port { dir: Dir, cmp: Cmp, value: u16 },
    As { dir: Dir, value: u16 },
    Net { dir: Dir, v6: bool, addr: u128, mask: u128 },
    Packets { cmp: Cmp, value: u64 },
    Bytes { cmp: Cmp, value: u64 },
}

/// A compiled filter.  Construction can fail; evaluation cannot.
pub struct FilterEngine {
    root: Node,
    expr: String,
}

impl FilterEngine {
    /// Compile a filter expression.  The empty expression and `any` both
    /// pass every record.
    pub fn compile(expr: &str) -> Result<FilterEngine> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Ok(FilterEngine {
                root: Node::Any,
                expr: "any".to_owned(),
            });
        }
        let tokens = tokenize(trimmed);
        let mut p = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let root = p.parse_or()?;
        if p.pos != p.tokens.len() {
            bail!("filter: trailing input at '{}'", p.tokens[p.pos]);
        }
        Ok(FilterEngine {
            root,
            expr: trimmed.to_owned(),
        })
    }

    /// The source expression this engine was compiled from.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Evaluate against one expanded record.
    pub fn eval(&self, record: &MasterRecord) -> bool {
        eval_node(&self.root, record)
    }

    /// Render the compiled tree (debug dump).
    pub fn dump(&self) -> String {
        format!("{:#?}", self.root)
    }
}

fn eval_node(node: &Node, r: &MasterRecord) -> bool {
    match node {
        Node::Any => true,
        Node::Not(inner) => !eval_node(inner, r),
        Node::And(a, b) => eval_node(a, r) && eval_node(b, r),
        Node::Or(a, b) => eval_node(a, r) || eval_node(b, r),
        Node::Proto(p) => r.prot == *p,
        Node::Port { dir, cmp, value } => match dir {
            Dir::Src => cmp.matches(r.srcport as u64, *value as u64),
            Dir::Dst => cmp.matches(r.dstport as u64, *value as u64),
            Dir::Either => {
                cmp.matches(r.srcport as u64, *value as u64)
                    || cmp.matches(r.dstport as u64, *value as u64)
            }
        },
        Node::As { dir, value } => match dir {
            Dir::Src => r.srcas == *value,
            Dir::Dst => r.dstas == *value,
            Dir::Either => r.srcas == *value || r.dstas == *value,
        },
        Node::Net {
            dir,
            v6,
            addr,
            mask,
        } => {
            if r.addrs.is_v6() != *v6 {
                return false;
            }
            let hit = |a: u128| a & mask == addr & mask;
            match dir {
                Dir::Src => hit(r.addrs.src_u128()),
                Dir::Dst => hit(r.addrs.dst_u128()),
                Dir::Either => hit(r.addrs.src_u128()) || hit(r.addrs.dst_u128()),
            }
        }
        Node::Packets { cmp, value } => cmp.matches(r.d_pkts, *value),
        Node::Bytes { cmp, value } => cmp.matches(r.d_octets, *value),
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

fn tokenize(expr: &str) -> Vec<String> {
    expr.replace('(', " ( ")
        .replace(')', " ) ")
        .split_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn next(&mut self) -> Result<&'a str> {
        let t = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| anyhow!("filter: unexpected end of expression"))?;
        self.pos += 1;
        Ok(t.as_str())
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut node = self.parse_and()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut node = self.parse_unary()?;
        while self.peek() == Some("and") {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        match self.peek() {
            Some("not") => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            Some("(") => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next()? {
                    ")" => Ok(inner),
                    t => bail!("filter: expected ')', found '{}'", t),
                }
            }
            _ => self.parse_primitive(),
        }
    }

    fn parse_primitive(&mut self) -> Result<Node> {
        let tok = self.next()?;
        let (dir, tok) = match tok {
            "src" => (Dir::Src, self.next()?),
            "dst" => (Dir::Dst, self.next()?),
            other => (Dir::Either, other),
        };
        match tok {
            "any" => {
                if dir != Dir::Either {
                    bail!("filter: 'any' takes no direction qualifier");
                }
                Ok(Node::Any)
            }
            "ip" | "host" => {
                let addr = self.next()?;
                let (v6, addr, mask) = parse_addr_exact(addr)?;
                Ok(Node::Net {
                    dir,
                    v6,
                    addr,
                    mask,
                })
            }
            "net" => {
                let spec = self.next()?;
                let (v6, addr, mask) = parse_addr_cidr(spec)?;
                Ok(Node::Net {
                    dir,
                    v6,
                    addr,
                    mask,
                })
            }
            "port" => {
                let (cmp, value) = self.parse_cmp_number()?;
                if value > u16::MAX as u64 {
                    bail!("filter: port {} out of range", value);
                }
                Ok(Node::Port {
                    dir,
                    cmp,
                    value: value as u16,
                })
            }
            "as" => {
                let value: u64 = parse_number(self.next()?)?;
                if value > u16::MAX as u64 {
                    bail!("filter: AS number {} out of range", value);
                }
                Ok(Node::As {
                    dir,
                    value: value as u16,
                })
            }
            "proto" => {
                if dir != Dir::Either {
                    bail!("filter: 'proto' takes no direction qualifier");
                }
                let p = self.next()?;
                let num = match p {
                    "icmp" => 1,
                    "tcp" => 6,
                    "udp" => 17,
                    other => {
                        let n: u64 = parse_number(other)?;
                        if n > u8::MAX as u64 {
                            bail!("filter: protocol {} out of range", n);
                        }
                        n as u8
                    }
                };
                Ok(Node::Proto(num))
            }
            "packets" => {
                let (cmp, value) = self.parse_cmp_number()?;
                Ok(Node::Packets { cmp, value })
            }
            "bytes" => {
                let (cmp, value) = self.parse_cmp_number()?;
                Ok(Node::Bytes { cmp, value })
            }
            other => bail!("filter: unknown keyword '{}'", other),
        }
    }

    /// Optional comparator followed by a number; a bare number means equal.
    fn parse_cmp_number(&mut self) -> Result<(Cmp, u64)> {
        let tok = self.next()?;
        let (cmp, num_tok) = match tok {
            "=" | "==" => (Cmp::Eq, self.next()?),
            "<" => (Cmp::Lt, self.next()?),
            ">" => (Cmp::Gt, self.next()?),
            other => (Cmp::Eq, other),
        };
        Ok((cmp, parse_number(num_tok)?))
    }
}

fn parse_number(tok: &str) -> Result<u64> {
    tok.parse::<u64>()
        .map_err(|_| anyhow!("filter: expected a number, found '{}'", tok))
}

fn prefix_mask(v6: bool, bits: u32) -> Result<u128> {
    let width: u32 = if v6 { 128 } else { 32 };
    if bits > width {
        bail!("filter: /{} out of range for this address family", bits);
    }
    if bits == 0 {
        return Ok(0);
    }
    let full = if v6 { !0u128 } else { u32::MAX as u128 };
    Ok(full & (full << (width - bits)))
}

fn parse_ip(tok: &str) -> Result<(bool, u128)> {
    let ip: IpAddr = tok
        .parse()
        .map_err(|_| anyhow!("filter: invalid IP address '{}'", tok))?;
    Ok(match ip {
        IpAddr::V4(a) => (false, u32::from(a) as u128),
        IpAddr::V6(a) => (true, u128::from(a)),
    })
}

fn parse_addr_exact(tok: &str) -> Result<(bool, u128, u128)> {
    let (v6, addr) = parse_ip(tok)?;
    let mask = if v6 { !0u128 } else { u32::MAX as u128 };
    Ok((v6, addr, mask))
}

fn parse_addr_cidr(tok: &str) -> Result<(bool, u128, u128)> {
    let (addr_s, bits_s) = tok
        .split_once('/')
        .ok_or_else(|| anyhow!("filter: 'net' expects address/bits, found '{}'", tok))?;
    let (v6, addr) = parse_ip(addr_s)?;
    let bits: u32 = bits_s
        .parse()
        .map_err(|_| anyhow!("filter: invalid prefix length '{}'", bits_s))?;
    Ok((v6, addr, prefix_mask(v6, bits)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn rec(prot: u8, srcport: u16, dstport: u16) -> MasterRecord {
        MasterRecord {
            prot,
            srcport,
            dstport,
            addrs: FlowAddrs::V4 {
                src: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
                dst: u32::from(Ipv4Addr::new(192, 168, 7, 9)),
            },
            ..MasterRecord::default()
        }
    }

    #[test]
    fn empty_and_any_pass_everything() {
        assert!(FilterEngine::compile("").unwrap().eval(&rec(6, 1, 2)));
        assert!(FilterEngine::compile("any").unwrap().eval(&rec(17, 1, 2)));
    }

    #[test]
    fn proto_names_and_numbers() {
        let f = FilterEngine::compile("proto udp").unwrap();
        assert!(f.eval(&rec(17, 1, 2)));
        assert!(!f.eval(&rec(6, 1, 2)));
        let g = FilterEngine::compile("proto 6").unwrap();
        assert!(g.eval(&rec(6, 1, 2)));
    }

    #[test]
    fn src_port_and_proto_conjunction() {
        let f = FilterEngine::compile("proto udp and src port 53").unwrap();
        assert!(f.eval(&rec(17, 53, 1024)));
        assert!(!f.eval(&rec(17, 1024, 53)));
        assert!(!f.eval(&rec(6, 53, 1024)));
    }

    #[test]
    fn either_direction_port() {
        let f = FilterEngine::compile("port 80").unwrap();
        assert!(f.eval(&rec(6, 80, 1024)));
        assert!(f.eval(&rec(6, 1024, 80)));
        assert!(!f.eval(&rec(6, 1024, 8080)));
    }

    #[test]
    fn port_comparators() {
        let f = FilterEngine::compile("src port > 1023").unwrap();
        assert!(f.eval(&rec(6, 4096, 80)));
        assert!(!f.eval(&rec(6, 80, 4096)));
    }

    #[test]
    fn ip_matching_is_family_aware() {
        let f = FilterEngine::compile("src ip 10.0.0.1").unwrap();
        assert!(f.eval(&rec(6, 1, 2)));
        let v6rec = MasterRecord {
            addrs: FlowAddrs::V6 { src: 1, dst: 2 },
            ..MasterRecord::default()
        };
        assert!(!f.eval(&v6rec));
    }

    #[test]
    fn net_prefix_matching() {
        let f = FilterEngine::compile("net 192.168.0.0/16").unwrap();
        assert!(f.eval(&rec(6, 1, 2))); // dst 192.168.7.9
        let g = FilterEngine::compile("src net 192.168.0.0/16").unwrap();
        assert!(!g.eval(&rec(6, 1, 2))); // src is 10.0.0.1
    }

    #[test]
    fn not_and_parens() {
        let f = FilterEngine::compile("not (proto tcp or proto udp)").unwrap();
        assert!(f.eval(&rec(1, 0, 0)));
        assert!(!f.eval(&rec(6, 0, 0)));
        assert!(!f.eval(&rec(17, 0, 0)));
    }

    #[test]
    fn bytes_and_packets() {
        let r = MasterRecord {
            d_pkts: 10,
            d_octets: 5000,
            ..MasterRecord::default()
        };
        assert!(FilterEngine::compile("bytes > 4096").unwrap().eval(&r));
        assert!(FilterEngine::compile("packets < 11").unwrap().eval(&r));
        assert!(!FilterEngine::compile("packets > 10").unwrap().eval(&r));
    }

    #[test]
    fn compile_errors() {
        assert!(FilterEngine::compile("bogus").is_err());
        assert!(FilterEngine::compile("proto").is_err());
        assert!(FilterEngine::compile("src port 53 extra").is_err());
        assert!(FilterEngine::compile("(proto tcp").is_err());
        assert!(FilterEngine::compile("port 70000").is_err());
    }

    #[test]
    fn dump_names_the_nodes() {
        let f = FilterEngine::compile("proto tcp and dst port 443").unwrap();
        let dump = f.dump();
        assert!(dump.contains("Proto"));
        assert!(dump.contains("Port"));
    }
}
