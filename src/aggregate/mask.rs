//! Aggregation key projection.
//!
//! An aggregation spec is a comma-separated list of field tokens; the listed
//! fields contribute to the grouping key, everything else is forced to zero.
//! `srcip4/N` and friends mask the address to its top N bits first, so all
//! addresses of one subnet share a key.  When both `srcip` and `dstip` are
//! selected, the AS numbers ride along — AS attribution stays meaningful for
//! aggregated address pairs.

use anyhow::{bail, Result};

use crate::aggregate::table::FlowKey;
use crate::record::{FlowAddrs, MasterRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggrSpec {
    pub has_srcip: bool,
    pub has_dstip: bool,
    pub has_srcport: bool,
    pub has_dstport: bool,
    pub has_srcas: bool,
    pub has_dstas: bool,
    pub has_proto: bool,
    /// Prefix mask applied to the source address (u128 view, v4 in the low
    /// 32 bits).  All-ones unless a subnet token narrowed it.
    pub src_mask: u128,
    pub dst_mask: u128,
}

impl Default for AggrSpec {
    fn default() -> Self {
        AggrSpec {
            has_srcip: false,
            has_dstip: false,
            has_srcport: false,
            has_dstport: false,
            has_srcas: false,
            has_dstas: false,
            has_proto: false,
            src_mask: !0,
            dst_mask: !0,
        }
    }
}

/// Spec used by plain `-a` aggregation: the full five-tuple.
pub fn default_five_tuple() -> AggrSpec {
    AggrSpec {
        has_srcip: true,
        has_dstip: true,
        has_srcport: true,
        has_dstport: true,
        has_srcas: true,
        has_dstas: true,
        has_proto: true,
        ..AggrSpec::default()
    }
}

fn v4_prefix_mask(bits: u32) -> Result<u128> {
    if !(1..=32).contains(&bits) {
        bail!("subnet specifier '/{}' out of range for IPv4", bits);
    }
    Ok(((u32::MAX << (32 - bits)) as u128) & u32::MAX as u128)
}

fn v6_prefix_mask(bits: u32) -> Result<u128> {
    if !(1..=128).contains(&bits) {
        bail!("subnet specifier '/{}' out of range for IPv6", bits);
    }
    Ok(!0u128 << (128 - bits))
}

impl AggrSpec {
    /// Parse a spec such as `srcip4/24,dstport,proto`.
    pub fn parse(arg: &str) -> Result<AggrSpec> {
        let mut spec = AggrSpec::default();
        for token in arg.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }
            let (name, subnet) = match token.split_once('/') {
                Some((n, b)) => {
                    let bits: u32 = b
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid subnet specifier '/{}'", b))?;
                    (n.to_owned(), Some(bits))
                }
                None => (token.clone(), None),
            };
            match name.as_str() {
                "srcip" | "srcip4" | "srcip6" => {
                    spec.has_srcip = true;
                    if let Some(bits) = subnet {
                        spec.src_mask = match name.as_str() {
                            "srcip4" => v4_prefix_mask(bits)?,
                            "srcip6" => v6_prefix_mask(bits)?,
                            _ => bail!("subnet specifier not allowed here: '{}'", token),
                        };
                    }
                }
                "dstip" | "dstip4" | "dstip6" => {
                    spec.has_dstip = true;
                    if let Some(bits) = subnet {
                        spec.dst_mask = match name.as_str() {
                            "dstip4" => v4_prefix_mask(bits)?,
                            "dstip6" => v6_prefix_mask(bits)?,
                            _ => bail!("subnet specifier not allowed here: '{}'", token),
                        };
                    }
                }
                "srcport" | "dstport" | "srcas" | "dstas" | "proto" => {
                    if subnet.is_some() {
                        bail!("subnet specifier not allowed here: '{}'", token);
                    }
                    match name.as_str() {
                        "srcport" => spec.has_srcport = true,
                        "dstport" => spec.has_dstport = true,
                        "srcas" => spec.has_srcas = true,
                        "dstas" => spec.has_dstas = true,
                        _ => spec.has_proto = true,
                    }
                }
                _ => bail!("unknown aggregate field: '{}'", name),
            }
        }
        // aggregating both addresses keeps the AS info in the key
        if spec.has_srcip && spec.has_dstip {
            spec.has_srcas = true;
            spec.has_dstas = true;
        }
        Ok(spec)
    }

    /// Project a record onto the grouping key.  Unselected fields are zero;
    /// the family tag participates only when an address does.
    pub fn project(&self, r: &MasterRecord) -> FlowKey {
        let af = if self.has_srcip || self.has_dstip {
            if r.addrs.is_v6() {
                6
            } else {
                4
            }
        } else {
            0
        };
        FlowKey {
            af,
            proto: if self.has_proto { r.prot } else { 0 },
            src: if self.has_srcip {
                r.addrs.src_u128() & self.src_mask
            } else {
                0
            },
            dst: if self.has_dstip {
                r.addrs.dst_u128() & self.dst_mask
            } else {
                0
            },
            srcport: if self.has_srcport { r.srcport } else { 0 },
            dstport: if self.has_dstport { r.dstport } else { 0 },
            srcas: if self.has_srcas { r.srcas } else { 0 },
            dstas: if self.has_dstas { r.dstas } else { 0 },
        }
    }

    /// Representative record for rendering an aggregate: the projection
    /// applied to the record itself, so masked-out fields read as zero and
    /// subnet keys display as their network address.
    pub fn masked_record(&self, r: &MasterRecord) -> MasterRecord {
        let key = self.project(r);
        let addrs = match r.addrs {
            FlowAddrs::V4 { .. } => FlowAddrs::V4 {
                src: key.src as u32,
                dst: key.dst as u32,
            },
            FlowAddrs::V6 { .. } => FlowAddrs::V6 {
                src: key.src,
                dst: key.dst,
            },
        };
        MasterRecord {
            srcport: key.srcport,
            dstport: key.dstport,
            srcas: key.srcas,
            dstas: key.dstas,
            prot: if self.has_proto { r.prot } else { 0 },
            addrs,
            ..*r
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> u128 {
        u32::from(Ipv4Addr::new(a, b, c, d)) as u128
    }

    fn rec(src: u128, srcport: u16) -> MasterRecord {
        MasterRecord {
            srcport,
            dstport: 80,
            srcas: 100,
            dstas: 200,
            prot: 6,
            addrs: FlowAddrs::V4 {
                src: src as u32,
                dst: v4(192, 168, 0, 1) as u32,
            },
            ..MasterRecord::default()
        }
    }

    #[test]
    fn unmentioned_fields_are_masked_out() {
        let spec = AggrSpec::parse("srcport").unwrap();
        let key = spec.project(&rec(v4(10, 0, 0, 1), 1234));
        assert_eq!(key.srcport, 1234);
        assert_eq!(key.src, 0);
        assert_eq!(key.dst, 0);
        assert_eq!(key.dstport, 0);
        assert_eq!(key.srcas, 0);
        assert_eq!(key.proto, 0);
    }

    #[test]
    fn srcip4_subnet_masks_to_prefix() {
        let spec = AggrSpec::parse("srcip4/24").unwrap();
        let a = spec.project(&rec(v4(10, 0, 0, 1), 1));
        let b = spec.project(&rec(v4(10, 0, 0, 2), 2));
        let c = spec.project(&rec(v4(10, 0, 1, 1), 3));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.src, v4(10, 0, 0, 0));
    }

    #[test]
    fn srcip6_subnet_splits_across_halves() {
        let spec = AggrSpec::parse("srcip6/64").unwrap();
        assert_eq!(spec.src_mask, 0xFFFF_FFFF_FFFF_FFFF_0000_0000_0000_0000);
        let spec = AggrSpec::parse("srcip6/96").unwrap();
        assert_eq!(
            spec.src_mask,
            0xFFFF_FFFF_FFFF_FFFF_FFFF_FFFF_0000_0000
        );
    }

    #[test]
    fn srcip_dstip_pulls_in_as_numbers() {
        let spec = AggrSpec::parse("srcip,dstip").unwrap();
        assert!(spec.has_srcas && spec.has_dstas);
        let key = spec.project(&rec(v4(10, 0, 0, 1), 9));
        assert_eq!(key.srcas, 100);
        assert_eq!(key.dstas, 200);
        // srcip alone must not
        let solo = AggrSpec::parse("srcip").unwrap();
        assert!(!solo.has_srcas);
    }

    #[test]
    fn subnet_range_validation() {
        assert!(AggrSpec::parse("srcip4/0").is_err());
        assert!(AggrSpec::parse("srcip4/33").is_err());
        assert!(AggrSpec::parse("srcip6/129").is_err());
        assert!(AggrSpec::parse("srcport/8").is_err());
        assert!(AggrSpec::parse("srcip/8").is_err());
        assert!(AggrSpec::parse("wat").is_err());
    }

    #[test]
    fn masked_record_displays_network_address() {
        let spec = AggrSpec::parse("srcip4/24").unwrap();
        let m = spec.masked_record(&rec(v4(10, 0, 0, 77), 5555));
        assert_eq!(m.addrs.src_u128(), v4(10, 0, 0, 0));
        assert_eq!(m.srcport, 0);
    }
}
