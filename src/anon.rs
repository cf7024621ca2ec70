//! Prefix-preserving IP address pseudonymization (Crypto-PAn).
//!
//! The 32-byte key splits into an AES-128 key and a 16-byte pad seed; the
//! seed is encrypted once to form the pad.  Each address bit is flipped by
//! the MSB of an AES encryption of (address prefix ‖ pad tail), so two
//! addresses sharing a k-bit prefix map to pseudonyms sharing a k-bit
//! prefix, deterministically per key.  The v6 variant runs the same cascade
//! over 128 bits.  One implementation serves both the write path (in-place
//! rewrite of the record's address slots) and the render path.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use anyhow::{anyhow, Result};

use crate::archive::codec::{read_le128, read_le16, read_le32, write_le128, write_le32};
use crate::record::{FlowAddrs, FLAG_IPV6_ADDR, IP_OFFSET};

pub struct CryptoPAn {
    cipher: Aes128,
    pad: [u8; 16],
}

/// Parse an anonymization key: either a 32-character string used verbatim,
/// or `0x` followed by 64 hex digits.  Any other length is rejected.
pub fn parse_key(s: &str) -> Result<[u8; 32]> {
    let bytes = s.as_bytes();
    if bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        return Ok(key);
    }
    if bytes.len() == 66 && (s.starts_with("0x") || s.starts_with("0X")) {
        let mut key = [0u8; 32];
        for (i, chunk) in s[2..].as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)?;
            key[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| anyhow!("invalid hex digit in key: '{}'", hex))?;
        }
        return Ok(key);
    }
    Err(anyhow!(
        "key must be a 32 character string or a 64 digit hex string starting with 0x"
    ))
}

impl CryptoPAn {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(&key[..16]));
        let mut pad = GenericArray::clone_from_slice(&key[16..32]);
        cipher.encrypt_block(&mut pad);
        CryptoPAn {
            cipher,
            pad: pad.into(),
        }
    }

    #[inline]
    fn prf_msb(&self, input: [u8; 16]) -> u8 {
        let mut block = GenericArray::from(input);
        self.cipher.encrypt_block(&mut block);
        block[0] >> 7
    }

    /// Pseudonymize one IPv4 address.
    pub fn anonymize_v4(&self, addr: u32) -> u32 {
        let pad4 = u32::from_be_bytes([self.pad[0], self.pad[1], self.pad[2], self.pad[3]]);
        let mut flips = 0u32;
        for pos in 0..32u32 {
            // top `pos` address bits, the rest taken from the pad
            let head = if pos == 0 {
                pad4
            } else {
                (addr >> (32 - pos) << (32 - pos)) | (pad4 << pos >> pos)
            };
            let mut input = self.pad;
            input[..4].copy_from_slice(&head.to_be_bytes());
            flips |= (self.prf_msb(input) as u32) << (31 - pos);
        }
        flips ^ addr
    }

    /// Pseudonymize one IPv6 address: the identical cascade over 128 bits.
    pub fn anonymize_v6(&self, addr: u128) -> u128 {
        let pad128 = u128::from_be_bytes(self.pad);
        let mut flips = 0u128;
        for pos in 0..128u32 {
            let input = if pos == 0 {
                pad128
            } else {
                (addr >> (128 - pos) << (128 - pos)) | (pad128 << pos >> pos)
            };
            flips |= (self.prf_msb(input.to_be_bytes()) as u128) << (127 - pos);
        }
        flips ^ addr
    }

    /// Pseudonymize both addresses of a pair, preserving the family.
    pub fn anonymize(&self, addrs: FlowAddrs) -> FlowAddrs {
        match addrs {
            FlowAddrs::V4 { src, dst } => FlowAddrs::V4 {
                src: self.anonymize_v4(src),
                dst: self.anonymize_v4(dst),
            },
            FlowAddrs::V6 { src, dst } => FlowAddrs::V6 {
                src: self.anonymize_v6(src),
                dst: self.anonymize_v6(dst),
            },
        }
    }

    /// Rewrite the two address slots of a packed record in place.
    pub fn scramble_record(&self, record: &mut [u8]) {
        let flags = read_le16(record, 2);
        if flags & FLAG_IPV6_ADDR == 0 {
            let src = read_le32(record, IP_OFFSET);
            let dst = read_le32(record, IP_OFFSET + 4);
            write_le32(record, IP_OFFSET, self.anonymize_v4(src));
            write_le32(record, IP_OFFSET + 4, self.anonymize_v4(dst));
        } else {
            let src = read_le128(record, IP_OFFSET);
            let dst = read_le128(record, IP_OFFSET + 16);
            write_le128(record, IP_OFFSET, self.anonymize_v6(src));
            write_le128(record, IP_OFFSET + 16, self.anonymize_v6(dst));
        }
    }
}
