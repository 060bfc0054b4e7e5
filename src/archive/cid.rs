// Content identifiers (CIDv1, sha2-256) for repository blocks.
//
// Repository archives only carry CIDv1 with a DAG-CBOR or raw codec and a
// sha2-256 multihash, so that is all we accept.

use std::fmt;

use sha2::{Digest, Sha256};

use super::varint;
use crate::error::{TrackerError, TrackerResult};

pub const CODEC_DAG_CBOR: u64 = 0x71;
pub const CODEC_RAW: u64 = 0x55;
const MULTIHASH_SHA2_256: u64 = 0x12;
const DIGEST_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    codec: u64,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    /// CID of a block's bytes under the given codec.
    pub fn for_block(codec: u64, data: &[u8]) -> Self {
        Self {
            codec,
            digest: Sha256::digest(data).into(),
        }
    }

    /// Parse a CID from the front of `buf`, returning it and the bytes used.
    pub fn read_prefix(buf: &[u8]) -> TrackerResult<(Self, usize)> {
        if buf.len() >= 2 && buf[0] == 0x12 && buf[1] == 0x20 {
            return Err(TrackerError::decode("CIDv0 is not used in repositories"));
        }

        let mut pos = 0;
        let mut next = |what: &str| -> TrackerResult<u64> {
            let (v, n) = varint::decode(&buf[pos..])
                .map_err(|e| TrackerError::decode(format!("CID {what}: {e}")))?;
            pos += n;
            Ok(v)
        };

        let version = next("version")?;
        let codec = next("codec")?;
        let hash_fn = next("multihash code")?;
        let hash_len = next("multihash length")?;

        if version != 1 {
            return Err(TrackerError::decode(format!("unsupported CID version {version}")));
        }
        if codec != CODEC_DAG_CBOR && codec != CODEC_RAW {
            return Err(TrackerError::decode(format!("unsupported CID codec 0x{codec:x}")));
        }
        if hash_fn != MULTIHASH_SHA2_256 || hash_len != DIGEST_LEN as u64 {
            return Err(TrackerError::decode(format!(
                "unsupported multihash 0x{hash_fn:x}/{hash_len}"
            )));
        }

        let end = pos + DIGEST_LEN;
        let digest: [u8; DIGEST_LEN] = buf
            .get(pos..end)
            .and_then(|d| d.try_into().ok())
            .ok_or_else(|| TrackerError::decode("CID digest truncated"))?;

        Ok((Self { codec, digest }, end))
    }

    /// Parse a CID that must span all of `buf`.
    pub fn from_bytes(buf: &[u8]) -> TrackerResult<Self> {
        let (cid, used) = Self::read_prefix(buf)?;
        if used != buf.len() {
            return Err(TrackerError::decode("trailing bytes after CID"));
        }
        Ok(cid)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + DIGEST_LEN);
        varint::encode(1, &mut out);
        varint::encode(self.codec, &mut out);
        varint::encode(MULTIHASH_SHA2_256, &mut out);
        varint::encode(DIGEST_LEN as u64, &mut out);
        out.extend_from_slice(&self.digest);
        out
    }

    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// Check that `data` hashes to this CID.
    pub fn verify(&self, data: &[u8]) -> TrackerResult<()> {
        let actual: [u8; DIGEST_LEN] = Sha256::digest(data).into();
        if actual != self.digest {
            return Err(TrackerError::decode(format!(
                "block content does not match {self} (hash {})",
                hex::encode(actual)
            )));
        }
        Ok(())
    }
}

// Multibase base32, lowercase, unpadded: the usual "bafy..." form.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &b in bytes {
        buffer = (buffer << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", base32_lower(&self.to_bytes()))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_bytes() {
        let cid = Cid::for_block(CODEC_DAG_CBOR, b"hello");
        let bytes = cid.to_bytes();
        assert_eq!(&bytes[..4], &[0x01, 0x71, 0x12, 0x20]);
        assert_eq!(Cid::from_bytes(&bytes).unwrap(), cid);
    }

    #[test]
    fn test_display_is_bafyrei_prefixed() {
        // DAG-CBOR + sha2-256 CIDs always start with "bafyrei"
        let cid = Cid::for_block(CODEC_DAG_CBOR, b"{}");
        assert!(cid.to_string().starts_with("bafyrei"));
        assert_eq!(cid.to_string().len(), 59);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let cid = Cid::for_block(CODEC_DAG_CBOR, b"original");
        assert!(cid.verify(b"original").is_ok());
        assert!(cid.verify(b"tampered").is_err());
    }

    #[test]
    fn test_rejects_unsupported_forms() {
        let mut v0 = vec![0x12, 0x20];
        v0.extend_from_slice(&[0u8; 32]);
        assert!(Cid::from_bytes(&v0).is_err());

        let mut other_codec = vec![0x01, 0x70, 0x12, 0x20];
        other_codec.extend_from_slice(&[0u8; 32]);
        assert!(Cid::from_bytes(&other_codec).is_err());

        assert!(Cid::from_bytes(&[0x01, 0x71, 0x12, 0x20, 0xaa]).is_err());
    }
}
