// Unsigned LEB128 varints, as used for CAR frame lengths and CID fields.

use std::io::{ErrorKind, Read};

use crate::error::{TrackerError, TrackerResult};

/// Longest encoding of a u64.
const MAX_LEN: usize = 10;

/// Decode a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> TrackerResult<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_LEN) {
        let bits = u64::from(byte & 0x7f);
        if i == MAX_LEN - 1 && bits > 1 {
            return Err(TrackerError::decode("varint overflows u64"));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(TrackerError::decode("varint is not minimally encoded"));
            }
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= MAX_LEN {
        Err(TrackerError::decode("varint longer than 10 bytes"))
    } else {
        Err(TrackerError::decode("truncated varint"))
    }
}

/// Read one varint from a stream. Returns `Ok(None)` on a clean end of
/// stream before the first byte.
pub fn read<R: Read>(reader: &mut R) -> TrackerResult<Option<u64>> {
    let mut buf = [0u8; MAX_LEN];
    for i in 0..MAX_LEN {
        match reader.read_exact(&mut buf[i..=i]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(TrackerError::decode("stream ended inside a varint"));
            }
            Err(e) => return Err(e.into()),
        }
        if buf[i] & 0x80 == 0 {
            return decode(&buf[..=i]).map(|(v, _)| Some(v));
        }
    }
    Err(TrackerError::decode("varint longer than 10 bytes"))
}

pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
