// CAR v1 block stream reader.
//
// Layout: varint(header_len) header, then repeated varint(len) CID data
// frames until end of file. The header is DAG-CBOR `{version: 1, roots}`.
// Each block is hash-checked against its CID as it is read.

use std::io::Read;

use super::cbor::{self, Value};
use super::cid::Cid;
use super::varint;
use crate::error::{TrackerError, TrackerResult};

/// Upper bound for one frame. Repository blocks are small; anything this
/// large is a corrupt length prefix.
const MAX_FRAME_LEN: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct CarHeader {
    pub version: u64,
    pub roots: Vec<Cid>,
}

#[derive(Debug, Clone)]
pub struct RawBlock {
    pub cid: Cid,
    pub data: Vec<u8>,
}

/// A block that could not be read. `cid` is known when the frame was intact
/// but its contents were bad; `fatal` means the stream cannot continue.
#[derive(Debug)]
pub struct BlockFailure {
    pub cid: Option<Cid>,
    pub error: TrackerError,
    pub fatal: bool,
}

pub struct CarReader<R> {
    reader: R,
    header: CarHeader,
    done: bool,
}

impl<R: Read> CarReader<R> {
    /// Read and validate the header. A bad header fails the whole archive.
    pub fn new(mut reader: R) -> TrackerResult<Self> {
        let len = varint::read(&mut reader)?
            .ok_or_else(|| TrackerError::decode("archive is empty"))?;
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(TrackerError::decode(format!("bad CAR header length {len}")));
        }

        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|e| TrackerError::decode(format!("CAR header truncated: {e}")))?;

        let header = parse_header(&cbor::decode(&buf)?)?;
        Ok(Self {
            reader,
            header,
            done: false,
        })
    }

    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    fn read_frame(&mut self) -> Result<Option<RawBlock>, BlockFailure> {
        let fatal = |error: TrackerError| BlockFailure {
            cid: None,
            error,
            fatal: true,
        };

        let len = match varint::read(&mut self.reader).map_err(fatal)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(fatal(TrackerError::decode(format!("bad block length {len}"))));
        }

        let mut frame = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut frame)
            .map_err(|e| fatal(TrackerError::decode(format!("block truncated: {e}"))))?;

        // From here on the frame boundary is known, so failures are local
        let (cid, used) = Cid::read_prefix(&frame).map_err(|error| BlockFailure {
            cid: None,
            error,
            fatal: false,
        })?;
        let data = frame.split_off(used);
        cid.verify(&data).map_err(|error| BlockFailure {
            cid: Some(cid),
            error,
            fatal: false,
        })?;

        Ok(Some(RawBlock { cid, data }))
    }
}

impl<R: Read> Iterator for CarReader<R> {
    type Item = Result<RawBlock, BlockFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(failure) => {
                if failure.fatal {
                    self.done = true;
                }
                Some(Err(failure))
            }
        }
    }
}

fn parse_header(value: &Value) -> TrackerResult<CarHeader> {
    let version = value
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| TrackerError::decode("CAR header has no version"))?;
    if version != 1 {
        return Err(TrackerError::decode(format!("unsupported CAR version {version}")));
    }

    let roots = value
        .get("roots")
        .and_then(Value::as_array)
        .ok_or_else(|| TrackerError::decode("CAR header has no roots"))?
        .iter()
        .map(|r| {
            r.as_link()
                .copied()
                .ok_or_else(|| TrackerError::decode("CAR root is not a link"))
        })
        .collect::<TrackerResult<Vec<_>>>()?;

    Ok(CarHeader {
        version: version as u64,
        roots,
    })
}
