//! Binary wire protocol: request/response framing and status codes.
//!
//! All wire integers are network byte order. A request is a fixed 64-byte
//! header followed by a command-specific body: an offset array for interval
//! commands, a single u32 bin size for bin commands. A response is a fixed
//! 16-byte header followed by the counts payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::methylome::{AggregateResult, CountsRes, CountsResCov};
use crate::{Error, Result};

pub const PROTOCOL_VERSION: u16 = 1;
pub const REQUEST_HEADER_BYTES: usize = 64;
pub const RESPONSE_HEADER_BYTES: usize = 16;
pub const MAX_ACCESSION_LEN: usize = 48;
pub const MAX_INTERVALS: u32 = 1 << 20;

/// Response header flag: payload rows carry a third coverage column.
pub const FLAG_INCLUDE_COVERAGE: u16 = 1;

/// What the client asked the server to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Intervals,
    Bins,
    IntervalsCov,
    BinsCov,
}

impl Command {
    pub fn code(self) -> u16 {
        match self {
            Command::Intervals => 1,
            Command::Bins => 2,
            Command::IntervalsCov => 3,
            Command::BinsCov => 4,
        }
    }

    pub fn from_code(code: u16) -> Option<Command> {
        match code {
            1 => Some(Command::Intervals),
            2 => Some(Command::Bins),
            3 => Some(Command::IntervalsCov),
            4 => Some(Command::BinsCov),
            _ => None,
        }
    }

    pub fn is_bins(self) -> bool {
        matches!(self, Command::Bins | Command::BinsCov)
    }

    pub fn include_coverage(self) -> bool {
        matches!(self, Command::IntervalsCov | Command::BinsCov)
    }
}

/// Response status, first field of every response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    BadRequest = 1,
    UnknownAccession = 2,
    UnknownAssembly = 3,
    MethylomeSizeMismatch = 4,
    InvalidOffsets = 5,
    ServerBusy = 6,
    InternalError = 7,
}

impl StatusCode {
    pub fn from_code(code: u16) -> Option<StatusCode> {
        match code {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::BadRequest),
            2 => Some(StatusCode::UnknownAccession),
            3 => Some(StatusCode::UnknownAssembly),
            4 => Some(StatusCode::MethylomeSizeMismatch),
            5 => Some(StatusCode::InvalidOffsets),
            6 => Some(StatusCode::ServerBusy),
            7 => Some(StatusCode::InternalError),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::UnknownAccession => "UNKNOWN_ACCESSION",
            StatusCode::UnknownAssembly => "UNKNOWN_ASSEMBLY",
            StatusCode::MethylomeSizeMismatch => "METHYLOME_SIZE_MISMATCH",
            StatusCode::InvalidOffsets => "INVALID_OFFSETS",
            StatusCode::ServerBusy => "SERVER_BUSY",
            StatusCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn valid_accession(accession: &str) -> bool {
    !accession.is_empty()
        && accession.len() <= MAX_ACCESSION_LEN
        && accession
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Fixed-size request header.
///
/// Layout: version u16, command u16, accession_len u16, reserved u16,
/// accession bytes, methylome_size u32, n_intervals u32, zero padding to
/// [`REQUEST_HEADER_BYTES`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: Command,
    pub accession: String,
    pub methylome_size: u32,
    pub n_intervals: u32,
}

impl RequestHeader {
    pub fn encode(&self) -> Result<[u8; REQUEST_HEADER_BYTES]> {
        if !valid_accession(&self.accession) {
            return Err(Error::BadRequest(format!(
                "invalid accession: {:?}",
                self.accession
            )));
        }
        let mut buf = [0u8; REQUEST_HEADER_BYTES];
        buf[0..2].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf[2..4].copy_from_slice(&self.command.code().to_be_bytes());
        buf[4..6].copy_from_slice(&(self.accession.len() as u16).to_be_bytes());
        // bytes 6..8 reserved, zero
        let mut at = 8;
        buf[at..at + self.accession.len()].copy_from_slice(self.accession.as_bytes());
        at += self.accession.len();
        buf[at..at + 4].copy_from_slice(&self.methylome_size.to_be_bytes());
        at += 4;
        buf[at..at + 4].copy_from_slice(&self.n_intervals.to_be_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8; REQUEST_HEADER_BYTES]) -> Result<RequestHeader> {
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != PROTOCOL_VERSION {
            return Err(Error::BadRequest(format!(
                "unsupported protocol version {version}"
            )));
        }
        let command_code = u16::from_be_bytes([buf[2], buf[3]]);
        let command = Command::from_code(command_code)
            .ok_or_else(|| Error::BadRequest(format!("unknown command {command_code}")))?;
        let accession_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if accession_len == 0 || accession_len > MAX_ACCESSION_LEN {
            return Err(Error::BadRequest(format!(
                "accession length {accession_len} out of range"
            )));
        }
        let reserved = u16::from_be_bytes([buf[6], buf[7]]);
        if reserved != 0 {
            return Err(Error::BadRequest("reserved field must be zero".to_string()));
        }
        let mut at = 8;
        let accession = std::str::from_utf8(&buf[at..at + accession_len])
            .map_err(|_| Error::BadRequest("accession is not ASCII".to_string()))?
            .to_string();
        if !valid_accession(&accession) {
            return Err(Error::BadRequest(format!(
                "invalid accession: {accession:?}"
            )));
        }
        at += accession_len;
        let methylome_size = read_u32(buf, at);
        at += 4;
        let n_intervals = read_u32(buf, at);
        if n_intervals > MAX_INTERVALS {
            return Err(Error::BadRequest(format!(
                "n_intervals {n_intervals} over limit {MAX_INTERVALS}"
            )));
        }
        Ok(RequestHeader {
            command,
            accession,
            methylome_size,
            n_intervals,
        })
    }
}

/// Fixed-size response header.
///
/// Layout: status u16, flags u16, n_counts u32, payload_bytes u32, zero
/// padding to [`RESPONSE_HEADER_BYTES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: StatusCode,
    pub include_coverage: bool,
    pub n_counts: u32,
    pub payload_bytes: u32,
}

impl ResponseHeader {
    pub fn error(status: StatusCode) -> ResponseHeader {
        ResponseHeader {
            status,
            include_coverage: false,
            n_counts: 0,
            payload_bytes: 0,
        }
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_BYTES] {
        let mut buf = [0u8; RESPONSE_HEADER_BYTES];
        buf[0..2].copy_from_slice(&(self.status as u16).to_be_bytes());
        let flags = if self.include_coverage {
            FLAG_INCLUDE_COVERAGE
        } else {
            0
        };
        buf[2..4].copy_from_slice(&flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.n_counts.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_bytes.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_HEADER_BYTES]) -> Result<ResponseHeader> {
        let status_code = u16::from_be_bytes([buf[0], buf[1]]);
        let status = StatusCode::from_code(status_code)
            .ok_or_else(|| Error::BadRequest(format!("unknown status {status_code}")))?;
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(ResponseHeader {
            status,
            include_coverage: flags & FLAG_INCLUDE_COVERAGE != 0,
            n_counts: read_u32(buf, 4),
            payload_bytes: read_u32(buf, 8),
        })
    }
}

pub fn encode_offsets(offsets: &[(u32, u32)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(offsets.len() * 8);
    for &(lo, hi) in offsets {
        buf.put_u32(lo);
        buf.put_u32(hi);
    }
    buf.freeze()
}

pub fn decode_offsets(bytes: &[u8]) -> Result<Vec<(u32, u32)>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::BadRequest(format!(
            "offset payload of {} bytes is not a whole number of pairs",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| (read_u32(c, 0), read_u32(c, 4)))
        .collect())
}

/// Each pair must satisfy `lo <= hi <= n_cpgs_total`.
pub fn validate_offsets(offsets: &[(u32, u32)], n_cpgs_total: u32) -> Result<()> {
    for (i, &(lo, hi)) in offsets.iter().enumerate() {
        if lo > hi || hi > n_cpgs_total {
            return Err(Error::InvalidOffsets(format!(
                "pair {i} ({lo}, {hi}) out of range for {n_cpgs_total} sites"
            )));
        }
    }
    Ok(())
}

pub fn encode_counts(result: &AggregateResult) -> Bytes {
    match result {
        AggregateResult::Plain(rows) => {
            let mut buf = BytesMut::with_capacity(rows.len() * 8);
            for row in rows {
                buf.put_u32(row.n_meth);
                buf.put_u32(row.n_unmeth);
            }
            buf.freeze()
        }
        AggregateResult::Cov(rows) => {
            let mut buf = BytesMut::with_capacity(rows.len() * 12);
            for row in rows {
                buf.put_u32(row.n_meth);
                buf.put_u32(row.n_unmeth);
                buf.put_u32(row.n_covered);
            }
            buf.freeze()
        }
    }
}

pub fn decode_counts(bytes: &[u8], include_coverage: bool) -> Result<AggregateResult> {
    let row_bytes = if include_coverage { 12 } else { 8 };
    if bytes.len() % row_bytes != 0 {
        return Err(Error::BadRequest(format!(
            "counts payload of {} bytes is not a whole number of rows",
            bytes.len()
        )));
    }
    if include_coverage {
        Ok(AggregateResult::Cov(
            bytes
                .chunks_exact(12)
                .map(|c| CountsResCov {
                    n_meth: read_u32(c, 0),
                    n_unmeth: read_u32(c, 4),
                    n_covered: read_u32(c, 8),
                })
                .collect(),
        ))
    } else {
        Ok(AggregateResult::Plain(
            bytes
                .chunks_exact(8)
                .map(|c| CountsRes {
                    n_meth: read_u32(c, 0),
                    n_unmeth: read_u32(c, 4),
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RequestHeader {
        RequestHeader {
            command: Command::IntervalsCov,
            accession: "SRX012345".to_string(),
            methylome_size: 28_000_000,
            n_intervals: 512,
        }
    }

    #[test]
    fn request_header_roundtrip() {
        let original = header();
        let buf = original.encode().unwrap();
        assert_eq!(buf.len(), REQUEST_HEADER_BYTES);
        let decoded = RequestHeader::decode(&buf).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn request_header_rejects_bad_fields() {
        let mut buf = header().encode().unwrap();
        buf[0..2].copy_from_slice(&9u16.to_be_bytes());
        assert!(RequestHeader::decode(&buf).is_err());

        let mut buf = header().encode().unwrap();
        buf[2..4].copy_from_slice(&99u16.to_be_bytes());
        assert!(RequestHeader::decode(&buf).is_err());

        let mut buf = header().encode().unwrap();
        buf[4..6].copy_from_slice(&0u16.to_be_bytes());
        assert!(RequestHeader::decode(&buf).is_err());

        let mut buf = header().encode().unwrap();
        buf[6..8].copy_from_slice(&1u16.to_be_bytes());
        assert!(RequestHeader::decode(&buf).is_err());

        // accession with a forbidden byte
        let mut buf = header().encode().unwrap();
        buf[8] = b'-';
        assert!(RequestHeader::decode(&buf).is_err());

        let mut h = header();
        h.n_intervals = MAX_INTERVALS + 1;
        let buf = h.encode().unwrap();
        assert!(RequestHeader::decode(&buf).is_err());
    }

    #[test]
    fn oversized_accession_fails_encode() {
        let mut h = header();
        h.accession = "X".repeat(MAX_ACCESSION_LEN + 1);
        assert!(h.encode().is_err());
    }

    #[test]
    fn arbitrary_bytes_never_panic() {
        let mut buf = [0u8; REQUEST_HEADER_BYTES];
        for seed in 0..64u8 {
            buf.iter_mut()
                .enumerate()
                .for_each(|(i, b)| *b = seed.wrapping_mul(37).wrapping_add(i as u8));
            let _ = RequestHeader::decode(&buf);
        }
        assert!(RequestHeader::decode(&[0u8; REQUEST_HEADER_BYTES]).is_err());
    }

    #[test]
    fn response_header_roundtrip() {
        let original = ResponseHeader {
            status: StatusCode::Ok,
            include_coverage: true,
            n_counts: 3,
            payload_bytes: 36,
        };
        let decoded = ResponseHeader::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);

        let error = ResponseHeader::error(StatusCode::MethylomeSizeMismatch);
        let decoded = ResponseHeader::decode(&error.encode()).unwrap();
        assert_eq!(decoded.status, StatusCode::MethylomeSizeMismatch);
        assert_eq!(decoded.n_counts, 0);
    }

    #[test]
    fn offsets_roundtrip_and_validation() {
        let offsets = vec![(0u32, 3u32), (3, 4), (4, 4)];
        let bytes = encode_offsets(&offsets);
        assert_eq!(bytes.len(), 24);
        assert_eq!(decode_offsets(&bytes).unwrap(), offsets);

        assert!(decode_offsets(&bytes[..7]).is_err());
        assert!(validate_offsets(&offsets, 4).is_ok());
        assert!(validate_offsets(&[(2, 1)], 4).is_err());
        assert!(validate_offsets(&[(0, 5)], 4).is_err());
    }

    #[test]
    fn counts_roundtrip_both_shapes() {
        let plain = AggregateResult::Plain(vec![
            CountsRes { n_meth: 5, n_unmeth: 25 },
            CountsRes { n_meth: 7, n_unmeth: 3 },
        ]);
        let bytes = encode_counts(&plain);
        assert_eq!(decode_counts(&bytes, false).unwrap(), plain);

        let cov = AggregateResult::Cov(vec![CountsResCov {
            n_meth: 5,
            n_unmeth: 25,
            n_covered: 2,
        }]);
        let bytes = encode_counts(&cov);
        assert_eq!(decode_counts(&bytes, true).unwrap(), cov);

        assert!(decode_counts(&bytes, false).is_err());
    }
}
