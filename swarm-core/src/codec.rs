//! Peer wire codec.
//!
//! Strings: u16 big-endian byte length + UTF-8 bytes. Integers: big-endian `int32`
//! and `int64`. Booleans: one byte, 0 or 1. A request is its type tag string
//! followed by the body; a response has no tag and is decoded against the kind
//! of request it answers.
//!
//! Decoders take the bytes received so far and return `NeedMore` until a whole
//! message is present, like `wire::decode_frame`.

use crate::protocol::{PeerRequest, PeerResponse, RequestKind};

pub const MAX_STRING_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("need more bytes")]
    NeedMore,
    #[error("unknown request type: {0}")]
    UnknownTag(String),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string of {0} bytes exceeds the u16 length prefix")]
    StringTooLong(usize),
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("negative length or offset on the wire: {0}")]
    Negative(i64),
    #[error("value {0} does not fit the wire type")]
    OutOfRange(u64),
}

pub fn encode_request(request: &PeerRequest) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    put_str(&mut out, request.kind().tag())?;
    match request {
        PeerRequest::ListFiles => {}
        PeerRequest::FileInfo { file_name } => put_str(&mut out, file_name)?,
        PeerRequest::DownloadFragment {
            file_name,
            start,
            end,
            use_compression,
        } => {
            put_str(&mut out, file_name)?;
            put_u64_as_i64(&mut out, *start)?;
            put_u64_as_i64(&mut out, *end)?;
            put_bool(&mut out, *use_compression);
        }
    }
    Ok(out)
}

/// Decode one request from the front of `bytes`; returns it and the bytes consumed.
pub fn decode_request(bytes: &[u8]) -> Result<(PeerRequest, usize), CodecError> {
    let mut r = Reader::new(bytes);
    let tag = r.string()?;
    let kind = RequestKind::from_tag(&tag).ok_or(CodecError::UnknownTag(tag))?;
    let request = match kind {
        RequestKind::ListFiles => PeerRequest::ListFiles,
        RequestKind::FileInfo => PeerRequest::FileInfo {
            file_name: r.string()?,
        },
        RequestKind::DownloadFragment => PeerRequest::DownloadFragment {
            file_name: r.string()?,
            start: r.non_negative_i64()?,
            end: r.non_negative_i64()?,
            use_compression: r.bool()?,
        },
    };
    Ok((request, r.pos))
}

pub fn encode_response(response: &PeerResponse) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match response {
        PeerResponse::FileList(names) => {
            let count = i32::try_from(names.len())
                .map_err(|_| CodecError::OutOfRange(names.len() as u64))?;
            out.extend_from_slice(&count.to_be_bytes());
            for name in names {
                put_str(&mut out, name)?;
            }
        }
        PeerResponse::FileInfo(None) | PeerResponse::Fragment(None) => put_bool(&mut out, false),
        PeerResponse::FileInfo(Some(size)) => {
            put_bool(&mut out, true);
            put_u64_as_i64(&mut out, *size)?;
        }
        PeerResponse::Fragment(Some(payload)) => {
            let len = i32::try_from(payload.len())
                .map_err(|_| CodecError::OutOfRange(payload.len() as u64))?;
            out.reserve(5 + payload.len());
            put_bool(&mut out, true);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(payload);
        }
    }
    Ok(out)
}

/// Decode the response to a request of `kind` from the front of `bytes`.
pub fn decode_response(
    kind: RequestKind,
    bytes: &[u8],
) -> Result<(PeerResponse, usize), CodecError> {
    let mut r = Reader::new(bytes);
    let response = match kind {
        RequestKind::ListFiles => {
            let count = r.non_negative_i32()?;
            // Each name is at least its 2-byte prefix; don't trust `count` for allocation.
            let mut names = Vec::with_capacity(count.min(r.remaining() / 2));
            for _ in 0..count {
                names.push(r.string()?);
            }
            PeerResponse::FileList(names)
        }
        RequestKind::FileInfo => {
            if r.bool()? {
                PeerResponse::FileInfo(Some(r.non_negative_i64()?))
            } else {
                PeerResponse::FileInfo(None)
            }
        }
        RequestKind::DownloadFragment => {
            if r.bool()? {
                let len = r.non_negative_i32()?;
                PeerResponse::Fragment(Some(r.take(len)?.to_vec()))
            } else {
                PeerResponse::Fragment(None)
            }
        }
    };
    Ok((response, r.pos))
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::StringTooLong(s.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.push(u8::from(v));
}

fn put_u64_as_i64(out: &mut Vec<u8>, v: u64) -> Result<(), CodecError> {
    let v = i64::try_from(v).map_err(|_| CodecError::OutOfRange(v))?;
    out.extend_from_slice(&v.to_be_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::NeedMore);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        match self.array::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    fn non_negative_i32(&mut self) -> Result<usize, CodecError> {
        let v = i32::from_be_bytes(self.array()?);
        usize::try_from(v).map_err(|_| CodecError::Negative(i64::from(v)))
    }

    fn non_negative_i64(&mut self) -> Result<u64, CodecError> {
        let v = i64::from_be_bytes(self.array()?);
        u64::try_from(v).map_err(|_| CodecError::Negative(v))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_request_layout() {
        let request = PeerRequest::DownloadFragment {
            file_name: "a.txt".to_string(),
            start: 4,
            end: 7,
            use_compression: true,
        };
        let bytes = encode_request(&request).unwrap();
        let mut expected = vec![0, 17];
        expected.extend_from_slice(b"DOWNLOAD_FRAGMENT");
        expected.extend_from_slice(&[0, 5]);
        expected.extend_from_slice(b"a.txt");
        expected.extend_from_slice(&4i64.to_be_bytes());
        expected.extend_from_slice(&7i64.to_be_bytes());
        expected.push(1);
        assert_eq!(bytes, expected);
        assert_eq!(decode_request(&bytes).unwrap(), (request, bytes.len()));
    }

    #[test]
    fn list_files_request_is_tag_only() {
        let bytes = encode_request(&PeerRequest::ListFiles).unwrap();
        assert_eq!(&bytes[..2], &[0, 10]);
        assert_eq!(&bytes[2..], b"LIST_FILES");
    }

    #[test]
    fn truncated_request_needs_more() {
        let bytes = encode_request(&PeerRequest::FileInfo {
            file_name: "movie.mkv".to_string(),
        })
        .unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode_request(&bytes[..cut]), Err(CodecError::NeedMore));
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = vec![0, 6];
        bytes.extend_from_slice(b"DELETE");
        assert_eq!(
            decode_request(&bytes),
            Err(CodecError::UnknownTag("DELETE".to_string()))
        );
    }

    #[test]
    fn negative_offsets_are_rejected() {
        let mut bytes = vec![0, 17];
        bytes.extend_from_slice(b"DOWNLOAD_FRAGMENT");
        bytes.extend_from_slice(&[0, 1, b'x']);
        bytes.extend_from_slice(&(-1i64).to_be_bytes());
        bytes.extend_from_slice(&5i64.to_be_bytes());
        bytes.push(0);
        assert_eq!(decode_request(&bytes), Err(CodecError::Negative(-1)));
    }

    #[test]
    fn missing_file_is_a_single_false_byte() {
        let bytes = encode_response(&PeerResponse::Fragment(None)).unwrap();
        assert_eq!(bytes, vec![0]);
        assert_eq!(
            decode_response(RequestKind::DownloadFragment, &bytes).unwrap(),
            (PeerResponse::Fragment(None), 1)
        );
        assert_eq!(
            decode_response(RequestKind::FileInfo, &bytes).unwrap(),
            (PeerResponse::FileInfo(None), 1)
        );
    }

    #[test]
    fn fragment_payload_waits_for_all_bytes() {
        let payload = vec![7u8; 300];
        let bytes = encode_response(&PeerResponse::Fragment(Some(payload.clone()))).unwrap();
        assert_eq!(bytes.len(), 1 + 4 + 300);
        assert_eq!(
            decode_response(RequestKind::DownloadFragment, &bytes[..200]),
            Err(CodecError::NeedMore)
        );
        let (resp, used) = decode_response(RequestKind::DownloadFragment, &bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(resp, PeerResponse::Fragment(Some(payload)));
    }

    #[test]
    fn file_list_roundtrip() {
        let names = vec!["a.txt".to_string(), "b c.bin".to_string(), "ünï.txt".to_string()];
        let bytes = encode_response(&PeerResponse::FileList(names.clone())).unwrap();
        assert_eq!(&bytes[..4], &3i32.to_be_bytes());
        let (resp, _) = decode_response(RequestKind::ListFiles, &bytes).unwrap();
        assert_eq!(resp, PeerResponse::FileList(names));
    }

    #[test]
    fn oversized_string_is_refused() {
        let name = "x".repeat(MAX_STRING_LEN + 1);
        assert_eq!(
            encode_request(&PeerRequest::FileInfo { file_name: name }),
            Err(CodecError::StringTooLong(MAX_STRING_LEN + 1))
        );
    }

    #[test]
    fn invalid_bool_byte_is_rejected() {
        assert_eq!(
            decode_response(RequestKind::FileInfo, &[2]),
            Err(CodecError::InvalidBool(2))
        );
    }
}
