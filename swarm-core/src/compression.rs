//! Gzip helpers for fragment payloads.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress `data`, refusing to inflate past `max_len` bytes.
pub fn gunzip(data: &[u8], max_len: u64) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(max_len.saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() as u64 > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed payload exceeds {max_len} bytes"),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn restores_random_bytes() {
        let mut data = vec![0u8; 10_000];
        rand::thread_rng().fill_bytes(&mut data);
        let packed = gzip(&data).unwrap();
        assert_eq!(gunzip(&packed, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn refuses_to_inflate_past_limit() {
        let packed = gzip(&[0u8; 4096]).unwrap();
        assert!(packed.len() < 4096);
        let err = gunzip(&packed, 1000).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(gunzip(b"definitely not gzip", 100).is_err());
    }
}
