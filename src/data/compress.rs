use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use tracing::warn;

use crate::data::hash;
use crate::error::StoreError;
use crate::types::CompressionMethod;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

pub fn compress_block(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .context("failed to gzip block payload")?;
            encoder.finish().context("failed to finish gzip stream")
        }
        CompressionMethod::Lz4 => {
            let mut encoder = FrameEncoder::new(Vec::new());
            encoder
                .write_all(data)
                .context("failed to lz4 block payload")?;
            encoder
                .finish()
                .context("failed to finish lz4 frame")
        }
    }
}

fn decompress_block(method: CompressionMethod, payload: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(payload.to_vec()),
        CompressionMethod::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(payload)
                .read_to_end(&mut out)
                .context("failed to decode gzip block")?;
            Ok(out)
        }
        CompressionMethod::Lz4 => {
            let mut out = Vec::new();
            FrameDecoder::new(payload)
                .read_to_end(&mut out)
                .context("failed to decode lz4 frame block")?;
            Ok(out)
        }
    }
}

/// Guess the codec from the payload's leading magic bytes.
fn detect_method(payload: &[u8]) -> Option<CompressionMethod> {
    if payload.starts_with(&GZIP_MAGIC) {
        Some(CompressionMethod::Gzip)
    } else if payload.starts_with(&LZ4_FRAME_MAGIC) {
        Some(CompressionMethod::Lz4)
    } else {
        None
    }
}

/// Decode a stored block payload and verify its content checksum.
///
/// Historical backups may carry payloads encoded with a different method
/// than the volume declares (the method was changed mid-life). When the
/// declared method does not produce bytes matching `expected`, and the
/// payload's magic identifies the other codec, one retry with that codec is
/// made before failing.
pub fn decode_and_verify(
    method: CompressionMethod,
    payload: &[u8],
    expected: &str,
) -> Result<Vec<u8>> {
    let primary = decompress_block(method, payload);

    let decoded = match primary {
        Ok(decoded) if hash::checksum(&decoded) == expected => return Ok(decoded),
        outcome => {
            let alternate = detect_method(payload).filter(|alt| *alt != method);
            match (outcome, alternate) {
                (_, Some(alt)) => {
                    warn!(
                        declared = %method,
                        detected = %alt,
                        block = expected,
                        "declared codec failed, retrying with detected codec"
                    );
                    decompress_block(alt, payload).map_err(|_| StoreError::CodecMismatch {
                        checksum: expected.to_string(),
                        method: method.to_string(),
                    })?
                }
                (Ok(decoded), None) => decoded,
                (Err(_), None) => {
                    return Err(StoreError::CodecMismatch {
                        checksum: expected.to_string(),
                        method: method.to_string(),
                    }
                    .into())
                }
            }
        }
    };

    let computed = hash::checksum(&decoded);
    if computed != expected {
        return Err(StoreError::ChecksumMismatch {
            checksum: expected.to_string(),
            computed,
        }
        .into());
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_store_error;

    fn sample_block() -> Vec<u8> {
        (0..8192_u32).flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn roundtrip_all_methods() {
        let data = sample_block();
        let cs = hash::checksum(&data);
        for method in [
            CompressionMethod::None,
            CompressionMethod::Gzip,
            CompressionMethod::Lz4,
        ] {
            let payload = compress_block(method, &data).expect("compress should succeed");
            let decoded = decode_and_verify(method, &payload, &cs).expect("decode should succeed");
            assert_eq!(decoded, data, "roundtrip mismatch for {method}");
        }
    }

    #[test]
    fn gzip_actually_compresses_repetitive_data() {
        let data = vec![7_u8; 256 * 1024];
        let payload = compress_block(CompressionMethod::Gzip, &data).expect("compress");
        assert!(payload.len() < data.len() / 10);
    }

    #[test]
    fn declared_gzip_falls_back_to_lz4_payload() {
        let data = sample_block();
        let cs = hash::checksum(&data);
        let payload = compress_block(CompressionMethod::Lz4, &data).expect("compress");
        let decoded = decode_and_verify(CompressionMethod::Gzip, &payload, &cs)
            .expect("alternate codec fallback should succeed");
        assert_eq!(decoded, data);
    }

    #[test]
    fn declared_lz4_falls_back_to_gzip_payload() {
        let data = sample_block();
        let cs = hash::checksum(&data);
        let payload = compress_block(CompressionMethod::Gzip, &data).expect("compress");
        let decoded = decode_and_verify(CompressionMethod::Lz4, &payload, &cs)
            .expect("alternate codec fallback should succeed");
        assert_eq!(decoded, data);
    }

    #[test]
    fn declared_none_falls_back_on_compressed_payload() {
        let data = sample_block();
        let cs = hash::checksum(&data);
        let payload = compress_block(CompressionMethod::Gzip, &data).expect("compress");
        let decoded = decode_and_verify(CompressionMethod::None, &payload, &cs)
            .expect("alternate codec fallback should succeed");
        assert_eq!(decoded, data);
    }

    #[test]
    fn corrupt_raw_payload_reports_checksum_mismatch() {
        let data = sample_block();
        let cs = hash::checksum(&data);
        let mut payload = data.clone();
        payload[17] ^= 0xff;
        let err = decode_and_verify(CompressionMethod::None, &payload, &cs)
            .expect_err("corrupt payload must fail");
        assert!(matches!(
            as_store_error(&err),
            Some(StoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn garbage_payload_reports_codec_mismatch() {
        let cs = hash::checksum(b"whatever");
        let err = decode_and_verify(CompressionMethod::Gzip, &[0x00, 0x01, 0x02, 0x03], &cs)
            .expect_err("garbage payload must fail");
        assert!(matches!(
            as_store_error(&err),
            Some(StoreError::CodecMismatch { .. })
        ));
    }
}
