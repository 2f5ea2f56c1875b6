//! DEFLATE codec for opaque plugin-state blobs (`GetBlob`/`SetBlob`).
//!
//! Wire shape is compressed-length, then raw-length, then the compressed
//! bytes; a mismatch between the declared raw length and what actually came
//! out of the decompressor is treated as connection loss rather than a
//! recoverable protocol violation, since it means the two sides have lost
//! sync on the blob boundary.

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;

use rplugin_core::{Error, Result};

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn decompress(compressed: &[u8], expected_raw_len: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut out = Vec::with_capacity(expected_raw_len);
    decoder.read_to_end(&mut out)?;
    if out.len() != expected_raw_len {
        return Err(Error::ConnectionLost);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let data = b"some plugin state blob with repeated bytes bytes bytes".to_vec();
        let compressed = compress(&data).unwrap();
        let restored = decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn mismatched_raw_length_is_connection_lost() {
        let data = b"abc".to_vec();
        let compressed = compress(&data).unwrap();
        let err = decompress(&compressed, data.len() + 1).unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
    }

    #[test]
    fn empty_blob_round_trips() {
        let compressed = compress(&[]).unwrap();
        let restored = decompress(&compressed, 0).unwrap();
        assert!(restored.is_empty());
    }
}
