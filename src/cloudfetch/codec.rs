//! Staged result file format.
//!
//! A file holds one bincode-encoded [`RowBatch`], optionally lz4 compressed (size
//! prepended), optionally encrypted. The declared checksum covers the bytes as served.
use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_to_vec,
};

use crate::{
    error::{Error, Result},
    protocol::FileReference,
    types::{Row, RowBatch},
};

use super::Decryptor;

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Serializes `rows` into the staged file layout (unencrypted).
pub fn encode_file(rows: &[Row], compress: bool) -> std::result::Result<Vec<u8>, bincode::error::EncodeError> {
    let batch = RowBatch::new(rows.to_vec());
    let raw = encode_to_vec(&batch, config())?;
    Ok(if compress {
        lz4_flex::compress_prepend_size(&raw)
    } else {
        raw
    })
}

pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Verifies and decodes a downloaded file. Every failure here is an integrity error.
pub fn decode_file(
    reference: &FileReference,
    bytes: Vec<u8>,
    compressed: bool,
    decryptor: Option<&dyn Decryptor>,
) -> Result<RowBatch> {
    let offset = reference.row_offset;

    if reference.byte_len > 0 && bytes.len() as u64 != reference.byte_len {
        return Err(Error::integrity(
            offset,
            format!(
                "expected {} bytes, downloaded {}",
                reference.byte_len,
                bytes.len()
            ),
        ));
    }
    if let Some(expected) = reference.checksum {
        let actual = checksum(&bytes);
        if actual != expected {
            return Err(Error::integrity(
                offset,
                format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
            ));
        }
    }

    let plain = match (&reference.encryption, decryptor) {
        (None, _) => bytes,
        (Some(info), Some(decryptor)) => decryptor
            .decrypt(info, bytes)
            .map_err(|e| Error::integrity(offset, format!("decryption failed: {e}")))?,
        (Some(info), None) => {
            return Err(Error::integrity(
                offset,
                format!("file is encrypted with key '{}' but no decryptor is configured", info.key_id),
            ));
        }
    };

    let raw = if compressed {
        lz4_flex::decompress_size_prepended(&plain)
            .map_err(|e| Error::integrity(offset, format!("decompression failed: {e}")))?
    } else {
        plain
    };

    let (batch, _): (RowBatch, usize) = decode_from_slice(&raw, config())
        .map_err(|e| Error::integrity(offset, format!("malformed batch: {e}")))?;

    if batch.len() as u64 != reference.row_count {
        return Err(Error::integrity(
            offset,
            format!(
                "declared {} rows, file holds {}",
                reference.row_count,
                batch.len()
            ),
        ));
    }
    Ok(batch)
}
