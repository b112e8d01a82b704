//! Log-entry codec (component A, §4.1).
//!
//! Encodes and decodes individual WAL records to/from a caller-provided
//! stream. The codec is stateless: concurrent reads/writes across
//! distinct streams are safe, and nothing here opens or owns a file.
//!
//! Binary format per record: one tag byte, then length-prefixed
//! variable-length fields, then a little-endian CRC32 of everything
//! preceding it. Multi-byte integers are little-endian on the wire;
//! `write_version` is encoded as `(major: u64 le, minor: u64 le)`.
//! `blob_ids[]` is a `u32` length prefix followed by that many `u64` le
//! values.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use epochwal_core::{BlobId, Entry, EntryKind, EpochId, StorageId, WriteVersion};

/// Errors returned while decoding a record from a stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The stream ended with a structurally invalid byte sequence — not a
    /// clean end-of-file, but a tag or length that cannot be parsed.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// The record's CRC32 did not match its payload.
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the payload actually read.
        computed: u32,
    },

    /// An unrecoverable I/O failure while reading the stream.
    #[error("io error reading record: {0}")]
    Io(#[from] io::Error),
}

fn write_len_prefixed<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

/// Reads into `buf`. Returns `Ok(false)` only when zero bytes could be
/// read before hitting EOF (a clean boundary); any other `UnexpectedEof`
/// (a torn read) is a [`DecodeError::Malformed`] truncated-tail case that
/// the caller treats as end-of-file per §4.1 ("on a truncated tail,
/// returns end-of-file").
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, DecodeError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                // Torn read: truncated tail, treated as end-of-file.
                return Ok(false);
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn write_record<W: Write>(w: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(tag);
    payload.extend_from_slice(body);
    let crc = crc32(&payload);
    w.write_all(&payload)?;
    w.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// `write_begin(stream, epoch)`.
pub fn write_begin<W: Write>(w: &mut W, epoch: EpochId) -> io::Result<()> {
    write_record(w, EntryKind::MarkerBegin.tag(), &epoch.get().to_le_bytes())
}

/// `write_end(stream, epoch)`.
pub fn write_end<W: Write>(w: &mut W, epoch: EpochId) -> io::Result<()> {
    write_record(w, EntryKind::MarkerEnd.tag(), &epoch.get().to_le_bytes())
}

/// `write_durable(stream, epoch)`.
pub fn write_durable<W: Write>(w: &mut W, epoch: EpochId) -> io::Result<()> {
    write_record(w, EntryKind::MarkerDurable.tag(), &epoch.get().to_le_bytes())
}

/// `write_invalidated_begin(stream, epoch)`.
pub fn write_invalidated_begin<W: Write>(w: &mut W, epoch: EpochId) -> io::Result<()> {
    write_record(
        w,
        EntryKind::MarkerInvalidatedBegin.tag(),
        &epoch.get().to_le_bytes(),
    )
}

fn write_version_bytes(wv: WriteVersion) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&wv.major.get().to_le_bytes());
    out[8..16].copy_from_slice(&wv.minor.to_le_bytes());
    out
}

/// `write_normal(stream, storage_id, key, value, write_version)`.
pub fn write_normal<W: Write>(
    w: &mut W,
    storage_id: StorageId,
    key: &[u8],
    value: &[u8],
    write_version: WriteVersion,
) -> io::Result<()> {
    let mut body = Vec::with_capacity(8 + 16 + key.len() + value.len() + 8);
    body.extend_from_slice(&storage_id.get().to_le_bytes());
    body.extend_from_slice(&write_version_bytes(write_version));
    write_len_prefixed(&mut body, key)?;
    write_len_prefixed(&mut body, value)?;
    write_record(w, EntryKind::Normal.tag(), &body)
}

/// `write_normal_with_blob(stream, storage_id, key, value, write_version, blob_ids)`.
pub fn write_normal_with_blob<W: Write>(
    w: &mut W,
    storage_id: StorageId,
    key: &[u8],
    value: &[u8],
    write_version: WriteVersion,
    blob_ids: &[BlobId],
) -> io::Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&storage_id.get().to_le_bytes());
    body.extend_from_slice(&write_version_bytes(write_version));
    write_len_prefixed(&mut body, key)?;
    write_len_prefixed(&mut body, value)?;
    body.extend_from_slice(&(blob_ids.len() as u32).to_le_bytes());
    for id in blob_ids {
        body.extend_from_slice(&id.get().to_le_bytes());
    }
    write_record(w, EntryKind::NormalWithBlob.tag(), &body)
}

/// `write_remove(stream, storage_id, key, write_version)`.
pub fn write_remove<W: Write>(
    w: &mut W,
    storage_id: StorageId,
    key: &[u8],
    write_version: WriteVersion,
) -> io::Result<()> {
    let mut body = Vec::with_capacity(8 + 16 + key.len());
    body.extend_from_slice(&storage_id.get().to_le_bytes());
    body.extend_from_slice(&write_version_bytes(write_version));
    write_len_prefixed(&mut body, key)?;
    write_record(w, EntryKind::Remove.tag(), &body)
}

fn write_storage_tagged<W: Write>(
    w: &mut W,
    tag: u8,
    storage_id: StorageId,
    write_version: WriteVersion,
) -> io::Result<()> {
    let mut body = Vec::with_capacity(24);
    body.extend_from_slice(&storage_id.get().to_le_bytes());
    body.extend_from_slice(&write_version_bytes(write_version));
    write_record(w, tag, &body)
}

/// `write_clear_storage(stream, storage_id, write_version)`.
pub fn write_clear_storage<W: Write>(
    w: &mut W,
    storage_id: StorageId,
    write_version: WriteVersion,
) -> io::Result<()> {
    write_storage_tagged(w, EntryKind::ClearStorage.tag(), storage_id, write_version)
}

/// `write_add_storage(stream, storage_id, write_version)`.
pub fn write_add_storage<W: Write>(
    w: &mut W,
    storage_id: StorageId,
    write_version: WriteVersion,
) -> io::Result<()> {
    write_storage_tagged(w, EntryKind::AddStorage.tag(), storage_id, write_version)
}

/// `write_remove_storage(stream, storage_id, write_version)`.
pub fn write_remove_storage<W: Write>(
    w: &mut W,
    storage_id: StorageId,
    write_version: WriteVersion,
) -> io::Result<()> {
    write_storage_tagged(w, EntryKind::RemoveStorage.tag(), storage_id, write_version)
}

/// `read(stream) -> Option<Entry>`.
///
/// Returns `Ok(None)` at a clean end-of-file or a truncated tail (§4.1);
/// returns `Err(DecodeError::Malformed)` for a structurally invalid
/// non-truncated record (e.g. an unknown tag byte).
pub fn read<R: Read>(r: &mut R) -> Result<Option<Entry>, DecodeError> {
    let mut tag_buf = [0u8; 1];
    if !read_exact_or_eof(r, &mut tag_buf)? {
        return Ok(None);
    }
    let tag = tag_buf[0];
    let kind = match EntryKind::from_tag(tag) {
        Some(k) => k,
        None => return Err(DecodeError::Malformed(format!("unknown tag byte {tag}"))),
    };

    macro_rules! read_exact_n {
        ($n:expr) => {{
            let mut buf = [0u8; $n];
            if !read_exact_or_eof(r, &mut buf)? {
                return Ok(None);
            }
            buf
        }};
    }

    let (body_for_crc, entry) = match kind {
        EntryKind::MarkerBegin
        | EntryKind::MarkerEnd
        | EntryKind::MarkerDurable
        | EntryKind::MarkerInvalidatedBegin => {
            let epoch_bytes = read_exact_n!(8);
            let epoch = EpochId::new(u64::from_le_bytes(epoch_bytes));
            let mut body = vec![tag];
            body.extend_from_slice(&epoch_bytes);
            let entry = match kind {
                EntryKind::MarkerBegin => Entry::Begin { epoch },
                EntryKind::MarkerEnd => Entry::End { epoch },
                EntryKind::MarkerDurable => Entry::Durable { epoch },
                EntryKind::MarkerInvalidatedBegin => Entry::InvalidatedBegin { epoch },
                _ => unreachable!(),
            };
            (body, entry)
        }
        EntryKind::Normal | EntryKind::NormalWithBlob => {
            let sid_bytes = read_exact_n!(8);
            let wv_bytes = read_exact_n!(16);
            let storage_id = StorageId::new(u64::from_le_bytes(sid_bytes));
            let write_version = decode_write_version(&wv_bytes);

            let mut body = vec![tag];
            body.extend_from_slice(&sid_bytes);
            body.extend_from_slice(&wv_bytes);

            let key = match read_len_prefixed_with_body(r, &mut body)? {
                Some(k) => k,
                None => return Ok(None),
            };
            let value = match read_len_prefixed_with_body(r, &mut body)? {
                Some(v) => v,
                None => return Ok(None),
            };

            if kind == EntryKind::Normal {
                (
                    body,
                    Entry::Normal {
                        storage_id,
                        key,
                        value,
                        write_version,
                    },
                )
            } else {
                let count_bytes = read_exact_n!(4);
                body.extend_from_slice(&count_bytes);
                let count = u32::from_le_bytes(count_bytes) as usize;
                let mut blob_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    let id_bytes = read_exact_n!(8);
                    body.extend_from_slice(&id_bytes);
                    blob_ids.push(BlobId::new(u64::from_le_bytes(id_bytes)));
                }
                (
                    body,
                    Entry::NormalWithBlob {
                        storage_id,
                        key,
                        value,
                        write_version,
                        blob_ids,
                    },
                )
            }
        }
        EntryKind::Remove => {
            let sid_bytes = read_exact_n!(8);
            let wv_bytes = read_exact_n!(16);
            let storage_id = StorageId::new(u64::from_le_bytes(sid_bytes));
            let write_version = decode_write_version(&wv_bytes);
            let mut body = vec![tag];
            body.extend_from_slice(&sid_bytes);
            body.extend_from_slice(&wv_bytes);
            let key = match read_len_prefixed_with_body(r, &mut body)? {
                Some(k) => k,
                None => return Ok(None),
            };
            (
                body,
                Entry::Remove {
                    storage_id,
                    key,
                    write_version,
                },
            )
        }
        EntryKind::ClearStorage | EntryKind::AddStorage | EntryKind::RemoveStorage => {
            let sid_bytes = read_exact_n!(8);
            let wv_bytes = read_exact_n!(16);
            let storage_id = StorageId::new(u64::from_le_bytes(sid_bytes));
            let write_version = decode_write_version(&wv_bytes);
            let mut body = vec![tag];
            body.extend_from_slice(&sid_bytes);
            body.extend_from_slice(&wv_bytes);
            let entry = match kind {
                EntryKind::ClearStorage => Entry::ClearStorage {
                    storage_id,
                    write_version,
                },
                EntryKind::AddStorage => Entry::AddStorage {
                    storage_id,
                    write_version,
                },
                EntryKind::RemoveStorage => Entry::RemoveStorage {
                    storage_id,
                    write_version,
                },
                _ => unreachable!(),
            };
            (body, entry)
        }
    };

    let crc_bytes = read_exact_n!(4);
    let stored_crc = u32::from_le_bytes(crc_bytes);
    let computed_crc = crc32(&body_for_crc);
    if stored_crc != computed_crc {
        return Err(DecodeError::ChecksumMismatch {
            expected: stored_crc,
            computed: computed_crc,
        });
    }

    Ok(Some(entry))
}

fn read_len_prefixed_with_body<R: Read>(
    r: &mut R,
    body: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, DecodeError> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(r, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    if !read_exact_or_eof(r, &mut buf)? {
        return Ok(None);
    }
    body.extend_from_slice(&len_buf);
    body.extend_from_slice(&buf);
    Ok(Some(buf))
}

fn decode_write_version(bytes: &[u8; 16]) -> WriteVersion {
    let major = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let minor = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    WriteVersion::new(major, minor)
}
