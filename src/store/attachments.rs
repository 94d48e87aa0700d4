//! Attachment staging and commit.
//!
//! Replication streams attachment bodies from the network; holding a
//! network resource across a database commit is not acceptable, so blobs
//! are first staged: copied into a uniquely-named temp file inside the
//! datastore's `attachments/` directory while the SHA-1 of the decoded
//! content is computed. The later commit is then a local rename to the
//! digest-named final path.
//!
//! Concurrent stagings in one directory are safe because temp names embed a
//! fresh UUID; no locking is involved. Every failure path removes the temp
//! file before surfacing the error.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha1::{Digest, Sha1};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Limits;
use crate::core::InvalidEncoding;
use crate::error::{Effect, Transience};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttachmentError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("attachment staging cancelled")]
    Cancelled,
    #[error("attachment digest mismatch: recorded {recorded}, recomputed {recomputed}")]
    DigestMismatch { recorded: String, recomputed: String },
    #[error("attachment stream for `{name}` already consumed")]
    StreamConsumed { name: String },
}

impl AttachmentError {
    pub fn transience(&self) -> Transience {
        match self {
            AttachmentError::Io { .. } => Transience::Unknown,
            AttachmentError::Cancelled => Transience::Retryable,
            AttachmentError::DigestMismatch { .. } => Transience::Permanent,
            AttachmentError::StreamConsumed { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        // Staging cleans its temp file up on every failure path.
        Effect::None
    }
}

/// Cooperative cancellation signal, checked between I/O chunks.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// On-disk encoding of a committed attachment.
///
/// The SHA-1 digest always covers the decoded content, so a blob keeps the
/// same identity whether or not it is compressed on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Gzip,
}

impl Encoding {
    pub fn parse(raw: &str) -> Result<Self, InvalidEncoding> {
        match raw {
            "Plain" | "plain" => Ok(Encoding::Plain),
            "Gzip" | "gzip" => Ok(Encoding::Gzip),
            _ => Err(InvalidEncoding {
                raw: raw.to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Plain => "plain",
            Encoding::Gzip => "gzip",
        }
    }

    pub(crate) fn to_db(self) -> i64 {
        match self {
            Encoding::Plain => 0,
            Encoding::Gzip => 1,
        }
    }

    pub(crate) fn from_db(code: i64) -> Option<Self> {
        match code {
            0 => Some(Encoding::Plain),
            1 => Some(Encoding::Gzip),
            _ => None,
        }
    }
}

enum AttachmentSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
    /// Consumed exactly once; a second stream open fails.
    Stream(Mutex<Option<Box<dyn Read + Send>>>),
}

/// An attachment body awaiting staging, with its document-visible name and
/// content type.
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    source: AttachmentSource,
}

impl Attachment {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            source: AttachmentSource::Bytes(bytes.into().into()),
        }
    }

    pub fn from_file(
        name: impl Into<String>,
        content_type: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            source: AttachmentSource::File(path.into()),
        }
    }

    /// Wrap an arbitrary reader (e.g. an HTTP response body).
    pub fn from_reader(
        name: impl Into<String>,
        content_type: impl Into<String>,
        reader: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            source: AttachmentSource::Stream(Mutex::new(Some(reader))),
        }
    }

    fn open_stream(&self) -> Result<Box<dyn Read + Send>, AttachmentError> {
        match &self.source {
            AttachmentSource::Bytes(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            AttachmentSource::File(path) => {
                let file = File::open(path).map_err(|source| AttachmentError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(Box::new(file))
            }
            AttachmentSource::Stream(slot) => slot
                .lock()
                .expect("attachment stream lock poisoned")
                .take()
                .ok_or_else(|| AttachmentError::StreamConsumed {
                    name: self.name.clone(),
                }),
        }
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Removes the temp file unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

enum StageWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl StageWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            StageWriter::Plain(f) => f.write_all(chunk),
            StageWriter::Gzip(enc) => enc.write_all(chunk),
        }
    }

    fn finish(self) -> io::Result<File> {
        match self {
            StageWriter::Plain(f) => Ok(f),
            StageWriter::Gzip(enc) => enc.finish(),
        }
    }
}

/// A staged attachment: temp file written, digest computed, ready for a
/// fast in-process commit. Consumed exactly once by [`commit`]; dropping it
/// uncommitted removes the temp file.
///
/// [`commit`]: PreparedAttachment::commit
pub struct PreparedAttachment {
    pub attachment: Attachment,
    pub temp_path: PathBuf,
    pub sha1: [u8; 20],
    pub encoding: Encoding,
    guard: TempFileGuard,
}

impl PreparedAttachment {
    /// Stage `attachment` into `attachments_dir`.
    ///
    /// The body is streamed in `limits.attachment_copy_buf_bytes` chunks;
    /// `cancel` is checked between chunks. On any failure (including
    /// cancellation) the temp file is removed before the error surfaces.
    pub fn prepare(
        attachment: Attachment,
        attachments_dir: &Path,
        encoding: Encoding,
        limits: &Limits,
        cancel: &CancellationFlag,
    ) -> Result<Self, AttachmentError> {
        let temp_path = attachments_dir.join(format!("temp{}", Uuid::new_v4().simple()));

        let mut reader = attachment.open_stream()?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .map_err(|source| AttachmentError::Io {
                path: temp_path.clone(),
                source,
            })?;
        let guard = TempFileGuard {
            path: temp_path.clone(),
            armed: true,
        };

        let io_err = |source| AttachmentError::Io {
            path: temp_path.clone(),
            source,
        };

        let mut writer = match encoding {
            Encoding::Plain => StageWriter::Plain(file),
            Encoding::Gzip => StageWriter::Gzip(GzEncoder::new(file, Compression::default())),
        };

        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; limits.attachment_copy_buf_bytes.max(1)];
        loop {
            if cancel.is_cancelled() {
                return Err(AttachmentError::Cancelled);
            }
            let n = reader.read(&mut buf).map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_chunk(&buf[..n]).map_err(io_err)?;
        }

        let file = writer.finish().map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        // The guard stays armed: an uncommitted PreparedAttachment cleans
        // its temp file up when dropped.
        Ok(Self {
            attachment,
            temp_path: temp_path.clone(),
            sha1: hasher.finalize().into(),
            encoding,
            guard,
        })
    }

    pub fn sha1_hex(&self) -> String {
        hex(&self.sha1)
    }

    /// Recompute the digest from the temp file (decoding gzip) and compare
    /// against the recorded one.
    pub fn verify(&self) -> Result<(), AttachmentError> {
        let io_err = |source| AttachmentError::Io {
            path: self.temp_path.clone(),
            source,
        };
        let file = File::open(&self.temp_path).map_err(io_err)?;
        let mut reader: Box<dyn Read> = match self.encoding {
            Encoding::Plain => Box::new(file),
            Encoding::Gzip => Box::new(GzDecoder::new(file)),
        };

        let mut hasher = Sha1::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(io_err)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let recomputed: [u8; 20] = hasher.finalize().into();
        if recomputed != self.sha1 {
            return Err(AttachmentError::DigestMismatch {
                recorded: hex(&self.sha1),
                recomputed: hex(&recomputed),
            });
        }
        Ok(())
    }

    /// Move the staged blob to its digest-named final path.
    ///
    /// Content addressing makes this idempotent: if the final path already
    /// exists it holds identical bytes, and the temp copy is simply
    /// discarded.
    pub fn commit(mut self, attachments_dir: &Path) -> Result<PathBuf, AttachmentError> {
        self.verify()?;

        let final_path = attachments_dir.join(self.sha1_hex());
        if final_path.exists() {
            fs::remove_file(&self.temp_path).map_err(|source| AttachmentError::Io {
                path: self.temp_path.clone(),
                source,
            })?;
        } else {
            fs::rename(&self.temp_path, &final_path).map_err(|source| AttachmentError::Io {
                path: self.temp_path.clone(),
                source,
            })?;
        }
        self.guard.disarm();
        Ok(final_path)
    }

    /// Abandon the staged blob, removing the temp file.
    pub fn discard(mut self) {
        self.guard.disarm();
        let _ = fs::remove_file(&self.temp_path);
    }
}

impl std::fmt::Debug for PreparedAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedAttachment")
            .field("name", &self.attachment.name)
            .field("temp_path", &self.temp_path)
            .field("sha1", &self.sha1_hex())
            .field("encoding", &self.encoding.as_str())
            .finish()
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_parse_and_roundtrip() {
        assert_eq!(Encoding::parse("Plain").unwrap(), Encoding::Plain);
        assert_eq!(Encoding::parse("gzip").unwrap(), Encoding::Gzip);
        assert!(Encoding::parse("zstd").is_err());
        assert_eq!(Encoding::from_db(Encoding::Gzip.to_db()), Some(Encoding::Gzip));
        assert_eq!(Encoding::from_db(7), None);
    }

    #[test]
    fn stream_source_consumed_once() {
        let att = Attachment::from_reader(
            "a.txt",
            "text/plain",
            Box::new(io::Cursor::new(b"hello".to_vec())),
        );
        assert!(att.open_stream().is_ok());
        assert!(matches!(
            att.open_stream(),
            Err(AttachmentError::StreamConsumed { .. })
        ));
    }

    #[test]
    fn hex_encodes_lowercase() {
        assert_eq!(hex(&[0x00, 0xff, 0x1a]), "00ff1a");
    }
}
