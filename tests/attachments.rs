//! Attachment staging: digests, cleanup, cancellation, encodings.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use rand::RngCore;
use sha1::{Digest, Sha1};
use syncstore::{
    Attachment, AttachmentError, CancellationFlag, Encoding, Limits, PreparedAttachment,
};

fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn dir_entries(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    entries.sort();
    entries
}

/// Reader that fails partway through.
struct FailingReader {
    remaining: usize,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::other("injected stream failure"));
        }
        let n = self.remaining.min(buf.len());
        buf[..n].fill(0xAB);
        self.remaining -= n;
        Ok(n)
    }
}

#[test]
fn staging_one_mebibyte_plain() {
    let dir = tempfile::tempdir().unwrap();
    let mut payload = vec![0u8; 1024 * 1024];
    rand::rng().fill_bytes(&mut payload);

    let prepared = PreparedAttachment::prepare(
        Attachment::from_bytes("blob.bin", "application/octet-stream", payload.clone()),
        dir.path(),
        Encoding::Plain,
        &Limits::default(),
        &CancellationFlag::new(),
    )
    .unwrap();

    // Exactly one file, its contents equal the input, and the reported
    // digest matches a digest recomputed from disk.
    let entries = dir_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0], prepared.temp_path);
    assert!(
        entries[0]
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("temp")
    );

    let on_disk = fs::read(&entries[0]).unwrap();
    assert_eq!(on_disk, payload);
    assert_eq!(prepared.sha1, sha1_of(&payload));
    prepared.verify().unwrap();
}

#[test]
fn staging_failure_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let attachment = Attachment::from_reader(
        "doomed.bin",
        "application/octet-stream",
        Box::new(FailingReader {
            remaining: 200 * 1024,
        }),
    );

    let err = PreparedAttachment::prepare(
        attachment,
        dir.path(),
        Encoding::Plain,
        &Limits::default(),
        &CancellationFlag::new(),
    )
    .unwrap_err();

    assert!(matches!(err, AttachmentError::Io { .. }));
    assert!(dir_entries(dir.path()).is_empty());
}

#[test]
fn cancellation_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let err = PreparedAttachment::prepare(
        Attachment::from_bytes("a.bin", "application/octet-stream", vec![1u8; 4096]),
        dir.path(),
        Encoding::Plain,
        &Limits::default(),
        &cancel,
    )
    .unwrap_err();

    assert!(matches!(err, AttachmentError::Cancelled));
    assert!(dir_entries(dir.path()).is_empty());
}

#[test]
fn gzip_digest_covers_decoded_content() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"some compressible payload, repeated: abcabcabcabcabc".repeat(100);

    let prepared = PreparedAttachment::prepare(
        Attachment::from_bytes("z.txt", "text/plain", payload.clone()),
        dir.path(),
        Encoding::Gzip,
        &Limits::default(),
        &CancellationFlag::new(),
    )
    .unwrap();

    // Digest is over the decoded bytes, not the gzip stream.
    assert_eq!(prepared.sha1, sha1_of(&payload));

    // And the on-disk stream really is gzip of the payload.
    let file = fs::File::open(&prepared.temp_path).unwrap();
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(file)
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, payload);

    prepared.verify().unwrap();
}

#[test]
fn commit_moves_to_digest_named_path() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"attachment body".to_vec();

    let prepared = PreparedAttachment::prepare(
        Attachment::from_bytes("a.txt", "text/plain", payload.clone()),
        dir.path(),
        Encoding::Plain,
        &Limits::default(),
        &CancellationFlag::new(),
    )
    .unwrap();
    let expected_name = prepared.sha1_hex();

    let final_path = prepared.commit(dir.path()).unwrap();
    assert_eq!(final_path.file_name().unwrap().to_str().unwrap(), expected_name);

    let entries = dir_entries(dir.path());
    assert_eq!(entries, vec![final_path.clone()]);
    assert_eq!(fs::read(&final_path).unwrap(), payload);
}

#[test]
fn commit_is_idempotent_per_content() {
    let dir = tempfile::tempdir().unwrap();
    let payload = b"same bytes twice".to_vec();

    let stage = |payload: &[u8]| {
        PreparedAttachment::prepare(
            Attachment::from_bytes("a.txt", "text/plain", payload.to_vec()),
            dir.path(),
            Encoding::Plain,
            &Limits::default(),
            &CancellationFlag::new(),
        )
        .unwrap()
    };

    let first = stage(&payload).commit(dir.path()).unwrap();
    let second = stage(&payload).commit(dir.path()).unwrap();
    assert_eq!(first, second);
    assert_eq!(dir_entries(dir.path()).len(), 1);
}

#[test]
fn dropping_uncommitted_staging_removes_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let prepared = PreparedAttachment::prepare(
        Attachment::from_bytes("a.txt", "text/plain", b"bytes".to_vec()),
        dir.path(),
        Encoding::Plain,
        &Limits::default(),
        &CancellationFlag::new(),
    )
    .unwrap();

    drop(prepared);
    assert!(dir_entries(dir.path()).is_empty());
}

#[test]
fn concurrent_stagings_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = dir.path().to_path_buf();
            std::thread::spawn(move || {
                PreparedAttachment::prepare(
                    Attachment::from_bytes(
                        format!("a{i}.bin"),
                        "application/octet-stream",
                        vec![i as u8; 32 * 1024],
                    ),
                    &path,
                    Encoding::Plain,
                    &Limits::default(),
                    &CancellationFlag::new(),
                )
            })
        })
        .collect();

    let prepared: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(dir_entries(dir.path()).len(), 8);
    for p in &prepared {
        p.verify().unwrap();
    }
}
