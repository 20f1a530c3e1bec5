use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use arsenal_common::{Fingerprint, Outcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// JSON sidecar next to each blob. The blob holds stdout followed by
/// stderr; `stdout_len` is the split point. The embedded outcome has
/// its stream bytes emptied, the blob is authoritative for them.
#[derive(Serialize, Deserialize)]
struct Sidecar {
    stdout_len: usize,
    outcome: Outcome,
}

/// Content-addressed outcome store: `<root>/<fp[:2]>/<fp>.bin` plus a
/// `.meta` sidecar. Writes go through a temp file and a rename so a
/// crash never leaves a half-written entry behind.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DiskStore { root })
    }

    fn shard_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.as_str();
        self.root.join(&hex[..2.min(hex.len())])
    }

    fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(fingerprint).join(format!("{}.bin", fingerprint))
    }

    fn meta_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(fingerprint).join(format!("{}.meta", fingerprint))
    }

    pub fn save(&self, outcome: &Outcome) -> io::Result<()> {
        let shard = self.shard_dir(&outcome.fingerprint);
        fs::create_dir_all(&shard)?;

        let mut blob =
            Vec::with_capacity(outcome.stdout.bytes.len() + outcome.stderr.bytes.len());
        blob.extend_from_slice(&outcome.stdout.bytes);
        blob.extend_from_slice(&outcome.stderr.bytes);

        let mut stripped = outcome.clone();
        let stdout_len = stripped.stdout.bytes.len();
        stripped.stdout.bytes = Vec::new();
        stripped.stderr.bytes = Vec::new();
        let meta = serde_json::to_vec(&Sidecar {
            stdout_len,
            outcome: stripped,
        })
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        // Blob first; a sidecar without its blob is unreadable, the
        // reverse is mere garbage that load_all skips.
        write_atomic(&self.blob_path(&outcome.fingerprint), &blob)?;
        write_atomic(&self.meta_path(&outcome.fingerprint), &meta)?;
        debug!(
            fingerprint = %outcome.fingerprint.short(),
            bytes = blob.len(),
            "outcome persisted"
        );
        Ok(())
    }

    pub fn load(&self, fingerprint: &Fingerprint) -> io::Result<Outcome> {
        let meta = fs::read(self.meta_path(fingerprint))?;
        let sidecar: Sidecar = serde_json::from_slice(&meta)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let blob = fs::read(self.blob_path(fingerprint))?;
        if sidecar.stdout_len > blob.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "blob shorter than sidecar stdout_len",
            ));
        }

        let mut outcome = sidecar.outcome;
        outcome.stdout.bytes = blob[..sidecar.stdout_len].to_vec();
        outcome.stderr.bytes = blob[sidecar.stdout_len..].to_vec();
        Ok(outcome)
    }

    pub fn remove(&self, fingerprint: &Fingerprint) {
        let _ = fs::remove_file(self.blob_path(fingerprint));
        let _ = fs::remove_file(self.meta_path(fingerprint));
    }

    /// All readable entries, corrupt ones skipped with a warning.
    pub fn load_all(&self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        for shard in read_dir_or_empty(&self.root) {
            if !shard.is_dir() {
                continue;
            }
            for path in read_dir_or_empty(&shard) {
                if path.extension().and_then(|ext| ext.to_str()) != Some("meta") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let fingerprint = Fingerprint::from_hex(stem);
                match self.load(&fingerprint) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => {
                        warn!(
                            fingerprint = %fingerprint.short(),
                            "skipping unreadable store entry: {}",
                            err
                        );
                    }
                }
            }
        }
        outcomes
    }
}

fn read_dir_or_empty(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect(),
        Err(_) => Vec::new(),
    }
}

// Appends `.tmp` to the full file name; `with_extension` would map
// `<fp>.bin` and `<fp>.meta` to the same temp path and let concurrent
// writers of one fingerprint interleave.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
