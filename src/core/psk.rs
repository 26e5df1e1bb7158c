//! Pre-shared-key credential store
//!
//! Durable registry, per project, of controller identities and their
//! secrets. Secret material lives in one file per identity
//! (`psk/<ID>.secret`, content `<ID>:<base64 secret>`); advisory
//! metadata lives in `psk/management.json` as an array of rows
//! `[ID, Description, LastKnownURI, LastConnectTimestamp]`.
//!
//! Membership is decided by the secret files alone: a metadata row
//! without a secret file is dropped on load, a secret file without a
//! row appears as a fresh undescribed identity. Import merges an
//! exported archive with an explicit conflict-resolution protocol and
//! writes nothing at all when cancelled.
//!
//! Concurrent writers against the same project path must be serialized
//! by the caller; this layer only guarantees atomic file replacement.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Secret file suffix
const SECRET_SUFFIX: &str = ".secret";

/// Metadata file name inside the psk directory and export archives
const MANAGEMENT_FILE: &str = "management.json";

/// Credential store errors
#[derive(Error, Debug)]
pub enum PskError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be parsed or written
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Export/import archive error
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Secret file did not have the `<ID>:<secret>` form
    #[error("malformed secret file for {0}")]
    MalformedSecret(String),

    /// No secret file exists for the ID
    #[error("unknown credential ID: {0}")]
    UnknownId(String),
}

/// One controller identity as seen by the front-end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskRecord {
    /// Opaque identifier, unique within a project's store
    pub id: String,
    /// User-editable description
    pub description: String,
    /// URI the controller was last reached at
    pub last_uri: Option<String>,
    /// Timestamp of the last successful connection
    pub last_connect: Option<String>,
}

impl PskRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            last_uri: None,
            last_connect: None,
        }
    }
}

/// Fixed-column metadata row: `[ID, Description, URI, LastConnect]`
type Row = (String, String, Option<String>, Option<String>);

fn to_row(record: &PskRecord) -> Row {
    (
        record.id.clone(),
        record.description.clone(),
        record.last_uri.clone(),
        record.last_connect.clone(),
    )
}

fn from_row(row: Row) -> PskRecord {
    PskRecord {
        id: row.0,
        description: row.1,
        last_uri: row.2,
        last_connect: row.3,
    }
}

/// Resolver verdict for one import conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Overwrite the local record and secret with the imported one
    Replace,
    /// As `Replace`, and reuse for every later conflict in this batch
    ReplaceAll,
    /// Keep the local record and secret untouched
    Keep,
    /// As `Keep`, and reuse for every later conflict in this batch
    KeepAll,
    /// Abort the whole import with no on-disk change
    Cancel,
}

/// Result of an import batch
#[derive(Debug)]
pub enum ImportOutcome {
    /// Merge applied; the merged record list after saving
    Applied(Vec<PskRecord>),
    /// Resolver cancelled; nothing was written
    Cancelled,
}

/// Per-project credential store
pub struct PskStore {
    root: PathBuf,
}

impl PskStore {
    /// Open the store of a project directory (creates nothing yet)
    pub fn new<P: AsRef<Path>>(project_dir: P) -> Self {
        Self {
            root: project_dir.as_ref().to_path_buf(),
        }
    }

    fn psk_dir(&self) -> PathBuf {
        self.root.join("psk")
    }

    fn management_path(&self) -> PathBuf {
        self.psk_dir().join(MANAGEMENT_FILE)
    }

    /// Path of the secret file for an ID
    pub fn secret_path(&self, id: &str) -> PathBuf {
        self.psk_dir().join(format!("{id}{SECRET_SUFFIX}"))
    }

    fn ensure_dir(&self) -> Result<(), PskError> {
        fs::create_dir_all(self.psk_dir())?;
        Ok(())
    }

    /// Metadata rows as stored, without secret-file filtering
    fn load_raw(&self) -> Result<Vec<PskRecord>, PskError> {
        let path = self.management_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let rows: Vec<Row> = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(rows.into_iter().map(from_row).collect())
    }

    /// IDs of all secret files present on disk, sorted
    fn secret_ids(&self) -> Result<Vec<String>, PskError> {
        let dir = self.psk_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(SECRET_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// The valid records: metadata joined against present secret files
    ///
    /// Rows without a secret file are dropped; secret files without a
    /// row become fresh undescribed records.
    ///
    /// # Errors
    ///
    /// Fails only on I/O or malformed metadata.
    pub fn load(&self) -> Result<Vec<PskRecord>, PskError> {
        let rows = self.load_raw()?;
        Ok(join_records(&self.secret_ids()?, rows))
    }

    /// Rewrite the metadata file atomically
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization errors.
    pub fn save(&self, records: &[PskRecord]) -> Result<(), PskError> {
        self.ensure_dir()?;
        let rows: Vec<Row> = records.iter().map(to_row).collect();
        write_atomic(&self.management_path(), &serde_json::to_vec(&rows)?)?;
        Ok(())
    }

    /// Write (or overwrite) an identity's secret, then its metadata
    ///
    /// The secret file lands before the metadata is touched, so a crash
    /// in between leaves at worst an orphaned secret file, never
    /// metadata pointing at a missing secret. An existing description
    /// is preserved.
    ///
    /// # Errors
    ///
    /// Fails on I/O or metadata errors.
    pub fn upsert(&self, id: &str, secret: &str, uri: &str) -> Result<(), PskError> {
        self.ensure_dir()?;
        let content = format!("{id}:{}", BASE64.encode(secret));
        write_atomic(&self.secret_path(id), content.as_bytes())?;

        let mut records = self.load_raw()?;
        let idx = match records.iter().position(|r| r.id == id) {
            Some(i) => i,
            None => {
                records.push(PskRecord::new(id));
                records.len() - 1
            }
        };
        records[idx].last_uri = Some(uri.to_string());
        records[idx].last_connect = Some(timestamp());
        self.save(&records)?;
        debug!(id, uri, "credential recorded");
        Ok(())
    }

    /// Remove an identity's secret file
    ///
    /// Metadata is left in place; the next [`PskStore::load`] drops the
    /// now-unmatched row.
    ///
    /// # Errors
    ///
    /// [`PskError::UnknownId`] when no secret file exists for the ID.
    pub fn delete(&self, id: &str) -> Result<(), PskError> {
        match fs::remove_file(self.secret_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PskError::UnknownId(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode an identity's secret
    ///
    /// # Errors
    ///
    /// [`PskError::UnknownId`] when no secret file exists,
    /// [`PskError::MalformedSecret`] when the file content is not of
    /// the `<ID>:<base64>` form.
    pub fn secret(&self, id: &str) -> Result<String, PskError> {
        let path = self.secret_path(id);
        if !path.exists() {
            return Err(PskError::UnknownId(id.to_string()));
        }
        let content = fs::read_to_string(path)?;
        let encoded = content
            .trim_end_matches(['\r', '\n'])
            .split_once(':')
            .map(|(_, secret)| secret)
            .ok_or_else(|| PskError::MalformedSecret(id.to_string()))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| PskError::MalformedSecret(id.to_string()))?;
        String::from_utf8(bytes).map_err(|_| PskError::MalformedSecret(id.to_string()))
    }

    /// Bundle the metadata file and selected secret files into a zip
    ///
    /// # Errors
    ///
    /// [`PskError::UnknownId`] when a selected ID has no secret file;
    /// otherwise I/O or archive errors.
    pub fn export(&self, ids: &[String], archive: &Path) -> Result<(), PskError> {
        let file = File::create(archive)?;
        let mut zf = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let management = match fs::read(self.management_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => b"[]".to_vec(),
            Err(e) => return Err(e.into()),
        };
        zf.start_file(MANAGEMENT_FILE, options)?;
        zf.write_all(&management)?;

        for id in ids {
            let path = self.secret_path(id);
            if !path.exists() {
                return Err(PskError::UnknownId(id.clone()));
            }
            zf.start_file(format!("{id}{SECRET_SUFFIX}"), options)?;
            zf.write_all(&fs::read(path)?)?;
        }
        zf.finish()?;
        Ok(())
    }

    /// Merge an exported archive into this store
    ///
    /// Archive records are filtered by secret-file presence exactly
    /// like [`PskStore::load`]. New IDs are added unconditionally (with
    /// their secrets). For each conflicting ID the resolver is asked,
    /// unless an earlier `ReplaceAll`/`KeepAll` decision in this batch
    /// is still in force. `Cancel` aborts the whole import: nothing is
    /// written. All secret extraction and the metadata rewrite happen
    /// only after the complete batch resolved.
    ///
    /// # Errors
    ///
    /// Fails on I/O, archive, or metadata errors; a cancelled merge is
    /// not an error but [`ImportOutcome::Cancelled`].
    pub fn import(
        &self,
        archive: &Path,
        resolver: &mut dyn FnMut(&PskRecord, &PskRecord) -> MergeDecision,
    ) -> Result<ImportOutcome, PskError> {
        let file = File::open(archive)?;
        let mut zf = zip::ZipArchive::new(file)?;

        let names: Vec<String> = zf.file_names().map(String::from).collect();
        let rows: Vec<Row> = {
            let mut entry = zf.by_name(MANAGEMENT_FILE)?;
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            serde_json::from_str(&raw)?
        };

        let mut archive_ids: Vec<String> = names
            .iter()
            .filter_map(|n| n.strip_suffix(SECRET_SUFFIX))
            .map(String::from)
            .collect();
        archive_ids.sort();
        let imported = join_records(&archive_ids, rows.into_iter().map(from_row).collect());

        let mut merged = self.load()?;
        let index: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        let mut to_extract: Vec<String> = Vec::new();
        let mut sticky: Option<MergeDecision> = None;

        for record in imported {
            match index.get(&record.id) {
                None => {
                    to_extract.push(record.id.clone());
                    merged.push(record);
                }
                Some(&i) => {
                    let decision = match sticky {
                        Some(d) => d,
                        None => {
                            let d = resolver(&merged[i], &record);
                            if matches!(d, MergeDecision::ReplaceAll | MergeDecision::KeepAll) {
                                sticky = Some(d);
                            }
                            d
                        }
                    };
                    match decision {
                        MergeDecision::Cancel => return Ok(ImportOutcome::Cancelled),
                        MergeDecision::Replace | MergeDecision::ReplaceAll => {
                            to_extract.push(record.id.clone());
                            merged[i] = record;
                        }
                        MergeDecision::Keep | MergeDecision::KeepAll => {}
                    }
                }
            }
        }

        // Batch fully resolved: only now touch the disk.
        self.ensure_dir()?;
        for id in &to_extract {
            let mut entry = zf.by_name(&format!("{id}{SECRET_SUFFIX}"))?;
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            write_atomic(&self.secret_path(id), &bytes)?;
        }
        self.save(&merged)?;
        Ok(ImportOutcome::Applied(merged))
    }
}

/// Join metadata rows against the authoritative secret-ID list
fn join_records(secret_ids: &[String], rows: Vec<PskRecord>) -> Vec<PskRecord> {
    let mut by_id: HashMap<String, PskRecord> =
        rows.into_iter().map(|r| (r.id.clone(), r)).collect();
    secret_ids
        .iter()
        .map(|id| by_id.remove(id).unwrap_or_else(|| PskRecord::new(id)))
        .collect()
}

/// Replace a file's content without a window of partial content
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn timestamp() -> String {
    chrono::Local::now().format("%y/%m/%d-%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_upsert_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = PskStore::new(dir.path());
        store
            .upsert("ctrl1", "s3cr3t", "tcp://10.0.0.5:61131")
            .unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "ctrl1");
        assert_eq!(records[0].description, "");
        assert_eq!(records[0].last_uri.as_deref(), Some("tcp://10.0.0.5:61131"));
        assert!(records[0].last_connect.is_some());

        let content = fs::read_to_string(store.secret_path("ctrl1")).unwrap();
        assert!(content.starts_with("ctrl1:"));
        assert_eq!(store.secret("ctrl1").unwrap(), "s3cr3t");
    }

    #[test]
    fn test_upsert_preserves_description() {
        let dir = tempdir().unwrap();
        let store = PskStore::new(dir.path());
        store.upsert("ctrl1", "one", "tcp://a:1").unwrap();

        let mut records = store.load().unwrap();
        records[0].description = "lab bench".into();
        store.save(&records).unwrap();

        store.upsert("ctrl1", "two", "tcp://b:2").unwrap();
        let records = store.load().unwrap();
        assert_eq!(records[0].description, "lab bench");
        assert_eq!(records[0].last_uri.as_deref(), Some("tcp://b:2"));
        assert_eq!(store.secret("ctrl1").unwrap(), "two");
    }

    #[test]
    fn test_orphan_secret_appears_as_default_record() {
        let dir = tempdir().unwrap();
        let store = PskStore::new(dir.path());
        fs::create_dir_all(dir.path().join("psk")).unwrap();
        fs::write(dir.path().join("psk/orphan.secret"), "orphan:c2Vj").unwrap();

        let records = store.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], PskRecord::new("orphan"));
    }

    #[test]
    fn test_metadata_without_secret_is_dropped() {
        let dir = tempdir().unwrap();
        let store = PskStore::new(dir.path());
        store.upsert("kept", "s", "tcp://a:1").unwrap();
        store.upsert("gone", "s", "tcp://b:2").unwrap();

        store.delete("gone").unwrap();
        let records = store.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "kept");

        // metadata file still carries the stale row until the next save
        assert!(fs::read_to_string(store.management_path())
            .unwrap()
            .contains("gone"));
    }

    #[test]
    fn test_delete_unknown_id() {
        let dir = tempdir().unwrap();
        let store = PskStore::new(dir.path());
        assert!(matches!(
            store.delete("nobody"),
            Err(PskError::UnknownId(_))
        ));
    }

    #[test]
    fn test_malformed_secret_file() {
        let dir = tempdir().unwrap();
        let store = PskStore::new(dir.path());
        fs::create_dir_all(dir.path().join("psk")).unwrap();
        fs::write(dir.path().join("psk/bad.secret"), "no separator here").unwrap();
        assert!(matches!(
            store.secret("bad"),
            Err(PskError::MalformedSecret(_))
        ));
    }
}
