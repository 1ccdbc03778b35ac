//! Raw record batches as each source handed them over, filed per ingestion session and
//! platform so a session's input can be inspected or replayed after the fact.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricedragon_core::RawRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Where a batch came from.
#[derive(Debug, Clone)]
pub struct BatchOrigin {
    pub session_id: String,
    pub platform: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
}

/// On-disk form of one archived batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedRecords {
    pub session_id: String,
    pub platform: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub record_count: usize,
    /// sha256 of the serialized `records` array.
    pub content_hash: String,
    pub records: Vec<RawRecord>,
}

/// What the runner reports for each archived batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedBatch {
    pub session_id: String,
    pub platform: String,
    pub source_id: String,
    pub record_count: usize,
    pub content_hash: String,
    pub relative_path: String,
    pub byte_size: u64,
    /// The same records were already on file for this session and source.
    pub unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct RawBatchArchive {
    root: PathBuf,
}

impl RawBatchArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<session_id>/<platform>/<source_id>.json`
    pub fn batch_relative_path(origin: &BatchOrigin) -> PathBuf {
        PathBuf::from(&origin.session_id)
            .join(&origin.platform)
            .join(format!("{}.json", origin.source_id))
    }

    /// Files one source's records under its session. Writing the same records twice for
    /// a session and source leaves the file alone; different records replace it.
    pub async fn store_batch(
        &self,
        origin: &BatchOrigin,
        records: &[RawRecord],
    ) -> anyhow::Result<ArchivedBatch> {
        let records_json = serde_json::to_vec(records).context("serializing raw records")?;
        let content_hash = sha256_hex(&records_json);
        let relative_path = Self::batch_relative_path(origin);
        let absolute_path = self.root.join(&relative_path);

        let reported = |byte_size, unchanged| ArchivedBatch {
            session_id: origin.session_id.clone(),
            platform: origin.platform.clone(),
            source_id: origin.source_id.clone(),
            record_count: records.len(),
            content_hash: content_hash.clone(),
            relative_path: relative_path.display().to_string(),
            byte_size,
            unchanged,
        };

        if let Some(existing) = self.read_batch(&relative_path).await? {
            if existing.content_hash == content_hash {
                let size = fs::metadata(&absolute_path)
                    .await
                    .with_context(|| format!("reading size of {}", absolute_path.display()))?
                    .len();
                return Ok(reported(size, true));
            }
        }

        let envelope = ArchivedRecords {
            session_id: origin.session_id.clone(),
            platform: origin.platform.clone(),
            source_id: origin.source_id.clone(),
            fetched_at: origin.fetched_at,
            record_count: records.len(),
            content_hash: content_hash.clone(),
            records: records.to_vec(),
        };
        let payload = serde_json::to_vec_pretty(&envelope).context("serializing archived batch")?;

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", origin.source_id, Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(&payload)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(reported(payload.len() as u64, false))
    }

    /// Reads an archived batch back; `None` when nothing is filed at `relative_path`.
    pub async fn read_batch(&self, relative_path: &Path) -> anyhow::Result<Option<ArchivedRecords>> {
        let path = self.root.join(relative_path);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let batch = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing archived batch {}", path.display()))?;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn origin(source_id: &str) -> BatchOrigin {
        BatchOrigin {
            session_id: "3f1c2d7e-session".into(),
            platform: "pchome".into(),
            source_id: source_id.into(),
            fetched_at: DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    fn records(names: &[&str]) -> Vec<RawRecord> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| RawRecord {
                platform: "pchome".into(),
                product_id: format!("A{i}"),
                name: name.to_string(),
                ..RawRecord::default()
            })
            .collect()
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn batches_are_filed_by_session_and_platform() {
        let dir = tempdir().expect("tempdir");
        let archive = RawBatchArchive::new(dir.path());
        let batch = records(&["Apple iPhone 15 128GB 黑色", "ASUS Zenbook 14 OLED 筆電"]);

        let stored = archive
            .store_batch(&origin("pchome-search"), &batch)
            .await
            .expect("store");

        assert_eq!(stored.relative_path, "3f1c2d7e-session/pchome/pchome-search.json");
        assert_eq!(stored.record_count, 2);
        assert_eq!(stored.source_id, "pchome-search");
        assert!(!stored.unchanged);

        let read = archive
            .read_batch(Path::new(&stored.relative_path))
            .await
            .expect("read")
            .expect("filed");
        assert_eq!(read.records, batch);
        assert_eq!(read.record_count, 2);
        assert_eq!(read.content_hash, stored.content_hash);
        assert_eq!(
            read.content_hash,
            sha256_hex(&serde_json::to_vec(&batch).expect("json"))
        );
        let on_disk = std::fs::metadata(dir.path().join(&stored.relative_path)).expect("file");
        assert_eq!(on_disk.len(), stored.byte_size);
    }

    #[tokio::test]
    async fn same_records_are_left_in_place_and_new_ones_replace_them() {
        let dir = tempdir().expect("tempdir");
        let archive = RawBatchArchive::new(dir.path());
        let first = records(&["Apple iPhone 15 128GB 黑色"]);

        let stored = archive.store_batch(&origin("pchome-search"), &first).await.expect("first");
        let again = archive.store_batch(&origin("pchome-search"), &first).await.expect("again");
        assert!(again.unchanged);
        assert_eq!(again.content_hash, stored.content_hash);
        assert_eq!(again.byte_size, stored.byte_size);

        let second = records(&["Apple iPhone 15 128GB 黑色", "Nintendo Switch OLED"]);
        let replaced = archive.store_batch(&origin("pchome-search"), &second).await.expect("replace");
        assert!(!replaced.unchanged);
        assert_eq!(replaced.relative_path, stored.relative_path);
        let read = archive
            .read_batch(Path::new(&replaced.relative_path))
            .await
            .expect("read")
            .expect("filed");
        assert_eq!(read.record_count, 2);

        assert!(archive
            .read_batch(Path::new("3f1c2d7e-session/pchome/other.json"))
            .await
            .expect("read")
            .is_none());
    }
}
