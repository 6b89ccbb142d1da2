//! File-backed checkpoint storage
//!
//! One JSON file per workflow id under a root directory. Writes go to a uniquely
//! named temporary file in the same directory, are flushed with `sync_all`, and
//! then renamed over the target, so a reader (or a process that restarts after a
//! crash) sees either the previous checkpoint or the new one, never a torn file.
//!
//! Workflow ids are mapped to file names by escaping every byte outside
//! `[A-Za-z0-9_.-]` as `~XX`. The mapping is reversible, which is how
//! [`CheckpointStore::list`] recovers ids from the directory listing.
//!
//! Escaping can push a name past the 255 byte limit of common file systems, so
//! an id whose escaped form exceeds 200 bytes is stored under a prefix of that
//! form followed by `~~` and the SHA-256 of the id. `list` reads such files
//! back to learn the id.

use crate::{
    checkpoint::Checkpoint,
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{ensure_matches, ensure_version, CheckpointStore},
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const EXTENSION: &str = "json";
const TMP_PREFIX: &str = ".tmp-";

/// Longest escaped id used verbatim as a file stem
const MAX_STEM: usize = 200;
/// Escaped bytes kept in front of the hash of a long id
const HASHED_PREFIX: usize = 120;
/// Separates prefix and hash; never produced by [`encode_id`]
const HASH_MARKER: &str = "~~";

/// Durable checkpoint store writing one file per workflow
#[derive(Debug, Clone)]
pub struct FileCheckpointStore<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
}

impl FileCheckpointStore<JsonSerializer> {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_serializer(root, JsonSerializer::pretty()).await
    }
}

impl<S: SerializerProtocol> FileCheckpointStore<S> {
    /// Open a store with a custom serializer
    pub async fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Result<Self> {
        let root = root.into();
        if let Ok(meta) = fs::metadata(&root).await {
            if !meta.is_dir() {
                return Err(CheckpointError::Storage(format!(
                    "{} exists and is not a directory",
                    root.display()
                )));
            }
        }
        fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "Opened file checkpoint store");
        Ok(Self { root, serializer })
    }

    /// Directory holding the checkpoint files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file that holds the checkpoint of `workflow_id`
    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", file_stem(workflow_id), EXTENSION))
    }

    /// Id stored in a hashed file, `None` if the file is gone or unreadable
    async fn stored_id(&self, path: &Path) -> Option<String> {
        let bytes = fs::read(path).await.ok()?;
        match self.serializer.loads::<Checkpoint>(&bytes) {
            Ok(checkpoint) => Some(checkpoint.workflow_id),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint file");
                None
            }
        }
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self
            .root
            .join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, target).await
        }
        .await;

        if let Err(e) = written {
            // best effort, the temp file is never read
            let _ = fs::remove_file(&tmp).await;
            return Err(CheckpointError::Io(e));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointStore for FileCheckpointStore<S> {
    async fn save(&self, workflow_id: &str, checkpoint: Checkpoint) -> Result<()> {
        ensure_matches(workflow_id, &checkpoint)?;
        let bytes = self.serializer.dumps(&checkpoint)?;
        let path = self.path_for(workflow_id);
        self.write_atomic(&path, &bytes).await?;
        tracing::trace!(
            workflow_id = %workflow_id,
            step = checkpoint.step,
            bytes = bytes.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(workflow_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = self.serializer.loads(&bytes)?;
        ensure_version(&checkpoint)?;
        if checkpoint.workflow_id != workflow_id {
            return Err(CheckpointError::Invalid(format!(
                "file {} holds workflow '{}'",
                path.display(),
                checkpoint.workflow_id
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn clear(&self, workflow_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(workflow_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", EXTENSION)) else {
                continue;
            };
            let id = if stem.contains(HASH_MARKER) {
                self.stored_id(&entry.path()).await
            } else {
                decode_id(stem)
            };
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, workflow_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(workflow_id)).await?)
    }
}

fn is_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.')
}

/// Map a workflow id to a file stem
pub(crate) fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        // a leading dot would hide the file and collide with temp files
        if is_safe(byte) && !(i == 0 && byte == b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("~{:02X}", byte));
        }
    }
    out
}

/// File stem of a workflow id: the escaped id, or a prefix and hash when too long
pub(crate) fn file_stem(id: &str) -> String {
    let encoded = encode_id(id);
    if encoded.len() <= MAX_STEM {
        return encoded;
    }
    // cut between escapes, never inside one
    let bytes = encoded.as_bytes();
    let mut end = 0;
    while end < bytes.len() {
        let unit = if bytes[end] == b'~' { 3 } else { 1 };
        if end + unit > HASHED_PREFIX {
            break;
        }
        end += unit;
    }
    format!(
        "{}{}{:x}",
        &encoded[..end],
        HASH_MARKER,
        Sha256::digest(id.as_bytes())
    )
}

/// Inverse of [`encode_id`]; `None` for names this store did not write
pub(crate) fn decode_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'~' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, FileCheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("checkpoints"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (_dir, store) = store().await;
        let cp = Checkpoint::new("order-1", 4, json!({"fields": {"ok": true}}));
        store.save("order-1", cp.clone()).await.unwrap();

        let loaded = store.load("order-1").await.unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn test_root_must_be_a_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, "x").unwrap();
        let result = FileCheckpointStore::open(&file).await;
        assert!(matches!(result, Err(CheckpointError::Storage(_))));
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let (_dir, store) = store().await;
        assert!(store.load("ghost").await.unwrap().is_none());
        assert!(!store.exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store
                .save("w", Checkpoint::new("w", 7, json!({"a": 1})))
                .await
                .unwrap();
        }
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load("w").await.unwrap().unwrap().step, 7);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let (_dir, store) = store().await;
        for step in 0..5 {
            store
                .save("w", Checkpoint::new("w", step, json!({})))
                .await
                .unwrap();
        }
        let mut entries = std::fs::read_dir(store.root()).unwrap();
        let names: Vec<_> = entries
            .by_ref()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["w.json".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (_dir, store) = store().await;
        store.save("w", Checkpoint::new("w", 0, json!({}))).await.unwrap();
        store.clear("w").await.unwrap();
        store.clear("w").await.unwrap();
        assert!(store.load("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_decodes_ids() {
        let (_dir, store) = store().await;
        for id in ["orders/42", "b", ".hidden", "naïve id"] {
            store.save(id, Checkpoint::new(id, 0, json!({}))).await.unwrap();
        }
        std::fs::write(store.root().join("notes.txt"), b"ignored").unwrap();

        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec![".hidden", "b", "naïve id", "orders/42"]);
    }

    #[tokio::test]
    async fn test_version_mismatch_on_load() {
        let (_dir, store) = store().await;
        let mut cp = Checkpoint::new("w", 0, json!({}));
        cp.v = 42;
        std::fs::write(store.path_for("w"), serde_json::to_vec(&cp).unwrap()).unwrap();

        let result = store.load("w").await;
        assert!(matches!(
            result,
            Err(CheckpointError::VersionMismatch { found: 42, .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_serialization_error() {
        let (_dir, store) = store().await;
        std::fs::write(store.path_for("w"), b"{broken").unwrap();
        assert!(matches!(
            store.load("w").await,
            Err(CheckpointError::Serialization(_))
        ));
    }

    #[test]
    fn test_encode_escapes_unsafe_bytes() {
        assert_eq!(encode_id("order-1_v2.draft"), "order-1_v2.draft");
        assert_eq!(encode_id("a/b"), "a~2Fb");
        assert_eq!(encode_id(".x"), "~2Ex");
        assert_eq!(encode_id("a~b"), "a~7Eb");
    }

    async fn assert_long_id_lifecycle(id: &str) {
        let (_dir, store) = store().await;
        store.save(id, Checkpoint::new(id, 3, json!({}))).await.unwrap();

        let name = store.path_for(id).file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.len() <= 255, "file name of {} bytes", name.len());
        assert!(name.contains(HASH_MARKER));

        assert_eq!(store.load(id).await.unwrap().unwrap().step, 3);
        assert!(store.exists(id).await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec![id.to_string()]);
        store.clear(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_ascii_id_gets_bounded_file_name() {
        assert_long_id_lifecycle(&"a".repeat(300)).await;
    }

    #[tokio::test]
    async fn test_long_cyrillic_id_gets_bounded_file_name() {
        // every letter escapes to six bytes
        assert_long_id_lifecycle(&"заказ".repeat(10)).await;
    }

    #[tokio::test]
    async fn test_long_ids_sharing_a_prefix_stay_apart() {
        let (_dir, store) = store().await;
        let first = format!("{}-1", "x".repeat(250));
        let second = format!("{}-2", "x".repeat(250));
        store.save(&first, Checkpoint::new(&first, 1, json!({}))).await.unwrap();
        store.save(&second, Checkpoint::new(&second, 2, json!({}))).await.unwrap();

        assert_ne!(store.path_for(&first), store.path_for(&second));
        assert_eq!(store.load(&first).await.unwrap().unwrap().step, 1);
        assert_eq!(store.load(&second).await.unwrap().unwrap().step, 2);
        assert_eq!(store.list().await.unwrap(), vec![first, second]);
    }

    #[test]
    fn test_hashed_stem_never_splits_an_escape() {
        let stem = file_stem(&"é".repeat(100));
        let (prefix, hash) = stem.split_once(HASH_MARKER).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(prefix.len() % 3, 0);
        assert!(decode_id(prefix).is_some());
        assert_eq!(file_stem("short"), "short");
    }

    #[test]
    fn test_decode_rejects_bad_escapes() {
        assert_eq!(decode_id("a~2"), None);
        assert_eq!(decode_id("a~ZZ"), None);
    }

    proptest! {
        #[test]
        fn prop_encode_decode_inverse(id in "\\PC{0,24}") {
            let encoded = encode_id(&id);
            prop_assert!(encoded.bytes().all(|b| is_safe(b) || b == b'~'));
            prop_assert!(!encoded.starts_with('.'));
            prop_assert_eq!(decode_id(&encoded), Some(id));
        }
    }
}
