use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::Store;
use crate::cache::error::{StoreError, StoreResult};
use crate::cache::resource::CachedResource;
use crate::http::Headers;

/// Filesystem store: one file per key.
///
/// File names are the hex SHA-256 of the key, so arbitrary URLs map to safe
/// names. Each file is a single JSON metadata line followed by the raw body:
///
/// ```text
/// {"status":200,"headers":[["Content-Type","text/plain"]],"captured_at_ms":...,"stale":false}
/// <body bytes>
/// ```
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so readers never observe a partial entry and the last rename wins.
pub struct DiskStore {
    dir: PathBuf,
    sequence: AtomicU64,
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    status: u16,
    headers: Headers,
    captured_at_ms: u64,
    #[serde(default)]
    stale: bool,
}

impl EntryMeta {
    fn from_resource(resource: &CachedResource) -> Self {
        let captured_at_ms = resource
            .captured_at()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            status: resource.status(),
            headers: resource.headers().clone(),
            captured_at_ms,
            stale: resource.is_stale(),
        }
    }

    fn into_resource(self, body: Bytes) -> CachedResource {
        CachedResource::new(self.status, self.headers, body)
            .with_captured_at(UNIX_EPOCH + Duration::from_millis(self.captured_at_ms))
            .with_stale(self.stale)
    }
}

impl DiskStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
        })
    }

    /// The directory entries live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    async fn write_entry(&self, path: &Path, meta: &EntryMeta, body: &[u8]) -> StoreResult<()> {
        let mut contents = serde_json::to_vec(meta)?;
        contents.push(b'\n');
        contents.extend_from_slice(body);

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{seq}"));
        fs::write(&tmp, &contents).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_entry(&self, key: &str) -> StoreResult<(EntryMeta, Bytes)> {
        let contents = fs::read(self.path_for(key)).await.map_err(|e| not_found(key, e))?;
        let split = contents
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StoreError::Corrupt(format!("{key}: missing metadata line")))?;
        let meta = serde_json::from_slice(&contents[..split])?;
        let body = Bytes::from(contents).slice(split + 1..);
        Ok((meta, body))
    }
}

fn not_found(key: &str, e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_owned())
    } else {
        StoreError::Io(e)
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn store(&self, resource: &CachedResource, keys: &[String]) -> StoreResult<()> {
        let meta = EntryMeta::from_resource(resource);
        for key in keys {
            self.write_entry(&self.path_for(key), &meta, resource.body()).await?;
        }
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StoreResult<CachedResource> {
        let (meta, body) = self.read_entry(key).await?;
        Ok(meta.into_resource(body))
    }

    async fn header_lookup(&self, key: &str) -> StoreResult<Headers> {
        let file = fs::File::open(self.path_for(key))
            .await
            .map_err(|e| not_found(key, e))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line).await?;
        let meta: EntryMeta = serde_json::from_str(line.trim_end())?;
        Ok(meta.headers)
    }

    async fn invalidate(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            let (mut meta, body) = match self.read_entry(key).await {
                Ok(entry) => entry,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            meta.stale = true;
            self.write_entry(&self.path_for(key), &meta, &body).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(status: u16, body: &'static [u8]) -> CachedResource {
        let mut headers = Headers::new();
        headers.insert("X-Cache", "SKIP");
        headers.insert("Content-Type", "application/octet-stream");
        CachedResource::new(status, headers, Bytes::from_static(body))
            .with_captured_at(UNIX_EPOCH + Duration::from_millis(1_700_000_000_123))
    }

    #[tokio::test]
    async fn round_trips_status_headers_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let key = "GET:http://test.com".to_owned();

        store.store(&resource(404, b"line one\nline two\n"), &[key.clone()]).await.unwrap();

        let res = store.retrieve(&key).await.unwrap();
        assert_eq!(res.status(), 404);
        assert_eq!(res.headers().get("X-Cache"), Some("SKIP"));
        assert_eq!(&res.body()[..], b"line one\nline two\n");
        assert_eq!(
            res.captured_at(),
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)
        );
        assert!(!res.is_stale());
    }

    #[tokio::test]
    async fn header_lookup_skips_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.store(&resource(200, b"\x00\xffbinary"), &["k".into()]).await.unwrap();

        let headers = store.header_lookup("k").await.unwrap();
        assert_eq!(headers.get("content-type"), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path().join("nested")).await.unwrap();
        assert!(store.retrieve("absent").await.unwrap_err().is_not_found());
        assert!(store.header_lookup("absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn keys_map_to_hashed_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        let keys = vec!["GET:http://a/?q=1".to_owned(), "GET:http://a/::Accept=*/*:".to_owned()];
        store.store(&resource(200, b"x"), &keys).await.unwrap();

        let mut names = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.len() == 64 && n.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[tokio::test]
    async fn invalidate_persists_stale_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        store.store(&resource(200, b"body"), &["k".into()]).await.unwrap();

        store.invalidate(&["k".into(), "absent".into()]).await.unwrap();

        let reopened = DiskStore::open(dir.path()).await.unwrap();
        let res = reopened.retrieve("k").await.unwrap();
        assert!(res.is_stale());
        assert_eq!(&res.body()[..], b"body");
    }

    #[tokio::test]
    async fn corrupt_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_for("k"), b"no newline here").unwrap();
        assert!(matches!(
            store.retrieve("k").await.unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }
}
