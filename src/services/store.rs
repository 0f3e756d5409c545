use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors worth retrying. Missing objects and malformed keys are final.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Io(e) => !matches!(
                e.kind(),
                ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput
            ),
            StoreError::NotFound { .. } | StoreError::InvalidKey(_) => false,
        }
    }
}

/// Object storage as seen by the planner and executor.
pub trait ObjectStore: Send + Sync {
    /// Every key under `prefix`, recursively, in lexicographic order.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
    fn put(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str)
        -> Result<(), StoreError>;
    /// Deleting a missing object is not an error.
    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError>;
    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, StoreError>;
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// Store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.content_type.clone())
    }

    fn poisoned() -> StoreError {
        StoreError::Transient("memory store lock poisoned".to_string())
    }
}

impl ObjectStore for MemoryStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.contains_key(&(bucket.to_string(), key.to_string())))
    }

    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, StoreError> {
        Ok(format!("memory://{}/{}?expires={}", bucket, key, ttl.as_secs()))
    }
}

const PARTIAL_PREFIX: &str = ".sortrs-partial-";

/// Store backed by a directory: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => Err(StoreError::InvalidKey(format!("bucket {:?}", bucket))),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let mut path = self.bucket_dir(bucket)?;
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    fn map_not_found(e: std::io::Error, bucket: &str, key: &str) -> StoreError {
        if e.kind() == ErrorKind::NotFound {
            StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            StoreError::Io(e)
        }
    }
}

impl ObjectStore for LocalStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                StoreError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(ErrorKind::Other, "directory walk failed")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| Self::map_not_found(e, bucket, key))
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)?;

        // Write beside the target and rename so readers never see half an object.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = parent.join(format!("{}{}", PARTIAL_PREFIX, file_name));
        if let Err(e) = fs::write(&partial, bytes).and_then(|()| fs::rename(&partial, &path)) {
            let _ = fs::remove_file(&partial);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        // Anything already at the path occupies the key; only NotFound means free.
        match fs::metadata(self.object_path(bucket, key)?) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn presign(&self, bucket: &str, key: &str, _ttl: Duration) -> Result<String, StoreError> {
        let path = self.object_path(bucket, key)?;
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(format!("file://{}", absolute.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Wraps a store and retries transient failures a bounded number of times.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn run<T>(
        &self,
        op: &str,
        key: &str,
        f: impl Fn() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    log::warn!(
                        "{} {} failed (attempt {}/{}): {}; retrying",
                        op,
                        key,
                        attempt,
                        attempts,
                        e
                    );
                    thread::sleep(self.policy.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.run("list", prefix, || self.inner.list(bucket, prefix))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.run("get", key, || self.inner.get(bucket, key))
    }

    fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.run("put", key, || self.inner.put(bucket, key, bytes, content_type))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.run("delete", key, || self.inner.delete(bucket, key))
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        self.run("exists", key, || self.inner.exists(bucket, key))
    }

    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, StoreError> {
        self.run("presign", key, || self.inner.presign(bucket, key, ttl))
    }
}

/// Turn a user-supplied reference (plain key, `/key`, or an `http(s)` URL into
/// the bucket) into an object key. Path-style URLs have the bucket segment stripped.
pub fn key_from_input(input: &str, bucket: &str) -> Result<String, StoreError> {
    let input = input.trim();
    if !(input.starts_with("http://") || input.starts_with("https://")) {
        return Ok(input.trim_start_matches('/').to_string());
    }

    let url = Url::parse(input).map_err(|e| StoreError::InvalidKey(format!("{}: {}", input, e)))?;
    let path = url.path().trim_start_matches('/');
    let key = match path.strip_prefix(bucket).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) if !bucket.is_empty() => rest,
        _ => path,
    };
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails the first `failures` calls to `get` with a transient error.
    struct Flaky {
        inner: MemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl ObjectStore for Flaky {
        fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(bucket, prefix)
        }
        fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(StoreError::Transient("connection reset".to_string()));
            }
            self.inner.get(bucket, key)
        }
        fn put(&self, bucket: &str, key: &str, bytes: &[u8], ct: &str) -> Result<(), StoreError> {
            self.inner.put(bucket, key, bytes, ct)
        }
        fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
            self.inner.delete(bucket, key)
        }
        fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(bucket, key)
        }
        fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, StoreError> {
            self.inner.presign(bucket, key, ttl)
        }
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.put("b", "src/a.jpg", b"abc", "image/jpeg").unwrap();
        store.put("b", "src/sub/b.jpg", b"def", "image/jpeg").unwrap();
        store.put("other", "src/c.jpg", b"ghi", "image/jpeg").unwrap();

        assert_eq!(store.get("b", "src/a.jpg").unwrap(), b"abc");
        assert_eq!(store.list("b", "src/").unwrap(), vec!["src/a.jpg", "src/sub/b.jpg"]);
        assert!(store.exists("b", "src/a.jpg").unwrap());
        assert_eq!(store.content_type("b", "src/a.jpg").as_deref(), Some("image/jpeg"));

        store.delete("b", "src/a.jpg").unwrap();
        store.delete("b", "src/a.jpg").unwrap();
        assert!(!store.exists("b", "src/a.jpg").unwrap());
        assert!(matches!(store.get("b", "src/a.jpg"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let store = MemoryStore::new();
        for key in ["", "/abs.jpg", "dir/", "a/../b.jpg", "a//b.jpg"] {
            assert!(matches!(
                store.put("b", key, b"x", "image/jpeg"),
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_local_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());

        store.put("photos", "src/a.jpg", b"one", "image/jpeg").unwrap();
        store.put("photos", "src/deep/b.png", b"two", "image/png").unwrap();

        assert!(temp_dir.path().join("photos/src/a.jpg").is_file());
        assert_eq!(store.get("photos", "src/a.jpg").unwrap(), b"one");
        assert_eq!(
            store.list("photos", "src/").unwrap(),
            vec!["src/a.jpg", "src/deep/b.png"]
        );
        assert_eq!(store.list("missing", "").unwrap(), Vec::<String>::new());

        store.delete("photos", "src/a.jpg").unwrap();
        assert!(!store.exists("photos", "src/a.jpg").unwrap());
        assert!(matches!(
            store.get("photos", "src/a.jpg"),
            Err(StoreError::NotFound { .. })
        ));

        let url = store.presign("photos", "src/deep/b.png", Duration::from_secs(60)).unwrap();
        assert!(url.starts_with("file://"));
    }

    #[test]
    fn test_local_store_rejects_bucket_escape() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        assert!(matches!(store.get("..", "a.jpg"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.get("a/b", "a.jpg"), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_local_exists_never_guesses_free() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        store.put("photos", "src/a.jpg", b"one", "image/jpeg").unwrap();

        assert!(store.exists("photos", "src/a.jpg").unwrap());
        assert!(!store.exists("photos", "src/b.jpg").unwrap());
        // A directory occupies the key even though it is not an object.
        assert!(store.exists("photos", "src").unwrap());
        // Stat through a regular file fails; that is an error, not "free".
        assert!(matches!(
            store.exists("photos", "src/a.jpg/inner.jpg"),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_local_failed_put_leaves_no_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        let folder = temp_dir.path().join("photos/src");
        fs::create_dir_all(folder.join("taken.jpg")).unwrap();

        assert!(store.put("photos", "src/taken.jpg", b"data", "image/jpeg").is_err());

        let leftovers: Vec<_> = fs::read_dir(&folder)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(PARTIAL_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
        assert!(folder.join("taken.jpg").is_dir());
    }

    #[test]
    fn test_retry_recovers_from_transient_errors() {
        let inner = MemoryStore::new();
        inner.put("b", "k.jpg", b"data", "image/jpeg").unwrap();
        let store = RetryingStore::new(
            Flaky {
                inner,
                failures: 2,
                calls: AtomicU32::new(0),
            },
            quick_policy(3),
        );

        assert_eq!(store.get("b", "k.jpg").unwrap(), b"data");
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let store = RetryingStore::new(
            Flaky {
                inner: MemoryStore::new(),
                failures: 10,
                calls: AtomicU32::new(0),
            },
            quick_policy(3),
        );

        assert!(matches!(store.get("b", "k.jpg"), Err(StoreError::Transient(_))));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_not_found_is_not_retried() {
        let store = RetryingStore::new(
            Flaky {
                inner: MemoryStore::new(),
                failures: 0,
                calls: AtomicU32::new(0),
            },
            quick_policy(5),
        );

        assert!(matches!(store.get("b", "k.jpg"), Err(StoreError::NotFound { .. })));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_from_input() {
        assert_eq!(key_from_input("/images/a.jpg", "bkt").unwrap(), "images/a.jpg");
        assert_eq!(
            key_from_input("https://cdn.example.com/bkt/images/a.jpg?x=1", "bkt").unwrap(),
            "images/a.jpg"
        );
        assert_eq!(
            key_from_input("https://bkt.example.com/images/a.jpg", "bkt").unwrap(),
            "images/a.jpg"
        );
        assert_eq!(
            key_from_input("http://localhost:9000/bkt/a.jpg#frag", "bkt").unwrap(),
            "a.jpg"
        );
        assert_eq!(
            key_from_input("https://cdn.example.com/bktx/a.jpg", "bkt").unwrap(),
            "bktx/a.jpg"
        );
        assert!(matches!(
            key_from_input("https://", "bkt"),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
