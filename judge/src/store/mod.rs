//! Content-addressed blob storage shared by every judging component.
//!
//! Blobs are immutable byte sequences keyed by the hex SHA-1 digest of their
//! content. Writes stream into a uniquely named file under `tmp/` and are
//! published with an atomic rename into `files/`, so concurrent writers --
//! even in different processes -- never observe a partial blob, and identical
//! content deduplicates to a single file.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use err_derive::Error;
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

static DIGEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{40}$").unwrap());

/// Hex SHA-1 digest naming a blob in a [`FileStore`].
///
/// Parsing enforces the 40-lowercase-hex grammar, so a constructed value is
/// always safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Digest, StoreError> {
        if DIGEST.is_match(s) {
            Ok(Digest(s.to_owned()))
        } else {
            Err(StoreError::MalformedDigest(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Digest, StoreError> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> String {
        digest.0
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(display = "Malformed digest: {:?}", _0)]
    MalformedDigest(String),

    #[error(display = "No blob with digest {}", _0)]
    NotFound(Digest),

    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] io::Error),
}

/// An on-disk blob store rooted at one directory, with `files/` holding
/// published blobs and `tmp/` holding in-progress write sessions.
#[derive(Debug, Clone)]
pub struct FileStore {
    files_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> io::Result<FileStore> {
        let root = root.as_ref();
        let files_dir = root.join("files");
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&files_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(FileStore { files_dir, tmp_dir })
    }

    /// Open a new write session.
    pub fn save_session(&self) -> io::Result<FileSave> {
        FileSave::new(self)
    }

    /// Store a whole in-memory blob.
    pub fn save(&self, data: &[u8]) -> Result<Digest, StoreError> {
        let mut session = self.save_session()?;
        session.write(data)?;
        Ok(session.finalize()?)
    }

    /// Path a published blob lives at, e.g. for hard-linking into a sandbox.
    /// The blob is not checked for existence.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.files_dir.join(digest.as_str())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.path_for(digest).is_file()
    }

    pub fn open(&self, digest: &Digest) -> Result<File, StoreError> {
        File::open(self.path_for(digest)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(digest.clone())
            } else {
                StoreError::Io(e)
            }
        })
    }

    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        fs::read(self.path_for(digest)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(digest.clone())
            } else {
                StoreError::Io(e)
            }
        })
    }
}

/// An in-progress write into a [`FileStore`].
///
/// Bytes are hashed incrementally as they are written. [`FileSave::finalize`]
/// publishes the blob under its digest; since it consumes the session, a
/// second finalize is unrepresentable. A session that is dropped instead
/// leaves nothing behind.
pub struct FileSave {
    hasher: Sha1,
    file: File,
    tmp_path: PathBuf,
    files_dir: PathBuf,
    published: bool,
}

impl FileSave {
    fn new(store: &FileStore) -> io::Result<FileSave> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let tmp_path = store.tmp_dir.join(format!("save_{}", suffix));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        Ok(FileSave {
            hasher: Sha1::new(),
            file,
            tmp_path,
            files_dir: store.files_dir.clone(),
            published: false,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.hasher.update(data);
        self.file.write_all(data)
    }

    /// Close the session, publish the blob under its digest and return it.
    pub fn finalize(mut self) -> io::Result<Digest> {
        self.file.flush()?;
        let digest = Digest(hex::encode(self.hasher.finalize_reset()));
        fs::rename(&self.tmp_path, self.files_dir.join(digest.as_str()))?;
        self.published = true;
        Ok(digest)
    }
}

impl Drop for FileSave {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                log::error!("{:?}: {}", self.tmp_path, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    fn temp_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn digest_is_deterministic() {
        let (_dir, store) = temp_store();
        let first = store.save(b"hello").unwrap();
        let second = store.save(b"hello").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), HELLO_SHA1);
        assert!(store.exists(&first));
    }

    #[test]
    fn distinct_content_distinct_digest() {
        let (_dir, store) = temp_store();
        let a = store.save(b"hello").unwrap();
        let b = store.save(b"hello!").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn chunked_writes_hash_like_whole_writes() {
        let (_dir, store) = temp_store();
        let mut session = store.save_session().unwrap();
        session.write(b"he").unwrap();
        session.write(b"l").unwrap();
        session.write(b"lo").unwrap();
        let digest = session.finalize().unwrap();
        assert_eq!(digest.as_str(), HELLO_SHA1);
        assert_eq!(store.read(&digest).unwrap(), b"hello");
    }

    #[test]
    fn malformed_digests_are_rejected() {
        for bad in [
            "",
            "zzz",
            "AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D",
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434",
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434da",
            "../../../../etc/passwd",
        ] {
            assert!(bad.parse::<Digest>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn open_missing_blob_fails() {
        let (_dir, store) = temp_store();
        let absent: Digest = HELLO_SHA1.parse().unwrap();
        match store.open(&absent) {
            Err(StoreError::NotFound(d)) => assert_eq!(d, absent),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn abandoned_session_leaves_no_temp_file() {
        let (dir, store) = temp_store();
        {
            let mut session = store.save_session().unwrap();
            session.write(b"scratch").unwrap();
        }
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }
}
