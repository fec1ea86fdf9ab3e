//! Blob store seams and a directory-backed store.
//!
//! The proxy talks to the blob store only through [Fetcher] and [Uploader]. [LocalStore]
//! keeps every blob as a file named by its reference under a root directory; it backs the
//! binaries and the tests.
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use sha2::{Digest, Sha224};
use tempfile::NamedTempFile;

use crate::blobref::BlobRef;
use crate::error::{Error, Result};
use crate::schema::{
    format_mode,
    format_time,
    BytesPart,
    DirectorySchema,
    FileSchema,
    PermanodeSchema,
    StaticSetSchema,
};

/// Size of the content chunks a regular file is split into.
pub const CHUNK_SIZE: usize = 1 << 20;

pub type BlobReader = Box<dyn Read + Send>;

/// Retrieves raw blobs by reference.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, br: &BlobRef) -> Result<BlobReader>;
}

/// Stores a file or directory tree, optionally wrapped in a permanode.
pub trait Uploader: Send + Sync {
    /// Returns the content reference and, if requested, the permanode reference.
    fn upload_file(&self, path: &Path, permanode: bool) -> Result<(BlobRef, Option<BlobRef>)>;
}

/// Resolves a blob store address into its fetch and upload sides.
pub trait Connector: Send + Sync {
    fn fetcher(&self, server: &str) -> Result<Arc<dyn Fetcher>>;
    fn uploader(&self, server: &str, cap_ctime: bool) -> Result<Arc<dyn Uploader>>;
}

/// Content-addressed blob store kept in a local directory.
pub struct LocalStore {
    root: PathBuf,
    cap_ctime: bool,
}

impl LocalStore {
    pub fn open(root: &Path) -> Result<LocalStore> {
        fs::create_dir_all(root)?;
        Ok(LocalStore {
            root: root.to_path_buf(),
            cap_ctime: false,
        })
    }

    /// Record creation times no later than modification times.
    pub fn with_cap_ctime(mut self, cap_ctime: bool) -> LocalStore {
        self.cap_ctime = cap_ctime;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, br: &BlobRef) -> PathBuf {
        self.root.join(br.to_string())
    }

    /// Store the given content, returning its reference.
    pub fn put(&self, mut f: impl Read) -> Result<BlobRef> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        let mut buf = vec![0u8; 65536];
        let mut h = Sha224::new();
        let mut total_size: usize = 0;
        loop {
            let n = f.read(&mut buf[..])?;
            if n == 0 {
                break;
            }
            total_size += n;
            h.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        let br = BlobRef::from_hasher(h);
        let final_path = self.blob_path(&br);
        if final_path.is_file() {
            debug!("already have {} ({} bytes)", br, total_size);
            return Ok(br);
        }
        tmp.persist(&final_path).map_err(|e| Error::Io(e.error))?;
        debug!("stored {} ({} bytes)", br, total_size);
        Ok(br)
    }

    pub fn put_bytes(&self, data: &[u8]) -> Result<BlobRef> {
        self.put(data)
    }

    fn upload_regular(&self, path: &Path, meta: &fs::Metadata) -> Result<BlobRef> {
        let mut f = File::open(path)?;
        let mut parts = vec![];
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = read_full(&mut f, &mut buf)?;
            if n == 0 {
                break;
            }
            let blob_ref = self.put_bytes(&buf[..n])?;
            parts.push(BytesPart {
                blob_ref,
                size: n as u64,
            });
            if n < buf.len() {
                break;
            }
        }
        let mtime = meta.modified().ok();
        let mut ctime = meta.created().ok().or(mtime);
        if self.cap_ctime {
            if let (Some(c), Some(m)) = (ctime, mtime) {
                if c > m {
                    ctime = Some(m);
                }
            }
        }
        let schema = FileSchema {
            file_name: base_name(path),
            parts,
            unix_permission: Some(format_mode(file_mode(meta))),
            unix_mtime: mtime.and_then(format_time),
            unix_ctime: ctime.and_then(format_time),
        };
        self.put_bytes(&schema.to_bytes()?)
    }

    fn upload_dir(&self, path: &Path, meta: &fs::Metadata) -> Result<BlobRef> {
        let mut names = vec![];
        for entry in fs::read_dir(path)? {
            names.push(entry?.path());
        }
        names.sort();
        let mut members = vec![];
        for p in names {
            members.push(self.upload_path(&p)?);
        }
        let set = StaticSetSchema { members };
        let entries = self.put_bytes(&set.to_bytes()?)?;
        let schema = DirectorySchema {
            file_name: base_name(path),
            entries,
            unix_permission: Some(format_mode(file_mode(meta))),
            unix_mtime: meta.modified().ok().and_then(format_time),
        };
        self.put_bytes(&schema.to_bytes()?)
    }

    fn upload_path(&self, path: &Path) -> Result<BlobRef> {
        let meta = fs::metadata(path)?;
        if meta.is_dir() {
            self.upload_dir(path, &meta)
        } else {
            self.upload_regular(path, &meta)
        }
    }

    fn new_permanode(&self, content: &BlobRef) -> Result<BlobRef> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut h = Sha224::new();
        h.update(content.digest());
        h.update(nanos.to_be_bytes());
        h.update(std::process::id().to_be_bytes());
        let p = PermanodeSchema {
            random: hex::encode(h.finalize()),
        };
        self.put_bytes(&p.to_bytes()?)
    }
}

impl Fetcher for LocalStore {
    fn fetch(&self, br: &BlobRef) -> Result<BlobReader> {
        let fp = self.blob_path(br);
        match File::open(&fp) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) => Err(Error::UpstreamUnavailable(format!("failed to fetch {}: {}", br, e))),
        }
    }
}

impl Uploader for LocalStore {
    fn upload_file(&self, path: &Path, permanode: bool) -> Result<(BlobRef, Option<BlobRef>)> {
        let content = self.upload_path(path)?;
        info!("uploaded {:?} as {}", path, content);
        let perma = match permanode {
            true => Some(self.new_permanode(&content)?),
            false => None,
        };
        Ok((content, perma))
    }
}

/// Treats each server address as the root directory of a [LocalStore].
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn fetcher(&self, server: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(LocalStore::open(Path::new(server))?))
    }

    fn uploader(&self, server: &str, cap_ctime: bool) -> Result<Arc<dyn Uploader>> {
        Ok(Arc::new(LocalStore::open(Path::new(server))?.with_cap_ctime(cap_ctime)))
    }
}

fn read_full(f: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match f.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    match meta.is_dir() {
        true => 0o755,
        false => 0o644,
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir, write};
    use std::io::Read;

    use tempfile::tempdir;

    use super::{Fetcher, LocalStore, Uploader, CHUNK_SIZE};
    use crate::blobref::BlobRef;
    use crate::schema::Blob;

    fn fetch_all(store: &LocalStore, br: &BlobRef) -> Vec<u8> {
        let mut v = vec![];
        store.fetch(br).unwrap().read_to_end(&mut v).unwrap();
        v
    }

    #[test]
    fn test_put_immutable() {
        let d = tempdir().unwrap();
        let store = LocalStore::open(d.path()).unwrap();
        let br = store.put(&b"foo"[..]).unwrap();
        assert_eq!(br, BlobRef::for_content(b"foo"));
        assert!(store.blob_path(&br).is_file());
        assert_eq!(fetch_all(&store, &br), b"foo");

        let again = store.put(&b"foo"[..]).unwrap();
        assert_eq!(again, br);
    }

    #[test]
    fn test_fetch_missing() {
        let d = tempdir().unwrap();
        let store = LocalStore::open(d.path()).unwrap();
        assert!(store.fetch(&BlobRef::for_content(b"nope")).is_err());
    }

    #[test]
    fn test_upload_file_chunks() {
        let d = tempdir().unwrap();
        let src = tempdir().unwrap();
        let store = LocalStore::open(d.path()).unwrap();
        let data: Vec<u8> = (0..CHUNK_SIZE + 10).map(|i| (i % 251) as u8).collect();
        let fp = src.path().join("big.bin");
        write(&fp, &data).unwrap();

        let (content, perma) = store.upload_file(&fp, false).unwrap();
        assert!(perma.is_none());
        match Blob::sniff(&fetch_all(&store, &content)).unwrap() {
            Blob::File(fs) => {
                assert_eq!(fs.file_name, "big.bin");
                assert_eq!(fs.parts.len(), 2);
                assert_eq!(fs.size(), data.len() as u64);
                assert!(fs.unix_mtime.is_some());
            },
            other => panic!("expected file schema, got {:?}", other),
        }
    }

    #[test]
    fn test_upload_dir_and_permanode() {
        let d = tempdir().unwrap();
        let src = tempdir().unwrap();
        let store = LocalStore::open(d.path()).unwrap();
        let top = src.path().join("top");
        create_dir(&top).unwrap();
        write(top.join("a.txt"), b"aaa").unwrap();
        write(top.join("b.txt"), b"bbb").unwrap();

        let (content, perma) = store.upload_file(&top, true).unwrap();
        assert!(perma.is_some());
        let dir = match Blob::sniff(&fetch_all(&store, &content)).unwrap() {
            Blob::Directory(v) => v,
            other => panic!("expected directory schema, got {:?}", other),
        };
        assert_eq!(dir.file_name, "top");
        match Blob::sniff(&fetch_all(&store, &dir.entries)).unwrap() {
            Blob::StaticSet(members) => assert_eq!(members.len(), 2),
            other => panic!("expected static-set, got {:?}", other),
        }
    }
}
