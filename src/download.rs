//! Downloaders: a blob store client plus a local disk cache of fetched blobs, shared by
//! every request against the same server address.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tempfile::{NamedTempFile, TempDir};

use crate::blobref::BlobRef;
use crate::error::{Error, Result};
use crate::fetch::smart_fetch;
use crate::schema::{Blob, FileSchema, SNIFF_SIZE};
use crate::store::{BlobReader, Connector, Fetcher};

/// Tunables shared by all downloaders of a process.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub insecure_tls: bool,
    pub skip_disk_cache: bool,
    /// Companion fetch tool invoked when the store client fails.
    pub recovery_tool: String,
}

impl Default for DownloadConfig {
    fn default() -> DownloadConfig {
        DownloadConfig {
            insecure_tls: false,
            skip_disk_cache: false,
            recovery_tool: String::from("camget"),
        }
    }
}

/// Caches fetched blobs in a temporary directory, removed when dropped.
pub struct DiskCache {
    upstream: Arc<dyn Fetcher>,
    root: TempDir,
}

impl DiskCache {
    pub fn new(upstream: Arc<dyn Fetcher>) -> Result<DiskCache> {
        let root = tempfile::Builder::new().prefix("camproxy-blobcache").tempdir()?;
        Ok(DiskCache { upstream, root })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }
}

impl Fetcher for DiskCache {
    fn fetch(&self, br: &BlobRef) -> Result<BlobReader> {
        let fp = self.root.path().join(br.to_string());
        if let Ok(f) = File::open(&fp) {
            debug!("disk cache hit for {}", br);
            return Ok(Box::new(f));
        }
        let mut data = vec![];
        self.upstream.fetch(br)?.read_to_end(&mut data)?;
        let mut tmp = NamedTempFile::new_in(self.root.path())?;
        tmp.write_all(&data)?;
        if let Err(e) = tmp.persist(&fp) {
            error!("cannot cache {} at {:?}: {}", br, fp, e.error);
        }
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Reads the content described by a file manifest, all chunks loaded up front.
pub fn open_file_content(src: &dyn Fetcher, br: &BlobRef) -> Result<BlobReader> {
    let mut raw = vec![];
    src.fetch(br)?.take(SNIFF_SIZE).read_to_end(&mut raw)?;
    match Blob::sniff(&raw)? {
        Blob::File(v) => file_reader(src, &v),
        _ => Err(Error::UpstreamUnavailable(format!("{} is not a file", br))),
    }
}

/// Concatenated chunks of a file manifest.
pub fn file_reader(src: &dyn Fetcher, fs: &FileSchema) -> Result<BlobReader> {
    let mut readers: Vec<BlobReader> = Vec::with_capacity(fs.parts.len());
    for part in fs.parts.iter() {
        let r = src.fetch(&part.blob_ref)?;
        readers.push(Box::new(r.take(part.size)));
    }
    Ok(concat(readers))
}

fn concat(readers: Vec<BlobReader>) -> BlobReader {
    readers
        .into_iter()
        .fold(Box::new(io::empty()) as BlobReader, |acc, r| Box::new(acc.chain(r)))
}

pub struct Downloader {
    server: String,
    fetcher: Arc<dyn Fetcher>,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(server: &str, client: Arc<dyn Fetcher>, config: DownloadConfig) -> Result<Downloader> {
        let fetcher: Arc<dyn Fetcher> = match config.skip_disk_cache {
            true => client,
            false => {
                let dc = DiskCache::new(client)
                    .map_err(|e| Error::UpstreamUnavailable(format!("error setting up local disk cache: {}", e)))?;
                debug!("using temp blob cache directory {:?}", dc.root());
                Arc::new(dc)
            },
        };
        Ok(Downloader {
            server: server.to_string(),
            fetcher,
            config,
        })
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    /// Stream the given blobs one after another.
    ///
    /// With `contents` the file content each manifest describes, else the raw blob.
    pub fn start(&self, contents: bool, items: &[BlobRef]) -> Result<BlobReader> {
        let mut readers: Vec<BlobReader> = Vec::with_capacity(items.len());
        for br in items {
            let r = match contents {
                true => open_file_content(self.fetcher(), br),
                false => self.fetcher.fetch(br),
            };
            match r {
                Ok(v) => readers.push(v),
                Err(e) => {
                    error!("error downloading {}: {}", br, e);
                    readers.push(self.recover(contents, br)?);
                },
            }
        }
        Ok(concat(readers))
    }

    /// Write the blobs into `dest`, resolving directories and files.
    pub fn save(&self, dest: &Path, items: &[BlobRef]) -> Result<()> {
        for br in items {
            smart_fetch(self.fetcher(), dest, br)?;
        }
        Ok(())
    }

    fn recovery_args(&self, contents: bool, br: &BlobRef) -> Vec<String> {
        let mut args = vec![];
        if !self.server.is_empty() {
            args.push(format!("-server={}", self.server));
        }
        if contents {
            args.push(String::from("-contents=true"));
        }
        if self.config.insecure_tls {
            args.push(String::from("-insecure=true"));
        }
        args.push(br.to_string());
        args
    }

    fn recover(&self, contents: bool, br: &BlobRef) -> Result<BlobReader> {
        let args = self.recovery_args(contents, br);
        info!("calling {} {:?}", self.config.recovery_tool, args);
        let out = Command::new(&self.config.recovery_tool)
            .args(&args)
            .output()
            .map_err(|e| Error::UpstreamUnavailable(format!("error calling {} {:?}: {}", self.config.recovery_tool, args, e)))?;
        if !out.status.success() {
            return Err(Error::UpstreamUnavailable(format!(
                "error calling {} {:?}: {} ({})",
                self.config.recovery_tool,
                args,
                String::from_utf8_lossy(&out.stderr).trim(),
                out.status
            )));
        }
        Ok(Box::new(Cursor::new(out.stdout)))
    }
}

/// Downloaders by server address, created on first use.
pub struct Downloaders {
    connector: Arc<dyn Connector>,
    config: DownloadConfig,
    cache: Mutex<HashMap<String, Arc<Downloader>>>,
}

impl Downloaders {
    pub fn new(connector: Arc<dyn Connector>, config: DownloadConfig) -> Downloaders {
        Downloaders {
            connector,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, server: &str) -> Result<Arc<Downloader>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::UpstreamUnavailable(String::from("downloader cache poisoned")))?;
        if let Some(v) = cache.get(server) {
            return Ok(v.clone());
        }
        let client = self.connector.fetcher(server)?;
        let down = Arc::new(Downloader::new(server, client, self.config.clone())?);
        cache.insert(server.to_string(), down.clone());
        Ok(down)
    }

    /// Drop every downloader; their disk caches go with them.
    pub fn close(&self) {
        match self.cache.lock() {
            Ok(mut v) => v.clear(),
            Err(e) => e.into_inner().clear(),
        }
    }
}
