use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use tempfile::TempDir;
use tiny_http::{
    Method,
    Request,
    Response,
};
use url::Url;

use crate::arg::Settings;
use crate::auth::AuthSpec;
use crate::blobref::{parse_many, BlobRef};
use crate::download::Downloaders;
use crate::error::{Error, Result};
use crate::meta::MimeCache;
use crate::paranoid::{paranoid_path, ParanoidCopy};
use crate::response::{
    error_response,
    text_response,
    SniffingBody,
};
use crate::store::{Connector, Uploader};
use crate::upload::{ingest, UploadRequest, UploadUnit};

const JSON_MIME: &str = "application/json";

/// Query parameters of a request. For repeated keys the first value is kept.
#[derive(Debug, Default)]
pub struct Query {
    params: HashMap<String, String>,
}

impl Query {
    pub fn get(&self, k: &str) -> Option<&str> {
        self.params.get(k).map(String::as_str)
    }

    /// Whether `k` is given as `1`.
    pub fn flag(&self, k: &str) -> bool {
        self.get(k) == Some("1")
    }
}

/// Split a request target into the path without its leading slash, and the query.
pub fn parse_target(target: &str) -> Result<(String, Query)> {
    let base = Url::parse("http://localhost/").map_err(|e| Error::BadRequest(e.to_string()))?;
    let u = Url::options()
        .base_url(Some(&base))
        .parse(target)
        .map_err(|e| Error::BadRequest(format!("invalid request target {:?}: {}", target, e)))?;
    let mut q = Query::default();
    for (k, v) in u.query_pairs().into_owned() {
        q.params.entry(k).or_insert(v);
    }
    let path = u.path().trim_start_matches('/').to_string();
    Ok((path, q))
}

/// Upload response body: the content reference, then the permanode reference if any.
pub fn reference_body(content: &BlobRef, perma: Option<&BlobRef>, short: bool) -> String {
    let enc = |r: &BlobRef| match short {
        true => r.to_short(),
        false => r.to_string(),
    };
    let mut b = enc(content);
    if let Some(p) = perma {
        b.push('\n');
        b.push_str(&enc(p));
    }
    b
}

fn header_value(req: &Request, field: &'static str) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(field))
        .map(|h| h.value.as_str().to_string())
}

fn respond<R: Read>(req: Request, res: Response<R>) {
    if let Err(e) = req.respond(res) {
        error!("error sending response: {}", e);
    }
}

/// Result of a stored upload.
///
/// Dropping it runs the archive copy first and then removes the temporary directory.
pub struct PostOutcome {
    pub body: String,
    archive: Option<ParanoidCopy>,
    _dir: TempDir,
}

impl PostOutcome {
    pub fn archive(&self) -> Option<&Path> {
        self.archive.as_ref().map(|v| v.dest())
    }
}

/// State shared by all request handlers.
pub struct Proxy {
    server: String,
    cap_ctime: bool,
    paranoid: Option<PathBuf>,
    connector: Arc<dyn Connector>,
    downloaders: Downloaders,
    mime_cache: MimeCache,
    auth: Option<AuthSpec>,
}

impl Proxy {
    pub fn new(settings: &Settings, connector: Arc<dyn Connector>, auth: Option<AuthSpec>) -> Result<Proxy> {
        let mime_cache = MimeCache::open(&settings.mime_cache, 0)?;
        debug!("mime cache at {:?}", settings.mime_cache);
        Ok(Proxy {
            server: settings.server.clone(),
            cap_ctime: settings.cap_ctime,
            paranoid: settings.paranoid.clone(),
            downloaders: Downloaders::new(connector.clone(), settings.download_config()),
            connector,
            mime_cache,
            auth,
        })
    }

    pub fn mime_cache(&self) -> &MimeCache {
        &self.mime_cache
    }

    /// Close the mime cache and drop the downloaders with their disk caches.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.downloaders.close();
        self.mime_cache.close();
    }

    /// Serve one request to completion.
    pub fn handle(&self, req: Request) {
        if let Some(auth) = &self.auth {
            if !auth.check(header_value(&req, "Authorization").as_deref()) {
                debug!("unauthorized request from {:?}", req.remote_addr());
                respond(req, error_response(&Error::Unauthorized));
                return;
            }
        }
        let (path, q) = match parse_target(req.url()) {
            Ok(v) => v,
            Err(e) => {
                respond(req, error_response(&e));
                return;
            },
        };
        let method = req.method().clone();
        info!("processing request {} for {:?}", method, req.url());
        match method {
            Method::Get => self.process_get(req, &path, &q),
            Method::Post => self.process_post(req, &q),
            _ => respond(req, text_response(405, "Method must be GET/POST")),
        }
    }

    fn process_get(&self, req: Request, path: &str, q: &Query) {
        if path.is_empty() {
            respond(req, error_response(&Error::BadRequest(String::from("a blob reference is needed"))));
            return;
        }
        let items = match parse_many(&[path]) {
            Ok(v) => v,
            Err(e) => {
                respond(req, error_response(&e));
                return;
            },
        };
        let contents = q.flag("raw");
        let mut name = String::new();
        let ok_mime = match contents {
            false => JSON_MIME.to_string(),
            true => {
                let m = q.get("mimeType").unwrap_or("").to_string();
                if m.is_empty() && items.len() == 1 {
                    name = items[0].to_short();
                }
                m
            },
        };

        let down = match self.downloaders.get(&self.server) {
            Ok(v) => v,
            Err(e) => {
                let e = Error::UpstreamUnavailable(format!("error getting downloader to {:?}: {}", self.server, e));
                error!("{}", e);
                respond(req, error_response(&e));
                return;
            },
        };
        let mut rc = match down.start(contents, &items) {
            Ok(v) => v,
            Err(e) => {
                error!("download error for {:?}: {}", items, e);
                respond(req, text_response(500, &format!("download error: {}", e)));
                return;
            },
        };

        let mut body = SniffingBody::new(&name, &ok_mime, Some(&self.mime_cache));
        if let Err(e) = body.fill(&mut rc) {
            error!("error downloading {:?}: {}", items, e);
            respond(req, text_response(500, &format!("error downloading {:?}: {}", items, e)));
            return;
        }
        debug!("sending {:?} as {:?}", items, body.mime_type());
        respond(req, body.into_response(rc));
    }

    fn process_post(&self, mut req: Request, q: &Query) {
        let up = match self.connector.uploader(&self.server, self.cap_ctime) {
            Ok(v) => v,
            Err(e) => {
                let e = Error::UpstreamUnavailable(format!("error getting uploader to {:?}: {}", self.server, e));
                error!("{}", e);
                respond(req, error_response(&e));
                return;
            },
        };
        let dir = match tempfile::Builder::new().prefix("camproxy").tempdir() {
            Ok(v) => v,
            Err(e) => {
                respond(req, text_response(500, &format!("cannot create temporary directory: {}", e)));
                return;
            },
        };

        let content_type = header_value(&req, "Content-Type");
        let last_modified = header_value(&req, "Last-Modified");
        let content_disposition = header_value(&req, "Content-Disposition");
        let ureq = UploadRequest {
            content_type: content_type.as_deref(),
            last_modified: last_modified.as_deref(),
            content_disposition: content_disposition.as_deref(),
            mtime: q.get("mtime"),
        };
        let units = match ingest(dir.path(), req.as_reader(), &ureq) {
            Ok(v) => v,
            Err(e) => {
                error!("error reading upload: {}", e);
                respond(req, error_response(&e));
                return;
            },
        };

        match self.store_upload(up.as_ref(), dir, &units, q.flag("permanode"), q.flag("short")) {
            Ok(outcome) => {
                respond(req, text_response(201, &outcome.body));
                drop(outcome);
            },
            Err(e) => {
                error!("{}", e);
                respond(req, error_response(&e));
            },
        }
    }

    /// Hand the saved files to the uploader.
    ///
    /// One file is uploaded by itself, several as the whole directory `dir`.
    pub fn store_upload(&self, up: &dyn Uploader, dir: TempDir, units: &[UploadUnit], permanode: bool, short: bool) -> Result<PostOutcome> {
        info!("uploading {:?}", units);
        let target = match units.len() {
            0 => return Err(Error::NoFilesInRequest),
            1 => units[0].path.as_path(),
            _ => dir.path(),
        };
        let (content, perma) = up.upload_file(target, permanode).map_err(|e| {
            let names: Vec<&Path> = units.iter().map(|u| u.path.as_path()).collect();
            Error::UpstreamUnavailable(format!("error uploading {:?}: {}", names, e))
        })?;

        let mut archive = None;
        if units.len() == 1 {
            if !units[0].mime_type.is_empty() {
                self.mime_cache.set(&content.to_short(), &units[0].mime_type);
            }
            if let Some(root) = &self.paranoid {
                archive = paranoid_path(root, &content.to_string()).map(|dest| ParanoidCopy::new(&units[0].path, dest));
            }
        }
        Ok(PostOutcome {
            body: reference_body(&content, perma.as_ref(), short),
            archive,
            _dir: dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{read, write};
    use std::sync::Arc;

    use tempfile::{tempdir, TempDir};

    use super::{parse_target, reference_body, Proxy};
    use crate::arg::Settings;
    use crate::blobref::BlobRef;
    use crate::error::Error;
    use crate::store::{LocalConnector, LocalStore};
    use crate::upload::UploadUnit;

    fn proxy(root: &TempDir, paranoid: bool) -> Proxy {
        let mut settings = Settings::new();
        settings.server = root.path().join("store").to_string_lossy().to_string();
        settings.mime_cache = root.path().join("mimecache.kv");
        if paranoid {
            settings.paranoid = Some(root.path().join("backup"));
        }
        Proxy::new(&settings, Arc::new(LocalConnector), None).unwrap()
    }

    #[test]
    fn test_parse_target() {
        let (path, q) = parse_target("/sha1-abc?raw=1&mimeType=text%2Fplain&raw=0").unwrap();
        assert_eq!(path, "sha1-abc");
        assert!(q.flag("raw"));
        assert_eq!(q.get("mimeType"), Some("text/plain"));
        assert_eq!(q.get("short"), None);

        let (path, q) = parse_target("/").unwrap();
        assert_eq!(path, "");
        assert!(!q.flag("permanode"));
    }

    #[test]
    fn test_reference_body() {
        let content = BlobRef::for_content(b"foo");
        let perma = BlobRef::for_content(b"bar");
        assert_eq!(reference_body(&content, None, false), content.to_string());
        assert_eq!(
            reference_body(&content, Some(&perma), true),
            format!("{}\n{}", content.to_short(), perma.to_short())
        );
    }

    #[test]
    fn test_store_single_upload() {
        let d = tempdir().unwrap();
        let p = proxy(&d, true);
        let store = LocalStore::open(&d.path().join("store")).unwrap();

        let up = tempdir().unwrap();
        let fp = up.path().join("a.csv");
        write(&fp, b"a,b\n1,2\n").unwrap();
        let units = vec![UploadUnit { path: fp.clone(), mime_type: String::from("text/csv") }];
        let outcome = p.store_upload(&store, up, &units, true, false).unwrap();

        let lines: Vec<&str> = outcome.body.lines().collect();
        assert_eq!(lines.len(), 2);
        let content = BlobRef::parse(lines[0]).unwrap();
        assert!(BlobRef::parse(lines[1]).is_ok());
        assert_eq!(p.mime_cache().get(&content.to_short()), "text/csv");

        let archive = outcome.archive().unwrap().to_path_buf();
        assert!(archive.starts_with(d.path().join("backup")));
        drop(outcome);
        assert_eq!(read(&archive).unwrap(), b"a,b\n1,2\n");
        assert!(!fp.exists());
    }

    #[test]
    fn test_store_many_uploads_directory() {
        let d = tempdir().unwrap();
        let p = proxy(&d, true);
        let store = LocalStore::open(&d.path().join("store")).unwrap();

        let up = tempdir().unwrap();
        let mut units = vec![];
        for (name, data) in [("x.txt", &b"x"[..]), ("y.txt", &b"y"[..])] {
            let fp = up.path().join(name);
            write(&fp, data).unwrap();
            units.push(UploadUnit { path: fp, mime_type: String::from("text/plain") });
        }
        let outcome = p.store_upload(&store, up, &units, false, true).unwrap();
        assert_eq!(outcome.body.lines().count(), 1);
        assert!(BlobRef::from_short(&outcome.body).is_ok());
        assert!(outcome.archive().is_none());
    }

    #[test]
    fn test_store_no_files() {
        let d = tempdir().unwrap();
        let p = proxy(&d, false);
        let store = LocalStore::open(&d.path().join("store")).unwrap();
        let up = tempdir().unwrap();
        let dir = up.path().to_path_buf();
        match p.store_upload(&store, up, &[], false, false) {
            Err(Error::NoFilesInRequest) => {},
            _ => panic!("expected no files error"),
        }
        assert!(!dir.exists());
    }
}
