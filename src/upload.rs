//! Turn an upload request body into files in a per-request directory.
//!
//! `multipart/form-data` bodies (and the legacy `multipart/form` and
//! `application/x-www-form-urlencoded` spellings) yield one file per part that carries a
//! file name. Any other body is saved whole as a single file, named after the
//! `Content-Disposition` file name when one is given.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use filetime::FileTime;
use log::{debug, error, info, warn};
use mime::Mime;
use multipart::server::Multipart;

use crate::error::{Error, Result};

/// Width of the inline `mtime` form value, and the length from which an mtime string is
/// read as a formatted time rather than Unix seconds.
pub const MTIME_WIDTH: usize = 23;

/// A file saved from the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUnit {
    pub path: PathBuf,
    /// Declared content type, empty if none.
    pub mime_type: String,
}

/// The parts of an upload request the ingestor looks at.
#[derive(Debug, Default, Clone)]
pub struct UploadRequest<'a> {
    pub content_type: Option<&'a str>,
    pub last_modified: Option<&'a str>,
    pub content_disposition: Option<&'a str>,
    /// `mtime` query parameter.
    pub mtime: Option<&'a str>,
}

/// Save the body into `dir`, returning the files in the order they were received.
pub fn ingest(dir: &Path, body: impl Read, req: &UploadRequest) -> Result<Vec<UploadUnit>> {
    let ct = req.content_type.unwrap_or("");
    let parsed = match ct.parse::<Mime>() {
        Ok(v) => Some(v),
        Err(e) => {
            if !ct.is_empty() {
                error!("error parsing Content-Type {:?}: {}", ct, e);
            }
            None
        },
    };
    let media_type = match &parsed {
        Some(m) => m.essence_str().to_ascii_lowercase(),
        None => ct.trim().to_ascii_lowercase(),
    };
    info!("Content-Type: {:?}", media_type);

    match media_type.as_str() {
        "multipart/form" | "multipart/form-data" | "application/x-www-form-urlencoded" => {
            let boundary = parsed
                .as_ref()
                .and_then(|m| m.get_param(mime::BOUNDARY))
                .map(|v| v.as_str().to_string());
            let boundary = match boundary {
                Some(v) => v,
                None => {
                    return Err(Error::BadRequest(String::from(
                        "error parsing request body as multipart/form: no boundary",
                    )));
                },
            };
            let qmtime = req.mtime.filter(|v| !v.is_empty()).or(req.last_modified);
            save_multipart_to(dir, body, &boundary, qmtime.map(String::from))
        },
        _ => Ok(vec![save_direct_to(dir, body, req)?]),
    }
}

/// Save a single-file body.
pub fn save_direct_to(dir: &Path, mut body: impl Read, req: &UploadRequest) -> Result<UploadUnit> {
    let mime_type = req.content_type.unwrap_or("").to_string();
    let lastmod = resolve_mtime(req.last_modified, req.mtime);
    let name = req.content_disposition.and_then(disposition_filename);
    if name.is_none() {
        debug!("cannot determine filename from {:?}", req.content_disposition);
    }
    let (mut fh, path) = create_in(dir, name.as_deref())?;
    io::copy(&mut body, &mut fh)?;
    drop(fh);
    apply_mtime(&path, lastmod);
    Ok(UploadUnit { path, mime_type })
}

const MAX_PART_HEADERS: usize = 16 * 1024;

/// Picks the `Last-Modified` header of each part out of a raw multipart body.
///
/// The parser only hands out name, filename and content type per part, so the body is
/// scanned for delimiter lines as it is read. One entry per part, in body order.
/// Delimiters only count at the start of the body or of a line.
struct PartScan {
    delimiter: Vec<u8>,
    pending: Vec<u8>,
    in_headers: bool,
    done: bool,
    found: VecDeque<Option<String>>,
}

impl PartScan {
    fn new(boundary: &str) -> PartScan {
        // the first delimiter may open the body without a line break before it
        PartScan {
            delimiter: format!("\r\n--{}", boundary).into_bytes(),
            pending: b"\r\n".to_vec(),
            in_headers: false,
            done: false,
            found: VecDeque::new(),
        }
    }

    fn feed(&mut self, p: &[u8]) {
        if self.done {
            return;
        }
        self.pending.extend_from_slice(p);
        loop {
            if !self.in_headers {
                match find(&self.pending, &self.delimiter) {
                    Some(i) => {
                        self.pending.drain(..i + self.delimiter.len());
                        self.in_headers = true;
                    },
                    None => {
                        // a delimiter may straddle reads
                        let keep = self.delimiter.len() - 1;
                        let cut = self.pending.len().saturating_sub(keep);
                        self.pending.drain(..cut);
                        return;
                    },
                }
                continue;
            }
            if self.pending.starts_with(b"--") {
                self.done = true;
                self.pending = vec![];
                return;
            }
            match find(&self.pending, b"\r\n\r\n") {
                Some(end) => {
                    self.found.push_back(header_in(&self.pending[..end], "last-modified"));
                    self.pending.drain(..end + 4);
                    self.in_headers = false;
                },
                None => {
                    if self.pending.len() > MAX_PART_HEADERS {
                        warn!("multipart part headers over {} bytes", MAX_PART_HEADERS);
                        self.found.push_back(None);
                        self.pending.clear();
                        self.in_headers = false;
                    }
                    return;
                },
            }
        }
    }
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Value of header `name` in a part header block. The first line is the rest of the
/// delimiter line.
fn header_in(block: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    text.split("\r\n").skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        match k.trim().eq_ignore_ascii_case(name) {
            true => Some(v.trim().to_string()),
            false => None,
        }
    })
}

struct PartTap<R> {
    inner: R,
    scan: Rc<RefCell<PartScan>>,
}

impl<R: Read> Read for PartTap<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.scan.borrow_mut().feed(&buf[..n]);
        Ok(n)
    }
}

/// Save every file part of a multipart body.
///
/// A part's own `Last-Modified` header wins. Otherwise a form field named `mtime`, or
/// failing that `qmtime`, supplies the modification time for the parts after it.
pub fn save_multipart_to(dir: &Path, body: impl Read, boundary: &str, mut qmtime: Option<String>) -> Result<Vec<UploadUnit>> {
    let scan = Rc::new(RefCell::new(PartScan::new(boundary)));
    let tap = PartTap {
        inner: body,
        scan: scan.clone(),
    };
    let mut mp = Multipart::with_body(tap, boundary);
    let mut files = vec![];
    loop {
        let mut field = match mp.read_entry() {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                return Err(Error::BadRequest(format!("error parsing request body as multipart/form: {}", e)));
            },
        };
        let part_lastmod = scan.borrow_mut().found.pop_front().flatten();
        let filename = field.headers.filename.clone().unwrap_or_default();
        if filename.is_empty() {
            if &*field.headers.name == "mtime" {
                let mut b = Vec::with_capacity(MTIME_WIDTH);
                (&mut field.data).take(MTIME_WIDTH as u64).read_to_end(&mut b)?;
                qmtime = Some(String::from_utf8_lossy(&b).into_owned());
            }
            continue;
        }
        let mime_type = field
            .headers
            .content_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_default();
        let (mut fh, path) = create_in(dir, Some(&filename))?;
        io::copy(&mut field.data, &mut fh)?;
        drop(fh);
        apply_mtime(&path, resolve_mtime(part_lastmod.as_deref(), qmtime.as_deref()));
        files.push(UploadUnit { path, mime_type });
    }
    Ok(files)
}

/// Create a file in `dir` under the base of the client-supplied name, or a generated one.
fn create_in(dir: &Path, name: Option<&str>) -> Result<(File, PathBuf)> {
    if let Some(base) = name.and_then(|v| Path::new(v).file_name()) {
        let fp = dir.join(base);
        let fh = File::create(&fp)?;
        return Ok((fh, fp));
    }
    let tmp = tempfile::Builder::new().prefix("file-").tempfile_in(dir)?;
    tmp.keep().map_err(|e| Error::Io(e.error))
}

fn apply_mtime(path: &Path, lastmod: Option<SystemTime>) {
    let t = match lastmod {
        Some(v) => v,
        None => return,
    };
    let ft = FileTime::from_system_time(t);
    debug!("setting mtime on {:?} to {:?}", path, ft);
    if let Err(e) = filetime::set_file_times(path, ft, ft) {
        error!("error chtimes {:?}: {}", path, e);
    }
}

/// The `filename` parameter of a `Content-Disposition` value.
pub fn disposition_filename(cd: &str) -> Option<String> {
    for param in split_params(cd).into_iter().skip(1) {
        let (k, v) = match param.split_once('=') {
            Some(v) => v,
            None => continue,
        };
        if !k.trim().eq_ignore_ascii_case("filename") {
            continue;
        }
        let v = unquote(v.trim());
        if v.is_empty() {
            return None;
        }
        return Some(v);
    }
    None
}

/// Split a header value on the semicolons outside quoted strings.
fn split_params(v: &str) -> Vec<&str> {
    let mut out = vec![];
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in v.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                out.push(&v[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    out.push(&v[start..]);
    out
}

fn unquote(v: &str) -> String {
    let inner = match v.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(q) => q,
        None => return v.to_string(),
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            _ => out.push(c),
        }
    }
    out
}

/// Pick the modification time for an uploaded file.
///
/// A parseable `Last-Modified` value wins. Otherwise an `mtime` of at least [MTIME_WIDTH]
/// characters is parsed as a formatted time, and a shorter one as Unix seconds.
pub fn resolve_mtime(last_modified: Option<&str>, mtime: Option<&str>) -> Option<SystemTime> {
    if let Some(h) = last_modified.filter(|v| !v.is_empty()) {
        if let Some(t) = time_parse(h) {
            return Some(t.into());
        }
    }
    let m = match mtime.filter(|v| !v.is_empty()) {
        Some(v) => v,
        None => {
            debug!("no mtime");
            return None;
        },
    };
    if m.len() >= MTIME_WIDTH {
        let t = time_parse(m);
        if t.is_none() {
            warn!("too big an mtime {:?}, and not a known time format", m);
        }
        return t.map(SystemTime::from);
    }
    match m.trim().parse::<i64>() {
        Ok(secs) => match DateTime::<Utc>::from_timestamp(secs, 0) {
            Some(t) => Some(t.into()),
            None => {
                warn!("mtime {} out of range", secs);
                None
            },
        },
        Err(e) => {
            warn!("cannot parse mtime {:?}: {}", m, e);
            None
        },
    }
}

/// Parse RFC1123, Unix date(1) or RFC3339 time text, in that order.
fn time_parse(text: &str) -> Option<DateTime<FixedOffset>> {
    parse_rfc1123(text)
        .or_else(|| parse_unix_date(text))
        .or_else(|| DateTime::parse_from_rfc3339(text.trim()).ok())
}

/// `Mon, 02 Jan 2006 15:04:05 MST`
fn parse_rfc1123(text: &str) -> Option<DateTime<FixedOffset>> {
    let (head, zone) = text.trim().rsplit_once(' ')?;
    let naive = NaiveDateTime::parse_from_str(head, "%a, %d %b %Y %H:%M:%S").ok()?;
    with_zone(naive, zone)
}

/// `Mon Jan _2 15:04:05 MST 2006`
fn parse_unix_date(text: &str) -> Option<DateTime<FixedOffset>> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 6 {
        return None;
    }
    let s = format!("{} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], fields[5]);
    let naive = NaiveDateTime::parse_from_str(&s, "%a %b %d %H:%M:%S %Y").ok()?;
    with_zone(naive, fields[4])
}

fn with_zone(naive: NaiveDateTime, zone: &str) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(zone_offset(zone)?)?;
    offset.from_local_datetime(&naive).single()
}

/// Offset east of UTC in seconds for a numeric or abbreviated zone.
///
/// Unknown abbreviations count as UTC.
fn zone_offset(zone: &str) -> Option<i32> {
    let hours = match zone {
        "UT" | "UTC" | "GMT" | "Z" => 0,
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => {
            if !zone.is_empty() && zone.chars().all(|c| c.is_ascii_alphabetic()) {
                return Some(0);
            }
            return numeric_offset(zone);
        },
    };
    Some(hours * 3600)
}

fn numeric_offset(zone: &str) -> Option<i32> {
    let (sign, digits) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let h: i32 = digits[..2].parse().ok()?;
    let m: i32 = digits[2..].parse().ok()?;
    Some(sign * (h * 3600 + m * 60))
}
