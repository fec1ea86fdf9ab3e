//! Self-describing schema blobs.
//!
//! A schema blob is a JSON object carrying `camliVersion` and `camliType`. Anything else
//! stored in the blob store is opaque data.
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::blobref::BlobRef;
use crate::error::{Error, Result};

pub const CAMLI_VERSION: u32 = 1;

/// Bytes of a blob inspected to classify it. A little less than the store allows for a
/// schema blob, so a schema is never truncated.
pub const SNIFF_SIZE: u64 = 900 * 1024;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytesPart {
    pub blob_ref: BlobRef,
    pub size: u64,
}

/// Manifest of a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSchema {
    pub file_name: String,
    #[serde(default)]
    pub parts: Vec<BytesPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_permission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_mtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_ctime: Option<String>,
}

/// Manifest of a directory; its entries live in a static-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySchema {
    pub file_name: String,
    pub entries: BlobRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_permission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_mtime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSetSchema {
    #[serde(default)]
    pub members: Vec<BlobRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermanodeSchema {
    pub random: String,
}

/// A resolved blob, classified by sniffing its leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blob {
    Opaque,
    File(FileSchema),
    Directory(DirectorySchema),
    StaticSet(Vec<BlobRef>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    camli_version: u32,
    camli_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeOut<'a, T: Serialize> {
    camli_version: u32,
    camli_type: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

impl Blob {
    /// Classify a blob from its (possibly truncated) leading bytes.
    ///
    /// Data that is not a JSON object with `camliVersion` and `camliType` is opaque. A schema
    /// blob of a type other than file, directory or static-set is an error.
    pub fn sniff(prefix: &[u8]) -> Result<Blob> {
        let start = prefix.iter().position(|c| !c.is_ascii_whitespace());
        match start {
            Some(i) if prefix[i] == b'{' => {},
            _ => return Ok(Blob::Opaque),
        }
        let envelope: Envelope = match serde_json::from_slice(prefix) {
            Ok(v) => v,
            Err(_) => return Ok(Blob::Opaque),
        };
        if envelope.camli_version == 0 {
            return Ok(Blob::Opaque);
        }
        let blob = match envelope.camli_type.as_str() {
            "file" => Blob::File(serde_json::from_slice(prefix)?),
            "directory" => Blob::Directory(serde_json::from_slice(prefix)?),
            "static-set" => {
                let set: StaticSetSchema = serde_json::from_slice(prefix)?;
                Blob::StaticSet(set.members)
            },
            other => {
                return Err(Error::UnknownBlobType(other.to_string()));
            },
        };
        Ok(blob)
    }
}

fn encode<T: Serialize>(camli_type: &str, body: &T) -> Result<Vec<u8>> {
    let out = EnvelopeOut {
        camli_version: CAMLI_VERSION,
        camli_type,
        body,
    };
    let mut v = serde_json::to_vec_pretty(&out)?;
    v.push(b'\n');
    Ok(v)
}

impl FileSchema {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode("file", self)
    }

    /// Total content size declared by the parts.
    pub fn size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    pub fn mode(&self) -> u32 {
        parse_mode(self.unix_permission.as_deref()).unwrap_or(DEFAULT_FILE_MODE)
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.unix_mtime.as_deref().and_then(parse_time)
    }
}

impl DirectorySchema {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode("directory", self)
    }

    pub fn mode(&self) -> u32 {
        parse_mode(self.unix_permission.as_deref()).unwrap_or(DEFAULT_DIR_MODE)
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.unix_mtime.as_deref().and_then(parse_time)
    }
}

impl StaticSetSchema {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode("static-set", self)
    }
}

impl PermanodeSchema {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode("permanode", self)
    }
}

pub fn format_mode(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

fn parse_mode(s: Option<&str>) -> Option<u32> {
    s.and_then(|v| u32::from_str_radix(v, 8).ok())
}

/// RFC3339 text for `t`, or `None` if it is outside the range a timestamp can carry.
pub fn format_time(t: SystemTime) -> Option<String> {
    let (secs, nsecs) = match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (i64::try_from(d.as_secs()).ok()?, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            let secs = i64::try_from(d.as_secs()).ok()?;
            match d.subsec_nanos() {
                0 => (-secs, 0),
                n => (-secs - 1, 1_000_000_000 - n),
            }
        },
    };
    let dt = Utc.timestamp_opt(secs, nsecs).single()?;
    Some(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn parse_time(s: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc3339(s).ok().map(SystemTime::from)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{
        format_mode,
        format_time,
        Blob,
        BytesPart,
        DirectorySchema,
        FileSchema,
        PermanodeSchema,
        StaticSetSchema,
    };
    use crate::blobref::BlobRef;
    use crate::error::Error;

    #[test]
    fn test_sniff_opaque() {
        assert_eq!(Blob::sniff(b"foobar").unwrap(), Blob::Opaque);
        assert_eq!(Blob::sniff(b"").unwrap(), Blob::Opaque);
        assert_eq!(Blob::sniff(b"{\"foo\": 1}").unwrap(), Blob::Opaque);
        assert_eq!(Blob::sniff(b"{\"camliVersion\": 1, \"camliType\": \"file\"").unwrap(), Blob::Opaque);
    }

    #[test]
    fn test_sniff_file() {
        let part = BlobRef::for_content(b"foo");
        let fs = FileSchema {
            file_name: String::from("foo.txt"),
            parts: vec![BytesPart {
                blob_ref: part,
                size: 3,
            }],
            unix_permission: Some(format_mode(0o600)),
            unix_mtime: format_time(UNIX_EPOCH + Duration::from_secs(1136214245)),
            unix_ctime: None,
        };
        let b = fs.to_bytes().unwrap();
        let s = String::from_utf8(b.clone()).unwrap();
        assert!(s.contains("\"camliType\": \"file\""));
        assert!(s.contains("\"unixMtime\": \"2006-01-02T15:04:05Z\""));
        match Blob::sniff(&b).unwrap() {
            Blob::File(v) => {
                assert_eq!(v, fs);
                assert_eq!(v.size(), 3);
                assert_eq!(v.mode(), 0o600);
                assert_eq!(v.mtime(), Some(UNIX_EPOCH + Duration::from_secs(1136214245)));
            },
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[test]
    fn test_sniff_directory_and_set() {
        let member = BlobRef::for_content(b"member");
        let set = StaticSetSchema {
            members: vec![member.clone()],
        };
        let set_bytes = set.to_bytes().unwrap();
        assert_eq!(Blob::sniff(&set_bytes).unwrap(), Blob::StaticSet(vec![member]));

        let dir = DirectorySchema {
            file_name: String::from("d"),
            entries: BlobRef::for_content(&set_bytes),
            unix_permission: None,
            unix_mtime: None,
        };
        match Blob::sniff(&dir.to_bytes().unwrap()).unwrap() {
            Blob::Directory(v) => {
                assert_eq!(v.mode(), 0o755);
                assert_eq!(v.mtime(), None);
            },
            other => panic!("expected directory, got {:?}", other),
        }
    }

    #[test]
    fn test_sniff_unknown_type() {
        let p = PermanodeSchema {
            random: String::from("deadbeef"),
        };
        match Blob::sniff(&p.to_bytes().unwrap()) {
            Err(Error::UnknownBlobType(t)) => assert_eq!(t, "permanode"),
            other => panic!("expected unknown blob type, got {:?}", other),
        }
    }

    #[test]
    fn test_format_time_range() {
        assert_eq!(format_time(UNIX_EPOCH - Duration::from_millis(1500)).unwrap(), "1969-12-31T23:59:58.500Z");
        assert_eq!(format_time(UNIX_EPOCH + Duration::from_secs(99999999999999)), None);
    }
}
