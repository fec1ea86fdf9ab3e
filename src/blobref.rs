use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use base64::alphabet;
use base64::engine::{
    DecodePaddingMode,
    GeneralPurpose,
    GeneralPurposeConfig,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

use crate::error::{Error, Result};

/// URL-safe base64, padded on encode, padding optional on decode.
const SHORT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Hash algorithms a reference may be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Sha1,
    Sha224,
    Sha256,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha224 => "sha224",
            HashAlgo::Sha256 => "sha256",
        }
    }

    /// Length of the raw digest in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha224 => 28,
            HashAlgo::Sha256 => 32,
        }
    }

    pub fn from_name(s: &str) -> Option<HashAlgo> {
        match s {
            "sha1" => Some(HashAlgo::Sha1),
            "sha224" => Some(HashAlgo::Sha224),
            "sha256" => Some(HashAlgo::Sha256),
            _ => None,
        }
    }
}

/// Content-derived blob identifier, `<algo>-<lowercase hex digest>` in canonical form.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobRef {
    algo: HashAlgo,
    digest: Vec<u8>,
}

impl BlobRef {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<BlobRef> {
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidReference(format!(
                "{} digest must be {} bytes, got {}",
                algo.name(),
                algo.digest_len(),
                digest.len()
            )));
        }
        Ok(BlobRef { algo, digest })
    }

    /// Reference for the given content, as the blob store names it.
    pub fn for_content(data: &[u8]) -> BlobRef {
        let mut h = Sha224::new();
        h.update(data);
        BlobRef::from_hasher(h)
    }

    pub(crate) fn from_hasher(h: Sha224) -> BlobRef {
        BlobRef {
            algo: HashAlgo::Sha224,
            digest: h.finalize().to_vec(),
        }
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn hex_digest(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Parse the canonical `<algo>-<hexdigest>` form.
    pub fn parse(s: &str) -> Result<BlobRef> {
        let (algo_name, digest_hex) = match s.split_once('-') {
            Some(v) => v,
            None => {
                return Err(Error::InvalidReference(format!("no - in {:?}", s)));
            },
        };
        let algo = match HashAlgo::from_name(algo_name) {
            Some(v) => v,
            None => {
                return Err(Error::InvalidReference(format!("unknown hash algorithm in {:?}", s)));
            },
        };
        if digest_hex.len() != algo.digest_len() * 2
            || !digest_hex.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(Error::InvalidReference(format!("bad {} digest in {:?}", algo.name(), s)));
        }
        let digest = hex::decode(digest_hex)
            .map_err(|e| Error::InvalidReference(format!("{:?}: {}", s, e)))?;
        BlobRef::new(algo, digest)
    }

    /// Parse the shortened `<algo>-<url-safe base64 digest>` form.
    pub fn from_short(s: &str) -> Result<BlobRef> {
        let (algo_name, digest_b64) = match s.split_once('-') {
            Some(v) => v,
            None => {
                return Err(Error::InvalidReference(format!("no - in {:?}", s)));
            },
        };
        let digest = SHORT_ENGINE
            .decode(digest_b64)
            .map_err(|e| Error::InvalidReference(format!("cannot decode {:?} as base64: {}", digest_b64, e)))?;
        let algo_name = algo_name.to_ascii_lowercase();
        let algo = match HashAlgo::from_name(&algo_name) {
            Some(v) => v,
            None => {
                return Err(Error::InvalidReference(format!("unknown hash algorithm in {:?}", s)));
            },
        };
        BlobRef::new(algo, digest)
    }

    /// The base64-shortened form, used as mime cache key and short upload response.
    pub fn to_short(&self) -> String {
        format!("{}-{}", self.algo.name(), SHORT_ENGINE.encode(&self.digest))
    }
}

/// Parse each name as a canonical reference, falling back to the short form.
///
/// Stops at the first name that parses as neither.
pub fn parse_many<S: AsRef<str>>(names: &[S]) -> Result<Vec<BlobRef>> {
    let mut items = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let br = match BlobRef::parse(name) {
            Ok(v) => v,
            Err(_) => BlobRef::from_short(name)?,
        };
        items.push(br);
    }
    Ok(items)
}

impl FromStr for BlobRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<BlobRef> {
        BlobRef::parse(s)
    }
}

impl TryFrom<String> for BlobRef {
    type Error = Error;

    fn try_from(s: String) -> Result<BlobRef> {
        BlobRef::parse(&s)
    }
}

impl From<BlobRef> for String {
    fn from(br: BlobRef) -> String {
        br.to_string()
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}-{}", self.algo.name(), self.hex_digest())
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_many, BlobRef, HashAlgo};
    use crate::error::Error;

    const SHA1_FOO: &str = "sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33";

    #[test]
    fn test_parse_canonical() {
        let br = BlobRef::parse(SHA1_FOO).unwrap();
        assert_eq!(br.algo(), HashAlgo::Sha1);
        assert_eq!(br.digest().len(), 20);
        assert_eq!(br.to_string(), SHA1_FOO);
    }

    #[test]
    fn test_parse_invalid() {
        for s in [
            "sha10beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33",
            "sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a3",
            "sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a3z",
            "sha1-0BEEC7B5EA3F0FDBC95D0DD47F3C5BC275DA8A33",
            "md5-0beec7b5ea3f0fdbc95d0dd47f3c5bc2",
            "",
        ] {
            match BlobRef::parse(s) {
                Err(Error::InvalidReference(_)) => {},
                other => panic!("expected invalid reference for {:?}, got {:?}", s, other),
            }
        }
    }

    #[test]
    fn test_short_roundtrip() {
        let br = BlobRef::parse(SHA1_FOO).unwrap();
        let short = br.to_short();
        assert!(short.starts_with("sha1-"));
        assert_ne!(short, SHA1_FOO);
        assert_eq!(BlobRef::from_short(&short).unwrap(), br);

        let br = BlobRef::for_content(b"foo");
        assert_eq!(BlobRef::from_short(&br.to_short()).unwrap(), br);
    }

    #[test]
    fn test_short_without_padding() {
        let br = BlobRef::parse(SHA1_FOO).unwrap();
        let short = br.to_short();
        let trimmed = short.trim_end_matches('=');
        assert_eq!(BlobRef::from_short(trimmed).unwrap(), br);
    }

    #[test]
    fn test_short_invalid() {
        assert!(BlobRef::from_short("sha1").is_err());
        assert!(BlobRef::from_short("sha1-!!!!").is_err());
        // decodes, but wrong digest length
        assert!(BlobRef::from_short("sha1-Zm9v").is_err());
    }

    #[test]
    fn test_parse_many() {
        let br = BlobRef::for_content(b"bar");
        let short = br.to_short();
        let items = parse_many(&[SHA1_FOO, short.as_str()]).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].to_string(), SHA1_FOO);
        assert_eq!(items[1], br);

        assert!(parse_many(&[SHA1_FOO, "bogus", short.as_str()]).is_err());
        assert!(parse_many::<&str>(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_serde_as_string() {
        let br = BlobRef::parse(SHA1_FOO).unwrap();
        let s = serde_json::to_string(&br).unwrap();
        assert_eq!(s, format!("\"{}\"", SHA1_FOO));
        let back: BlobRef = serde_json::from_str(&s).unwrap();
        assert_eq!(back, br);
    }
}
