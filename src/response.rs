use std::io::{self, Chain, Cursor, Read};
use std::str::FromStr;

use ascii::AsciiString;
use log::debug;
use tiny_http::{
    Header,
    HeaderField,
    Response,
    StatusCode,
};

use crate::error::Error;
use crate::meta::MimeCache;

/// Bytes buffered before the content type is sniffed.
pub const SNIFF_THRESHOLD: usize = 1024;

const OCTET_STREAM: &str = "application/octet-stream";

fn header(field: &str, value: &str) -> Option<Header> {
    let field = HeaderField::from_str(field).ok()?;
    let value = AsciiString::from_ascii(value).ok()?;
    Some(Header { field, value })
}

pub fn server_header_value() -> String {
    format!("camproxy/{}, tiny_http (Rust)", env!("CARGO_PKG_VERSION"))
}

/// A complete plain-text response.
pub fn text_response(status: u16, body: &str) -> Response<Cursor<Vec<u8>>> {
    let mut res = Response::from_string(body).with_status_code(StatusCode(status));
    for h in [
        header("Content-Type", "text/plain; charset=utf-8"),
        header("Server", &server_header_value()),
    ]
    .into_iter()
    .flatten()
    {
        res.add_header(h);
    }
    res
}

pub fn error_response(e: &Error) -> Response<Cursor<Vec<u8>>> {
    let mut res = text_response(e.status_code(), &e.to_string());
    if let Error::Unauthorized = e {
        if let Some(h) = header("WWW-Authenticate", "Basic realm=\"camproxy\"") {
            res.add_header(h);
        }
    }
    res
}

/// Sniff a MIME type from leading content bytes.
pub fn match_mime(prefix: &[u8]) -> Option<String> {
    if prefix.is_empty() {
        return None;
    }
    let m = tree_magic::from_u8(prefix);
    if m.is_empty() || m == OCTET_STREAM {
        return None;
    }
    Some(m)
}

fn undetermined(mime_type: &str) -> bool {
    mime_type.is_empty() || mime_type == OCTET_STREAM
}

enum State {
    Buffering,
    Passthrough,
}

/// Response body whose header is held back until the content type is known.
///
/// With a usable type up front nothing is buffered. Otherwise [fill](SniffingBody::fill)
/// reads up to [SNIFF_THRESHOLD] bytes; if that many arrive they are sniffed and the type
/// recorded in the mime cache under `name`. A stream that ends sooner goes out as-is,
/// untyped. The buffered prefix is then sent ahead of the rest of the stream.
pub struct SniffingBody<'a> {
    name: String,
    mime_type: String,
    cache: Option<&'a MimeCache>,
    prefix: Vec<u8>,
    state: State,
}

impl<'a> SniffingBody<'a> {
    pub fn new(name: &str, mime_type: &str, cache: Option<&'a MimeCache>) -> SniffingBody<'a> {
        let mut mime_type = mime_type.to_string();
        if !name.is_empty() && undetermined(&mime_type) {
            if let Some(c) = cache {
                let m = c.get(name);
                if !m.is_empty() {
                    debug!("cached content type {} for {}", m, name);
                    mime_type = m;
                }
            }
        }
        let state = match undetermined(&mime_type) {
            true => State::Buffering,
            false => State::Passthrough,
        };
        SniffingBody {
            name: name.to_string(),
            mime_type,
            cache,
            prefix: vec![],
            state,
        }
    }

    /// Whether the content type is settled.
    pub fn committed(&self) -> bool {
        matches!(self.state, State::Passthrough)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Buffer the leading bytes of `rc` and settle the content type.
    pub fn fill<R: Read + ?Sized>(&mut self, rc: &mut R) -> io::Result<()> {
        if self.committed() {
            return Ok(());
        }
        let mut buf = [0u8; SNIFF_THRESHOLD];
        while self.prefix.len() < SNIFF_THRESHOLD {
            let n = match rc.read(&mut buf[..SNIFF_THRESHOLD - self.prefix.len()]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.prefix.extend_from_slice(&buf[..n]);
        }
        if self.prefix.len() == SNIFF_THRESHOLD {
            if let Some(m) = match_mime(&self.prefix) {
                if !self.name.is_empty() {
                    if let Some(c) = self.cache {
                        c.set(&self.name, &m);
                    }
                }
                self.mime_type = m;
            }
        }
        self.state = State::Passthrough;
        Ok(())
    }

    /// The settled content type and the full body: buffered prefix, then `rest`.
    pub fn into_body<R: Read>(self, rest: R) -> (String, Chain<Cursor<Vec<u8>>, R>) {
        (self.mime_type, Cursor::new(self.prefix).chain(rest))
    }

    /// A `200` streaming the body; tiny_http picks the framing for the client's protocol.
    pub fn into_response<R: Read>(self, rest: R) -> Response<Chain<Cursor<Vec<u8>>, R>> {
        let (mime_type, body) = self.into_body(rest);
        let mut headers: Vec<Header> = header("Server", &server_header_value()).into_iter().collect();
        if !mime_type.is_empty() {
            headers.extend(header("Content-Type", &mime_type));
        }
        Response::new(StatusCode(200), headers, body, None, None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};

    use tempfile::tempdir;

    use super::{SniffingBody, SNIFF_THRESHOLD};
    use crate::meta::MimeCache;

    /// Hands out at most `step` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl<'a> Read for Trickle<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream went away"))
        }
    }

    fn drain(body: SniffingBody, rest: Trickle) -> (String, Vec<u8>) {
        let (m, mut r) = body.into_body(rest);
        let mut v = vec![];
        r.read_to_end(&mut v).unwrap();
        (m, v)
    }

    fn png_bytes(len: usize) -> Vec<u8> {
        let mut v = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        v.resize(len, 0);
        v
    }

    #[test]
    fn test_short_stream_verbatim() {
        for data in [&b""[..], &b"x"[..], &b"hello, world"[..], &[7u8; SNIFF_THRESHOLD - 1][..]] {
            let mut rc = Trickle { data, step: 5 };
            let mut body = SniffingBody::new("", "", None);
            assert!(!body.committed());
            body.fill(&mut rc).unwrap();
            assert!(body.committed());
            let (m, got) = drain(body, rc);
            assert_eq!(m, "");
            assert_eq!(got, data);
        }
    }

    #[test]
    fn test_sniffed_at_threshold() {
        let d = tempdir().unwrap();
        let cache = MimeCache::open(&d.path().join("mimecache.kv"), 0).unwrap();
        let data = png_bytes(3000);
        let mut rc = Trickle { data: &data, step: 100 };
        let mut body = SniffingBody::new("sha224-key", "", Some(&cache));
        body.fill(&mut rc).unwrap();
        assert_eq!(body.mime_type(), "image/png");
        let (m, got) = drain(body, rc);
        assert_eq!(m, "image/png");
        assert_eq!(got, data);
        assert_eq!(cache.get("sha224-key"), "image/png");
    }

    #[test]
    fn test_short_png_not_sniffed() {
        let d = tempdir().unwrap();
        let cache = MimeCache::open(&d.path().join("mimecache.kv"), 0).unwrap();
        let data = png_bytes(SNIFF_THRESHOLD - 1);
        let mut rc = Trickle { data: &data, step: 4096 };
        let mut body = SniffingBody::new("sha224-key", "", Some(&cache));
        body.fill(&mut rc).unwrap();
        assert_eq!(body.mime_type(), "");
        assert_eq!(cache.get("sha224-key"), "");
    }

    #[test]
    fn test_known_type_passthrough() {
        let mut body = SniffingBody::new("", "application/json", None);
        assert!(body.committed());
        // nothing is read ahead
        body.fill(&mut Broken).unwrap();
        let (m, got) = drain(body, Trickle { data: b"{}", step: 1 });
        assert_eq!(m, "application/json");
        assert_eq!(got, b"{}");
    }

    #[test]
    fn test_cached_type_used() {
        let d = tempdir().unwrap();
        let cache = MimeCache::open(&d.path().join("mimecache.kv"), 0).unwrap();
        cache.set("sha224-key", "text/csv");
        let body = SniffingBody::new("sha224-key", "application/octet-stream", Some(&cache));
        assert!(body.committed());
        let res = body.into_response(Trickle { data: b"a,b\n", step: 8 });
        assert_eq!(res.status_code().0, 200);
        let ct: Vec<String> = res
            .headers()
            .iter()
            .filter(|h| h.field.equiv("Content-Type"))
            .map(|h| h.value.to_string())
            .collect();
        assert_eq!(ct, vec![String::from("text/csv")]);
    }

    #[test]
    fn test_read_error_before_header() {
        let mut body = SniffingBody::new("", "", None);
        assert!(body.fill(&mut Broken).is_err());
        assert!(!body.committed());
    }
}
