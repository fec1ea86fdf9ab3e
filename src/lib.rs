#![crate_name = "camproxy"]

//! camproxy is an HTTP proxy in front of a content-addressed blob store.
//!
//! Content is uploaded with a `POST` to `/` and served back with a `GET` of its reference.
//! References have the form `<algo>-<hex digest>`, e.g.
//!
//! ``` ignore,
//! sha224-0808f64e60d58979fcb676c96ec938270dea42445aeefcd3a4e6f8db
//! ```
//!
//! A base64-shortened form `<algo>-<url-safe base64 digest>` is accepted wherever a
//! reference is.
//!
//! ## Uploading content
//!
//! A single-file body is stored as one file, named after the `filename` parameter of its
//! `Content-Disposition` header if there is one. A `multipart/form-data` body may carry
//! several files; when it does, they are stored together as one directory. The response is
//! `201` with the content reference on the first line. With `permanode=1` a permanode is
//! created too and its reference is the second line. With `short=1` both come in short
//! form.
//!
//! The modification time of an uploaded file is taken from the `Last-Modified` header or
//! the `mtime` query parameter.
//!
//! ## Retrieving content
//!
//! `GET /<reference>` returns the blob itself, for a file that is its JSON schema. With
//! `raw=1` the content the file schema describes is returned instead, typed from the
//! `mimeType` parameter, from the type recorded for the content earlier, or else sniffed
//! from the first bytes.
//!
//! ## Running the daemon
//!
//! The daemon listens on all interfaces on port 3178 by default. Setting `CAMLI_AUTH` to
//! `userpass:<user>:<password>` requires HTTP Basic authentication. See
//! `cargo run --bin camproxy -- --help` for the other options.
//!
//! A helper tool [camproxy_get](../camproxy_get/index.html) writes blobs to a local
//! directory, recreating the files and directories they describe.

/// Command line settings.
pub mod arg;

/// HTTP Basic authentication.
pub mod auth;

/// Blob references and their short encoding.
pub mod blobref;

/// Per-server downloaders with a disk cache and a recovery fallback.
pub mod download;

pub mod error;

/// Resolve blob trees into files on disk.
pub mod fetch;

/// Store and serve MIME metadata for content.
pub mod meta;

pub mod paranoid;

/// Encapsulates an incoming remote request.
pub mod request;

/// Encapsulates an outgoing response to remote.
pub mod response;

/// Schema blobs describing files, directories and sets.
pub mod schema;

pub mod server;

/// Blob store interfaces and a directory-backed store.
pub mod store;

/// Save upload bodies into temporary files.
pub mod upload;
