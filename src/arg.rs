use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use clap::{
    App,
    Arg,
    ArgMatches,
};

use crate::download::DownloadConfig;
use crate::error::{Error, Result};

pub struct Settings {
    pub verbose: bool,
    pub insecure_tls: bool,
    pub host: String,
    pub port: u16,
    pub server: String,
    pub cap_ctime: bool,
    pub noauth: bool,
    pub paranoid: Option<PathBuf>,
    pub skip_have_cache: bool,
    pub mime_cache: PathBuf,
    pub recovery_tool: String,
}

const BIND_HOST: &str = "0.0.0.0";
const BIND_PORT: u16 = 3178;
const LISTEN: &str = ":3178";
const SERVER: &str = "localhost:3179";
const RECOVERY_TOOL: &str = "camget";

/// Split a `host:port` listen address. An empty host binds all interfaces.
pub fn parse_listen(s: &str) -> Result<(String, u16)> {
    let (host, port) = match s.rsplit_once(':') {
        Some(v) => v,
        None => return Err(Error::Config(format!("listen address {:?} has no port", s))),
    };
    let port = port
        .parse::<u16>()
        .map_err(|e| Error::Config(format!("listen port {:?}: {}", port, e)))?;
    let host = match host.trim_start_matches('[').trim_end_matches(']') {
        "" => BIND_HOST,
        v => v,
    };
    Ok((host.to_string(), port))
}

impl Settings {

    pub fn new() -> Settings {
        Settings {
            verbose: false,
            insecure_tls: false,
            host: BIND_HOST.to_string(),
            port: BIND_PORT,
            server: SERVER.to_string(),
            cap_ctime: false,
            noauth: false,
            paranoid: None,
            skip_have_cache: false,
            mime_cache: env::temp_dir().join("mimecache.kv"),
            recovery_tool: RECOVERY_TOOL.to_string(),
        }
    }

    fn bind_from_args(&mut self, arg: &ArgMatches) -> Result<()> {
        if let Some(v) = arg.value_of("listen") {
            let (host, port) = parse_listen(v)?;
            self.host = host;
            self.port = port;
        }
        if let Some(v) = arg.value_of("server") {
            self.server = v.to_string();
        }
        if let Some(v) = arg.value_of("paranoid") {
            if !v.is_empty() {
                self.paranoid = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = arg.value_of("mimecache") {
            self.mime_cache = PathBuf::from(v);
        }
        if let Some(v) = arg.value_of("recovery") {
            self.recovery_tool = v.to_string();
        }
        self.verbose = arg.is_present("verbose");
        self.insecure_tls = arg.is_present("insecure");
        self.cap_ctime = arg.is_present("capctime");
        self.noauth = arg.is_present("noauth");
        self.skip_have_cache = arg.is_present("skiphavecache");
        Ok(())
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            insecure_tls: self.insecure_tls,
            skip_disk_cache: self.skip_have_cache,
            recovery_tool: self.recovery_tool.clone(),
        }
    }

    fn app() -> App<'static, 'static> {
        let mut o = App::new("camproxy");
        o = o.version(env!("CARGO_PKG_VERSION"));
        o = o.about("HTTP upload/download proxy for a content-addressed blob store");
        o = o.arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .help("Log at debug level")
                );
        o = o.arg(
            Arg::with_name("insecure")
                .long("insecure")
                .short("k")
                .help("Do not verify the blob server's TLS certificate")
                );
        o = o.arg(
            Arg::with_name("listen")
                .long("listen")
                .value_name("host:port")
                .help("Address to listen on")
                .default_value(LISTEN)
                .takes_value(true)
                );
        o = o.arg(
            Arg::with_name("server")
                .long("server")
                .value_name("address")
                .help("Blob store address")
                .default_value(SERVER)
                .takes_value(true)
                );
        o = o.arg(
            Arg::with_name("capctime")
                .long("capctime")
                .help("Never record a creation time later than the modification time")
                );
        o = o.arg(
            Arg::with_name("noauth")
                .long("noauth")
                .help("Ignore CAMLI_AUTH and serve without authentication")
                );
        o = o.arg(
            Arg::with_name("paranoid")
                .long("paranoid")
                .value_name("dir")
                .help("Keep a copy of every single-file upload under this directory")
                .takes_value(true)
                );
        o = o.arg(
            Arg::with_name("skiphavecache")
                .long("skiphavecache")
                .help("Bypass the downloader disk cache")
                );
        o = o.arg(
            Arg::with_name("mimecache")
                .long("mimecache")
                .value_name("path")
                .help("Mime type cache file")
                .takes_value(true)
                );
        o = o.arg(
            Arg::with_name("recovery")
                .long("recovery")
                .value_name("tool")
                .help("Fetch tool run when a download fails")
                .default_value(RECOVERY_TOOL)
                .takes_value(true)
                );
        o
    }

    pub fn from_args() -> Result<Settings> {
        let arg_matches = Settings::app().get_matches();
        Settings::from_matches(&arg_matches)
    }

    fn from_matches(arg_matches: &ArgMatches) -> Result<Settings> {
        let mut settings = Settings::new();
        settings.bind_from_args(arg_matches)?;
        Ok(settings)
    }

    pub fn from_iter<I, T>(args: I) -> Result<Settings>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let arg_matches = Settings::app()
            .get_matches_from_safe(args)
            .map_err(|e| Error::Config(e.message))?;
        Settings::from_matches(&arg_matches)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{parse_listen, Settings};
    use crate::error::Error;

    #[test]
    fn test_parse_listen() {
        assert_eq!(parse_listen(":3178").unwrap(), (String::from("0.0.0.0"), 3178));
        assert_eq!(parse_listen("127.0.0.1:8080").unwrap(), (String::from("127.0.0.1"), 8080));
        assert_eq!(parse_listen("[::1]:80").unwrap(), (String::from("::1"), 80));
        assert!(parse_listen("3178").is_err());
        assert!(parse_listen(":http").is_err());
    }

    #[test]
    fn test_defaults() {
        let s = Settings::from_iter(vec!["camproxy"]).unwrap();
        assert_eq!(s.host, "0.0.0.0");
        assert_eq!(s.port, 3178);
        assert_eq!(s.server, "localhost:3179");
        assert_eq!(s.recovery_tool, "camget");
        assert!(s.paranoid.is_none());
        assert!(!s.verbose);
        assert!(s.mime_cache.ends_with("mimecache.kv"));
    }

    #[test]
    fn test_flags() {
        let s = Settings::from_iter(vec![
            "camproxy",
            "-v",
            "-k",
            "--listen",
            "localhost:9000",
            "--server",
            "/srv/blobs",
            "--capctime",
            "--noauth",
            "--paranoid",
            "/backup",
            "--skiphavecache",
            "--mimecache",
            "/var/cache/mime.db",
        ])
        .unwrap();
        assert!(s.verbose && s.insecure_tls && s.cap_ctime && s.noauth && s.skip_have_cache);
        assert_eq!(s.host, "localhost");
        assert_eq!(s.port, 9000);
        assert_eq!(s.server, "/srv/blobs");
        assert_eq!(s.paranoid, Some(PathBuf::from("/backup")));
        assert_eq!(s.mime_cache, PathBuf::from("/var/cache/mime.db"));
        let c = s.download_config();
        assert!(c.insecure_tls);
        assert!(c.skip_disk_cache);
    }

    #[test]
    fn test_bad_listen_rejected() {
        match Settings::from_iter(vec!["camproxy", "--listen", "nope"]) {
            Err(Error::Config(_)) => {},
            Err(e) => panic!("expected config error, got {:?}", e),
            Ok(_) => panic!("expected config error"),
        }
        match Settings::from_iter(vec!["camproxy", "--no-such-flag"]) {
            Err(Error::Config(_)) => {},
            Err(e) => panic!("expected config error, got {:?}", e),
            Ok(_) => panic!("expected config error"),
        }
    }
}
