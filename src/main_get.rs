use std::path::Path;
use std::process;
use std::sync::Arc;

use clap::{
    App,
    Arg,
};
use env_logger::Env;
use log::{debug, error};

use camproxy::blobref::parse_many;
use camproxy::download::{DownloadConfig, Downloaders};
use camproxy::store::LocalConnector;

fn main() {
    let mut o = App::new("camproxy_get");
    o = o.version(env!("CARGO_PKG_VERSION"));
    o = o.about("Fetch blobs from the store into a directory, resolving files and directories");

    o = o.arg(Arg::with_name("REF")
              .required(true)
              .multiple(true)
              );

    o = o.arg(Arg::with_name("output")
              .short("o")
              .long("output")
              .value_name("dir")
              .default_value(".")
              .takes_value(true)
              );

    o = o.arg(Arg::with_name("server")
              .long("server")
              .value_name("address")
              .default_value("localhost:3179")
              .takes_value(true)
              );

    o = o.arg(Arg::with_name("skiphavecache")
              .long("skiphavecache")
              );

    o = o.arg(Arg::with_name("verbose")
              .short("v")
              .long("verbose")
              );

    let args = o.get_matches();

    let level = match args.is_present("verbose") {
        true => "debug",
        false => "info",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let names: Vec<&str> = args.values_of("REF").map(|v| v.collect()).unwrap_or_default();
    let items = match parse_many(&names) {
        Ok(v) => v,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        },
    };
    let dest = Path::new(args.value_of("output").unwrap_or("."));
    let server = args.value_of("server").unwrap_or("localhost:3179");

    let config = DownloadConfig {
        skip_disk_cache: args.is_present("skiphavecache"),
        ..DownloadConfig::default()
    };
    let downloaders = Downloaders::new(Arc::new(LocalConnector), config);
    let r = downloaders.get(server).and_then(|d| {
        debug!("saving {:?} to {:?}", items, dest);
        d.save(dest, &items)
    });
    downloaders.close();
    if let Err(e) = r {
        error!("{}", e);
        process::exit(1);
    }
}
