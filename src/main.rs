use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use env_logger::Env;
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};

use camproxy::arg::Settings;
use camproxy::auth::AuthSpec;
use camproxy::request::Proxy;
use camproxy::server::{bind, serve};
use camproxy::store::LocalConnector;

fn run(settings: Settings) -> camproxy::error::Result<()> {
    let auth = match settings.noauth {
        true => None,
        false => AuthSpec::from_env()?,
    };
    if let Some(v) = &auth {
        info!("requiring basic auth for {:?}", v);
    }

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&stop))?;
    }

    let proxy = Arc::new(Proxy::new(&settings, Arc::new(LocalConnector), auth)?);
    let srv = bind(&settings.host, settings.port)?;
    info!("proxying to blob store {:?}", settings.server);
    serve(&srv, proxy.clone(), &stop);
    proxy.shutdown();
    Ok(())
}

fn main() {
    let settings = match Settings::from_args() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        },
    };
    let level = match settings.verbose {
        true => "debug",
        false => "info",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if let Err(e) = run(settings) {
        error!("{}", e);
        process::exit(1);
    }
}
