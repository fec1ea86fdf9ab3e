//! Accept loop: one thread per request, stopped by a shared flag.
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use tiny_http::Server;

use crate::error::Result;
use crate::request::Proxy;

/// How often the accept loop looks at the stop flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn bind(host: &str, port: u16) -> Result<Server> {
    let srv = Server::http((host, port)).map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?;
    info!("listening on {:?}", srv.server_addr());
    Ok(srv)
}

/// Serve requests until `stop` is set or the listener fails.
///
/// No read or write deadlines are set on connections. A client that stalls mid-request
/// or mid-response holds its handler thread until the socket closes.
pub fn serve(srv: &Server, proxy: Arc<Proxy>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match srv.recv_timeout(POLL_INTERVAL) {
            Ok(Some(req)) => {
                let p = proxy.clone();
                let spawned = thread::Builder::new()
                    .name(String::from("camproxy-request"))
                    .spawn(move || p.handle(req));
                if let Err(e) = spawned {
                    error!("cannot spawn request handler: {}", e);
                }
            },
            Ok(None) => {},
            Err(e) => {
                error!("{}", e);
                break;
            },
        }
    }
    debug!("accept loop stopped");
}
