//! Services a flight runs inside its namespace for its guests.

mod files;
mod kv;
mod ntp;
mod omaha;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use fleet::FleetError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use files::start_file_server;
pub use kv::{KvStore, start_kv};
pub use ntp::start_ntp;
pub use omaha::{OmahaResponder, UPDATE_PATH, start_omaha};

use crate::netns::NetNs;

/// A running service and the means to stop it.
pub struct ServiceHandle {
    name: &'static str,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHandle {
    fn new(name: &'static str, addr: SocketAddr, shutdown: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            name,
            addr,
            shutdown,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the service and wait for it to wind down. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(service = self.name, error = %e, "service task failed");
        }
    }
}

fn service_error(name: &str, detail: impl std::fmt::Display) -> FleetError {
    FleetError::Service {
        name: name.to_string(),
        detail: detail.to_string(),
    }
}

/// Bind a TCP listener inside `ns`.
async fn bind_tcp(
    ns: &Arc<NetNs>,
    name: &str,
    addr: SocketAddr,
) -> fleet::Result<tokio::net::TcpListener> {
    let std_listener = ns
        .run(move || {
            let listener = std::net::TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .await
        .map_err(|e| service_error(name, format!("bind {addr}: {e}")))?;
    tokio::net::TcpListener::from_std(std_listener).map_err(|e| service_error(name, e))
}

/// Serve `router` on a listener bound inside `ns`.
async fn serve_http(
    ns: &Arc<NetNs>,
    name: &'static str,
    addr: SocketAddr,
    router: Router,
) -> fleet::Result<ServiceHandle> {
    let listener = bind_tcp(ns, name, addr).await?;
    let addr = listener.local_addr().map_err(|e| service_error(name, e))?;
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            e = axum::serve(listener, router.into_make_service()).into_future() => {
                warn!(service = name, "http server exited {:?}", e);
            }
            () = token.cancelled() => {}
        }
    });
    info!(service = name, %addr, "service started");
    Ok(ServiceHandle::new(name, addr, shutdown, task))
}
