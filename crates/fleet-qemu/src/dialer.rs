use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet::{FleetError, retry};
use tokio::net::TcpStream;
use tracing::debug;

use crate::netns::NetNs;

/// Dials TCP from inside a namespace, retrying with a fixed delay.
#[derive(Debug, Clone)]
pub struct NsDialer {
    ns: Arc<NetNs>,
    attempts: u32,
    delay: Duration,
    timeout: Duration,
}

impl NsDialer {
    pub fn new(ns: Arc<NetNs>, attempts: u32, delay: Duration, timeout: Duration) -> Self {
        Self {
            ns,
            attempts,
            delay,
            timeout,
        }
    }

    /// Connect to `addr`, returning the last error once attempts run out.
    pub async fn dial(&self, addr: SocketAddr) -> fleet::Result<TcpStream> {
        let timeout = self.timeout;
        let stream = retry(self.attempts, self.delay, move || async move {
            let stream = self
                .ns
                .run(move || {
                    let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
                    stream.set_nonblocking(true)?;
                    Ok(stream)
                })
                .await;
            if let Err(e) = &stream {
                debug!(ns = self.ns.name(), %addr, error = %e, "dial failed");
            }
            stream
        })
        .await
        .map_err(|e| FleetError::Namespace(format!("dial {addr}: {e}")))?;
        Ok(TcpStream::from_std(stream)?)
    }
}
