//! Minimal NTPv4 server so guests get time without leaving the sandbox.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ServiceHandle, service_error};
use crate::netns::NetNs;

const PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const STRATUM: u8 = 1;
const REFERENCE_ID: &[u8; 4] = b"LOCL";
/// log2 seconds, about a microsecond.
const PRECISION: i8 = -20;

fn ntp_timestamp(t: SystemTime) -> [u8; 8] {
    let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    // Era rollover in 2036 wraps the seconds field, as NTP expects.
    let secs = (since_unix.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000) as u32;
    let mut out = [0u8; 8];
    let (s, f) = out.split_at_mut(4);
    s.copy_from_slice(&secs.to_be_bytes());
    f.copy_from_slice(&frac.to_be_bytes());
    out
}

/// Build the server reply to `request`, or `None` if it is not a client query.
fn respond(request: &[u8], received: SystemTime, now: SystemTime) -> Option<Vec<u8>> {
    if request.len() < PACKET_LEN {
        return None;
    }
    let first = *request.first()?;
    if first & 0x07 != MODE_CLIENT {
        return None;
    }
    let version = (first >> 3) & 0x07;
    let poll = *request.get(2)?;
    let origin = request.get(40..48)?;

    let mut out = Vec::with_capacity(PACKET_LEN);
    out.push((version << 3) | MODE_SERVER);
    out.push(STRATUM);
    out.push(poll);
    out.push(PRECISION as u8);
    out.extend_from_slice(&0u32.to_be_bytes()); // root delay
    out.extend_from_slice(&0u32.to_be_bytes()); // root dispersion
    out.extend_from_slice(REFERENCE_ID);
    out.extend_from_slice(&ntp_timestamp(now)); // reference
    out.extend_from_slice(origin);
    out.extend_from_slice(&ntp_timestamp(received));
    out.extend_from_slice(&ntp_timestamp(now)); // transmit
    Some(out)
}

/// Answer NTP queries on `addr` inside `ns`.
pub async fn start_ntp(ns: &Arc<NetNs>, addr: SocketAddr) -> fleet::Result<ServiceHandle> {
    let std_socket = ns
        .run(move || {
            let socket = std::net::UdpSocket::bind(addr)?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        })
        .await
        .map_err(|e| service_error("ntp", format!("bind {addr}: {e}")))?;
    let socket = UdpSocket::from_std(std_socket).map_err(|e| service_error("ntp", e))?;
    let addr = socket.local_addr().map_err(|e| service_error("ntp", e))?;

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let (len, peer) = tokio::select! {
                r = socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "ntp recv failed");
                        continue;
                    }
                },
                () = token.cancelled() => break,
            };
            let received = SystemTime::now();
            let Some(request) = buf.get(..len) else {
                continue;
            };
            if let Some(reply) = respond(request, received, SystemTime::now())
                && let Err(e) = socket.send_to(&reply, peer).await
            {
                debug!(%peer, error = %e, "ntp send failed");
            }
        }
    });
    info!(service = "ntp", %addr, "service started");
    Ok(ServiceHandle::new("ntp", addr, shutdown, task))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_request(version: u8, transmit: [u8; 8]) -> Vec<u8> {
        let mut req = vec![0u8; PACKET_LEN];
        req[0] = (version << 3) | MODE_CLIENT;
        req[2] = 6;
        req[40..48].copy_from_slice(&transmit);
        req
    }

    #[test]
    fn timestamp_of_unix_epoch() {
        assert_eq!(
            ntp_timestamp(UNIX_EPOCH),
            [0x83, 0xaa, 0x7e, 0x80, 0, 0, 0, 0]
        );
        let half = ntp_timestamp(UNIX_EPOCH + Duration::from_millis(500));
        assert_eq!(&half[4..], &[0x80, 0, 0, 0]);
    }

    #[test]
    fn reply_echoes_origin_and_version() {
        let origin = [1, 2, 3, 4, 5, 6, 7, 8];
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let reply = respond(&client_request(3, origin), t, t).unwrap();
        assert_eq!(reply.len(), PACKET_LEN);
        assert_eq!(reply[0], (3 << 3) | MODE_SERVER);
        assert_eq!(reply[1], STRATUM);
        assert_eq!(reply[2], 6);
        assert_eq!(&reply[12..16], b"LOCL");
        assert_eq!(&reply[24..32], &origin);
        assert_eq!(&reply[32..40], &ntp_timestamp(t));
        assert_eq!(&reply[40..48], &ntp_timestamp(t));
    }

    #[test]
    fn non_client_packets_are_ignored() {
        let mut req = client_request(4, [0; 8]);
        req[0] = (4 << 3) | MODE_SERVER;
        assert!(respond(&req, UNIX_EPOCH, UNIX_EPOCH).is_none());
        assert!(respond(&[0x23; 10], UNIX_EPOCH, UNIX_EPOCH).is_none());
    }
}
