//! TCP tuning for session sockets

use tokio::net::TcpStream;
use tracing::debug;

/// Keepalive probing starts after this much idle time.
const KEEPALIVE_IDLE_SECS: u64 = 120;
/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Enable low-latency options and keepalive on a session socket
/// (best-effort).
pub fn configure_tcp_stream(stream: &TcpStream, endpoint: &str) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("[Net] TCP_NODELAY failed on {} endpoint: {}", endpoint, err);
    }

    #[cfg(any(unix, windows))]
    {
        use socket2::{SockRef, TcpKeepalive};
        use std::time::Duration;

        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(KEEPALIVE_IDLE_SECS))
            .with_interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("[Net] keepalive failed on {} endpoint: {}", endpoint, err);
        }
    }
}
