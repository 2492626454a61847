//! Common test utilities and helpers

use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tunsocks::{ProxyConfig, ReadyCallback, StatusCallback, TunnelStatus};

/// How long tests wait for a callback or a socket event.
#[allow(dead_code)]
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A listener-ready notification: (remote_host, remote_port, listen_host,
/// listen_port).
pub type ReadyEvent = (String, u16, String, u16);

/// Build a status callback that forwards every report to a channel.
#[allow(dead_code)]
pub fn status_channel() -> (StatusCallback, Receiver<TunnelStatus>) {
    let (tx, rx) = mpsc::channel();
    let callback: StatusCallback = Box::new(move |status| {
        let _ = tx.send(status);
    });
    (callback, rx)
}

/// Build a ready callback that forwards every notification to a channel.
#[allow(dead_code)]
pub fn ready_channel() -> (ReadyCallback, Receiver<ReadyEvent>) {
    let (tx, rx) = mpsc::channel();
    let callback: ReadyCallback =
        Box::new(move |remote_host, remote_port, listen_host, listen_port| {
            let _ = tx.send((
                remote_host.to_string(),
                remote_port,
                listen_host.to_string(),
                listen_port,
            ));
        });
    (callback, rx)
}

/// Poll a channel without blocking the test runtime.
#[allow(dead_code)]
pub async fn recv_event<T>(rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    let start = std::time::Instant::now();
    loop {
        if let Ok(event) = rx.try_recv() {
            return Some(event);
        }
        if start.elapsed() > timeout {
            return None;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Proxy config pointing at a fake proxy bound on localhost.
#[allow(dead_code)]
pub fn proxy_config(port: u16) -> ProxyConfig {
    ProxyConfig::new("127.0.0.1", port, "user", "password")
}

/// Read and check the client greeting: must advertise exactly
/// username/password auth.
#[allow(dead_code)]
pub async fn expect_greeting(stream: &mut TcpStream) -> anyhow::Result<()> {
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await?;
    anyhow::ensure!(buf == [0x05, 0x01, 0x02], "unexpected greeting: {buf:?}");
    Ok(())
}

/// Read the auth request and return the submitted credentials.
#[allow(dead_code)]
pub async fn expect_auth(stream: &mut TcpStream) -> anyhow::Result<(String, String)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    anyhow::ensure!(header[0] == 0x01, "unexpected auth version: {}", header[0]);

    let mut user = vec![0u8; header[1] as usize];
    stream.read_exact(&mut user).await?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut pass = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut pass).await?;

    Ok((String::from_utf8(user)?, String::from_utf8(pass)?))
}

/// Read the 10-byte command request and return (cmd, addr, port).
#[allow(dead_code)]
pub async fn expect_request(stream: &mut TcpStream) -> anyhow::Result<(u8, Ipv4Addr, u16)> {
    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).await?;
    anyhow::ensure!(buf[0] == 0x05, "unexpected request version: {}", buf[0]);
    anyhow::ensure!(buf[3] == 0x01, "unexpected address type: {}", buf[3]);
    let addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    let port = u16::from_be_bytes([buf[8], buf[9]]);
    Ok((buf[1], addr, port))
}

/// Run the happy-path handshake on a freshly accepted proxy connection:
/// accept the greeting and credentials, then return the parsed request
/// without replying to it.
#[allow(dead_code)]
pub async fn accept_handshake(stream: &mut TcpStream) -> anyhow::Result<(u8, Ipv4Addr, u16)> {
    expect_greeting(stream).await?;
    stream.write_all(&[0x05, 0x02]).await?;
    let (user, pass) = expect_auth(stream).await?;
    anyhow::ensure!(user == "user", "unexpected username: {user}");
    anyhow::ensure!(pass == "password", "unexpected password: {pass}");
    stream.write_all(&[0x01, 0x00]).await?;
    expect_request(stream).await
}

/// Success reply with a zero bound address.
#[allow(dead_code)]
pub const REPLY_OK: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Reserve an ephemeral port by binding and immediately releasing it.
#[allow(dead_code)]
pub fn reserve_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
