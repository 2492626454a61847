//! Local (CONNECT) forward tests against a fake SOCKS5 proxy

mod common;

use common::*;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tunsocks::{ForwardSpec, Tunnel, TunnelStatus};

#[tokio::test]
async fn connect_forward_relays_bytes() -> anyhow::Result<()> {
    let proxy = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_port = proxy.local_addr()?.port();

    tokio::spawn(async move {
        let (mut stream, _) = proxy.accept().await.unwrap();
        let (cmd, addr, port) = accept_handshake(&mut stream).await.unwrap();
        assert_eq!(cmd, 0x01);
        assert_eq!(addr, Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(port, 7000);
        stream.write_all(&REPLY_OK).await.unwrap();

        // Play the remote endpoint behind the proxy.
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").await.unwrap();
        // Hold the connection open until the peer is done.
        let _ = stream.read(&mut [0u8; 1]).await;
    });

    let tunnel = Tunnel::new()?;
    let (ready, ready_rx) = ready_channel();
    tunnel.add_forward(
        ForwardSpec::new("127.0.0.1", 0, "192.0.2.10", 7000),
        Some(ready),
    )?;
    tunnel.start(proxy_config(proxy_port), None)?;

    // Port 0 gets replaced by the kernel-assigned port before the callback.
    let (remote_host, remote_port, listen_host, listen_port) =
        recv_event(&ready_rx, EVENT_TIMEOUT).await.expect("listener ready");
    assert_eq!(remote_host, "192.0.2.10");
    assert_eq!(remote_port, 7000);
    assert_eq!(listen_host, "127.0.0.1");
    assert_ne!(listen_port, 0);

    let mut peer = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    peer.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    timeout(EVENT_TIMEOUT, peer.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"world");
    Ok(())
}

#[tokio::test]
async fn auth_rejected_keeps_listener_accepting() -> anyhow::Result<()> {
    let proxy = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_port = proxy.local_addr()?.port();

    tokio::spawn(async move {
        // First session: reject the credentials.
        let (mut stream, _) = proxy.accept().await.unwrap();
        expect_greeting(&mut stream).await.unwrap();
        stream.write_all(&[0x05, 0x02]).await.unwrap();
        let _ = expect_auth(&mut stream).await.unwrap();
        stream.write_all(&[0x01, 0x01]).await.unwrap();
        // The session tears down; wait for its EOF.
        let _ = stream.read(&mut [0u8; 16]).await;
        drop(stream);

        // Second session: full success plus a tiny echo exchange.
        let (mut stream, _) = proxy.accept().await.unwrap();
        let _ = accept_handshake(&mut stream).await.unwrap();
        stream.write_all(&REPLY_OK).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();
        let _ = stream.read(&mut [0u8; 1]).await;
    });

    let tunnel = Tunnel::new()?;
    let (ready, ready_rx) = ready_channel();
    let (status, status_rx) = status_channel();
    tunnel.add_forward(
        ForwardSpec::new("127.0.0.1", 0, "192.0.2.10", 7000),
        Some(ready),
    )?;
    tunnel.start(proxy_config(proxy_port), Some(status))?;

    let (_, _, _, listen_port) = recv_event(&ready_rx, EVENT_TIMEOUT)
        .await
        .expect("listener ready");

    let _first = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    let reported = recv_event(&status_rx, EVENT_TIMEOUT).await;
    assert_eq!(reported, Some(TunnelStatus::Auth));

    // The listener must still serve the next client.
    let mut second = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    second.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    timeout(EVENT_TIMEOUT, second.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"pong");
    Ok(())
}

#[tokio::test]
async fn bad_greeting_reply_stops_session() -> anyhow::Result<()> {
    let proxy = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_port = proxy.local_addr()?.port();

    let tunnel = Tunnel::new()?;
    let (ready, ready_rx) = ready_channel();
    let (status, status_rx) = status_channel();
    tunnel.add_forward(
        ForwardSpec::new("127.0.0.1", 0, "192.0.2.10", 7000),
        Some(ready),
    )?;
    tunnel.start(proxy_config(proxy_port), Some(status))?;

    let (_, _, _, listen_port) = recv_event(&ready_rx, EVENT_TIMEOUT)
        .await
        .expect("listener ready");
    let _peer = TcpStream::connect(("127.0.0.1", listen_port)).await?;

    let (mut stream, _) = proxy.accept().await?;
    expect_greeting(&mut stream).await?;
    stream.write_all(&[0x04, 0x02]).await?;

    let reported = recv_event(&status_rx, EVENT_TIMEOUT).await;
    assert_eq!(reported, Some(TunnelStatus::Handshake));

    // The session must go down without sending anything further.
    let mut buf = [0u8; 16];
    let n = timeout(EVENT_TIMEOUT, stream.read(&mut buf)).await??;
    assert_eq!(n, 0, "expected EOF, got {:?}", &buf[..n]);
    Ok(())
}

#[tokio::test]
async fn remote_eof_closes_local_peer() -> anyhow::Result<()> {
    let proxy = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_port = proxy.local_addr()?.port();

    tokio::spawn(async move {
        let (mut stream, _) = proxy.accept().await.unwrap();
        let _ = accept_handshake(&mut stream).await.unwrap();
        stream.write_all(&REPLY_OK).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        // Drop the proxy side of the tunnel.
    });

    let tunnel = Tunnel::new()?;
    let (ready, ready_rx) = ready_channel();
    let (status, status_rx) = status_channel();
    tunnel.add_forward(
        ForwardSpec::new("127.0.0.1", 0, "192.0.2.10", 7000),
        Some(ready),
    )?;
    tunnel.start(proxy_config(proxy_port), Some(status))?;

    let (_, _, _, listen_port) = recv_event(&ready_rx, EVENT_TIMEOUT)
        .await
        .expect("listener ready");
    let mut peer = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    peer.write_all(b"hello").await?;

    let reported = recv_event(&status_rx, EVENT_TIMEOUT).await;
    assert_eq!(reported, Some(TunnelStatus::RemoteRead));

    let n = timeout(EVENT_TIMEOUT, peer.read(&mut [0u8; 8])).await??;
    assert_eq!(n, 0, "local peer should see EOF once the session is gone");
    Ok(())
}

#[tokio::test]
async fn fixed_listen_port_is_reported_verbatim() -> anyhow::Result<()> {
    let proxy_port = reserve_port()?;
    let listen_port = reserve_port()?;

    let tunnel = Tunnel::new()?;
    let (ready, ready_rx) = ready_channel();
    tunnel.add_forward(
        ForwardSpec::new("127.0.0.1", listen_port, "192.0.2.10", 7000),
        Some(ready),
    )?;
    tunnel.start(proxy_config(proxy_port), None)?;

    let (_, _, _, reported_port) = recv_event(&ready_rx, EVENT_TIMEOUT)
        .await
        .expect("listener ready");
    assert_eq!(reported_port, listen_port);

    // And the port is really accepting.
    TcpStream::connect(("127.0.0.1", listen_port)).await?;
    Ok(())
}
