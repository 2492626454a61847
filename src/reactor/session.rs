//! One proxy session: the SOCKS5 client state machine and the byte relay.
//!
//! A session pairs a remote socket (to the proxy) with a local socket (an
//! accepted client for a local forward, a dialed target for a reverse
//! forward). The remote read loop drives the handshake; once tunneled, both
//! read loops copy bytes verbatim to the opposite socket.

use crate::protocol::wire::{self, SocksCmd};
use crate::reactor::core::Core;
use crate::reactor::forward::Forward;
use crate::tunnel::TunnelStatus;
use crate::util::{net, resolve, TunnelError};
use std::cell::{Cell, RefCell};
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Per-direction read buffer size.
const BUF_MAX: usize = 1024 * 1024;

/// Handshake progress of one proxy session. Stages only ever advance; any
/// stage can drop straight to destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    None,
    Handshake,
    Authenticate,
    Establish,
    Bind,
    Tunnel,
}

/// One direction of a session: a read half and its preallocated buffer.
///
/// The buffer is reused between reads and fragments are not reassembled: a
/// proxy reply split across reads is ignored until a single read carries the
/// whole thing.
struct Endpoint {
    read: OwnedReadHalf,
    buf: Vec<u8>,
}

impl Endpoint {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            read,
            buf: vec![0u8; BUF_MAX],
        }
    }
}

/// Write halves of both sockets, guarded as one unit so a session has at
/// most one write in flight at a time across both directions.
#[derive(Default)]
struct EndpointWriters {
    local: Option<OwnedWriteHalf>,
    remote: Option<OwnedWriteHalf>,
}

pub(crate) struct Session {
    id: u64,
    forward: Rc<Forward>,
    stage: Cell<Stage>,
    writers: Mutex<EndpointWriters>,
    /// Parked until the session reaches the tunnel stage.
    local_read: RefCell<Option<Endpoint>>,
    driver: RefCell<Option<JoinHandle<()>>>,
    pump: RefCell<Option<JoinHandle<()>>>,
    destroyed: Cell<bool>,
}

impl Session {
    fn new(id: u64, forward: Rc<Forward>, local: Option<TcpStream>) -> Self {
        let mut writers = EndpointWriters::default();
        let mut local_read = None;
        if let Some(stream) = local {
            let (read, write) = stream.into_split();
            writers.local = Some(write);
            local_read = Some(Endpoint::new(read));
        }
        Self {
            id,
            forward,
            stage: Cell::new(Stage::None),
            writers: Mutex::new(writers),
            local_read: RefCell::new(local_read),
            driver: RefCell::new(None),
            pump: RefCell::new(None),
            destroyed: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn set_stage(&self, stage: Stage) {
        trace!(
            "[Session {}] stage {:?} -> {:?}",
            self.id,
            self.stage.get(),
            stage
        );
        self.stage.set(stage);
    }

    async fn write_remote(&self, data: &[u8]) -> io::Result<()> {
        let mut writers = self.writers.lock().await;
        match writers.remote.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "remote endpoint closed",
            )),
        }
    }

    async fn write_local(&self, data: &[u8]) -> io::Result<()> {
        let mut writers = self.writers.lock().await;
        match writers.local.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "local endpoint closed",
            )),
        }
    }

    async fn attach_local(&self, stream: TcpStream) {
        let (read, write) = stream.into_split();
        self.writers.lock().await.local = Some(write);
        self.local_read.borrow_mut().replace(Endpoint::new(read));
    }

    /// Tear the session down: report, unlink, stop both read loops, close
    /// both sockets. Safe to call from either read loop; runs once.
    ///
    /// `redial` asks for a replacement session when the forward is a reverse
    /// one. Only read failures pass it, so a dead proxy cannot cause a dial
    /// storm.
    pub(crate) fn destroy(&self, core: &Rc<Core>, status: Option<TunnelStatus>, redial: bool) {
        if self.destroyed.replace(true) {
            return;
        }
        if let Some(status) = status {
            core.emit(status);
        }
        core.remove_session(self.id);
        if let Some(handle) = self.driver.borrow_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.pump.borrow_mut().take() {
            handle.abort();
        }
        self.local_read.borrow_mut().take();
        if let Ok(mut writers) = self.writers.try_lock() {
            writers.local.take();
            writers.remote.take();
        }
        if redial && self.forward.command == SocksCmd::Bind {
            debug!("[Session {}] Scheduling reverse forward re-dial", self.id);
            core.schedule_redial(self.forward.id);
        }
        debug!("[Session {}] Destroyed", self.id);
    }
}

/// Start relaying local reads to the remote socket.
fn start_pump(session: &Rc<Session>, core: &Rc<Core>) {
    let Some(mut endpoint) = session.local_read.borrow_mut().take() else {
        debug!("[Session {}] No local endpoint to relay", session.id);
        return;
    };
    let pump_session = Rc::clone(session);
    let pump_core = Rc::clone(core);
    let handle = tokio::task::spawn_local(async move {
        loop {
            let n = match endpoint.read.read(&mut endpoint.buf).await {
                Ok(0) => {
                    debug!("[Session {}] Local endpoint closed", pump_session.id);
                    pump_session.destroy(&pump_core, Some(TunnelStatus::LocalRead), true);
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    error!(
                        "[Session {}] Failed to read local endpoint: {}",
                        pump_session.id, err
                    );
                    pump_session.destroy(&pump_core, Some(TunnelStatus::LocalRead), true);
                    return;
                }
            };
            if pump_session.write_remote(&endpoint.buf[..n]).await.is_err() {
                pump_session.destroy(&pump_core, Some(TunnelStatus::RemoteRead), true);
                return;
            }
        }
    });
    session.pump.borrow_mut().replace(handle);
}

/// Session for a local forward: the accepted client is already in hand.
pub(crate) fn start_connect_session(core: &Rc<Core>, fwd: &Rc<Forward>, local: TcpStream) {
    let session = Rc::new(Session::new(
        core.alloc_session_id(),
        Rc::clone(fwd),
        Some(local),
    ));
    core.insert_session(&session);
    let handle = tokio::task::spawn_local(drive(Rc::clone(core), Rc::clone(&session)));
    session.driver.borrow_mut().replace(handle);
}

/// Session for a reverse forward: the local side is dialed later, when the
/// proxy reports an inbound peer.
pub(crate) fn start_reverse_session(core: &Rc<Core>, fwd: &Rc<Forward>) {
    let session = Rc::new(Session::new(core.alloc_session_id(), Rc::clone(fwd), None));
    core.insert_session(&session);
    let handle = tokio::task::spawn_local(drive(Rc::clone(core), Rc::clone(&session)));
    session.driver.borrow_mut().replace(handle);
}

/// Dial the proxy and run the session to completion.
async fn drive(core: Rc<Core>, session: Rc<Session>) {
    let Some(proxy) = core.proxy() else {
        session.destroy(&core, None, false);
        return;
    };

    let proxy_addr = match resolve::resolve_ipv4(&proxy.host, proxy.port).await {
        Ok(addr) => addr,
        Err(err) => {
            error!("[Session {}] {}", session.id, err);
            let status = match err {
                TunnelError::NoAddress(_) => TunnelStatus::DnsAddrInfo,
                _ => TunnelStatus::DnsResolve,
            };
            session.destroy(&core, Some(status), false);
            return;
        }
    };

    let remote = match TcpStream::connect(proxy_addr).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(
                "[Session {}] Failed to connect to {}@{}:{}: {}",
                session.id, proxy.username, proxy.host, proxy.port, err
            );
            session.destroy(&core, Some(TunnelStatus::Connect), false);
            return;
        }
    };
    net::configure_tcp_stream(&remote, "remote");

    let (remote_read, remote_write) = remote.into_split();
    session.writers.lock().await.remote = Some(remote_write);
    let mut remote_ep = Endpoint::new(remote_read);

    session.set_stage(Stage::Handshake);
    if session.write_remote(&wire::greeting()).await.is_err() {
        session.destroy(&core, Some(TunnelStatus::RemoteRead), true);
        return;
    }

    loop {
        let n = match remote_ep.read.read(&mut remote_ep.buf).await {
            Ok(0) => {
                debug!("[Session {}] Remote endpoint closed", session.id);
                session.destroy(&core, Some(TunnelStatus::RemoteRead), true);
                return;
            }
            Ok(n) => n,
            Err(err) => {
                error!(
                    "[Session {}] Failed to read remote endpoint: {}",
                    session.id, err
                );
                session.destroy(&core, Some(TunnelStatus::RemoteRead), true);
                return;
            }
        };

        let reply = &remote_ep.buf[..n];
        match session.stage.get() {
            Stage::None => {}
            Stage::Handshake => {
                if n < wire::SHORT_REPLY_LEN {
                    continue;
                }
                if !wire::method_accepted(reply) {
                    error!(
                        "[Session {}] Handshake rejected by {}:{} - ver:{} method:{}",
                        session.id, proxy.host, proxy.port, reply[0], reply[1]
                    );
                    session.destroy(&core, Some(TunnelStatus::Handshake), false);
                    return;
                }
                let packet = match wire::auth_request(&proxy.username, &proxy.password) {
                    Ok(packet) => packet,
                    Err(err) => {
                        error!("[Session {}] {}", session.id, err);
                        session.destroy(&core, Some(TunnelStatus::Auth), false);
                        return;
                    }
                };
                session.set_stage(Stage::Authenticate);
                if session.write_remote(&packet).await.is_err() {
                    session.destroy(&core, Some(TunnelStatus::RemoteRead), true);
                    return;
                }
            }
            Stage::Authenticate => {
                if n < wire::SHORT_REPLY_LEN {
                    continue;
                }
                if !wire::auth_accepted(reply) {
                    error!(
                        "[Session {}] Failed to log in as {}@{}:{} - ver:{} status:{}",
                        session.id, proxy.username, proxy.host, proxy.port, reply[0], reply[1]
                    );
                    session.destroy(&core, Some(TunnelStatus::Auth), false);
                    return;
                }
                let (host, port) = match session.forward.command {
                    SocksCmd::Connect => (
                        session.forward.remote_host.as_str(),
                        session.forward.remote_port,
                    ),
                    SocksCmd::Bind => (
                        session.forward.listen_host.as_str(),
                        session.forward.listen_port.get(),
                    ),
                };
                let Ok(target) = host.parse::<Ipv4Addr>() else {
                    error!(
                        "[Session {}] Request address {} is not an IPv4 literal",
                        session.id, host
                    );
                    session.destroy(&core, Some(TunnelStatus::Forward), false);
                    return;
                };
                session.set_stage(Stage::Establish);
                let packet = wire::command_request(session.forward.command, target, port);
                if session.write_remote(&packet).await.is_err() {
                    session.destroy(&core, Some(TunnelStatus::RemoteRead), true);
                    return;
                }
            }
            Stage::Establish => {
                if n < wire::SHORT_REPLY_LEN {
                    continue;
                }
                if !wire::reply_succeeded(reply) {
                    error!(
                        "[Session {}] Failed to {} {}:{} - ver:{} status:{}",
                        session.id,
                        session.forward.command,
                        session.forward.remote_host,
                        session.forward.remote_port,
                        reply[0],
                        reply[1]
                    );
                    session.destroy(&core, Some(TunnelStatus::Forward), false);
                    return;
                }
                if session.forward.command == SocksCmd::Bind {
                    let Some(port) = wire::bound_port(reply) else {
                        continue;
                    };
                    debug!(
                        "[Session {}] Proxy listening on {}:{}",
                        session.id, proxy.host, port
                    );
                    session.forward.notify_ready(
                        &session.forward.remote_host,
                        session.forward.remote_port,
                        &proxy.host,
                        port,
                    );
                    session.set_stage(Stage::Bind);
                    continue;
                }
                session.set_stage(Stage::Tunnel);
                start_pump(&session, &core);
            }
            Stage::Bind => {
                if n < wire::SHORT_REPLY_LEN {
                    continue;
                }
                if !wire::reply_succeeded(reply) {
                    error!(
                        "[Session {}] Bind relay refused - ver:{} status:{}",
                        session.id, reply[0], reply[1]
                    );
                    session.destroy(&core, Some(TunnelStatus::Forward), false);
                    return;
                }
                // A peer reached the proxy's bound port; splice it to the
                // forward's local target.
                let addr = match resolve::resolve_ipv4(
                    &session.forward.remote_host,
                    session.forward.remote_port,
                )
                .await
                {
                    Ok(addr) => addr,
                    Err(err) => {
                        error!("[Session {}] {}", session.id, err);
                        let status = match err {
                            TunnelError::NoAddress(_) => TunnelStatus::DnsAddrInfo,
                            _ => TunnelStatus::DnsResolve,
                        };
                        session.destroy(&core, Some(status), false);
                        return;
                    }
                };
                let local = match TcpStream::connect(addr).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!(
                            "[Session {}] Failed to connect to {}:{}: {}",
                            session.id,
                            session.forward.remote_host,
                            session.forward.remote_port,
                            err
                        );
                        session.destroy(&core, Some(TunnelStatus::Connect), false);
                        return;
                    }
                };
                net::configure_tcp_stream(&local, "local");
                session.attach_local(local).await;
                session.set_stage(Stage::Tunnel);
                start_pump(&session, &core);
            }
            Stage::Tunnel => {
                if session.write_local(reply).await.is_err() {
                    session.destroy(&core, Some(TunnelStatus::LocalRead), true);
                    return;
                }
            }
        }
    }
}
