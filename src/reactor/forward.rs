//! Forward rules: local (CONNECT) listeners and reverse (BIND) scheduling.

use crate::protocol::wire::SocksCmd;
use crate::reactor::core::Core;
use crate::reactor::session;
use crate::tunnel::{ForwardSpec, ReadyCallback, TunnelStatus};
use crate::util::net;
use std::cell::{Cell, RefCell};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const LISTEN_BACKLOG: u32 = 16;

/// One forwarding rule, owned by the reactor for the tunnel's lifetime.
pub(crate) struct Forward {
    pub(crate) id: u64,
    pub(crate) command: SocksCmd,
    pub(crate) listen_host: String,
    /// Rewritten with the kernel-assigned port when registered as 0.
    pub(crate) listen_port: Cell<u16>,
    /// Reserved for filesystem-path forwarding; stored, never interpreted.
    #[allow(dead_code)]
    pub(crate) listen_path: Option<String>,
    pub(crate) remote_host: String,
    pub(crate) remote_port: u16,
    /// Reserved for filesystem-path forwarding; stored, never interpreted.
    #[allow(dead_code)]
    pub(crate) remote_path: Option<String>,
    ready: Option<ReadyCallback>,
    server: RefCell<Option<JoinHandle<()>>>,
}

impl Forward {
    pub(crate) fn new(
        id: u64,
        command: SocksCmd,
        spec: ForwardSpec,
        ready: Option<ReadyCallback>,
    ) -> Self {
        Self {
            id,
            command,
            listen_host: spec.listen_host,
            listen_port: Cell::new(spec.listen_port),
            listen_path: spec.listen_path,
            remote_host: spec.remote_host,
            remote_port: spec.remote_port,
            remote_path: spec.remote_path,
            ready,
            server: RefCell::new(None),
        }
    }

    /// Tell the host which port is accepting connections for this rule.
    pub(crate) fn notify_ready(
        &self,
        remote_host: &str,
        remote_port: u16,
        listen_host: &str,
        listen_port: u16,
    ) {
        if let Some(callback) = &self.ready {
            callback(remote_host, remote_port, listen_host, listen_port);
        }
    }
}

/// Bind the local listener for a CONNECT forward and start accepting.
pub(crate) fn start_listener(core: &Rc<Core>, fwd: &Rc<Forward>) {
    let ip = match fwd.listen_host.parse::<Ipv4Addr>() {
        Ok(ip) => ip,
        Err(_) => {
            error!(
                "[Forward] Listen host {} is not an IPv4 literal",
                fwd.listen_host
            );
            core.emit(TunnelStatus::LocalServer);
            return;
        }
    };

    let addr = SocketAddrV4::new(ip, fwd.listen_port.get());
    let listener = match bind_listener(addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                "[Forward] Failed to listen on {}:{} for {}:{}: {}",
                fwd.listen_host,
                fwd.listen_port.get(),
                fwd.remote_host,
                fwd.remote_port,
                err
            );
            core.emit(TunnelStatus::LocalServer);
            return;
        }
    };

    let bound_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            error!("[Forward] Failed to read bound address: {}", err);
            core.emit(TunnelStatus::LocalServer);
            return;
        }
    };
    fwd.listen_port.set(bound_port);

    debug!(
        "[Forward] Listening on {}:{} -> {}:{}",
        fwd.listen_host, bound_port, fwd.remote_host, fwd.remote_port
    );
    fwd.notify_ready(
        &fwd.remote_host,
        fwd.remote_port,
        &fwd.listen_host,
        bound_port,
    );

    let handle = tokio::task::spawn_local(accept_loop(
        Rc::clone(core),
        Rc::clone(fwd),
        listener,
    ));
    fwd.server.borrow_mut().replace(handle);
}

fn bind_listener(addr: SocketAddrV4) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::V4(addr))?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(core: Rc<Core>, fwd: Rc<Forward>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("[Forward] New local connection from {}", peer);
                net::configure_tcp_stream(&stream, "local");
                session::start_connect_session(&core, &fwd, stream);
            }
            Err(err) => {
                // Keep the listener alive; the next accept may fare better.
                warn!(
                    "[Forward] Accept error on {}:{}: {}",
                    fwd.listen_host,
                    fwd.listen_port.get(),
                    err
                );
            }
        }
    }
}

/// Open one proxy session for a reverse forward.
pub(crate) fn spawn_reverse_session(core: &Rc<Core>, fwd: &Rc<Forward>) {
    debug!(
        "[Forward] Opening reverse session for {}:{}",
        fwd.remote_host, fwd.remote_port
    );
    session::start_reverse_session(core, fwd);
}
