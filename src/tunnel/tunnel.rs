//! Tunnel facade: owns the reactor thread and the command queue.

use crate::protocol::wire::SocksCmd;
use crate::reactor::{self, Commands};
use crate::tunnel::{ReadyCallback, StatusCallback};
use crate::util::Result;
use std::sync::Arc;
use std::thread;
use tokio::task::LocalSet;
use tracing::{debug, info};

/// Command queue capacity; producers block while it is full.
const QUEUE_CAPACITY: usize = 128;

/// Proxy endpoint and credentials for one tunnel.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }
}

/// A single forwarding rule.
///
/// For a local forward, `listen_host:listen_port` is the local listener and
/// `remote_host:remote_port` is the destination the proxy connects to. For a
/// reverse forward, `listen_host:listen_port` is the address the proxy is
/// asked to bind and `remote_host:remote_port` is the local target dialed for
/// each inbound peer. `listen_path` / `remote_path` are reserved for future
/// filesystem-path forwarding; they are stored but never interpreted.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    pub listen_host: String,
    pub listen_port: u16,
    pub listen_path: Option<String>,
    pub remote_host: String,
    pub remote_port: u16,
    pub remote_path: Option<String>,
}

impl ForwardSpec {
    pub fn new(
        listen_host: impl Into<String>,
        listen_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            listen_path: None,
            remote_host: remote_host.into(),
            remote_port,
            remote_path: None,
        }
    }
}

/// Handle for one proxy relationship.
///
/// All socket work happens on a dedicated reactor thread; the handle itself
/// is callable from any thread. Dropping it (or calling [`close`](Self::close))
/// stops the reactor, joins the thread, and releases every forward and
/// session.
pub struct Tunnel {
    queue: Arc<Commands>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Tunnel {
    /// Allocate the tunnel and start its reactor thread.
    pub fn new() -> Result<Self> {
        let queue = Arc::new(Commands::new(QUEUE_CAPACITY));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let reactor_queue = Arc::clone(&queue);
        let worker = thread::Builder::new()
            .name("tunsocks".to_string())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, reactor::run(reactor_queue));
            })?;
        Ok(Self {
            queue,
            worker: Some(worker),
        })
    }

    /// Store proxy credentials and dispatch every registered forward.
    ///
    /// Returns once the dispatch is queued; listener-ready callbacks report
    /// the actual ports as each forward comes up.
    pub fn start(&self, proxy: ProxyConfig, status: Option<StatusCallback>) -> Result<()> {
        info!(
            "[Tunnel] tunnel -> host:{}:{} user:{}",
            proxy.host, proxy.port, proxy.username
        );
        self.queue
            .push(Box::new(move |core| core.start_tunnel(proxy, status)))
    }

    /// Register a local forward: accept on `listen_host:listen_port`, relay
    /// each client through the proxy to `remote_host:remote_port`.
    ///
    /// Forwards registered before [`start`](Self::start) are dispatched by
    /// it; later registrations wait for the next `start`.
    pub fn add_forward(&self, spec: ForwardSpec, ready: Option<ReadyCallback>) -> Result<()> {
        info!(
            "[Tunnel] add forward: listen {}:{} -> {}:{}",
            spec.listen_host, spec.listen_port, spec.remote_host, spec.remote_port
        );
        self.queue.push(Box::new(move |core| {
            core.register_forward(SocksCmd::Connect, spec, ready)
        }))
    }

    /// Register a reverse forward: have the proxy bind
    /// `listen_host:listen_port` and splice each inbound peer to the local
    /// `remote_host:remote_port`.
    pub fn add_reverse_forward(
        &self,
        spec: ForwardSpec,
        ready: Option<ReadyCallback>,
    ) -> Result<()> {
        info!(
            "[Tunnel] add reverse forward: {}:{}",
            spec.remote_host, spec.remote_port
        );
        self.queue.push(Box::new(move |core| {
            core.register_forward(SocksCmd::Bind, spec, ready)
        }))
    }

    /// Stop the reactor and wait for the worker thread to finish.
    ///
    /// Commands accepted before the stop request still run on the final
    /// drain; API calls made after it fail with [`TunnelError::Closed`].
    ///
    /// [`TunnelError::Closed`]: crate::util::TunnelError::Closed
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        debug!("[Tunnel] Shutting down");
        self.queue.request_shutdown();
        if worker.join().is_err() {
            debug!("[Tunnel] Reactor thread panicked during shutdown");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
