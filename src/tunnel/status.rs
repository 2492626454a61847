//! Status reporting from the reactor to the host.

/// Condition kinds delivered to the status callback.
///
/// Every kind except [`Ok`](TunnelStatus::Ok) reports a failed session or
/// listener. A failure never takes the tunnel down; whether to retry, alert,
/// or give up is the host's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// No error.
    Ok,
    /// The proxy rejected the greeting or picked an unsupported auth method.
    Handshake,
    /// The proxy rejected the submitted credentials.
    Auth,
    /// The proxy refused the forward request, or the request address was not
    /// an IPv4 literal.
    Forward,
    /// A TCP connect failed: to the proxy, or to the local target of a
    /// reverse forward.
    Connect,
    /// Name resolution failed.
    DnsResolve,
    /// Name resolution produced no usable IPv4 address.
    DnsAddrInfo,
    /// A local listener could not be set up.
    LocalServer,
    /// The local endpoint hit a read error or EOF.
    LocalRead,
    /// The remote endpoint hit a read error or EOF.
    RemoteRead,
    /// Reserved: starting a read cannot fail separately on this runtime.
    RemoteReadStart,
}

/// Status callback. Runs on the reactor thread and must not block.
pub type StatusCallback = Box<dyn Fn(TunnelStatus) + Send + 'static>;

/// Listener-ready callback: `(remote_host, remote_port, listen_host,
/// listen_port)`. Runs on the reactor thread and must not block.
///
/// For a local forward the last two arguments name the bound local listener;
/// for a reverse forward they name the proxy host and the port the proxy is
/// listening on. Fired once per local forward, and once per reverse-forward
/// bind cycle.
pub type ReadyCallback = Box<dyn Fn(&str, u16, &str, u16) + Send + 'static>;
