//! Reactor state: credentials, forward lists, and the live-session table.

use crate::protocol::wire::SocksCmd;
use crate::reactor::forward::{self, Forward};
use crate::reactor::session::Session;
use crate::reactor::Commands;
use crate::tunnel::{ForwardSpec, ProxyConfig, ReadyCallback, StatusCallback, TunnelStatus};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct Core {
    queue: Arc<Commands>,
    proxy: RefCell<Option<ProxyConfig>>,
    status: RefCell<Option<StatusCallback>>,
    forwards: RefCell<Vec<Rc<Forward>>>,
    reverse_forwards: RefCell<Vec<Rc<Forward>>>,
    sessions: RefCell<HashMap<u64, Rc<Session>>>,
    next_forward_id: Cell<u64>,
    next_session_id: Cell<u64>,
}

impl Core {
    pub(crate) fn new(queue: Arc<Commands>) -> Self {
        Self {
            queue,
            proxy: RefCell::new(None),
            status: RefCell::new(None),
            forwards: RefCell::new(Vec::new()),
            reverse_forwards: RefCell::new(Vec::new()),
            sessions: RefCell::new(HashMap::new()),
            next_forward_id: Cell::new(1),
            next_session_id: Cell::new(1),
        }
    }

    /// Queue a follow-up command from inside the reactor.
    pub(crate) fn post(&self, command: impl FnOnce(&Rc<Core>) + Send + 'static) {
        self.queue.push_from_reactor(Box::new(command));
    }

    /// Deliver a status report to the host, if a callback is installed.
    pub(crate) fn emit(&self, status: TunnelStatus) {
        if let Some(callback) = self.status.borrow().as_ref() {
            callback(status);
        }
    }

    pub(crate) fn proxy(&self) -> Option<ProxyConfig> {
        self.proxy.borrow().clone()
    }

    pub(crate) fn register_forward(
        &self,
        command: SocksCmd,
        spec: ForwardSpec,
        ready: Option<ReadyCallback>,
    ) {
        let id = self.next_forward_id.get();
        self.next_forward_id.set(id + 1);
        let fwd = Rc::new(Forward::new(id, command, spec, ready));
        match command {
            SocksCmd::Connect => {
                info!(
                    "[Reactor] add forward: listen {}:{} -> {}:{}",
                    fwd.listen_host,
                    fwd.listen_port.get(),
                    fwd.remote_host,
                    fwd.remote_port
                );
                self.forwards.borrow_mut().push(fwd);
            }
            SocksCmd::Bind => {
                info!(
                    "[Reactor] add reverse forward: {}:{}",
                    fwd.remote_host, fwd.remote_port
                );
                self.reverse_forwards.borrow_mut().push(fwd);
            }
        }
    }

    pub(crate) fn find_forward(&self, id: u64) -> Option<Rc<Forward>> {
        if let Some(fwd) = self.forwards.borrow().iter().find(|f| f.id == id) {
            return Some(Rc::clone(fwd));
        }
        self.reverse_forwards
            .borrow()
            .iter()
            .find(|f| f.id == id)
            .map(Rc::clone)
    }

    /// Store proxy credentials and dispatch every registered forward.
    ///
    /// Reverse forwards dial immediately; local forwards bind their
    /// listeners. Each dispatch is its own command so a failing forward
    /// cannot starve the others.
    pub(crate) fn start_tunnel(&self, proxy: ProxyConfig, status: Option<StatusCallback>) {
        info!(
            "[Reactor] tunnel -> host:{}:{} user:{}",
            proxy.host, proxy.port, proxy.username
        );
        *self.proxy.borrow_mut() = Some(proxy);
        *self.status.borrow_mut() = status;

        let reverse: Vec<u64> = self.reverse_forwards.borrow().iter().map(|f| f.id).collect();
        for id in reverse {
            self.post(move |core| {
                if let Some(fwd) = core.find_forward(id) {
                    forward::spawn_reverse_session(core, &fwd);
                }
            });
        }

        let connect: Vec<u64> = self.forwards.borrow().iter().map(|f| f.id).collect();
        for id in connect {
            self.post(move |core| {
                if let Some(fwd) = core.find_forward(id) {
                    forward::start_listener(core, &fwd);
                }
            });
        }
    }

    pub(crate) fn alloc_session_id(&self) -> u64 {
        let id = self.next_session_id.get();
        self.next_session_id.set(id + 1);
        id
    }

    pub(crate) fn insert_session(&self, session: &Rc<Session>) {
        let mut sessions = self.sessions.borrow_mut();
        sessions.insert(session.id(), Rc::clone(session));
        debug!(
            "[Reactor] Session {} opened ({} live)",
            session.id(),
            sessions.len()
        );
    }

    pub(crate) fn remove_session(&self, id: u64) {
        let mut sessions = self.sessions.borrow_mut();
        if sessions.remove(&id).is_some() {
            debug!("[Reactor] Session {} closed ({} live)", id, sessions.len());
        }
    }

    /// Schedule a fresh reverse session to replace a dropped one.
    pub(crate) fn schedule_redial(&self, forward_id: u64) {
        self.post(move |core| {
            if let Some(fwd) = core.find_forward(forward_id) {
                forward::spawn_reverse_session(core, &fwd);
            }
        });
    }
}
