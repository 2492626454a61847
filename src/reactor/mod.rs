//! Single-threaded reactor: one worker thread owns every socket, forward
//! record, and session. External calls arrive as queued commands.

pub(crate) mod core;
pub(crate) mod forward;
pub(crate) mod queue;
pub(crate) mod session;

use self::core::Core;
use self::queue::CommandQueue;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// A queued call, run on the reactor thread with access to its state.
pub(crate) type Command = Box<dyn FnOnce(&Rc<Core>) + Send>;

pub(crate) type Commands = CommandQueue<Command>;

/// Reactor main loop: drain the queue, run each command, park until woken.
///
/// Sessions and listeners run as local tasks next to this loop; they all die
/// with it when the loop returns and the enclosing task set is dropped.
pub(crate) async fn run(queue: Arc<Commands>) {
    let core = Rc::new(Core::new(Arc::clone(&queue)));
    debug!("[Reactor] Event loop started");
    loop {
        let (commands, shutdown) = queue.take_all();
        for command in commands {
            command(&core);
        }
        if shutdown {
            break;
        }
        queue.wakeup().await;
    }
    debug!("[Reactor] Event loop stopped");
}
