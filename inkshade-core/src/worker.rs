//! Background jobs that report back through a message queue.
//!
//! Workers run on their own thread and never touch viewer state. The owner
//! drains messages with [`WorkerHandle::poll`] from its event loop, or awaits
//! them with [`WorkerHandle::next`] from async code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between a worker and its owner.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent; every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half given to the worker body.
#[derive(Clone)]
pub struct WorkerContext<M> {
    sender: UnboundedSender<M>,
    token: CancellationToken,
}

impl<M> WorkerContext<M> {
    /// Returns false once the owner has gone away.
    pub fn send(&self, message: M) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.sender.is_closed()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

pub struct WorkerHandle<M> {
    name: String,
    receiver: UnboundedReceiver<M>,
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> WorkerHandle<M> {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(WorkerContext<M>) + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let context = WorkerContext {
            sender,
            token: token.clone(),
        };
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(context))?;
        debug!(worker = %name, "worker started");
        Ok(Self {
            name,
            receiver,
            token,
            thread: Some(thread),
        })
    }
}

impl<M> WorkerHandle<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drains every message delivered so far without blocking.
    pub fn poll(&mut self) -> Vec<M> {
        let mut messages = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        messages
    }

    /// Next message, or `None` once the worker has finished and the queue
    /// is empty.
    pub async fn next(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Blocking form of [`Self::next`] for callers outside an async runtime.
    pub fn blocking_next(&mut self) -> Option<M> {
        self.receiver.blocking_recv()
    }

    pub fn cancel(&self) {
        debug!(worker = %self.name, "cancelling worker");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(true, |thread| thread.is_finished())
    }

    /// Waits for the worker thread to exit.
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.name, "worker panicked");
            }
        }
    }
}

impl<M> Drop for WorkerHandle<M> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn poll_drains_messages_in_order() {
        let mut handle = WorkerHandle::spawn("count", |ctx: WorkerContext<u32>| {
            for n in 0..5 {
                ctx.send(n);
            }
        })
        .unwrap();
        let mut seen = Vec::new();
        while let Some(message) = handle.blocking_next() {
            seen.push(message);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(handle.poll().is_empty());
    }

    #[test]
    fn cancel_stops_a_cooperative_worker() {
        let handle = WorkerHandle::spawn("spin", |ctx: WorkerContext<()>| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.join();
    }

    #[tokio::test]
    async fn next_awaits_messages() {
        let mut handle = WorkerHandle::spawn("async", |ctx: WorkerContext<&'static str>| {
            ctx.send("done");
        })
        .unwrap();
        assert_eq!(handle.next().await, Some("done"));
        assert_eq!(handle.next().await, None);
    }
}
