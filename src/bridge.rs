//! Push-to-pull adapter over one or more channels.
//!
//! A [`Bridge`] registers a fan-out listener per channel and merges what
//! they deliver into one ordered sequence. Values pushed while nobody is
//! pulling are buffered; pulls issued while nothing is buffered wait in
//! line. At most one of the two queues is non-empty at any time, and both
//! live behind a single lock.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::message::{Message, MessageHandler};
use crate::observability::metrics;
use crate::transport::{ListenerId, Notifications};

struct Queues {
    listening: bool,
    /// Pulls waiting for a value, oldest first.
    pending: VecDeque<oneshot::Sender<Message>>,
    /// Values waiting for a pull, oldest first.
    buffered: VecDeque<Message>,
}

pub(crate) struct Shared {
    queues: Mutex<Queues>,
    listeners: Mutex<Vec<ListenerId>>,
    notifications: Arc<Notifications>,
    handler: MessageHandler,
    channels: Vec<String>,
}

impl Shared {
    fn push(&self, message: Message) {
        let mut message = self.handler.apply(message);
        let mut queues = self.queues.lock();
        if !queues.listening {
            return;
        }

        // A pull whose future was dropped hands the value to the next one.
        while let Some(pull) = queues.pending.pop_front() {
            match pull.send(message) {
                Ok(()) => {
                    metrics::record_delivery("bridge");
                    return;
                }
                Err(returned) => message = returned,
            }
        }
        queues.buffered.push_back(message);
        metrics::record_bridge_backlog(queues.buffered.len());
    }

    fn pull(&self) -> Pull {
        let mut queues = self.queues.lock();
        if !queues.listening {
            return Pull::ready(None);
        }
        if let Some(message) = queues.buffered.pop_front() {
            metrics::record_delivery("bridge");
            return Pull::ready(Some(message));
        }
        let (tx, rx) = oneshot::channel();
        queues.pending.push_back(tx);
        Pull {
            state: PullState::Waiting(rx),
        }
    }

    /// Stop listening. Returns true only for the call that performed the
    /// teardown.
    pub(crate) fn terminate(&self) -> bool {
        let pending = {
            let mut queues = self.queues.lock();
            if !queues.listening {
                return false;
            }
            queues.listening = false;
            queues.buffered.clear();
            std::mem::take(&mut queues.pending)
        };
        // Dropping the senders resolves every waiting pull with `None`.
        drop(pending);

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for id in listeners {
            self.notifications.off(id);
        }
        tracing::debug!(channels = ?self.channels, "Bridge closed");
        true
    }
}

/// An ordered pull sequence of the messages delivered on a set of channels.
///
/// Implements [`Stream`], and [`Bridge::next`] may be called through a
/// shared reference to keep several pulls outstanding at once. Dropping
/// the bridge closes it.
pub struct Bridge {
    shared: Arc<Shared>,
    in_flight: Option<Pull>,
}

impl Bridge {
    pub(crate) fn new(
        notifications: Arc<Notifications>,
        channels: Vec<String>,
        handler: MessageHandler,
    ) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                listening: true,
                pending: VecDeque::new(),
                buffered: VecDeque::new(),
            }),
            listeners: Mutex::new(Vec::with_capacity(channels.len())),
            notifications: Arc::clone(&notifications),
            handler,
            channels,
        });

        let ids: Vec<ListenerId> = shared
            .channels
            .iter()
            .map(|channel| {
                let target = Arc::downgrade(&shared);
                notifications.on(
                    channel.clone(),
                    Arc::new(move |message| {
                        if let Some(shared) = target.upgrade() {
                            shared.push(message);
                        }
                    }),
                )
            })
            .collect();
        *shared.listeners.lock() = ids;

        tracing::debug!(channels = ?shared.channels, "Bridge listening");
        Self {
            shared,
            in_flight: None,
        }
    }

    /// Request the next message.
    ///
    /// The request joins the queue when this is called, not when the
    /// returned future is first polled. It resolves to `None` once the
    /// bridge is closed. Dropping the [`Pull`] withdraws the request.
    pub fn next(&self) -> Pull {
        self.shared.pull()
    }

    /// Close the bridge. Idempotent.
    ///
    /// Waiting pulls and every later pull resolve to `None`, buffered
    /// values are discarded and the channel listeners are removed.
    pub fn close(&self) {
        self.shared.terminate();
    }

    /// Close the bridge and hand `error` back to the caller.
    pub fn fail<T>(&self, error: Error) -> Result<T> {
        self.shared.terminate();
        Err(error)
    }

    pub fn is_listening(&self) -> bool {
        self.shared.queues.lock().listening
    }

    /// Number of values waiting for a pull.
    pub fn buffered_len(&self) -> usize {
        self.shared.queues.lock().buffered.len()
    }

    /// Number of pulls waiting for a value.
    pub fn pending_len(&self) -> usize {
        self.shared
            .queues
            .lock()
            .pending
            .iter()
            .filter(|pull| !pull.is_closed())
            .count()
    }

    pub fn channels(&self) -> &[String] {
        &self.shared.channels
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }
}

impl Stream for Bridge {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        let this = self.get_mut();
        let shared = &this.shared;
        let pull = this.in_flight.get_or_insert_with(|| shared.pull());
        let message = ready!(Pin::new(pull).poll(cx));
        this.in_flight = None;
        Poll::Ready(message)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

enum PullState {
    Ready(Option<Message>),
    Waiting(oneshot::Receiver<Message>),
    Done,
}

/// A pending request for the next message of a [`Bridge`].
#[must_use = "dropping a pull withdraws it"]
pub struct Pull {
    state: PullState,
}

impl Pull {
    fn ready(message: Option<Message>) -> Self {
        Self {
            state: PullState::Ready(message),
        }
    }
}

impl Future for Pull {
    type Output = Option<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            PullState::Ready(message) => {
                let message = message.take();
                this.state = PullState::Done;
                Poll::Ready(message)
            }
            PullState::Waiting(rx) => {
                let message = ready!(Pin::new(rx).poll(cx)).ok();
                this.state = PullState::Done;
                Poll::Ready(message)
            }
            PullState::Done => Poll::Ready(None),
        }
    }
}
