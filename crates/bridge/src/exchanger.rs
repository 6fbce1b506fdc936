use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use crate::{
    INBOUND, OUTBOUND,
    error::{Error, Result},
    internal::channel::{ChannelKind, Delivery, Envelope, HostEndpoint},
    message::{Headers, Message, Payload},
    runner::{Runner, RunnerState},
    scope::{IsolationScope, ScopeId},
};

/// Revision of the [`Exchanger`] contract. Bumped on any change to the
/// meaning of its operations.
pub const EXCHANGER_VERSION: u32 = 1;

/// Data exchange with an embedded application.
///
/// This is the whole surface the host relies on; anything built inside an
/// isolation scope only has to provide these three operations.
pub trait Exchanger: Send {
    /// Contract revision this implementation was written against.
    fn version(&self) -> u32 {
        EXCHANGER_VERSION
    }

    /// Hand `payload` to the application.
    ///
    /// Returns `Ok(true)` once the application accepted the message and
    /// `Ok(false)` if it declined it or nobody took it within `timeout`.
    /// A zero timeout makes a single attempt.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if the application cannot receive messages or
    /// the exchanger is closed. [`Error::Wasm`] if the guest handler trapped.
    fn send(&mut self, payload: Payload, headers: Headers, timeout: Duration) -> Result<bool>;

    /// Take the next message the application produced, waiting up to
    /// `timeout`. `Ok(None)` when nothing arrived.
    ///
    /// # Errors
    /// [`Error::UnsupportedPayload`] if the message is neither bytes nor text.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Stop the application and release its scope. Safe to call repeatedly.
    ///
    /// # Errors
    /// Errors raised while the application shuts down.
    fn close(&mut self) -> Result<()>;
}

/// [`Exchanger`] over an application running in its own isolation scope.
pub struct Bridge {
    scope_id: ScopeId,
    scope: Option<Arc<IsolationScope>>,
    runner: Runner,
    inbound: Option<Sender<Delivery>>,
    outbound: Option<Receiver<Envelope>>,
    closed: bool,
}

impl Bridge {
    /// Start `entry` inside `scope` and bind to the channels it publishes.
    ///
    /// # Errors
    /// Any startup error of the application, or [`Error::IllegalState`] when
    /// `inbound` is not a direct channel or `outbound` is not a queue.
    pub fn new(entry: &str, scope: Arc<IsolationScope>) -> Result<Self> {
        let mut runner = Runner::new(entry, Arc::clone(&scope));
        runner.run()?;

        let handle = runner
            .application_handle()
            .ok_or_else(|| Error::illegal_state("runner is ready without an application handle"))?;

        let inbound = match handle.endpoint(INBOUND) {
            None => None,
            Some(HostEndpoint::Direct(tx)) => Some(tx.clone()),
            Some(endpoint) => return Err(wrong_kind(INBOUND, endpoint.kind())),
        };
        let outbound = match handle.endpoint(OUTBOUND) {
            None => None,
            Some(HostEndpoint::Queue(rx)) => Some(rx.clone()),
            Some(endpoint) => return Err(wrong_kind(OUTBOUND, endpoint.kind())),
        };

        match (inbound.is_some(), outbound.is_some()) {
            (true, true) => info!(
                scope = %scope.id(),
                "embedded application can receive and send data"
            ),
            (true, false) => info!(
                scope = %scope.id(),
                "embedded application can only receive data"
            ),
            (false, true) => info!(scope = %scope.id(), "embedded application can only send data"),
            (false, false) => info!(
                scope = %scope.id(),
                "embedded application is headless, no data will be exchanged"
            ),
        }

        Ok(Self {
            scope_id: scope.id(),
            scope: Some(scope),
            runner,
            inbound,
            outbound,
            closed: false,
        })
    }

    #[must_use]
    pub const fn scope_id(&self) -> ScopeId {
        self.scope_id
    }

    /// The scope the application runs in, until the bridge is closed.
    #[must_use]
    pub fn scope(&self) -> Option<&IsolationScope> {
        self.scope.as_deref()
    }

    #[must_use]
    pub const fn can_send(&self) -> bool {
        self.inbound.is_some()
    }

    #[must_use]
    pub const fn can_receive(&self) -> bool {
        self.outbound.is_some()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub const fn runner_state(&self) -> RunnerState {
        self.runner.state()
    }
}

fn wrong_kind(name: &str, actual: ChannelKind) -> Error {
    let expected = if name == INBOUND {
        ChannelKind::Direct
    } else {
        ChannelKind::Queue
    };
    Error::illegal_state(format!(
        "channel '{name}' must be a {expected:?} channel, the application declared it as {actual:?}"
    ))
}

impl Exchanger for Bridge {
    fn send(&mut self, payload: Payload, headers: Headers, timeout: Duration) -> Result<bool> {
        if self.closed {
            return Err(Error::illegal_state("bridge is closed"));
        }
        let Some(inbound) = &self.inbound else {
            return Err(Error::illegal_state(format!(
                "embedded application does not accept data, it published no '{INBOUND}' channel"
            )));
        };

        let (ack_tx, ack_rx) = bounded(1);
        let delivery = Delivery {
            envelope: Envelope::from_payload(payload, headers),
            ack: ack_tx,
        };

        let handed_off = if timeout.is_zero() {
            inbound
                .try_send(delivery)
                .map_err(|e| matches!(e, TrySendError::Disconnected(_)))
        } else {
            inbound
                .send_timeout(delivery, timeout)
                .map_err(|e| e.is_disconnected())
        };
        match handed_off {
            Ok(()) => {}
            Err(false) => {
                debug!(scope = %self.scope_id, ?timeout, "no taker for message");
                return Ok(false);
            }
            Err(true) => {
                return Err(Error::illegal_state("embedded application is no longer running"));
            }
        }

        ack_rx.recv().map_err(|_| {
            Error::illegal_state("embedded application stopped while handling a message")
        })?
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if self.closed {
            return Ok(None);
        }
        let Some(outbound) = &self.outbound else {
            return Ok(None);
        };

        let envelope = if timeout.is_zero() {
            outbound.try_recv().ok()
        } else {
            outbound.recv_timeout(timeout).ok()
        };
        envelope.map(Envelope::into_message).transpose()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inbound = None;
        self.outbound = None;

        let stopped = if self.runner.state() == RunnerState::Ready {
            self.runner.stop()
        } else {
            Ok(())
        };
        if let Some(scope) = self.scope.take() {
            scope.close();
        }
        stopped
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(scope = %self.scope_id, error = %e, "failed to close bridge");
        }
    }
}
