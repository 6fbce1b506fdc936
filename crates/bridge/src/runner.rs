//! Runs the embedded application on its own thread.
//!
//! [`Runner::run`] blocks until the guest's entry point has returned and the
//! channels it declared are known. After that the runtime thread only serves
//! inbound deliveries until [`Runner::stop`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use tracing::{debug, info, warn};
use wasmtime::{Store, TypedFunc};

use crate::{
    INBOUND,
    error::{Error, Result},
    internal::{
        bridge::ScopeState,
        channel::{Delivery, Envelope, HostEndpoint},
    },
    scope::{IsolationScope, ScopeId, ambient},
};

const ON_MESSAGE: &str = "on_message";
const STOP: &str = "stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// What the host learns about a started application: the channels it
/// published during its entry point.
pub struct ApplicationHandle {
    entry: String,
    scope: ScopeId,
    channels: BTreeMap<String, HostEndpoint>,
}

impl ApplicationHandle {
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    #[must_use]
    pub const fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    #[must_use]
    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub(crate) fn endpoint(&self, name: &str) -> Option<&HostEndpoint> {
        self.channels.get(name)
    }
}

impl fmt::Debug for ApplicationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationHandle")
            .field("entry", &self.entry)
            .field("scope", &self.scope)
            .field(
                "channels",
                &self
                    .channels
                    .iter()
                    .map(|(name, endpoint)| (name.as_str(), endpoint.kind()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

enum Control {
    Stop,
}

pub struct Runner {
    entry: String,
    scope_id: ScopeId,
    scope: Option<Arc<IsolationScope>>,
    state: RunnerState,
    handle: Option<ApplicationHandle>,
    control: Option<Sender<Control>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Runner {
    #[must_use]
    pub fn new(entry: impl Into<String>, scope: Arc<IsolationScope>) -> Self {
        Self {
            entry: entry.into(),
            scope_id: scope.id(),
            scope: Some(scope),
            state: RunnerState::Idle,
            handle: None,
            control: None,
            thread: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RunnerState {
        self.state
    }

    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Present only while the runner is [`RunnerState::Ready`].
    #[must_use]
    pub const fn application_handle(&self) -> Option<&ApplicationHandle> {
        self.handle.as_ref()
    }

    /// Start the application and wait for it to become ready.
    ///
    /// # Errors
    /// [`Error::IllegalState`] if the runner was already started. Any error
    /// raised while instantiating the package or running its entry point is
    /// returned as is, and the runner moves to [`RunnerState::Failed`].
    pub fn run(&mut self) -> Result<()> {
        if self.state != RunnerState::Idle {
            return Err(Error::illegal_state(format!(
                "runner for '{}' can only be started once (state: {:?})",
                self.entry, self.state
            )));
        }
        let Some(scope) = self.scope.clone() else {
            return Err(Error::illegal_state(format!(
                "runner for '{}' has released its scope",
                self.entry
            )));
        };
        self.state = RunnerState::Starting;

        let (ready_tx, ready_rx) = bounded::<Result<ApplicationHandle>>(1);
        let (control_tx, control_rx) = bounded::<Control>(1);
        let entry = self.entry.clone();

        let spawned = thread::Builder::new()
            .name(format!("embed-runtime-{}", self.scope_id))
            .spawn(move || runtime_main(&scope, &entry, &ready_tx, &control_rx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.state = RunnerState::Failed;
                return Err(e.into());
            }
        };

        match ready_rx.recv() {
            Ok(Ok(handle)) => {
                info!(
                    scope = %self.scope_id,
                    entry = %self.entry,
                    channels = ?handle.channel_names().collect::<Vec<_>>(),
                    "embedded application ready"
                );
                self.handle = Some(handle);
                self.control = Some(control_tx);
                self.thread = Some(thread);
                self.state = RunnerState::Ready;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = RunnerState::Failed;
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                self.state = RunnerState::Failed;
                Err(match thread.join() {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => {
                        Error::illegal_state("runtime exited before signalling readiness")
                    }
                    Err(_) => Error::illegal_state("runtime thread panicked during startup"),
                })
            }
        }
    }

    /// Ask the application to shut down and wait for the runtime thread.
    /// The runner drops its reference to the scope afterwards.
    ///
    /// # Errors
    /// [`Error::IllegalState`] unless the runner is ready. Errors raised by
    /// the guest's `stop` export are returned after the thread has exited.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != RunnerState::Ready {
            return Err(Error::illegal_state(format!(
                "runner for '{}' is not running (state: {:?})",
                self.entry, self.state
            )));
        }
        self.state = RunnerState::Stopped;
        self.handle = None;
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }

        let result = match self.thread.take().map(JoinHandle::join) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(Error::illegal_state("runtime thread panicked")),
        };
        self.scope = None;
        info!(scope = %self.scope_id, entry = %self.entry, "embedded application stopped");
        result
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if self.state != RunnerState::Ready {
            return;
        }
        if let Err(e) = self.stop() {
            warn!(scope = %self.scope_id, error = %e, "failed to stop embedded application");
        }
    }
}

fn runtime_main(
    scope: &Arc<IsolationScope>,
    entry: &str,
    ready: &Sender<Result<ApplicationHandle>>,
    control: &Receiver<Control>,
) -> Result<()> {
    let _ambient = ambient::enter(Arc::clone(scope));

    let mut application = match Application::start(scope, entry) {
        Ok((application, handle)) => {
            if ready.send(Ok(handle)).is_err() {
                return Ok(());
            }
            application
        }
        Err(e) => {
            warn!(scope = %scope.id(), entry, error = %e, "embedded application failed to start");
            let _ = ready.send(Err(e));
            return Ok(());
        }
    };

    application.serve(control);
    application.shutdown()
}

struct Application<'a> {
    scope: &'a IsolationScope,
    store: Store<ScopeState>,
    on_message: Option<TypedFunc<i32, i32>>,
    stop: Option<TypedFunc<(), ()>>,
    inbound: Option<Receiver<Delivery>>,
}

impl<'a> Application<'a> {
    fn start(scope: &'a IsolationScope, entry: &str) -> Result<(Self, ApplicationHandle)> {
        let (mut store, instance) = scope.instantiate()?;

        let main = instance
            .get_typed_func::<(), ()>(&mut store, entry)
            .map_err(|_| Error::UnresolvableEntryPoint {
                entry: entry.to_string(),
                path: scope.path().to_path_buf(),
            })?;

        debug!(scope = %scope.id(), entry, "calling entry point");
        scope.arm_deadline(&mut store);
        let called = main.call(&mut store, ());
        store.data_mut().messages.clear();
        called.map_err(Error::Wasm)?;

        let inbound = store.data_mut().channels.take_direct(INBOUND);
        let on_message = instance
            .get_typed_func::<i32, i32>(&mut store, ON_MESSAGE)
            .ok();
        if inbound.is_some() && on_message.is_none() {
            return Err(Error::illegal_state(format!(
                "channel '{INBOUND}' was declared but the package exports no \
                 `{ON_MESSAGE}(i32) -> i32` handler"
            )));
        }
        let stop = instance.get_typed_func::<(), ()>(&mut store, STOP).ok();

        let handle = ApplicationHandle {
            entry: entry.to_string(),
            scope: scope.id(),
            channels: store.data_mut().channels.take_host_endpoints(),
        };

        Ok((
            Self {
                scope,
                store,
                on_message,
                stop,
                inbound,
            },
            handle,
        ))
    }

    fn serve(&mut self, control: &Receiver<Control>) {
        let inbound = self.inbound.take().unwrap_or_else(never);
        loop {
            select! {
                recv(control) -> msg => match msg {
                    Ok(Control::Stop) | Err(_) => break,
                },
                recv(inbound) -> delivery => match delivery {
                    Ok(delivery) => self.dispatch(delivery),
                    Err(_) => break,
                },
            }
        }
    }

    fn dispatch(&mut self, delivery: Delivery) {
        let Delivery { envelope, ack } = delivery;
        let result = self.handle_message(envelope);
        if let Err(e) = &result {
            warn!(scope = %self.scope.id(), error = %e, "inbound message handler failed");
        }
        let _ = ack.send(result);
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<bool> {
        let Some(on_message) = self.on_message.clone() else {
            return Err(Error::illegal_state(format!("no `{ON_MESSAGE}` handler")));
        };

        let handle = self.store.data_mut().messages.insert(envelope);
        self.scope.arm_deadline(&mut self.store);
        let status = on_message.call(&mut self.store, handle);

        let leftover = self.store.data().messages.len();
        if leftover > 0 {
            debug!(scope = %self.scope.id(), leftover, "releasing message handles");
            self.store.data_mut().messages.clear();
        }

        let status = status.map_err(Error::Wasm)?;
        debug!(scope = %self.scope.id(), status, "inbound message handled");
        Ok(status == 0)
    }

    fn shutdown(mut self) -> Result<()> {
        debug!(
            scope = %self.scope.id(),
            memory_peak = self.store.data().memory_peak(),
            "shutting down embedded application"
        );
        let Some(stop) = self.stop else {
            return Ok(());
        };
        self.scope.arm_deadline(&mut self.store);
        let result = stop.call(&mut self.store, ());
        self.store.data_mut().messages.clear();
        result.map_err(Error::Wasm)
    }
}
