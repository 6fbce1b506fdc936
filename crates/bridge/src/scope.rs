//! Isolation scopes.
//!
//! An [`IsolationScope`] owns everything compiled from one package: its own
//! engine, module and linker. Guest state lives in a store created per
//! instance, so nothing a guest does is visible to another scope.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};
use wasmtime::{Config, Engine, ExternType, Instance, Linker, Module, ResourceLimiter, Store};

use crate::{
    error::{Error, Result},
    internal::{
        bridge::{self, ScopeState},
        compile::{configure_engine, load_or_compile_module},
        epoch::{DeadlineClock, ticks_for},
    },
    package::Package,
};

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Resource knobs applied to every scope opened with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationOptions {
    pub outbound_capacity: usize,
    pub max_memory: Option<usize>,
    pub call_budget: Option<Duration>,
    pub cache: Option<PathBuf>,
}

impl Default for IsolationOptions {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_memory: None,
            call_budget: None,
            cache: None,
        }
    }
}

impl IsolationOptions {
    #[must_use]
    pub const fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Cap on the guest's linear memory, in bytes.
    #[must_use]
    pub const fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// Wall-clock budget for each guest call. A call running past it traps.
    #[must_use]
    pub const fn call_budget(mut self, budget: Duration) -> Self {
        self.call_budget = Some(budget);
        self
    }

    /// Directory for precompiled module artifacts.
    #[must_use]
    pub fn cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache = Some(dir.into());
        self
    }
}

/// Process-unique identifier of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a name resolves inside a scope.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Exported by the package itself.
    Isolated(ExternType),
    /// Provided by the host bridge.
    Host {
        module: &'static str,
        name: &'static str,
    },
}

pub struct IsolationScope {
    id: ScopeId,
    package: Package,
    options: IsolationOptions,
    engine: Engine,
    module: Module,
    linker: Linker<ScopeState>,
    deadline_ticks: Option<u64>,
    closed: AtomicBool,
    clock: Mutex<Option<DeadlineClock>>,
}

impl IsolationScope {
    /// Compile `package` into a fresh scope.
    ///
    /// # Errors
    /// Returns [`Error::Wasm`] if the package does not compile or the bridge
    /// cannot be defined, and [`Error::Io`] on filesystem failures.
    pub fn open(package: &Package, options: &IsolationOptions) -> Result<Self> {
        let id = ScopeId::next();

        let mut cfg = Config::new();
        configure_engine(&mut cfg, options.call_budget.is_some());
        let engine = Engine::new(&cfg).map_err(Error::Wasm)?;

        let module = load_or_compile_module(&engine, package.path(), options.cache.as_deref())?;

        let mut linker = Linker::new(&engine);
        bridge::add_to_linker(&mut linker).map_err(Error::Wasm)?;

        let clock = match options.call_budget {
            Some(_) => Some(DeadlineClock::start(
                engine.clone(),
                format!("embed-clock-{id}"),
            )?),
            None => None,
        };

        info!(
            scope = %id,
            package = %package.path().display(),
            "opened isolation scope"
        );

        Ok(Self {
            id,
            package: package.clone(),
            options: options.clone(),
            engine,
            module,
            linker,
            deadline_ticks: options.call_budget.map(ticks_for),
            closed: AtomicBool::new(false),
            clock: Mutex::new(clock),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ScopeId {
        self.id
    }

    #[must_use]
    pub const fn package(&self) -> &Package {
        &self.package
    }

    #[must_use]
    pub const fn options(&self) -> &IsolationOptions {
        &self.options
    }

    /// Package paths the scope loads from, for diagnostics.
    #[must_use]
    pub fn classpath(&self) -> Vec<PathBuf> {
        vec![self.package.path().to_path_buf()]
    }

    /// Look `name` up: the package's exports first, then the host bridge.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Resolution> {
        if let Some(ty) = self.module.get_export(name) {
            return Some(Resolution::Isolated(ty));
        }
        bridge::FUNCTIONS
            .iter()
            .find(|f| **f == name)
            .map(|f| Resolution::Host {
                module: bridge::MODULE,
                name: f,
            })
    }

    /// Every resolvable name, in lookup order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.module
            .exports()
            .map(|export| export.name().to_string())
            .chain(
                bridge::FUNCTIONS
                    .iter()
                    .map(|f| format!("{}.{f}", bridge::MODULE)),
            )
            .collect()
    }

    pub(crate) fn new_store(&self) -> Result<Store<ScopeState>> {
        if self.is_closed() {
            return Err(Error::illegal_state(format!("scope {} is closed", self.id)));
        }
        let data = ScopeState::new(
            self.options.max_memory.unwrap_or(usize::MAX),
            self.options.outbound_capacity.max(1),
        );
        let mut store = Store::new(&self.engine, data);
        store.limiter(|state| state as &mut dyn ResourceLimiter);
        self.arm_deadline(&mut store);
        Ok(store)
    }

    /// Reset the call budget. Must run before every guest call.
    pub(crate) fn arm_deadline(&self, store: &mut Store<ScopeState>) {
        if let Some(ticks) = self.deadline_ticks {
            store.set_epoch_deadline(ticks);
        }
    }

    pub(crate) fn instantiate(&self) -> Result<(Store<ScopeState>, Instance)> {
        let mut store = self.new_store()?;
        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(Error::Wasm)?;
        debug!(scope = %self.id, "instantiated package");
        Ok((store, instance))
    }

    /// Release the scope. Later attempts to instantiate fail and the call
    /// budget clock stops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut clock) = self.clock.lock().take() {
            clock.stop();
        }
        info!(scope = %self.id, "closed isolation scope");
    }

    #[cfg(test)]
    pub(crate) fn clock_running(&self) -> bool {
        self.clock.lock().as_ref().is_some_and(DeadlineClock::is_running)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.package.path()
    }
}

impl fmt::Debug for IsolationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationScope")
            .field("id", &self.id)
            .field("package", &self.package)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The scope current code runs on behalf of, per thread.
pub mod ambient {
    use std::{cell::RefCell, marker::PhantomData, sync::Arc};

    use super::IsolationScope;

    thread_local! {
        static CURRENT: RefCell<Option<Arc<IsolationScope>>> = const { RefCell::new(None) };
    }

    #[must_use]
    pub fn current() -> Option<Arc<IsolationScope>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Make `scope` current until the guard drops.
    pub fn enter(scope: Arc<IsolationScope>) -> AmbientGuard {
        let previous = CURRENT.with(|current| current.replace(Some(scope)));
        AmbientGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Restores the previously current scope on drop, including on unwind.
    #[must_use = "the ambient scope is restored as soon as the guard drops"]
    pub struct AmbientGuard {
        previous: Option<Arc<IsolationScope>>,
        _not_send: PhantomData<*const ()>,
    }

    impl Drop for AmbientGuard {
        fn drop(&mut self) {
            let previous = self.previous.take();
            let _ = CURRENT.try_with(|current| current.replace(previous));
        }
    }
}
