//! The single owner of everything the module sets up in a process.

use crate::channel::{self, ChannelHandle, ControlSink, ControlSource};
use crate::config::ModuleConfig;
use crate::dispatch::{DispatchTable, Interceptor};
use crate::error::{Error, Result};
use crate::hook::{HookEngine, HookRecord, Patch};
use crate::resolver::{DeferredProgress, MethodLookup, NativeLookup, Resolution, SymbolDescriptor, SymbolHandle, SymbolResolver};
use crate::store::CoordinateStore;
use crate::target::TargetDescriptor;
use crate::teardown::{TeardownGate, TeardownReport};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

pub type Resolver = SymbolResolver<Box<dyn NativeLookup>>;

pub struct ModuleState {
    target: TargetDescriptor,
    config: ModuleConfig,
    store: CoordinateStore,
    dispatch: DispatchTable,
    engine: HookEngine,
    resolver: Resolver,
    /// Parked native hooks: dispatch index and patch to apply on resolution.
    deferred: Mutex<HashMap<SymbolDescriptor, (usize, Patch)>>,
    channel: OnceLock<ChannelHandle>,
    teardown: TeardownGate,
}

impl ModuleState {
    /// Starts with a disabled store, so every hook passes through until the
    /// controller says otherwise.
    pub fn new(target: TargetDescriptor, config: ModuleConfig, resolver: Resolver, entries: usize) -> Self {
        Self {
            target,
            config,
            store: CoordinateStore::new(),
            dispatch: DispatchTable::new(entries),
            engine: HookEngine::new(),
            resolver,
            deferred: Mutex::new(HashMap::new()),
            channel: OnceLock::new(),
            teardown: TeardownGate::new(),
        }
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn store(&self) -> &CoordinateStore {
        &self.store
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn engine(&self) -> &HookEngine {
        &self.engine
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn interceptor(&self) -> Interceptor<'_> {
        Interceptor::new(&self.store, &self.dispatch)
    }

    pub fn channel(&self) -> Option<&ChannelHandle> {
        self.channel.get()
    }

    pub fn is_torn_down(&self) -> bool {
        self.teardown.is_started()
    }

    /// Resolves `descriptor`, installs `patch` and routes dispatch entry
    /// `index` through the result. `Ok(None)` means the library is not loaded
    /// yet; the hook is installed once it resolves.
    pub fn hook(
        &self,
        index: usize,
        descriptor: &SymbolDescriptor,
        patch: Patch,
        methods: Option<&dyn MethodLookup>,
    ) -> Result<Option<Arc<HookRecord>>> {
        if self.is_torn_down() {
            return Err(Error::installation(descriptor, "module already torn down"));
        }

        if self.dispatch.entry(index).is_none() {
            return Err(Error::installation(descriptor, format!("no dispatch entry {index}")));
        }

        match self.resolver.resolve(descriptor, methods) {
            Resolution::Resolved(handle) => self.install(index, &handle, patch).map(Some),
            Resolution::Deferred => {
                self.deferred.lock().insert(descriptor.clone(), (index, patch));
                Ok(None)
            }
            Resolution::Failed(err) => Err(err),
        }
    }

    fn install(&self, index: usize, handle: &SymbolHandle, patch: Patch) -> Result<Arc<HookRecord>> {
        let record = self.engine.install(handle, patch)?.into_record();
        self.dispatch.bind(index, record.original());

        // teardown closes the engine before it releases the dispatch table
        if self.engine.is_closed() {
            self.dispatch.set_override(index, false);
            return Err(Error::installation(handle.descriptor(), "torn down while installing"));
        }

        Ok(record)
    }

    /// Installs hooks whose library showed up.
    pub fn notify_library_loaded(&self, library: &str) -> usize {
        let progress = self.resolver.notify_library_loaded(library);
        self.install_deferred(progress)
    }

    /// Retries parked hooks whose backoff elapsed; `true` while some remain.
    pub fn tick(&self) -> bool {
        if self.is_torn_down() {
            return false;
        }

        let progress = self.resolver.poll_deferred(Instant::now());
        self.install_deferred(progress);

        self.resolver.pending_count() > 0
    }

    fn install_deferred(&self, progress: DeferredProgress) -> usize {
        let mut installed = 0;

        for err in progress.failed {
            warn!("{err}");
        }

        for handle in progress.resolved {
            let Some((index, patch)) = self.deferred.lock().remove(handle.descriptor()) else {
                continue;
            };

            match self.install(index, &handle, patch) {
                Ok(_) => installed += 1,
                Err(err) => warn!("{err}"),
            }
        }

        installed
    }

    /// Starts the control listener. Only the first call has an effect.
    pub fn start_channel(self: &Arc<Self>, source: Box<dyn ControlSource>) -> Result<()> {
        if self.channel.get().is_some() {
            return Err(Error::Channel("already started".into()));
        }

        let handle = channel::spawn(source, self.clone(), &self.config.channel)?;

        if let Err(handle) = self.channel.set(handle) {
            handle.release();
            return Err(Error::Channel("already started".into()));
        }

        Ok(())
    }

    /// Unhooks everything in reverse install order and hangs up on the
    /// controller. Idempotent; neither allocates nor logs, so it is usable
    /// from exit handlers.
    pub fn restore_all(&self) -> TeardownReport {
        self.teardown.run(|| {
            self.engine.close();
            self.dispatch.release_all();
            let counts = self.engine.restore_all();

            if let Some(channel) = self.channel.get() {
                channel.release();
            }

            counts
        })
    }
}

impl ControlSink for ModuleState {
    fn store(&self) -> &CoordinateStore {
        &self.store
    }

    fn teardown(&self) {
        for _ in 0..TEARDOWN_ATTEMPTS {
            let report = self.restore_all();

            if self.is_torn_down() {
                info!("teardown: {report}");
                return;
            }

            thread::sleep(TEARDOWN_RETRY);
        }

        warn!("teardown kept racing installs, hooks may remain");
    }

    fn tick(&self) -> bool {
        ModuleState::tick(self)
    }
}

const TEARDOWN_ATTEMPTS: usize = 50;
const TEARDOWN_RETRY: Duration = Duration::from_millis(10);

static STATE: OnceLock<Arc<ModuleState>> = OnceLock::new();

/// Publishes the state of this process. There is only ever one.
pub fn install(state: Arc<ModuleState>) -> Result<&'static Arc<ModuleState>> {
    STATE
        .set(state)
        .map_err(|_| Error::configuration("module state already installed"))?;

    current().ok_or_else(|| Error::configuration("module state vanished"))
}

pub fn current() -> Option<&'static Arc<ModuleState>> {
    STATE.get()
}

extern "C" fn restore_at_exit() {
    if let Some(state) = current() {
        state.restore_all();
    }
}

/// Restores every hook when the process exits normally.
pub fn restore_on_exit() -> Result<()> {
    crate::teardown::at_exit(restore_at_exit)?;
    Ok(())
}
