use std::{
    sync::{
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    time::Duration,
};

use abp_config::Config;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::{
    deferred::{CapturedCallback, HostScheduler},
    engine::{Command, EngineThread},
    error::{ApiError, EvalError, HostError, InitError},
    file_system::{DefaultFileSystem, SharedFileSystem},
    ops::InitSignal,
};

/// Options for a [`ScriptRuntimeHost`]
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Upper bound on the wait for `__initDone`, `None` waits indefinitely
    pub init_timeout: Option<Duration>,
    /// Base directory for relative script file paths
    pub base_dir: Option<Utf8PathBuf>,
}

impl HostOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            init_timeout: config.init_timeout(),
            base_dir: config.base_dir.clone(),
        }
    }

    #[must_use]
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<Utf8PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

pub(crate) struct HostShared {
    options: HostOptions,
    scheduler: Arc<dyn HostScheduler>,
    file_system: SharedFileSystem,
    state: Mutex<HostState>,
    // signalled when `state` leaves `Initializing`
    settled: Condvar,
    engine: OnceLock<EngineThread>,
}

impl HostShared {
    /// Drops the captured values of a callback that will never fire
    pub(crate) fn release_callback(&self, id: crate::deferred::CallbackId) {
        if let Some(engine) = self.engine.get() {
            engine.post(Command::Release { id });
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, next: HostState) {
        *self.state() = next;
        self.settled.notify_all();
    }

    /// Blocks host threads while `initialize` runs. The engine thread is never
    /// held here, deferred callbacks fired during initialization must run.
    fn wait_until_settled(&self) {
        if self.engine.get().is_some_and(EngineThread::is_current) {
            return;
        }
        let state = self.state();
        drop(
            self.settled
                .wait_while(state, |state| *state == HostState::Initializing)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

impl Drop for HostShared {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.get() {
            engine.shutdown();
        }
    }
}

/// Owns the script engine and serializes access to it from any host thread.
///
/// Cloning is cheap and every clone drives the same engine. The engine shuts
/// down when the last clone is dropped.
#[derive(Clone)]
pub struct ScriptRuntimeHost {
    shared: Arc<HostShared>,
}

impl std::fmt::Debug for ScriptRuntimeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntimeHost")
            .field("state", &self.state())
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl ScriptRuntimeHost {
    pub fn new(options: HostOptions, scheduler: Arc<dyn HostScheduler>) -> Self {
        let file_system = Arc::new(DefaultFileSystem::new(options.base_dir.clone()));
        Self::with_file_system(options, scheduler, file_system)
    }

    pub fn with_file_system(
        options: HostOptions,
        scheduler: Arc<dyn HostScheduler>,
        file_system: SharedFileSystem,
    ) -> Self {
        Self {
            shared: Arc::new(HostShared {
                options,
                scheduler,
                file_system,
                state: Mutex::new(HostState::Uninitialized),
                settled: Condvar::new(),
                engine: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> HostState {
        *self.shared.state()
    }

    /// Starts the engine, evaluates the bundle at `source_path` and blocks
    /// until the bundle calls `__initDone`. Each bootstrap file is then fed
    /// line by line into `API.addFilter`.
    ///
    /// # Errors
    ///
    /// Fails if the host was initialized before, the bundle cannot be mapped
    /// or evaluated, the bundle reports failure or misses the init timeout,
    /// or a bootstrap file cannot be loaded
    #[tracing::instrument(skip_all, fields(bundle = %source_path))]
    pub fn initialize(
        &self,
        source_path: &Utf8Path,
        bootstrap: &[Utf8PathBuf],
    ) -> Result<(), InitError> {
        {
            let mut state = self.shared.state();
            if *state != HostState::Uninitialized {
                return Err(InitError::AlreadyInitialized);
            }
            *state = HostState::Initializing;
        }

        let result = self.run_initialization(source_path, bootstrap);
        let next = if result.is_ok() {
            HostState::Ready
        } else {
            HostState::Failed
        };
        self.shared.settle(next);

        match &result {
            Ok(()) => info!("Script runtime initialized"),
            Err(e) => warn!(error = %e, "Script runtime initialization failed"),
        }
        result
    }

    fn run_initialization(
        &self,
        source_path: &Utf8Path,
        bootstrap: &[Utf8PathBuf],
    ) -> Result<(), InitError> {
        let (gate_sender, gate) = mpsc::sync_channel(1);
        let engine = EngineThread::spawn(
            self.shared.file_system.clone(),
            InitSignal::new(gate_sender),
            Arc::downgrade(&self.shared),
            self.shared.scheduler.clone(),
        )?;
        if self.shared.engine.set(engine).is_err() {
            return Err(InitError::AlreadyInitialized);
        }

        let source_path = self.shared.file_system.resolve(source_path.as_str());
        self.request(|responder| Command::LoadBundle {
            path: source_path,
            responder,
        })??;

        self.wait_for_gate(&gate)?;
        debug!("Initialization gate fulfilled");

        for path in bootstrap {
            let added = self.request(|responder| Command::Bootstrap {
                path: path.clone(),
                responder,
            })??;
            info!(%path, filters = added, "Loaded subscription");
        }

        Ok(())
    }

    fn wait_for_gate(&self, gate: &Receiver<bool>) -> Result<(), InitError> {
        let success = match self.shared.options.init_timeout {
            Some(timeout) => gate.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => InitError::InitTimeout(timeout),
                RecvTimeoutError::Disconnected => HostError::Closed.into(),
            })?,
            None => gate.recv().map_err(|_| HostError::Closed)?,
        };

        if success {
            Ok(())
        } else {
            Err(InitError::ScriptRejected)
        }
    }

    /// Evaluates `source` and returns the completion value as a string,
    /// `undefined` becomes the empty string. Waits for a running `initialize`
    /// to finish first.
    ///
    /// # Errors
    ///
    /// Returns the script exception, or a host error if the engine is not running
    #[tracing::instrument(skip_all)]
    pub fn evaluate(&self, source: &str) -> Result<String, EvalError> {
        self.shared.wait_until_settled();
        Ok(self.request(|responder| Command::Evaluate {
            source: source.to_owned(),
            responder,
        })??)
    }

    /// Replays a captured callback and releases it
    ///
    /// # Errors
    ///
    /// Returns the exception thrown by the callback, or a host error if the
    /// callback belongs to another host or the engine is gone
    #[tracing::instrument(skip_all, fields(callback_id = %callback.id()))]
    pub fn invoke_deferred(&self, callback: CapturedCallback) -> Result<(), EvalError> {
        if !callback.belongs_to(&self.shared) {
            return Err(HostError::ForeignCallback.into());
        }
        let id = callback.consume();
        Ok(self.request(|responder| Command::InvokeDeferred { id, responder })??)
    }

    /// Calls `API[function](...args)` in the script runtime. Waits for a
    /// running `initialize` to finish first.
    ///
    /// # Errors
    ///
    /// Fails if `API` or the function is missing, the call throws, or the
    /// arguments cannot be marshalled
    #[tracing::instrument(skip(self, args))]
    pub fn query_api(
        &self,
        function: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ApiError> {
        self.shared.wait_until_settled();
        self.request(|responder| Command::QueryApi {
            function: function.to_owned(),
            args,
            responder,
        })?
    }

    /// Number of captured callbacks that have neither fired nor been released
    ///
    /// # Errors
    ///
    /// Fails if the engine is not running
    pub fn registered_callbacks(&self) -> Result<usize, HostError> {
        self.request(|responder| Command::RegisteredCallbacks { responder })
    }

    fn request<T>(
        &self,
        command: impl FnOnce(mpsc::Sender<T>) -> Command,
    ) -> Result<T, HostError> {
        let engine = self.shared.engine.get().ok_or(HostError::NotInitialized)?;
        let (responder, response) = mpsc::channel();
        engine.submit(command(responder), self.shared.scheduler.as_ref())?;
        response.recv().map_err(|_| HostError::Closed)
    }
}
