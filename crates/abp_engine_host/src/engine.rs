//! The engine thread and the runtime it owns.
//!
//! A V8 isolate stays on the thread that created it, so the `JsRuntime` lives
//! in a thread local of a dedicated thread and every host operation is a
//! [`Command`] executed there one at a time. A command submitted from the
//! engine thread itself (a scheduler firing a callback synchronously, or host
//! code reached from such a callback) runs inline instead of being queued.

use std::{
    cell::RefCell,
    sync::{
        Mutex, PoisonError, Weak,
        mpsc::Sender,
    },
    thread::{self, JoinHandle, ThreadId},
};

use camino::{Utf8Path, Utf8PathBuf};
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions, serde_v8, v8};
use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    capture::capture,
    deferred::{
        CallbackId, CapturedCallback, DeferredCallbackRegistry, DeferredQueue, HostScheduler,
        PendingCapture,
    },
    error::{ApiError, HostError, InitError, LoadFailure, ScriptException},
    file_system::{SharedFileSystem, split_lines},
    host::HostShared,
    mapped_source::MappedSourceBuffer,
    ops::{HostHooks, InitSignal},
};

type Responder<T> = Sender<T>;

pub(crate) enum Command {
    LoadBundle {
        path: Utf8PathBuf,
        responder: Responder<Result<(), InitError>>,
    },
    Bootstrap {
        path: Utf8PathBuf,
        responder: Responder<Result<usize, InitError>>,
    },
    Evaluate {
        source: String,
        responder: Responder<Result<String, ScriptException>>,
    },
    InvokeDeferred {
        id: CallbackId,
        responder: Responder<Result<(), ScriptException>>,
    },
    QueryApi {
        function: String,
        args: Vec<serde_json::Value>,
        responder: Responder<Result<serde_json::Value, ApiError>>,
    },
    RegisteredCallbacks {
        responder: Responder<usize>,
    },
    Release {
        id: CallbackId,
    },
    Shutdown,
}

thread_local! {
    static ENGINE: RefCell<Option<EngineCore>> = const { RefCell::new(None) };
}

pub(crate) struct EngineThread {
    commands: mpsc::UnboundedSender<Command>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EngineThread {
    /// Spawns the engine thread and waits until the runtime and its globals exist
    pub(crate) fn spawn(
        file_system: SharedFileSystem,
        init_signal: InitSignal,
        context: Weak<HostShared>,
        scheduler: std::sync::Arc<dyn HostScheduler>,
    ) -> Result<Self, HostError> {
        let (commands, mut receiver) = mpsc::unbounded_channel::<Command>();
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let join = thread::Builder::new()
            .name("abp-script-engine".into())
            .spawn(move || {
                match EngineCore::start(file_system, init_signal, context) {
                    Ok(core) => {
                        ENGINE.with(|slot| *slot.borrow_mut() = Some(core));
                        let _ = started_tx.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = started_tx.send(Err(e));
                        return;
                    }
                }

                while let Some(command) = receiver.blocking_recv() {
                    if matches!(command, Command::Shutdown) {
                        break;
                    }
                    if let Err(e) = run_command(command, scheduler.as_ref()) {
                        warn!(error = %e, "Engine command failed");
                    }
                }

                receiver.close();
                ENGINE.with(|slot| slot.borrow_mut().take());
                debug!("Script engine thread stopped");
            })
            .map_err(|e| HostError::EngineStart(e.to_string()))?;

        let thread_id = join.thread().id();
        started_rx.recv().map_err(|_| {
            HostError::EngineStart("engine thread exited during startup".into())
        })??;

        Ok(Self {
            commands,
            thread_id,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn submit(
        &self,
        command: Command,
        scheduler: &dyn HostScheduler,
    ) -> Result<(), HostError> {
        if self.is_current() {
            return run_command(command, scheduler);
        }
        self.commands.send(command).map_err(|_| HostError::Closed)
    }

    /// Queues a command without running it inline, even on the engine thread
    pub(crate) fn post(&self, command: Command) {
        let _ = self.commands.send(command);
    }

    pub(crate) fn shutdown(&self) {
        self.post(Command::Shutdown);
        if self.is_current() {
            return;
        }
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join
            && join.join().is_err()
        {
            warn!("Script engine thread panicked");
        }
    }
}

/// Runs one command against this thread's engine, then hands newly captured
/// callbacks to the scheduler with the engine released.
fn run_command(command: Command, scheduler: &dyn HostScheduler) -> Result<(), HostError> {
    let ready = ENGINE.with(|slot| {
        let mut slot = slot.try_borrow_mut().map_err(|_| HostError::EngineBusy)?;
        let core = slot.as_mut().ok_or(HostError::Closed)?;
        core.handle(command);
        Ok::<_, HostError>(core.take_ready())
    })?;

    for callback in ready {
        trace!(callback_id = %callback.id(), delay = ?callback.delay(), "Scheduling deferred callback");
        scheduler.schedule(callback);
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum ApiReply {
    Ok {
        #[serde(default)]
        value: serde_json::Value,
    },
    NoApi,
    NoFunction,
}

pub(crate) struct EngineCore {
    // dropped before the runtime, they hold handles into its isolate
    registry: DeferredCallbackRegistry,
    hooks: HostHooks,
    ready: Vec<CapturedCallback>,
    js_runtime: JsRuntime,
    tokio: tokio::runtime::Runtime,
    file_system: SharedFileSystem,
    context: Weak<HostShared>,
}

impl EngineCore {
    fn start(
        file_system: SharedFileSystem,
        init_signal: InitSignal,
        context: Weak<HostShared>,
    ) -> Result<Self, HostError> {
        let tokio = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| HostError::EngineStart(e.to_string()))?;

        let js_runtime = JsRuntime::try_new(RuntimeOptions {
            extensions: vec![crate::abp_host_globals::init(
                file_system.clone(),
                init_signal,
            )],
            ..Default::default()
        })
        .map_err(|e| HostError::EngineStart(e.to_string()))?;

        let hooks = js_runtime
            .op_state()
            .borrow_mut()
            .try_take::<HostHooks>()
            .ok_or_else(|| HostError::EngineStart("host globals were not installed".into()))?;

        debug!("Script engine started");

        Ok(Self {
            registry: DeferredCallbackRegistry::default(),
            hooks,
            ready: Vec::new(),
            js_runtime,
            tokio,
            file_system,
            context,
        })
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::LoadBundle { path, responder } => {
                let _ = responder.send(self.load_bundle(&path));
            }
            Command::Bootstrap { path, responder } => {
                let _ = responder.send(self.bootstrap(&path));
            }
            Command::Evaluate { source, responder } => {
                let _ = responder.send(self.evaluate(source));
            }
            Command::InvokeDeferred { id, responder } => {
                let _ = responder.send(self.invoke_deferred(id));
            }
            Command::QueryApi {
                function,
                args,
                responder,
            } => {
                let _ = responder.send(self.query_api(&function, &args));
            }
            Command::RegisteredCallbacks { responder } => {
                let _ = responder.send(self.registry.len());
            }
            Command::Release { id } => {
                if self.registry.take(id).is_some() {
                    trace!(callback_id = %id, "Released unfired deferred callback");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn take_ready(&mut self) -> Vec<CapturedCallback> {
        std::mem::take(&mut self.ready)
    }

    /// Maps the bundle and evaluates it. `execute_script` only accepts owned
    /// or `'static` source, so the mapped bytes are copied once into a
    /// `String` and the mapping is released after evaluation.
    fn load_bundle(&mut self, path: &Utf8Path) -> Result<(), InitError> {
        let failure = |source: LoadFailure| InitError::LoadFailure {
            path: path.to_path_buf(),
            source,
        };

        let buffer = MappedSourceBuffer::open(path).map_err(|e| failure(e.into()))?;
        let source = buffer
            .as_str()
            .map_err(|_| failure(LoadFailure::InvalidUtf8))?;
        debug!(%path, bytes = buffer.len(), "Evaluating script bundle");

        let outcome = self
            .js_runtime
            .execute_script("abp:bundle", source.to_owned())
            .map_err(ScriptException::from);
        let turn = self.finish_turn();

        outcome
            .and(turn)
            .map_err(|e| failure(LoadFailure::Script(e)))
    }

    fn bootstrap(&mut self, path: &Utf8Path) -> Result<usize, InitError> {
        let failure = |message: String| InitError::BootstrapFailure {
            path: path.to_path_buf(),
            message,
        };

        let resolved = self.file_system.resolve(path.as_str());
        let data = self.file_system.read(&resolved).map_err(failure)?;

        let mut added = 0;
        for line in split_lines(&data) {
            let line = String::from_utf8_lossy(line);
            if line.starts_with("! ") {
                continue;
            }
            self.query_api("addFilter", &[serde_json::Value::String(line.into_owned())])
                .map_err(|e| failure(e.to_string()))?;
            added += 1;
        }

        Ok(added)
    }

    fn evaluate(&mut self, source: String) -> Result<String, ScriptException> {
        let outcome = self
            .js_runtime
            .execute_script("abp:evaluate", source)
            .map_err(ScriptException::from);
        let turn = self.finish_turn();
        let value = outcome?;
        turn?;

        deno_core::scope!(scope, &mut self.js_runtime);
        let local = v8::Local::new(scope, value);
        if local.is_undefined() {
            return Ok(String::new());
        }
        Ok(local
            .to_string(scope)
            .map(|text| text.to_rust_string_lossy(scope))
            .unwrap_or_default())
    }

    fn invoke_deferred(&mut self, id: CallbackId) -> Result<(), ScriptException> {
        let call = self.registry.take(id).ok_or_else(|| {
            ScriptException::new(format!("Deferred callback {id} is not registered"))
        })?;
        let replay = self.hooks.replay_deferred.clone();
        let args = call.into_call_args();

        let outcome = self.call(&replay, &args);
        drop(args);
        let turn = self.finish_turn();
        outcome?;
        turn
    }

    fn query_api(
        &mut self,
        function: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, ApiError> {
        let query = self.hooks.query_api.clone();
        let mut call_args = Vec::with_capacity(args.len() + 1);
        {
            deno_core::scope!(scope, &mut self.js_runtime);
            let name = v8::String::new(scope, function)
                .ok_or_else(|| ApiError::Marshal(format!("function name {function}")))?;
            call_args.push(v8::Global::new(scope, v8::Local::<v8::Value>::from(name)));
            for arg in args {
                let value = serde_v8::to_v8(scope, arg)
                    .map_err(|e| ApiError::Marshal(e.to_string()))?;
                call_args.push(v8::Global::new(scope, value));
            }
        }

        let outcome = self.call(&query, &call_args);
        drop(call_args);
        let turn = self.finish_turn();
        let reply = outcome?;
        turn?;

        let reply = {
            deno_core::scope!(scope, &mut self.js_runtime);
            let local = v8::Local::new(scope, reply);
            serde_v8::from_v8::<ApiReply>(scope, local).map_err(|e| {
                ApiError::UnexpectedResult {
                    function: function.to_owned(),
                    message: e.to_string(),
                }
            })?
        };

        match reply {
            ApiReply::Ok { value } => Ok(value),
            ApiReply::NoApi => Err(ApiError::MissingApiObject),
            ApiReply::NoFunction => Err(ApiError::MissingFunction(function.to_owned())),
        }
    }

    /// Calls a script function, driving the event loop only if it returned a promise
    fn call(
        &mut self,
        function: &v8::Global<v8::Function>,
        args: &[v8::Global<v8::Value>],
    ) -> Result<v8::Global<v8::Value>, ScriptException> {
        let mut call = Box::pin(self.js_runtime.call_with_args(function, args));
        if let Some(result) = (&mut call).now_or_never() {
            return result.map_err(ScriptException::from);
        }
        self.tokio
            .block_on(
                self.js_runtime
                    .with_event_loop_promise(call, PollEventLoopOptions::default()),
            )
            .map_err(ScriptException::from)
    }

    /// Flushes microtasks, then captures the call sites queued during this turn
    fn finish_turn(&mut self) -> Result<(), ScriptException> {
        let outcome = self
            .tokio
            .block_on(self.js_runtime.run_event_loop(PollEventLoopOptions::default()))
            .map_err(ScriptException::from);
        self.capture_pending();
        outcome
    }

    fn capture_pending(&mut self) {
        let pending = self
            .js_runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<DeferredQueue>()
            .take();
        if pending.is_empty() {
            return;
        }

        deno_core::scope!(scope, &mut self.js_runtime);
        for PendingCapture { call_site, shape } in pending {
            match capture(scope, &call_site, shape) {
                Ok(call) => {
                    let delay = call.delay;
                    let id = self.registry.insert(call);
                    debug!(callback_id = %id, ?shape, ?delay, "Captured deferred callback");
                    self.ready
                        .push(CapturedCallback::new(id, delay, self.context.clone()));
                }
                Err(e) => warn!(error = %e, "Dropping malformed deferred call site"),
            }
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.registry.clear();
        self.ready.clear();
        let leftover = self
            .js_runtime
            .op_state()
            .borrow_mut()
            .try_take::<DeferredQueue>();
        drop(leftover);
    }
}
