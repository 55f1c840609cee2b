//! Deferred callbacks requested by script through `setTimeout` and `setImmediate`
//!
//! A call site is queued by [`op_schedule_deferred`] while script runs. Once the
//! engine turn ends the queue is captured into the [`DeferredCallbackRegistry`]
//! and every entry is handed to the [`HostScheduler`] as a [`CapturedCallback`].
//! The scheduler decides when to fire it; firing replays the call on the
//! engine thread and releases the captured values.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use deno_core::{OpState, op2, v8};

use crate::{
    capture::{CaptureShape, CapturedCall},
    error::{BridgeError, EvalError, HostError},
    host::{HostShared, ScriptRuntimeHost},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owns *when* a captured callback fires.
///
/// `schedule` is called on the engine thread after the script turn that
/// requested the callback has finished, so an implementation may run the
/// callback synchronously.
pub trait HostScheduler: Send + Sync {
    fn schedule(&self, callback: CapturedCallback);
}

/// Single-use handle to a captured script callback.
///
/// Dropping it without calling [`CapturedCallback::invoke`] releases the
/// captured function and arguments.
pub struct CapturedCallback {
    id: CallbackId,
    delay: Option<Duration>,
    context: Weak<HostShared>,
    consumed: bool,
}

impl CapturedCallback {
    pub(crate) fn new(id: CallbackId, delay: Option<Duration>, context: Weak<HostShared>) -> Self {
        Self {
            id,
            delay,
            context,
            consumed: false,
        }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Requested delay, zero for immediate callbacks
    pub fn delay(&self) -> Duration {
        self.delay.unwrap_or_default()
    }

    pub fn is_immediate(&self) -> bool {
        self.delay.is_none()
    }

    /// Replays the callback inside the runtime that captured it
    ///
    /// # Errors
    ///
    /// Fails with [`HostError::Closed`] if the runtime is gone, or with the
    /// script exception raised by the callback
    pub fn invoke(self) -> Result<(), EvalError> {
        let shared = self.context.upgrade().ok_or(HostError::Closed)?;
        ScriptRuntimeHost::from_shared(shared).invoke_deferred(self)
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<HostShared>) -> bool {
        std::ptr::eq(self.context.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn consume(mut self) -> CallbackId {
        self.consumed = true;
        self.id
    }
}

impl fmt::Debug for CapturedCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedCallback")
            .field("id", &self.id)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Drop for CapturedCallback {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        if let Some(shared) = self.context.upgrade() {
            shared.release_callback(self.id);
        }
    }
}

pub(crate) struct PendingCapture {
    pub(crate) call_site: v8::Global<v8::Value>,
    pub(crate) shape: CaptureShape,
}

/// Call sites queued during the current engine turn
#[derive(Default)]
pub(crate) struct DeferredQueue(Vec<PendingCapture>);

impl DeferredQueue {
    pub(crate) fn take(&mut self) -> Vec<PendingCapture> {
        std::mem::take(&mut self.0)
    }
}

/// Captured calls waiting for the host scheduler to fire them
#[derive(Default)]
pub(crate) struct DeferredCallbackRegistry {
    next_id: u64,
    entries: HashMap<CallbackId, CapturedCall>,
}

impl DeferredCallbackRegistry {
    pub(crate) fn insert(&mut self, call: CapturedCall) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        self.entries.insert(id, call);
        id
    }

    pub(crate) fn take(&mut self, id: CallbackId) -> Option<CapturedCall> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Backs `setTimeout` and `setImmediate`, `call_site` is the full argument list
#[op2]
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn op_schedule_deferred(
    state: &mut OpState,
    #[global] call_site: v8::Global<v8::Value>,
    immediate: bool,
) -> Result<(), BridgeError> {
    let queue = state
        .try_borrow_mut::<DeferredQueue>()
        .ok_or(BridgeError::RegistryNotAvailable)?;

    let shape = if immediate {
        CaptureShape::Immediate
    } else {
        CaptureShape::Delayed
    };
    queue.0.push(PendingCapture { call_site, shape });

    Ok(())
}
