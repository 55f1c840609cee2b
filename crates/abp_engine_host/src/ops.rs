//! Deno ops for the init gate, script logging and host hook registration

use std::sync::mpsc::SyncSender;

use deno_core::{OpState, op2, v8};

use crate::error::BridgeError;

pub(crate) const SCRIPT_LOG_TARGET: &str = "abp_engine_host::script";

/// Sender half of the initialization gate, taken by the first `__initDone`
pub(crate) struct InitSignal(Option<SyncSender<bool>>);

impl InitSignal {
    pub(crate) fn new(sender: SyncSender<bool>) -> Self {
        Self(Some(sender))
    }
}

/// Script functions the engine calls to replay callbacks and to query `API`
#[derive(Clone)]
pub(crate) struct HostHooks {
    pub(crate) replay_deferred: v8::Global<v8::Function>,
    pub(crate) query_api: v8::Global<v8::Function>,
}

#[op2(fast)]
pub(crate) fn op_init_done(state: &mut OpState, success: bool) -> Result<(), BridgeError> {
    let sender = state
        .try_borrow_mut::<InitSignal>()
        .and_then(|signal| signal.0.take())
        .ok_or(BridgeError::InitAlreadySignalled)?;

    tracing::debug!(success, "Script bundle signalled initialization");
    // the waiting side may have timed out and gone away
    let _ = sender.try_send(success);

    Ok(())
}

#[op2(fast)]
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn op_script_log(#[string] level: String, #[string] message: String) {
    match level.as_str() {
        "debug" => tracing::debug!(target: SCRIPT_LOG_TARGET, "{message}"),
        "error" => tracing::error!(target: SCRIPT_LOG_TARGET, "{message}"),
        "warn" => tracing::warn!(target: SCRIPT_LOG_TARGET, "{message}"),
        _ => tracing::info!(target: SCRIPT_LOG_TARGET, "{message}"),
    }
}

#[op2]
pub(crate) fn op_register_host_hooks(
    state: &mut OpState,
    #[global] replay_deferred: v8::Global<v8::Function>,
    #[global] query_api: v8::Global<v8::Function>,
) {
    state.put(HostHooks {
        replay_deferred,
        query_api,
    });
}
