//! # ABP Engine Host
//!
//! Hosts the ad-filtering script bundle in an embedded V8 runtime and exposes
//! it to a free-threaded host application.
//!
//! ## Overview
//!
//! - [`ScriptRuntimeHost`] owns the engine. Calls from any thread are executed
//!   one at a time on a dedicated engine thread. Calls made from that thread
//!   (a deferred callback reaching back into the host) run inline.
//! - `setTimeout` / `setImmediate` capture the callback and its arguments into a
//!   [`CapturedCallback`] that is handed to a [`HostScheduler`].
//! - `__fileSystem_*` globals give the bundle line-oriented access to its data
//!   files through a [`FileSystem`].
//! - [`FilterEngine`] is the typed view of the bundle's `API` object.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use abp_engine_host::{ContentType, FilterEngine, HostOptions, ScriptRuntimeHost, TimerScheduler};
//! use camino::Utf8PathBuf;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Arc::new(TimerScheduler::new()?);
//! let host = ScriptRuntimeHost::new(HostOptions::default(), scheduler);
//! host.initialize(
//!     &Utf8PathBuf::from("abp.js"),
//!     &[Utf8PathBuf::from("easylist_minified.txt")],
//! )?;
//!
//! let engine = FilterEngine::new(host);
//! let result = engine.matches(
//!     "https://ads.example.com/banner.png",
//!     ContentType::mask(&[ContentType::Image]),
//!     "https://example.com/",
//!     "",
//!     false,
//! )?;
//! println!("{result:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Script globals
//!
//! - `setTimeout(fn, delayMillis, ...args)` and `setImmediate(fn, ...args)`, both return `0`
//! - `__initDone(success)` releases the thread blocked in `initialize`
//! - `__log(level, message)` logs through `tracing`
//! - `__fileSystem_readFromFile`, `__fileSystem_writeToFile`, `__fileSystem_moveFile`,
//!   `__fileSystem_statFile`

mod capture;
mod deferred;
mod engine;
pub mod error;
mod file_system;
mod filter_api;
mod fs_ops;
mod host;
pub mod mapped_source;
mod ops;
mod scheduler;

#[cfg(test)]
mod tests;

pub use deferred::{CallbackId, CapturedCallback, HostScheduler};
pub use error::{ApiError, EvalError, HostError, InitError, LoadFailure, ScriptException};
pub use file_system::{DefaultFileSystem, FileSystem, SharedFileSystem, StatResult, split_lines};
pub use filter_api::{ContentType, EmulationSelector, FilterEngine, MatchesResult};
pub use host::{HostOptions, HostState, ScriptRuntimeHost};
pub use mapped_source::MappedSourceBuffer;
pub use scheduler::TimerScheduler;

// Script globals: deferred callbacks, init gate, logging and file access.
deno_core::extension!(
    abp_host_globals,
    ops = [
        deferred::op_schedule_deferred,
        ops::op_init_done,
        ops::op_script_log,
        ops::op_register_host_hooks,
        fs_ops::op_fs_read_lines,
        fs_ops::op_fs_write,
        fs_ops::op_fs_move,
        fs_ops::op_fs_stat,
    ],
    esm_entry_point = "ext:abp_host_globals/host_globals.js",
    esm = [ dir "src", "host_globals.js" ],
    options = {
        file_system: SharedFileSystem,
        init_signal: ops::InitSignal,
    },
    state = |state, options| {
        state.put(options.file_system);
        state.put(options.init_signal);
        state.put(deferred::DeferredQueue::default());
    },
);
