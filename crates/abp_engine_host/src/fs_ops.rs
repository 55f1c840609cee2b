//! Deno ops behind the `__fileSystem_*` globals
//!
//! The ops perform the I/O and report failures as values. The JS shims in
//! `host_globals.js` turn those values into the script callbacks, so an
//! exception thrown by a callback propagates out of the global call.

use deno_core::{OpState, op2};
use serde::Serialize;

use crate::file_system::{SharedFileSystem, StatResult, split_lines};

#[derive(Debug, Default, Serialize)]
pub(crate) struct ReadReply {
    lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatReply {
    #[serde(flatten)]
    stat: StatResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Reads a whole file and splits it into non-empty lines
#[op2]
#[serde]
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn op_fs_read_lines(state: &mut OpState, #[string] path: String) -> ReadReply {
    let fs = state.borrow::<SharedFileSystem>();
    let path = fs.resolve(&path);

    match fs.read(&path) {
        Ok(data) => ReadReply {
            lines: split_lines(&data)
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .collect(),
            error: None,
        },
        Err(error) => {
            tracing::debug!(%path, %error, "Script file read failed");
            ReadReply {
                lines: Vec::new(),
                error: Some(error),
            }
        }
    }
}

/// Writes `content` verbatim, returns the failure message if any
#[op2]
#[string]
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn op_fs_write(
    state: &mut OpState,
    #[string] path: String,
    #[string] content: String,
) -> Option<String> {
    let fs = state.borrow::<SharedFileSystem>();
    let path = fs.resolve(&path);
    fs.write(&path, content.as_bytes()).err()
}

#[op2]
#[string]
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn op_fs_move(
    state: &mut OpState,
    #[string] from: String,
    #[string] to: String,
) -> Option<String> {
    let fs = state.borrow::<SharedFileSystem>();
    let (from, to) = (fs.resolve(&from), fs.resolve(&to));
    fs.move_file(&from, &to).err()
}

#[op2]
#[serde]
#[allow(clippy::needless_pass_by_value)]
pub(crate) fn op_fs_stat(state: &mut OpState, #[string] path: String) -> StatReply {
    let fs = state.borrow::<SharedFileSystem>();
    let path = fs.resolve(&path);

    match fs.stat(&path) {
        Ok(stat) => StatReply { stat, error: None },
        Err(error) => StatReply {
            stat: StatResult::default(),
            error: Some(error),
        },
    }
}
