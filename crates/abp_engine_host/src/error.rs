use std::{fmt, time::Duration};

use camino::Utf8PathBuf;
use deno_core::error::{CoreError, JsError};

use crate::mapped_source::MapError;

/// A script-level exception that crossed back into host code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) if !stack.is_empty() => write!(f, "{}\n{stack}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptException {}

impl From<Box<JsError>> for ScriptException {
    fn from(err: Box<JsError>) -> Self {
        Self {
            message: err.exception_message.clone(),
            stack: err.stack.clone(),
        }
    }
}

impl From<CoreError> for ScriptException {
    fn from(err: CoreError) -> Self {
        Self::new(err.to_string())
    }
}

/// Failures of the host plumbing around the engine thread
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error("Script runtime has not been initialized")]
    NotInitialized,

    #[error("Script runtime is closed")]
    Closed,

    #[error("Failed to start script engine: {0}")]
    EngineStart(String),

    #[error("Callback was captured by a different script runtime")]
    ForeignCallback,

    #[error("Script engine is busy on this thread")]
    EngineBusy,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadFailure {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error("Script bundle is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0}")]
    Script(ScriptException),
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Script runtime is already initialized")]
    AlreadyInitialized,

    #[error("Failed loading script bundle {path}: {source}")]
    LoadFailure {
        path: Utf8PathBuf,
        #[source]
        source: LoadFailure,
    },

    #[error("Script bundle reported a failed initialization")]
    ScriptRejected,

    #[error("Script bundle did not signal initialization within {0:?}")]
    InitTimeout(Duration),

    #[error("Failed bootstrapping subscription {path}: {message}")]
    BootstrapFailure { path: Utf8PathBuf, message: String },

    #[error(transparent)]
    Host(#[from] HostError),
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("{0}")]
    Script(ScriptException),

    #[error(transparent)]
    Host(#[from] HostError),
}

impl From<ScriptException> for EvalError {
    fn from(err: ScriptException) -> Self {
        EvalError::Script(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Global API object is not defined")]
    MissingApiObject,

    #[error("API.{0} is not a function")]
    MissingFunction(String),

    #[error("API call failed: {0}")]
    Script(ScriptException),

    #[error("Failed to marshal API argument: {0}")]
    Marshal(String),

    #[error("Unexpected result from API.{function}: {message}")]
    UnexpectedResult { function: String, message: String },

    #[error(transparent)]
    Host(#[from] HostError),
}

impl From<ScriptException> for ApiError {
    fn from(err: ScriptException) -> Self {
        ApiError::Script(err)
    }
}

/// Error type thrown into script by host ops
#[derive(Debug, thiserror::Error)]
pub(crate) enum BridgeError {
    #[error("__initDone was already called")]
    InitAlreadySignalled,

    #[error("Deferred callback registry not available")]
    RegistryNotAvailable,
}

impl deno_error::JsErrorClass for BridgeError {
    fn get_class(&self) -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("Error")
    }

    fn get_message(&self) -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Owned(self.to_string())
    }

    fn get_additional_properties(
        &self,
    ) -> Box<
        dyn Iterator<Item = (std::borrow::Cow<'static, str>, deno_error::PropertyValue)> + 'static,
    > {
        Box::new(std::iter::empty())
    }

    fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }
}
