//! Copies a script call site into owned handles that outlive the call frame.

use std::time::Duration;

use deno_core::v8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureShape {
    /// `(fn, ...args)`
    Immediate,
    /// `(fn, delayMillis, ...args)`
    Delayed,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CaptureError {
    #[error("Deferred call site is not an argument list")]
    NotAnArgumentList,

    #[error("Deferred callback is not a function")]
    NotCallable,

    #[error("Deferred call site is missing its delay")]
    MissingDelay,
}

/// A function plus its arguments, each held by its own global handle
pub(crate) struct CapturedCall {
    pub(crate) function: v8::Global<v8::Value>,
    pub(crate) arguments: Vec<v8::Global<v8::Value>>,
    pub(crate) delay: Option<Duration>,
}

impl CapturedCall {
    /// Function first, then its arguments, as passed to the replay trampoline
    pub(crate) fn into_call_args(self) -> Vec<v8::Global<v8::Value>> {
        let mut args = Vec::with_capacity(self.arguments.len() + 1);
        args.push(self.function);
        args.extend(self.arguments);
        args
    }
}

pub(crate) fn capture(
    scope: &mut v8::PinScope,
    call_site: &v8::Global<v8::Value>,
    shape: CaptureShape,
) -> Result<CapturedCall, CaptureError> {
    let call_site = v8::Local::new(scope, call_site);
    let list = v8::Local::<v8::Array>::try_from(call_site)
        .map_err(|_| CaptureError::NotAnArgumentList)?;
    let count = list.length();

    let function = list
        .get_index(scope, 0)
        .filter(|value| value.is_function())
        .ok_or(CaptureError::NotCallable)?;

    let first_argument = match shape {
        CaptureShape::Immediate => 1,
        CaptureShape::Delayed => 2,
    };

    let delay = match shape {
        CaptureShape::Immediate => None,
        CaptureShape::Delayed => {
            let millis = list
                .get_index(scope, 1)
                .and_then(|value| value.number_value(scope))
                .ok_or(CaptureError::MissingDelay)?;
            Some(delay_from_millis(millis))
        }
    };

    let mut arguments = Vec::with_capacity(count.saturating_sub(first_argument) as usize);
    for index in first_argument..count {
        let value = list
            .get_index(scope, index)
            .unwrap_or_else(|| v8::undefined(scope).into());
        arguments.push(v8::Global::new(scope, value));
    }

    Ok(CapturedCall {
        function: v8::Global::new(scope, function),
        arguments,
        delay,
    })
}

/// Negative and NaN delays fire as soon as possible
pub(crate) fn delay_from_millis(millis: f64) -> Duration {
    if millis.is_nan() || millis <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(Duration::MAX)
}
