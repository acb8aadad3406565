use thiserror::Error;

/// Errors returned by clocks and timer handles.
#[derive(Error, Debug)]
pub enum TimerError {
    /// `stop` or `reset` was called on a timer that no clock produced,
    /// i.e. a `Timer::default()` value.
    #[error("timer: {op} called on uninitialized Timer")]
    UninitializedHandle { op: &'static str },

    /// The dispatcher runtime or its thread could not be started.
    #[error("failed to start timer dispatcher: {0}")]
    Runtime(#[from] std::io::Error),
}
