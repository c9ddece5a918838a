/// Shared error taxonomy for the metronome core, per the error handling
/// design: every fallible operation returns one of these variants rather
/// than an opaque `anyhow::Error`. None of these are fatal — callers either
/// retry, accept degraded behavior, or surface the error to a collaborator.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Configuration setter rejected an out-of-range field. The candidate
    /// section is left entirely unapplied.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    /// Persistent storage rejected a read or write.
    #[error("storage operation failed: {0}")]
    StorageFailure(String),

    /// The I2C real-time clock did not respond or returned garbage.
    #[error("RTC I/O failure: {0}")]
    RtcIoFailure(String),

    /// Neither the RTC nor a network time source is available; only
    /// monotonic time can be served.
    #[error("no wall-clock time source available")]
    TimeSourceUnavailable,

    /// A MIDI clock/realtime datagram could not be sent within its soft
    /// deadline or the underlying socket returned an error.
    #[error("network send failed: {0}")]
    NetworkSendFailure(String),

    /// A relay pulse request arrived within the debounce window of the
    /// previous pulse's release and was rejected.
    #[error("relay pulse rejected: debounce window active")]
    RelayDebounceReject,

    /// A collaborator opted into rate limiting and this delivery was
    /// suppressed to respect the minimum interval.
    #[error("rate limited")]
    RateLimited,
}

pub type CoreResult<T> = Result<T, CoreError>;
