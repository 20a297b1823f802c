//! The protocol-level error type.

use gitwire_pktline::{decode, encode};

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by request parsing and the negotiation state machines.
///
/// Protocol violations carry the offending line so failures are diagnosable
/// from logs alone; peer rejections (`ERR` lines) are distinguishable from
/// local defects.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer sent an `ERR <message>` line, e.g. repository-not-found.
    #[error("remote: {message}")]
    RemoteRejected {
        /// The message exactly as the peer sent it.
        message: String,
    },

    /// A line arrived that the current protocol state cannot accept.
    #[error("protocol violation: {reason} in line {line:?}")]
    Protocol {
        /// What was expected or wrong.
        reason: String,
        /// The offending line, lossily decoded for display.
        line: String,
    },

    /// A second `filter` line makes the request ambiguous.
    #[error("multiple filter specifications: {line:?}")]
    AmbiguousFilter {
        /// The second filter line.
        line: String,
    },

    /// `deepen` cannot be combined with `deepen-since` or `deepen-not`.
    #[error("conflicting deepen modes: {line:?}")]
    ConflictingDeepen {
        /// The line that introduced the conflict.
        line: String,
    },

    /// A ref update was not a fast-forward and force was not requested.
    #[error("non-fast-forward update to {refname}")]
    NonFastForward {
        /// The rejected ref.
        refname: String,
    },

    /// Atomic push aborted because one update was rejected locally.
    #[error("atomic push aborted: {refname} would be rejected")]
    AtomicAborted {
        /// The update that caused the abort.
        refname: String,
    },

    /// The status report failed to mention a command we sent.
    #[error("no status reported for {refname}")]
    MissingReport {
        /// The unreported ref.
        refname: String,
    },

    /// The server signalled an internal error for too many attempts in a row.
    #[error("giving up after {attempts} attempts")]
    GivingUp {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The caller asked to stop via its progress sink.
    #[error("operation cancelled")]
    Cancelled,

    /// Packet line framing was corrupt.
    #[error(transparent)]
    Framing(#[from] decode::Error),

    /// Packet line encoding failed.
    #[error(transparent)]
    Encode(#[from] encode::Error),

    /// The underlying stream failed; timeouts surface here.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(reason: impl Into<String>, line: &[u8]) -> Self {
        Error::Protocol {
            reason: reason.into(),
            line: String::from_utf8_lossy(line).into_owned(),
        }
    }

    /// `true` for transient failures a stateless transport may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

/// Retry `op` on retryable failures, up to `max_attempts` total attempts.
///
/// This is the client-side answer to the server's "internal error, retry
/// this batch" signal on stateless transports; anything non-retryable
/// propagates immediately, and exhausting the budget yields
/// [`Error::GivingUp`].
pub fn with_retries<T>(max_attempts: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                tracing::warn!(attempt, error = %err, "retrying after transient failure");
            }
            Err(err) if err.is_retryable() => {
                return Err(Error::GivingUp { attempts: attempt });
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn transient() -> Error {
        Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let mut calls = 0;
        let result = with_retries(3, || {
            calls += 1;
            if calls < 3 {
                Err(transient())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_the_attempt_budget() {
        let mut calls = 0;
        let err = with_retries(3, || -> Result<()> {
            calls += 1;
            Err(transient())
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, Error::GivingUp { attempts: 3 }));
    }

    #[test]
    fn protocol_violations_are_not_retried() {
        let mut calls = 0;
        let err = with_retries(3, || -> Result<()> {
            calls += 1;
            Err(Error::protocol("bad line", b"nonsense"))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
