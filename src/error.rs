//! Crate-wide error taxonomy.
//!
//! Every public operation returns [`Result`]. The variants mirror the
//! recovery policy of the overlay: only [`Error::Unavailable`] is retried
//! (after tainting the peer it came from), [`Error::StateChanged`] restarts
//! the post-join state calculation, and everything else surfaces to the
//! caller.

use crate::state::State;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the overlay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request was malformed: missing routing key, malformed ID, joining
    /// with an ID that is already in use under a different address, and
    /// similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A transient transport failure. Callers taint the peer Unhealthy and
    /// retry through the next-hop selection.
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    /// Routing could not produce a next hop at all. This indicates a bug in
    /// the routing state rather than a recoverable condition.
    #[error("internal routing error: {0}")]
    Internal(String),

    /// A join failed irrecoverably after the hello chain completed.
    #[error("join aborted: {0}")]
    Aborted(String),

    /// A forwarder configured to disallow self-routing resolved the local
    /// node as the destination.
    #[error("route resolved to the local node")]
    SelfRouting,

    /// A node attempted to join a cluster through itself. Seen when peer
    /// discovery hands a node its own registration.
    #[error("can't join self")]
    SelfJoin,

    /// A hello acknowledged a state version that is no longer current. The
    /// receiver's present state rides along so the initiator can refresh
    /// its view and retry.
    #[error("state out of date")]
    StateChanged {
        /// The sender's state as of the failed acknowledgment.
        new_state: Box<State>,
    },

    /// The operation raced with component shutdown.
    #[error("operation canceled")]
    Canceled,

    /// The operation ran out of time.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The forwarder tainted every candidate hop without finding a live
    /// peer. Distinguishes "the overlay is unreachable" from the unbounded
    /// retry the routing algorithm would otherwise permit.
    #[error("exhausted routing candidates after repeated failures")]
    Exhausted,

    /// A handle was used after its component shut down.
    #[error("component closed")]
    Closed,
}

impl Error {
    /// True for failures that the forwarder and join propagation recover
    /// from by tainting the peer and retrying.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    /// Stable wire code for the variant, used by the RPC layer to carry the
    /// taxonomy across process boundaries.
    pub(crate) fn code(&self) -> u32 {
        match self {
            Error::InvalidArgument(_) => 1,
            Error::Unavailable(_) => 2,
            Error::Internal(_) => 3,
            Error::Aborted(_) => 4,
            Error::SelfRouting => 5,
            Error::SelfJoin => 6,
            Error::StateChanged { .. } => 7,
            Error::Canceled => 8,
            Error::DeadlineExceeded => 9,
            Error::Exhausted => 10,
            Error::Closed => 11,
        }
    }

    /// Rebuild a taxonomy variant from its wire code and message. Unknown
    /// codes collapse to [`Error::Internal`].
    pub(crate) fn from_code(code: u32, message: String) -> Error {
        match code {
            1 => Error::InvalidArgument(message),
            2 => Error::Unavailable(message),
            4 => Error::Aborted(message),
            5 => Error::SelfRouting,
            6 => Error::SelfJoin,
            8 => Error::Canceled,
            9 => Error::DeadlineExceeded,
            10 => Error::Exhausted,
            11 => Error::Closed,
            _ => Error::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let errors = [
            Error::InvalidArgument("bad key".into()),
            Error::Unavailable("conn refused".into()),
            Error::Internal("no hop".into()),
            Error::Aborted("peer gone".into()),
            Error::SelfRouting,
            Error::SelfJoin,
            Error::Canceled,
            Error::DeadlineExceeded,
            Error::Exhausted,
            Error::Closed,
        ];
        for err in errors {
            let (code, msg) = (err.code(), err.to_string());
            let back = Error::from_code(code, msg.clone());
            assert_eq!(back.code(), code, "{msg}");
        }
    }

    #[test]
    fn unknown_code_is_internal() {
        assert!(matches!(
            Error::from_code(999, "?".into()),
            Error::Internal(_)
        ));
    }
}
