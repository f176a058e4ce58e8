use std::{error, fmt, io, sync::Arc};

use arcstr::ArcStr;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A command was enqueued into, or execution was requested from, a
    /// batch that has already been executed.
    AlreadyExecuted,
    /// The client is shutting down; no further work is accepted.
    Shutdown,
    /// A connection to a node could not be obtained or was unusable.
    ConnectionFailed,
    /// No pool entry was eligible for acquisition.
    PoolExhausted,
    /// An I/O failure occurred before the server acknowledged the write.
    WriteFailed,
    /// The server did not reply within the configured response timeout.
    ResponseTimeout,
    /// The retry budget was exhausted before a response arrived.
    OperationTimeout,
    /// The slot has permanently moved to another node.
    Moved,
    /// The slot is being migrated; ask the target node for this attempt only.
    Ask,
    /// The server cannot respond because it is loading its dataset.
    BusyLoading,
    /// An error returned by the server, passed through unchanged.
    ResponseError,
    /// The authentication with the server failed.
    AuthenticationFailed,
    /// An I/O error outside the command write path.
    Io,
    /// An error raised on the client before anything was sent.
    Client,
}

/// Represents a failure in the batch executor or the connection pool.
///
/// For the most part you should be using the `Error` trait to interact
/// with this rather than the actual struct.
#[derive(Clone)]
pub struct KvError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    General(ErrorKind, &'static str, Option<ArcStr>),
    Internal {
        kind: ErrorKind,
        err: Arc<dyn error::Error + Send + Sync>,
    },
    PoolExhausted {
        frozen: Arc<[String]>,
        busy: Arc<[String]>,
    },
}

impl PartialEq for KvError {
    fn eq(&self, other: &KvError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::General(kind_a, _, _), &ErrorRepr::General(kind_b, _, _)) => {
                kind_a == kind_b
            }
            (ErrorRepr::PoolExhausted { .. }, ErrorRepr::PoolExhausted { .. }) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for KvError {
    fn from(err: io::Error) -> KvError {
        KvError {
            repr: ErrorRepr::Internal {
                kind: ErrorKind::Io,
                err: Arc::new(err),
            },
        }
    }
}

impl From<(ErrorKind, &'static str)> for KvError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> KvError {
        KvError {
            repr: ErrorRepr::General(kind, desc, None),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for KvError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> KvError {
        KvError {
            repr: ErrorRepr::General(kind, desc, Some(detail.into())),
        }
    }
}

impl error::Error for KvError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Internal { err, .. } => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::General(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                if let Some(detail) = detail {
                    f.write_str(": ")?;
                    detail.fmt(f)?;
                }
                Ok(())
            }
            ErrorRepr::Internal { err, .. } => err.fmt(f),
            ErrorRepr::PoolExhausted { frozen, busy } => {
                f.write_str("Connection pool exhausted!")?;
                if !frozen.is_empty() {
                    write!(f, " Disconnected hosts: {frozen:?}.")?;
                }
                if !busy.is_empty() {
                    write!(f, " Hosts with fully busy connections: {busy:?}.")?;
                }
                Ok(())
            }
        }
    }
}

impl KvError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::General(kind, _, _) => *kind,
            ErrorRepr::Internal { kind, .. } => *kind,
            ErrorRepr::PoolExhausted { .. } => ErrorKind::PoolExhausted,
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::General(_, _, detail) => detail.as_ref().map(|detail| detail.as_str()),
            _ => None,
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::AlreadyExecuted => "batch already executed",
            ErrorKind::Shutdown => "shutting down",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::PoolExhausted => "pool exhausted",
            ErrorKind::WriteFailed => "write failed",
            ErrorKind::ResponseTimeout => "response timeout",
            ErrorKind::OperationTimeout => "operation timeout",
            ErrorKind::Moved => "key moved",
            ErrorKind::Ask => "key moved (ask)",
            ErrorKind::BusyLoading => "busy loading",
            ErrorKind::ResponseError => "response error",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::Io => "I/O error",
            ErrorKind::Client => "client error",
        }
    }

    /// Indicates that this failure is an IO failure.
    pub fn is_io_error(&self) -> bool {
        self.kind() == ErrorKind::Io
    }

    /// Returns true if error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResponseTimeout | ErrorKind::OperationTimeout
        )
    }

    /// Returns true if this is a cluster redirect hint.
    pub fn is_cluster_redirect(&self) -> bool {
        matches!(self.kind(), ErrorKind::Moved | ErrorKind::Ask)
    }

    /// True for failures that consume retry budget rather than failing the
    /// whole batch outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailed
                | ErrorKind::PoolExhausted
                | ErrorKind::WriteFailed
                | ErrorKind::ResponseTimeout
                | ErrorKind::OperationTimeout
                | ErrorKind::Io
        )
    }

    /// Returns the node a redirect error refers to, as `(addr, slot)`.
    pub fn redirect_node(&self) -> Option<(&str, u16)> {
        if !self.is_cluster_redirect() {
            return None;
        }
        let mut iter = self.detail()?.split_ascii_whitespace();
        let slot: u16 = iter.next()?.parse().ok()?;
        let addr = iter.next()?;
        Some((addr, slot))
    }

    /// Creates a `MOVED` redirect hint for `slot` towards `addr`.
    pub fn moved(slot: u16, addr: &str) -> KvError {
        (ErrorKind::Moved, "slot moved", format!("{slot} {addr}")).into()
    }

    /// Creates an `ASK` redirect hint for `slot` towards `addr`.
    pub fn ask(slot: u16, addr: &str) -> KvError {
        (ErrorKind::Ask, "slot is migrating", format!("{slot} {addr}")).into()
    }

    /// Creates a structured pool-exhausted error with the host breakdown.
    pub fn pool_exhausted(frozen: Vec<String>, busy: Vec<String>) -> KvError {
        KvError {
            repr: ErrorRepr::PoolExhausted {
                frozen: frozen.into(),
                busy: busy.into(),
            },
        }
    }

    /// Hosts that were excluded from acquisition because they are frozen.
    /// Empty unless the kind is [`ErrorKind::PoolExhausted`].
    pub fn frozen_hosts(&self) -> &[String] {
        match &self.repr {
            ErrorRepr::PoolExhausted { frozen, .. } => frozen,
            _ => &[],
        }
    }

    /// Hosts whose connection slots were all in use.
    /// Empty unless the kind is [`ErrorKind::PoolExhausted`].
    pub fn busy_hosts(&self) -> &[String] {
        match &self.repr {
            ErrorRepr::PoolExhausted { busy, .. } => busy,
            _ => &[],
        }
    }
}
