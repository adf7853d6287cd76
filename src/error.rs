//! definition of the general ethercat error type, and of the faults recorded in diagnostics

use std::{
    sync::Arc,
    time::Instant,
    };
use core::fmt;

/**
    failure of an ethercat operation, classified by the party responsible for it

    `T` is the detail a slave gives for a failed operation, for instance an AL status code
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// the socket failed
    Io(Arc<std::io::Error>),
    /// a slave refused or failed the operation
    Slave(T),
    /// the master was misused, or is not in a state allowing the operation
    Master(&'static str),
    /// a frame or a slave answer is inconsistent: wrong working counter, bad size, unexpected content
    Protocol(&'static str),
    /// no answer in time, retrying may succeed
    Timeout(&'static str),
}

pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io: {}", error),
            Self::Slave(error) => write!(f, "slave: {:?}", error),
            Self::Master(message) => write!(f, "master: {}", message),
            Self::Protocol(message) => write!(f, "protocol: {}", message),
            Self::Timeout(message) => write!(f, "timeout: {}", message),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

// `From<T> for T` forbids a generic From between error types
impl<E> EthercatError<E> {
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(|e| F::from(e))
    }
    /// convert the slave detail, other variants are kept
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Slave(value) => EthercatError::Slave(callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
        }
    }
    /// category of fault this error is reporting
    pub fn kind(&self) -> FaultKind {
        match self {
            EthercatError::Io(_) => FaultKind::Transport,
            EthercatError::Protocol(_) => FaultKind::Transport,
            EthercatError::Timeout(_) => FaultKind::DatagramTimeout,
            EthercatError::Slave(_) => FaultKind::SlaveConfiguration,
            EthercatError::Master(_) => FaultKind::SlaveConfiguration,
        }
    }
}
impl EthercatError<()> {
    /**
        convert an error with no slave-specific type into an error with one

        an untyped slave error cannot be expressed in the new type, it is reported as a protocol error
    */
    pub fn upgrade<F>(self) -> EthercatError<F> {
        match self {
            EthercatError::Slave(()) => EthercatError::Protocol("slave reported an error without details"),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
        }
    }
}


/// kinds of failure the master reports in diagnostics
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultKind {
    /// frame send or receive failure, or a transport entirely down
    Transport,
    /// no valid response to a datagram within its deadline, after its retries
    DatagramTimeout,
    /// a slave reported an error flag, rejected a state request or could not be configured
    SlaveConfiguration,
    /// a position in the chain did not answer, or a slave changed or disappeared
    Topology,
    /// too many consecutive process data exchanges missed
    WatchdogExpired,
}

/// a fault recorded at a given time
#[derive(Clone, Debug)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub at: Instant,
}
impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {kind, message: message.into(), at: Instant::now()}
    }
    /// record an error, using the kind deduced from the error variant
    pub fn from_error<T: fmt::Debug>(error: &EthercatError<T>) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}
impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
