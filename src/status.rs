//! The shared namespace of channel access result codes.
//!
//! Every outcome in this crate - transport completions, synchronous call
//! results, callback argument status fields - is expressed as an
//! [`ErrorCondition`]. Synchronous-style calls wrap a non-success condition in
//! [`ChannelError`] so that callers get the human-readable message for the
//! code and can use `?` propagation; callback-style calls deliver the raw
//! condition inside their argument record instead.

/// How bad a given [`ErrorCondition`] is considered to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// Named result codes for channel access operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    BadSyncGrp = 44,
    NoRdAccess = 46,
    NoWtAccess = 47,
    NoConvert = 50,
    BadChId = 51,
    IsAttached = 53,
    UnavailInServ = 54,
    ChanDestroy = 55,
}

impl ErrorCondition {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::AllocMem => ErrorSeverity::Warning,
            Self::TooLarge => ErrorSeverity::Warning,
            Self::Timeout => ErrorSeverity::Warning,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Severe,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::EvDisallow => ErrorSeverity::Error,
            Self::BadMonId => ErrorSeverity::Error,
            Self::BadMask => ErrorSeverity::Error,
            Self::BadSyncGrp => ErrorSeverity::Error,
            Self::NoRdAccess => ErrorSeverity::Warning,
            Self::NoWtAccess => ErrorSeverity::Warning,
            Self::NoConvert => ErrorSeverity::Warning,
            Self::BadChId => ErrorSeverity::Error,
            Self::IsAttached => ErrorSeverity::Warning,
            Self::UnavailInServ => ErrorSeverity::Warning,
            Self::ChanDestroy => ErrorSeverity::Warning,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Promote this condition to a `Result`, mapping non-success to an error.
    pub fn to_result(self) -> Result<(), ChannelError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ChannelError(self))
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::TooLarge => "The requested data transfer is greater than available memory",
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::EvDisallow => "Request inappropriate within subscription (monitor) update callback",
            Self::BadMonId => "Bad event subscription (monitor) identifier",
            Self::BadMask => "Invalid event selection mask",
            Self::BadSyncGrp => "Invalid synchronous group identifier",
            Self::NoRdAccess => "Read access denied",
            Self::NoWtAccess => "Write access denied",
            Self::NoConvert => "No reasonable data conversion between client and server types",
            Self::BadChId => "Invalid channel identifier",
            Self::IsAttached => "Thread is already attached to a client context",
            Self::UnavailInServ => "Not supported by attached service",
            Self::ChanDestroy => "User destroyed channel",
        })
    }
}

/// Error type returned by the synchronous-style channel operations.
///
/// A thin wrapper so that every error carries exactly one named condition and
/// its standard message.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ChannelError(pub ErrorCondition);

impl ChannelError {
    pub fn condition(&self) -> ErrorCondition {
        self.0
    }

    /// Whether this error is a bounded-wait expiry rather than a hard
    /// protocol failure, so callers can decide to retry versus abort.
    pub fn is_timeout(&self) -> bool {
        self.0 == ErrorCondition::Timeout
    }
}

impl From<ErrorCondition> for ChannelError {
    fn from(condition: ErrorCondition) -> Self {
        ChannelError(condition)
    }
}
