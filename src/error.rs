//! Error types for limiter configuration and operation.
use crate::store::StoreError;
use std::fmt;

/// Unified error type for limiter construction and decisions.
///
/// Configuration faults surface at construction and never at request time;
/// store faults flow through from the backing [`Store`](crate::store::Store)
/// on every decision that has to persist state.
#[derive(Debug)]
pub enum Error {
    /// The configured rate is zero or too large for exact arithmetic.
    InvalidRate,
    /// The configured window is zero.
    InvalidWindow,
    /// The configured burst size is too large for exact arithmetic.
    InvalidBurstSize,
    /// A trusted-proxy entry is neither a valid IP nor a valid CIDR.
    InvalidTrustedProxy(String),
    /// The backing store failed.
    Store(StoreError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRate => write!(f, "rate must be positive and at most 2^53"),
            Self::InvalidWindow => write!(f, "window must be positive"),
            Self::InvalidBurstSize => write!(f, "burst size must be at most 2^53"),
            Self::InvalidTrustedProxy(entry) => {
                write!(f, "invalid trusted proxy IP or CIDR: {}", entry)
            }
            Self::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl Error {
    /// Check if this error is a key-length input fault, looking through
    /// wrapped store errors.
    pub fn is_key_too_long(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_key_too_long())
    }

    /// Check if this error is a store capacity fault, looking through
    /// wrapped store errors.
    pub fn is_store_full(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_store_full())
    }

    /// Check if this error is a configuration fault.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidRate
                | Self::InvalidWindow
                | Self::InvalidBurstSize
                | Self::InvalidTrustedProxy(_)
        )
    }

    /// Borrow the store error if present.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}
