//! USB error types

use core::fmt;

/// USB operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Host controller already initialized
    AlreadyInitialized,
    /// Endpoint answered with STALL
    Stalled,
    /// Babble, bus error or data toggle mismatch after the retry budget
    TransactionError,
    /// Error during a split sub-transaction
    SplitError,
    /// Device NAK'd the transaction (pacing only, never terminal on its own)
    Nak,
    /// Short packet on a transfer that does not accept one
    ShortPacket,
    /// Transfer deadline expired
    Timeout,
    /// Transfer aborted by the caller
    Cancelled,
    /// Core did not leave reset within the poll budget
    ResetTimeout,
    /// Register port does not look like a DWC OTG core
    UnsupportedCore,
    /// Packet larger than the endpoint or buffer allows
    BufferOverflow,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// Stale or unknown pipe/transfer handle
    InvalidHandle,
    /// No available resources (descriptors, transfer slots, pipes)
    NoResources,
    /// Unsupported operation
    Unsupported,
}

impl UsbError {
    /// Check if the error ends a transfer rather than driving a retry
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Nak | Self::ShortPacket)
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "USB host already initialized"),
            Self::Stalled => write!(f, "Endpoint stalled"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::SplitError => write!(f, "Split transaction error"),
            Self::Nak => write!(f, "Device NAK"),
            Self::ShortPacket => write!(f, "Short packet"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Cancelled => write!(f, "Transfer cancelled"),
            Self::ResetTimeout => write!(f, "Controller reset timed out"),
            Self::UnsupportedCore => write!(f, "Unsupported controller core"),
            Self::BufferOverflow => write!(f, "Buffer overflow"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::InvalidHandle => write!(f, "Invalid handle"),
            Self::NoResources => write!(f, "No resources available"),
            Self::Unsupported => write!(f, "Unsupported operation"),
        }
    }
}

/// Terminal status reported to the upper stack for a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    /// All descriptors completed
    Success,
    /// Endpoint refused the transfer
    Stalled,
    /// Transaction or split error
    IoError,
    /// Deadline exceeded
    Timeout,
    /// Aborted by the caller
    Cancelled,
}

impl TransferStatus {
    /// Map a descriptor-level error onto the status the caller sees
    pub const fn from_error(err: UsbError) -> Self {
        match err {
            UsbError::Stalled => Self::Stalled,
            UsbError::Timeout => Self::Timeout,
            UsbError::Cancelled => Self::Cancelled,
            _ => Self::IoError,
        }
    }

    /// Check if the transfer succeeded
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<Option<UsbError>> for TransferStatus {
    fn from(err: Option<UsbError>) -> Self {
        match err {
            None => Self::Success,
            Some(e) => Self::from_error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TransferStatus::from_error(UsbError::Stalled), TransferStatus::Stalled);
        assert_eq!(TransferStatus::from_error(UsbError::SplitError), TransferStatus::IoError);
        assert_eq!(TransferStatus::from_error(UsbError::TransactionError), TransferStatus::IoError);
        assert_eq!(TransferStatus::from_error(UsbError::Cancelled), TransferStatus::Cancelled);
        assert_eq!(TransferStatus::from(None), TransferStatus::Success);
    }

    #[test]
    fn test_nak_is_not_terminal() {
        assert!(!UsbError::Nak.is_terminal());
        assert!(!UsbError::ShortPacket.is_terminal());
        assert!(UsbError::Stalled.is_terminal());
    }
}
