use thiserror::Error;

/// Failure of a single transfer on a pipe, as reported by the controller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer timed out")]
    Timeout,
    #[error("bus or protocol error")]
    Bus,
}

/// Errors surfaced by the host stack.
///
/// Enumeration and configuration calls return exactly one of these; no
/// partially-acquired resource survives an error return.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Malformed caller input, detected before any resource is touched.
    #[error("invalid argument")]
    InvalidArgument,
    /// The bus address bitmap is exhausted.
    #[error("no free device address")]
    NoFreeAddress,
    /// The configuration's bandwidth requirement exceeds the bus budget.
    #[error("insufficient bus bandwidth")]
    NoBandwidth,
    /// The controller cannot supply the configuration's current draw.
    #[error("insufficient bus power")]
    NoPower,
    /// Malformed or short descriptor response.
    #[error("invalid descriptor")]
    InvalidDescriptor,
    /// A control transfer returned zero bytes where data was expected.
    #[error("control transfer failed")]
    TransferFailed,
    /// The device was already torn down.
    #[error("device already disconnected")]
    AlreadyDisconnected,
    /// No driver claimed the device or interface. Not fatal.
    #[error("no driver available")]
    Unavailable,
    #[error("invalid device speed")]
    InvalidSpeed,
    #[error("operation timed out")]
    Timeout,
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

pub type Result<T = ()> = core::result::Result<T, UsbError>;
