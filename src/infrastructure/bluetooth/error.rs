use crate::infrastructure::bluetooth::transport::TransportError;
use thiserror::Error;

/// Errors from link-level operations (writes, commands)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,
    #[error("Write queue cleared before the write completed")]
    WriteQueueCleared,
    #[error("Coordinator stopped")]
    ServiceStopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reasons an image transfer session ends without success
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("an image transfer is already in progress")]
    AlreadyActive,
    #[error("not connected")]
    NotConnected,
    #[error("image is empty")]
    EmptyImage,
    #[error("no master device available")]
    NoMasterDevice,
    #[error("target not ready")]
    TargetNotReady,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("disconnected during transfer")]
    Disconnected,
    #[error("transfer cancelled")]
    Cancelled,
}

impl From<LinkError> for TransferError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NotConnected | LinkError::ServiceStopped => TransferError::NotConnected,
            other => TransferError::WriteFailed(other.to_string()),
        }
    }
}
