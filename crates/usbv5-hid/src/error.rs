use thiserror::Error;

use crate::ipc::{IPC_EINVAL, IPC_ENOENT};

/// Failure reported by a host USB device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host device disconnected")]
    Disconnected,
    #[error("host device busy")]
    Busy,
    #[error("host rejected request: {0}")]
    Rejected(String),
    /// Backend already produced a guest return code.
    #[error("host returned IPC error {0}")]
    Ipc(i32),
}

impl HostError {
    pub fn ipc_code(&self) -> i32 {
        match self {
            HostError::Disconnected => IPC_ENOENT,
            HostError::Ipc(code) if *code < 0 => *code,
            HostError::Ipc(_) | HostError::Busy | HostError::Rejected(_) => IPC_EINVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HidV5Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no device for handle {handle:#010x}")]
    InvalidHandle { handle: u32 },
    #[error("host device {host_id:#x} is gone")]
    NoHostDevice { host_id: u64 },
    #[error("transfer submission failed: {0}")]
    Submission(#[source] HostError),
}

impl HidV5Error {
    /// Guest-visible return value for this error.
    pub fn ipc_code(&self) -> i32 {
        match self {
            HidV5Error::InvalidArgument(_) | HidV5Error::InvalidHandle { .. } => IPC_EINVAL,
            HidV5Error::NoHostDevice { .. } => IPC_ENOENT,
            HidV5Error::Submission(err) => err.ipc_code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HidV5Error>;
