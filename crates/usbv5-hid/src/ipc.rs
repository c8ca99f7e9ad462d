//! Guest IPC request shapes, command identifiers and return codes.

use std::sync::{Mutex, MutexGuard};

pub const IPC_SUCCESS: i32 = 0;
pub const IPC_EINVAL: i32 = -4;
pub const IPC_ENOENT: i32 = -6;

pub const USBV5_ESTALL: i32 = -7004;
pub const USBV5_ETRANSFER: i32 = -7005;
/// Result of a transfer aborted by `CANCEL_ENDPOINT`.
pub const USBV5_ECANCELED: i32 = -7022;

/// Opaque guest request identifier. Asynchronous replies are routed back by this value.
pub type RequestId = u32;

/// A discrete (non-vectored) command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoctlRequest {
    pub request: u32,
    pub buffer_in: u32,
    pub buffer_in_size: u32,
    pub buffer_out: u32,
    pub buffer_out_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoVector {
    pub address: u32,
    pub size: u32,
}

/// A vectored command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoctlvRequest {
    pub id: RequestId,
    pub request: u32,
    pub in_vectors: Vec<IoVector>,
    pub io_vectors: Vec<IoVector>,
}

impl IoctlvRequest {
    pub fn vector_count(&self) -> usize {
        self.in_vectors.len() + self.io_vectors.len()
    }

    /// Vector `index` of the concatenation `in_vectors ++ io_vectors`.
    pub fn vector(&self, index: usize) -> Option<IoVector> {
        self.in_vectors
            .iter()
            .chain(self.io_vectors.iter())
            .nth(index)
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    GetVersion,
    GetDeviceChange,
    Shutdown,
    GetDeviceParams,
    AttachFinish,
    SetAlternateSetting,
    SuspendResume,
    CancelEndpoint,
    Unknown(u32),
}

impl From<u32> for Ioctl {
    fn from(value: u32) -> Self {
        match value {
            0 => Ioctl::GetVersion,
            1 => Ioctl::GetDeviceChange,
            2 => Ioctl::Shutdown,
            3 => Ioctl::GetDeviceParams,
            6 => Ioctl::AttachFinish,
            7 => Ioctl::SetAlternateSetting,
            16 => Ioctl::SuspendResume,
            17 => Ioctl::CancelEndpoint,
            other => Ioctl::Unknown(other),
        }
    }
}

impl From<Ioctl> for u32 {
    fn from(value: Ioctl) -> Self {
        match value {
            Ioctl::GetVersion => 0,
            Ioctl::GetDeviceChange => 1,
            Ioctl::Shutdown => 2,
            Ioctl::GetDeviceParams => 3,
            Ioctl::AttachFinish => 6,
            Ioctl::SetAlternateSetting => 7,
            Ioctl::SuspendResume => 16,
            Ioctl::CancelEndpoint => 17,
            Ioctl::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctlv {
    CtrlMsg,
    IntrMsg,
    IsoMsg,
    BulkMsg,
    Unknown(u32),
}

impl From<u32> for Ioctlv {
    fn from(value: u32) -> Self {
        match value {
            18 => Ioctlv::CtrlMsg,
            19 => Ioctlv::IntrMsg,
            20 => Ioctlv::IsoMsg,
            21 => Ioctlv::BulkMsg,
            other => Ioctlv::Unknown(other),
        }
    }
}

impl From<Ioctlv> for u32 {
    fn from(value: Ioctlv) -> Self {
        match value {
            Ioctlv::CtrlMsg => 18,
            Ioctlv::IntrMsg => 19,
            Ioctlv::IsoMsg => 20,
            Ioctlv::BulkMsg => 21,
            Ioctlv::Unknown(other) => other,
        }
    }
}

/// Outcome of handling one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    /// Reply immediately with this return value.
    Reply(i32),
    /// The request was handed to the host; its reply arrives through the [`ReplyQueue`].
    Pending,
    /// Unrecognized command. The guest sees success.
    Unhandled { request: u32 },
}

impl CommandReply {
    pub const SUCCESS: CommandReply = CommandReply::Reply(IPC_SUCCESS);

    /// The value the guest receives now, or `None` when the reply is deferred.
    pub fn return_value(&self) -> Option<i32> {
        match self {
            CommandReply::Reply(value) => Some(*value),
            CommandReply::Pending => None,
            CommandReply::Unhandled { .. } => Some(IPC_SUCCESS),
        }
    }
}

/// Deferred reply for a vectored request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestReply {
    pub id: RequestId,
    pub result: i32,
}

/// Thread-safe queue of deferred replies, drained by the IPC scheduler.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    inner: Mutex<Vec<GuestReply>>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GuestReply>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, reply: GuestReply) {
        self.lock().push(reply);
    }

    pub fn drain(&self) -> Vec<GuestReply> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
