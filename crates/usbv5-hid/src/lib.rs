//! USBv5 HID driver interface emulation.
//!
//! Guest applications talk to what they believe is the native HID v5 kernel driver. [`UsbHidV5`]
//! reproduces that driver's request/response shapes (big-endian, fixed offsets) and delegates the
//! actual I/O to a [`HostDevice`], typically a [`PassthroughDevice`] drained by a host USB backend.
//!
//! Device slots are owned by the enumeration engine through [`SharedRegistry`]; this crate only
//! resolves handles and maintains each slot's interrupt endpoint table.

#![forbid(unsafe_code)]

pub mod config;
pub mod descriptor;
pub mod error;
pub mod hidv5;
pub mod host;
pub mod ipc;
pub mod passthrough;
pub mod registry;
pub mod transfer;

pub use config::{ConfigError, HidV5Config};
pub use descriptor::{
    ConfigDescriptor, DescriptorError, DescriptorTree, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor,
};
pub use error::{HidV5Error, HostError};
pub use hidv5::{is_visible, DeviceChangeHandler, UsbHidV5, HID_CLASS, USBV5_VERSION};
pub use host::HostDevice;
pub use ipc::{
    CommandReply, GuestReply, IoVector, Ioctl, IoctlRequest, Ioctlv, IoctlvRequest, ReplyQueue,
};
pub use passthrough::{PassthroughDevice, UsbHostAction, UsbHostCompletion};
pub use registry::{AdditionalDeviceData, DeviceHandle, DeviceRegistry, SharedRegistry};
pub use transfer::{SetupPacket, Transfer, TransferKind, TransferStatus};

pub use guest_memory::{FlatMemory, GuestMemory};
