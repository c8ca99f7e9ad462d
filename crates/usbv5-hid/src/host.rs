use crate::descriptor::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
use crate::error::HostError;
use crate::transfer::Transfer;

/// A physical USB device reached through the host USB stack.
///
/// Transfers are asynchronous: [`submit_transfer`](HostDevice::submit_transfer) returns once the
/// transfer is queued, and the implementation later finishes it through
/// [`Transfer::complete`] or [`Transfer::cancel`].
pub trait HostDevice: Send + Sync {
    /// Stable identifier, unique among attached host devices.
    fn id(&self) -> u64;

    fn device_descriptor(&self) -> DeviceDescriptor;
    fn configurations(&self) -> Vec<ConfigDescriptor>;
    fn interfaces(&self, config: u8) -> Vec<InterfaceDescriptor>;
    fn endpoints(&self, config: u8, interface: u8, alt_setting: u8) -> Vec<EndpointDescriptor>;

    /// Claim `interface` for guest use. Must be idempotent.
    fn attach(&self, interface: u8) -> Result<(), HostError>;
    fn submit_transfer(&self, transfer: Transfer) -> Result<(), HostError>;
    /// Cancel every queued and in-flight transfer on `endpoint`.
    fn cancel_transfer(&self, endpoint: u8);

    fn set_suspended(&self, _interface: u8, _suspended: bool) -> Result<(), HostError> {
        Ok(())
    }

    fn vid(&self) -> u16 {
        self.device_descriptor().id_vendor
    }

    fn pid(&self) -> u16 {
        self.device_descriptor().id_product
    }

    /// Whether the device, or any interface of its first configuration, has class `class`.
    fn has_class(&self, class: u8) -> bool {
        if self.device_descriptor().b_device_class == class {
            return true;
        }
        self.interfaces(0)
            .iter()
            .any(|interface| interface.b_interface_class == class)
    }
}
