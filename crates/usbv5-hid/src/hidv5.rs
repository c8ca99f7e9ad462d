//! `/dev/usb/hid` version 5 command handling.
//!
//! Discrete commands go through [`UsbHidV5::ioctl`], vectored transfer commands through
//! [`UsbHidV5::ioctlv`]. Every handler that touches a registered device holds the registry lock
//! for its whole lookup-and-mutate sequence.

use std::sync::Arc;

use guest_memory::GuestMemory;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, HidV5Config};
use crate::descriptor::EndpointDescriptor;
use crate::error::{HidV5Error, Result};
use crate::host::HostDevice;
use crate::ipc::{CommandReply, Ioctl, IoctlRequest, Ioctlv, IoctlvRequest, ReplyQueue};
use crate::registry::{DeviceRegistry, SharedRegistry};
use crate::transfer::{Transfer, INTR_DIRECTION};

pub const USBV5_VERSION: u32 = 0x50001;
pub const HID_CLASS: u8 = 0x03;

const DEVICE_IOCTL_INPUT_SIZE: u32 = 0x20;
const DEVICE_PARAMS_SIZE: u32 = 0x60;

// Input buffer fields of device ioctls.
const IN_HANDLE: u32 = 0;
const IN_ALT_SETTING: u32 = 8;
const IN_ENDPOINT_SELECTOR: u32 = 8;
const IN_RESUME: u32 = 8;

// Output layout of GET_DEVICE_PARAMETERS.
const PARAMS_HANDLE: u32 = 0;
const PARAMS_SLOT_COUNT: u32 = 4;
const PARAMS_DEVICE: u32 = 36;
const PARAMS_CONFIG: u32 = 56;
const PARAMS_INTERFACE: u32 = 68;
const PARAMS_ENDPOINT_IN: u32 = 80;
const PARAMS_ENDPOINT_OUT: u32 = 88;

/// Whether a device of class `device_class` is surfaced through this interface.
pub fn is_visible(device_class: u8) -> bool {
    device_class == HID_CLASS
}

/// Device-change notification and teardown, owned by the enumeration engine shared with the other
/// USBv5 device classes.
pub trait DeviceChangeHandler: Send + Sync {
    fn get_device_change(&self, mem: &mut dyn GuestMemory, request: &IoctlRequest) -> CommandReply;
    fn shutdown(&self, mem: &mut dyn GuestMemory, request: &IoctlRequest) -> CommandReply;
}

pub struct UsbHidV5 {
    config: HidV5Config,
    registry: Arc<SharedRegistry>,
    replies: Arc<ReplyQueue>,
    device_change: Box<dyn DeviceChangeHandler>,
}

impl UsbHidV5 {
    pub fn new(
        config: HidV5Config,
        device_change: Box<dyn DeviceChangeHandler>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(SharedRegistry::new(config.max_devices)),
            replies: Arc::new(ReplyQueue::new()),
            config,
            device_change,
        })
    }

    pub fn config(&self) -> &HidV5Config {
        &self.config
    }

    /// Registry shared with the enumeration engine.
    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    /// Deferred replies of submitted transfers.
    pub fn replies(&self) -> &Arc<ReplyQueue> {
        &self.replies
    }

    /// Enumeration-engine hook: should `device` get a registered slot?
    pub fn should_add_device(&self, device: &dyn HostDevice) -> bool {
        device.has_class(HID_CLASS)
    }

    pub fn ioctl(&self, mem: &mut dyn GuestMemory, request: &IoctlRequest) -> CommandReply {
        let command = Ioctl::from(request.request);
        debug!(?command, ?request, "USBv5 HID ioctl");
        match command {
            Ioctl::GetVersion => {
                mem.write_u32(request.buffer_out, USBV5_VERSION);
                CommandReply::SUCCESS
            }
            Ioctl::GetDeviceChange => self.device_change.get_device_change(mem, request),
            Ioctl::Shutdown => self.device_change.shutdown(mem, request),
            Ioctl::GetDeviceParams => self.handle_device_ioctl(mem, request, get_device_params),
            Ioctl::AttachFinish => CommandReply::SUCCESS,
            Ioctl::SuspendResume => self.handle_device_ioctl(mem, request, suspend_resume),
            Ioctl::CancelEndpoint => self.handle_device_ioctl(mem, request, cancel_endpoint),
            Ioctl::SetAlternateSetting | Ioctl::Unknown(_) => {
                if self.config.log_unknown_requests {
                    warn!(
                        request = request.request,
                        ?request,
                        "unhandled USBv5 HID ioctl"
                    );
                } else {
                    debug!(request = request.request, "unhandled USBv5 HID ioctl");
                }
                CommandReply::Unhandled {
                    request: request.request,
                }
            }
        }
    }

    pub fn ioctlv(&self, mem: &mut dyn GuestMemory, request: &IoctlvRequest) -> CommandReply {
        let command = Ioctlv::from(request.request);
        debug!(
            ?command,
            id = request.id,
            vectors = request.vector_count(),
            "USBv5 HID ioctlv"
        );
        let result = match command {
            Ioctlv::CtrlMsg | Ioctlv::IntrMsg => self.submit_transfer(mem, command, request),
            Ioctlv::IsoMsg | Ioctlv::BulkMsg | Ioctlv::Unknown(_) => {
                Err(HidV5Error::InvalidArgument("unsupported ioctlv"))
            }
        };
        match result {
            Ok(()) => CommandReply::Pending,
            Err(err) => {
                warn!(
                    id = request.id,
                    request = request.request,
                    %err,
                    "USBv5 HID ioctlv failed"
                );
                CommandReply::Reply(err.ipc_code())
            }
        }
    }

    /// Resolve the device named by the input buffer and run `handler` under the registry lock.
    fn handle_device_ioctl<F>(
        &self,
        mem: &mut dyn GuestMemory,
        request: &IoctlRequest,
        handler: F,
    ) -> CommandReply
    where
        F: FnOnce(&mut DeviceRegistry, usize, &mut dyn GuestMemory, &IoctlRequest) -> Result<()>,
    {
        if request.buffer_in == 0 || request.buffer_in_size != DEVICE_IOCTL_INPUT_SIZE {
            warn!(?request, "malformed USBv5 device ioctl");
            return CommandReply::Reply(
                HidV5Error::InvalidArgument("device ioctl input").ipc_code(),
            );
        }

        let mut registry = self.registry.lock();
        let handle = mem.read_u32(request.buffer_in + IN_HANDLE);
        let result = match registry.resolve(handle) {
            Some(index) => handler(&mut *registry, index, mem, request),
            None => Err(HidV5Error::InvalidHandle { handle }),
        };
        match result {
            Ok(()) => CommandReply::SUCCESS,
            Err(err) => {
                warn!(
                    handle,
                    request = request.request,
                    %err,
                    "USBv5 HID ioctl failed"
                );
                CommandReply::Reply(err.ipc_code())
            }
        }
    }

    fn submit_transfer(
        &self,
        mem: &mut dyn GuestMemory,
        command: Ioctlv,
        request: &IoctlvRequest,
    ) -> Result<()> {
        // The guest driver does not check this, but every later step indexes two vectors.
        if request.vector_count() != 2 {
            return Err(HidV5Error::InvalidArgument("expected two vectors"));
        }
        let header = request
            .in_vectors
            .first()
            .ok_or(HidV5Error::InvalidArgument("missing request vector"))?;

        let registry = self.registry.lock();
        let handle = mem.read_u32(header.address);
        let index = registry
            .resolve(handle)
            .ok_or(HidV5Error::InvalidHandle { handle })?;
        let device = *registry
            .device(index)
            .ok_or(HidV5Error::InvalidHandle { handle })?;
        let host = registry
            .host(device.host_id)
            .ok_or(HidV5Error::NoHostDevice {
                host_id: device.host_id,
            })?;
        host.attach(device.interface_number)
            .map_err(HidV5Error::Submission)?;

        let transfer = match command {
            Ioctlv::IntrMsg => {
                let endpoints = registry.endpoints(index).copied().unwrap_or_default();
                let to_out = mem.read_u32(header.address + INTR_DIRECTION) != 0;
                let endpoint = if to_out {
                    endpoints.interrupt_out_endpoint
                } else {
                    endpoints.interrupt_in_endpoint
                };
                let Some(endpoint) = endpoint else {
                    warn!(
                        handle,
                        to_out, "interrupt transfer before GET_DEVICE_PARAMETERS resolved endpoint"
                    );
                    return Err(HidV5Error::InvalidArgument("unresolved interrupt endpoint"));
                };
                Transfer::interrupt(mem, request, endpoint, Arc::clone(&self.replies))?
            }
            _ => Transfer::control(mem, request, Arc::clone(&self.replies))?,
        };

        debug!(
            id = request.id,
            host_id = device.host_id,
            endpoint = transfer.endpoint(),
            length = transfer.length(),
            "submitting transfer"
        );
        host.submit_transfer(transfer)
            .map_err(HidV5Error::Submission)
    }
}

fn get_device_params(
    registry: &mut DeviceRegistry,
    index: usize,
    mem: &mut dyn GuestMemory,
    request: &IoctlRequest,
) -> Result<()> {
    if request.buffer_out == 0 || request.buffer_out_size != DEVICE_PARAMS_SIZE {
        return Err(HidV5Error::InvalidArgument("device params output"));
    }
    let device = *registry
        .device(index)
        .ok_or(HidV5Error::InvalidArgument("empty slot"))?;
    let host = registry
        .host(device.host_id)
        .ok_or(HidV5Error::NoHostDevice {
            host_id: device.host_id,
        })?;
    let alt_setting = mem.read_u8(request.buffer_in + IN_ALT_SETTING);
    let out = request.buffer_out;

    mem.fill(out, DEVICE_PARAMS_SIZE as usize, 0);

    // Gather everything first so a failed lookup leaves the zeroed buffer untouched.
    let device_descriptor = host.device_descriptor();
    // Only the first configuration is considered.
    let config = host
        .configurations()
        .first()
        .copied()
        .ok_or(HidV5Error::InvalidArgument("device has no configuration"))?;
    let interface = host
        .interfaces(0)
        .into_iter()
        .find(|interface| {
            interface.b_interface_number == device.interface_number
                && interface.b_alternate_setting == alt_setting
        })
        .ok_or(HidV5Error::InvalidArgument("no matching interface"))?;
    let endpoints: Vec<EndpointDescriptor> = host
        .endpoints(
            0,
            interface.b_interface_number,
            interface.b_alternate_setting,
        )
        .into_iter()
        .filter(EndpointDescriptor::is_interrupt)
        .collect();

    let handle = mem.read_u32(request.buffer_in + IN_HANDLE);
    mem.write_u32(out + PARAMS_HANDLE, handle);
    mem.write_u32(out + PARAMS_SLOT_COUNT, 1);
    mem.write_bytes(out + PARAMS_DEVICE, &device_descriptor.to_be_bytes());
    mem.write_bytes(out + PARAMS_CONFIG, &config.to_be_bytes());
    mem.write_bytes(out + PARAMS_INTERFACE, &interface.to_be_bytes());

    let side = registry
        .endpoints_mut(index)
        .ok_or(HidV5Error::InvalidArgument("empty slot"))?;
    for endpoint in endpoints {
        let offset = if endpoint.is_in() {
            side.interrupt_in_endpoint = Some(endpoint.b_endpoint_address);
            PARAMS_ENDPOINT_IN
        } else {
            side.interrupt_out_endpoint = Some(endpoint.b_endpoint_address);
            PARAMS_ENDPOINT_OUT
        };
        mem.write_bytes(out + offset, &endpoint.to_be_bytes());
    }

    debug!(
        index,
        host_id = device.host_id,
        interface = device.interface_number,
        alt_setting,
        endpoints = ?side,
        "device parameters"
    );
    Ok(())
}

fn suspend_resume(
    registry: &mut DeviceRegistry,
    index: usize,
    mem: &mut dyn GuestMemory,
    request: &IoctlRequest,
) -> Result<()> {
    let device = *registry
        .device(index)
        .ok_or(HidV5Error::InvalidArgument("empty slot"))?;
    let resume = mem.read_u32(request.buffer_in + IN_RESUME) != 0;
    let Some(host) = registry.host(device.host_id) else {
        return Err(HidV5Error::NoHostDevice {
            host_id: device.host_id,
        });
    };
    info!(
        vid = host.vid(),
        pid = host.pid(),
        interface = device.interface_number,
        "received {} command",
        if resume { "resume" } else { "suspend" }
    );
    // The guest driver has no failure path for power management.
    if let Err(err) = host.set_suspended(device.interface_number, !resume) {
        warn!(
            host_id = device.host_id,
            %err,
            "suspend/resume failed on host"
        );
    }
    Ok(())
}

/// Cancel in-flight transfers on the endpoint picked by the selector at input offset 8.
///
/// Selector 0 is the control endpoint, 1 the interrupt IN endpoint and 2 the interrupt OUT
/// endpoint; other values are passed through as raw endpoint addresses. Always succeeds.
fn cancel_endpoint(
    registry: &mut DeviceRegistry,
    index: usize,
    mem: &mut dyn GuestMemory,
    request: &IoctlRequest,
) -> Result<()> {
    let device = *registry
        .device(index)
        .ok_or(HidV5Error::InvalidArgument("empty slot"))?;
    let selector = mem.read_u32(request.buffer_in + IN_ENDPOINT_SELECTOR) as u8;
    let side = registry.endpoints(index).copied().unwrap_or_default();
    let endpoint = match selector {
        0 => Some(0),
        1 => side.interrupt_in_endpoint,
        2 => side.interrupt_out_endpoint,
        raw => Some(raw),
    };

    match (endpoint, registry.host(device.host_id)) {
        (Some(endpoint), Some(host)) => {
            debug!(
                host_id = device.host_id,
                selector,
                endpoint,
                "cancel endpoint"
            );
            host.cancel_transfer(endpoint);
        }
        (None, _) => debug!(selector, "cancel on unresolved endpoint ignored"),
        (_, None) => debug!(host_id = device.host_id, "cancel on vanished host ignored"),
    }
    Ok(())
}
