#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use usbv5_hid::{
    CommandReply, ConfigDescriptor, DescriptorTree, DeviceChangeHandler, DeviceDescriptor,
    DeviceHandle, EndpointDescriptor, FlatMemory, GuestMemory, HidV5Config, HostDevice, HostError,
    InterfaceDescriptor, IoVector, IoctlRequest, IoctlvRequest, Transfer, UsbHidV5,
};

pub const IN_BUF: u32 = 0x1000;
pub const OUT_BUF: u32 = 0x2000;
pub const VEC_HEADER: u32 = 0x3000;
pub const VEC_DATA: u32 = 0x4000;

pub const IOCTL_GETVERSION: u32 = 0;
pub const IOCTL_GETDEVICECHANGE: u32 = 1;
pub const IOCTL_SHUTDOWN: u32 = 2;
pub const IOCTL_GETDEVPARAMS: u32 = 3;
pub const IOCTL_ATTACHFINISH: u32 = 6;
pub const IOCTL_SUSPEND_RESUME: u32 = 16;
pub const IOCTL_CANCELENDPOINT: u32 = 17;
pub const IOCTLV_CTRLMSG: u32 = 18;
pub const IOCTLV_INTRMSG: u32 = 19;

pub const DEVICE: [u8; 18] = [
    18, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 64, 0x7e, 0x05, 0x06, 0x03, 0x00, 0x01, 1, 2, 0, 1,
];

/// Interface 0 has two alternate settings: alt 0 with interrupt IN 0x81 and OUT 0x02, alt 1 with
/// interrupt IN 0x83 and a bulk OUT endpoint. Interface 1 is a vendor interface with no endpoints.
pub const CONFIG: [u8; 73] = [
    9, 0x02, 73, 0, 2, 1, 0, 0x80, 50, //
    9, 0x04, 0, 0, 2, 0x03, 0, 0, 0, //
    9, 0x21, 0x11, 0x01, 0, 1, 0x22, 0x34, 0, //
    7, 0x05, 0x81, 0x03, 0x40, 0x00, 4, //
    7, 0x05, 0x02, 0x03, 0x40, 0x00, 4, //
    9, 0x04, 0, 1, 2, 0x03, 0, 0, 0, //
    7, 0x05, 0x83, 0x03, 0x08, 0x00, 1, //
    7, 0x05, 0x04, 0x02, 0x00, 0x02, 0, //
    9, 0x04, 1, 0, 0, 0xff, 0, 0, 0,
];

pub fn descriptors() -> DescriptorTree {
    DescriptorTree::parse(&DEVICE, &[&CONFIG]).expect("valid test descriptors")
}

/// Host device that records what the core asks of it.
pub struct FakeHost {
    id: u64,
    tree: DescriptorTree,
    pub submitted: Mutex<Vec<Transfer>>,
    pub canceled: Mutex<Vec<u8>>,
    pub attached: Mutex<Vec<u8>>,
    pub suspended: Mutex<Vec<(u8, bool)>>,
    pub submit_error: Mutex<Option<HostError>>,
}

impl FakeHost {
    pub fn new(id: u64) -> Arc<Self> {
        Self::with_tree(id, descriptors())
    }

    pub fn with_tree(id: u64, tree: DescriptorTree) -> Arc<Self> {
        Arc::new(Self {
            id,
            tree,
            submitted: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            suspended: Mutex::new(Vec::new()),
            submit_error: Mutex::new(None),
        })
    }

    pub fn take_submitted(&self) -> Vec<Transfer> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }
}

impl HostDevice for FakeHost {
    fn id(&self) -> u64 {
        self.id
    }

    fn device_descriptor(&self) -> DeviceDescriptor {
        self.tree.device
    }

    fn configurations(&self) -> Vec<ConfigDescriptor> {
        self.tree.configs.iter().map(|c| c.descriptor).collect()
    }

    fn interfaces(&self, config: u8) -> Vec<InterfaceDescriptor> {
        self.tree
            .config(config)
            .map(|c| c.interfaces.values().map(|i| i.descriptor).collect())
            .unwrap_or_default()
    }

    fn endpoints(&self, config: u8, interface: u8, alt_setting: u8) -> Vec<EndpointDescriptor> {
        self.tree
            .config(config)
            .and_then(|c| c.interfaces.get(&(interface, alt_setting)))
            .map(|i| i.endpoints.clone())
            .unwrap_or_default()
    }

    fn attach(&self, interface: u8) -> Result<(), HostError> {
        self.attached.lock().unwrap().push(interface);
        Ok(())
    }

    fn submit_transfer(&self, transfer: Transfer) -> Result<(), HostError> {
        if let Some(err) = self.submit_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.submitted.lock().unwrap().push(transfer);
        Ok(())
    }

    fn cancel_transfer(&self, endpoint: u8) {
        self.canceled.lock().unwrap().push(endpoint);
    }

    fn set_suspended(&self, interface: u8, suspended: bool) -> Result<(), HostError> {
        self.suspended.lock().unwrap().push((interface, suspended));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingDeviceChange {
    pub calls: Arc<Mutex<Vec<&'static str>>>,
}

impl DeviceChangeHandler for RecordingDeviceChange {
    fn get_device_change(
        &self,
        _mem: &mut dyn GuestMemory,
        _request: &IoctlRequest,
    ) -> CommandReply {
        self.calls.lock().unwrap().push("device_change");
        CommandReply::Pending
    }

    fn shutdown(&self, _mem: &mut dyn GuestMemory, _request: &IoctlRequest) -> CommandReply {
        self.calls.lock().unwrap().push("shutdown");
        CommandReply::SUCCESS
    }
}

pub fn new_hid() -> (UsbHidV5, RecordingDeviceChange) {
    let hooks = RecordingDeviceChange::default();
    let hid = UsbHidV5::new(HidV5Config::default(), Box::new(hooks.clone()))
        .expect("default config is valid");
    (hid, hooks)
}

pub fn attach(hid: &UsbHidV5, host: &Arc<FakeHost>, interface: u8) -> DeviceHandle {
    let host: Arc<dyn HostDevice> = Arc::clone(host) as Arc<dyn HostDevice>;
    hid.registry()
        .lock()
        .attach(host, interface)
        .expect("registry has room")
}

pub fn device_ioctl(request: u32) -> IoctlRequest {
    IoctlRequest {
        request,
        buffer_in: IN_BUF,
        buffer_in_size: 0x20,
        buffer_out: OUT_BUF,
        buffer_out_size: 0x60,
    }
}

/// Issue GET_DEVICE_PARAMETERS for `handle` and alternate setting `alt`.
pub fn query_params(
    hid: &UsbHidV5,
    mem: &mut FlatMemory,
    handle: DeviceHandle,
    alt: u8,
) -> CommandReply {
    mem.write_u32(IN_BUF, handle.0);
    mem.write_u8(IN_BUF + 8, alt);
    hid.ioctl(mem, &device_ioctl(IOCTL_GETDEVPARAMS))
}

pub fn intr_request(id: u32) -> IoctlvRequest {
    IoctlvRequest {
        id,
        request: IOCTLV_INTRMSG,
        in_vectors: vec![IoVector {
            address: VEC_HEADER,
            size: 0x20,
        }],
        io_vectors: vec![IoVector {
            address: VEC_DATA,
            size: 0x40,
        }],
    }
}

pub fn ctrl_request(id: u32) -> IoctlvRequest {
    IoctlvRequest {
        request: IOCTLV_CTRLMSG,
        ..intr_request(id)
    }
}

/// Guest memory wrapper that counts writes.
pub struct RecordingMemory {
    pub inner: FlatMemory,
    pub writes: usize,
}

impl RecordingMemory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: FlatMemory::new(size),
            writes: 0,
        }
    }
}

impl GuestMemory for RecordingMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        self.inner.read_physical(paddr, buf);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        self.writes += 1;
        self.inner.write_physical(paddr, buf);
    }
}
