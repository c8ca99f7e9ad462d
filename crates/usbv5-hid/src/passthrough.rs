//! Host device backed by an external USB backend.
//!
//! [`PassthroughDevice`] turns submitted transfers into serializable host actions
//! ([`UsbHostAction`]) that a backend (libusb thread, WebUSB bridge, ...) drains and executes. The
//! backend pushes a [`UsbHostCompletion`] for every action it finished; the matching guest
//! transfer is then completed and its deferred reply queued.
//!
//! Completions for unknown ids (already completed, canceled, or never issued) are ignored.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use guest_memory::GuestMemory;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::{
    ConfigDescriptor, DescriptorTree, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
};
use crate::error::HostError;
use crate::host::HostDevice;
use crate::ipc::GuestReply;
use crate::transfer::{SetupPacket, Transfer, TransferKind, TransferStatus};

/// One unit of work queued for the USB backend, serialized as a `kind`-tagged camelCase object.
///
/// The JSON shape is kept identical to the host-action contract of aero's `aero-usb` passthrough
/// so an existing aero WebUSB or libusb backend can drive these devices unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UsbHostAction {
    /// Read `setup.w_length` bytes over endpoint 0.
    ControlIn {
        id: u32,
        setup: SetupPacket,
    },
    /// Send `data` over endpoint 0 after the setup stage.
    ControlOut {
        id: u32,
        setup: SetupPacket,
        data: Vec<u8>,
    },
    /// Read up to `length` bytes from interrupt endpoint `endpoint` (bit 7 set).
    InterruptIn {
        id: u32,
        endpoint: u8,
        length: u32,
    },
    /// Write `data` to interrupt endpoint `endpoint`.
    InterruptOut {
        id: u32,
        endpoint: u8,
        data: Vec<u8>,
    },
}

impl UsbHostAction {
    pub fn id(&self) -> u32 {
        match self {
            UsbHostAction::ControlIn { id, .. }
            | UsbHostAction::ControlOut { id, .. }
            | UsbHostAction::InterruptIn { id, .. }
            | UsbHostAction::InterruptOut { id, .. } => *id,
        }
    }
}

/// Outcome of an IN action. `data` may be longer than requested; the guest copy is clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UsbHostCompletionIn {
    Success { data: Vec<u8> },
    Stall,
    Error { message: String },
}

/// Outcome of an OUT action, reported as the byte count the device accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UsbHostCompletionOut {
    Success {
        #[serde(rename = "bytesWritten")]
        bytes_written: u32,
    },
    Stall,
    Error {
        message: String,
    },
}

/// What the backend reports back for an action, matched to it by `id` and `kind`.
///
/// The status fields are flattened next to `kind` and `id`, in the same layout aero's backends
/// already emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UsbHostCompletion {
    ControlIn {
        id: u32,
        #[serde(flatten)]
        result: UsbHostCompletionIn,
    },
    ControlOut {
        id: u32,
        #[serde(flatten)]
        result: UsbHostCompletionOut,
    },
    InterruptIn {
        id: u32,
        #[serde(flatten)]
        result: UsbHostCompletionIn,
    },
    InterruptOut {
        id: u32,
        #[serde(flatten)]
        result: UsbHostCompletionOut,
    },
}

impl UsbHostCompletion {
    fn into_parts(self) -> (u32, bool, TransferStatus) {
        match self {
            UsbHostCompletion::ControlIn { id, result }
            | UsbHostCompletion::InterruptIn { id, result } => {
                let status = match result {
                    UsbHostCompletionIn::Success { data } => TransferStatus::Data(data),
                    UsbHostCompletionIn::Stall => TransferStatus::Stall,
                    UsbHostCompletionIn::Error { message } => TransferStatus::Error(message),
                };
                (id, true, status)
            }
            UsbHostCompletion::ControlOut { id, result }
            | UsbHostCompletion::InterruptOut { id, result } => {
                let status = match result {
                    UsbHostCompletionOut::Success { bytes_written } => {
                        TransferStatus::Written(bytes_written as usize)
                    }
                    UsbHostCompletionOut::Stall => TransferStatus::Stall,
                    UsbHostCompletionOut::Error { message } => TransferStatus::Error(message),
                };
                (id, false, status)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSummary {
    pub queued_actions: usize,
    pub inflight_transfers: usize,
}

#[derive(Debug)]
struct PassthroughState {
    // `id` is part of the backend wire contract; keep it representable as a JS number.
    next_id: u32,
    actions: VecDeque<UsbHostAction>,
    inflight: HashMap<u32, Transfer>,
    claimed: BTreeSet<u8>,
    suspended: BTreeSet<u8>,
    disconnected: bool,
}

impl PassthroughState {
    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }
}

#[derive(Debug)]
pub struct PassthroughDevice {
    id: u64,
    descriptors: DescriptorTree,
    state: Mutex<PassthroughState>,
}

impl PassthroughDevice {
    pub fn new(id: u64, descriptors: DescriptorTree) -> Self {
        Self {
            id,
            descriptors,
            state: Mutex::new(PassthroughState {
                next_id: 1,
                actions: VecDeque::new(),
                inflight: HashMap::new(),
                claimed: BTreeSet::new(),
                suspended: BTreeSet::new(),
                disconnected: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PassthroughState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn descriptors(&self) -> &DescriptorTree {
        &self.descriptors
    }

    pub fn pop_action(&self) -> Option<UsbHostAction> {
        self.lock().actions.pop_front()
    }

    pub fn drain_actions(&self) -> Vec<UsbHostAction> {
        self.lock().actions.drain(..).collect()
    }

    /// Finish the transfer `completion` refers to. Returns the queued guest reply, or `None` for a
    /// stale completion.
    pub fn push_completion(
        &self,
        mem: &mut dyn GuestMemory,
        completion: UsbHostCompletion,
    ) -> Option<GuestReply> {
        let (id, completion_in, status) = completion.into_parts();
        let Some(transfer) = self.lock().inflight.remove(&id) else {
            debug!(id, "ignoring stale passthrough completion");
            return None;
        };
        let status = if transfer.is_in() == completion_in {
            status
        } else {
            warn!(
                id,
                "passthrough completion direction does not match transfer"
            );
            TransferStatus::Error("completion direction mismatch".to_string())
        };
        Some(transfer.complete(mem, status))
    }

    pub fn pending_summary(&self) -> PendingSummary {
        let state = self.lock();
        PendingSummary {
            queued_actions: state.actions.len(),
            inflight_transfers: state.inflight.len(),
        }
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.lock().claimed.iter().copied().collect()
    }

    pub fn is_suspended(&self, interface: u8) -> bool {
        self.lock().suspended.contains(&interface)
    }

    /// The physical device went away: cancel everything and refuse further transfers.
    pub fn disconnect(&self) -> Vec<GuestReply> {
        let transfers: Vec<Transfer> = {
            let mut state = self.lock();
            state.disconnected = true;
            state.actions.clear();
            state
                .inflight
                .drain()
                .map(|(_, transfer)| transfer)
                .collect()
        };
        transfers.into_iter().map(Transfer::cancel).collect()
    }
}

impl HostDevice for PassthroughDevice {
    fn id(&self) -> u64 {
        self.id
    }

    fn device_descriptor(&self) -> DeviceDescriptor {
        self.descriptors.device
    }

    fn configurations(&self) -> Vec<ConfigDescriptor> {
        self.descriptors
            .configs
            .iter()
            .map(|config| config.descriptor)
            .collect()
    }

    fn interfaces(&self, config: u8) -> Vec<InterfaceDescriptor> {
        self.descriptors
            .config(config)
            .map(|config| {
                config
                    .interfaces
                    .values()
                    .map(|interface| interface.descriptor)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn endpoints(&self, config: u8, interface: u8, alt_setting: u8) -> Vec<EndpointDescriptor> {
        self.descriptors
            .config(config)
            .and_then(|config| config.interfaces.get(&(interface, alt_setting)))
            .map(|interface| interface.endpoints.clone())
            .unwrap_or_default()
    }

    fn attach(&self, interface: u8) -> Result<(), HostError> {
        let exists = self
            .interfaces(0)
            .iter()
            .any(|desc| desc.b_interface_number == interface);
        let mut state = self.lock();
        if state.disconnected {
            return Err(HostError::Disconnected);
        }
        if !exists {
            return Err(HostError::Rejected(format!("no interface {interface}")));
        }
        if state.claimed.insert(interface) {
            debug!(host_id = self.id, interface, "claimed interface");
        }
        Ok(())
    }

    fn submit_transfer(&self, transfer: Transfer) -> Result<(), HostError> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(HostError::Disconnected);
        }
        let id = state.alloc_id();
        let action = match transfer.kind() {
            TransferKind::Control(setup) if setup.is_device_to_host() => {
                UsbHostAction::ControlIn { id, setup }
            }
            TransferKind::Control(setup) => UsbHostAction::ControlOut {
                id,
                setup,
                data: transfer.payload().to_vec(),
            },
            TransferKind::Interrupt if transfer.is_in() => UsbHostAction::InterruptIn {
                id,
                endpoint: transfer.endpoint(),
                length: transfer.length() as u32,
            },
            TransferKind::Interrupt => UsbHostAction::InterruptOut {
                id,
                endpoint: transfer.endpoint(),
                data: transfer.payload().to_vec(),
            },
        };
        state.actions.push_back(action);
        state.inflight.insert(id, transfer);
        Ok(())
    }

    fn cancel_transfer(&self, endpoint: u8) {
        let canceled: Vec<Transfer> = {
            let mut state = self.lock();
            let ids: Vec<u32> = state
                .inflight
                .iter()
                .filter(|(_, transfer)| transfer.endpoint() == endpoint)
                .map(|(id, _)| *id)
                .collect();
            // Drop actions the backend has not picked up yet.
            state.actions.retain(|action| !ids.contains(&action.id()));
            ids.iter()
                .filter_map(|id| state.inflight.remove(id))
                .collect()
        };
        debug!(
            host_id = self.id,
            endpoint,
            count = canceled.len(),
            "canceled transfers"
        );
        for transfer in canceled {
            transfer.cancel();
        }
    }

    fn set_suspended(&self, interface: u8, suspended: bool) -> Result<(), HostError> {
        let mut state = self.lock();
        if suspended {
            state.suspended.insert(interface);
        } else {
            state.suspended.remove(&interface);
        }
        Ok(())
    }
}
