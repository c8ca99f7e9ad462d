//! Transfer objects handed to a [`HostDevice`](crate::host::HostDevice).
//!
//! A transfer is built from a vectored guest request while the caller still has guest memory at
//! hand, so OUT payloads are captured up front. The host later finishes it exactly once through
//! [`Transfer::complete`] or [`Transfer::cancel`], which queue the guest's deferred reply.

use std::sync::Arc;

use guest_memory::GuestMemory;
use serde::{Deserialize, Serialize};

use crate::error::{HidV5Error, Result};
use crate::ipc::{
    GuestReply, IoctlvRequest, ReplyQueue, RequestId, USBV5_ECANCELED, USBV5_ESTALL,
    USBV5_ETRANSFER,
};

// Field offsets inside the first input vector.
const CTRL_REQUEST_TYPE: u32 = 8;
const CTRL_REQUEST: u32 = 9;
const CTRL_VALUE: u32 = 10;
const CTRL_INDEX: u32 = 12;
const CTRL_LENGTH: u32 = 14;
/// Non-zero selects the interrupt OUT endpoint.
pub(crate) const INTR_DIRECTION: u32 = 8;
const INTR_LENGTH: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        (self.bm_request_type & 0x80) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control(SetupPacket),
    Interrupt,
}

/// How the host finished a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// IN transfer succeeded with this data.
    Data(Vec<u8>),
    /// OUT transfer succeeded.
    Written(usize),
    Stall,
    Error(String),
    Cancelled,
}

#[derive(Debug)]
pub struct Transfer {
    id: RequestId,
    kind: TransferKind,
    endpoint: u8,
    length: usize,
    data_address: u32,
    payload: Vec<u8>,
    replies: Arc<ReplyQueue>,
}

impl Transfer {
    /// Build a control transfer on endpoint 0 from a `CTRLMSG` request.
    pub fn control(
        mem: &mut dyn GuestMemory,
        request: &IoctlvRequest,
        replies: Arc<ReplyQueue>,
    ) -> Result<Self> {
        let (header, data) = header_and_data(request)?;
        let setup = SetupPacket {
            bm_request_type: mem.read_u8(header + CTRL_REQUEST_TYPE),
            b_request: mem.read_u8(header + CTRL_REQUEST),
            w_value: mem.read_u16(header + CTRL_VALUE),
            w_index: mem.read_u16(header + CTRL_INDEX),
            w_length: mem.read_u16(header + CTRL_LENGTH),
        };
        let length = usize::from(setup.w_length).min(data.size as usize);
        let payload = if setup.is_device_to_host() {
            Vec::new()
        } else {
            mem.read_bytes(data.address, length)
        };
        Ok(Self {
            id: request.id,
            kind: TransferKind::Control(setup),
            endpoint: 0,
            length,
            data_address: data.address,
            payload,
            replies,
        })
    }

    /// Build an interrupt transfer from an `INTRMSG` request, routed to `endpoint`.
    pub fn interrupt(
        mem: &mut dyn GuestMemory,
        request: &IoctlvRequest,
        endpoint: u8,
        replies: Arc<ReplyQueue>,
    ) -> Result<Self> {
        let (header, data) = header_and_data(request)?;
        let length = usize::from(mem.read_u16(header + INTR_LENGTH)).min(data.size as usize);
        let payload = if endpoint & 0x80 != 0 {
            Vec::new()
        } else {
            mem.read_bytes(data.address, length)
        };
        Ok(Self {
            id: request.id,
            kind: TransferKind::Interrupt,
            endpoint,
            length,
            data_address: data.address,
            payload,
            replies,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Requested length, clamped to the guest data buffer.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_in(&self) -> bool {
        match self.kind {
            TransferKind::Control(setup) => setup.is_device_to_host(),
            TransferKind::Interrupt => self.endpoint & 0x80 != 0,
        }
    }

    /// Data to send for OUT transfers; empty for IN transfers.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Finish the transfer, copying IN data to the guest and queueing the reply.
    pub fn complete(self, mem: &mut dyn GuestMemory, status: TransferStatus) -> GuestReply {
        let result = match status {
            TransferStatus::Data(mut data) => {
                data.truncate(self.length);
                mem.write_bytes(self.data_address, &data);
                data.len() as i32
            }
            TransferStatus::Written(n) => n.min(self.length) as i32,
            TransferStatus::Stall => USBV5_ESTALL,
            TransferStatus::Error(message) => {
                tracing::warn!(
                    id = self.id,
                    endpoint = self.endpoint,
                    %message,
                    "transfer failed"
                );
                USBV5_ETRANSFER
            }
            TransferStatus::Cancelled => USBV5_ECANCELED,
        };
        self.reply(result)
    }

    /// Finish the transfer as canceled. Does not touch guest memory.
    pub fn cancel(self) -> GuestReply {
        self.reply(USBV5_ECANCELED)
    }

    fn reply(self, result: i32) -> GuestReply {
        let reply = GuestReply {
            id: self.id,
            result,
        };
        self.replies.push(reply);
        reply
    }
}

fn header_and_data(request: &IoctlvRequest) -> Result<(u32, crate::ipc::IoVector)> {
    let header = request
        .in_vectors
        .first()
        .ok_or(HidV5Error::InvalidArgument("missing request vector"))?;
    let data = request
        .vector(1)
        .ok_or(HidV5Error::InvalidArgument("missing data vector"))?;
    Ok((header.address, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IoVector;
    use guest_memory::FlatMemory;

    fn request(id: RequestId, data_size: u32) -> IoctlvRequest {
        IoctlvRequest {
            id,
            request: 19,
            in_vectors: vec![IoVector {
                address: 0x100,
                size: 0x20,
            }],
            io_vectors: vec![IoVector {
                address: 0x200,
                size: data_size,
            }],
        }
    }

    #[test]
    fn control_setup_is_read_big_endian() {
        let mut mem = FlatMemory::new(0x400);
        mem.write_u8(0x108, 0x21);
        mem.write_u8(0x109, 0x09);
        mem.write_u16(0x10a, 0x0201);
        mem.write_u16(0x10c, 0x0000);
        mem.write_u16(0x10e, 3);
        mem.write_bytes(0x200, &[7, 8, 9, 10]);

        let replies = Arc::new(ReplyQueue::new());
        let xfer = Transfer::control(&mut mem, &request(5, 0x40), replies).unwrap();
        let TransferKind::Control(setup) = xfer.kind() else {
            panic!("expected control transfer");
        };
        assert_eq!(setup.w_value, 0x0201);
        assert_eq!(xfer.endpoint(), 0);
        assert!(!xfer.is_in());
        assert_eq!(xfer.payload(), &[7, 8, 9]);
    }

    #[test]
    fn interrupt_in_completion_is_truncated_and_queued() {
        let mut mem = FlatMemory::new(0x400);
        mem.write_u16(0x10c, 4);
        let replies = Arc::new(ReplyQueue::new());
        let xfer = Transfer::interrupt(&mut mem, &request(9, 0x40), 0x81, Arc::clone(&replies))
            .unwrap();
        assert!(xfer.is_in());
        assert!(xfer.payload().is_empty());

        let reply = xfer.complete(&mut mem, TransferStatus::Data(vec![1, 2, 3, 4, 5, 6]));
        assert_eq!(reply, GuestReply { id: 9, result: 4 });
        assert_eq!(mem.read_bytes(0x200, 6), vec![1, 2, 3, 4, 0, 0]);
        assert_eq!(replies.drain(), vec![reply]);
    }

    #[test]
    fn length_is_clamped_to_data_vector() {
        let mut mem = FlatMemory::new(0x400);
        mem.write_u16(0x10c, 0x100);
        let xfer = Transfer::interrupt(
            &mut mem,
            &request(1, 8),
            0x02,
            Arc::new(ReplyQueue::new()),
        )
        .unwrap();
        assert_eq!(xfer.length(), 8);
        assert_eq!(xfer.payload().len(), 8);
    }

    #[test]
    fn error_statuses_map_to_usb_codes() {
        let mut mem = FlatMemory::new(0x400);
        let replies = Arc::new(ReplyQueue::new());
        for (status, code) in [
            (TransferStatus::Stall, USBV5_ESTALL),
            (TransferStatus::Error("io".into()), USBV5_ETRANSFER),
            (TransferStatus::Cancelled, USBV5_ECANCELED),
        ] {
            let xfer =
                Transfer::interrupt(&mut mem, &request(2, 8), 0x81, Arc::clone(&replies)).unwrap();
            assert_eq!(xfer.complete(&mut mem, status).result, code);
        }
        assert_eq!(replies.len(), 3);
    }

    #[test]
    fn missing_data_vector_is_rejected() {
        let mut mem = FlatMemory::new(0x400);
        let mut req = request(1, 8);
        req.io_vectors.clear();
        assert!(matches!(
            Transfer::control(&mut mem, &req, Arc::new(ReplyQueue::new())),
            Err(HidV5Error::InvalidArgument(_))
        ));
    }
}
