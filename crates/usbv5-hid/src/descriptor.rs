//! USB descriptor records and their two byte orders.
//!
//! Descriptors arrive from the host in the USB wire layout (packed, little-endian multi-byte
//! fields). The guest expects the same packed layout with multi-byte fields in big-endian order.
//! Each record therefore has a little-endian and a big-endian codec, plus an in-place
//! [`swap_bytes`](DeviceDescriptor::swap_bytes) that flips every multi-byte field.

use std::collections::BTreeMap;

use thiserror::Error;

pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;

/// `bmAttributes` transfer-type bits.
pub const ENDPOINT_TRANSFER_TYPE_MASK: u8 = 0b11;
pub const ENDPOINT_INTERRUPT: u8 = 0b11;
/// `bEndpointAddress` direction bit.
pub const ENDPOINT_IN: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("descriptor at offset {offset} has invalid bLength {length}")]
    InvalidLength { offset: usize, length: u8 },
    #[error("expected descriptor type {expected:#04x}, found {found:#04x}")]
    UnexpectedType { expected: u8, found: u8 },
    #[error("{0} descriptor found outside of an interface")]
    Orphan(&'static str),
}

fn require(bytes: &[u8], needed: usize) -> Result<(), DescriptorError> {
    if bytes.len() < needed {
        return Err(DescriptorError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn be16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Standard device descriptor (USB 2.0 §9.6.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    fn decode(bytes: &[u8], u16_at: fn(&[u8], usize) -> u16) -> Result<Self, DescriptorError> {
        require(bytes, Self::SIZE)?;
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            bcd_usb: u16_at(bytes, 2),
            b_device_class: bytes[4],
            b_device_sub_class: bytes[5],
            b_device_protocol: bytes[6],
            b_max_packet_size0: bytes[7],
            id_vendor: u16_at(bytes, 8),
            id_product: u16_at(bytes, 10),
            bcd_device: u16_at(bytes, 12),
            i_manufacturer: bytes[14],
            i_product: bytes[15],
            i_serial_number: bytes[16],
            b_num_configurations: bytes[17],
        })
    }

    fn encode(&self, u16_to: fn(u16) -> [u8; 2]) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.b_length;
        out[1] = self.b_descriptor_type;
        out[2..4].copy_from_slice(&u16_to(self.bcd_usb));
        out[4] = self.b_device_class;
        out[5] = self.b_device_sub_class;
        out[6] = self.b_device_protocol;
        out[7] = self.b_max_packet_size0;
        out[8..10].copy_from_slice(&u16_to(self.id_vendor));
        out[10..12].copy_from_slice(&u16_to(self.id_product));
        out[12..14].copy_from_slice(&u16_to(self.bcd_device));
        out[14] = self.i_manufacturer;
        out[15] = self.i_product;
        out[16] = self.i_serial_number;
        out[17] = self.b_num_configurations;
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::decode(bytes, le16)
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::decode(bytes, be16)
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        self.encode(u16::to_le_bytes)
    }

    pub fn to_be_bytes(&self) -> [u8; Self::SIZE] {
        self.encode(u16::to_be_bytes)
    }

    pub fn swap_bytes(&mut self) {
        self.bcd_usb = self.bcd_usb.swap_bytes();
        self.id_vendor = self.id_vendor.swap_bytes();
        self.id_product = self.id_product.swap_bytes();
        self.bcd_device = self.bcd_device.swap_bytes();
    }
}

/// Configuration descriptor header (USB 2.0 §9.6.3), without the trailing interface tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

impl ConfigDescriptor {
    pub const SIZE: usize = 9;

    fn decode(bytes: &[u8], u16_at: fn(&[u8], usize) -> u16) -> Result<Self, DescriptorError> {
        require(bytes, Self::SIZE)?;
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            w_total_length: u16_at(bytes, 2),
            b_num_interfaces: bytes[4],
            b_configuration_value: bytes[5],
            i_configuration: bytes[6],
            bm_attributes: bytes[7],
            b_max_power: bytes[8],
        })
    }

    fn encode(&self, u16_to: fn(u16) -> [u8; 2]) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.b_length;
        out[1] = self.b_descriptor_type;
        out[2..4].copy_from_slice(&u16_to(self.w_total_length));
        out[4] = self.b_num_interfaces;
        out[5] = self.b_configuration_value;
        out[6] = self.i_configuration;
        out[7] = self.bm_attributes;
        out[8] = self.b_max_power;
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::decode(bytes, le16)
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::decode(bytes, be16)
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        self.encode(u16::to_le_bytes)
    }

    pub fn to_be_bytes(&self) -> [u8; Self::SIZE] {
        self.encode(u16::to_be_bytes)
    }

    pub fn swap_bytes(&mut self) {
        self.w_total_length = self.w_total_length.swap_bytes();
    }
}

/// Interface descriptor (USB 2.0 §9.6.5). Every field is a single byte, so both byte orders share
/// one layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        require(bytes, Self::SIZE)?;
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            b_interface_number: bytes[2],
            b_alternate_setting: bytes[3],
            b_num_endpoints: bytes[4],
            b_interface_class: bytes[5],
            b_interface_sub_class: bytes[6],
            b_interface_protocol: bytes[7],
            i_interface: bytes[8],
        })
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::from_le_bytes(bytes)
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        [
            self.b_length,
            self.b_descriptor_type,
            self.b_interface_number,
            self.b_alternate_setting,
            self.b_num_endpoints,
            self.b_interface_class,
            self.b_interface_sub_class,
            self.b_interface_protocol,
            self.i_interface,
        ]
    }

    pub fn to_be_bytes(&self) -> [u8; Self::SIZE] {
        self.to_le_bytes()
    }

    pub fn swap_bytes(&mut self) {}
}

/// Endpoint descriptor (USB 2.0 §9.6.6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;

    fn decode(bytes: &[u8], u16_at: fn(&[u8], usize) -> u16) -> Result<Self, DescriptorError> {
        require(bytes, Self::SIZE)?;
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            b_endpoint_address: bytes[2],
            bm_attributes: bytes[3],
            w_max_packet_size: u16_at(bytes, 4),
            b_interval: bytes[6],
        })
    }

    fn encode(&self, u16_to: fn(u16) -> [u8; 2]) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.b_length;
        out[1] = self.b_descriptor_type;
        out[2] = self.b_endpoint_address;
        out[3] = self.bm_attributes;
        out[4..6].copy_from_slice(&u16_to(self.w_max_packet_size));
        out[6] = self.b_interval;
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::decode(bytes, le16)
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        Self::decode(bytes, be16)
    }

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        self.encode(u16::to_le_bytes)
    }

    pub fn to_be_bytes(&self) -> [u8; Self::SIZE] {
        self.encode(u16::to_be_bytes)
    }

    pub fn swap_bytes(&mut self) {
        self.w_max_packet_size = self.w_max_packet_size.swap_bytes();
    }

    pub fn is_interrupt(&self) -> bool {
        self.bm_attributes & ENDPOINT_TRANSFER_TYPE_MASK == ENDPOINT_INTERRUPT
    }

    pub fn is_in(&self) -> bool {
        self.b_endpoint_address & ENDPOINT_IN != 0
    }
}

/// Interface alternate setting together with its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTree {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTree {
    pub descriptor: ConfigDescriptor,
    // Keyed by (bInterfaceNumber, bAlternateSetting).
    pub interfaces: BTreeMap<(u8, u8), InterfaceTree>,
}

/// A device descriptor and its configurations, as parsed from raw host bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTree {
    pub device: DeviceDescriptor,
    pub configs: Vec<ConfigTree>,
}

impl DescriptorTree {
    /// Parse a raw device descriptor followed by the full `GET_DESCRIPTOR(CONFIGURATION)` blob of
    /// each configuration, in index order.
    pub fn parse(device: &[u8], configs: &[&[u8]]) -> Result<Self, DescriptorError> {
        let device = DeviceDescriptor::from_le_bytes(device)?;
        if device.b_descriptor_type != DESC_DEVICE {
            return Err(DescriptorError::UnexpectedType {
                expected: DESC_DEVICE,
                found: device.b_descriptor_type,
            });
        }
        let configs = configs
            .iter()
            .map(|raw| parse_config(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { device, configs })
    }

    pub fn config(&self, index: u8) -> Option<&ConfigTree> {
        self.configs.get(usize::from(index))
    }
}

fn parse_config(raw: &[u8]) -> Result<ConfigTree, DescriptorError> {
    let descriptor = ConfigDescriptor::from_le_bytes(raw)?;
    if descriptor.b_descriptor_type != DESC_CONFIGURATION {
        return Err(DescriptorError::UnexpectedType {
            expected: DESC_CONFIGURATION,
            found: descriptor.b_descriptor_type,
        });
    }

    let total = usize::from(descriptor.w_total_length).min(raw.len());
    let mut interfaces = BTreeMap::new();
    let mut current: Option<InterfaceTree> = None;
    let mut offset = usize::from(descriptor.b_length).max(ConfigDescriptor::SIZE);

    while offset + 2 <= total {
        let length = raw[offset];
        if length < 2 {
            return Err(DescriptorError::InvalidLength { offset, length });
        }
        let end = offset + usize::from(length);
        if end > total {
            return Err(DescriptorError::Truncated {
                needed: end,
                available: total,
            });
        }
        let body = &raw[offset..end];
        match raw[offset + 1] {
            DESC_INTERFACE => {
                if let Some(done) = current.take() {
                    interfaces.insert(key(&done.descriptor), done);
                }
                current = Some(InterfaceTree {
                    descriptor: InterfaceDescriptor::from_le_bytes(body)?,
                    endpoints: Vec::new(),
                });
            }
            DESC_ENDPOINT => {
                let Some(interface) = current.as_mut() else {
                    return Err(DescriptorError::Orphan("endpoint"));
                };
                interface
                    .endpoints
                    .push(EndpointDescriptor::from_le_bytes(body)?);
            }
            // HID, interface association and vendor descriptors are not needed here.
            _ => {}
        }
        offset = end;
    }
    if let Some(done) = current.take() {
        interfaces.insert(key(&done.descriptor), done);
    }

    Ok(ConfigTree {
        descriptor,
        interfaces,
    })
}

fn key(interface: &InterfaceDescriptor) -> (u8, u8) {
    (interface.b_interface_number, interface.b_alternate_setting)
}
