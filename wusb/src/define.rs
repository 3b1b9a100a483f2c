use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use crate::error::*;

/// Interface slots held by every device node.
pub const MAX_INTERFACES: usize = 32;
pub const MAX_CONFIGURATIONS: u8 = 8;
pub const CONTROL_SETUP_SIZE: usize = 8;
pub const MAX_CTRL_BUFFER_LENGTH: usize = 4096;
pub const MAX_HID_REPORT_SIZE: usize = 1024;

pub const ENDPOINT_IN: u8 = 0x80;
pub const ENDPOINT_ADDRESS_MASK: u8 = 0x0f;

pub const CLASS_HUB: u8 = 0x09;
pub const CLASS_HID: u8 = 0x03;

pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_HID: u8 = 0x21;
pub const DT_REPORT: u8 = 0x22;
pub const DT_PHYSICAL: u8 = 0x23;

pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

pub const HID_REQ_GET_REPORT: u8 = 0x01;
pub const HID_REQ_SET_REPORT: u8 = 0x09;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn of_endpoint(address: u8) -> Self {
        if address & ENDPOINT_IN == ENDPOINT_IN { Direction::In } else { Direction::Out }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbControlRecipient {
    Device,
    SpecifiedInterface,
    Endpoint,
    Other,
    DefaultInterface,
}

impl UsbControlRecipient {
    pub(crate) fn bits(&self) -> u8 {
        match self {
            UsbControlRecipient::Device => 0x00,
            UsbControlRecipient::DefaultInterface
            | UsbControlRecipient::SpecifiedInterface => 0x01,
            UsbControlRecipient::Endpoint => 0x02,
            UsbControlRecipient::Other => 0x03,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbControlTransferType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

impl UsbControlTransferType {
    pub(crate) fn bits(&self) -> u8 {
        match self {
            UsbControlTransferType::Standard => 0x00,
            UsbControlTransferType::Class => 0x20,
            UsbControlTransferType::Vendor => 0x40,
            UsbControlTransferType::Reserved => 0x60,
        }
    }

    pub(crate) fn from_request_type(request_type: u8) -> Self {
        match request_type & 0x60 {
            0x00 => UsbControlTransferType::Standard,
            0x20 => UsbControlTransferType::Class,
            0x40 => UsbControlTransferType::Vendor,
            _ => UsbControlTransferType::Reserved,
        }
    }
}

/// The 8 byte SETUP packet that starts every control transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub fn new(
        direction: Direction,
        transfer_type: UsbControlTransferType,
        recipient: UsbControlRecipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let dir = match direction {
            Direction::In => ENDPOINT_IN,
            Direction::Out => 0,
        };
        Self {
            request_type: dir | transfer_type.bits() | recipient.bits(),
            request,
            value,
            index,
            length,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.request_type)
    }

    pub fn transfer_type(&self) -> UsbControlTransferType {
        UsbControlTransferType::from_request_type(self.request_type)
    }

    pub fn recipient_bits(&self) -> u8 {
        self.request_type & 0x1f
    }

    pub fn to_bytes(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTROL_SETUP_SIZE {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

pub struct ControlTransferRequest {
    pub recipient: UsbControlRecipient,
    pub transfer_type: UsbControlTransferType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub timeout: Duration,
}

impl Default for ControlTransferRequest {
    fn default() -> Self {
        Self {
            recipient: UsbControlRecipient::Device,
            transfer_type: UsbControlTransferType::Standard,
            request: 0,
            value: 0,
            index: 0,
            timeout: Duration::from_secs(0),
        }
    }
}

impl ControlTransferRequest {
    pub(crate) fn setup(&self, direction: Direction, length: u16) -> ControlSetup {
        ControlSetup::new(direction, self.transfer_type, self.recipient,
                          self.request, self.value, self.index, length)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Speed {
    Unknown,
    Low,
    Full,
    High,
    Super,
}

impl Speed {
    pub(crate) fn from_os(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Speed::Low,
            1 => Speed::Full,
            2 => Speed::High,
            3 => Speed::Super,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// A device interface class identifier, `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self { data1, data2, data3, data4 }
    }
}

pub const GUID_DEVINTERFACE_USB_HUB: Guid = Guid::new(
    0xf18a0e88, 0xc30c, 0x11d0, [0x88, 0x15, 0x00, 0xa0, 0xc9, 0x06, 0xbe, 0xd8]);
pub const GUID_DEVINTERFACE_USB_DEVICE: Guid = Guid::new(
    0xa5dcbf10, 0x6530, 0x11d2, [0x90, 0x1f, 0x00, 0xc0, 0x4f, 0xb9, 0x51, 0xed]);

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let d = &self.data4;
        write!(f, "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
               self.data1, self.data2, self.data3,
               d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7])
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('{').trim_end_matches('}');
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5
            || parts[0].len() != 8 || parts[1].len() != 4 || parts[2].len() != 4
            || parts[3].len() != 4 || parts[4].len() != 12 {
            return Err(Error::InvalidParam);
        }
        let hex32 = |v: &str| u32::from_str_radix(v, 16).map_err(|_| Error::InvalidParam);
        let hex16 = |v: &str| u16::from_str_radix(v, 16).map_err(|_| Error::InvalidParam);

        let tail = format!("{}{}", parts[3], parts[4]);
        let mut data4 = [0u8; 8];
        for (i, b) in data4.iter_mut().enumerate() {
            *b = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| Error::InvalidParam)?;
        }
        Ok(Guid::new(hex32(parts[0])?, hex16(parts[1])?, hex16(parts[2])?, data4))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guid_text_form() {
        let text = GUID_DEVINTERFACE_USB_DEVICE.to_string();
        assert_eq!(text, "{A5DCBF10-6530-11D2-901F-00C04FB951ED}");
        let parsed: Guid = text.parse().unwrap();
        assert_eq!(parsed, GUID_DEVINTERFACE_USB_DEVICE);
        assert!("{A5DCBF10-6530-11D2}".parse::<Guid>().is_err());
    }

    #[test]
    fn setup_packet_layout() {
        let setup = ControlSetup::new(
            Direction::In,
            UsbControlTransferType::Vendor,
            UsbControlRecipient::Device,
            15, 0x0102, 3, 30);
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0xc0, 15, 0x02, 0x01, 3, 0, 30, 0]);
        assert_eq!(ControlSetup::parse(&bytes).unwrap(), setup);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.transfer_type(), UsbControlTransferType::Vendor);
    }
}
