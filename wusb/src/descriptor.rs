use crate::define::*;
use crate::error::*;

pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;

#[allow(non_snake_case)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: u16,
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: u16,
    pub idProduct: u16,
    pub bcdDevice: u16,
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DEVICE_DESCRIPTOR_SIZE || buf[1] != DT_DEVICE {
            return Err(Error::Io(format!("bad device descriptor ({} bytes)", buf.len())));
        }
        let word = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        Ok(Self {
            bLength: buf[0],
            bDescriptorType: buf[1],
            bcdUSB: word(2),
            bDeviceClass: buf[4],
            bDeviceSubClass: buf[5],
            bDeviceProtocol: buf[6],
            bMaxPacketSize0: buf[7],
            idVendor: word(8),
            idProduct: word(10),
            bcdDevice: word(12),
            iManufacturer: buf[14],
            iProduct: buf[15],
            iSerialNumber: buf[16],
            bNumConfigurations: buf[17],
        })
    }

    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_SIZE] {
        let usb = self.bcdUSB.to_le_bytes();
        let vid = self.idVendor.to_le_bytes();
        let pid = self.idProduct.to_le_bytes();
        let dev = self.bcdDevice.to_le_bytes();
        [
            self.bLength, self.bDescriptorType, usb[0], usb[1],
            self.bDeviceClass, self.bDeviceSubClass, self.bDeviceProtocol, self.bMaxPacketSize0,
            vid[0], vid[1], pid[0], pid[1], dev[0], dev[1],
            self.iManufacturer, self.iProduct, self.iSerialNumber, self.bNumConfigurations,
        ]
    }
}

#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointDescriptor {
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: u16,
    pub bInterval: u8,
    pub extra: Vec<u8>,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.bEndpointAddress)
    }

    pub fn number(&self) -> u8 {
        self.bEndpointAddress & ENDPOINT_ADDRESS_MASK
    }
}

#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
    pub endpoints: Vec<EndpointDescriptor>,
    pub extra: Vec<u8>,
}

/// All alternate settings sharing one interface number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    pub alt_settings: Vec<InterfaceDescriptor>,
}

impl Interface {
    pub fn number(&self) -> Option<u8> {
        self.alt_settings.first().map(|a| a.bInterfaceNumber)
    }
}

#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDescriptor {
    pub wTotalLength: u16,
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
    pub interfaces: Vec<Interface>,
    pub extra: Vec<u8>,
}

/// Total length announced by a configuration descriptor header.
pub(crate) fn config_total_length(header: &[u8]) -> Result<u16> {
    if header.len() < CONFIG_DESCRIPTOR_SIZE || header[1] != DT_CONFIG {
        return Err(Error::Io("not a configuration descriptor".to_string()));
    }
    Ok(u16::from_le_bytes([header[2], header[3]]))
}

impl ConfigDescriptor {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let total = config_total_length(buf)? as usize;
        if total > buf.len() || total < CONFIG_DESCRIPTOR_SIZE {
            return Err(Error::Io(format!(
                "configuration descriptor truncated ({} of {} bytes)", buf.len(), total)));
        }
        let mut cfg = ConfigDescriptor {
            wTotalLength: total as u16,
            bNumInterfaces: buf[4],
            bConfigurationValue: buf[5],
            iConfiguration: buf[6],
            bmAttributes: buf[7],
            bMaxPower: buf[8],
            ..Default::default()
        };

        let mut offset = buf[0] as usize;
        while offset + 2 <= total {
            let len = buf[offset] as usize;
            if len < 2 || offset + len > total {
                return Err(Error::Io(format!("bad descriptor length {} at offset {}", len, offset)));
            }
            let desc = &buf[offset..offset + len];
            match desc[1] {
                DT_INTERFACE if len >= 9 => {
                    let alt = InterfaceDescriptor {
                        bInterfaceNumber: desc[2],
                        bAlternateSetting: desc[3],
                        bNumEndpoints: desc[4],
                        bInterfaceClass: desc[5],
                        bInterfaceSubClass: desc[6],
                        bInterfaceProtocol: desc[7],
                        iInterface: desc[8],
                        ..Default::default()
                    };
                    match cfg.interfaces.iter_mut().find(|i| i.number() == Some(alt.bInterfaceNumber)) {
                        Some(iface) => iface.alt_settings.push(alt),
                        None => cfg.interfaces.push(Interface { alt_settings: vec![alt] }),
                    }
                }
                DT_ENDPOINT if len >= 7 => {
                    let ep = EndpointDescriptor {
                        bEndpointAddress: desc[2],
                        bmAttributes: desc[3],
                        wMaxPacketSize: u16::from_le_bytes([desc[4], desc[5]]),
                        bInterval: desc[6],
                        extra: vec![],
                    };
                    if let Some(alt) = cfg.interfaces.last_mut()
                        .and_then(|i| i.alt_settings.last_mut()) {
                        alt.endpoints.push(ep);
                    }
                }
                _ => {
                    let owner = cfg.interfaces.last_mut().and_then(|i| i.alt_settings.last_mut());
                    match owner {
                        Some(alt) => match alt.endpoints.last_mut() {
                            Some(ep) => ep.extra.extend_from_slice(desc),
                            None => alt.extra.extend_from_slice(desc),
                        },
                        None => cfg.extra.extend_from_slice(desc),
                    }
                }
            }
            offset += len;
        }
        Ok(cfg)
    }

    /// Alternate setting `alt` of the interface numbered `number`.
    pub fn alt_setting(&self, number: u8, alt: u8) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter()
            .find(|i| i.number() == Some(number))
            .and_then(|i| i.alt_settings.iter().find(|a| a.bAlternateSetting == alt))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_config() -> Vec<u8> {
        let mut buf = vec![
            9, DT_CONFIG, 0, 0, 2, 1, 0, 0x80, 50,
            9, DT_INTERFACE, 0, 0, 2, 0xff, 0, 0, 0,
            7, DT_ENDPOINT, 0x81, 2, 0x40, 0, 0,
            7, DT_ENDPOINT, 0x01, 2, 0x40, 0, 0,
            9, DT_INTERFACE, 1, 0, 1, 3, 0, 0, 0,
            9, DT_HID, 0x11, 0x01, 0, 1, DT_REPORT, 0x20, 0,
            7, DT_ENDPOINT, 0x82, 3, 0x08, 0, 10,
        ];
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_le_bytes());
        buf
    }

    #[test]
    fn parse_config_tree() {
        let cfg = ConfigDescriptor::parse(&sample_config()).unwrap();
        assert_eq!(cfg.bConfigurationValue, 1);
        assert_eq!(cfg.interfaces.len(), 2);
        let bulk = cfg.alt_setting(0, 0).unwrap();
        assert_eq!(bulk.endpoints.iter().map(|e| e.bEndpointAddress).collect::<Vec<_>>(), vec![0x81, 0x01]);
        let hid = cfg.alt_setting(1, 0).unwrap();
        assert_eq!(hid.extra.len(), 9);
        assert_eq!(hid.endpoints[0].direction(), Direction::In);
        assert!(cfg.alt_setting(1, 1).is_none());
    }

    #[test]
    fn truncated_config_rejected() {
        let buf = sample_config();
        assert!(ConfigDescriptor::parse(&buf[..20]).is_err());
        assert_eq!(config_total_length(&buf[..9]).unwrap() as usize, buf.len());
    }

    #[test]
    fn device_descriptor_bytes() {
        let desc = DeviceDescriptor {
            bLength: 18,
            bDescriptorType: DT_DEVICE,
            bcdUSB: 0x0200,
            idVendor: 0x1234,
            idProduct: 0x5678,
            bNumConfigurations: 1,
            ..Default::default()
        };
        assert_eq!(DeviceDescriptor::parse(&desc.to_bytes()).unwrap(), desc);
    }
}
