use log::{debug, error, warn};
use crate::backend::Backend;
use crate::define::*;
use crate::error::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSlot {
    pub(crate) path: Option<String>,
    pub(crate) backend: Backend,
    pub(crate) endpoints: Vec<u8>,
    pub(crate) restricted: bool,
}

impl InterfaceSlot {
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Endpoint addresses of the selected alternate setting.
    pub fn endpoints(&self) -> &[u8] {
        &self.endpoints
    }

    /// Only reduced privilege access could be obtained.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }
}

/// Interface ordinal embedded in an instance id as `MI_##`.
pub fn parse_interface_ordinal(device_id: &str) -> Option<usize> {
    let pos = device_id.find("MI_")?;
    let digits = device_id.get(pos + 3..pos + 5)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The fixed interface slot array of a device node.
///
/// Composite leaves are keyed by their `MI_##` ordinal. HID collections of a
/// HID device are kept as a compact list at the front of the array.
#[derive(Debug, Clone)]
pub struct InterfaceSlots {
    slots: Vec<InterfaceSlot>,
    hid_count: usize,
}

impl Default for InterfaceSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceSlots {
    pub fn new() -> Self {
        Self {
            slots: vec![InterfaceSlot::default(); MAX_INTERFACES],
            hid_count: 0,
        }
    }

    pub fn get(&self, iface: usize) -> Option<&InterfaceSlot> {
        self.slots.get(iface)
    }

    pub fn iter(&self) -> impl Iterator<Item=&InterfaceSlot> {
        self.slots.iter()
    }

    pub fn hid_count(&self) -> usize {
        self.hid_count
    }

    pub(crate) fn backend(&self, iface: usize) -> Backend {
        self.slots.get(iface).map(|s| s.backend).unwrap_or_default()
    }

    pub(crate) fn path(&self, iface: usize) -> Option<&str> {
        self.slots.get(iface).and_then(|s| s.path.as_deref())
    }

    pub(crate) fn has_backend(&self, backend: Backend) -> bool {
        self.slots.iter().any(|s| s.backend.same_family(&backend))
    }

    pub(crate) fn set_endpoints(&mut self, iface: usize, endpoints: Vec<u8>) {
        if let Some(s) = self.slots.get_mut(iface) {
            s.endpoints = endpoints;
        }
    }

    pub(crate) fn set_restricted(&mut self, iface: usize, restricted: bool) {
        if let Some(s) = self.slots.get_mut(iface) {
            s.restricted = restricted;
        }
    }

    /// Simple devices answer every interface through the device path.
    pub(crate) fn set_device_backend(&mut self, path: &str, backend: Backend) {
        for s in self.slots.iter_mut() {
            s.backend = backend;
        }
        self.slots[0].path = Some(path.to_string());
    }

    fn ordinal(device_id: &str) -> Result<usize> {
        let n = match parse_interface_ordinal(device_id) {
            Some(n) => n,
            None => {
                warn!("failure to read interface number for {}, using default value 0", device_id);
                0
            }
        };
        if n >= MAX_INTERFACES {
            error!("max USB interface number exceeded by {}", device_id);
            return Err(Error::Other(format!("interface number {} out of range", n)));
        }
        Ok(n)
    }

    /// Map a composite leaf into the slot named by its `MI_##` ordinal.
    ///
    /// A second HID collection for an ordinal already held by a HID leaf is
    /// ignored with [Error::Access]; anything else replaces the slot.
    pub(crate) fn install_composite(&mut self, device_id: &str, path: &str, backend: Backend) -> Result<usize> {
        let n = Self::ordinal(device_id)?;
        let slot = &mut self.slots[n];
        if slot.path.is_some() && slot.backend == Backend::Hid && backend == Backend::Hid {
            debug!("interface[{}] already set, ignoring HID collection: {}", n, device_id);
            return Err(Error::Access);
        }
        debug!("interface[{}] = {}", n, path);
        slot.path = Some(path.to_string());
        slot.backend = backend;
        slot.restricted = false;
        Ok(n)
    }

    /// Clear the slot of a composite leaf.
    ///
    /// `None` when the slot holds another path, as it does for HID
    /// collections that lost to the first one.
    pub(crate) fn remove_composite(&mut self, device_id: &str, path: &str) -> Option<usize> {
        let n = Self::ordinal(device_id).ok()?;
        let slot = &mut self.slots[n];
        if slot.path.as_deref() != Some(path) {
            debug!("interface[{}] does not hold {}", n, path);
            return None;
        }
        debug!("removing interface[{}] = {}", n, path);
        *slot = InterfaceSlot::default();
        Some(n)
    }

    /// Append a HID collection, ignoring a path already present.
    pub(crate) fn install_hid(&mut self, path: &str) -> Result<usize> {
        if let Some(i) = self.slots[..self.hid_count].iter().position(|s| s.path.as_deref() == Some(path)) {
            debug!("interface[{}] already set to {}", i, path);
            return Ok(i);
        }
        if self.hid_count == MAX_INTERFACES {
            error!("max USB interfaces reached for HID device");
            return Err(Error::Other("too many HID collections".to_string()));
        }
        let i = self.hid_count;
        self.slots[i] = InterfaceSlot {
            path: Some(path.to_string()),
            backend: Backend::Hid,
            ..Default::default()
        };
        debug!("interface[{}] = {}", i, path);
        self.hid_count += 1;
        Ok(i)
    }

    /// Drop a HID collection and shift the later ones down.
    pub(crate) fn remove_hid(&mut self, path: &str) -> Option<usize> {
        let i = self.slots[..self.hid_count].iter().position(|s| s.path.as_deref() == Some(path))?;
        debug!("removing interface[{}] = {}", i, path);
        self.slots[i..self.hid_count].rotate_left(1);
        self.slots[self.hid_count - 1] = InterfaceSlot::default();
        self.hid_count -= 1;
        Some(i)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::SubApi;

    const WINUSB: Backend = Backend::DirectAccess(SubApi::WinUsb);

    #[test]
    fn ordinal_parsing() {
        assert_eq!(parse_interface_ordinal("USB\\VID_1234&PID_0001&MI_03\\8&1"), Some(3));
        assert_eq!(parse_interface_ordinal("USB\\VID_1234&PID_0001&MI_X1\\8&1"), None);
        assert_eq!(parse_interface_ordinal("USB\\VID_1234&PID_0001\\8&1"), None);
    }

    #[test]
    fn sparse_composite_ordinals() {
        let mut slots = InterfaceSlots::new();
        assert_eq!(slots.install_composite("USB\\VID_1&PID_2&MI_00\\1", "\\\\.\\A", WINUSB).unwrap(), 0);
        assert_eq!(slots.install_composite("USB\\VID_1&PID_2&MI_03\\1", "\\\\.\\D", Backend::Hid).unwrap(), 3);
        assert_eq!(slots.path(0), Some("\\\\.\\A"));
        assert!(slots.get(1).unwrap().path().is_none());
        assert!(slots.get(2).unwrap().path().is_none());
        assert_eq!(slots.backend(3), Backend::Hid);

        assert_eq!(slots.remove_composite("USB\\VID_1&PID_2&MI_00\\1", "\\\\.\\A"), Some(0));
        assert!(slots.path(0).is_none());
        assert_eq!(slots.backend(0), Backend::Unsupported);
        assert_eq!(slots.path(3), Some("\\\\.\\D"));
        assert_eq!(slots.remove_composite("USB\\VID_1&PID_2&MI_01\\1", "\\\\.\\B"), None);
    }

    #[test]
    fn first_hid_collection_wins() {
        let mut slots = InterfaceSlots::new();
        slots.install_composite("HID\\VID_1&PID_2&MI_01&COL01\\1", "\\\\.\\C1", Backend::Hid).unwrap();
        assert_eq!(slots.install_composite("HID\\VID_1&PID_2&MI_01&COL02\\1", "\\\\.\\C2", Backend::Hid), Err(Error::Access));
        assert_eq!(slots.install_composite("HID\\VID_1&PID_2&MI_01&COL03\\1", "\\\\.\\C3", Backend::Hid), Err(Error::Access));
        assert_eq!(slots.path(1), Some("\\\\.\\C1"));

        // a non-HID leaf replaces whatever held the slot
        slots.install_composite("USB\\VID_1&PID_2&MI_01\\1", "\\\\.\\W", WINUSB).unwrap();
        assert_eq!(slots.backend(1), WINUSB);
        assert!(slots.install_composite("USB\\VID_1&PID_2&MI_40\\1", "\\\\.\\X", WINUSB).is_err());
    }

    #[test]
    fn duplicate_hid_leaves_leave_other_ordinals_alone() {
        let mut slots = InterfaceSlots::new();
        slots.install_composite("USB\\VID_1&PID_2&MI_00\\1", "\\\\.\\A", WINUSB).unwrap();
        slots.install_composite("USB\\VID_1&PID_2&MI_02\\1", "\\\\.\\B", Backend::DirectAccess(SubApi::Libusb0)).unwrap();
        slots.install_composite("HID\\VID_1&PID_2&MI_01&COL01\\1", "\\\\.\\C1", Backend::Hid).unwrap();
        let before = slots.clone();
        for (id, path) in [("HID\\VID_1&PID_2&MI_01&COL02\\1", "\\\\.\\C2"), ("HID\\VID_1&PID_2&MI_01&COL03\\1", "\\\\.\\C3")] {
            assert_eq!(slots.install_composite(id, path, Backend::Hid), Err(Error::Access));
        }
        assert!(slots.iter().eq(before.iter()));

        // removing a collection that never got the slot keeps the first one
        assert_eq!(slots.remove_composite("HID\\VID_1&PID_2&MI_01&COL02\\1", "\\\\.\\C2"), None);
        assert_eq!(slots.path(1), Some("\\\\.\\C1"));
        assert_eq!(slots.remove_composite("HID\\VID_1&PID_2&MI_01&COL01\\1", "\\\\.\\C1"), Some(1));
        assert_eq!(slots.path(0), Some("\\\\.\\A"));
        assert_eq!(slots.path(2), Some("\\\\.\\B"));
        assert_eq!(slots.backend(2), Backend::DirectAccess(SubApi::Libusb0));
    }

    #[test]
    fn hid_collections_stay_ordered() {
        let mut slots = InterfaceSlots::new();
        for p in ["\\\\.\\COL1", "\\\\.\\COL2", "\\\\.\\COL3"] {
            slots.install_hid(p).unwrap();
        }
        assert_eq!(slots.install_hid("\\\\.\\COL2").unwrap(), 1);
        assert_eq!(slots.hid_count(), 3);

        assert_eq!(slots.remove_hid("\\\\.\\COL3"), Some(2));
        assert_eq!(slots.remove_hid("\\\\.\\COL2"), Some(1));
        assert_eq!(slots.hid_count(), 1);
        assert_eq!(slots.path(0), Some("\\\\.\\COL1"));
        assert!(slots.path(1).is_none());

        slots.install_hid("\\\\.\\COL4").unwrap();
        slots.install_hid("\\\\.\\COL5").unwrap();
        assert_eq!(slots.remove_hid("\\\\.\\COL1"), Some(0));
        assert_eq!(slots.path(0), Some("\\\\.\\COL4"));
        assert_eq!(slots.path(1), Some("\\\\.\\COL5"));
        assert_eq!(slots.backend(2), Backend::Unsupported);
        assert_eq!(slots.remove_hid("\\\\.\\COL1"), None);
    }
}
