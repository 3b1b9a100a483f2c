//! Maps the interface nodes of composite and HID devices into interface slots.
use log::{debug, warn};
use crate::backend::{classify, Backend};
use crate::context::ContextInner;
use crate::define::Guid;
use crate::device::NodeState;
use crate::error::*;
use crate::os::{DevInst, HidDeviceInfo};
use crate::registry::sanitize_path;

impl ContextInner {
    /// Interface classes a composite device exposes beyond the generic one.
    fn child_interface_guids(&self, inst: DevInst, device_id: &str) -> Result<Vec<Guid>> {
        let tree = &self.platform.os.tree;
        let mut child = tree.first_child(inst).ok_or_else(|| {
            warn!("could not find child for composite/hid device '{}'", device_id);
            Error::NotFound
        })?;
        let mut guids = vec![];
        loop {
            match tree.device_id(child) {
                None => warn!("failed to get device instance id for instance {:?}", child),
                Some(child_id) => {
                    if let Some(text) = tree.registry_value(child, "DeviceInterfaceGUIDs") {
                        match text.trim_end_matches('\0').parse::<Guid>() {
                            Ok(guid) => {
                                debug!("'{}' has interface GUID {}", child_id, guid);
                                guids.push(guid);
                            }
                            Err(e) => warn!("bad interface GUID '{}' for '{}': {}", text, child_id, e),
                        }
                    }
                }
            }
            child = match tree.next_sibling(child) {
                Some(c) => c,
                None => break,
            };
        }
        Ok(guids)
    }

    /// Fill the slots of a composite or HID device from its interface nodes.
    pub(crate) fn enumerate_device_interfaces(&self, node: &mut NodeState, inst: DevInst, device_id: &str, backend: Backend) -> Result {
        let os = &self.platform.os;
        let mut guids = vec![os.hid.hid_guid()];
        match backend {
            Backend::Composite => guids.extend(self.child_interface_guids(inst, device_id)?),
            Backend::Hid => {}
            _ => {
                warn!("'{}' is not composite/hid", device_id);
                return Err(Error::NotFound);
            }
        }

        for guid in &guids {
            for info in os.tree.interfaces_of_class(guid) {
                let leaf_id = match os.tree.device_id(info.inst) {
                    Some(id) => id,
                    None => {
                        warn!("failed to get device instance id for instance {:?}", info.inst);
                        continue;
                    }
                };
                if os.tree.parent(info.inst) != Some(inst) {
                    continue;
                }
                let path = sanitize_path(&info.path);
                match backend {
                    Backend::Composite => {
                        let leaf = classify(&*os.tree, info.inst);
                        if leaf == Backend::Unsupported {
                            continue;
                        }
                        match node.slots.install_composite(&leaf_id, &path, leaf) {
                            Ok(_) => {
                                if leaf == Backend::Hid && node.hid.is_none() {
                                    node.hid = Some(HidDeviceInfo::default());
                                }
                            }
                            Err(e) => warn!("failed to set composite interface for '{}': {}", leaf_id, e),
                        }
                    }
                    _ => {
                        if let Err(e) = node.slots.install_hid(&path) {
                            warn!("failed to set HID interface for '{}': {}", leaf_id, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::backend::{Backend, SubApi};
    use crate::define::*;
    use crate::platform::Platform;
    use crate::sim::SimOs;
    use crate::utils::test::init;

    #[test]
    fn composite_leaves_land_in_ordinal_slots() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let comp = sim.add_device(root, 1, "USB\\VID_1234&PID_0100\\SN1", 0x1234, 0x0100);
        sim.set_driver(comp, "usbccgp");
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_00\\7&1", "WinUSB", None);
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_02\\7&2", "libusbK", None);
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_03\\7&3", "usbser", None);
        sim.add_interface_node(comp, "HID\\VID_1234&PID_0100&MI_01&COL01\\8&1", "HidUsb", Some(sim.hid_guid()));
        sim.add_interface_node(comp, "HID\\VID_1234&PID_0100&MI_01&COL02\\8&2", "HidUsb", Some(sim.hid_guid()));

        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let dev = ctx.device_list().unwrap().into_iter().find(|d| d.pid() == 0x0100).unwrap();
        assert_eq!(dev.backend(), Backend::Composite);

        let slots = dev.interface_slots().unwrap();
        assert_eq!(slots.get(0).unwrap().backend(), Backend::DirectAccess(SubApi::WinUsb));
        assert_eq!(slots.get(1).unwrap().backend(), Backend::Hid);
        assert!(slots.get(1).unwrap().path().unwrap().contains("COL01"));
        assert_eq!(slots.get(2).unwrap().backend(), Backend::DirectAccess(SubApi::LibusbK));
        assert!(slots.get(3).unwrap().path().is_none());
        assert!(dev.hid_info().unwrap().is_some());
    }

    #[test]
    fn hid_device_collections() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let kbd = sim.add_device(root, 1, "USB\\VID_046D&PID_C31C\\5&1", 0x046d, 0xc31c);
        sim.set_driver(kbd, "HidUsb");
        sim.add_interface_node(kbd, "HID\\VID_046D&PID_C31C&COL01\\6&1", "kbdhid", Some(sim.hid_guid()));
        sim.add_interface_node(kbd, "HID\\VID_046D&PID_C31C&COL02\\6&2", "HidUsb", Some(sim.hid_guid()));

        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let dev = ctx.enumerate_device("USB\\VID_046D&PID_C31C\\5&1", &GUID_DEVINTERFACE_USB_DEVICE).unwrap();
        assert_eq!(dev.backend(), Backend::Hid);
        let slots = dev.interface_slots().unwrap();
        assert_eq!(slots.hid_count(), 2);
        assert!(slots.get(0).unwrap().path().unwrap().contains("COL01"));
        assert!(slots.get(1).unwrap().path().unwrap().contains("COL02"));
    }
}
