//! Background listener turning OS device-change notifications into topology updates.
use std::sync::Weak;
use std::thread::JoinHandle;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::executor::block_on;
use futures::StreamExt;
use log::{debug, trace, warn};
use thread_priority::{set_current_thread_priority, ThreadPriority};
use crate::backend::{classify, Backend};
use crate::define::*;
use crate::error::*;
use crate::os::{HidDeviceInfo, OsServices};
use crate::platform::PlatformInner;
use crate::registry::{parse_device_interface_path, sanitize_path};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrival,
    RemoveComplete,
    /// Any other notification code, ignored.
    Other(u32),
}

/// One device-interface notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    pub event: DeviceEvent,
    pub class_guid: Guid,
    /// Device interface path, `\\?\USB#VID_xxxx&PID_xxxx#...#{guid}`.
    pub name: String,
}

pub(crate) struct Listener {
    sender: UnboundedSender<DeviceChange>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn start(platform: Weak<PlatformInner>, os: &OsServices, raise_priority: bool) -> Result<Self> {
        let (sender, rx) = mpsc::unbounded();
        let thread = std::thread::Builder::new()
            .name("wusb-hotplug".to_string())
            .spawn(move || listen(platform, rx, raise_priority))
            .map_err(|e| Error::Other(format!("cannot start hotplug thread: {}", e)))?;
        let mut s = Self { sender, thread: Some(thread) };
        if let Err(e) = os.notifier.subscribe(s.sender.clone()) {
            s.stop();
            return Err(e);
        }
        debug!("hotplug listener started");
        Ok(s)
    }

    pub(crate) fn stop(&mut self) {
        self.sender.close_channel();
        if let Some(t) = self.thread.take() {
            if t.thread().id() == std::thread::current().id() {
                return;
            }
            if t.join().is_err() {
                warn!("hotplug thread panicked");
            }
        }
        trace!("hotplug listener stopped");
    }
}

fn listen(platform: Weak<PlatformInner>, mut rx: UnboundedReceiver<DeviceChange>, raise_priority: bool) {
    if raise_priority {
        if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
            warn!("failed to set hotplug thread priority: {:?}", e);
        }
    }
    while let Some(change) = block_on(rx.next()) {
        let platform = match platform.upgrade() {
            Some(p) => p,
            None => break,
        };
        let added = match change.event {
            DeviceEvent::Arrival => true,
            DeviceEvent::RemoveComplete => false,
            DeviceEvent::Other(code) => {
                debug!("ignoring device change event {}", code);
                continue;
            }
        };
        apply_change(&platform, &change.name, &change.class_guid, added);
    }
    trace!("hotplug thread exits");
}

/// Route an interface arrival or removal to every live context.
pub(crate) fn apply_change(platform: &PlatformInner, name: &str, class: &Guid, added: bool) {
    let device_id = match parse_device_interface_path(name) {
        Some(id) => id,
        None => {
            debug!("could not parse device interface path '{}'", name);
            return;
        }
    };
    let _g = match platform.registry_lock.lock() {
        Ok(g) => g,
        Err(e) => {
            warn!("registry lock poisoned: {}", e);
            return;
        }
    };
    let contexts = platform.live_contexts();

    if *class == GUID_DEVINTERFACE_USB_HUB || *class == GUID_DEVINTERFACE_USB_DEVICE {
        debug!("PRO: {} ({})", device_id, if added { "CONNECTED" } else { "DISCONNECTED" });
        for ctx in &contexts {
            if added {
                if let Err(e) = ctx.enumerate_device_locked(&device_id, class) {
                    warn!("hotplug enumeration of '{}' failed: {}", device_id, e);
                }
            } else if let Some(session) = platform.identities.lookup(&device_id) {
                if let Err(e) = ctx.disconnect_locked(session) {
                    warn!("hotplug removal of '{}' failed: {}", device_id, e);
                }
            }
        }
        return;
    }

    let enumerator = match device_id.split_once('\\') {
        Some((e, _)) => e,
        None => return,
    };
    if !platform.config.enumerators.iter().any(|e| e.eq_ignore_ascii_case(enumerator)) {
        return;
    }
    debug!("IFC: {} {} ({})", device_id, class, if added { "CONNECTED" } else { "DISCONNECTED" });

    let tree = &platform.os.tree;
    let inst = match tree.find_device(&device_id, added) {
        Some(i) => i,
        None => return,
    };
    let parent_id = match tree.parent(inst).and_then(|p| tree.device_id(p)) {
        Some(id) => id,
        None => {
            debug!("could not get parent instance id for '{}'", device_id);
            return;
        }
    };
    let session = match platform.identities.lookup(&parent_id) {
        Some(s) => s,
        None => return,
    };
    let path = sanitize_path(name);

    for ctx in &contexts {
        let parent = match ctx.device(session) {
            Some(d) => d,
            None => continue,
        };
        debug!("parent device '{}'", parent.device_id);
        let mut node = match parent.lock_node() {
            Ok(n) => n,
            Err(e) => {
                warn!("cannot update {}: {}", parent, e);
                continue;
            }
        };
        match (parent.backend, added) {
            (Backend::Composite, true) => {
                let leaf = classify(&**tree, inst);
                if leaf == Backend::Unsupported {
                    debug!("unsupported API for interface '{}'", device_id);
                    continue;
                }
                match node.slots.install_composite(&device_id, &path, leaf) {
                    Ok(_) => {
                        if leaf == Backend::Hid && node.hid.is_none() {
                            node.hid = Some(HidDeviceInfo::default());
                        }
                    }
                    Err(e) => warn!("failed to set composite interface for '{}': {}", device_id, e),
                }
            }
            (Backend::Hid, true) => {
                if let Err(e) = node.slots.install_hid(&path) {
                    warn!("failed to set hid interface for '{}': {}", device_id, e);
                }
            }
            (Backend::Composite, false) => {
                if node.slots.remove_composite(&device_id, &path).is_some()
                    && !node.slots.iter().any(|s| s.backend == Backend::Hid) {
                    node.hid = None;
                }
            }
            (Backend::Hid, false) => {
                node.slots.remove_hid(&path);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use super::*;
    use crate::platform::Platform;
    use crate::sim::SimOs;
    use crate::utils::test::init;

    fn wait_for<F: Fn() -> bool>(f: F) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn arrival_and_removal_reach_every_context() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let platform = Platform::new(sim.services()).unwrap();
        let a = platform.new_context().unwrap();
        let b = platform.new_context().unwrap();
        assert_eq!(a.device_list().unwrap().len(), 1);

        let dev = sim.add_device(root, 4, "USB\\VID_1234&PID_0042\\HOT", 0x1234, 0x0042);
        sim.plug(dev);
        assert!(wait_for(|| a.device_list().unwrap().len() == 2 && b.device_list().unwrap().len() == 2));
        let seen = a.device_list().unwrap().into_iter().find(|d| d.pid() == 0x42).unwrap();
        assert!(seen.is_connected());

        sim.unplug(dev);
        assert!(wait_for(|| a.device_list().unwrap().len() == 1 && b.device_list().unwrap().len() == 1));
        assert!(!seen.is_connected());
        assert_eq!(seen.open().err(), Some(Error::NoDevice));
    }

    #[test]
    fn composite_interfaces_follow_notifications() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let comp = sim.add_device(root, 1, "USB\\VID_1234&PID_0100\\SN1", 0x1234, 0x0100);
        sim.set_driver(comp, "usbccgp");
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_00\\7&1", "WinUSB", None);

        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let dev = ctx.device_list().unwrap().into_iter().find(|d| d.pid() == 0x100).unwrap();
        assert!(dev.interface_slots().unwrap().get(1).unwrap().path().is_none());

        let leaf = sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_01\\7&2", "libusb0", None);
        let (path, class) = sim.interface_of(leaf).unwrap();
        ctx.handle_device_change(&path, &class, true);
        assert_eq!(dev.interface_slots().unwrap().get(1).unwrap().backend(),
                   Backend::DirectAccess(crate::backend::SubApi::Libusb0));

        // other enumerators are ignored
        ctx.handle_device_change("\\\\?\\BTHENUM#X#1#{00000000-0000-0000-0000-000000000000}", &class, true);

        sim.remove_node(leaf);
        ctx.handle_device_change(&path, &class, false);
        assert!(dev.interface_slots().unwrap().get(1).unwrap().path().is_none());
        assert!(dev.interface_slots().unwrap().get(0).unwrap().path().is_some());
    }

    #[test]
    fn removed_leaf_closes_its_handles() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let comp = sim.add_device(root, 1, "USB\\VID_1234&PID_0100\\SN1", 0x1234, 0x0100);
        sim.set_driver(comp, "usbccgp");
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_00\\7&1", "WinUSB", None);
        let leaf = sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_01\\7&2", "libusb0", None);
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();

        let before = sim.open_handles();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x0100).unwrap();
        assert_eq!(sim.open_handles(), before + 2);

        let (path, class) = sim.interface_of(leaf).unwrap();
        sim.remove_node(leaf);
        ctx.handle_device_change(&path, &class, false);
        handle.shared.with_ops(|_| Ok(())).unwrap();
        assert_eq!(sim.open_handles(), before + 1);
        assert!(handle.shared.state.lock().unwrap().interfaces[1].path.is_none());

        drop(handle);
        assert_eq!(sim.open_handles(), before);
    }

    #[test]
    fn last_hid_leaf_takes_the_hid_info() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let comp = sim.add_device(root, 1, "USB\\VID_1234&PID_0100\\SN1", 0x1234, 0x0100);
        sim.set_driver(comp, "usbccgp");
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_00\\7&1", "WinUSB", None);
        let first = sim.add_interface_node(comp, "HID\\VID_1234&PID_0100&MI_01&COL01\\8&1", "HidUsb", Some(sim.hid_guid()));
        let second = sim.add_interface_node(comp, "HID\\VID_1234&PID_0100&MI_01&COL02\\8&2", "HidUsb", Some(sim.hid_guid()));
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let dev = ctx.device_list().unwrap().into_iter().find(|d| d.pid() == 0x100).unwrap();
        let winusb = dev.interface_slots().unwrap().get(0).unwrap().clone();
        assert!(dev.hid_info().unwrap().is_some());

        // the collection that lost the slot goes away first
        let (path, class) = sim.interface_of(second).unwrap();
        sim.remove_node(second);
        ctx.handle_device_change(&path, &class, false);
        let slots = dev.interface_slots().unwrap();
        assert!(slots.get(1).unwrap().path().unwrap().contains("COL01"));
        assert_eq!(slots.get(0), Some(&winusb));
        assert!(dev.hid_info().unwrap().is_some());

        let (path, class) = sim.interface_of(first).unwrap();
        sim.remove_node(first);
        ctx.handle_device_change(&path, &class, false);
        let slots = dev.interface_slots().unwrap();
        assert!(slots.get(1).unwrap().path().is_none());
        assert_eq!(slots.get(0), Some(&winusb));
        assert!(dev.hid_info().unwrap().is_none());
    }

    #[test]
    fn hid_removal_remaps_open_collections() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let kbd = sim.add_device(root, 1, "USB\\VID_046D&PID_C31C\\5&1", 0x046d, 0xc31c);
        sim.set_driver(kbd, "HidUsb");
        let cols: Vec<_> = (1..=3).map(|n| {
            let id = format!("HID\\VID_046D&PID_C31C&COL0{}\\6&{}", n, n);
            sim.add_interface_node(kbd, &id, "HidUsb", Some(sim.hid_guid()))
        }).collect();
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();

        let before = sim.open_handles();
        let handle = ctx.open_device_with_vid_pid(0x046d, 0xc31c).unwrap();
        assert_eq!(sim.open_handles(), before + 3);
        handle.claim_interface(1).unwrap();
        let second = handle.shared.state.lock().unwrap().interfaces[1].clone();

        let (path, class) = sim.interface_of(cols[0]).unwrap();
        sim.remove_node(cols[0]);
        ctx.handle_device_change(&path, &class, false);
        handle.shared.with_ops(|_| Ok(())).unwrap();
        assert_eq!(sim.open_handles(), before + 2);

        let slots = handle.device().interface_slots().unwrap();
        assert_eq!(slots.hid_count(), 2);
        {
            let state = handle.shared.state.lock().unwrap();
            for i in 0..2 {
                assert_eq!(state.interfaces[i].path.as_deref(), slots.get(i).unwrap().path());
            }
            assert_eq!(state.interfaces[0].api, second.api);
            assert!(state.interfaces[2].path.is_none());
            assert!(state.is_claimed(0));
            assert!(!state.is_claimed(1));
        }
        handle.release_interface(0).unwrap();
        assert_eq!(handle.release_interface(1), Err(Error::NotFound));

        drop(handle);
        assert_eq!(sim.open_handles(), before);
    }
}
