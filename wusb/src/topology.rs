//! Builds the bus, hub and device tree from the OS device tree.
use std::sync::{Arc, Mutex};
use std::sync::atomic::AtomicBool;
use log::{debug, error, info, warn};
use crate::backend::{classify, Backend};
use crate::context::ContextInner;
use crate::define::*;
use crate::descriptor::*;
use crate::device::{NodeState, UsbDevice};
use crate::error::*;
use crate::os::*;
use crate::registry::{parse_device_interface_path, sanitize_path, SessionId};
use crate::slots::InterfaceSlots;

/// What [ContextInner::init_device] learned about a device.
struct Placement {
    bus: u8,
    address: u8,
    depth: u8,
    speed: Speed,
    descriptor: DeviceDescriptor,
    num_configurations: u8,
    active_config: u8,
    configs: Vec<Vec<u8>>,
}

/// Parse `PCI\VEN_xxxx&DEV_xxxx...` into a vendor and product id.
fn parse_pci_id(hcd_id: &str) -> Option<(u16, u16)> {
    let rest = hcd_id.strip_prefix("PCI\\VEN_")?;
    let vid = u16::from_str_radix(rest.get(..4)?, 16).ok()?;
    let rest = rest.get(4..)?.strip_prefix("&DEV_")?;
    let pid = u16::from_str_radix(rest.get(..4)?, 16).ok()?;
    Some((vid, pid))
}

impl ContextInner {
    /// Enumerate every hub, then every device.
    pub(crate) fn scan_devices(&self) -> Result {
        let platform = self.platform.clone();
        let _g = platform.registry_lock.lock()?;
        for (name, class) in [("HUB", GUID_DEVINTERFACE_USB_HUB), ("DEV", GUID_DEVINTERFACE_USB_DEVICE)] {
            debug!("{} pass", name);
            for info in self.platform.os.tree.interfaces_of_class(&class) {
                let device_id = match self.platform.os.tree.device_id(info.inst)
                    .or_else(|| parse_device_interface_path(&info.path)) {
                    Some(id) => id,
                    None => continue,
                };
                if let Err(e) = self.enumerate_device_locked(&device_id, &class) {
                    debug!("skipped '{}': {}", device_id, e);
                }
            }
        }
        Ok(())
    }

    /// Make sure `device_id` and its parents are in the context.
    ///
    /// Must be called with the platform registry lock held.
    pub(crate) fn enumerate_device_locked(&self, device_id: &str, class: &Guid) -> Result<SessionId> {
        let os = &self.platform.os;
        let session = self.platform.identities.hash(device_id)?;
        if let Some(dev) = self.device(session) {
            debug!("device found in session {} ({}.{})", session, dev.bus, dev.address);
            return Ok(session);
        }

        let inst = match os.tree.find_device(device_id, true) {
            Some(inst) => inst,
            None => {
                debug!("device '{}' not found", device_id);
                return Err(Error::NotFound);
            }
        };

        let port = self.port_and_state(inst, device_id)?;

        let parent = if port == 0 && *class == GUID_DEVINTERFACE_USB_HUB {
            None
        } else {
            let parent_id = os.tree.parent(inst)
                .and_then(|p| os.tree.device_id(p))
                .ok_or_else(|| {
                    warn!("could not get parent device id for '{}'", device_id);
                    Error::NotFound
                })?;
            let parent_session = self.platform.identities.hash(&parent_id)?;
            let parent = match self.device(parent_session) {
                Some(p) => p,
                None => {
                    debug!("parent for '{}' not found, enumerating now", device_id);
                    if let Err(e) = self.enumerate_device_locked(&parent_id, &GUID_DEVINTERFACE_USB_HUB) {
                        debug!("parent '{}' failed: {}", parent_id, e);
                    }
                    self.device(parent_session).ok_or_else(|| {
                        warn!("unable to enumerate parent '{}' for '{}'", parent_id, device_id);
                        Error::NotFound
                    })?
                }
            };
            Some(parent)
        };

        debug!("allocating new device for session {}", session);
        let backend = classify(&*os.tree, inst);

        let path = match os.tree.interface_path(inst, class) {
            Some(p) => sanitize_path(&p),
            None => {
                warn!("could not get interface detail for '{}'", device_id);
                return Err(Error::NotFound);
            }
        };

        let placed = self.init_device(inst, device_id, parent.as_deref(), port as u8)
            .map_err(|e| {
                warn!("failed to initialize device '{}': {}", device_id, e);
                e
            })?;

        let mut node = NodeState {
            active_config: placed.active_config,
            slots: InterfaceSlots::new(),
            hid: None,
        };
        match backend {
            Backend::Composite | Backend::Hub => {}
            Backend::Hid => node.hid = Some(HidDeviceInfo::default()),
            other => node.slots.set_device_backend(&path, other),
        }

        if let Backend::Composite | Backend::Hid = backend {
            self.enumerate_device_interfaces(&mut node, inst, device_id, backend)
                .map_err(|e| {
                    warn!("failed to enumerate interfaces for '{}': {}", device_id, e);
                    e
                })?;
        }

        let device = Arc::new(UsbDevice {
            session,
            device_id: device_id.to_string(),
            inst,
            path,
            backend,
            parent: parent.as_ref().map(Arc::downgrade),
            ctx: self.me.clone(),
            bus: placed.bus,
            address: placed.address,
            port: port as u8,
            depth: placed.depth,
            speed: placed.speed,
            descriptor: placed.descriptor,
            num_configurations: placed.num_configurations,
            configs: placed.configs,
            node: Mutex::new(node),
            connected: AtomicBool::new(true),
        });
        info!("{} ({}, port {}, depth {}) backend {}", device, device_id, device.port, device.depth, backend);
        self.sessions.write()?.insert(session, device);
        Ok(session)
    }

    fn port_and_state(&self, inst: DevInst, device_id: &str) -> Result<u32> {
        let tree = &self.platform.os.tree;
        match tree.property(inst, DeviceProperty::InstallState).and_then(|v| v.as_number()) {
            None => {
                warn!("could not detect installation state of driver for '{}'", device_id);
                return Err(Error::Access);
            }
            Some(0) => {}
            Some(code) => {
                warn!("driver for device '{}' is reporting an issue (code: {}), skipping", device_id, code);
                return Err(Error::Access);
            }
        }
        tree.property(inst, DeviceProperty::Address)
            .and_then(|v| v.as_number())
            .ok_or_else(|| {
                warn!("could not retrieve port number for device '{}', skipping", device_id);
                Error::Access
            })
    }

    fn init_device(&self, inst: DevInst, device_id: &str, parent: Option<&UsbDevice>, port: u8) -> Result<Placement> {
        if port == 0 {
            if parent.is_some() {
                error!("device '{}' has port 0 and a parent", device_id);
                return Err(Error::Other("root hub with a parent".to_string()));
            }
            return self.init_root_hub(inst, device_id);
        }

        let parent = parent.ok_or(Error::NotFound)?;
        if parent.backend != Backend::Hub {
            warn!("parent for device '{}' is not a hub", device_id);
            return Err(Error::NotFound);
        }
        if parent.bus == 0 {
            error!("parent device bus number not set for '{}'", device_id);
            return Err(Error::NotFound);
        }

        let io = &self.platform.os.io;
        let hub = io.open(&parent.path, Access::ReadWrite).map_err(|e| {
            warn!("could not open hub '{}': {}", parent.path, e);
            Error::Access
        })?;
        let r = self.read_connection(hub, device_id, port);
        io.close(hub);
        let (conn, configs) = r?;

        let mut descriptor = conn.device_descriptor;
        let num_configurations = if configs.is_some() { descriptor.bNumConfigurations } else {
            descriptor.bNumConfigurations = 0;
            0
        };
        debug!("found {} configuration(s) (active conf: {})", num_configurations, conn.current_configuration);

        if conn.device_address > u8::MAX as u16 {
            error!("device address overflow for '{}'", device_id);
        }
        let address = (conn.device_address as u8).wrapping_add(1);
        if address == 1 {
            error!("device address collision with root hub for '{}'", device_id);
        }
        let speed = Speed::from_os(conn.speed).unwrap_or_else(|| {
            warn!("got unknown device speed {}", conn.speed);
            Speed::Unknown
        });

        Ok(Placement {
            bus: parent.bus,
            address,
            depth: parent.depth + 1,
            speed,
            descriptor,
            num_configurations,
            active_config: conn.current_configuration,
            configs: configs.unwrap_or_default(),
        })
    }

    fn read_connection(&self, hub: OsHandle, device_id: &str, port: u8) -> Result<(NodeConnectionInfo, Option<Vec<Vec<u8>>>)> {
        let io = &self.platform.os.io;
        let conn = io.node_connection_info(hub, port as u32).map_err(|e| {
            warn!("could not get node connection information for device '{}': {}", device_id, e);
            Error::NoDevice
        })?;
        if !conn.connected {
            error!("device '{}' is no longer connected", device_id);
            return Err(Error::NoDevice);
        }
        let configs = match self.cache_config_descriptors(hub, device_id, port, conn.device_descriptor.bNumConfigurations) {
            Ok(c) => Some(c),
            Err(e) => {
                info!("configuration descriptors of '{}' not cached: {}", device_id, e);
                None
            }
        };
        Ok((conn, configs))
    }

    fn cache_config_descriptors(&self, hub: OsHandle, device_id: &str, port: u8, count: u8) -> Result<Vec<Vec<u8>>> {
        if count == 0 {
            return Err(Error::InvalidParam);
        }
        let io = &self.platform.os.io;
        let mut configs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let request = |length: u16| ControlSetup {
                request_type: ENDPOINT_IN,
                request: REQUEST_GET_DESCRIPTOR,
                value: ((DT_CONFIG as u16) << 8) | i as u16,
                index: i as u16,
                length,
            };
            let short = io.descriptor_from_node_connection(hub, port as u32, request(CONFIG_DESCRIPTOR_SIZE as u16))
                .map_err(|e| Error::Io(format!("configuration descriptor (dummy) of '{}': {}", device_id, e)))?;
            if short.len() != CONFIG_DESCRIPTOR_SIZE {
                return Err(Error::Io(format!("unexpected configuration descriptor size (dummy) for '{}'", device_id)));
            }
            let total = config_total_length(&short)?;
            if (total as usize) < CONFIG_DESCRIPTOR_SIZE {
                return Err(Error::Io(format!("unexpected configuration descriptor size (dummy) for '{}'", device_id)));
            }

            let full = io.descriptor_from_node_connection(hub, port as u32, request(total))
                .map_err(|e| {
                    error!("could not access configuration descriptor (actual) for '{}': {}", device_id, e);
                    Error::Io(e.to_string())
                })?;
            if full.len() != total as usize || config_total_length(&full).ok() != Some(total) {
                error!("unexpected configuration descriptor size (actual) for '{}'", device_id);
                return Err(Error::Io("configuration descriptor size mismatch".to_string()));
            }
            debug!("cached config descriptor {} (bConfigurationValue={}, {} bytes)", i, full[5], total);
            configs.push(full);
        }
        Ok(configs)
    }

    /// Root hubs get a made-up descriptor; their bus is the host controller's first-seen order.
    fn init_root_hub(&self, inst: DevInst, device_id: &str) -> Result<Placement> {
        let tree = &self.platform.os.tree;
        let hcd_id = tree.parent(inst).and_then(|p| tree.device_id(p)).ok_or_else(|| {
            error!("could not retrieve host controller device id for root hub '{}'", device_id);
            Error::NotFound
        })?;

        let bus = {
            let mut hcds = self.platform.host_controllers.lock()?;
            match hcds.iter().position(|h| *h == hcd_id) {
                Some(i) => i + 1,
                None if hcds.len() < self.platform.config.max_host_controllers => {
                    hcds.push(hcd_id.clone());
                    hcds.len()
                }
                None => {
                    error!("too many host controllers, cannot place '{}'", hcd_id);
                    return Err(Error::NoDevice);
                }
            }
        };
        if bus > u8::MAX as usize {
            error!("unable to determine bus number of root hub '{}'", device_id);
            return Err(Error::NotFound);
        }

        let (vid, pid) = parse_pci_id(&hcd_id).unwrap_or_else(|| {
            warn!("could not infer VID/PID of HCD root hub from '{}'", hcd_id);
            (0x1d6b, 1)
        });
        let descriptor = DeviceDescriptor {
            bLength: DEVICE_DESCRIPTOR_SIZE as u8,
            bDescriptorType: DT_DEVICE,
            bDeviceClass: CLASS_HUB,
            idVendor: vid,
            idProduct: pid,
            bNumConfigurations: 1,
            ..Default::default()
        };
        debug!("(bus: {}, addr: 1, depth: 0, port: 0): '{}'", bus, device_id);
        Ok(Placement {
            bus: bus as u8,
            address: 1,
            depth: 0,
            speed: Speed::Unknown,
            descriptor,
            num_configurations: 1,
            active_config: 1,
            configs: vec![],
        })
    }

    /// Mark a device gone and drop it from the context.
    pub(crate) fn disconnect_locked(&self, session: SessionId) -> Result<Option<Arc<UsbDevice>>> {
        let dev = match self.sessions.write()?.remove(&session) {
            Some(d) => d,
            None => return Ok(None),
        };
        dev.connected.store(false, std::sync::atomic::Ordering::Release);
        info!("{} disconnected", dev);
        Ok(Some(dev))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use super::*;
    use crate::platform::Platform;
    use crate::sim::SimOs;
    use crate::utils::test::init;

    fn platform(sim: &Arc<SimOs>) -> Platform {
        Platform::builder().hotplug(false).build(sim.services()).unwrap()
    }

    #[test]
    fn pci_ids() {
        assert_eq!(parse_pci_id("PCI\\VEN_8086&DEV_A36D&SUBSYS_1"), Some((0x8086, 0xa36d)));
        assert_eq!(parse_pci_id("ACPI\\PNP0A08\\1"), None);
        assert_eq!(parse_pci_id("PCI\\VEN_80&DEV_A36D"), None);
    }

    #[test]
    fn tree_is_rebuilt_bottom_up() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let hub = sim.add_hub(root, 2, "USB\\VID_05E3&PID_0610\\5&1");
        sim.add_device(hub, 3, "USB\\VID_1234&PID_5678\\6&1", 0x1234, 0x5678);

        let ctx = platform(&sim).new_context().unwrap();
        let devices = ctx.device_list().unwrap();
        assert_eq!(devices.len(), 3);

        let root_dev = devices.iter().find(|d| d.port_number() == 0).unwrap();
        assert_eq!(root_dev.device_address(), 1);
        assert_eq!(root_dev.depth(), 0);
        assert_eq!(root_dev.bus_number(), 1);
        assert_eq!(root_dev.vid(), 0x8086);
        assert_eq!(root_dev.pid(), 0xa36d);
        assert_eq!(root_dev.backend(), Backend::Hub);

        let dev = devices.iter().find(|d| d.vid() == 0x1234).unwrap();
        let parent = dev.parent().unwrap();
        assert_eq!(parent.vid(), 0x05e3);
        assert_eq!(dev.bus_number(), parent.bus_number());
        assert_eq!(dev.depth(), parent.depth() + 1);
        assert_ne!(dev.device_address(), 1);
        assert_eq!(dev.port_number(), 3);
        assert_eq!(dev.num_configurations(), 1);
        assert_eq!(dev.get_config_descriptor(0).unwrap().bConfigurationValue, 1);
        assert_eq!(dev.get_raw_config_descriptor(1), Err(Error::InvalidParam));
    }

    #[test]
    fn enumeration_is_idempotent() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_0001\\A", 0x1234, 0x0001);

        let ctx = platform(&sim).context_builder().no_initial_scan().build().unwrap();
        let first = ctx.enumerate_device("USB\\VID_1234&PID_0001\\A", &GUID_DEVINTERFACE_USB_DEVICE).unwrap();
        let second = ctx.enumerate_device("USB\\VID_1234&PID_0001\\A", &GUID_DEVINTERFACE_USB_DEVICE).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // the parent hub was pulled in on demand
        assert_eq!(ctx.device_list().unwrap().len(), 2);
        ctx.scan_devices().unwrap();
        assert_eq!(ctx.device_list().unwrap().len(), 2);
    }

    #[test]
    fn bus_numbers_follow_host_controllers() {
        init();
        let sim = SimOs::new();
        let r1 = sim.add_root_hub("PCI\\VEN_8086&DEV_0001\\1", "USB\\ROOT_HUB30\\R1");
        let r2 = sim.add_root_hub("ACPI\\XHC\\2", "USB\\ROOT_HUB30\\R2");
        sim.add_device(r2, 1, "USB\\VID_0001&PID_0002\\X", 1, 2);
        sim.add_device(r1, 1, "USB\\VID_0001&PID_0003\\Y", 1, 3);

        let platform = platform(&sim);
        let a = platform.new_context().unwrap();
        let b = platform.new_context().unwrap();
        for ctx in [&a, &b] {
            let list = ctx.device_list().unwrap();
            let x = list.iter().find(|d| d.pid() == 2).unwrap();
            let y = list.iter().find(|d| d.pid() == 3).unwrap();
            assert_eq!(y.bus_number(), 1);
            assert_eq!(x.bus_number(), 2);
            let hub2 = x.parent().unwrap();
            assert_eq!((hub2.vid(), hub2.pid()), (0x1d6b, 1));
        }
    }

    #[test]
    fn broken_devices_are_skipped() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let bad = sim.add_device(root, 1, "USB\\VID_1234&PID_0001\\A", 0x1234, 0x0001);
        sim.set_install_state(bad, 28);
        sim.add_device(root, 2, "USB\\VID_1234&PID_0002\\B", 0x1234, 0x0002);
        sim.set_port_connected(root, 2, false);
        let ok = sim.add_device(root, 3, "USB\\VID_1234&PID_0003\\C", 0x1234, 0x0003);
        sim.break_config_descriptors(ok);

        let ctx = platform(&sim).new_context().unwrap();
        let list = ctx.device_list().unwrap();
        assert_eq!(list.len(), 2);
        let c = list.iter().find(|d| d.pid() == 3).unwrap();
        assert_eq!(c.num_configurations(), 0);
        assert_eq!(c.get_device_descriptor().bNumConfigurations, 0);
        assert_eq!(
            ctx.enumerate_device("USB\\VID_1234&PID_0002\\B", &GUID_DEVINTERFACE_USB_DEVICE).err(),
            Some(Error::NoDevice));
    }

    #[test]
    fn disconnect_reports_a_poisoned_session_map() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_0001\\A", 0x1234, 0x0001);
        let ctx = platform(&sim).new_context().unwrap();
        let dev = ctx.device_list().unwrap().into_iter().find(|d| d.pid() == 1).unwrap();

        assert_eq!(ctx.inner.disconnect_locked(SessionId(0)).map(|d| d.is_some()), Ok(false));

        let inner = ctx.inner.clone();
        let poisoned = std::thread::spawn(move || {
            let _g = inner.sessions.write().unwrap();
            panic!("poisoning the session map");
        }).join();
        assert!(poisoned.is_err());
        assert!(matches!(ctx.inner.disconnect_locked(dev.session_id()), Err(Error::Other(_))));
        assert!(dev.is_connected());
    }
}
