use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use crate::backend::Backend;
use crate::context::ContextInner;
use crate::define::*;
use crate::descriptor::*;
use crate::error::*;
use crate::handle::DeviceHandle;
use crate::os::{DevInst, HidDeviceInfo};
use crate::registry::SessionId;
use crate::slots::InterfaceSlots;

/// Mutable part of a device node, shared by hotplug and every open handle.
pub(crate) struct NodeState {
    pub(crate) active_config: u8,
    pub(crate) slots: InterfaceSlots,
    pub(crate) hid: Option<HidDeviceInfo>,
}

/// One physical USB device known to a context.
pub struct UsbDevice {
    pub(crate) session: SessionId,
    pub(crate) device_id: String,
    pub(crate) inst: DevInst,
    pub(crate) path: String,
    pub(crate) backend: Backend,
    pub(crate) parent: Option<Weak<UsbDevice>>,
    pub(crate) ctx: Weak<ContextInner>,
    pub(crate) bus: u8,
    pub(crate) address: u8,
    pub(crate) port: u8,
    pub(crate) depth: u8,
    pub(crate) speed: Speed,
    pub(crate) descriptor: DeviceDescriptor,
    pub(crate) num_configurations: u8,
    pub(crate) configs: Vec<Vec<u8>>,
    pub(crate) node: Mutex<NodeState>,
    pub(crate) connected: AtomicBool,
}

impl Display for UsbDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "USB device [0x{:04X}:0x{:04X}], bus: {}, address: {}, session: {}",
               self.descriptor.idVendor, self.descriptor.idProduct,
               self.bus, self.address, self.session)
    }
}

impl UsbDevice {
    pub(crate) fn lock_node(&self) -> Result<MutexGuard<'_, NodeState>> {
        Ok(self.node.lock()?)
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// OS instance id, `USB\VID_xxxx&PID_xxxx\...`.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn vid(&self) -> u16 {
        self.descriptor.idVendor
    }

    pub fn pid(&self) -> u16 {
        self.descriptor.idProduct
    }

    pub fn bus_number(&self) -> u8 {
        self.bus
    }

    pub fn device_address(&self) -> u8 {
        self.address
    }

    /// Port on the parent hub, 0 for a root hub.
    pub fn port_number(&self) -> u8 {
        self.port
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn parent(&self) -> Option<Arc<UsbDevice>> {
        self.parent.as_ref().and_then(|p| p.upgrade())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn get_device_descriptor(&self) -> DeviceDescriptor {
        self.descriptor
    }

    pub fn num_configurations(&self) -> u8 {
        self.num_configurations
    }

    pub fn active_configuration(&self) -> Result<u8> {
        Ok(self.lock_node()?.active_config)
    }

    /// Raw bytes of the configuration descriptor at `index`.
    pub fn get_raw_config_descriptor(&self, index: u8) -> Result<&[u8]> {
        if index >= self.num_configurations {
            return Err(Error::InvalidParam);
        }
        self.configs.get(index as usize).map(|c| c.as_slice()).ok_or(Error::NotFound)
    }

    pub fn get_config_descriptor(&self, index: u8) -> Result<ConfigDescriptor> {
        ConfigDescriptor::parse(self.get_raw_config_descriptor(index)?)
    }

    pub fn get_active_config_descriptor(&self) -> Result<ConfigDescriptor> {
        let active = self.active_configuration()?;
        if active == 0 {
            return Err(Error::NotFound);
        }
        let raw = self.configs.iter()
            .find(|c| c.len() >= CONFIG_DESCRIPTOR_SIZE && c[5] == active)
            .ok_or(Error::NotFound)?;
        ConfigDescriptor::parse(raw)
    }

    /// A snapshot of the interface slots.
    pub fn interface_slots(&self) -> Result<InterfaceSlots> {
        Ok(self.lock_node()?.slots.clone())
    }

    /// HID attributes learned when the device was last opened.
    pub fn hid_info(&self) -> Result<Option<HidDeviceInfo>> {
        Ok(self.lock_node()?.hid.clone())
    }

    pub fn open(self: &Arc<Self>) -> Result<DeviceHandle> {
        if !self.is_connected() {
            return Err(Error::NoDevice);
        }
        let ctx = self.ctx.upgrade().ok_or(Error::NoDevice)?;
        DeviceHandle::open(ctx, self.clone())
    }
}
