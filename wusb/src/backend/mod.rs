//! Driver stacks able to service a device or one of its interfaces.
//!
//! Every device operation after classification goes through [BackendOps];
//! the only place that looks at the concrete backend is [Backend::ops].
mod composite;
mod direct;
mod hid;
mod unsupported;

use std::fmt::{Display, Formatter};
use std::sync::atomic::AtomicUsize;
use log::debug;
use crate::define::*;
use crate::device::{NodeState, UsbDevice};
use crate::error::*;
use crate::handle::{HandleState, InterfaceHandle};
use crate::os::*;
use crate::platform::PlatformInner;
use crate::transfer::{TransferState, TransferStatus};

/// Sub-backends of the direct access (WinUSB-like) family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SubApi {
    LibusbK,
    Libusb0,
    WinUsb,
}

impl SubApi {
    pub const ALL: [SubApi; 3] = [SubApi::LibusbK, SubApi::Libusb0, SubApi::WinUsb];

    pub fn driver_name(&self) -> &'static str {
        match self {
            SubApi::LibusbK => "libusbK",
            SubApi::Libusb0 => "libusb0",
            SubApi::WinUsb => "WinUSB",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            SubApi::LibusbK => 0,
            SubApi::Libusb0 => 1,
            SubApi::WinUsb => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Enumerable but not operable.
    #[default]
    Unsupported,
    Hub,
    Composite,
    DirectAccess(SubApi),
    Hid,
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::DirectAccess(sub) => write!(f, "{}", sub.driver_name()),
            other => write!(f, "{}", other.ops().name()),
        }
    }
}

const HUB_DRIVERS: &[&str] = &[
    "USBHUB", "USBHUB3", "NUSB3HUB", "RUSB3HUB", "FLXHCIH",
    "TIHUB3", "ETRONHUB3", "VIAHUB3", "ASMTHUB3", "IUSB3HUB",
];
const COMPOSITE_DRIVERS: &[&str] = &["USBCCGP"];
const HID_DRIVERS: &[&str] = &["HIDUSB", "MOUHID", "KBDHID"];

static HUB: unsupported::InertBackend = unsupported::InertBackend { name: "hub" };
static UNSUPPORTED: unsupported::InertBackend = unsupported::InertBackend { name: "unsupported" };
static COMPOSITE: composite::CompositeBackend = composite::CompositeBackend;
static LIBUSBK: direct::DirectBackend = direct::DirectBackend(SubApi::LibusbK);
static LIBUSB0: direct::DirectBackend = direct::DirectBackend(SubApi::Libusb0);
static WINUSB: direct::DirectBackend = direct::DirectBackend(SubApi::WinUsb);
static HID: hid::HidBackend = hid::HidBackend;

impl Backend {
    /// Whether both backends belong to the same family, ignoring the sub-backend.
    pub fn same_family(&self, other: &Backend) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub(crate) fn ops(&self) -> &'static dyn BackendOps {
        match self {
            Backend::Unsupported => &UNSUPPORTED,
            Backend::Hub => &HUB,
            Backend::Composite => &COMPOSITE,
            Backend::DirectAccess(SubApi::LibusbK) => &LIBUSBK,
            Backend::DirectAccess(SubApi::Libusb0) => &LIBUSB0,
            Backend::DirectAccess(SubApi::WinUsb) => &WINUSB,
            Backend::Hid => &HID,
        }
    }

    /// Backends whose availability is probed once per platform.
    pub(crate) fn probed() -> [Backend; 4] {
        [
            Backend::DirectAccess(SubApi::LibusbK),
            Backend::DirectAccess(SubApi::Libusb0),
            Backend::DirectAccess(SubApi::WinUsb),
            Backend::Hid,
        ]
    }
}

fn lookup(names: &[&str], drivers: &[&str]) -> bool {
    names.iter().any(|n| drivers.iter().any(|d| d.eq_ignore_ascii_case(n)))
}

/// Pick the backend of `inst` from its driver and filter bindings.
pub(crate) fn classify(tree: &dyn DeviceTree, inst: DevInst) -> Backend {
    let bindings: Vec<(&str, Vec<String>)> = [
        ("driver", DeviceProperty::Service),
        ("upper filter driver", DeviceProperty::UpperFilters),
        ("lower filter driver", DeviceProperty::LowerFilters),
    ].into_iter().map(|(designation, prop)| {
        let names = tree.property(inst, prop)
            .map(|v| v.names().into_iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .unwrap_or_default();
        if !names.is_empty() {
            debug!("{}(s): {}", designation, names.join(";"));
        }
        (designation, names)
    }).collect();

    let mut families: Vec<(Backend, Vec<&str>)> = vec![
        (Backend::Hub, HUB_DRIVERS.to_vec()),
        (Backend::Composite, COMPOSITE_DRIVERS.to_vec()),
    ];
    for sub in SubApi::ALL {
        families.push((Backend::DirectAccess(sub), vec![sub.driver_name()]));
    }
    families.push((Backend::Hid, HID_DRIVERS.to_vec()));

    for (backend, drivers) in families {
        for (designation, names) in &bindings {
            let names: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            if lookup(&names, &drivers) {
                debug!("matched {} name against {} API", designation, backend);
                return backend;
            }
        }
    }
    Backend::Unsupported
}

/// Everything a backend operation may touch while the handle and node are locked.
pub(crate) struct OpCtx<'a> {
    pub(crate) platform: &'a PlatformInner,
    pub(crate) device: &'a UsbDevice,
    pub(crate) node: &'a mut NodeState,
    pub(crate) handle: &'a mut HandleState,
    pub(crate) autoclaim: &'a [AtomicUsize; MAX_INTERFACES],
}

impl OpCtx<'_> {
    pub(crate) fn os(&self) -> &OsServices {
        &self.platform.os
    }
}

pub(crate) trait BackendOps: Sync {
    fn name(&self) -> &'static str;

    /// Probe the user mode library, `false` when it cannot be used.
    fn init(&self, os: &OsServices) -> bool;

    fn open(&self, ctx: &mut OpCtx) -> Result;

    fn close(&self, ctx: &mut OpCtx);

    /// Free the OS handles of one interface.
    fn close_interface(&self, _os: &OsServices, _h: InterfaceHandle) {}

    fn configure_endpoints(&self, ctx: &mut OpCtx, iface: usize) -> Result;

    fn claim_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result;

    fn release_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result;

    fn set_interface_altsetting(&self, ctx: &mut OpCtx, iface: usize, alt: u8) -> Result;

    fn clear_halt(&self, ctx: &mut OpCtx, endpoint: u8) -> Result;

    fn reset_device(&self, ctx: &mut OpCtx) -> Result;

    fn submit_control(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted>;

    fn submit_bulk(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted>;

    fn submit_iso(&self, _ctx: &mut OpCtx, _t: &mut TransferState) -> Result<Submitted> {
        Err(Error::NotSupported)
    }

    fn abort_control(&self, ctx: &mut OpCtx, t: &TransferState) -> Result;

    fn abort_transfers(&self, ctx: &mut OpCtx, t: &TransferState) -> Result;

    /// Move completed data into the transfer and report its final status.
    fn copy_transfer_data(&self, ctx: &mut OpCtx, t: &mut TransferState, completion: IoCompletion) -> TransferStatus;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimOs;

    #[test]
    fn driver_precedence() {
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D", "USB\\ROOT_HUB30\\1");
        let a = sim.add_device(root, 1, "USB\\VID_0001&PID_0001\\A", 0x0001, 0x0001);
        sim.set_driver(a, "WinUSB");
        assert_eq!(classify(&*sim, a), Backend::DirectAccess(SubApi::WinUsb));

        // an earlier family wins even when only a filter names it
        let b = sim.add_device(root, 2, "USB\\VID_0001&PID_0002\\B", 0x0001, 0x0002);
        sim.set_driver(b, "HidUsb");
        sim.set_upper_filters(b, &["libusb0"]);
        assert_eq!(classify(&*sim, b), Backend::DirectAccess(SubApi::Libusb0));

        let c = sim.add_device(root, 3, "USB\\VID_0001&PID_0003\\C", 0x0001, 0x0003);
        sim.set_driver(c, "usbccgp");
        assert_eq!(classify(&*sim, c), Backend::Composite);

        let d = sim.add_device(root, 4, "USB\\VID_0001&PID_0004\\D", 0x0001, 0x0004);
        sim.set_driver(d, "usbser");
        assert_eq!(classify(&*sim, d), Backend::Unsupported);

        assert_eq!(classify(&*sim, root), Backend::Hub);
    }

    #[test]
    fn family_ignores_sub_backend() {
        assert!(Backend::DirectAccess(SubApi::WinUsb).same_family(&Backend::DirectAccess(SubApi::LibusbK)));
        assert!(!Backend::Hid.same_family(&Backend::Composite));
        assert_eq!(Backend::DirectAccess(SubApi::Libusb0).to_string(), "libusb0");
    }
}
