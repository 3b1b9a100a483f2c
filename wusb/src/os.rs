//! Capabilities consumed from the operating system.
//!
//! Every query the core needs from the device tree, the raw I/O layer and the
//! driver-specific user mode libraries goes through one of these traits. They
//! are bundled in [OsServices] and handed to [crate::Platform] at build time.
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::channel::mpsc::UnboundedSender;
use crate::backend::SubApi;
use crate::define::*;
use crate::descriptor::DeviceDescriptor;
use crate::error::*;
use crate::hotplug::DeviceChange;

pub type OsResult<T = ()> = std::result::Result<T, OsError>;

/// Opaque device node handle in the OS device tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevInst(pub u32);

/// An open OS handle: a file, a driver API handle or a HID handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OsHandle(pub u64);

/// One asynchronous operation awaiting OS completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IoToken(pub u64);

impl Display for IoToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    InstallState,
    /// Port number on the parent hub.
    Address,
    Service,
    UpperFilters,
    LowerFilters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Number(u32),
    Text(String),
    TextList(Vec<String>),
}

impl PropertyValue {
    pub fn as_number(&self) -> Option<u32> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Driver names carried by a service or filter property.
    pub fn names(&self) -> Vec<&str> {
        match self {
            PropertyValue::Number(_) => vec![],
            PropertyValue::Text(s) => vec![s.as_str()],
            PropertyValue::TextList(l) => l.iter().map(|s| s.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInterfaceInfo {
    /// Device node exposing the interface.
    pub inst: DevInst,
    /// Raw interface path as reported by the OS.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConnectionInfo {
    pub connected: bool,
    pub device_descriptor: DeviceDescriptor,
    pub current_configuration: u8,
    pub speed: u8,
    pub device_address: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    /// No read or write rights, enough for feature reports on system HID devices.
    QueryOnly,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    GenFailure,
    SemTimeout,
    OperationAborted,
    Failed(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub transferred: usize,
    /// Bytes read by the operation, empty for writes.
    pub data: Vec<u8>,
}

impl IoCompletion {
    pub fn success(transferred: usize, data: Vec<u8>) -> Self {
        Self { status: IoStatus::Success, transferred, data }
    }

    pub fn with_status(status: IoStatus) -> Self {
        Self { status, transferred: 0, data: vec![] }
    }
}

/// Result of starting an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Pending(IoToken),
    /// Completed before the call returned.
    Immediate(IoCompletion),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipePolicy {
    TransferTimeout(u32),
    ShortPacketTerminate(bool),
    IgnoreShortPackets(bool),
    AllowPartialReads(bool),
    AutoClearStall(bool),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct HidAttributes {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HidCaps {
    pub input_report_length: u16,
    pub output_report_length: u16,
    pub feature_report_length: u16,
    /// Report ids of every value capability, per report kind.
    pub input_report_ids: Vec<u8>,
    pub output_report_ids: Vec<u8>,
    pub feature_report_ids: Vec<u8>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HidReportKind {
    Input,
    Output,
    Feature,
}

impl HidReportKind {
    pub(crate) fn from_report_type(report_type: u8) -> Option<Self> {
        match report_type {
            1 => Some(HidReportKind::Input),
            2 => Some(HidReportKind::Output),
            3 => Some(HidReportKind::Feature),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HidString {
    Manufacturer,
    Product,
    SerialNumber,
}

/// What the core learned about a HID device when it was opened.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HidDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub input_report_size: u16,
    pub output_report_size: u16,
    pub feature_report_size: u16,
    /// Input, output, feature.
    pub uses_report_ids: [bool; 3],
    /// Manufacturer, product, serial string indexes from the device descriptor.
    pub string_index: [u8; 3],
    pub strings: [String; 3],
}

pub trait DeviceTree: Send + Sync {
    /// Present device interfaces registered for `guid`.
    fn interfaces_of_class(&self, guid: &Guid) -> Vec<DeviceInterfaceInfo>;
    fn find_device(&self, device_id: &str, present_only: bool) -> Option<DevInst>;
    fn interface_path(&self, inst: DevInst, guid: &Guid) -> Option<String>;
    fn device_id(&self, inst: DevInst) -> Option<String>;
    fn parent(&self, inst: DevInst) -> Option<DevInst>;
    fn first_child(&self, inst: DevInst) -> Option<DevInst>;
    fn next_sibling(&self, inst: DevInst) -> Option<DevInst>;
    fn property(&self, inst: DevInst, property: DeviceProperty) -> Option<PropertyValue>;
    /// A value from the device's registry key.
    fn registry_value(&self, inst: DevInst, name: &str) -> Option<String>;
}

pub trait RawIo: Send + Sync {
    fn open(&self, path: &str, access: Access) -> OsResult<OsHandle>;
    fn close(&self, handle: OsHandle);
    fn node_connection_info(&self, hub: OsHandle, port: u32) -> OsResult<NodeConnectionInfo>;
    /// Run a GET_DESCRIPTOR request on the device behind `port` of `hub`.
    fn descriptor_from_node_connection(&self, hub: OsHandle, port: u32, setup: ControlSetup) -> OsResult<Vec<u8>>;
    /// Abort every pending operation issued on `handle`.
    fn cancel_io(&self, handle: OsHandle) -> OsResult;
    /// Wait up to `timeout` and return the tokens whose operation finished.
    fn poll(&self, tokens: &[IoToken], timeout: Duration) -> Vec<IoToken>;
    /// Outcome of a finished operation, `None` while it is still pending.
    fn io_result(&self, token: IoToken) -> Option<IoCompletion>;
    fn release_token(&self, token: IoToken);
}

/// The WinUSB-like family; every call names the sub-backend serving it.
pub trait DirectAccessIo: Send + Sync {
    fn available(&self, sub: SubApi) -> bool;
    fn initialize(&self, sub: SubApi, file: OsHandle) -> OsResult<OsHandle>;
    fn associated_interface(&self, sub: SubApi, api: OsHandle, index: u8) -> OsResult<OsHandle>;
    fn free(&self, sub: SubApi, api: OsHandle);
    fn set_pipe_policy(&self, sub: SubApi, api: OsHandle, endpoint: u8, policy: PipePolicy) -> OsResult;
    fn set_current_alternate_setting(&self, sub: SubApi, api: OsHandle, alt: u8) -> OsResult;
    fn control_transfer(&self, sub: SubApi, api: OsHandle, setup: ControlSetup, data: &[u8]) -> OsResult<Submitted>;
    fn read_pipe(&self, sub: SubApi, api: OsHandle, endpoint: u8, length: usize) -> OsResult<Submitted>;
    fn write_pipe(&self, sub: SubApi, api: OsHandle, endpoint: u8, data: &[u8]) -> OsResult<Submitted>;
    fn abort_pipe(&self, sub: SubApi, api: OsHandle, endpoint: u8) -> OsResult;
    fn reset_pipe(&self, sub: SubApi, api: OsHandle, endpoint: u8) -> OsResult;
    fn flush_pipe(&self, sub: SubApi, api: OsHandle, endpoint: u8) -> OsResult;
    fn supports_reset_device(&self, sub: SubApi) -> bool;
    fn reset_device(&self, sub: SubApi, api: OsHandle) -> OsResult;
}

pub trait HidIo: Send + Sync {
    fn available(&self) -> bool;
    fn hid_guid(&self) -> Guid;
    fn attributes(&self, handle: OsHandle) -> OsResult<HidAttributes>;
    fn set_num_input_buffers(&self, handle: OsHandle, count: u32) -> bool;
    fn caps(&self, handle: OsHandle) -> OsResult<HidCaps>;
    fn string(&self, handle: OsHandle, which: HidString) -> Option<String>;
    /// Read one report; `length` includes the report id byte.
    fn read_report(&self, handle: OsHandle, length: usize) -> OsResult<Submitted>;
    fn write_report(&self, handle: OsHandle, data: &[u8]) -> OsResult<Submitted>;
    /// `length` includes the report id byte.
    fn get_report(&self, handle: OsHandle, kind: HidReportKind, id: u8, length: usize) -> OsResult<Submitted>;
    fn set_report(&self, handle: OsHandle, kind: HidReportKind, data: &[u8]) -> OsResult<Submitted>;
    fn physical_descriptor(&self, handle: OsHandle, length: usize) -> OsResult<Vec<u8>>;
    fn flush_queue(&self, handle: OsHandle) -> OsResult;
}

/// Builds USB descriptors for devices only reachable through the HID stack.
pub trait HidDescriptorSource: Send + Sync {
    fn descriptor(&self, device: &HidDeviceInfo, descriptor_type: u8, index: u8, max_length: usize) -> Result<Vec<u8>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub trait ChangeNotifier: Send + Sync {
    /// Deliver future device-change notifications to `sender`.
    fn subscribe(&self, sender: UnboundedSender<DeviceChange>) -> Result;
}

#[derive(Clone)]
pub struct OsServices {
    pub tree: Arc<dyn DeviceTree>,
    pub io: Arc<dyn RawIo>,
    pub direct: Arc<dyn DirectAccessIo>,
    pub hid: Arc<dyn HidIo>,
    pub hid_descriptors: Arc<dyn HidDescriptorSource>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn ChangeNotifier>,
}
