//! An in-memory operating system.
//!
//! [SimOs] implements every capability trait of [crate::os] over a small
//! device tree built by hand, so enumeration, hotplug, claims and transfers
//! can run without hardware. Reads stay pending until data is queued with
//! [SimOs::queue_read] or [SimOs::queue_hid_report], or until they are
//! aborted.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use futures::channel::mpsc::UnboundedSender;
use log::{debug, trace};
use crate::backend::SubApi;
use crate::define::*;
use crate::descriptor::*;
use crate::error::*;
use crate::hotplug::{DeviceChange, DeviceEvent};
use crate::os::*;
use crate::registry::sanitize_path;

/// One call made against the simulated driver stacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Open(String, Access),
    ControlTransfer(ControlSetup),
    ReadPipe(u8, usize),
    WritePipe(u8, Vec<u8>),
    PipePolicy(u8, PipePolicy),
    SetAltSetting(u8),
    AbortPipe(u8),
    ResetPipe(u8),
    FlushPipe(u8),
    ResetDevice,
    SetInputBuffers(u32),
    ReadReport(usize),
    WriteReport(Vec<u8>),
    GetReport(HidReportKind, u8, usize),
    SetReport(HidReportKind, Vec<u8>),
    FlushQueue,
    CancelIo,
}

const HID_GUID: Guid = Guid::new(
    0x4d1e55b2, 0xf16f, 0x11cf, [0x88, 0xcb, 0x00, 0x11, 0x11, 0x00, 0x00, 0x30]);
const MAX_INPUT_BUFFERS: u32 = 512;

struct SimPort {
    connected: bool,
    broken: bool,
    speed: u8,
    descriptor: DeviceDescriptor,
    configs: Vec<Vec<u8>>,
}

struct SimNode {
    device_id: String,
    parent: Option<DevInst>,
    children: Vec<DevInst>,
    present: bool,
    install_state: u32,
    address: u32,
    service: Option<String>,
    upper_filters: Vec<String>,
    registry: HashMap<String, String>,
    interfaces: Vec<(Guid, String)>,
    port: Option<SimPort>,
    hid: Option<(HidAttributes, HidCaps)>,
}

enum SimHandle {
    File(DevInst),
    Api { inst: DevInst, iface: u8 },
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum ReadSource {
    Pipe(u8),
    Report,
}

struct SimIo {
    handle: OsHandle,
    endpoint: Option<u8>,
    waiting: Option<(ReadSource, usize)>,
    result: Option<IoCompletion>,
}

#[derive(Default)]
struct SimState {
    nodes: Vec<SimNode>,
    handles: HashMap<u64, SimHandle>,
    next_handle: u64,
    ios: BTreeMap<u64, SimIo>,
    next_token: u64,
    pipe_data: HashMap<u8, VecDeque<Vec<u8>>>,
    reports: VecDeque<Vec<u8>>,
    control_data: VecDeque<Vec<u8>>,
    fail_next: Option<IoStatus>,
    calls: Vec<SimCall>,
    denied: HashSet<String>,
    unavailable: HashSet<SubApi>,
    hid_unavailable: bool,
    subscribers: Vec<UnboundedSender<DeviceChange>>,
    clock_offset: Duration,
}

impl SimState {
    fn node(&self, inst: DevInst) -> Option<&SimNode> {
        self.nodes.get(inst.0 as usize)
    }

    fn node_mut(&mut self, inst: DevInst) -> Option<&mut SimNode> {
        self.nodes.get_mut(inst.0 as usize)
    }

    fn add_node(&mut self, device_id: &str, parent: Option<DevInst>) -> DevInst {
        let inst = DevInst(self.nodes.len() as u32);
        self.nodes.push(SimNode {
            device_id: device_id.to_string(),
            parent,
            children: vec![],
            present: true,
            install_state: 0,
            address: 0,
            service: None,
            upper_filters: vec![],
            registry: HashMap::new(),
            interfaces: vec![],
            port: None,
            hid: None,
        });
        if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
            p.children.push(inst);
        }
        inst
    }

    fn register(&mut self, inst: DevInst, guid: Guid) {
        if let Some(n) = self.node_mut(inst) {
            let path = format!("\\\\?\\{}#{}", n.device_id.replace('\\', "#"), guid);
            n.interfaces.push((guid, path));
        }
    }

    fn new_handle(&mut self, handle: SimHandle) -> OsHandle {
        self.next_handle += 1;
        self.handles.insert(self.next_handle, handle);
        OsHandle(self.next_handle)
    }

    fn file_node(&self, handle: OsHandle) -> OsResult<DevInst> {
        match self.handles.get(&handle.0) {
            Some(SimHandle::File(inst)) => Ok(*inst),
            Some(SimHandle::Api { inst, .. }) => Ok(*inst),
            None => Err(OsError::Code(6)),
        }
    }

    /// Child of `hub` sitting on `port`.
    fn port_child(&self, hub: OsHandle, port: u32) -> OsResult<&SimNode> {
        let hub = self.file_node(hub)?;
        let node = self.node(hub).ok_or(OsError::Code(6))?;
        node.children.iter()
            .filter_map(|c| self.node(*c))
            .find(|c| c.present && c.address == port && c.port.is_some())
            .ok_or(OsError::Code(87))
    }

    /// Connection data of `inst` or of the closest parent that has some.
    fn port_of(&self, inst: DevInst) -> Option<&SimPort> {
        let mut cur = Some(inst);
        while let Some(i) = cur {
            let n = self.node(i)?;
            if let Some(p) = &n.port {
                return Some(p);
            }
            cur = n.parent;
        }
        None
    }

    fn start_io(&mut self, handle: OsHandle, endpoint: Option<u8>, waiting: Option<(ReadSource, usize)>, result: Option<IoCompletion>) -> Submitted {
        self.next_token += 1;
        let result = match self.fail_next.take() {
            Some(status) => Some(IoCompletion::with_status(status)),
            None => result,
        };
        let waiting = if result.is_some() { None } else { waiting };
        self.ios.insert(self.next_token, SimIo { handle, endpoint, waiting, result });
        Submitted::Pending(IoToken(self.next_token))
    }

    /// Start a read that finishes now if data is queued for `source`.
    fn start_read(&mut self, handle: OsHandle, endpoint: Option<u8>, source: ReadSource, length: usize) -> Submitted {
        let queued = match source {
            ReadSource::Pipe(ep) => self.pipe_data.get_mut(&ep).and_then(|q| q.pop_front()),
            ReadSource::Report => self.reports.pop_front(),
        };
        let result = queued.map(|mut data| {
            data.truncate(length);
            IoCompletion::success(data.len(), data)
        });
        self.start_io(handle, endpoint, Some((source, length)), result)
    }

    /// Hand `data` to the oldest read waiting on `source`, or queue it.
    fn deliver(&mut self, source: ReadSource, mut data: Vec<u8>) {
        let waiting = self.ios.values_mut()
            .find(|io| io.result.is_none() && io.waiting.map(|(s, _)| s) == Some(source));
        match waiting {
            Some(io) => {
                if let Some((_, length)) = io.waiting.take() {
                    data.truncate(length);
                }
                io.result = Some(IoCompletion::success(data.len(), data));
            }
            None => match source {
                ReadSource::Pipe(ep) => self.pipe_data.entry(ep).or_default().push_back(data),
                ReadSource::Report => self.reports.push_back(data),
            },
        }
    }

    fn abort<F: Fn(&SimIo) -> bool>(&mut self, f: F) -> usize {
        let mut n = 0;
        for io in self.ios.values_mut() {
            if io.result.is_none() && f(&*io) {
                io.waiting = None;
                io.result = Some(IoCompletion::with_status(IoStatus::OperationAborted));
                n += 1;
            }
        }
        n
    }

    fn hid_of(&self, handle: OsHandle) -> OsResult<&(HidAttributes, HidCaps)> {
        let inst = self.file_node(handle)?;
        self.node(inst).and_then(|n| n.hid.as_ref()).ok_or(OsError::Code(1))
    }
}

/// `VID_xxxx` and `PID_xxxx` embedded in an instance id.
fn ids_from(device_id: &str) -> (u16, u16) {
    let field = |key: &str| {
        let upper = device_id.to_uppercase();
        let pos = upper.find(key)?;
        u16::from_str_radix(upper.get(pos + key.len()..pos + key.len() + 4)?, 16).ok()
    };
    (field("VID_").unwrap_or(0), field("PID_").unwrap_or(0))
}

fn with_total_length(mut buf: Vec<u8>) -> Vec<u8> {
    let total = buf.len() as u16;
    buf[2..4].copy_from_slice(&total.to_le_bytes());
    buf
}

/// Two vendor interfaces: bulk 0x81/0x02 (alternate 1: bulk 0x84) and interrupt 0x83.
fn default_config() -> Vec<u8> {
    with_total_length(vec![
        9, DT_CONFIG, 0, 0, 2, 1, 0, 0x80, 50,
        9, DT_INTERFACE, 0, 0, 2, 0xff, 0, 0, 0,
        7, DT_ENDPOINT, 0x81, 2, 0x00, 0x02, 0,
        7, DT_ENDPOINT, 0x02, 2, 0x00, 0x02, 0,
        9, DT_INTERFACE, 0, 1, 1, 0xff, 0, 0, 0,
        7, DT_ENDPOINT, 0x84, 2, 0x00, 0x02, 0,
        9, DT_INTERFACE, 1, 0, 1, 0xff, 0, 0, 0,
        7, DT_ENDPOINT, 0x83, 3, 0x08, 0, 10,
    ])
}

fn hub_config() -> Vec<u8> {
    with_total_length(vec![
        9, DT_CONFIG, 0, 0, 1, 1, 0, 0xe0, 0,
        9, DT_INTERFACE, 0, 0, 1, CLASS_HUB, 0, 0, 0,
        7, DT_ENDPOINT, 0x81, 3, 0x02, 0, 12,
    ])
}

fn device_descriptor(class: u8, vid: u16, pid: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        bLength: DEVICE_DESCRIPTOR_SIZE as u8,
        bDescriptorType: DT_DEVICE,
        bcdUSB: 0x0200,
        bDeviceClass: class,
        bMaxPacketSize0: 64,
        idVendor: vid,
        idProduct: pid,
        bcdDevice: 0x0100,
        iManufacturer: 1,
        iProduct: 2,
        iSerialNumber: 3,
        bNumConfigurations: 1,
        ..Default::default()
    }
}

fn string_descriptor(text: &str) -> Vec<u8> {
    let mut buf = vec![0, DT_STRING];
    for unit in text.encode_utf16() {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf[0] = buf.len() as u8;
    buf
}

pub struct SimOs {
    state: Mutex<SimState>,
    cond: Condvar,
    start: Instant,
}

impl SimOs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
            cond: Condvar::new(),
            start: Instant::now(),
        })
    }

    /// Every capability of the simulator, ready for [crate::Platform::new].
    pub fn services(self: &Arc<Self>) -> OsServices {
        OsServices {
            tree: self.clone(),
            io: self.clone(),
            direct: self.clone(),
            hid: self.clone(),
            hid_descriptors: self.clone(),
            clock: self.clone(),
            notifier: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    fn update<O, F: FnOnce(&mut SimState) -> O>(&self, f: F) -> O {
        let r = f(&mut self.lock());
        self.cond.notify_all();
        r
    }

    fn record(&self, call: SimCall) {
        trace!("sim: {:?}", call);
        self.lock().calls.push(call);
    }

    fn with_node<F: FnOnce(&mut SimNode)>(&self, inst: DevInst, f: F) {
        if let Some(n) = self.lock().node_mut(inst) {
            f(n);
        }
    }

    pub fn hid_guid(&self) -> Guid {
        HID_GUID
    }

    /// A host controller and its root hub; returns the root hub.
    pub fn add_root_hub(&self, hcd_id: &str, device_id: &str) -> DevInst {
        let mut st = self.lock();
        let hcd = st.add_node(hcd_id, None);
        let hub = st.add_node(device_id, Some(hcd));
        if let Some(n) = st.node_mut(hub) {
            n.service = Some("USBHUB3".to_string());
        }
        st.register(hub, GUID_DEVINTERFACE_USB_HUB);
        hub
    }

    pub fn add_hub(&self, parent: DevInst, port: u32, device_id: &str) -> DevInst {
        let (vid, pid) = ids_from(device_id);
        let mut st = self.lock();
        let hub = st.add_node(device_id, Some(parent));
        if let Some(n) = st.node_mut(hub) {
            n.service = Some("USBHUB".to_string());
            n.address = port;
            n.port = Some(SimPort {
                connected: true,
                broken: false,
                speed: 2,
                descriptor: device_descriptor(CLASS_HUB, vid, pid),
                configs: vec![hub_config()],
            });
        }
        st.register(hub, GUID_DEVINTERFACE_USB_HUB);
        hub
    }

    /// A WinUSB device on `port` of `parent`, see [SimOs::set_driver] to rebind it.
    pub fn add_device(&self, parent: DevInst, port: u32, device_id: &str, vid: u16, pid: u16) -> DevInst {
        let mut st = self.lock();
        let dev = st.add_node(device_id, Some(parent));
        if let Some(n) = st.node_mut(dev) {
            n.service = Some("WinUSB".to_string());
            n.address = port;
            n.port = Some(SimPort {
                connected: true,
                broken: false,
                speed: 2,
                descriptor: device_descriptor(0, vid, pid),
                configs: vec![default_config()],
            });
        }
        st.register(dev, GUID_DEVINTERFACE_USB_DEVICE);
        dev
    }

    /// A child interface node bound to `driver`.
    ///
    /// Without `guid` the node gets its own interface class, advertised
    /// through its `DeviceInterfaceGUIDs` registry value.
    pub fn add_interface_node(&self, parent: DevInst, device_id: &str, driver: &str, guid: Option<Guid>) -> DevInst {
        let mut st = self.lock();
        let inst = st.add_node(device_id, Some(parent));
        let guid = match guid {
            Some(g) => g,
            None => {
                let g = Guid::new(0x5157_0000 + inst.0, 0x0001, 0x0002, [0x80, 0, 0, 0, 0, 0, 0, inst.0 as u8]);
                if let Some(n) = st.node_mut(inst) {
                    n.registry.insert("DeviceInterfaceGUIDs".to_string(), g.to_string());
                }
                g
            }
        };
        let is_hid = guid == HID_GUID
            || ["HIDUSB", "MOUHID", "KBDHID"].iter().any(|d| d.eq_ignore_ascii_case(driver));
        let (vendor_id, product_id) = ids_from(device_id);
        if let Some(n) = st.node_mut(inst) {
            n.service = Some(driver.to_string());
            if is_hid {
                n.hid = Some((
                    HidAttributes { vendor_id, product_id, version: 0x0100 },
                    HidCaps {
                        input_report_length: 9,
                        output_report_length: 9,
                        feature_report_length: 9,
                        input_report_ids: vec![0],
                        output_report_ids: vec![0],
                        feature_report_ids: vec![0],
                    },
                ));
            }
        }
        st.register(inst, guid);
        inst
    }

    pub fn set_driver(&self, inst: DevInst, driver: &str) {
        self.with_node(inst, |n| n.service = Some(driver.to_string()));
    }

    pub fn set_upper_filters(&self, inst: DevInst, filters: &[&str]) {
        self.with_node(inst, |n| n.upper_filters = filters.iter().map(|s| s.to_string()).collect());
    }

    /// Non-zero codes report a driver problem.
    pub fn set_install_state(&self, inst: DevInst, code: u32) {
        self.with_node(inst, |n| n.install_state = code);
    }

    pub fn set_port_connected(&self, hub: DevInst, port: u32, connected: bool) {
        let mut st = self.lock();
        let children = st.node(hub).map(|n| n.children.clone()).unwrap_or_default();
        for c in children {
            if let Some(n) = st.node_mut(c) {
                if n.address == port {
                    if let Some(p) = n.port.as_mut() {
                        p.connected = connected;
                    }
                }
            }
        }
    }

    /// Make configuration descriptor requests for `inst` fail.
    pub fn break_config_descriptors(&self, inst: DevInst) {
        self.with_node(inst, |n| {
            if let Some(p) = n.port.as_mut() {
                p.broken = true;
            }
        });
    }

    pub fn set_hid_caps(&self, inst: DevInst, caps: HidCaps) {
        self.with_node(inst, |n| {
            if let Some(hid) = n.hid.as_mut() {
                hid.1 = caps;
            }
        });
    }

    pub fn set_available(&self, sub: SubApi, available: bool) {
        let mut st = self.lock();
        if available {
            st.unavailable.remove(&sub);
        } else {
            st.unavailable.insert(sub);
        }
    }

    pub fn set_hid_available(&self, available: bool) {
        self.lock().hid_unavailable = !available;
    }

    /// First interface path and class registered for `inst`.
    pub fn interface_of(&self, inst: DevInst) -> Option<(String, Guid)> {
        let st = self.lock();
        st.node(inst)?.interfaces.first().map(|(g, p)| (p.clone(), *g))
    }

    /// Mark `inst` gone without telling anyone.
    pub fn remove_node(&self, inst: DevInst) {
        self.with_node(inst, |n| n.present = false);
    }

    fn notify(&self, inst: DevInst, event: DeviceEvent) {
        let (changes, mut subscribers) = {
            let mut st = self.lock();
            let changes: Vec<DeviceChange> = st.node(inst)
                .map(|n| n.interfaces.iter().map(|(g, p)| DeviceChange {
                    event,
                    class_guid: *g,
                    name: p.clone(),
                }).collect())
                .unwrap_or_default();
            (changes, std::mem::take(&mut st.subscribers))
        };
        for change in changes {
            debug!("sim: {:?} {}", change.event, change.name);
            subscribers.retain(|s| s.unbounded_send(change.clone()).is_ok());
        }
        let mut st = self.lock();
        subscribers.append(&mut st.subscribers);
        st.subscribers = subscribers;
    }

    /// Mark `inst` present and announce its interfaces.
    pub fn plug(&self, inst: DevInst) {
        self.with_node(inst, |n| n.present = true);
        self.notify(inst, DeviceEvent::Arrival);
    }

    /// Mark `inst` gone and announce the removal of its interfaces.
    pub fn unplug(&self, inst: DevInst) {
        self.with_node(inst, |n| n.present = false);
        self.notify(inst, DeviceEvent::RemoveComplete);
    }

    /// Data for the next read of `endpoint`.
    pub fn queue_read(&self, endpoint: u8, data: Vec<u8>) {
        self.update(|st| st.deliver(ReadSource::Pipe(endpoint), data));
    }

    /// The next input report, report ID byte included.
    pub fn queue_hid_report(&self, data: Vec<u8>) {
        self.update(|st| st.deliver(ReadSource::Report, data));
    }

    /// Answer for the next control or get-report request.
    pub fn queue_control(&self, data: Vec<u8>) {
        self.lock().control_data.push_back(data);
    }

    /// Complete the next started operation with `status`.
    pub fn fail_next_io(&self, status: IoStatus) {
        self.lock().fail_next = Some(status);
    }

    /// Refuse read/write opens of `path`.
    pub fn deny_read_write(&self, path: &str) {
        self.lock().denied.insert(sanitize_path(path));
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.update(|st| st.clock_offset += by);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    /// Handles opened and not closed yet.
    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Operations started and not finished yet.
    pub fn pending_io(&self) -> usize {
        self.lock().ios.values().filter(|io| io.result.is_none()).count()
    }
}

impl DeviceTree for SimOs {
    fn interfaces_of_class(&self, guid: &Guid) -> Vec<DeviceInterfaceInfo> {
        let st = self.lock();
        let mut out = vec![];
        for (i, n) in st.nodes.iter().enumerate() {
            if !n.present {
                continue;
            }
            for (g, path) in &n.interfaces {
                if g == guid {
                    out.push(DeviceInterfaceInfo { inst: DevInst(i as u32), path: path.clone() });
                }
            }
        }
        out
    }

    fn find_device(&self, device_id: &str, present_only: bool) -> Option<DevInst> {
        let st = self.lock();
        st.nodes.iter()
            .position(|n| n.device_id.eq_ignore_ascii_case(device_id) && (n.present || !present_only))
            .map(|i| DevInst(i as u32))
    }

    fn interface_path(&self, inst: DevInst, guid: &Guid) -> Option<String> {
        let st = self.lock();
        st.node(inst)?.interfaces.iter().find(|(g, _)| g == guid).map(|(_, p)| p.clone())
    }

    fn device_id(&self, inst: DevInst) -> Option<String> {
        self.lock().node(inst).map(|n| n.device_id.clone())
    }

    fn parent(&self, inst: DevInst) -> Option<DevInst> {
        self.lock().node(inst)?.parent
    }

    fn first_child(&self, inst: DevInst) -> Option<DevInst> {
        let st = self.lock();
        st.node(inst)?.children.iter().copied().find(|c| st.node(*c).map(|n| n.present).unwrap_or(false))
    }

    fn next_sibling(&self, inst: DevInst) -> Option<DevInst> {
        let st = self.lock();
        let parent = st.node(inst)?.parent?;
        let siblings = &st.node(parent)?.children;
        let pos = siblings.iter().position(|c| *c == inst)?;
        siblings[pos + 1..].iter().copied().find(|c| st.node(*c).map(|n| n.present).unwrap_or(false))
    }

    fn property(&self, inst: DevInst, property: DeviceProperty) -> Option<PropertyValue> {
        let st = self.lock();
        let n = st.node(inst)?;
        match property {
            DeviceProperty::InstallState => Some(PropertyValue::Number(n.install_state)),
            DeviceProperty::Address => Some(PropertyValue::Number(n.address)),
            DeviceProperty::Service => n.service.clone().map(PropertyValue::Text),
            DeviceProperty::UpperFilters if !n.upper_filters.is_empty() => {
                Some(PropertyValue::TextList(n.upper_filters.clone()))
            }
            _ => None,
        }
    }

    fn registry_value(&self, inst: DevInst, name: &str) -> Option<String> {
        self.lock().node(inst)?.registry.get(name).cloned()
    }
}

impl RawIo for SimOs {
    fn open(&self, path: &str, access: Access) -> OsResult<OsHandle> {
        let wanted = sanitize_path(path);
        let mut st = self.lock();
        st.calls.push(SimCall::Open(wanted.clone(), access));
        let inst = st.nodes.iter().position(|n| {
            n.present && n.interfaces.iter().any(|(_, p)| sanitize_path(p) == wanted)
        }).map(|i| DevInst(i as u32)).ok_or(OsError::FileNotFound)?;
        if access == Access::ReadWrite && st.denied.contains(&wanted) {
            return Err(OsError::AccessDenied);
        }
        Ok(st.new_handle(SimHandle::File(inst)))
    }

    fn close(&self, handle: OsHandle) {
        self.lock().handles.remove(&handle.0);
    }

    fn node_connection_info(&self, hub: OsHandle, port: u32) -> OsResult<NodeConnectionInfo> {
        let st = self.lock();
        let child = st.port_child(hub, port)?;
        let p = child.port.as_ref().ok_or(OsError::Code(87))?;
        Ok(NodeConnectionInfo {
            connected: p.connected,
            device_descriptor: p.descriptor,
            current_configuration: if p.configs.is_empty() { 0 } else { 1 },
            speed: p.speed,
            device_address: port as u16,
        })
    }

    fn descriptor_from_node_connection(&self, hub: OsHandle, port: u32, setup: ControlSetup) -> OsResult<Vec<u8>> {
        let st = self.lock();
        let child = st.port_child(hub, port)?;
        let p = child.port.as_ref().ok_or(OsError::Code(87))?;
        if p.broken {
            return Err(OsError::GenFailure);
        }
        let config = p.configs.get((setup.value & 0xff) as usize).ok_or(OsError::Code(31))?;
        Ok(config[..config.len().min(setup.length as usize)].to_vec())
    }

    fn cancel_io(&self, handle: OsHandle) -> OsResult {
        self.record(SimCall::CancelIo);
        self.update(|st| st.abort(|io| io.handle == handle));
        Ok(())
    }

    fn poll(&self, tokens: &[IoToken], timeout: Duration) -> Vec<IoToken> {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        loop {
            let done: Vec<IoToken> = tokens.iter()
                .filter(|t| st.ios.get(&t.0).map(|io| io.result.is_some()).unwrap_or(false))
                .copied()
                .collect();
            if !done.is_empty() {
                return done;
            }
            let now = Instant::now();
            if now >= deadline {
                return vec![];
            }
            st = match self.cond.wait_timeout(st, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    fn io_result(&self, token: IoToken) -> Option<IoCompletion> {
        self.lock().ios.get(&token.0).and_then(|io| io.result.clone())
    }

    fn release_token(&self, token: IoToken) {
        self.lock().ios.remove(&token.0);
    }
}

impl DirectAccessIo for SimOs {
    fn available(&self, sub: SubApi) -> bool {
        !self.lock().unavailable.contains(&sub)
    }

    fn initialize(&self, _sub: SubApi, file: OsHandle) -> OsResult<OsHandle> {
        let mut st = self.lock();
        let inst = match st.handles.get(&file.0) {
            Some(SimHandle::File(inst)) => *inst,
            _ => return Err(OsError::Code(6)),
        };
        Ok(st.new_handle(SimHandle::Api { inst, iface: 0 }))
    }

    fn associated_interface(&self, _sub: SubApi, api: OsHandle, index: u8) -> OsResult<OsHandle> {
        let mut st = self.lock();
        let inst = match st.handles.get(&api.0) {
            Some(SimHandle::Api { inst, iface: 0 }) => *inst,
            _ => return Err(OsError::Code(6)),
        };
        let count = st.port_of(inst)
            .and_then(|p| p.configs.first())
            .map(|c| c[4])
            .unwrap_or(1);
        let iface = index + 1;
        if iface >= count {
            return Err(OsError::NoMoreItems);
        }
        let taken = st.handles.values().any(|h| matches!(h, SimHandle::Api { inst: i, iface: n } if *i == inst && *n == iface));
        if taken {
            return Err(OsError::AlreadyExists);
        }
        Ok(st.new_handle(SimHandle::Api { inst, iface }))
    }

    fn free(&self, _sub: SubApi, api: OsHandle) {
        self.lock().handles.remove(&api.0);
    }

    fn set_pipe_policy(&self, _sub: SubApi, _api: OsHandle, endpoint: u8, policy: PipePolicy) -> OsResult {
        self.record(SimCall::PipePolicy(endpoint, policy));
        Ok(())
    }

    fn set_current_alternate_setting(&self, _sub: SubApi, _api: OsHandle, alt: u8) -> OsResult {
        self.record(SimCall::SetAltSetting(alt));
        Ok(())
    }

    fn control_transfer(&self, _sub: SubApi, api: OsHandle, setup: ControlSetup, data: &[u8]) -> OsResult<Submitted> {
        self.record(SimCall::ControlTransfer(setup));
        Ok(self.update(|st| {
            let result = match setup.direction() {
                Direction::In => {
                    let mut answer = st.control_data.pop_front()
                        .unwrap_or_else(|| vec![0; setup.length as usize]);
                    answer.truncate(setup.length as usize);
                    IoCompletion::success(answer.len(), answer)
                }
                Direction::Out => IoCompletion::success(data.len(), vec![]),
            };
            st.start_io(api, None, None, Some(result))
        }))
    }

    fn read_pipe(&self, _sub: SubApi, api: OsHandle, endpoint: u8, length: usize) -> OsResult<Submitted> {
        self.record(SimCall::ReadPipe(endpoint, length));
        Ok(self.update(|st| st.start_read(api, Some(endpoint), ReadSource::Pipe(endpoint), length)))
    }

    fn write_pipe(&self, _sub: SubApi, api: OsHandle, endpoint: u8, data: &[u8]) -> OsResult<Submitted> {
        self.record(SimCall::WritePipe(endpoint, data.to_vec()));
        Ok(self.update(|st| st.start_io(api, Some(endpoint), None, Some(IoCompletion::success(data.len(), vec![])))))
    }

    fn abort_pipe(&self, _sub: SubApi, api: OsHandle, endpoint: u8) -> OsResult {
        self.record(SimCall::AbortPipe(endpoint));
        self.update(|st| st.abort(|io| io.handle == api && io.endpoint == Some(endpoint)));
        Ok(())
    }

    fn reset_pipe(&self, _sub: SubApi, _api: OsHandle, endpoint: u8) -> OsResult {
        self.record(SimCall::ResetPipe(endpoint));
        Ok(())
    }

    fn flush_pipe(&self, _sub: SubApi, _api: OsHandle, endpoint: u8) -> OsResult {
        self.record(SimCall::FlushPipe(endpoint));
        Ok(())
    }

    fn supports_reset_device(&self, sub: SubApi) -> bool {
        sub == SubApi::LibusbK
    }

    fn reset_device(&self, _sub: SubApi, _api: OsHandle) -> OsResult {
        self.record(SimCall::ResetDevice);
        Ok(())
    }
}

impl HidIo for SimOs {
    fn available(&self) -> bool {
        !self.lock().hid_unavailable
    }

    fn hid_guid(&self) -> Guid {
        HID_GUID
    }

    fn attributes(&self, handle: OsHandle) -> OsResult<HidAttributes> {
        Ok(self.lock().hid_of(handle)?.0)
    }

    fn set_num_input_buffers(&self, _handle: OsHandle, count: u32) -> bool {
        self.record(SimCall::SetInputBuffers(count));
        count <= MAX_INPUT_BUFFERS
    }

    fn caps(&self, handle: OsHandle) -> OsResult<HidCaps> {
        Ok(self.lock().hid_of(handle)?.1.clone())
    }

    fn string(&self, handle: OsHandle, which: HidString) -> Option<String> {
        self.lock().hid_of(handle).ok()?;
        Some(match which {
            HidString::Manufacturer => "Simulated Manufacturer",
            HidString::Product => "Simulated Product",
            HidString::SerialNumber => "SIM0001",
        }.to_string())
    }

    fn read_report(&self, handle: OsHandle, length: usize) -> OsResult<Submitted> {
        self.record(SimCall::ReadReport(length));
        Ok(self.update(|st| st.start_read(handle, None, ReadSource::Report, length)))
    }

    fn write_report(&self, handle: OsHandle, data: &[u8]) -> OsResult<Submitted> {
        self.record(SimCall::WriteReport(data.to_vec()));
        Ok(self.update(|st| st.start_io(handle, None, None, Some(IoCompletion::success(data.len(), vec![])))))
    }

    fn get_report(&self, handle: OsHandle, kind: HidReportKind, id: u8, length: usize) -> OsResult<Submitted> {
        self.record(SimCall::GetReport(kind, id, length));
        let mut st = self.lock();
        let size = match kind {
            HidReportKind::Input => st.hid_of(handle)?.1.input_report_length,
            _ => st.hid_of(handle)?.1.feature_report_length,
        } as usize;
        let mut data = st.control_data.pop_front().unwrap_or_else(|| vec![0; size]);
        data.truncate(length.min(size.max(1)));
        if let Some(first) = data.first_mut() {
            *first = id;
        }
        let r = st.start_io(handle, None, None, Some(IoCompletion::success(data.len(), data)));
        drop(st);
        self.cond.notify_all();
        Ok(r)
    }

    fn set_report(&self, handle: OsHandle, kind: HidReportKind, data: &[u8]) -> OsResult<Submitted> {
        self.record(SimCall::SetReport(kind, data.to_vec()));
        Ok(self.update(|st| st.start_io(handle, None, None, Some(IoCompletion::success(data.len(), vec![])))))
    }

    fn physical_descriptor(&self, handle: OsHandle, length: usize) -> OsResult<Vec<u8>> {
        self.lock().hid_of(handle)?;
        Ok(vec![0; length.min(3)])
    }

    fn flush_queue(&self, _handle: OsHandle) -> OsResult {
        self.record(SimCall::FlushQueue);
        Ok(())
    }
}

impl HidDescriptorSource for SimOs {
    fn descriptor(&self, device: &HidDeviceInfo, descriptor_type: u8, index: u8, max_length: usize) -> Result<Vec<u8>> {
        const REPORT: [u8; 20] = [
            0x06, 0x00, 0xff, 0x09, 0x01, 0xa1, 0x01, 0x15, 0x00, 0x26,
            0xff, 0x00, 0x75, 0x08, 0x95, 0x08, 0x09, 0x01, 0x81, 0x02,
        ];
        let hid = vec![9, DT_HID, 0x11, 0x01, 0, 1, DT_REPORT, REPORT.len() as u8, 0];
        let mut data = match descriptor_type {
            DT_DEVICE => {
                let mut d = device_descriptor(0, device.vid, device.pid);
                d.iManufacturer = device.string_index[0];
                d.iProduct = device.string_index[1];
                d.iSerialNumber = device.string_index[2];
                d.to_bytes().to_vec()
            }
            DT_CONFIG => {
                let mut buf = vec![9, DT_CONFIG, 0, 0, 1, 1, 0, 0x80, 50, 9, DT_INTERFACE, 0, 0, 1, CLASS_HID, 0, 0, 0];
                buf.extend_from_slice(&hid);
                buf.extend_from_slice(&[7, DT_ENDPOINT, 0x81, 3, device.input_report_size as u8, 0, 10]);
                with_total_length(buf)
            }
            DT_STRING => match index {
                0 => vec![4, DT_STRING, 0x09, 0x04],
                i => {
                    let pos = device.string_index.iter().position(|s| *s == i).ok_or(Error::InvalidParam)?;
                    string_descriptor(&device.strings[pos])
                }
            },
            DT_HID => hid,
            DT_REPORT => REPORT.to_vec(),
            other => {
                debug!("sim: unsupported descriptor type 0x{:02X}", other);
                return Err(Error::InvalidParam);
            }
        };
        data.truncate(max_length);
        Ok(data)
    }
}

impl Clock for SimOs {
    fn now(&self) -> Instant {
        Instant::now() + self.lock().clock_offset
    }
}

impl ChangeNotifier for SimOs {
    fn subscribe(&self, sender: UnboundedSender<DeviceChange>) -> Result {
        self.lock().subscribers.push(sender);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_wait_for_data() {
        let sim = SimOs::new();
        let token = match sim.read_pipe(SubApi::WinUsb, OsHandle(1), 0x81, 4).unwrap() {
            Submitted::Pending(t) => t,
            other => panic!("unexpected {:?}", other),
        };
        assert!(sim.poll(&[token], Duration::from_millis(10)).is_empty());
        sim.queue_read(0x81, vec![1, 2, 3, 4, 5]);
        assert_eq!(sim.poll(&[token], Duration::from_millis(10)), vec![token]);
        assert_eq!(sim.io_result(token).unwrap().data, vec![1, 2, 3, 4]);
        sim.release_token(token);
        assert!(sim.io_result(token).is_none());
    }

    #[test]
    fn abort_completes_pending_reads() {
        let sim = SimOs::new();
        let a = sim.read_pipe(SubApi::WinUsb, OsHandle(1), 0x81, 4).unwrap();
        let b = sim.read_pipe(SubApi::WinUsb, OsHandle(1), 0x82, 4).unwrap();
        sim.abort_pipe(SubApi::WinUsb, OsHandle(1), 0x81).unwrap();
        assert_eq!(sim.pending_io(), 1);
        if let (Submitted::Pending(a), Submitted::Pending(_)) = (a, b) {
            assert_eq!(sim.io_result(a).unwrap().status, IoStatus::OperationAborted);
        }
    }
}
