use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use log::{debug, warn};
use crate::backend::{Backend, OpCtx};
use crate::context::ContextInner;
use crate::define::*;
use crate::device::UsbDevice;
use crate::error::*;
use crate::os::OsHandle;
use crate::platform::PlatformInner;
use crate::transfer::*;

/// OS handles held for one interface of an open device.
#[derive(Debug, Clone, Default)]
pub(crate) struct InterfaceHandle {
    /// Interface path the handles were opened on.
    pub(crate) path: Option<String>,
    /// Backend owning the handles.
    pub(crate) backend: Backend,
    /// File handle of the interface path (direct access).
    pub(crate) file: Option<OsHandle>,
    /// Driver API handle (direct access) or HID handle.
    pub(crate) api: Option<OsHandle>,
    /// Set when a HID collection was opened on this interface.
    pub(crate) hid_open: bool,
    pub(crate) hid_claimed: bool,
}

impl InterfaceHandle {
    pub(crate) fn is_ready(&self) -> bool {
        (self.file.is_some() || self.hid_open) && self.api.is_some()
    }

    fn is_empty(&self) -> bool {
        self.file.is_none() && self.api.is_none() && !self.hid_open
    }
}

fn move_bit(bits: &mut u32, from: usize, to: usize) {
    let set = *bits & (1 << from) != 0;
    *bits &= !(1 << from) & !(1 << to);
    if set {
        *bits |= 1 << to;
    }
}

pub(crate) struct HandleState {
    pub(crate) interfaces: [InterfaceHandle; MAX_INTERFACES],
    /// Bit `n` set while interface `n` is claimed.
    pub(crate) claimed: u32,
    /// Bit `n` set while the caller holds a claim on interface `n`.
    pub(crate) explicit: u32,
    /// Explicit claims carried by the auto-claim count.
    pub(crate) counted: u32,
    pub(crate) active_interface: usize,
}

impl HandleState {
    fn new() -> Self {
        Self {
            interfaces: std::array::from_fn(|_| InterfaceHandle::default()),
            claimed: 0,
            explicit: 0,
            counted: 0,
            active_interface: 0,
        }
    }

    pub(crate) fn is_claimed(&self, iface: usize) -> bool {
        iface < MAX_INTERFACES && self.claimed & (1 << iface) != 0
    }

    pub(crate) fn is_explicit(&self, iface: usize) -> bool {
        iface < MAX_INTERFACES && self.explicit & (1 << iface) != 0
    }
}

pub(crate) struct HandleShared {
    pub(crate) device: Arc<UsbDevice>,
    pub(crate) platform: Arc<PlatformInner>,
    pub(crate) state: Mutex<HandleState>,
    pub(crate) autoclaim: [AtomicUsize; MAX_INTERFACES],
}

impl HandleShared {
    /// Lock the handle then the device node and run `f` against both.
    pub(crate) fn with_ops<F, O>(&self, f: F) -> Result<O>
        where F: FnOnce(&mut OpCtx) -> Result<O> {
        let mut state = self.state.lock()?;
        let mut node = self.device.lock_node()?;
        let mut ctx = OpCtx {
            platform: &self.platform,
            device: &self.device,
            node: &mut node,
            handle: &mut state,
            autoclaim: &self.autoclaim,
        };
        ctx.sync_interfaces();
        f(&mut ctx)
    }
}

impl OpCtx<'_> {
    pub(crate) fn claim_interface(&mut self, iface: usize) -> Result {
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        if self.handle.is_claimed(iface) {
            return Ok(());
        }
        self.node.slots.set_endpoints(iface, vec![]);
        let ops = self.device.backend.ops();
        ops.claim_interface(self, iface)?;
        self.handle.claimed |= 1 << iface;
        self.assign_endpoints(iface, 0)
    }

    pub(crate) fn release_interface(&mut self, iface: usize) -> Result {
        if !self.handle.is_claimed(iface) {
            return Err(Error::NotFound);
        }
        self.node.slots.set_endpoints(iface, vec![]);
        let ops = self.device.backend.ops();
        let r = ops.release_interface(self, iface);
        if r.is_ok() {
            self.handle.claimed &= !(1 << iface);
        }
        r
    }

    /// Follow hotplug changes of the slot array.
    ///
    /// Handles opened on a path that left the node are closed, handles whose
    /// path moved to another slot move with it.
    pub(crate) fn sync_interfaces(&mut self) {
        for i in 0..MAX_INTERFACES {
            let path = match &self.handle.interfaces[i].path {
                Some(p) => p.clone(),
                None => continue,
            };
            if self.node.slots.path(i) == Some(path.as_str()) {
                continue;
            }
            let target = (0..MAX_INTERFACES).find(|j| {
                self.node.slots.path(*j) == Some(path.as_str()) && self.handle.interfaces[*j].is_empty()
            });
            match target {
                Some(j) => self.move_interface(i, j),
                None => self.drop_interface(i),
            }
        }
    }

    fn move_interface(&mut self, from: usize, to: usize) {
        debug!("interface {} moved to {}", from, to);
        self.handle.interfaces[to] = std::mem::take(&mut self.handle.interfaces[from]);
        move_bit(&mut self.handle.claimed, from, to);
        move_bit(&mut self.handle.explicit, from, to);
        move_bit(&mut self.handle.counted, from, to);
        let count = self.autoclaim[from].swap(0, Ordering::SeqCst);
        self.autoclaim[to].store(count, Ordering::SeqCst);
        if self.handle.active_interface == from {
            self.handle.active_interface = to;
        }
    }

    fn drop_interface(&mut self, iface: usize) {
        let h = std::mem::take(&mut self.handle.interfaces[iface]);
        debug!("interface {} is gone, closing its handles", iface);
        h.backend.ops().close_interface(self.os(), h);
        let bit = !(1u32 << iface);
        self.handle.claimed &= bit;
        self.handle.explicit &= bit;
        self.handle.counted &= bit;
        self.autoclaim[iface].store(0, Ordering::SeqCst);
    }

    /// Rebuild the endpoint list of `iface` from the first configuration.
    pub(crate) fn assign_endpoints(&mut self, iface: usize, alt: u8) -> Result {
        let endpoints: Vec<u8> = match self.device.get_config_descriptor(0) {
            Ok(cfg) => match cfg.alt_setting(iface as u8, alt) {
                Some(desc) => desc.endpoints.iter().map(|e| e.bEndpointAddress).collect(),
                None => vec![],
            },
            Err(e) => {
                warn!("could not read config descriptor for {}: {}", self.device, e);
                vec![]
            }
        };
        if endpoints.is_empty() {
            debug!("no endpoints found for interface {}", iface);
        }
        for ep in &endpoints {
            debug!("(re)assigned endpoint {:02X} to interface {}", ep, iface);
        }
        self.node.slots.set_endpoints(iface, endpoints);
        let ops = self.device.backend.ops();
        ops.configure_endpoints(self, iface)
    }

    /// First interface with usable handles served by `backend`.
    pub(crate) fn get_valid_interface(&self, backend: Backend) -> Option<usize> {
        (0..MAX_INTERFACES).find(|i| {
            self.handle.interfaces[*i].is_ready() && self.node.slots.backend(*i) == backend
        })
    }

    pub(crate) fn interface_by_endpoint(&self, endpoint: u8) -> Option<usize> {
        (0..MAX_INTERFACES).find(|i| {
            self.handle.interfaces[*i].api.is_some()
                && self.node.slots.get(*i).map(|s| s.endpoints.contains(&endpoint)).unwrap_or(false)
        })
    }

    /// Pick the interface for a control transfer, claiming one when none is usable.
    ///
    /// The auto-claim count is bumped whenever the chosen interface was itself
    /// auto-claimed, so it cannot be released under a transfer still using it.
    pub(crate) fn auto_claim(&mut self, t: &mut TransferState, current: Option<usize>, backend: Backend) -> Result<usize> {
        match backend {
            Backend::DirectAccess(_) | Backend::Hid => {}
            _ => return Err(Error::InvalidParam),
        }
        let platform = self.platform;
        let _g = platform.autoclaim_lock.lock()?;

        let iface = match current {
            Some(iface) => {
                if self.autoclaim[iface].load(Ordering::SeqCst) != 0 {
                    self.autoclaim[iface].fetch_add(1, Ordering::SeqCst);
                    t.auto_claimed = true;
                }
                iface
            }
            None => {
                let mut found = None;
                for iface in 0..MAX_INTERFACES {
                    if self.node.slots.backend(iface) != backend {
                        continue;
                    }
                    if self.claim_interface(iface).is_ok() {
                        debug!("auto-claimed interface {} for control request", iface);
                        if self.autoclaim[iface].load(Ordering::SeqCst) != 0 {
                            warn!("autoclaim count of interface {} was nonzero", iface);
                        }
                        self.autoclaim[iface].fetch_add(1, Ordering::SeqCst);
                        t.auto_claimed = true;
                        found = Some(iface);
                        break;
                    }
                }
                match found {
                    Some(iface) => iface,
                    None => {
                        warn!("could not auto-claim any interface");
                        return Err(Error::NotFound);
                    }
                }
            }
        };
        t.interface = Some(iface);
        Ok(iface)
    }

    /// Undo one auto-claim, releasing the interface with the last one.
    pub(crate) fn auto_release(&mut self, iface: usize) -> Result {
        let platform = self.platform;
        let _g = platform.autoclaim_lock.lock()?;
        let count = &self.autoclaim[iface];
        if count.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        if count.fetch_sub(1, Ordering::SeqCst) == 1 {
            match self.release_interface(iface) {
                Ok(()) => debug!("auto-released interface {}", iface),
                Err(e) => {
                    debug!("failed to auto-release interface {} ({})", iface, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Interface a control transfer should use, auto-claiming if needed.
    pub(crate) fn control_interface(&mut self, t: &mut TransferState, backend: Backend) -> Result<usize> {
        let hinted = t.interface_hint.filter(|i| {
            self.handle.is_claimed(*i) && self.node.slots.backend(*i) == backend
        });
        let current = hinted.or_else(|| self.get_valid_interface(backend));
        self.auto_claim(t, current, backend)
    }
}

/// An open device.
///
/// Dropping the handle cancels its transfers, releases every claimed
/// interface and closes the backend handles.
pub struct DeviceHandle {
    pub(crate) shared: Arc<HandleShared>,
    pub(crate) ctx: Arc<ContextInner>,
}

impl DeviceHandle {
    pub(crate) fn open(ctx: Arc<ContextInner>, device: Arc<UsbDevice>) -> Result<Self> {
        let shared = Arc::new(HandleShared {
            device: device.clone(),
            platform: ctx.platform.clone(),
            state: Mutex::new(HandleState::new()),
            autoclaim: std::array::from_fn(|_| AtomicUsize::new(0)),
        });
        shared.with_ops(|ops| {
            let backend = ops.device.backend.ops();
            let r = backend.open(ops);
            if r.is_err() {
                backend.close(ops);
            }
            r
        })?;
        if let Err(e) = ctx.device_opened() {
            shared.with_ops(|ops| {
                ops.device.backend.ops().close(ops);
                Ok(())
            })?;
            return Err(e);
        }
        debug!("opened {}", device);
        Ok(Self { shared, ctx })
    }

    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.shared.device
    }

    pub fn claim_interface(&self, iface: u8) -> Result {
        let iface = iface as usize;
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        let bit = 1 << iface;
        self.shared.with_ops(|ctx| {
            if ctx.handle.is_explicit(iface) {
                return Ok(());
            }
            {
                let platform = ctx.platform;
                let _g = platform.autoclaim_lock.lock()?;
                if ctx.autoclaim[iface].load(Ordering::SeqCst) > 0 {
                    ctx.autoclaim[iface].fetch_add(1, Ordering::SeqCst);
                    ctx.handle.explicit |= bit;
                    ctx.handle.counted |= bit;
                    debug!("interface {} already auto-claimed, count raised", iface);
                    return Ok(());
                }
            }
            ctx.claim_interface(iface)?;
            ctx.handle.explicit |= bit;
            Ok(())
        })
    }

    pub fn release_interface(&self, iface: u8) -> Result {
        let iface = iface as usize;
        if iface >= MAX_INTERFACES {
            return Err(Error::InvalidParam);
        }
        let bit = 1 << iface;
        self.shared.with_ops(|ctx| {
            if !ctx.handle.is_explicit(iface) {
                return Err(Error::NotFound);
            }
            if ctx.handle.counted & bit != 0 {
                ctx.handle.explicit &= !bit;
                ctx.handle.counted &= !bit;
                return ctx.auto_release(iface);
            }
            ctx.release_interface(iface)?;
            ctx.handle.explicit &= !bit;
            Ok(())
        })
    }

    pub fn set_interface_altsetting(&self, iface: u8, alt: u8) -> Result {
        let iface = iface as usize;
        self.shared.with_ops(|ctx| {
            if !ctx.handle.is_claimed(iface) {
                return Err(Error::NotFound);
            }
            ctx.node.slots.set_endpoints(iface, vec![]);
            let ops = ctx.device.backend.ops();
            ops.set_interface_altsetting(ctx, iface, alt)?;
            ctx.assign_endpoints(iface, alt)
        })
    }

    pub fn clear_halt(&self, endpoint: u8) -> Result {
        self.shared.with_ops(|ctx| {
            let ops = ctx.device.backend.ops();
            ops.clear_halt(ctx, endpoint)
        })
    }

    pub fn reset_device(&self) -> Result {
        self.shared.with_ops(|ctx| {
            let ops = ctx.device.backend.ops();
            ops.reset_device(ctx)
        })
    }

    pub fn get_configuration(&self) -> Result<u8> {
        let active = self.shared.device.active_configuration()?;
        if active == 0 {
            return Err(Error::NotFound);
        }
        Ok(active)
    }

    pub async fn set_configuration(&self, config: u8) -> Result {
        if config >= MAX_CONFIGURATIONS {
            return Err(Error::InvalidParam);
        }
        let request = ControlTransferRequest {
            request: REQUEST_SET_CONFIGURATION,
            value: config as u16,
            timeout: Duration::from_millis(1000),
            ..Default::default()
        };
        self.control_transfer_out(request, &[]).await?;
        self.shared.device.lock_node()?.active_config = config;
        Ok(())
    }

    pub fn kernel_driver_active(&self, _iface: u8) -> Result<bool> {
        Err(Error::NotSupported)
    }

    pub fn detach_kernel_driver(&self, _iface: u8) -> Result {
        Err(Error::NotSupported)
    }

    pub fn attach_kernel_driver(&self, _iface: u8) -> Result {
        Err(Error::NotSupported)
    }

    /// Current auto-claim count of `iface`.
    pub fn auto_claim_count(&self, iface: u8) -> usize {
        self.shared.autoclaim.get(iface as usize)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Submit a transfer.
    /// This function will fire off the USB transfer and then return a [SubmitHandle] immediately.
    pub fn submit(&self, request: TransferRequest) -> Result<SubmitHandle> {
        request.validate()?;
        let timeout = request.timeout;
        let mut state = TransferState::new(request);
        let submitted = self.shared.with_ops(|ctx| {
            let ops = ctx.device.backend.ops();
            let r = match state.kind {
                TransferKind::Control => ops.submit_control(ctx, &mut state),
                TransferKind::Bulk | TransferKind::Interrupt => ops.submit_bulk(ctx, &mut state),
                TransferKind::Isochronous => ops.submit_iso(ctx, &mut state),
            };
            if r.is_err() && state.auto_claimed {
                if let Some(iface) = state.interface {
                    if let Err(e) = ctx.auto_release(iface) {
                        warn!("failed to auto-release interface {}: {}", iface, e);
                    }
                }
                state.auto_claimed = false;
            }
            r
        })?;
        self.ctx.register_transfer(self.shared.clone(), state, submitted, timeout)
    }

    pub async fn control_transfer_in(&self, request: ControlTransferRequest, capacity: u16) -> Result<Vec<u8>> {
        let done = self.submit(TransferRequest::control_in(request, capacity))?.await?.into_result()?;
        Ok(done.data)
    }

    pub async fn control_transfer_out(&self, request: ControlTransferRequest, data: &[u8]) -> Result {
        let done = self.submit(TransferRequest::control_out(request, data))?.await?.into_result()?;
        if done.actual_length != data.len() {
            return Err(Error::Io(format!("send {}, actual {}", data.len(), done.actual_length)));
        }
        Ok(())
    }

    pub async fn bulk_transfer_in(&self, endpoint: u8, package_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let request = TransferRequest::bulk_in(endpoint | ENDPOINT_IN, package_len).timeout(timeout);
        Ok(self.submit(request)?.await?.into_result()?.data)
    }

    pub async fn bulk_transfer_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::bulk_out(endpoint & !ENDPOINT_IN, data).timeout(timeout);
        Ok(self.submit(request)?.await?.into_result()?.actual_length)
    }

    pub async fn interrupt_transfer_in(&self, endpoint: u8, package_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let request = TransferRequest::interrupt_in(endpoint | ENDPOINT_IN, package_len).timeout(timeout);
        Ok(self.submit(request)?.await?.into_result()?.data)
    }

    pub async fn interrupt_transfer_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let request = TransferRequest::interrupt_out(endpoint & !ENDPOINT_IN, data).timeout(timeout);
        Ok(self.submit(request)?.await?.into_result()?.actual_length)
    }

    pub fn close(self) {}
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.ctx.cancel_handle_transfers(&self.shared);
        let r = self.shared.with_ops(|ctx| {
            for iface in 0..MAX_INTERFACES {
                ctx.autoclaim[iface].store(0, Ordering::SeqCst);
                if ctx.handle.is_claimed(iface) {
                    if let Err(e) = ctx.release_interface(iface) {
                        warn!("failed to release interface {} on close: {}", iface, e);
                    }
                }
            }
            ctx.handle.explicit = 0;
            ctx.handle.counted = 0;
            let ops = ctx.device.backend.ops();
            ops.close(ctx);
            Ok(())
        });
        if let Err(e) = r {
            warn!("closing {} failed: {}", self.shared.device, e);
        }
        self.ctx.event.close_device();
        debug!("closed {}", self.shared.device);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use crate::backend::{Backend, SubApi};
    use crate::define::*;
    use crate::error::*;
    use crate::platform::Platform;
    use crate::sim::{SimCall, SimOs};
    use crate::transfer::{TransferRequest, TransferState};
    use crate::utils::test::init;

    fn vendor_in() -> ControlTransferRequest {
        ControlTransferRequest {
            transfer_type: UsbControlTransferType::Vendor,
            request: 0x10,
            timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn control_transfers_claim_and_release() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_5678\\SN1", 0x1234, 0x5678);
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();

        sim.queue_control(vec![1, 2, 3, 4]);
        let data = handle.control_transfer_in(vendor_in(), 4).await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
        assert_eq!(handle.auto_claim_count(0), 0);
        // the auto-claim is gone, so the interface is free to release explicitly
        assert_eq!(handle.release_interface(0), Err(Error::NotFound));

        handle.claim_interface(0).unwrap();
        handle.control_transfer_in(vendor_in(), 4).await.unwrap();
        assert_eq!(handle.auto_claim_count(0), 0);
        handle.release_interface(0).unwrap();
        assert!(sim.calls().iter().filter(|c| matches!(c, SimCall::ControlTransfer(_))).count() >= 2);
    }

    fn winusb_handle() -> (std::sync::Arc<SimOs>, crate::UsbContext, super::DeviceHandle) {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_5678\\SN1", 0x1234, 0x5678);
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        (sim, ctx, handle)
    }

    fn is_claimed(handle: &super::DeviceHandle, iface: usize) -> bool {
        handle.shared.state.lock().unwrap().is_claimed(iface)
    }

    #[test]
    fn explicit_claims_stack_on_auto_claims() {
        let (_sim, _ctx, handle) = winusb_handle();
        let winusb = Backend::DirectAccess(SubApi::WinUsb);

        let mut t = TransferState::new(TransferRequest::control_in(vendor_in(), 4));
        let iface = handle.shared.with_ops(|ctx| ctx.auto_claim(&mut t, None, winusb)).unwrap();
        assert_eq!(iface, 0);
        assert!(t.auto_claimed);
        assert_eq!(handle.auto_claim_count(0), 1);

        // a release without a claim of our own leaves the transfer's claim alone
        assert_eq!(handle.release_interface(0), Err(Error::NotFound));
        assert_eq!(handle.auto_claim_count(0), 1);
        assert!(is_claimed(&handle, 0));

        handle.claim_interface(0).unwrap();
        handle.claim_interface(0).unwrap();
        assert_eq!(handle.auto_claim_count(0), 2);
        handle.release_interface(0).unwrap();
        assert_eq!(handle.auto_claim_count(0), 1);
        assert!(is_claimed(&handle, 0));
        assert_eq!(handle.release_interface(0), Err(Error::NotFound));

        handle.shared.with_ops(|ctx| ctx.auto_release(0)).unwrap();
        assert_eq!(handle.auto_claim_count(0), 0);
        assert!(!is_claimed(&handle, 0));

        // no interface is served by libusbK
        let mut t = TransferState::new(TransferRequest::control_in(vendor_in(), 4));
        let r = handle.shared.with_ops(|ctx| ctx.auto_claim(&mut t, None, Backend::DirectAccess(SubApi::LibusbK)));
        assert_eq!(r, Err(Error::NotFound));
        assert!(!t.auto_claimed);
        assert!((0..MAX_INTERFACES as u8).all(|i| handle.auto_claim_count(i) == 0));
    }

    #[test]
    fn explicit_claim_outlives_the_transfer() {
        let (_sim, _ctx, handle) = winusb_handle();
        let winusb = Backend::DirectAccess(SubApi::WinUsb);

        let mut t = TransferState::new(TransferRequest::control_in(vendor_in(), 4));
        handle.shared.with_ops(|ctx| ctx.auto_claim(&mut t, None, winusb)).unwrap();
        handle.claim_interface(0).unwrap();

        handle.shared.with_ops(|ctx| ctx.auto_release(0)).unwrap();
        assert_eq!(handle.auto_claim_count(0), 1);
        assert!(is_claimed(&handle, 0));

        handle.release_interface(0).unwrap();
        assert_eq!(handle.auto_claim_count(0), 0);
        assert!(!is_claimed(&handle, 0));
    }

    #[test]
    fn interface_hint_needs_a_claim() {
        let (_sim, _ctx, handle) = winusb_handle();
        let winusb = Backend::DirectAccess(SubApi::WinUsb);
        handle.claim_interface(0).unwrap();

        let request = TransferRequest::control_in(vendor_in(), 4).interface(1);
        let mut t = TransferState::new(request.clone());
        let iface = handle.shared.with_ops(|ctx| ctx.control_interface(&mut t, winusb)).unwrap();
        assert_eq!(iface, 0);
        assert!(!t.auto_claimed);

        handle.claim_interface(1).unwrap();
        let mut t = TransferState::new(request);
        let iface = handle.shared.with_ops(|ctx| ctx.control_interface(&mut t, winusb)).unwrap();
        assert_eq!(iface, 1);
    }

    #[tokio::test]
    async fn alternate_settings_remap_endpoints() {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_5678\\SN1", 0x1234, 0x5678);
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();

        assert_eq!(handle.set_interface_altsetting(0, 1), Err(Error::NotFound));
        handle.claim_interface(0).unwrap();
        handle.set_interface_altsetting(0, 1).unwrap();
        let slots = handle.device().interface_slots().unwrap();
        assert_eq!(slots.get(0).unwrap().endpoints(), &[0x84]);
        assert!(sim.calls().contains(&SimCall::SetAltSetting(1)));
        assert_eq!(handle.get_configuration(), Ok(1));
        assert_eq!(handle.kernel_driver_active(0), Err(Error::NotSupported));
    }
}
