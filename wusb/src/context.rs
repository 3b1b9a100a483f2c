use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use futures::channel::oneshot;
use log::{debug, error, trace, warn};
use crate::define::*;
use crate::device::UsbDevice;
use crate::error::*;
use crate::handle::{DeviceHandle, HandleShared};
use crate::os::{IoCompletion, IoStatus, Submitted};
use crate::platform::PlatformInner;
use crate::registry::SessionId;
use crate::transfer::*;

/// Readiness source of one in-flight transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollFd(pub u64);

#[derive(Clone, Debug, Copy, Default)]
struct EventControllerCtx {
    device_count: usize,
    transfers: usize,
    is_exit: bool,
}

/// Parks the event thread while there is nothing to wait for.
pub(crate) struct EventController {
    ctx: Mutex<EventControllerCtx>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventController {
    fn new() -> Self {
        Self {
            ctx: Mutex::new(EventControllerCtx::default()),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    fn update<F: FnOnce(&mut EventControllerCtx)>(&self, f: F) {
        let mut g = match self.ctx.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        f(&mut g);
        self.cond.notify_all();
    }

    pub(crate) fn open_device(&self) {
        self.update(|c| c.device_count += 1);
    }

    pub(crate) fn close_device(&self) {
        self.update(|c| c.device_count = c.device_count.saturating_sub(1));
    }

    pub(crate) fn submit_transfer(&self) {
        self.update(|c| c.transfers += 1);
    }

    pub(crate) fn finish_transfer(&self) {
        self.update(|c| c.transfers = c.transfers.saturating_sub(1));
    }

    fn exit(&self) {
        self.update(|c| c.is_exit = true);
    }

    /// Block until there is I/O to wait for, `false` once the context is gone.
    fn wait_work(&self) -> bool {
        let mut g = match self.ctx.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        loop {
            if g.is_exit {
                return false;
            }
            if g.device_count > 0 && g.transfers > 0 {
                return true;
            }
            g = match self.cond.wait(g) {
                Ok(g) => g,
                Err(_) => return false,
            };
        }
    }
}

pub(crate) struct ContextInner {
    pub(crate) platform: Arc<PlatformInner>,
    /// Devices of this context, mutated only under the platform registry lock.
    pub(crate) sessions: RwLock<BTreeMap<SessionId, Arc<UsbDevice>>>,
    flying: Mutex<HashMap<PollFd, InFlight>>,
    next_fd: AtomicU64,
    pub(crate) event: Arc<EventController>,
    pub(crate) me: Weak<ContextInner>,
}

impl ContextInner {
    pub(crate) fn new(platform: Arc<PlatformInner>) -> Result<Arc<Self>> {
        let ctx = Arc::new_cyclic(|me| Self {
            platform: platform.clone(),
            sessions: RwLock::new(BTreeMap::new()),
            flying: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(1),
            event: Arc::new(EventController::new()),
            me: me.clone(),
        });
        platform.register_context(&ctx)?;
        Ok(ctx)
    }

    /// Count an open handle and make sure the event thread runs.
    pub(crate) fn device_opened(&self) -> Result {
        {
            let mut worker = self.event.worker.lock()?;
            if worker.is_none() {
                let weak = self.me.clone();
                let event = self.event.clone();
                let interval = self.platform.config.poll_interval;
                let handle = std::thread::Builder::new()
                    .name("wusb-events".to_string())
                    .spawn(move || work_event(weak, event, interval))
                    .map_err(|e| Error::Other(format!("cannot start event thread: {}", e)))?;
                *worker = Some(handle);
            }
        }
        self.event.open_device();
        Ok(())
    }

    pub(crate) fn device(&self, session: SessionId) -> Option<Arc<UsbDevice>> {
        self.sessions.read().ok()?.get(&session).cloned()
    }

    pub(crate) fn register_transfer(
        &self,
        handle: Arc<HandleShared>,
        state: TransferState,
        submitted: Submitted,
        timeout: Duration,
    ) -> Result<SubmitHandle> {
        let (tx, rx) = oneshot::channel();
        let fd = PollFd(self.next_fd.fetch_add(1, Ordering::SeqCst));
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(self.platform.os.clock.now() + timeout)
        };
        let pending = match submitted {
            Submitted::Pending(token) => Pending::Token(token),
            Submitted::Immediate(completion) => Pending::Ready(completion),
        };
        let duplicate = {
            let mut flying = self.flying.lock()?;
            let token = match &pending {
                Pending::Token(t) => Some(*t),
                Pending::Ready(_) => None,
            };
            if token.is_some() && flying.values().any(|f| f.token() == token) {
                true
            } else {
                flying.insert(fd, InFlight {
                    handle: handle.clone(),
                    state: state.clone(),
                    pending,
                    deadline,
                    timed_out: false,
                    complete: tx,
                });
                false
            }
        };
        if duplicate {
            error!("I/O token already registered for another transfer");
            if state.auto_claimed {
                if let Some(iface) = state.interface {
                    handle.with_ops(|ctx| ctx.auto_release(iface))?;
                }
            }
            return Err(Error::Other("duplicate I/O token".to_string()));
        }
        trace!("transfer {:?} submitted on {}", fd, handle.device);
        self.event.submit_transfer();
        Ok(SubmitHandle::new(rx, TransferCancelToken { ctx: self.me.clone(), fd }))
    }

    pub(crate) fn pollfds(&self) -> Vec<PollFd> {
        match self.flying.lock() {
            Ok(f) => f.keys().copied().collect(),
            Err(_) => vec![],
        }
    }

    /// Ask the backend to abort a transfer. Its completion still goes through the event loop.
    pub(crate) fn cancel_transfer(&self, fd: PollFd, timed_out: bool) -> Result {
        let (handle, state) = {
            let mut flying = self.flying.lock()?;
            let f = flying.get_mut(&fd).ok_or(Error::NotFound)?;
            f.timed_out |= timed_out;
            if let Pending::Ready(_) = f.pending {
                return Ok(());
            }
            (f.handle.clone(), f.state.clone())
        };
        debug!("cancelling transfer {:?}{}", fd, if timed_out { " (timeout)" } else { "" });
        handle.with_ops(|ctx| {
            let ops = ctx.device.backend.ops();
            match state.kind {
                TransferKind::Control => ops.abort_control(ctx, &state),
                _ => ops.abort_transfers(ctx, &state),
            }
        })
    }

    /// Abort and complete every transfer of a handle being closed.
    pub(crate) fn cancel_handle_transfers(&self, handle: &Arc<HandleShared>) {
        let mut mine = vec![];
        {
            let mut flying = match self.flying.lock() {
                Ok(f) => f,
                Err(e) => e.into_inner(),
            };
            let fds: Vec<PollFd> = flying.iter()
                .filter(|(_, f)| Arc::ptr_eq(&f.handle, handle))
                .map(|(fd, _)| *fd)
                .collect();
            for fd in fds {
                if let Some(f) = flying.remove(&fd) {
                    mine.push(f);
                }
            }
        }
        let io = self.platform.os.io.clone();
        for entry in mine {
            let completion = match &entry.pending {
                Pending::Ready(c) => c.clone(),
                Pending::Token(token) => {
                    let state = entry.state.clone();
                    let r = entry.handle.with_ops(|ctx| {
                        let ops = ctx.device.backend.ops();
                        match state.kind {
                            TransferKind::Control => ops.abort_control(ctx, &state),
                            _ => ops.abort_transfers(ctx, &state),
                        }
                    });
                    if let Err(e) = r {
                        debug!("abort on close failed: {}", e);
                    }
                    let c = io.io_result(*token)
                        .unwrap_or_else(|| IoCompletion::with_status(IoStatus::OperationAborted));
                    io.release_token(*token);
                    c
                }
            };
            self.complete(entry, completion);
        }
    }

    /// Wait up to `timeout` for I/O and complete whatever finished.
    pub(crate) fn handle_events(&self, timeout: Duration) -> Result<usize> {
        let now = self.platform.os.clock.now();
        let expired: Vec<PollFd> = {
            let flying = self.flying.lock()?;
            flying.iter()
                .filter(|(_, f)| !f.timed_out && f.deadline.map(|d| d <= now).unwrap_or(false))
                .map(|(fd, _)| *fd)
                .collect()
        };
        for fd in expired {
            if let Err(e) = self.cancel_transfer(fd, true) {
                warn!("failed to cancel expired transfer {:?}: {}", fd, e);
            }
        }

        let (mut ready, tokens, nearest) = {
            let flying = self.flying.lock()?;
            let mut ready = vec![];
            let mut tokens = vec![];
            let mut nearest = None;
            for (fd, f) in flying.iter() {
                match f.pending {
                    Pending::Ready(_) => ready.push(*fd),
                    Pending::Token(t) => tokens.push((*fd, t)),
                }
                if !f.timed_out {
                    if let Some(d) = f.deadline {
                        nearest = Some(nearest.map_or(d, |n: std::time::Instant| n.min(d)));
                    }
                }
            }
            (ready, tokens, nearest)
        };

        if !tokens.is_empty() {
            let wait = if !ready.is_empty() {
                Duration::ZERO
            } else {
                match nearest {
                    Some(d) => d.saturating_duration_since(now).min(timeout),
                    None => timeout,
                }
            };
            let raw: Vec<_> = tokens.iter().map(|(_, t)| *t).collect();
            let done = self.platform.os.io.poll(&raw, wait);
            ready.extend(tokens.iter().filter(|(_, t)| done.contains(t)).map(|(fd, _)| *fd));
        }
        self.handle_ready_descriptors(&ready)
    }

    /// Complete the transfers behind `fds` whose I/O has finished.
    pub(crate) fn handle_ready_descriptors(&self, fds: &[PollFd]) -> Result<usize> {
        let io = self.platform.os.io.clone();
        let mut count = 0;
        for fd in fds {
            let done = {
                let mut flying = self.flying.lock()?;
                let completion = match flying.get(fd) {
                    None => continue,
                    Some(f) => match &f.pending {
                        Pending::Ready(c) => Some(c.clone()),
                        Pending::Token(t) => io.io_result(*t),
                    },
                };
                match completion {
                    None => None,
                    Some(c) => flying.remove(fd).map(|f| (f, c)),
                }
            };
            if let Some((entry, completion)) = done {
                if let Some(token) = entry.token() {
                    io.release_token(token);
                }
                self.complete(entry, completion);
                count += 1;
            }
        }
        Ok(count)
    }

    fn complete(&self, entry: InFlight, completion: IoCompletion) {
        let InFlight { handle, mut state, timed_out, complete, .. } = entry;
        let status = handle
            .with_ops(|ctx| Ok(finish_transfer(ctx, &mut state, completion, timed_out)))
            .unwrap_or_else(|e| {
                error!("cannot finish transfer on {}: {}", handle.device, e);
                TransferStatus::Error
            });
        if complete.send(state.completed(status)).is_err() {
            trace!("transfer completed after its handle was dropped");
        }
        self.event.finish_transfer();
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.event.exit();
        trace!("drop context");
    }
}

fn work_event(ctx: Weak<ContextInner>, event: Arc<EventController>, interval: Duration) {
    while event.wait_work() {
        let ctx = match ctx.upgrade() {
            Some(c) => c,
            None => break,
        };
        if let Err(e) = ctx.handle_events(interval) {
            warn!("event handling failed: {}", e);
        }
    }
    trace!("event_finish");
}

/// A view of the devices on the system and the transfers running on them.
///
/// Every context shares the identity table and hotplug listener of its
/// [crate::Platform].
pub struct UsbContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl UsbContext {
    pub(crate) fn new(platform: Arc<PlatformInner>, initial_scan: bool) -> Result<Self> {
        let inner = ContextInner::new(platform)?;
        let s = Self { inner };
        if initial_scan {
            s.scan_devices()?;
        }
        Ok(s)
    }

    /// Enumerate every hub and device currently present.
    pub fn scan_devices(&self) -> Result {
        self.inner.scan_devices()
    }

    /// Bring the device with instance id `device_id` into the context.
    pub fn enumerate_device(&self, device_id: &str, class: &Guid) -> Result<Arc<UsbDevice>> {
        let platform = self.inner.platform.clone();
        let _g = platform.registry_lock.lock()?;
        let session = self.inner.enumerate_device_locked(device_id, class)?;
        self.inner.device(session).ok_or(Error::NotFound)
    }

    /// Apply an interface arrival or removal to every live context of the platform.
    pub fn handle_device_change(&self, interface_path: &str, class: &Guid, added: bool) {
        crate::hotplug::apply_change(&self.inner.platform, interface_path, class, added);
    }

    pub fn device_list(&self) -> Result<Vec<Arc<UsbDevice>>> {
        Ok(self.inner.sessions.read()?.values().cloned().collect())
    }

    pub fn device_by_session(&self, session: SessionId) -> Option<Arc<UsbDevice>> {
        self.inner.device(session)
    }

    pub fn open_device_with_vid_pid(&self, vendor_id: u16, product_id: u16) -> Result<DeviceHandle> {
        for device in self.device_list()? {
            if device.vid() == vendor_id && device.pid() == product_id && device.is_connected() {
                return device.open();
            }
        }
        Err(Error::NotFound)
    }

    /// Run one round of the event loop on the calling thread.
    pub fn handle_events(&self, timeout: Duration) -> Result<usize> {
        self.inner.handle_events(timeout)
    }

    pub fn pollfds(&self) -> Vec<PollFd> {
        self.inner.pollfds()
    }

    pub fn handle_ready_descriptors(&self, fds: &[PollFd]) -> Result<usize> {
        self.inner.handle_ready_descriptors(fds)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;
    use crate::error::*;
    use crate::platform::Platform;
    use crate::sim::{SimCall, SimOs};
    use crate::transfer::{TransferRequest, TransferStatus};
    use crate::utils::test::init;
    use crate::UsbContext;

    fn winusb() -> (Arc<SimOs>, UsbContext) {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_5678\\SN1", 0x1234, 0x5678);
        let platform = Platform::builder()
            .hotplug(false)
            .poll_interval(Duration::from_millis(10))
            .build(sim.services())
            .unwrap();
        let ctx = platform.new_context().unwrap();
        (sim, ctx)
    }

    #[tokio::test]
    async fn cancel_completes_exactly_once() {
        let (sim, ctx) = winusb();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        handle.claim_interface(0).unwrap();

        let submit = handle.submit(TransferRequest::bulk_in(0x81, 64)).unwrap();
        let token = submit.cancel_token();
        assert_eq!(ctx.pollfds().len(), 1);
        token.cancel().unwrap();

        let done = submit.await.unwrap();
        assert_eq!(done.status, TransferStatus::Cancelled);
        assert!(ctx.pollfds().is_empty());
        assert_eq!(token.cancel(), Err(Error::NotFound));
        assert!(sim.calls().contains(&SimCall::AbortPipe(0x81)));
    }

    #[tokio::test]
    async fn expired_transfers_time_out() {
        let (sim, ctx) = winusb();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        handle.claim_interface(0).unwrap();

        let submit = handle.submit(TransferRequest::bulk_in(0x81, 64).timeout(Duration::from_secs(5))).unwrap();
        sim.advance(Duration::from_secs(6));
        assert_eq!(submit.await.unwrap().into_result().err(), Some(Error::Timeout));
        assert_eq!(sim.pending_io(), 0);
    }

    #[tokio::test]
    async fn closing_a_handle_cancels_its_transfers() {
        let (_sim, ctx) = winusb();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        handle.claim_interface(0).unwrap();
        let submit = handle.submit(TransferRequest::bulk_in(0x81, 64)).unwrap();
        handle.close();
        assert_eq!(submit.await.unwrap().status, TransferStatus::Cancelled);
        assert!(ctx.pollfds().is_empty());
    }

    #[test]
    fn events_can_run_on_the_caller_thread() {
        let (sim, ctx) = winusb();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        handle.claim_interface(0).unwrap();
        let submit = handle.submit(TransferRequest::bulk_out(0x02, &[1, 2, 3])).unwrap();
        let fds = ctx.pollfds();
        // the event thread may have been first
        let _ = ctx.handle_ready_descriptors(&fds).unwrap();
        let done = futures::executor::block_on(submit).unwrap();
        assert_eq!(done.actual_length, 3);
        assert!(sim.calls().contains(&SimCall::WritePipe(0x02, vec![1, 2, 3])));
    }
}
