//! WinUSB-like driver stacks: one file handle per interface path, one API handle per claimed interface.
use log::{debug, error, warn};
use crate::backend::{Backend, BackendOps, OpCtx, SubApi};
use crate::define::*;
use crate::error::*;
use crate::handle::InterfaceHandle;
use crate::os::*;
use crate::transfer::{TransferState, TransferStatus};

pub(crate) struct DirectBackend(pub(crate) SubApi);

impl DirectBackend {
    fn backend(&self) -> Backend {
        Backend::DirectAccess(self.0)
    }

    fn check_available(&self, ctx: &OpCtx) -> Result {
        if ctx.platform.is_available(self.backend()) {
            Ok(())
        } else {
            Err(Error::Access)
        }
    }

    fn api(&self, ctx: &OpCtx, iface: usize) -> Result<OsHandle> {
        ctx.handle.interfaces.get(iface).and_then(|h| h.api).ok_or(Error::NotFound)
    }
}

impl BackendOps for DirectBackend {
    fn name(&self) -> &'static str {
        self.0.driver_name()
    }

    fn init(&self, os: &OsServices) -> bool {
        os.direct.available(self.0)
    }

    fn open(&self, ctx: &mut OpCtx) -> Result {
        self.check_available(ctx)?;
        for i in 0..MAX_INTERFACES {
            if ctx.node.slots.backend(i) != self.backend() {
                continue;
            }
            let path = match ctx.node.slots.path(i) {
                Some(p) => p.to_string(),
                None => continue,
            };
            let file = ctx.os().io.open(&path, Access::ReadWrite).map_err(|e| {
                error!("could not open device {} (interface {}): {}", path, i, e);
                match e {
                    OsError::FileNotFound => Error::NoDevice,
                    OsError::AccessDenied => Error::Access,
                    other => Error::Io(other.to_string()),
                }
            })?;
            let h = &mut ctx.handle.interfaces[i];
            h.file = Some(file);
            h.path = Some(path);
            h.backend = self.backend();
        }
        Ok(())
    }

    fn close(&self, ctx: &mut OpCtx) {
        for i in (0..MAX_INTERFACES).rev() {
            if ctx.handle.interfaces[i].backend != self.backend() {
                continue;
            }
            let h = std::mem::take(&mut ctx.handle.interfaces[i]);
            self.close_interface(ctx.os(), h);
        }
    }

    fn close_interface(&self, os: &OsServices, h: InterfaceHandle) {
        if let Some(api) = h.api {
            os.direct.free(self.0, api);
        }
        if let Some(file) = h.file {
            os.io.close(file);
        }
    }

    fn configure_endpoints(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        self.check_available(ctx)?;
        let api = self.api(ctx, iface)?;
        let direct = ctx.os().direct.clone();
        let endpoints = ctx.node.slots.get(iface).map(|s| s.endpoints.clone()).unwrap_or_default();

        for ep in std::iter::once(0u8).chain(endpoints) {
            if direct.set_pipe_policy(self.0, api, ep, PipePolicy::TransferTimeout(0)).is_err() {
                debug!("failed to set PIPE_TRANSFER_TIMEOUT for endpoint {:02X}", ep);
            }
            if ep == 0 || self.0 == SubApi::Libusb0 {
                continue;
            }
            for policy in [
                PipePolicy::ShortPacketTerminate(false),
                PipePolicy::IgnoreShortPackets(false),
                PipePolicy::AllowPartialReads(true),
                PipePolicy::AutoClearStall(true),
            ] {
                if direct.set_pipe_policy(self.0, api, ep, policy).is_err() {
                    debug!("failed to set {:?} for endpoint {:02X}", policy, ep);
                }
            }
        }
        Ok(())
    }

    fn claim_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        self.check_available(ctx)?;
        let direct = ctx.os().direct.clone();
        let composite = ctx.device.backend == Backend::Composite;

        if composite || iface == 0 {
            let file = ctx.handle.interfaces[iface].file.ok_or(Error::NotFound)?;
            let api = direct.initialize(self.0, file).map_err(|e| {
                error!("could not access interface {}: {}", iface, e);
                match e {
                    OsError::BadCommand => Error::NoDevice,
                    _ => Error::Access,
                }
            })?;
            ctx.handle.interfaces[iface].api = Some(api);
            ctx.handle.interfaces[iface].backend = self.backend();
        } else {
            let first = match ctx.handle.interfaces[0].api {
                Some(api) => api,
                None => {
                    let file = ctx.handle.interfaces[0].file.ok_or(Error::Access)?;
                    match direct.initialize(self.0, file) {
                        Ok(api) => {
                            warn!("auto-claimed interface 0 (required to claim {} with {})", iface, self.0.driver_name());
                            ctx.handle.interfaces[0].api = Some(api);
                            ctx.handle.interfaces[0].backend = self.backend();
                            api
                        }
                        Err(e) => {
                            warn!("failed to auto-claim interface 0 (required to claim {}): {}", iface, e);
                            return Err(Error::Access);
                        }
                    }
                }
            };
            let api = direct.associated_interface(self.0, first, (iface - 1) as u8).map_err(|e| match e {
                OsError::NoMoreItems => Error::NotFound,
                OsError::BadCommand => Error::NoDevice,
                OsError::AlreadyExists => Error::Busy,
                other => {
                    error!("could not claim interface {}: {}", iface, other);
                    Error::Access
                }
            })?;
            ctx.handle.interfaces[iface].api = Some(api);
            ctx.handle.interfaces[iface].backend = self.backend();
        }
        debug!("claimed interface {}", iface);
        ctx.handle.active_interface = iface;
        Ok(())
    }

    fn release_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        self.check_available(ctx)?;
        let api = ctx.handle.interfaces[iface].api.take().ok_or(Error::NotFound)?;
        ctx.os().direct.free(self.0, api);
        Ok(())
    }

    fn set_interface_altsetting(&self, ctx: &mut OpCtx, iface: usize, alt: u8) -> Result {
        self.check_available(ctx)?;
        let api = self.api(ctx, iface).map_err(|e| {
            error!("interface must be claimed first");
            e
        })?;
        ctx.os().direct.set_current_alternate_setting(self.0, api, alt).map_err(|e| {
            error!("SetCurrentAlternateSetting failed: {}", e);
            Error::Io(e.to_string())
        })
    }

    fn clear_halt(&self, ctx: &mut OpCtx, endpoint: u8) -> Result {
        self.check_available(ctx)?;
        let iface = ctx.interface_by_endpoint(endpoint).ok_or_else(|| {
            error!("unable to match endpoint to an open interface, cannot clear");
            Error::NotFound
        })?;
        debug!("matched endpoint {:02X} with interface {}", endpoint, iface);
        let api = self.api(ctx, iface)?;
        ctx.os().direct.reset_pipe(self.0, api, endpoint).map_err(|e| {
            error!("ResetPipe failed: {}", e);
            Error::NoDevice
        })
    }

    fn reset_device(&self, ctx: &mut OpCtx) -> Result {
        self.check_available(ctx)?;
        let direct = ctx.os().direct.clone();
        for i in 0..MAX_INTERFACES {
            let api = match ctx.handle.interfaces[i].api {
                Some(api) => api,
                None => continue,
            };
            let endpoints = ctx.node.slots.get(i).map(|s| s.endpoints.clone()).unwrap_or_default();
            for ep in endpoints {
                debug!("resetting ep {:02X}", ep);
                if let Err(e) = direct.abort_pipe(self.0, api, ep) {
                    error!("AbortPipe (pipe address {:02X}) failed: {}", ep, e);
                }
                if Direction::of_endpoint(ep) == Direction::In {
                    if let Err(e) = direct.flush_pipe(self.0, api, ep) {
                        error!("FlushPipe (pipe address {:02X}) failed: {}", ep, e);
                    }
                }
                if let Err(e) = direct.reset_pipe(self.0, api, ep) {
                    error!("ResetPipe (pipe address {:02X}) failed: {}", ep, e);
                }
            }
        }
        if direct.supports_reset_device(self.0) {
            if let Some(api) = ctx.handle.interfaces[0].api {
                if let Err(e) = direct.reset_device(self.0, api) {
                    warn!("device reset failed: {}", e);
                }
            }
        }
        Ok(())
    }

    fn submit_control(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        self.check_available(ctx)?;
        if t.length > MAX_CTRL_BUFFER_LENGTH {
            return Err(Error::InvalidParam);
        }
        let iface = ctx.control_interface(t, self.backend())?;
        debug!("will use interface {}", iface);
        let api = self.api(ctx, iface)?;
        t.io_handle = Some(api);

        let setup = t.setup;
        if setup.transfer_type() == UsbControlTransferType::Standard
            && setup.request == REQUEST_SET_CONFIGURATION {
            if setup.value != ctx.node.active_config as u16 {
                warn!("cannot set configuration other than the default one");
                return Err(Error::InvalidParam);
            }
            return Ok(Submitted::Immediate(IoCompletion::success(0, vec![])));
        }

        let data = match setup.direction() {
            Direction::Out => t.buffer.clone(),
            Direction::In => vec![],
        };
        ctx.os().direct.control_transfer(self.0, api, setup, &data).map_err(|e| {
            warn!("ControlTransfer failed: {}", e);
            Error::Io(e.to_string())
        })
    }

    fn submit_bulk(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        self.check_available(ctx)?;
        let iface = ctx.interface_by_endpoint(t.endpoint).ok_or_else(|| {
            error!("unable to match endpoint to an open interface, cancelling transfer");
            Error::NotFound
        })?;
        debug!("matched endpoint {:02X} with interface {}", t.endpoint, iface);
        let api = self.api(ctx, iface)?;
        t.interface = Some(iface);
        t.io_handle = Some(api);

        let direct = ctx.os().direct.clone();
        let r = match t.direction {
            Direction::In => {
                debug!("reading {} bytes", t.length);
                direct.read_pipe(self.0, api, t.endpoint, t.length)
            }
            Direction::Out => {
                debug!("writing {} bytes", t.length);
                direct.write_pipe(self.0, api, t.endpoint, &t.buffer)
            }
        };
        r.map_err(|e| {
            error!("ReadPipe/WritePipe failed: {}", e);
            Error::Io(e.to_string())
        })
    }

    fn abort_control(&self, ctx: &mut OpCtx, t: &TransferState) -> Result {
        let handle = t.io_handle.ok_or(Error::NotFound)?;
        ctx.os().io.cancel_io(handle).map_err(|e| Error::Io(e.to_string()))
    }

    fn abort_transfers(&self, ctx: &mut OpCtx, t: &TransferState) -> Result {
        self.check_available(ctx)?;
        let iface = t.interface.filter(|i| *i < MAX_INTERFACES).ok_or_else(|| {
            error!("transfer has no valid interface number");
            Error::NotFound
        })?;
        debug!("will use interface {}", iface);
        let api = self.api(ctx, iface)?;
        ctx.os().direct.abort_pipe(self.0, api, t.endpoint).map_err(|e| {
            error!("AbortPipe failed: {}", e);
            Error::NoDevice
        })
    }

    fn copy_transfer_data(&self, _ctx: &mut OpCtx, t: &mut TransferState, completion: IoCompletion) -> TransferStatus {
        t.actual_length += completion.transferred;
        if t.direction == Direction::In {
            t.buffer = completion.data;
        }
        TransferStatus::Completed
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use crate::backend::{Backend, SubApi};
    use crate::define::*;
    use crate::error::*;
    use crate::os::PipePolicy;
    use crate::platform::Platform;
    use crate::sim::{SimCall, SimOs};
    use crate::transfer::*;
    use crate::utils::test::init;

    fn setup() -> (std::sync::Arc<SimOs>, crate::UsbContext) {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let dev = sim.add_device(root, 1, "USB\\VID_1234&PID_5678\\SN", 0x1234, 0x5678);
        sim.set_driver(dev, "libusbK");
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        (sim, ctx)
    }

    #[tokio::test]
    async fn bulk_round_trip() {
        let (sim, ctx) = setup();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        assert_eq!(handle.device().backend(), Backend::DirectAccess(SubApi::LibusbK));
        handle.claim_interface(0).unwrap();

        sim.queue_read(0x81, vec![1, 2, 3]);
        let data = handle.bulk_transfer_in(0x01, 64, Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        let n = handle.bulk_transfer_out(0x02, &[9; 10], Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 10);
        assert!(sim.calls().contains(&SimCall::WritePipe(0x02, vec![9; 10])));
        assert!(sim.calls().contains(&SimCall::PipePolicy(0x81, PipePolicy::AllowPartialReads(true))));
    }

    #[tokio::test]
    async fn unclaimed_endpoint_is_rejected() {
        let (_sim, ctx) = setup();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        let r = handle.submit(TransferRequest::bulk_in(0x81, 8));
        assert_eq!(r.err(), Some(Error::NotFound));
        assert_eq!(handle.release_interface(0), Err(Error::NotFound));
    }

    #[tokio::test]
    async fn set_configuration_only_accepts_the_active_one() {
        let (sim, ctx) = setup();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        handle.set_configuration(1).await.unwrap();
        assert_eq!(handle.set_configuration(2).await, Err(Error::InvalidParam));
        assert_eq!(handle.set_configuration(8).await, Err(Error::InvalidParam));
        assert!(!sim.calls().iter().any(|c| matches!(c, SimCall::ControlTransfer(_))));
        // auto-claim made for the request is gone again
        assert_eq!(handle.auto_claim_count(0), 0);
    }

    #[tokio::test]
    async fn stall_and_oversized_control() {
        let (sim, ctx) = setup();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        handle.claim_interface(0).unwrap();
        let big = TransferRequest::control(
            ControlSetup::new(Direction::In, UsbControlTransferType::Vendor, UsbControlRecipient::Device, 1, 0, 0, 5000), &[]);
        assert_eq!(handle.submit(big).err(), Some(Error::InvalidParam));

        sim.fail_next_io(crate::os::IoStatus::GenFailure);
        let r = handle.control_transfer_in(ControlTransferRequest {
            transfer_type: UsbControlTransferType::Vendor,
            request: 0x10,
            ..Default::default()
        }, 16).await;
        assert_eq!(r, Err(Error::Pipe));
    }

    #[tokio::test]
    async fn control_keeps_the_interface_selection_error() {
        let (_sim, ctx) = setup();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        let platform = handle.shared.platform.clone();
        let poisoned = std::thread::spawn(move || {
            let _g = platform.autoclaim_lock.lock().unwrap();
            panic!("poisoning the auto-claim lock");
        }).join();
        assert!(poisoned.is_err());

        let r = handle.submit(TransferRequest::control_in(ControlTransferRequest {
            transfer_type: UsbControlTransferType::Vendor,
            request: 0x10,
            ..Default::default()
        }, 4));
        assert!(matches!(r.err(), Some(Error::Other(_))));
        assert_eq!(handle.auto_claim_count(0), 0);
    }
}
