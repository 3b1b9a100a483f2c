//! Devices bound to the generic composite parent driver.
//!
//! Every interface is its own leaf with its own driver, so most operations
//! are forwarded to the backend of the slot they touch.
use log::{debug, error};
use crate::backend::{Backend, BackendOps, OpCtx, SubApi};
use crate::define::*;
use crate::error::*;
use crate::os::*;
use crate::transfer::{TransferState, TransferStatus};

pub(crate) struct CompositeBackend;

impl CompositeBackend {
    /// Direct access sub-backends serving at least one slot, in probe order.
    fn direct_backends(ctx: &OpCtx) -> Vec<Backend> {
        SubApi::ALL.iter()
            .map(|sub| Backend::DirectAccess(*sub))
            .filter(|b| ctx.node.slots.iter().any(|s| s.backend == *b))
            .collect()
    }

    fn slot_ops(ctx: &OpCtx, iface: usize) -> &'static dyn BackendOps {
        ctx.node.slots.backend(iface).ops()
    }

    fn transfer_ops(ctx: &OpCtx, t: &TransferState) -> Result<&'static dyn BackendOps> {
        let iface = t.interface.filter(|i| *i < MAX_INTERFACES).ok_or_else(|| {
            error!("transfer is not bound to an interface");
            Error::NotFound
        })?;
        Ok(Self::slot_ops(ctx, iface))
    }

    fn endpoint_ops(ctx: &OpCtx, endpoint: u8) -> Result<&'static dyn BackendOps> {
        let iface = ctx.interface_by_endpoint(endpoint).ok_or_else(|| {
            error!("unable to match endpoint {:02X} to an open interface", endpoint);
            Error::NotFound
        })?;
        Ok(Self::slot_ops(ctx, iface))
    }
}

impl BackendOps for CompositeBackend {
    fn name(&self) -> &'static str {
        "Composite"
    }

    fn init(&self, _os: &OsServices) -> bool {
        true
    }

    fn open(&self, ctx: &mut OpCtx) -> Result {
        let direct = Self::direct_backends(ctx);
        let hid = ctx.node.slots.iter().any(|s| s.backend == Backend::Hid);
        if direct.is_empty() && !hid {
            return Err(Error::NotFound);
        }
        for backend in direct {
            backend.ops().open(ctx)?;
        }
        if hid {
            Backend::Hid.ops().open(ctx)?;
        }
        Ok(())
    }

    fn close(&self, ctx: &mut OpCtx) {
        for i in (0..MAX_INTERFACES).rev() {
            let h = std::mem::take(&mut ctx.handle.interfaces[i]);
            h.backend.ops().close_interface(ctx.os(), h);
        }
    }

    fn configure_endpoints(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        Self::slot_ops(ctx, iface).configure_endpoints(ctx, iface)
    }

    fn claim_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        Self::slot_ops(ctx, iface).claim_interface(ctx, iface)
    }

    fn release_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        Self::slot_ops(ctx, iface).release_interface(ctx, iface)
    }

    fn set_interface_altsetting(&self, ctx: &mut OpCtx, iface: usize, alt: u8) -> Result {
        Self::slot_ops(ctx, iface).set_interface_altsetting(ctx, iface, alt)
    }

    fn clear_halt(&self, ctx: &mut OpCtx, endpoint: u8) -> Result {
        Self::endpoint_ops(ctx, endpoint)?.clear_halt(ctx, endpoint)
    }

    fn reset_device(&self, ctx: &mut OpCtx) -> Result {
        for backend in Self::direct_backends(ctx) {
            backend.ops().reset_device(ctx)?;
        }
        Ok(())
    }

    fn submit_control(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        if let Some(iface) = t.interface_hint.filter(|i| ctx.node.slots.path(*i).is_some()) {
            debug!("using requested interface {}", iface);
            return Self::slot_ops(ctx, iface).submit_control(ctx, t);
        }
        // HID keyboards and mice only allow restricted access, try them last
        for pass in 0..2 {
            for iface in 0..MAX_INTERFACES {
                let slot = match ctx.node.slots.get(iface) {
                    Some(s) if s.path.is_some() => s,
                    _ => continue,
                };
                if pass == 0 && slot.restricted {
                    debug!("trying to skip restricted interface #{} (HID keyboard or mouse?)", iface);
                    continue;
                }
                debug!("using interface {}", iface);
                let ops = slot.backend.ops();
                return ops.submit_control(ctx, t);
            }
        }
        error!("no supported interfaces to complete request");
        Err(Error::NotFound)
    }

    fn submit_bulk(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        Self::endpoint_ops(ctx, t.endpoint)?.submit_bulk(ctx, t)
    }

    fn submit_iso(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        Self::endpoint_ops(ctx, t.endpoint)?.submit_iso(ctx, t)
    }

    fn abort_control(&self, ctx: &mut OpCtx, t: &TransferState) -> Result {
        Self::transfer_ops(ctx, t)?.abort_control(ctx, t)
    }

    fn abort_transfers(&self, ctx: &mut OpCtx, t: &TransferState) -> Result {
        Self::transfer_ops(ctx, t)?.abort_transfers(ctx, t)
    }

    fn copy_transfer_data(&self, ctx: &mut OpCtx, t: &mut TransferState, completion: IoCompletion) -> TransferStatus {
        match Self::transfer_ops(ctx, t) {
            Ok(ops) => ops.copy_transfer_data(ctx, t, completion),
            Err(_) => TransferStatus::Error,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;
    use crate::backend::{Backend, SubApi};
    use crate::define::*;
    use crate::error::*;
    use crate::platform::Platform;
    use crate::sim::{SimCall, SimOs};
    use crate::utils::test::init;
    use crate::UsbContext;

    fn composite() -> (Arc<SimOs>, UsbContext) {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let comp = sim.add_device(root, 1, "USB\\VID_1234&PID_0100\\SN1", 0x1234, 0x0100);
        sim.set_driver(comp, "usbccgp");
        sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_00\\7&1", "WinUSB", None);
        sim.add_interface_node(comp, "HID\\VID_1234&PID_0100&MI_01\\8&1", "HidUsb", Some(sim.hid_guid()));
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        (sim, ctx)
    }

    #[tokio::test]
    async fn interfaces_keep_their_own_backend() {
        let (sim, ctx) = composite();
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x0100).unwrap();
        handle.claim_interface(0).unwrap();
        handle.claim_interface(1).unwrap();
        assert_eq!(handle.claim_interface(5), Err(Error::NotSupported));

        sim.queue_read(0x81, vec![5; 4]);
        let data = handle.bulk_transfer_in(0x81, 64, Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, vec![5; 4]);

        sim.queue_hid_report(vec![0, 9]);
        let report = handle.interrupt_transfer_in(0x83, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report, vec![9]);

        let slots = handle.device().interface_slots().unwrap();
        assert_eq!(slots.get(0).unwrap().backend(), Backend::DirectAccess(SubApi::WinUsb));
        assert_eq!(slots.get(1).unwrap().backend(), Backend::Hid);
        assert!(sim.calls().iter().any(|c| matches!(c, SimCall::ReadPipe(0x81, _))));
    }

    #[tokio::test]
    async fn control_skips_restricted_interfaces_first() {
        let (sim, ctx) = composite();
        let hid_path = ctx.device_list().unwrap().into_iter()
            .find(|d| d.pid() == 0x100).unwrap()
            .interface_slots().unwrap().get(1).unwrap().path().unwrap().to_string();
        sim.deny_read_write(&hid_path);

        let handle = ctx.open_device_with_vid_pid(0x1234, 0x0100).unwrap();
        assert!(handle.device().interface_slots().unwrap().get(1).unwrap().is_restricted());

        handle.control_transfer_in(ControlTransferRequest {
            transfer_type: UsbControlTransferType::Vendor,
            request: 0x01,
            ..Default::default()
        }, 4).await.unwrap();
        assert!(sim.calls().iter().any(|c| matches!(c, SimCall::ControlTransfer(_))));
        assert_eq!(handle.auto_claim_count(0), 0);
    }
}
