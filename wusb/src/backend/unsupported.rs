use log::debug;
use crate::backend::{BackendOps, OpCtx};
use crate::error::*;
use crate::os::{IoCompletion, OsServices, Submitted};
use crate::transfer::{TransferState, TransferStatus};

/// Hubs and devices without a usable driver: listed, never operated.
pub(crate) struct InertBackend {
    pub(crate) name: &'static str,
}

impl BackendOps for InertBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&self, _os: &OsServices) -> bool {
        true
    }

    fn open(&self, _ctx: &mut OpCtx) -> Result {
        Err(Error::NotSupported)
    }

    fn close(&self, ctx: &mut OpCtx) {
        debug!("close on {} backend for {} ignored", self.name, ctx.device);
    }

    fn configure_endpoints(&self, _ctx: &mut OpCtx, _iface: usize) -> Result {
        Err(Error::NotSupported)
    }

    fn claim_interface(&self, _ctx: &mut OpCtx, _iface: usize) -> Result {
        Err(Error::NotSupported)
    }

    fn release_interface(&self, _ctx: &mut OpCtx, _iface: usize) -> Result {
        Err(Error::NotSupported)
    }

    fn set_interface_altsetting(&self, _ctx: &mut OpCtx, _iface: usize, _alt: u8) -> Result {
        Err(Error::NotSupported)
    }

    fn clear_halt(&self, _ctx: &mut OpCtx, _endpoint: u8) -> Result {
        Err(Error::NotSupported)
    }

    fn reset_device(&self, _ctx: &mut OpCtx) -> Result {
        Err(Error::NotSupported)
    }

    fn submit_control(&self, _ctx: &mut OpCtx, _t: &mut TransferState) -> Result<Submitted> {
        Err(Error::NotSupported)
    }

    fn submit_bulk(&self, _ctx: &mut OpCtx, _t: &mut TransferState) -> Result<Submitted> {
        Err(Error::NotSupported)
    }

    fn abort_control(&self, _ctx: &mut OpCtx, _t: &TransferState) -> Result {
        Err(Error::NotSupported)
    }

    fn abort_transfers(&self, _ctx: &mut OpCtx, _t: &TransferState) -> Result {
        Err(Error::NotSupported)
    }

    fn copy_transfer_data(&self, _ctx: &mut OpCtx, _t: &mut TransferState, _completion: IoCompletion) -> TransferStatus {
        TransferStatus::Error
    }
}
