use log::{debug, error, warn};
use crate::backend::{Backend, BackendOps, OpCtx};
use crate::define::*;
use crate::error::*;
use crate::handle::InterfaceHandle;
use crate::os::*;
use crate::transfer::{TransferState, TransferStatus};

/// Devices and interfaces bound to the HID class driver, reached through report I/O.
pub(crate) struct HidBackend;

const INPUT_REPORTS: usize = 0;
const OUTPUT_REPORTS: usize = 1;

impl HidBackend {
    fn check_available(ctx: &OpCtx) -> Result {
        if ctx.platform.is_available(Backend::Hid) {
            Ok(())
        } else {
            Err(Error::Access)
        }
    }

    fn api(ctx: &OpCtx, iface: usize) -> Result<OsHandle> {
        ctx.handle.interfaces.get(iface).and_then(|h| h.api).ok_or(Error::NotFound)
    }

    fn uses_report_ids(ctx: &OpCtx, which: usize) -> bool {
        ctx.node.hid.as_ref().map(|h| h.uses_report_ids[which]).unwrap_or(false)
    }

    /// Read what the HID stack reports about the device behind `handle`.
    fn probe(ctx: &OpCtx, handle: OsHandle) -> Result<HidDeviceInfo> {
        let hid = ctx.os().hid.clone();
        let mut info = HidDeviceInfo::default();

        let attributes = hid.attributes(handle).map_err(|e| {
            error!("could not read HID attributes: {}", e);
            Error::Io(e.to_string())
        })?;
        info.vid = attributes.vendor_id;
        info.pid = attributes.product_id;

        let mut buffers = 32;
        while hid.set_num_input_buffers(handle, buffers) {
            buffers *= 2;
        }
        debug!("set maximum input buffer size to {}", buffers / 2);

        let caps = hid.caps(handle).map_err(|e| {
            error!("could not parse HID capabilities: {}", e);
            Error::Io(e.to_string())
        })?;
        for (i, (name, ids)) in [
            ("input", &caps.input_report_ids),
            ("output", &caps.output_report_ids),
            ("feature", &caps.feature_report_ids),
        ].into_iter().enumerate() {
            let with_id = ids.iter().filter(|id| **id != 0).count();
            if with_id != 0 && with_id != ids.len() {
                warn!("program assertion failed: mixed {} report IDs", name);
            }
            info.uses_report_ids[i] = with_id != 0;
        }
        info.input_report_size = caps.input_report_length;
        info.output_report_size = caps.output_report_length;
        info.feature_report_size = caps.feature_report_length;

        let d = &ctx.device.descriptor;
        info.string_index = [d.iManufacturer, d.iProduct, d.iSerialNumber];
        for (i, which) in [HidString::Manufacturer, HidString::Product, HidString::SerialNumber].into_iter().enumerate() {
            if info.string_index[i] != 0 {
                info.strings[i] = hid.string(handle, which).unwrap_or_default();
            }
        }
        Ok(info)
    }

    fn get_descriptor(ctx: &mut OpCtx, api: OsHandle, setup: &ControlSetup) -> Result<Vec<u8>> {
        let descriptor_type = (setup.value >> 8) as u8;
        let index = (setup.value & 0xff) as u8;
        let length = setup.length as usize;
        if descriptor_type == DT_PHYSICAL {
            return ctx.os().hid.physical_descriptor(api, length).map_err(|e| Error::Io(e.to_string()));
        }
        let info = ctx.node.hid.clone().unwrap_or_default();
        let mut data = ctx.os().hid_descriptors.descriptor(&info, descriptor_type, index, length)?;
        data.truncate(length);
        Ok(data)
    }

    fn standard_request(ctx: &mut OpCtx, api: OsHandle, setup: &ControlSetup) -> Result<Vec<u8>> {
        match setup.request {
            REQUEST_GET_DESCRIPTOR => Self::get_descriptor(ctx, api, setup),
            REQUEST_GET_CONFIGURATION => Ok(vec![1u8; (setup.length as usize).min(1)]),
            REQUEST_SET_CONFIGURATION => {
                if setup.value == ctx.node.active_config as u16 {
                    Ok(vec![])
                } else {
                    warn!("cannot set configuration other than the default one");
                    Err(Error::NotSupported)
                }
            }
            REQUEST_GET_INTERFACE => Ok(vec![0u8; (setup.length as usize).min(1)]),
            REQUEST_SET_INTERFACE => {
                if setup.value == 0 {
                    Ok(vec![])
                } else {
                    Err(Error::NotSupported)
                }
            }
            other => {
                warn!("unsupported HID control request: 0x{:02X}", other);
                Err(Error::InvalidParam)
            }
        }
    }

    fn report_request(ctx: &mut OpCtx, api: OsHandle, t: &mut TransferState) -> Result<Submitted> {
        let setup = t.setup;
        let kind = HidReportKind::from_report_type((setup.value >> 8) as u8);
        let id = (setup.value & 0xff) as u8;
        let size = t.length;
        if size == 0 || size > MAX_HID_REPORT_SIZE {
            return Err(Error::InvalidParam);
        }
        let hid = ctx.os().hid.clone();
        let r = match (setup.request, kind) {
            (HID_REQ_GET_REPORT, Some(kind @ (HidReportKind::Input | HidReportKind::Feature))) => {
                t.hid_report = true;
                t.hid_expected = if id == 0 { size + 1 } else { size };
                debug!("report ID: 0x{:02X}", id);
                hid.get_report(api, kind, id, t.hid_expected + 1)
            }
            (HID_REQ_SET_REPORT, Some(kind @ (HidReportKind::Output | HidReportKind::Feature))) => {
                t.hid_report = true;
                t.hid_expected = if id == 0 { size + 1 } else { size };
                debug!("report ID: 0x{:02X}", id);
                let mut data = Vec::with_capacity(size + 1);
                if id == 0 {
                    data.push(0);
                }
                data.extend_from_slice(&t.buffer);
                hid.set_report(api, kind, &data)
            }
            _ => {
                warn!("unsupported HID class request 0x{:02X} (value {:04X})", setup.request, setup.value);
                return Err(Error::InvalidParam);
            }
        };
        r.map_err(|e| {
            debug!("HID report request failed: {}", e);
            Error::Io(e.to_string())
        })
    }
}

impl BackendOps for HidBackend {
    fn name(&self) -> &'static str {
        "HID"
    }

    fn init(&self, os: &OsServices) -> bool {
        os.hid.available()
    }

    fn open(&self, ctx: &mut OpCtx) -> Result {
        Self::check_available(ctx)?;
        let io = ctx.os().io.clone();
        let mut first = None;
        for i in 0..MAX_INTERFACES {
            if ctx.node.slots.backend(i) != Backend::Hid {
                continue;
            }
            let path = match ctx.node.slots.path(i) {
                Some(p) => p.to_string(),
                None => continue,
            };
            let handle = match io.open(&path, Access::ReadWrite) {
                Ok(h) => h,
                Err(e) => {
                    warn!("could not open HID device in R/W mode (keyboard or mouse?) {}: {}, trying without", path, e);
                    let h = io.open(&path, Access::QueryOnly).map_err(|e| {
                        error!("could not open device {} (HID interface {}): {}", path, i, e);
                        Error::Io(e.to_string())
                    })?;
                    ctx.node.slots.set_restricted(i, true);
                    h
                }
            };
            let slot = &mut ctx.handle.interfaces[i];
            slot.api = Some(handle);
            slot.hid_open = true;
            slot.path = Some(path);
            slot.backend = Backend::Hid;
            first.get_or_insert(handle);
        }

        let handle = match first {
            Some(h) => h,
            None => {
                debug!("no HID interface to open on {}", ctx.device);
                return Ok(());
            }
        };
        let info = Self::probe(ctx, handle)?;
        debug!("HID {:04X}:{:04X}, report sizes in/out/feature {}/{}/{}",
               info.vid, info.pid, info.input_report_size, info.output_report_size, info.feature_report_size);
        ctx.node.hid = Some(info);
        Ok(())
    }

    fn close(&self, ctx: &mut OpCtx) {
        for i in 0..MAX_INTERFACES {
            if ctx.handle.interfaces[i].backend != Backend::Hid {
                continue;
            }
            let h = std::mem::take(&mut ctx.handle.interfaces[i]);
            self.close_interface(ctx.os(), h);
        }
    }

    fn close_interface(&self, os: &OsServices, h: InterfaceHandle) {
        if let Some(api) = h.api {
            os.io.close(api);
        }
    }

    fn configure_endpoints(&self, _ctx: &mut OpCtx, _iface: usize) -> Result {
        Ok(())
    }

    fn claim_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        Self::check_available(ctx)?;
        if ctx.node.slots.path(iface).is_none() {
            return Err(Error::NotFound);
        }
        let slot = &mut ctx.handle.interfaces[iface];
        if slot.hid_claimed {
            return Err(Error::Busy);
        }
        slot.hid_claimed = true;
        debug!("claimed interface {}", iface);
        ctx.handle.active_interface = iface;
        Ok(())
    }

    fn release_interface(&self, ctx: &mut OpCtx, iface: usize) -> Result {
        Self::check_available(ctx)?;
        let slot = &mut ctx.handle.interfaces[iface];
        if !slot.hid_claimed {
            return Err(Error::NotFound);
        }
        slot.hid_claimed = false;
        Ok(())
    }

    fn set_interface_altsetting(&self, ctx: &mut OpCtx, _iface: usize, alt: u8) -> Result {
        Self::check_available(ctx)?;
        if alt != 0 {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    fn clear_halt(&self, ctx: &mut OpCtx, endpoint: u8) -> Result {
        Self::check_available(ctx)?;
        let iface = ctx.interface_by_endpoint(endpoint).ok_or_else(|| {
            error!("unable to match endpoint to an open interface, cannot clear");
            Error::NotFound
        })?;
        debug!("matched endpoint {:02X} with interface {}", endpoint, iface);
        let api = Self::api(ctx, iface)?;
        ctx.os().hid.flush_queue(api).map_err(|e| {
            error!("flushing HID queue failed: {}", e);
            Error::NoDevice
        })
    }

    fn reset_device(&self, ctx: &mut OpCtx) -> Result {
        Self::check_available(ctx)?;
        let hid = ctx.os().hid.clone();
        for i in 0..MAX_INTERFACES {
            if let Some(api) = ctx.handle.interfaces[i].api.filter(|_| ctx.handle.interfaces[i].hid_open) {
                if let Err(e) = hid.flush_queue(api) {
                    debug!("flushing HID queue of interface {} failed: {}", i, e);
                }
            }
        }
        Ok(())
    }

    fn submit_control(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        Self::check_available(ctx)?;
        if t.length > MAX_CTRL_BUFFER_LENGTH {
            return Err(Error::InvalidParam);
        }
        let iface = ctx.control_interface(t, Backend::Hid)?;
        debug!("will use interface {}", iface);
        let api = Self::api(ctx, iface)?;
        t.io_handle = Some(api);

        let setup = t.setup;
        match setup.transfer_type() {
            UsbControlTransferType::Standard => {
                let data = Self::standard_request(ctx, api, &setup)?;
                Ok(Submitted::Immediate(IoCompletion::success(data.len(), data)))
            }
            UsbControlTransferType::Class => Self::report_request(ctx, api, t),
            _ => {
                warn!("unsupported HID control request type 0x{:02X}", setup.request_type);
                Err(Error::InvalidParam)
            }
        }
    }

    fn submit_bulk(&self, ctx: &mut OpCtx, t: &mut TransferState) -> Result<Submitted> {
        Self::check_available(ctx)?;
        let iface = ctx.interface_by_endpoint(t.endpoint).ok_or_else(|| {
            error!("unable to match endpoint to an open interface, cancelling transfer");
            Error::NotFound
        })?;
        debug!("matched endpoint {:02X} with interface {}", t.endpoint, iface);
        let api = Self::api(ctx, iface)?;
        t.interface = Some(iface);
        t.io_handle = Some(api);

        let which = match t.direction {
            Direction::In => INPUT_REPORTS,
            Direction::Out => OUTPUT_REPORTS,
        };
        let prefixed = !Self::uses_report_ids(ctx, which);
        t.hid_report = true;
        t.hid_expected = if prefixed { t.length + 1 } else { t.length };

        let hid = ctx.os().hid.clone();
        let r = match t.direction {
            Direction::In => {
                debug!("reading {} bytes (report ID: 0x00)", t.hid_expected);
                // one more byte than expected to detect overflows
                hid.read_report(api, t.hid_expected + 1)
            }
            Direction::Out => {
                let mut data = Vec::with_capacity(t.hid_expected);
                if prefixed {
                    data.push(0);
                }
                data.extend_from_slice(&t.buffer);
                debug!("writing {} bytes (report ID: 0x{:02X})", data.len(), data.first().copied().unwrap_or(0));
                hid.write_report(api, &data)
            }
        };
        r.map_err(|e| {
            error!("HID transfer failed: {}", e);
            Error::Io(e.to_string())
        })
    }

    fn abort_control(&self, ctx: &mut OpCtx, t: &TransferState) -> Result {
        let handle = t.io_handle.ok_or(Error::NotFound)?;
        ctx.os().io.cancel_io(handle).map_err(|e| Error::Io(e.to_string()))
    }

    fn abort_transfers(&self, ctx: &mut OpCtx, t: &TransferState) -> Result {
        let handle = t.io_handle.ok_or(Error::NotFound)?;
        ctx.os().io.cancel_io(handle).map_err(|e| {
            error!("cancelling HID I/O failed: {}", e);
            Error::NoDevice
        })
    }

    fn copy_transfer_data(&self, _ctx: &mut OpCtx, t: &mut TransferState, completion: IoCompletion) -> TransferStatus {
        if !t.hid_report {
            t.actual_length += completion.transferred;
            if t.direction == Direction::In {
                t.buffer = completion.data;
            }
            return TransferStatus::Completed;
        }
        if t.direction == Direction::Out {
            let prefix = t.hid_expected.saturating_sub(t.length);
            t.actual_length += completion.transferred.min(t.hid_expected).saturating_sub(prefix);
            return TransferStatus::Completed;
        }

        let mut data = completion.data;
        data.truncate(completion.transferred);
        let mut status = TransferStatus::Completed;
        if data.len() > t.hid_expected {
            debug!("HID report overflow: {} bytes for a {} byte buffer", data.len(), t.hid_expected);
            data.truncate(t.hid_expected);
            status = TransferStatus::Overflow;
        }
        if data.first() == Some(&0) {
            // report ID prefix
            data.remove(0);
        }
        t.actual_length += data.len();
        t.buffer = data;
        status
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;
    use crate::backend::Backend;
    use crate::define::*;
    use crate::error::*;
    use crate::os::{HidCaps, HidReportKind};
    use crate::platform::Platform;
    use crate::sim::{SimCall, SimOs};
    use crate::transfer::*;
    use crate::utils::test::init;
    use crate::UsbContext;

    fn keyboard(caps: Option<HidCaps>) -> (Arc<SimOs>, UsbContext, String) {
        init();
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let kbd = sim.add_device(root, 1, "USB\\VID_046D&PID_C31C\\5&1", 0x046d, 0xc31c);
        sim.set_driver(kbd, "HidUsb");
        let col = sim.add_interface_node(kbd, "HID\\VID_046D&PID_C31C&COL01\\6&1", "kbdhid", Some(sim.hid_guid()));
        if let Some(caps) = caps {
            sim.set_hid_caps(col, caps);
        }
        let path = sim.interface_of(col).unwrap().0;
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        (sim, ctx, path)
    }

    #[tokio::test]
    async fn open_probes_the_hid_stack() {
        let (sim, ctx, _) = keyboard(None);
        let handle = ctx.open_device_with_vid_pid(0x046d, 0xc31c).unwrap();
        assert_eq!(handle.device().backend(), Backend::Hid);
        let info = handle.device().hid_info().unwrap().unwrap();
        assert_eq!((info.vid, info.pid), (0x046d, 0xc31c));
        assert_eq!(info.uses_report_ids, [false; 3]);
        assert_eq!(info.strings[1], "Simulated Product");
        assert!(!handle.device().interface_slots().unwrap().get(0).unwrap().is_restricted());

        handle.claim_interface(0).unwrap();
        assert_eq!(handle.set_interface_altsetting(0, 1), Err(Error::NotSupported));
        handle.release_interface(0).unwrap();
        assert!(sim.calls().iter().any(|c| matches!(c, SimCall::SetInputBuffers(_))));
    }

    #[tokio::test]
    async fn system_keyboards_are_restricted() {
        let (sim, ctx, path) = keyboard(None);
        sim.deny_read_write(&path);
        let handle = ctx.open_device_with_vid_pid(0x046d, 0xc31c).unwrap();
        assert!(handle.device().interface_slots().unwrap().get(0).unwrap().is_restricted());
    }

    #[tokio::test]
    async fn descriptors_come_from_the_descriptor_source() {
        let (_sim, ctx, _) = keyboard(None);
        let handle = ctx.open_device_with_vid_pid(0x046d, 0xc31c).unwrap();
        let data = handle.control_transfer_in(ControlTransferRequest {
            request: REQUEST_GET_DESCRIPTOR,
            value: (DT_DEVICE as u16) << 8,
            ..Default::default()
        }, 18).await.unwrap();
        assert_eq!(data.len(), 18);
        assert_eq!(u16::from_le_bytes([data[8], data[9]]), 0x046d);

        let config = handle.control_transfer_in(ControlTransferRequest {
            request: REQUEST_GET_CONFIGURATION,
            ..Default::default()
        }, 1).await.unwrap();
        assert_eq!(config, vec![1]);
        assert_eq!(handle.auto_claim_count(0), 0);
    }

    #[tokio::test]
    async fn reports_without_ids_get_a_zero_prefix() {
        let (sim, ctx, _) = keyboard(None);
        let handle = ctx.open_device_with_vid_pid(0x046d, 0xc31c).unwrap();
        handle.claim_interface(0).unwrap();

        handle.interrupt_transfer_out(0x02, &[1, 2, 3], Duration::from_secs(1)).await.unwrap();
        assert!(sim.calls().contains(&SimCall::WriteReport(vec![0, 1, 2, 3])));

        sim.queue_hid_report(vec![0, 7, 7, 7]);
        let data = handle.interrupt_transfer_in(0x81, 3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, vec![7, 7, 7]);

        sim.queue_hid_report(vec![0, 1, 2, 3, 4, 5]);
        let r = handle.interrupt_transfer_in(0x81, 3, Duration::from_secs(1)).await;
        assert_eq!(r, Err(Error::Overflow));
    }

    #[tokio::test]
    async fn feature_reports_map_to_class_requests() {
        let caps = HidCaps {
            input_report_length: 9,
            output_report_length: 9,
            feature_report_length: 9,
            input_report_ids: vec![1],
            output_report_ids: vec![1],
            feature_report_ids: vec![1],
        };
        let (sim, ctx, _) = keyboard(Some(caps));
        let handle = ctx.open_device_with_vid_pid(0x046d, 0xc31c).unwrap();
        assert_eq!(handle.device().hid_info().unwrap().unwrap().uses_report_ids, [true; 3]);

        let set = ControlTransferRequest {
            recipient: UsbControlRecipient::SpecifiedInterface,
            transfer_type: UsbControlTransferType::Class,
            request: HID_REQ_SET_REPORT,
            value: 0x0301,
            ..Default::default()
        };
        handle.control_transfer_out(set, &[1, 0xaa, 0xbb]).await.unwrap();
        assert!(sim.calls().contains(&SimCall::SetReport(HidReportKind::Feature, vec![1, 0xaa, 0xbb])));

        let get = ControlTransferRequest {
            recipient: UsbControlRecipient::SpecifiedInterface,
            transfer_type: UsbControlTransferType::Class,
            request: HID_REQ_GET_REPORT,
            value: 0x0301,
            ..Default::default()
        };
        let data = handle.control_transfer_in(get, 9).await.unwrap();
        assert_eq!(data.len(), 9);
        assert_eq!(data[0], 1);
        assert!(sim.calls().contains(&SimCall::GetReport(HidReportKind::Feature, 1, 10)));

        let bad = TransferRequest::control(ControlSetup::new(
            Direction::Out, UsbControlTransferType::Class, UsbControlRecipient::SpecifiedInterface,
            HID_REQ_SET_REPORT, 0x0301, 0, 0), &[]);
        assert_eq!(handle.submit(bad).err(), Some(Error::InvalidParam));
    }
}
