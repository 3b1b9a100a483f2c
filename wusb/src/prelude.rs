pub use crate::{
    Backend, CompletedTransfer, ContextBuilder, DeviceChange, DeviceEvent, DeviceHandle,
    Error, InterfaceSlot, InterfaceSlots, Platform, PlatformBuilder, Result, SessionId,
    SubApi, SubmitHandle, TransferCancelToken, TransferRequest, TransferStatus,
    UsbContext, UsbDevice,
};
pub use crate::define::*;
pub use crate::descriptor::{ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, Interface, InterfaceDescriptor};
pub use crate::os::OsServices;
pub use crate::sim::{SimCall, SimOs};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_works() {
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1234&PID_5678\\SN1", 0x1234, 0x5678);
        let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        for device in ctx.device_list().unwrap() {
            println!("{} {:04X}:{:04X} {}", device, device.vid(), device.pid(), device.backend());
        }
        let handle = ctx.open_device_with_vid_pid(0x1234, 0x5678).unwrap();
        assert_eq!(handle.get_configuration(), Ok(1));
    }
}
