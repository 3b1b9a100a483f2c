use log::{info, LevelFilter};
use wusb::prelude::*;

#[tokio::main]
async fn main() {
    let _ = env_logger::builder().filter_level(LevelFilter::Debug).is_test(true).try_init();

    let sim = SimOs::new();
    let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
    let hub = sim.add_hub(root, 2, "USB\\VID_05E3&PID_0610\\5&1");
    sim.add_device(hub, 1, "USB\\VID_1D50&PID_6089\\0000000000000000", 0x1d50, 0x6089);
    let comp = sim.add_device(root, 3, "USB\\VID_1234&PID_0100\\SN1", 0x1234, 0x0100);
    sim.set_driver(comp, "usbccgp");
    sim.add_interface_node(comp, "USB\\VID_1234&PID_0100&MI_00\\7&1", "WinUSB", None);
    sim.add_interface_node(comp, "HID\\VID_1234&PID_0100&MI_01\\8&1", "HidUsb", Some(sim.hid_guid()));

    let platform = Platform::builder().hotplug(false).build(sim.services()).unwrap();
    let ctx = platform.new_context().unwrap();
    let devices = ctx.device_list().unwrap();
    for device in devices {
        let desc = device.get_device_descriptor();
        let mut msg = format!("Device: {} vid: {:04X} pid: {:04X} bus {} address {} port {} depth {} speed {:?} backend {}",
                              device.device_id(), device.vid(), device.pid(),
                              device.bus_number(), device.device_address(), device.port_number(),
                              device.depth(), device.speed(), device.backend());
        for i in 0..desc.bNumConfigurations {
            let cfg = match device.get_config_descriptor(i) {
                Ok(c) => c,
                Err(e) => {
                    msg += format!("\n  Configuration [{}]: {}", i, e).as_str();
                    continue;
                }
            };
            msg += format!(r"
  Configuration [{}]:
    value {}", i, cfg.bConfigurationValue).as_str();

            for alts in &cfg.interfaces {
                for interface in &alts.alt_settings {
                    msg += format!(r"
    Interface [{}]:
      Alternate Setting {}
      Class: {}
      Subclass: {}
      Protocol {}",
                                   interface.bInterfaceNumber,
                                   interface.bAlternateSetting,
                                   interface.bInterfaceClass,
                                   interface.bInterfaceSubClass,
                                   interface.bInterfaceProtocol,
                    ).as_str();

                    for endpoint in &interface.endpoints {
                        msg += format!(r"
      Endpoint [{:02X}]:
        Attributes {:02X}
        Max Packet Size {}",
                                       endpoint.bEndpointAddress,
                                       endpoint.bmAttributes,
                                       endpoint.wMaxPacketSize,
                        ).as_str();
                    }
                }
            }
        }
        if let Ok(slots) = device.interface_slots() {
            for (i, slot) in slots.iter().enumerate() {
                if let Some(path) = slot.path() {
                    msg += format!("\n  Slot [{}]: {} {}", i, slot.backend(), path).as_str();
                }
            }
        }

        info!("{}", msg)
    }
}
