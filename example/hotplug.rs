use std::time::Duration;
use log::{info, LevelFilter};
use wusb::prelude::*;

fn wait_for<F: Fn() -> bool>(f: F) {
    for _ in 0..100 {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn main() {
    let _ = env_logger::builder().filter_level(LevelFilter::Debug).is_test(true).try_init();

    let sim = SimOs::new();
    let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
    let platform = Platform::builder()
        .enumerators(&["USB", "HID"])
        .build(sim.services())
        .unwrap();
    let ctx = platform.new_context().unwrap();
    info!("{} device(s) at start", ctx.device_list().unwrap().len());

    let dev = sim.add_device(root, 4, "USB\\VID_1234&PID_0042\\HOT", 0x1234, 0x0042);
    sim.plug(dev);
    wait_for(|| ctx.device_list().map(|l| l.len() == 2).unwrap_or(false));
    for device in ctx.device_list().unwrap() {
        info!("present: {} session {:?}", device, device.session_id());
    }

    sim.unplug(dev);
    wait_for(|| ctx.device_list().map(|l| l.len() == 1).unwrap_or(false));
    info!("{} device(s) after removal", ctx.device_list().unwrap().len());
}
