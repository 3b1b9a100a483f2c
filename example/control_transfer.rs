use std::time::Duration;
use log::{debug, info, LevelFilter};
use tokio::time::Instant;
use wusb::prelude::*;

#[tokio::main]
async fn main() {
    let _ = env_logger::builder().filter_level(LevelFilter::Debug).is_test(true).try_init();
    {
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1D50&PID_6089\\0000000000000000", 0x1d50, 0x6089);
        sim.queue_control(b"2023.01.2".to_vec());

        let platform = Platform::new(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let device = ctx.open_device_with_vid_pid(0x1d50, 0x6089).unwrap();

        let start = Instant::now();

        let data = device.control_transfer_in(ControlTransferRequest {
            recipient: UsbControlRecipient::Device,
            transfer_type: UsbControlTransferType::Vendor,
            request: 15,
            timeout: Duration::from_secs(1),
            ..Default::default()
        }, 30).await.unwrap();
        let duration = start.elapsed();

        let version = String::from_utf8_lossy(&data).to_string();
        println!("version: {} cost: {:?}", version, duration);

        device.set_configuration(1).await.unwrap();
        info!("configuration {}", device.get_configuration().unwrap());
        info!("interface 0 auto-claim count after the transfer: {}", device.auto_claim_count(0));
    }

    debug!("all finish");
}
