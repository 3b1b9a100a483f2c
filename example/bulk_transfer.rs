use std::sync::Arc;
use std::time::Duration;
use log::{info, LevelFilter};
use tokio::time::Instant;
use wusb::prelude::*;

#[tokio::main]
async fn main() {
    let _ = env_logger::builder().filter_level(LevelFilter::Debug).is_test(true).try_init();
    {
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        let dev = sim.add_device(root, 1, "USB\\VID_1D50&PID_6089\\0000000000000000", 0x1d50, 0x6089);
        sim.set_driver(dev, "libusbK");

        let platform = Platform::new(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let device = ctx.open_device_with_vid_pid(0x1d50, 0x6089).unwrap();
        device.claim_interface(0).unwrap();

        device.control_transfer_out(ControlTransferRequest {
            recipient: UsbControlRecipient::Device,
            transfer_type: UsbControlTransferType::Vendor,
            request: 1,
            value: 1,
            ..Default::default()
        }, &[]).await.unwrap();
        info!("mode on");

        // stands in for the device streaming samples
        let producer = {
            let sim = Arc::clone(&sim);
            std::thread::spawn(move || {
                for i in 0..10u8 {
                    sim.queue_read(0x81, vec![i; 4096]);
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let mut all = 0usize;
        let start = Instant::now();
        for _ in 0..10 {
            let data = device.bulk_transfer_in(1, 4096, Duration::from_secs(1)).await.unwrap();
            all += data.len();
        }
        let _ = producer.join();

        let duration = Instant::now().duration_since(start);
        let mb = (all as f64 / duration.as_secs_f64()) / 1_000_000.0;
        info!("received {} bytes, {:.2} MB/s", all, mb);

        let sent = device.bulk_transfer_out(2, &[0xa5; 512], Duration::from_secs(1)).await.unwrap();
        info!("sent {} bytes", sent);
        device.release_interface(0).unwrap();
    }

    info!("finish");
}
