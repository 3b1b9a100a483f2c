use std::time::Duration;
use log::{info, LevelFilter, warn};
use wusb::prelude::*;

#[tokio::main]
async fn main() {
    let _ = env_logger::builder().filter_level(LevelFilter::Debug).is_test(true).try_init();
    {
        let sim = SimOs::new();
        let root = sim.add_root_hub("PCI\\VEN_8086&DEV_A36D\\3&1", "USB\\ROOT_HUB30\\4&1");
        sim.add_device(root, 1, "USB\\VID_1D50&PID_6089\\0000000000000000", 0x1d50, 0x6089);

        let platform = Platform::new(sim.services()).unwrap();
        let ctx = platform.new_context().unwrap();
        let device = ctx.open_device_with_vid_pid(0x1d50, 0x6089).unwrap();
        device.claim_interface(0).unwrap();

        // nothing is ever queued on 0x81, the read stays pending
        let handle = device.submit(TransferRequest::bulk_in(0x81, 262144)).unwrap();
        let cancel = handle.cancel_token();

        let waiter = tokio::spawn(async {
            match handle.await {
                Ok(r) => info!("finished with {:?}, {} bytes", r.status, r.actual_length),
                Err(e) => warn!("error {}", e),
            }
        });

        // cancel transfer
        let _ = cancel.cancel();
        let _ = waiter.await;

        let request = TransferRequest::bulk_in(0x81, 64).timeout(Duration::from_millis(200));
        match device.submit(request).unwrap().await.and_then(|r| r.into_result()) {
            Ok(r) => info!("unexpected data {:?}", r.data),
            Err(e) => info!("second read: {}", e),
        }
    }

    info!("finish");
}
