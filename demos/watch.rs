//! Drive the monitor against the simulated registry and print the stream.
//!
//! Run with: cargo run --example watch

use std::sync::Arc;

use futures::StreamExt;
use usb_monitor::{
    DeviceMonitor, DeviceProperties, MatchingCriteria, Notification, SimulatedRegistry,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usb_monitor=debug".into()),
        )
        .init();

    let sim = Arc::new(SimulatedRegistry::new());
    let monitor = DeviceMonitor::new(sim.clone());

    // Watch one keyboard identity only
    let criteria = MatchingCriteria::new(0x3151, 0x5030, None, None, None);
    let mut stream = monitor
        .start_monitoring(Some(criteria))
        .await
        .expect("failed to start monitoring");

    // Plug in two devices; only the matching one shows up
    let keyboard = sim.attach_device(DeviceProperties {
        vendor_id: 0x3151,
        product_id: 0x5030,
        product_name: Some("M1 V5 HE".into()),
        ..Default::default()
    });
    sim.attach_device(DeviceProperties {
        vendor_id: 0x1234,
        product_id: 0x5678,
        ..Default::default()
    });
    sim.detach_device(keyboard);

    let consumer = tokio::spawn(async move {
        while let Some(notification) = stream.next().await {
            match notification {
                Notification::DeviceConnected(device) => {
                    println!(
                        "connected:    handle={:?} registry_id={:?}",
                        device.raw_handle(),
                        device.registry_id()
                    );
                }
                Notification::DeviceDisconnected(device) => {
                    println!("disconnected: handle={:?}", device.raw_handle());
                }
            }
        }
        println!("stream complete");
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    monitor.stop_monitoring();
    consumer.await.expect("consumer task failed");

    println!(
        "retains={} releases={} live={}",
        sim.retain_count(),
        sim.release_count(),
        sim.live_references()
    );
}
