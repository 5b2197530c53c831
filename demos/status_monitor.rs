use proformers::{
    find_treadmill, DeviceVariant, DriverConfig, MetricsSnapshot, ProformTreadmill, Result,
    DEVICE_NAME_PREFIX,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Proformers Status Monitor Example");
    info!("Searching for treadmills...");

    let transport = match find_treadmill(DEVICE_NAME_PREFIX, Duration::from_secs(15)).await {
        Ok(transport) => {
            info!("✅ Found: {}", transport.address());
            transport
        }
        Err(e) => {
            error!("❌ No treadmill found: {}", e);
            return Err(e);
        }
    };

    let variant = if std::env::args().any(|arg| arg == "--alt") {
        DeviceVariant::AltProtocol
    } else {
        DeviceVariant::Generic
    };
    let config = DriverConfig {
        variant,
        ..DriverConfig::default()
    };

    let (sink, mut metrics) = tokio::sync::watch::channel(MetricsSnapshot::default());
    let driver = ProformTreadmill::start(Arc::new(transport), config, sink);

    info!("🔍 Starting status monitoring ({})...", variant);
    info!("Press Ctrl+C to stop monitoring");

    let mut display = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut max_speed: f64 = 0.0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = display.tick() => {}
        }

        if metrics.has_changed().is_err() {
            error!("Driver stopped");
            break;
        }
        let status = metrics.borrow_and_update().clone();
        max_speed = max_speed.max(status.speed);

        let elapsed = start_time.elapsed();
        let minutes = elapsed.as_secs() / 60;
        let seconds = elapsed.as_secs() % 60;

        println!("\n📊 Status Update ({minutes:02}:{seconds:02}) [{}]", driver.phase());
        println!("┌─────────────────────────────────────────┐");
        println!("│ Speed:    {:6.1} {:5} (max {:5.1})    │", status.speed, status.unit, max_speed);
        println!("│ Incline:  {:6.1} %                      │", status.incline);
        println!(
            "│ Power:    {:6} W (est. {:4} W)         │",
            status.power, status.corrected_power
        );
        println!("│ Distance: {:8.2}                      │", status.distance);
        println!("│ Calories: {:8.1} kcal                 │", status.calories);
        println!("└─────────────────────────────────────────┘");
    }

    info!("👋 Stopping monitor");
    driver.shutdown().await
}
