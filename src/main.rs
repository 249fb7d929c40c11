use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

use vitalink::collection::Collector;
use vitalink::domain::models::CollectionType;
use vitalink::domain::settings::SettingsService;
use vitalink::infrastructure::bluetooth::backend::BtleplugDriver;
use vitalink::infrastructure::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = logging::init(&settings.log_settings)?;
    info!("starting vitalink collector");

    let (hardware_tx, hardware_rx) = mpsc::unbounded_channel();
    let driver = Arc::new(BtleplugDriver::new(hardware_tx).await?);
    let collector = Collector::start(driver, hardware_rx, settings.collection.clone());

    collector
        .apply_device_preferences(CollectionType::Weight, &settings.weight_device_names)
        .await;
    collector
        .apply_device_preferences(CollectionType::Glucose, &settings.glucose_device_names)
        .await;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    collector.shutdown().await;
    Ok(())
}
