use color_eyre::{eyre::eyre, Result};
use sensornode::config::NodeConfig;
use sensornode::mqtt::{MqttLogLayer, PipelineSettings, PublishPipeline, Publisher, RumqttSession};
use sensornode::sensors::host::{LoadAverageSensor, MemorySensor};
use sensornode::sensors::{CallbackError, Configuring, Reading, ReaderManager, SensorReader};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = NodeConfig::default_path();
    NodeConfig::ensure_default(&config_path).await?;
    let config = NodeConfig::load(&config_path).await?;

    let log_layer = MqttLogLayer::new();
    setup_logging_env(config.logging.level_filter()?, log_layer.clone());
    info!(
        "Starting sensornode {}/{} with config {}",
        config.location,
        config.device_id,
        config_path.display()
    );

    let settings = PipelineSettings::resolve(&config.device_id, &config.location, &config.mqtt);
    let session = RumqttSession::new(&settings);
    let mut pipeline = PublishPipeline::new(settings, session);
    pipeline
        .start()
        .await
        .map_err(|e| eyre!("Failed to connect to broker: {}", e))?;
    log_layer.attach(pipeline.publisher());

    let mut manager = ReaderManager::new(config.sensors.stats_interval());
    let interval = config.sensors.interval();

    let load = LoadAverageSensor::default();
    let mut load_reader = SensorReader::create("loadavg", interval, move || {
        let load = load.clone();
        async move { load.read().await }
    });
    publish_readings(&mut load_reader, pipeline.publisher());
    manager.add_reader(load_reader.arm())?;

    let memory = MemorySensor::default();
    let mut memory_reader = SensorReader::create("meminfo", interval, move || {
        let memory = memory.clone();
        async move { memory.read().await }
    });
    publish_readings(&mut memory_reader, pipeline.publisher());
    manager.add_reader(memory_reader.arm())?;

    let run = manager.start();
    tokio::pin!(run);
    let outcome = tokio::select! {
        result = &mut run => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
            manager.stop();
            run.await
        }
    };

    pipeline.shutdown().await;
    outcome?;
    info!("Sensornode stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: LevelFilter, log_layer: MqttLogLayer) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(level)
        .with(fmt_layer)
        .with(log_layer)
        .init();
}

// every measurement of every reading goes to the broker
fn publish_readings(reader: &mut SensorReader<Configuring>, publisher: Publisher) {
    reader.add_callback(move |reading: Arc<Reading>| {
        let publisher = publisher.clone();
        async move {
            publisher.publish_measurements_from_reading(&reading);
            Ok::<(), CallbackError>(())
        }
    });
}
