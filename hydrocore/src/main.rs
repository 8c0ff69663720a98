use std::env;
use std::sync::Arc;

use tracing::{error, info, warn};

use hydrocore::{
    BrokerConfig, ChannelClient, ConnectionRecoveryService, InfluxStoreClient, InitPolicy,
    MqttChannelClient, SensorRepository, StoreClient, StoreConfig,
};

#[tokio::main]
async fn main() {
    let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse()
        .unwrap_or(1883);
    let mqtt_username = env::var("MQTT_USERNAME").ok();
    let mqtt_password = env::var("MQTT_PASSWORD").ok();
    let influx_url = env::var("INFLUX_URL").unwrap_or_else(|_| "http://localhost:8086".to_string());
    let influx_token = env::var("INFLUX_TOKEN").unwrap_or_default();
    let influx_org = env::var("INFLUX_ORG").unwrap_or_else(|_| "hydroponics".to_string());
    let influx_bucket = env::var("INFLUX_BUCKET").unwrap_or_else(|_| "sensors".to_string());

    tracing_subscriber::fmt::init();

    info!("Starting hydroponics ingestion core");
    info!("MQTT broker: {}:{}", mqtt_broker, mqtt_port);
    info!("Store: {} bucket {}", influx_url, influx_bucket);

    let mut broker_cfg = BrokerConfig::new(mqtt_broker, mqtt_port);
    if let (Some(user), Some(pass)) = (mqtt_username, mqtt_password) {
        broker_cfg = broker_cfg.with_credentials(user, pass);
    }
    let store_cfg = StoreConfig::new(influx_url, influx_token, influx_org, influx_bucket);

    let channel: Arc<dyn ChannelClient> = Arc::new(MqttChannelClient::new(broker_cfg));
    let store: Arc<dyn StoreClient> = Arc::new(InfluxStoreClient::new(store_cfg));

    let repository = SensorRepository::new(Arc::clone(&channel), Arc::clone(&store), InitPolicy::Soft);
    let _recovery = ConnectionRecoveryService::new(Arc::clone(&channel), Arc::clone(&store))
        .with_retry_gate(repository.retry_gate());

    if let Err(e) = repository.initialize().await {
        error!("Repository initialization failed: {}", e);
        std::process::exit(1);
    }
    info!("Repository state: {:?}", repository.state());

    // Mirror live readings and connection transitions into the log until
    // shutdown.
    let mut readings = repository.real_time_sensor_data();
    let readings_task = tokio::spawn(async move {
        while let Some(reading) = readings.recv().await {
            info!(
                "{} = {} {} ({} @ {})",
                reading.id, reading.value, reading.unit, reading.location, reading.device_node
            );
        }
    });

    let mut connection = channel.connection_stream();
    let connection_task = tokio::spawn(async move {
        while let Some(state) = connection.recv().await {
            match state.last_error {
                Some(err) => warn!("channel {:?}: {}", state.status, err),
                None => info!("channel {:?}", state.status),
            }
        }
    });

    tokio::select! {
        _ = readings_task => {
            error!("Sensor stream ended");
        }
        _ = connection_task => {
            error!("Connection stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    repository.dispose().await;
    info!("Shutting down");
}
