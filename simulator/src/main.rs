mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::{random_sensor, ActuatorPayload, StatusPayload, ACTUATORS, SENSOR_KINDS};
use tracing::{error, info, warn};

/// Publishes randomized hydroponic telemetry to an MQTT broker so the
/// ingestion core can be exercised without real hardware.
#[derive(Parser, Debug)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Seconds between telemetry rounds.
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval: u64,

    /// Comma-separated device nodes to simulate.
    #[arg(long, env = "NODES", value_delimiter = ',', default_value = "rpi")]
    nodes: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    info!("Starting hydroponics simulator");
    info!(
        "Broker: {}:{}, interval: {}s, nodes: {:?}",
        args.broker, args.port, args.interval, args.nodes
    );

    let client_id = format!("hydro-sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 64);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected, publishing telemetry");

    let mut rng = rand::thread_rng();
    let mut round = 0u64;
    let interval = Duration::from_secs(args.interval);

    loop {
        for node in &args.nodes {
            // Node liveness first so the ingestor learns the node before its
            // sensors show up.
            publish_json(
                &client,
                &format!("{node}/status"),
                &StatusPayload {
                    status: "online".to_string(),
                },
            )
            .await;

            for kind in SENSOR_KINDS {
                let payload = random_sensor(
                    &mut rng,
                    kind,
                    format!("{kind}_{node}"),
                    "grow_tent".to_string(),
                );
                publish_json(&client, &format!("{node}/sensor"), &payload).await;
            }

            // Flip one random actuator per round so the device registry sees
            // state churn.
            let (device_type, id_prefix) = ACTUATORS[rng.gen_range(0..ACTUATORS.len())];
            let actuator = ActuatorPayload {
                device_type: device_type.to_string(),
                device_id: format!("{id_prefix}_{node}"),
                location: "grow_tent".to_string(),
                running: rng.gen_bool(0.7),
            };
            publish_json(&client, &format!("{node}/actuator"), &actuator).await;
        }

        round += 1;
        if round % 60 == 0 {
            info!("Published {} telemetry rounds", round);
        }

        tokio::time::sleep(interval).await;
    }
}

async fn publish_json<T: serde::Serialize>(client: &AsyncClient, topic: &str, payload: &T) {
    let body = match serde_json::to_string(payload) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to serialize payload for {}: {}", topic, e);
            return;
        }
    };
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
        warn!("Failed to publish to {}: {}", topic, e);
    }
}
