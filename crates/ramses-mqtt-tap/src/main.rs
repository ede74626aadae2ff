use std::process;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use ramses_bridge::{Broker, MqttBridge, MqttBroker, Transport};
use ramses_mqtt_tap::{PrintHandler, TapArgs, USAGE, parse_args};
use tokio_util::codec::FramedRead;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `RAMSES_LOG` picks the level for our crates.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("RAMSES_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "ramses_bridge={level},ramses_mqtt_tap={level},rumqttc=warn",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: TapArgs) -> anyhow::Result<()> {
    let env = |key: &str| std::env::var(key).ok();
    let bridge_config = args
        .bridge_config(env)
        .context("invalid gateway configuration")?;
    let mqtt_config = args
        .mqtt_config(env)
        .context("invalid MQTT configuration")?;

    tracing::info!(
        host = %mqtt_config.host,
        port = mqtt_config.port,
        client_id = %mqtt_config.client_id,
        "Connecting to MQTT broker"
    );
    let broker = Arc::new(MqttBroker::connect(&mqtt_config));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut status = broker.connectivity();
    tokio::select! {
        _ = &mut ctrl_c => {
            tracing::info!("Interrupted before the broker connected");
            broker.shutdown().await;
            return Ok(());
        }
        online = status.wait_for(|s| s.is_online()) => {
            online.context("broker client stopped before connecting")?;
        }
    }

    let bridge = MqttBridge::new(broker.clone(), bridge_config)?;
    let handler = Arc::new(PrintHandler::new(std::io::stdout()));
    let transport = bridge
        .create_transport(handler.clone(), args.transport_options())
        .await
        .context("failed to attach to the gateway")?;

    let mut stdin = FramedRead::new(tokio::io::stdin(), ramses_bridge::FrameCodec::new());
    let mut reading = !args.listen_only;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            _ = handler.closed() => {
                tracing::warn!("Transport closed");
                break;
            }
            line = stdin.next(), if reading => match line {
                Some(Ok(line)) => transport.write_frame(&line),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Stopped reading stdin");
                    reading = false;
                }
                None => {
                    tracing::info!("End of input");
                    break;
                }
            },
        }
    }

    transport.close();
    bridge.close();
    broker.shutdown().await;
    Ok(())
}
