use std::time::Duration;

use acm_serial::{
    cli::{self, Commands, Examples},
    config::Config,
    logging,
    mock::{MockBackend, MockDevice},
    registry::Registry,
    serial::{LineCoding, OutputSignals, Parity, SerialOptions},
};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use itertools::Itertools;
use tracing::{debug, info};

async fn demo(config: Config, message: String) -> Result<()> {
    let backend = MockBackend::new();
    let registry = Registry::new(backend.clone(), config.clone());

    backend.attach(MockDevice::new("mock-0"), false);

    let port = registry.request_port(&[]).await?;
    info!(%port, "Got port");

    port.open(config.default_options.clone()).await?;
    port.set_signals(OutputSignals::rts(true)).await?;

    let mut writer = port.writer().await?;
    let mut reader = port.reader().await?;

    let written = writer.write(message.as_bytes()).await?;
    debug!(written, "Wrote");

    let mut received = vec![];
    while received.len() < written {
        let chunk = tokio::time::timeout(Duration::from_secs(1), reader.read())
            .await??
            .ok_or_else(|| eyre!("Stream ended early"))?;
        received.extend_from_slice(&chunk);
    }

    println!("{}", String::from_utf8_lossy(&received));

    drop(reader);
    drop(writer);
    port.close().await?;
    registry.shutdown().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    logging::init("info").await;

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    match cli.command {
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty()?);
        }
        Commands::Examples(Examples::Options) => {
            let options = Config::example().default_options;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Commands::Encode {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
        } => {
            let defaults = config.default_options.clone();

            let options = SerialOptions {
                baud_rate: baud_rate.unwrap_or(defaults.baud_rate),
                data_bits: data_bits.unwrap_or(defaults.data_bits),
                stop_bits: stop_bits.unwrap_or(defaults.stop_bits),
                parity: match parity {
                    Some(parity) => parity.parse::<Parity>()?,
                    None => defaults.parity,
                },
                ..defaults
            };

            options.validate_with(config.data_bits_policy)?;

            let bytes = LineCoding::from(&options).encode();
            println!("{options}: {:02x}", bytes.iter().format(" "));
        }
        Commands::Demo { message } => demo(config, message).await?,
    }

    logging::shutdown();

    Ok(())
}
