use std::path::PathBuf;

use anyhow::{Context, Result};
use ble_center_lib::commands::{Command, Outcome};
use ble_center_lib::config::{AppConfig, LogFormat, CONFIG_FILE_NAME};
use ble_center_lib::logging;
use ble_center_lib::state::AppState;
use log::{debug, error, info, Level};
use tokio::io::{AsyncBufReadExt, BufReader};

const CONFIG_ENV: &str = "BLECENTER_CONFIG";

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Defaults until the config says otherwise, so loading it is logged too.
    logging::setup_logging(Level::Info, LogFormat::Text);
    let path = config_path();
    let config = AppConfig::load_config(&path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    logging::setup_logging(config.logging.level(), config.logging.format);

    let state = AppState::new(&config);
    let mut events = state
        .manager
        .subscribe()
        .await
        .context("Failed to register event sink")?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    });

    info!("Ready. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        match command.execute(&state.manager).await {
            Ok(Outcome::Quit) => break,
            Ok(Outcome::Devices(devices)) => {
                for device in devices {
                    println!("{}", serde_json::to_string(&device)?);
                }
            }
            Ok(Outcome::Text(text)) => eprintln!("{}", text),
            Ok(Outcome::Done) => {}
            // Already reported on the event stream.
            Err(_) => {}
        }
    }

    if let Err(e) = state.manager.shutdown().await {
        // A prior quit already stopped the manager.
        debug!("Shutdown: {}", e);
    }
    drop(state);
    let _ = printer.await;
    Ok(())
}
