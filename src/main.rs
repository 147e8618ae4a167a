use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, error, info, warn};
use smartcart_link_lib::commands::{self, ConsoleCommand};
use smartcart_link_lib::config::{self, AppConfig};
use smartcart_link_lib::core::bluetooth::{BluestTransport, LinkEvent, PermissionState};
use smartcart_link_lib::core::services::{
    FileDocumentStore, InventoryItem, ManualLocationProvider, StoreInventory,
};
use smartcart_link_lib::logging;
use smartcart_link_lib::state::AppState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Console for the smart cart Bluetooth link
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Directory holding link_config.json and bill_config.json
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory of the document store (items, carts, maps)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON object of item id to item, imported into the store at startup
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Connect to the first cart matching this id or name
    #[arg(long)]
    device: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

async fn import_inventory(
    inventory: &StoreInventory<Arc<FileDocumentStore>>,
    path: &Path,
) -> Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let items: HashMap<String, InventoryItem> =
        serde_json::from_str(&content).context("inventory file is not an item map")?;
    for (item_id, item) in &items {
        inventory.insert(item_id, item).await?;
    }
    Ok(items.len())
}

/// Prints every link event and auto-connects to `device` once it shows up
fn spawn_event_printer(app_state: Arc<AppState>, device: Option<String>) {
    let mut events = app_state.session.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} link events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize event: {}", e),
            }

            if let (LinkEvent::PeripheralFound(peripheral), Some(query)) = (&event, &device) {
                if peripheral.matches(query) && app_state.session.link_handle().await.is_none() {
                    let app_state = app_state.clone();
                    let id = peripheral.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = app_state.connect(&id).await {
                            error!("Auto-connect to {} failed: {}", id, e);
                        }
                    });
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_level)?;

    let config_dir = args.config_dir.unwrap_or_else(config::default_config_dir);
    let data_dir = args.data_dir.unwrap_or_else(config::default_data_dir);
    let app_config = AppConfig::load(&config_dir).await?;
    info!("Using config from {}", config_dir.display());

    let store = Arc::new(FileDocumentStore::new(&data_dir));
    let inventory = StoreInventory::new(store.clone());
    if let Some(path) = &args.inventory {
        let count = import_inventory(&inventory, path).await?;
        info!("Imported {} items from {}", count, path.display());
    }

    let transport = BluestTransport::new()
        .await
        .context("failed to initialize Bluetooth")?;
    let location = Arc::new(ManualLocationProvider::new(PermissionState::Granted));

    let app_state = Arc::new(AppState::new(
        Arc::new(transport),
        Arc::new(inventory),
        store,
        location.clone(),
        app_config,
    ));
    spawn_event_printer(app_state.clone(), args.device);

    if let Err(e) = app_state.start().await {
        error!("Failed to start scanning: {}", e);
    }
    println!("Type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        // While connected, fixes go through the telemetry filter like a real location feed
        if let ConsoleCommand::Gps(sample) = &command {
            if app_state.session.is_telemetry_running().await {
                location.push(*sample);
                continue;
            }
        }
        match commands::execute(&app_state, command).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("Error: {}", e),
        }
    }

    if app_state.session.link_handle().await.is_some() {
        if let Err(e) = app_state.session.disconnect().await {
            warn!("Failed to disconnect on exit: {}", e);
        }
    }
    app_state.session.stop_scan().await;
    info!("Goodbye");
    Ok(())
}
