//! Operator commands
//! This module defines the commands that can be typed into the console and
//! runs them against the application state.

use std::str::FromStr;

use anyhow::{Result, anyhow, bail};

use crate::core::bluetooth::{CartCommand, GpsSample};
use crate::core::services::InventoryItem;
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Help,
    Scan,
    Devices,
    /// Identifier, name or list index of a discovered cart
    Connect(String),
    Disconnect,
    Drive(CartCommand),
    Gps(GpsSample),
    Add(String),
    Increment(String),
    Decrement(String),
    Remove(String),
    Clear,
    Cart,
    Bill,
    Checkout,
    Map,
    /// Part of an item name; empty lists the catalogue
    Search(String),
    Status,
    Quit,
}

pub const HELP: &str = "\
scan                      restart scanning
devices                   list discovered carts
connect <id|name|index>   connect to a cart
disconnect                disconnect from the cart
up|down|left|right|stop|start
                          drive the cart
gps <lat> <lon>           feed a position fix
add|inc|dec|remove <id>   edit the cart
clear                     empty the cart
cart                      show the cart
bill                      price the cart
checkout                  price and save the cart
map                       show the store map URL
search [text]             find store items by name
status                    show link state
quit                      exit";

fn single_arg(command: &str, args: &[&str]) -> Result<String> {
    match args {
        [arg] => Ok(arg.to_string()),
        _ => bail!("usage: {} <id>", command),
    }
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| anyhow!("empty command"))?
            .to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        if let Ok(drive) = command.parse::<CartCommand>() {
            return Ok(Self::Drive(drive));
        }

        Ok(match command.as_str() {
            "help" | "?" => Self::Help,
            "scan" => Self::Scan,
            "devices" => Self::Devices,
            "connect" => Self::Connect(args.join(" ")).validate()?,
            "disconnect" => Self::Disconnect,
            "gps" => match args.as_slice() {
                [lat, lon] => Self::Gps(GpsSample::new(lat.parse()?, lon.parse()?)),
                _ => bail!("usage: gps <lat> <lon>"),
            },
            "add" => Self::Add(single_arg("add", &args)?),
            "inc" => Self::Increment(single_arg("inc", &args)?),
            "dec" => Self::Decrement(single_arg("dec", &args)?),
            "remove" => Self::Remove(single_arg("remove", &args)?),
            "clear" => Self::Clear,
            "cart" => Self::Cart,
            "bill" => Self::Bill,
            "checkout" => Self::Checkout,
            "map" => Self::Map,
            "search" | "find" => Self::Search(args.join(" ")),
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command: {} (try 'help')", other),
        })
    }
}

impl ConsoleCommand {
    fn validate(self) -> Result<Self> {
        match &self {
            Self::Connect(target) if target.is_empty() => bail!("usage: connect <id|name|index>"),
            _ => Ok(self),
        }
    }
}

fn describe_item(item_id: &str, item: &InventoryItem, currency: &str) -> String {
    let stock = item
        .inventory
        .map(|units| units.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "{} [{}]  {}  stock {}  {:.2} {}",
        item.name,
        item_id,
        item.location.as_deref().unwrap_or("-"),
        stock,
        item.price,
        currency
    )
}

/// Runs `command` and returns the text to show the operator
pub async fn execute(app_state: &AppState, command: ConsoleCommand) -> Result<String> {
    let session = &app_state.session;
    Ok(match command {
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Scan => {
            session.start_scan().await?;
            "Scanning for carts...".to_string()
        }
        ConsoleCommand::Devices => {
            let peripherals = session.peripherals().await;
            if peripherals.is_empty() {
                "No devices found yet...".to_string()
            } else {
                peripherals
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("[{}] {} ({})", i, p.display_name(), p.id))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        ConsoleCommand::Connect(target) => {
            let query = match target.parse::<usize>() {
                Ok(index) => session
                    .peripherals()
                    .await
                    .get(index)
                    .map(|p| p.id.clone())
                    .unwrap_or(target),
                Err(_) => target,
            };
            let handle = app_state.connect(&query).await?;
            format!("Connected to: {}", handle.peripheral.display_name())
        }
        ConsoleCommand::Disconnect => {
            session.disconnect().await?;
            "Disconnected".to_string()
        }
        ConsoleCommand::Drive(command) => {
            session.send_command(command).await?;
            format!("Sent: {}", command)
        }
        ConsoleCommand::Gps(sample) => {
            session.send_telemetry(sample).await?;
            format!("Sent position {:.6},{:.6}", sample.latitude, sample.longitude)
        }
        ConsoleCommand::Add(item_id) => {
            let quantity = app_state.add_item(&item_id).await?;
            format!("{} x{}", item_id, quantity)
        }
        ConsoleCommand::Increment(item_id) => {
            let quantity = app_state.increment_item(&item_id)?;
            format!("{} x{}", item_id, quantity)
        }
        ConsoleCommand::Decrement(item_id) => {
            match app_state.decrement_item(&item_id) {
                0 => format!("{} removed", item_id),
                quantity => format!("{} x{}", item_id, quantity),
            }
        }
        ConsoleCommand::Remove(item_id) => {
            app_state.remove_item(&item_id);
            format!("{} removed", item_id)
        }
        ConsoleCommand::Clear => {
            app_state.clear_cart();
            "Cart cleared".to_string()
        }
        ConsoleCommand::Cart => {
            let snapshot = app_state.ledger.snapshot();
            if snapshot.is_empty() {
                "Cart is empty".to_string()
            } else {
                snapshot
                    .iter()
                    .map(|(id, quantity)| format!("{} x{}", id, quantity))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        ConsoleCommand::Bill => app_state
            .bill()
            .await?
            .render(&app_state.config.bill.currency),
        ConsoleCommand::Checkout => {
            let bill = app_state.checkout().await?;
            format!(
                "{}Saved as cart {}",
                bill.render(&app_state.config.bill.currency),
                bill.cart_id
            )
        }
        ConsoleCommand::Map => app_state
            .map_url()
            .await?
            .unwrap_or_else(|| "No store map available".to_string()),
        ConsoleCommand::Search(query) => {
            let items = app_state.search_items(&query).await?;
            if items.is_empty() {
                "No matching items found.".to_string()
            } else {
                let currency = &app_state.config.bill.currency;
                items
                    .iter()
                    .map(|(item_id, item)| describe_item(item_id, item, currency))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        ConsoleCommand::Status => {
            let state = session.state().await;
            match session.link_handle().await {
                Some(handle) => format!(
                    "{:?}: {} ({}), telemetry {}",
                    state,
                    handle.peripheral.display_name(),
                    handle.peripheral.id,
                    if session.is_telemetry_running().await { "on" } else { "off" }
                ),
                None => format!("{:?}, permission {:?}", state, session.permission().await),
            }
        }
        ConsoleCommand::Quit => String::new(),
    })
}
