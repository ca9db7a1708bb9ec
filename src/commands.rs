//! Operator commands
//! Parses the line-oriented command language of the binary and runs each
//! command against a manager.

use crate::core::bluetooth::{BleManager, Device, NativeTransport};

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan,
    Stop,
    Connect(String),
    Disconnect(String),
    Read {
        address: String,
        service: String,
        characteristic: String,
    },
    Write {
        address: String,
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },
    Notify {
        address: String,
        service: String,
        characteristic: String,
        enable: bool,
    },
    Devices,
    State(String),
    Help,
    Quit,
}

/// What a successfully executed command leaves for the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    Devices(Vec<Device>),
    Text(String),
    Quit,
}

pub const HELP: &str = "\
commands:
  scan                                   start a new scan session
  stop                                   stop scanning
  connect <address>
  disconnect <address>
  read <address> <service> <characteristic>
  write <address> <service> <characteristic> <hex>
  notify <address> <service> <characteristic> on|off
  devices                                list devices of this session
  state <address>
  help
  quit";

impl Command {
    /// Parses one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("scan", []) => Command::Scan,
            ("stop", []) => Command::Stop,
            ("connect", [address]) => Command::Connect(address.to_string()),
            ("disconnect", [address]) => Command::Disconnect(address.to_string()),
            ("read", [address, service, characteristic]) => Command::Read {
                address: address.to_string(),
                service: service.to_string(),
                characteristic: characteristic.to_string(),
            },
            ("write", [address, service, characteristic, value]) => Command::Write {
                address: address.to_string(),
                service: service.to_string(),
                characteristic: characteristic.to_string(),
                value: parse_hex(value)?,
            },
            ("notify", [address, service, characteristic, toggle]) => Command::Notify {
                address: address.to_string(),
                service: service.to_string(),
                characteristic: characteristic.to_string(),
                enable: parse_toggle(toggle)?,
            },
            ("devices", []) => Command::Devices,
            ("state", [address]) => Command::State(address.to_string()),
            ("help", _) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            (
                "scan" | "stop" | "connect" | "disconnect" | "read" | "write" | "notify"
                | "devices" | "state" | "quit" | "exit",
                _,
            ) => return Err(format!("wrong number of arguments for '{}'", verb)),
            _ => return Err(format!("unknown command '{}', try 'help'", verb)),
        };
        Ok(Some(command))
    }

    /// Runs the command. Operation failures are also delivered as error
    /// events by the manager.
    pub async fn execute<T: NativeTransport>(
        self,
        manager: &BleManager<T>,
    ) -> Result<Outcome, String> {
        match self {
            Command::Scan => manager.start_scan().await.map_err(|e| e.to_string())?,
            Command::Stop => manager.stop_scan().await.map_err(|e| e.to_string())?,
            Command::Connect(address) => {
                manager.connect(&address).await.map_err(|e| e.to_string())?
            }
            Command::Disconnect(address) => manager
                .disconnect(&address)
                .await
                .map_err(|e| e.to_string())?,
            Command::Read {
                address,
                service,
                characteristic,
            } => manager
                .read_characteristic(&address, &service, &characteristic)
                .await
                .map_err(|e| e.to_string())?,
            Command::Write {
                address,
                service,
                characteristic,
                value,
            } => manager
                .write_characteristic(&address, &service, &characteristic, value)
                .await
                .map_err(|e| e.to_string())?,
            Command::Notify {
                address,
                service,
                characteristic,
                enable,
            } => manager
                .notify_characteristic(&address, &service, &characteristic, enable)
                .await
                .map_err(|e| e.to_string())?,
            Command::Devices => {
                let devices = manager.devices().await.map_err(|e| e.to_string())?;
                return Ok(Outcome::Devices(devices));
            }
            Command::State(address) => {
                let state = manager
                    .connection_state(&address)
                    .await
                    .map_err(|e| e.to_string())?;
                return Ok(Outcome::Text(format!("{}: {:?}", address, state)));
            }
            Command::Help => return Ok(Outcome::Text(HELP.to_string())),
            Command::Quit => {
                manager.shutdown().await.map_err(|e| e.to_string())?;
                return Ok(Outcome::Quit);
            }
        }
        Ok(Outcome::Done)
    }
}

fn parse_hex(value: &str) -> Result<Vec<u8>, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).map_err(|e| format!("invalid hex value '{}': {}", value, e))
}

fn parse_toggle(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(format!("expected on or off, got '{}'", value)),
    }
}
