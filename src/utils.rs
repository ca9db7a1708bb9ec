use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use log::{error, info};
use regex::Regex;
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::{BleError, BLUETOOTH_BASE_UUID};

static SHORT_UUID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:0x)?([0-9A-Fa-f]{4}|[0-9A-Fa-f]{8})$").unwrap());

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Parses a GATT UUID string.
///
/// Accepts 16-bit ("180D") and 32-bit short forms, which expand against the
/// Bluetooth base UUID, and any full 128-bit form. Case-insensitive.
pub fn parse_uuid(value: &str) -> Result<Uuid, BleError> {
    let trimmed = value.trim();
    if let Some(caps) = SHORT_UUID.captures(trimmed) {
        let short = u32::from_str_radix(&caps[1], 16)
            .map_err(|e| BleError::InvalidArgument(format!("UUID {value:?}: {e}")))?;
        return Ok(Uuid::from_u128(
            BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96),
        ));
    }
    Uuid::parse_str(trimmed).map_err(|e| BleError::InvalidArgument(format!("UUID {value:?}: {e}")))
}

/// Rejects empty addresses and addresses containing whitespace.
pub fn validate_address(address: &str) -> Result<(), BleError> {
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return Err(BleError::InvalidArgument(format!(
            "malformed device address {address:?}"
        )));
    }
    Ok(())
}
