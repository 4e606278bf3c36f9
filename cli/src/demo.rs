// Service definition files and the scripted simulation session

use anyhow::{Context, Result};
use async_trait::async_trait;
use ble_peripheral_core::gatt::mapper::CharacteristicProperty;
use ble_peripheral_core::gatt::to_permission;
use ble_peripheral_core::platform::GattResponse;
use ble_peripheral_core::{
    AdvertisementStatus, AdvertisingRequest, AttErrorCode, BlePeripheral, BleService,
    PeripheralCallbacks, PeripheralSettings, RadioState, SimulatedPlatform, SubscriptionChange,
};
use colored::*;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Central addresses used by the simulated session
const CENTRALS: [&str; 2] = ["c4:3a:be:01:22:9f", "5d:10:e2:7c:08:41"];

/// A definition file holds either one service or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServiceFile {
    Many(Vec<BleService>),
    One(BleService),
}

pub fn load_services(path: &Path) -> Result<Vec<BleService>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: ServiceFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse service definitions in {}", path.display()))?;
    Ok(match file {
        ServiceFile::Many(services) => services,
        ServiceFile::One(service) => vec![service],
    })
}

pub fn describe_properties(codes: &[i64]) -> String {
    let names: Vec<String> = codes
        .iter()
        .map(|&code| match CharacteristicProperty::from_code(code) {
            Some(property) => format!("{:?}", property),
            None => format!("?{code}"),
        })
        .collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

pub fn describe_permissions(codes: &[i64]) -> String {
    let names: Vec<String> = codes
        .iter()
        .map(|&code| format!("{:?}", to_permission(code)))
        .collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

pub fn print_tree(services: &[BleService]) {
    for service in services {
        let kind = if service.primary { "primary" } else { "secondary" };
        println!("  {} {} ({})", "•".bright_green(), service.uuid.bright_cyan(), kind.dimmed());
        for characteristic in &service.characteristics {
            println!("    {} {}", "├".dimmed(), characteristic.uuid.bright_cyan());
            println!(
                "    {}   properties:  {}",
                "│".dimmed(),
                describe_properties(&characteristic.properties)
            );
            println!(
                "    {}   permissions: {}",
                "│".dimmed(),
                describe_permissions(&characteristic.permissions)
            );
            if let Some(value) = &characteristic.value {
                println!("    {}   value:       {}", "│".dimmed(), hex::encode(value));
            }
            for descriptor in &characteristic.descriptors {
                println!(
                    "    {}   descriptor {} [{}]",
                    "│".dimmed(),
                    descriptor.uuid.bright_cyan(),
                    describe_permissions(&descriptor.permissions)
                );
            }
        }
    }
}

// ============================================================================
// CALLBACKS
// ============================================================================

/// Callbacks that narrate every event to stdout
#[derive(Debug, Default)]
pub struct PrintingCallbacks;

#[async_trait]
impl PeripheralCallbacks for PrintingCallbacks {
    async fn on_characteristic_read(&self, characteristic_id: &str, device_id: &str) -> Option<Vec<u8>> {
        println!(
            "  {} read  {} by {}",
            "←".bright_blue(),
            characteristic_id.bright_cyan(),
            device_id
        );
        None
    }

    async fn on_characteristic_write(
        &self,
        characteristic_id: &str,
        value: &[u8],
        device_id: &str,
    ) -> Result<(), AttErrorCode> {
        println!(
            "  {} write {} = {} by {}",
            "←".bright_blue(),
            characteristic_id.bright_cyan(),
            hex::encode(value).bright_yellow(),
            device_id
        );
        Ok(())
    }

    async fn on_descriptor_write(
        &self,
        characteristic_id: &str,
        descriptor_id: &str,
        value: &[u8],
    ) -> Result<(), AttErrorCode> {
        println!(
            "  {} write {}/{} = {}",
            "←".bright_blue(),
            characteristic_id.bright_cyan(),
            descriptor_id.bright_cyan(),
            hex::encode(value).bright_yellow()
        );
        Ok(())
    }

    fn on_subscription_changed(&self, change: &SubscriptionChange) {
        let clients: Vec<String> = change.clients.iter().map(|c| c.to_string()).collect();
        println!(
            "  {} subscribers of {}: [{}]",
            "✓".green(),
            change.characteristic_id.bright_cyan(),
            clients.join(", ")
        );
    }

    fn on_adapter_state_changed(&self, state: RadioState) {
        println!("  {} radio {}", "•".bright_green(), state);
    }

    fn on_advertisement_status_changed(&self, status: AdvertisementStatus, error: Option<&str>) {
        match error {
            Some(error) => println!("  {} advertising {} ({})", "✗".red(), status, error),
            None => println!("  {} advertising {}", "•".bright_green(), status),
        }
    }
}

// ============================================================================
// VALIDATE
// ============================================================================

/// Register every definition on a simulated stack; surfaces the same
/// validation errors a real radio stack would.
pub async fn validate(services: &[BleService]) -> Result<Vec<BleService>> {
    let platform = Arc::new(SimulatedPlatform::default());
    let peripheral = BlePeripheral::new(platform, Arc::new(ble_peripheral_core::NoopCallbacks));
    peripheral.initialize()?;

    for service in services {
        peripheral
            .add_service(service)
            .with_context(|| format!("Service {} rejected", service.uuid))?;
    }

    let registered = peripheral.get_services()?;
    peripheral.dispose()?;
    Ok(registered)
}

// ============================================================================
// SIMULATE
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub local_name: Option<String>,
    pub advertise_ms: Option<u64>,
    pub encrypted: bool,
}

#[derive(Debug, Default)]
pub struct SimulationSummary {
    pub services: usize,
    pub reads: usize,
    pub writes: usize,
    pub notifications: usize,
    pub rejected: usize,
}

/// Drive a full peripheral session against the simulated stack:
/// register, advertise, serve reads/writes, notify, tear down.
pub async fn simulate(
    services: &[BleService],
    settings: PeripheralSettings,
    options: SimulateOptions,
) -> Result<SimulationSummary> {
    let platform = Arc::new(SimulatedPlatform::default());
    let peripheral = BlePeripheral::with_settings(
        platform.clone(),
        Arc::new(PrintingCallbacks),
        settings,
    )?;
    peripheral.initialize()?;

    let mut summary = SimulationSummary::default();

    for service in services {
        peripheral.add_service(service)?;
        summary.services += 1;
        println!("{} Registered {}", "✓".green(), service.uuid.bright_cyan());
    }

    peripheral.start_advertising(AdvertisingRequest {
        local_name: options.local_name.clone(),
        timeout: options.advertise_ms.map(Duration::from_millis),
        ..Default::default()
    })?;
    println!("{} Advertising", "✓".green());

    let centrals: Vec<String> = CENTRALS
        .iter()
        .map(|remote| format!("BluetoothLE#BluetoothLE00:1a:7d:da:71:13-{remote}"))
        .collect();

    for service in services {
        for characteristic in &service.characteristics {
            let Some(handle) = platform.characteristic_handle(&characteristic.uuid) else {
                continue;
            };
            let codes = &characteristic.properties;
            let has = |property: CharacteristicProperty| codes.contains(&(property as i64));

            if has(CharacteristicProperty::Notify) || has(CharacteristicProperty::Indicate) {
                for central in &centrals {
                    platform.subscribe_client(handle, central);
                }
            }

            if has(CharacteristicProperty::Read) {
                let request = platform.read(handle, &centrals[0], options.encrypted);
                match platform.wait_for_response(request, RESPONSE_TIMEOUT).await {
                    Some(GattResponse::Value(value)) => {
                        summary.reads += 1;
                        println!(
                            "  {} value {}",
                            "→".bright_green(),
                            hex::encode(value).bright_yellow()
                        );
                    }
                    Some(GattResponse::Error(code)) => {
                        summary.rejected += 1;
                        println!("  {} read rejected: {}", "✗".red(), code);
                    }
                    other => anyhow::bail!("Unexpected read completion: {:?}", other),
                }
            }

            if has(CharacteristicProperty::Write) {
                let request = platform.write(handle, &centrals[1], &[0x01], options.encrypted, true);
                let response = match request {
                    Some(request) => platform.wait_for_response(request, RESPONSE_TIMEOUT).await,
                    None => None,
                };
                match response {
                    Some(GattResponse::WriteAccepted) => {
                        summary.writes += 1;
                    }
                    Some(GattResponse::Error(code)) => {
                        summary.rejected += 1;
                        println!("  {} write rejected: {}", "✗".red(), code);
                    }
                    other => anyhow::bail!("Unexpected write completion: {:?}", other),
                }
            }

            if has(CharacteristicProperty::Notify) || has(CharacteristicProperty::Indicate) {
                let delivered =
                    peripheral.update_characteristic(&characteristic.uuid, &[0x00, 0x48], None)?;
                summary.notifications += delivered;
                println!(
                    "  {} pushed {} to {} subscriber(s)",
                    "→".bright_green(),
                    characteristic.uuid.bright_cyan(),
                    delivered
                );
            }
        }
    }

    if peripheral.is_advertising()?.unwrap_or(false) {
        peripheral.stop_advertising()?;
    }
    peripheral.dispose().context("Failed to tear down peripheral")?;
    println!("{} Disposed", "✓".green());

    Ok(summary)
}
