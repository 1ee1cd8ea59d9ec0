//! Hardware bus capability
//!
//! Reads and writes registers on allow-listed I2C, SPI and GPIO devices
//! through a [`BusDriver`]. Devices not named in the configuration cannot
//! be addressed, and devices marked read-only reject writes during
//! validation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{BusKind, DeviceConfig};
use crate::error::CapabilityError;
use crate::tools::{parse_args, Capability, CapabilityOutput, InvocationContext, ValidatedArgs};

/// Access to a hardware bus
#[async_trait]
pub trait BusDriver: Send + Sync {
    /// Read `length` bytes starting at `register`
    async fn read(
        &self,
        device: &DeviceConfig,
        register: u8,
        length: usize,
    ) -> Result<Vec<u8>, CapabilityError>;

    /// Write `data` starting at `register`
    async fn write(
        &self,
        device: &DeviceConfig,
        register: u8,
        data: &[u8],
    ) -> Result<(), CapabilityError>;
}

/// In-memory register file per device, used on hosts without a real bus
#[derive(Debug, Default)]
pub struct SimulatedBus {
    registers: Mutex<HashMap<String, BTreeMap<u8, u8>>>,
}

impl SimulatedBus {
    /// Create an empty simulated bus
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusDriver for SimulatedBus {
    async fn read(
        &self,
        device: &DeviceConfig,
        register: u8,
        length: usize,
    ) -> Result<Vec<u8>, CapabilityError> {
        let registers = self.registers.lock().await;
        let file = registers.get(&device.id);
        Ok((0..length)
            .map(|offset| {
                let reg = register.wrapping_add(offset as u8);
                file.and_then(|f| f.get(&reg)).copied().unwrap_or(0)
            })
            .collect())
    }

    async fn write(
        &self,
        device: &DeviceConfig,
        register: u8,
        data: &[u8],
    ) -> Result<(), CapabilityError> {
        let mut registers = self.registers.lock().await;
        let file = registers.entry(device.id.clone()).or_default();
        for (offset, byte) in data.iter().enumerate() {
            file.insert(register.wrapping_add(offset as u8), *byte);
        }
        Ok(())
    }
}

/// Largest single read
const MAX_READ_LEN: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum DeviceParams {
    List,
    Read {
        device: String,
        register: u8,
        #[serde(default = "default_read_len")]
        length: usize,
    },
    Write {
        device: String,
        register: u8,
        data: Vec<u8>,
    },
}

fn default_read_len() -> usize {
    1
}

#[derive(Debug)]
enum DeviceAction {
    List,
    Read {
        device: DeviceConfig,
        register: u8,
        length: usize,
    },
    Write {
        device: DeviceConfig,
        register: u8,
        data: Vec<u8>,
    },
}

/// The `device` capability
pub struct DeviceCapability {
    devices: BTreeMap<String, DeviceConfig>,
    driver: Arc<dyn BusDriver>,
}

impl DeviceCapability {
    /// Create the capability over the allow-listed `devices`
    pub fn new(devices: Vec<DeviceConfig>, driver: Arc<dyn BusDriver>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            driver,
        }
    }

    fn device(&self, id: &str) -> Result<DeviceConfig, CapabilityError> {
        self.devices.get(id).cloned().ok_or_else(|| {
            CapabilityError::ValidationRejected(format!("device '{}' is not allowed", id))
        })
    }
}

fn bus_name(bus: BusKind) -> &'static str {
    match bus {
        BusKind::I2c => "i2c",
        BusKind::Spi => "spi",
        BusKind::Gpio => "gpio",
    }
}

#[async_trait]
impl Capability for DeviceCapability {
    fn name(&self) -> &str {
        "device"
    }

    fn description(&self) -> &str {
        "List, read, or write registers of configured hardware devices (I2C, SPI, GPIO)."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["list", "read", "write"]},
                "device": {"type": "string", "description": "Configured device id"},
                "register": {"type": "integer", "minimum": 0, "maximum": 255},
                "length": {"type": "integer", "minimum": 1, "maximum": MAX_READ_LEN},
                "data": {
                    "type": "array",
                    "items": {"type": "integer", "minimum": 0, "maximum": 255}
                }
            },
            "required": ["action"]
        })
    }

    fn validate(
        &self,
        args: &serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ValidatedArgs, CapabilityError> {
        let action = match parse_args::<DeviceParams>(self.name(), args)? {
            DeviceParams::List => DeviceAction::List,
            DeviceParams::Read {
                device,
                register,
                length,
            } => {
                if length == 0 || length > MAX_READ_LEN {
                    return Err(CapabilityError::ValidationRejected(format!(
                        "read length must be between 1 and {}",
                        MAX_READ_LEN
                    )));
                }
                DeviceAction::Read {
                    device: self.device(&device)?,
                    register,
                    length,
                }
            }
            DeviceParams::Write {
                device,
                register,
                data,
            } => {
                let device = self.device(&device)?;
                if device.read_only {
                    return Err(CapabilityError::ValidationRejected(format!(
                        "device '{}' is read-only",
                        device.id
                    )));
                }
                if data.is_empty() {
                    return Err(CapabilityError::ValidationRejected(
                        "write requires at least one byte".to_string(),
                    ));
                }
                DeviceAction::Write {
                    device,
                    register,
                    data,
                }
            }
        };
        Ok(ValidatedArgs::new(self.name(), action))
    }

    async fn execute(
        &self,
        args: ValidatedArgs,
        _deadline: Instant,
    ) -> Result<CapabilityOutput, CapabilityError> {
        match args.into_params::<DeviceAction>()? {
            DeviceAction::List => {
                if self.devices.is_empty() {
                    return Ok(CapabilityOutput::text("No devices configured"));
                }
                let lines: Vec<String> = self
                    .devices
                    .values()
                    .map(|d| {
                        format!(
                            "{} ({} {}){}",
                            d.id,
                            bus_name(d.bus),
                            d.address,
                            if d.read_only { " read-only" } else { "" }
                        )
                    })
                    .collect();
                Ok(CapabilityOutput::text(lines.join("\n")))
            }
            DeviceAction::Read {
                device,
                register,
                length,
            } => {
                let bytes = self.driver.read(&device, register, length).await?;
                let hex: Vec<String> = bytes.iter().map(|b| format!("0x{:02x}", b)).collect();
                tracing::debug!(device = %device.id, register, length, "Device read");
                Ok(CapabilityOutput::text(format!(
                    "{} register 0x{:02x}: {}",
                    device.id,
                    register,
                    hex.join(" ")
                )))
            }
            DeviceAction::Write {
                device,
                register,
                data,
            } => {
                self.driver.write(&device, register, &data).await?;
                tracing::info!(device = %device.id, register, bytes = data.len(), "Device write");
                Ok(CapabilityOutput::text(format!(
                    "Wrote {} byte(s) to {} register 0x{:02x}",
                    data.len(),
                    device.id,
                    register
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn devices() -> Vec<DeviceConfig> {
        vec![
            DeviceConfig {
                id: "thermo".into(),
                bus: BusKind::I2c,
                address: "0x48".into(),
                read_only: true,
            },
            DeviceConfig {
                id: "led".into(),
                bus: BusKind::Gpio,
                address: "17".into(),
                read_only: false,
            },
        ]
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_write_then_read_simulated_registers() {
        let capability = DeviceCapability::new(devices(), Arc::new(SimulatedBus::new()));
        let ctx = InvocationContext::default();

        let write = capability
            .validate(
                &json!({"action": "write", "device": "led", "register": 1, "data": [1, 255]}),
                &ctx,
            )
            .unwrap();
        capability.execute(write, deadline()).await.unwrap();

        let read = capability
            .validate(
                &json!({"action": "read", "device": "led", "register": 1, "length": 3}),
                &ctx,
            )
            .unwrap();
        let output = capability.execute(read, deadline()).await.unwrap();
        assert_eq!(output.text, "led register 0x01: 0x01 0xff 0x00");
    }

    #[test]
    fn test_read_only_and_unknown_devices_rejected() {
        let capability = DeviceCapability::new(devices(), Arc::new(SimulatedBus::new()));
        let ctx = InvocationContext::default();

        let read_only = capability.validate(
            &json!({"action": "write", "device": "thermo", "register": 0, "data": [1]}),
            &ctx,
        );
        assert!(matches!(
            read_only,
            Err(CapabilityError::ValidationRejected(_))
        ));

        let unknown =
            capability.validate(&json!({"action": "read", "device": "motor", "register": 0}), &ctx);
        assert!(unknown.is_err());

        let too_long = capability.validate(
            &json!({"action": "read", "device": "thermo", "register": 0, "length": 500}),
            &ctx,
        );
        assert!(too_long.is_err());
    }

    #[tokio::test]
    async fn test_list_devices() {
        let capability = DeviceCapability::new(devices(), Arc::new(SimulatedBus::new()));
        let args = capability
            .validate(&json!({"action": "list"}), &InvocationContext::default())
            .unwrap();
        let output = capability.execute(args, deadline()).await.unwrap();
        assert_eq!(output.text, "led (gpio 17)\nthermo (i2c 0x48) read-only");
    }
}
