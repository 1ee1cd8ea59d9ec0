//! Capability registry builder
//!
//! Builds the [`CapabilityRegistry`] and [`Dispatcher`] from the `tools`
//! configuration. Capabilities that are disabled, or that depend on a
//! runtime component that was not supplied, are simply not registered, so
//! the model never sees them.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ToolsConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::tools::device::{BusDriver, DeviceCapability, SimulatedBus};
use crate::tools::fetch::FetchCapability;
use crate::tools::file_ops::{ListDirectoryCapability, ReadFileCapability, WriteFileCapability};
use crate::tools::messaging::SendMessageCapability;
use crate::tools::sandbox::Sandbox;
use crate::tools::schedule::ScheduleCapability;
use crate::tools::shell::{CommandValidator, ShellCapability};
use crate::tools::{CapabilityRegistry, Dispatcher};
use crate::transport::OutboundSender;

/// Builder for the capability registry
///
/// # Examples
///
/// ```
/// use pocketclaw::config::ToolsConfig;
/// use pocketclaw::tools::registry_builder::CapabilityRegistryBuilder;
///
/// let dir = tempfile::tempdir().unwrap();
/// let mut config = ToolsConfig::default();
/// config.sandbox_root = Some(dir.path().to_path_buf());
///
/// let registry = CapabilityRegistryBuilder::new(config).build().unwrap();
/// assert_eq!(registry.names(), vec!["list_directory", "read_file", "write_file"]);
/// ```
pub struct CapabilityRegistryBuilder {
    config: ToolsConfig,
    outbound: Option<OutboundSender>,
    scheduler: Option<Scheduler>,
    bus: Option<Arc<dyn BusDriver>>,
}

impl CapabilityRegistryBuilder {
    /// Create a builder over the `tools` configuration
    pub fn new(config: ToolsConfig) -> Self {
        Self {
            config,
            outbound: None,
            scheduler: None,
            bus: None,
        }
    }

    /// Supply the outbound route used by `send_message`
    pub fn with_outbound(mut self, outbound: OutboundSender) -> Self {
        self.outbound = Some(outbound);
        self
    }

    /// Supply the scheduler used by `schedule`
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Use `driver` for hardware access instead of the simulated bus
    pub fn with_bus_driver(mut self, driver: Arc<dyn BusDriver>) -> Self {
        self.bus = Some(driver);
        self
    }

    fn sandbox(&self) -> Result<Option<Sandbox>> {
        match &self.config.sandbox_root {
            Some(root) => Ok(Some(Sandbox::new(root).map_err(|e| {
                crate::error::PocketclawError::Config(format!(
                    "invalid sandbox root '{}': {}",
                    root.display(),
                    e
                ))
            })?)),
            None => Ok(None),
        }
    }

    /// Build the registry
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Config` when the sandbox root cannot be
    /// resolved or a shell denylist pattern is invalid
    pub fn build(&self) -> Result<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        let sandbox = self.sandbox()?;
        let tools = &self.config;

        if tools.filesystem.enabled {
            match &sandbox {
                Some(sandbox) => {
                    let max = tools.filesystem.max_file_bytes;
                    registry.register(Arc::new(ReadFileCapability::new(sandbox.clone(), max)));
                    registry.register(Arc::new(WriteFileCapability::new(sandbox.clone(), max)));
                    registry.register(Arc::new(ListDirectoryCapability::new(sandbox.clone())));
                }
                None => tracing::info!("Filesystem capabilities disabled: no sandbox root configured"),
            }
        }

        if tools.shell.enabled {
            if let Some(sandbox) = &sandbox {
                let validator = CommandValidator::new(
                    tools.shell.allowlist.clone(),
                    &tools.shell.denylist,
                    sandbox.clone(),
                )?;
                registry.register(Arc::new(ShellCapability::new(
                    validator,
                    sandbox.clone(),
                    tools.max_output_bytes,
                )));
            }
        }

        if tools.fetch.enabled {
            registry.register(Arc::new(FetchCapability::new(
                tools.fetch.allowed_hosts.clone(),
                tools.fetch.max_bytes,
            )));
        }

        if tools.device.enabled {
            let driver = self
                .bus
                .clone()
                .unwrap_or_else(|| Arc::new(SimulatedBus::new()) as Arc<dyn BusDriver>);
            registry.register(Arc::new(DeviceCapability::new(
                tools.device.devices.clone(),
                driver,
            )));
        }

        if tools.messaging.enabled {
            match &self.outbound {
                Some(outbound) => registry.register(Arc::new(SendMessageCapability::new(
                    outbound.clone(),
                    &tools.messaging.allowed_targets,
                ))),
                None => tracing::warn!("send_message enabled but no outbound route supplied"),
            }
        }

        if tools.schedule.enabled {
            match &self.scheduler {
                Some(scheduler) => {
                    registry.register(Arc::new(ScheduleCapability::new(scheduler.clone())))
                }
                None => tracing::warn!("schedule enabled but no scheduler supplied"),
            }
        }

        tracing::info!(capabilities = ?registry.names(), "Capability registry built");
        Ok(registry)
    }

    /// Build the registry and wrap it in a dispatcher with configured timeouts
    pub fn build_dispatcher(&self) -> Result<Dispatcher> {
        let registry = self.build()?;
        let tools = &self.config;
        let mut dispatcher = Dispatcher::new(
            registry,
            Duration::from_millis(tools.default_timeout_ms),
            tools.max_output_bytes,
        );
        if let Some(ms) = tools.shell.timeout_ms {
            dispatcher = dispatcher.with_timeout("shell", Duration::from_millis(ms));
        }
        if let Some(ms) = tools.fetch.timeout_ms {
            dispatcher = dispatcher.with_timeout("fetch", Duration::from_millis(ms));
        }
        Ok(dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusKind, DeviceConfig};
    use tempfile::TempDir;

    #[test]
    fn test_no_sandbox_means_no_filesystem_capabilities() {
        let registry = CapabilityRegistryBuilder::new(ToolsConfig::default())
            .build()
            .unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_all_capabilities_registered() {
        let dir = TempDir::new().unwrap();
        let mut config = ToolsConfig::default();
        config.sandbox_root = Some(dir.path().to_path_buf());
        config.shell.enabled = true;
        config.shell.allowlist = vec!["ls".into()];
        config.shell.timeout_ms = Some(2500);
        config.fetch.enabled = true;
        config.device.enabled = true;
        config.device.devices = vec![DeviceConfig {
            id: "led".into(),
            bus: BusKind::Gpio,
            address: "17".into(),
            read_only: false,
        }];
        config.messaging.enabled = true;

        let dispatcher = CapabilityRegistryBuilder::new(config)
            .with_outbound(OutboundSender::new())
            .build_dispatcher()
            .unwrap();

        assert_eq!(
            dispatcher.names(),
            vec![
                "device",
                "fetch",
                "list_directory",
                "read_file",
                "send_message",
                "shell",
                "write_file"
            ]
        );
        assert_eq!(dispatcher.timeout_for("shell"), Duration::from_millis(2500));
        assert_eq!(dispatcher.timeout_for("fetch"), Duration::from_millis(10_000));
    }

    #[test]
    fn test_invalid_sandbox_root_is_config_error() {
        let mut config = ToolsConfig::default();
        config.sandbox_root = Some("/definitely/not/here".into());
        assert!(CapabilityRegistryBuilder::new(config).build().is_err());
    }
}
