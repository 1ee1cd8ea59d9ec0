//! `config check` and `config show`

use crate::cli::ConfigCommand;
use crate::config::Config;
use crate::error::Result;
use colored::Colorize;

const REDACTED: &str = "<redacted>";

/// Handle configuration commands
///
/// Validation has already run in the entrypoint by the time this is called,
/// so `check` only reports the outcome.
pub fn handle_config(config: &Config, path: &str, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Check => {
            println!("{} {}", "Configuration OK:".green(), path);
            println!("  inference chain: {}", config.inference.chain().join(" -> "));
            let surfaces: Vec<&str> = config
                .transport
                .surfaces
                .iter()
                .filter(|s| s.enabled)
                .map(|s| s.id.as_str())
                .collect();
            println!("  surfaces: {}", display_list(&surfaces));
            println!(
                "  filesystem capabilities: {}",
                if config.filesystem_enabled() { "enabled" } else { "disabled" }
            );
            println!(
                "  runtime: {} worker threads, {} blocking threads",
                config.runtime.worker_threads, config.runtime.max_blocking_threads
            );
        }
        ConfigCommand::Show => {
            print!("{}", serde_yaml::to_string(&redacted(config))?);
        }
    }
    Ok(())
}

/// Copy of `config` with inline secrets masked
pub fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    for backend in config.inference.backends.values_mut() {
        if backend.api_key.is_some() {
            backend.api_key = Some(REDACTED.to_string());
        }
    }
    for surface in &mut config.transport.surfaces {
        if surface.token.is_some() {
            surface.token = Some(REDACTED.to_string());
        }
    }
    config
}

fn display_list(items: &[&str]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_masks_inline_secrets() {
        let mut config = Config::default();
        for backend in config.inference.backends.values_mut() {
            backend.api_key = Some("sk-live".to_string());
        }
        let mut surface = crate::config::SurfaceConfig::console("tg");
        surface.token = Some("123:abc".to_string());
        config.transport.surfaces.push(surface);

        let shown = serde_yaml::to_string(&redacted(&config)).unwrap();
        assert!(!shown.contains("sk-live"));
        assert!(!shown.contains("123:abc"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn test_display_list_empty() {
        assert_eq!(display_list(&[]), "none");
        assert_eq!(display_list(&["a", "b"]), "a, b");
    }
}
