use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pocketclaw::providers::fake::ScriptedBackend;
use pocketclaw::providers::{Backend, InferenceRouter, RouterSettings};
use pocketclaw::session::{SessionLimits, SledStore, StoreSettings};
use tempfile::TempDir;

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

#[allow(dead_code)]
pub fn open_sled(dir: &TempDir) -> Arc<SledStore> {
    Arc::new(SledStore::new(dir.path().join("sessions")).expect("failed to open sled store"))
}

#[allow(dead_code)]
pub fn store_settings(max_messages: usize, expiry: Duration) -> StoreSettings {
    StoreSettings {
        limits: SessionLimits {
            max_messages,
            max_bytes: 1 << 20,
        },
        expiry,
        memory_budget_bytes: 1 << 20,
    }
}

#[allow(dead_code)]
pub fn router_over(backends: Vec<ScriptedBackend>, settings: RouterSettings) -> Arc<InferenceRouter> {
    let backends = backends
        .into_iter()
        .map(|backend| Arc::new(backend) as Arc<dyn Backend>)
        .collect();
    Arc::new(InferenceRouter::new(backends, settings).expect("failed to build router"))
}
