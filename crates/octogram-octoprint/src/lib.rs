//! Octogram OctoPrint
//!
//! Capability traits for the printer collaborator and the REST client that
//! implements them against a running OctoPrint server

pub mod client;
pub mod plugins;
pub mod types;

pub use client::OctoPrintClient;
pub use plugins::PlugPlugin;
pub use types::*;

use anyhow::Result;
use std::time::Duration;
use tracing::warn;

/// Printer state and motion/temperature control.
#[async_trait::async_trait]
pub trait PrinterControl: Send + Sync {
    async fn printer(&self) -> Result<PrinterSnapshot>;
    async fn job(&self) -> Result<JobSnapshot>;
    async fn connection(&self) -> Result<ConnectionInfo>;
    async fn connect(&self, request: &ConnectRequest) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn start_print(&self) -> Result<()>;
    /// Drops the loaded file unless a job is running on it.
    async fn unselect(&self) -> Result<()>;
    async fn cancel_print(&self) -> Result<()>;
    async fn toggle_pause(&self) -> Result<()>;
    async fn home(&self, axes: &[&str]) -> Result<()>;
    /// `heater` is `tool<N>` or `bed`.
    async fn set_temperature(&self, heater: &str, target: f64) -> Result<()>;
    async fn feed_rate(&self, percent: u32) -> Result<()>;
    async fn flow_rate(&self, percent: u32) -> Result<()>;
    async fn commands(&self, commands: &[String]) -> Result<()>;
    async fn script(&self, name: &str) -> Result<()>;
    async fn profiles(&self) -> Result<Vec<PrinterProfile>>;
}

/// The printer's file manager. Paths are relative to an origin (`local` or `sdcard`).
#[async_trait::async_trait]
pub trait FileStorage: Send + Sync {
    /// Recursive tree of every origin.
    async fn list(&self) -> Result<Vec<FileEntry>>;
    async fn entry(&self, origin: &str, path: &str) -> Result<Option<FileEntry>>;
    async fn exists(&self, origin: &str, path: &str) -> Result<bool> {
        Ok(self.entry(origin, path).await?.is_some())
    }
    async fn add_folder(&self, origin: &str, path: &str) -> Result<()>;
    /// Stores `bytes` as `folder/name` and returns the resulting path.
    async fn add_file(&self, origin: &str, folder: &str, name: &str, bytes: Vec<u8>) -> Result<String>;
    async fn select(&self, origin: &str, path: &str, print: bool) -> Result<()>;
    async fn copy(&self, origin: &str, source: &str, destination: &str) -> Result<()>;
    async fn move_entry(&self, origin: &str, source: &str, destination: &str) -> Result<()>;
    async fn remove(&self, origin: &str, path: &str) -> Result<()>;
    /// True when the file (or a file below the folder) is used by the running job.
    async fn is_busy(&self, origin: &str, path: &str) -> Result<bool>;
    async fn download(&self, origin: &str, path: &str) -> Result<Vec<u8>>;
}

/// Server-wide services: settings, plugins, system commands and raw fetches.
#[async_trait::async_trait]
pub trait HostServices: Send + Sync {
    async fn installed_plugins(&self) -> Result<Vec<String>>;
    async fn settings(&self) -> Result<serde_json::Value>;
    async fn update_settings(&self, patch: serde_json::Value) -> Result<()>;
    async fn set_default_profile(&self, profile_id: &str) -> Result<()>;
    async fn system_commands(&self) -> Result<Vec<SystemCommand>>;
    async fn run_system_command(&self, source: &str, action: &str) -> Result<()>;
    async fn custom_controls(&self) -> Result<serde_json::Value>;
    /// `POST /api/plugin/<plugin>` with a `{"command": ...}` payload.
    async fn plugin_api(&self, plugin: &str, payload: serde_json::Value) -> Result<PluginReply>;
    async fn plugin_get(&self, path: &str) -> Result<PluginReply>;
    async fn plugin_patch(&self, path: &str, body: serde_json::Value) -> Result<PluginReply>;
    /// Fetches an absolute URL or a path relative to the server (thumbnails, snapshots).
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// Companion plugins detected once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub psucontrol: bool,
    pub smart_plug: Option<PlugPlugin>,
    pub filament_manager: bool,
    pub display_layer_progress: bool,
    pub enclosure: bool,
    pub cost: bool,
}

impl Capabilities {
    pub fn from_plugins(installed: &[String]) -> Self {
        let has = |id: &str| installed.iter().any(|p| p.eq_ignore_ascii_case(id));
        Self {
            psucontrol: has("psucontrol"),
            smart_plug: PlugPlugin::from_installed(installed),
            filament_manager: has("filamentmanager"),
            display_layer_progress: has("DisplayLayerProgress"),
            enclosure: has("enclosure"),
            cost: has("cost"),
        }
    }

    pub async fn detect(host: &dyn HostServices) -> Self {
        match host.installed_plugins().await {
            Ok(installed) => Self::from_plugins(&installed),
            Err(e) => {
                warn!("Plugin detection failed, optional features disabled: {}", e);
                Self::default()
            }
        }
    }

    pub fn power_control(&self) -> bool {
        self.psucontrol || self.smart_plug.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_match_plugin_ids_case_insensitively() {
        let installed = vec![
            "PSUControl".to_string(),
            "displaylayerprogress".to_string(),
            "tplinksmartplug".to_string(),
        ];
        let caps = Capabilities::from_plugins(&installed);
        assert!(caps.psucontrol);
        assert!(caps.display_layer_progress);
        assert_eq!(caps.smart_plug, Some(PlugPlugin::TplinkSmartplug));
        assert!(!caps.filament_manager);
        assert!(caps.power_control());
    }

    #[test]
    fn no_plugins_means_no_power_control() {
        let caps = Capabilities::from_plugins(&[]);
        assert!(!caps.power_control());
        assert_eq!(caps, Capabilities::default());
    }
}
