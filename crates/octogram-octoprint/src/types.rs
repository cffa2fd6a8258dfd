//! Wire types of the OctoPrint REST API, trimmed to the fields the bridge reads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    #[serde(default)]
    pub actual: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
}

impl Temperature {
    pub fn actual_or_zero(&self) -> f64 {
        self.actual.unwrap_or(0.0)
    }

    pub fn target_or_zero(&self) -> f64 {
        self.target.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterFlags {
    #[serde(default)]
    pub operational: bool,
    #[serde(default)]
    pub printing: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pausing: bool,
    #[serde(default)]
    pub cancelling: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub closed_or_error: bool,
    #[serde(default)]
    pub sd_ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterState {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub flags: PrinterFlags,
}

/// `GET /api/printer`. A printer that is not connected is reported as [`PrinterSnapshot::offline`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    #[serde(default)]
    pub state: PrinterState,
    #[serde(default)]
    pub temperature: BTreeMap<String, Temperature>,
}

impl PrinterSnapshot {
    pub fn offline() -> Self {
        Self {
            state: PrinterState {
                text: "Offline".to_string(),
                flags: PrinterFlags {
                    closed_or_error: true,
                    ..PrinterFlags::default()
                },
            },
            temperature: BTreeMap::new(),
        }
    }

    pub fn is_operational(&self) -> bool {
        self.state.flags.operational
    }

    pub fn is_printing(&self) -> bool {
        self.state.flags.printing
    }

    pub fn is_paused(&self) -> bool {
        self.state.flags.paused || self.state.flags.pausing
    }

    /// Operational, idle and not in an error state.
    pub fn is_ready(&self) -> bool {
        let flags = &self.state.flags;
        flags.operational && !flags.printing && !self.is_paused() && !flags.cancelling && !flags.error
    }

    /// Temperature of a heater such as `tool0` or `bed`; missing heaters read as zero.
    pub fn heater(&self, name: &str) -> Temperature {
        self.temperature.get(name).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    #[serde(default)]
    pub file: JobFile,
    #[serde(default)]
    pub estimated_print_time: Option<f64>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    #[serde(default)]
    pub completion: Option<f64>,
    #[serde(default)]
    pub print_time: Option<f64>,
    #[serde(default)]
    pub print_time_left: Option<f64>,
}

/// `GET /api/job`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(default)]
    pub job: JobInfo,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default)]
    pub state: String,
}

impl JobSnapshot {
    pub fn file_name(&self) -> Option<&str> {
        self.job.file.name.as_deref()
    }

    pub fn file_path(&self) -> Option<&str> {
        self.job.file.path.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentConnection {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
    #[serde(default)]
    pub printer_profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub baudrates: Vec<u32>,
    #[serde(default)]
    pub printer_profiles: Vec<ProfileRef>,
    #[serde(default)]
    pub port_preference: Option<String>,
    #[serde(default)]
    pub baudrate_preference: Option<u32>,
    #[serde(default)]
    pub printer_profile_preference: Option<String>,
    #[serde(default)]
    pub autoconnect: Option<bool>,
}

/// `GET /api/connection`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub current: CurrentConnection,
    #[serde(default)]
    pub options: ConnectionOptions,
}

/// Parameters for `connect`; `None` lets OctoPrint pick (AUTO).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectRequest {
    pub port: Option<String>,
    pub baudrate: Option<u32>,
    pub printer_profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtruderInfo {
    #[serde(default = "default_extruder_count")]
    pub count: u32,
}

fn default_extruder_count() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub current: bool,
    #[serde(default)]
    pub heated_bed: bool,
    #[serde(default)]
    pub extruder: ExtruderInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilamentUse {
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcodeAnalysis {
    #[serde(default)]
    pub estimated_print_time: Option<f64>,
    #[serde(default)]
    pub filament: BTreeMap<String, FilamentUse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPrint {
    #[serde(default)]
    pub date: Option<f64>,
    #[serde(default)]
    pub print_time: Option<f64>,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintStats {
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failure: u32,
    #[serde(default)]
    pub last: Option<LastPrint>,
}

impl PrintStats {
    pub fn total(&self) -> u32 {
        self.success + self.failure
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatistics {
    #[serde(default)]
    pub average_print_time: BTreeMap<String, f64>,
    #[serde(default)]
    pub last_print_time: BTreeMap<String, f64>,
}

/// One node of the `GET /api/files?recursive=true` tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub children: Vec<FileEntry>,
    #[serde(default, rename = "gcodeAnalysis")]
    pub analysis: Option<GcodeAnalysis>,
    #[serde(default)]
    pub prints: Option<PrintStats>,
    #[serde(default)]
    pub statistics: Option<FileStatistics>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl FileEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == "folder"
    }

    pub fn is_machinecode(&self) -> bool {
        self.kind == "machinecode"
    }

    /// File name without its last extension.
    pub fn display_stem(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

/// A server or custom command from `GET /api/system/commands`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemCommand {
    #[serde(default)]
    pub source: String,
    pub action: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub confirm: Option<serde_json::Value>,
}

impl SystemCommand {
    /// OctoPrint marks commands needing confirmation with a prompt text (or `true`).
    pub fn needs_confirm(&self) -> bool {
        match &self.confirm {
            Some(serde_json::Value::String(text)) => !text.is_empty(),
            Some(serde_json::Value::Bool(flag)) => *flag,
            _ => false,
        }
    }
}

/// Status and decoded body of a plugin API call. Plugins answer with
/// arbitrary JSON (or nothing), so the body is kept untyped.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginReply {
    pub status: u16,
    pub body: serde_json::Value,
}

impl PluginReply {
    pub fn is_success(&self) -> bool {
        self.status < 300
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebcamProfile {
    pub name: String,
    pub snapshot: Option<String>,
    pub stream: Option<String>,
    pub snapshot_timeout_secs: u64,
    pub flip_h: bool,
    pub flip_v: bool,
    pub rotate90: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printer_snapshot_decodes_state_flags() {
        let snapshot: PrinterSnapshot = serde_json::from_value(serde_json::json!({
            "temperature": {
                "tool0": {"actual": 214.8, "target": 220.0, "offset": 0},
                "bed": {"actual": 55.1, "target": null}
            },
            "state": {
                "text": "Printing",
                "flags": {"operational": true, "printing": true, "closedOrError": false, "sdReady": true}
            }
        }))
        .expect("decode");
        assert!(snapshot.is_printing());
        assert!(!snapshot.is_ready());
        assert_eq!(snapshot.heater("tool0").target_or_zero(), 220.0);
        assert_eq!(snapshot.heater("bed").target_or_zero(), 0.0);
        assert_eq!(snapshot.heater("tool3"), Temperature::default());
    }

    #[test]
    fn offline_snapshot_is_not_operational() {
        let snapshot = PrinterSnapshot::offline();
        assert!(!snapshot.is_operational());
        assert!(!snapshot.is_ready());
        assert!(snapshot.state.flags.closed_or_error);
    }

    #[test]
    fn file_tree_decodes_children_and_analysis() {
        let entry: FileEntry = serde_json::from_value(serde_json::json!({
            "name": "parts",
            "path": "parts",
            "type": "folder",
            "origin": "local",
            "children": [{
                "name": "benchy.gcode",
                "path": "parts/benchy.gcode",
                "type": "machinecode",
                "origin": "local",
                "date": 1700000000,
                "size": 1048576,
                "gcodeAnalysis": {
                    "estimatedPrintTime": 5400.0,
                    "filament": {"tool0": {"length": 2500.0, "volume": 6.0}}
                },
                "prints": {"success": 2, "failure": 1, "last": {"date": 1700001000.0, "success": true}}
            }]
        }))
        .expect("decode");
        assert!(entry.is_folder());
        let child = &entry.children[0];
        assert!(child.is_machinecode());
        assert_eq!(child.display_stem(), "benchy");
        assert_eq!(child.prints.as_ref().map(PrintStats::total), Some(3));
        let analysis = child.analysis.as_ref().expect("analysis");
        assert_eq!(analysis.filament["tool0"].length, Some(2500.0));
    }

    #[test]
    fn system_command_confirmation_accepts_text_or_flag() {
        let mut command = SystemCommand {
            action: "reboot".to_string(),
            ..SystemCommand::default()
        };
        assert!(!command.needs_confirm());
        command.confirm = Some(serde_json::json!("You are about to reboot the system."));
        assert!(command.needs_confirm());
        command.confirm = Some(serde_json::json!(false));
        assert!(!command.needs_confirm());
    }
}
