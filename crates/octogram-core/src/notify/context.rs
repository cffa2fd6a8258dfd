//! Values a notification template may reference.
//!
//! Sources are fetched on first use and memoized, so a template that only
//! mentions `{file}` never queries temperatures or plugins.

use crate::format::{calculate_eta, format_timedelta};
use octogram_config::NotificationsConfig;
use octogram_octoprint::{plugins, Capabilities, HostServices, JobSnapshot, PrinterControl, PrinterSnapshot};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Every field a template can use; other placeholders are left untouched.
pub const FIELDS: &[&str] = &[
    "status",
    "event",
    "z",
    "temps",
    "bed_temp",
    "bed_target",
    "e1_temp",
    "e1_target",
    "e2_temp",
    "e2_target",
    "e3_temp",
    "e3_target",
    "e4_temp",
    "e4_target",
    "e5_temp",
    "e5_target",
    "percent",
    "time_done",
    "time_left",
    "time_finish",
    "currentLayer",
    "totalLayer",
    "owner",
    "user",
    "file",
    "path",
    "error_msg",
    "UserNotif_Text",
    "enclosure",
];

const UNKNOWN: &str = "[Unknown]";

pub struct NotifyContext<'a> {
    event: &'a str,
    payload: &'a Value,
    z: f64,
    printer: &'a dyn PrinterControl,
    host: &'a dyn HostServices,
    capabilities: &'a Capabilities,
    config: &'a NotificationsConfig,
    snapshot: OnceCell<PrinterSnapshot>,
    job: OnceCell<JobSnapshot>,
    layers: OnceCell<(String, String)>,
}

impl<'a> NotifyContext<'a> {
    pub fn new(
        event: &'a str,
        payload: &'a Value,
        z: f64,
        printer: &'a dyn PrinterControl,
        host: &'a dyn HostServices,
        capabilities: &'a Capabilities,
        config: &'a NotificationsConfig,
    ) -> Self {
        Self {
            event,
            payload,
            z,
            printer,
            host,
            capabilities,
            config,
            snapshot: OnceCell::new(),
            job: OnceCell::new(),
            layers: OnceCell::new(),
        }
    }

    async fn snapshot(&self) -> &PrinterSnapshot {
        self.snapshot
            .get_or_init(|| async {
                self.printer.printer().await.unwrap_or_else(|e| {
                    debug!("Printer state unavailable for notification: {}", e);
                    PrinterSnapshot::offline()
                })
            })
            .await
    }

    async fn job(&self) -> &JobSnapshot {
        self.job
            .get_or_init(|| async {
                self.printer.job().await.unwrap_or_else(|e| {
                    debug!("Job state unavailable for notification: {}", e);
                    JobSnapshot::default()
                })
            })
            .await
    }

    async fn layers(&self) -> &(String, String) {
        self.layers
            .get_or_init(|| async {
                let unknown = ("?".to_string(), "?".to_string());
                if !self.capabilities.display_layer_progress {
                    return unknown;
                }
                plugins::layer_progress(self.host).await.unwrap_or_else(|e| {
                    warn!("DisplayLayerProgress query failed: {}", e);
                    unknown
                })
            })
            .await
    }

    fn payload_text(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    async fn temperature(&self, heater: &str, target: bool) -> Value {
        let temp = self.snapshot().await.heater(heater);
        json!(if target { temp.target_or_zero() } else { temp.actual_or_zero() })
    }

    /// Value of one allow-listed field.
    pub async fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "status" => json!(self.snapshot().await.state.text),
            "event" => json!(self.event),
            "z" => json!(self.z),
            "temps" => {
                let temps: Map<String, Value> = self
                    .snapshot()
                    .await
                    .temperature
                    .iter()
                    .map(|(heater, t)| {
                        (
                            heater.clone(),
                            json!({"actual": t.actual_or_zero(), "target": t.target_or_zero()}),
                        )
                    })
                    .collect();
                Value::Object(temps)
            }
            "bed_temp" => self.temperature("bed", false).await,
            "bed_target" => self.temperature("bed", true).await,
            "percent" => json!(self.job().await.progress.completion.unwrap_or(0.0) as i64),
            "time_done" => json!(format_timedelta(self.job().await.progress.print_time.unwrap_or(0.0))),
            "time_left" => match self.job().await.progress.print_time_left {
                Some(left) => json!(format_timedelta(left)),
                None => json!(UNKNOWN),
            },
            "time_finish" => match self.job().await.progress.print_time_left {
                Some(left) => match calculate_eta(left, self.config) {
                    Ok(eta) => json!(eta),
                    Err(e) => {
                        warn!("Failed to compute finish time: {}", e);
                        json!(UNKNOWN)
                    }
                },
                None => json!(UNKNOWN),
            },
            "currentLayer" => json!(self.layers().await.0),
            "totalLayer" => json!(self.layers().await.1),
            "owner" => json!(self.job().await.job.user.clone().unwrap_or_default()),
            "user" => json!(self.payload_text("user").unwrap_or_default()),
            "file" => {
                let from_payload = ["filename", "gcode", "file"]
                    .iter()
                    .find_map(|key| self.payload_text(key));
                match from_payload {
                    Some(file) => json!(file),
                    None => json!(self.job().await.file_name().unwrap_or_default()),
                }
            }
            "path" => json!(self.job().await.file_path().unwrap_or_default()),
            "error_msg" => json!(self.payload_text("error").unwrap_or_default()),
            "UserNotif_Text" => json!(self.payload_text("UserNotif").unwrap_or_default()),
            "enclosure" => self.enclosure().await,
            other => {
                let (index, target) = extruder_field(other)?;
                self.temperature(&format!("tool{}", index - 1), target).await
            }
        };
        Some(value)
    }

    async fn enclosure(&self) -> Value {
        let empty = json!({"current_temps": {}, "humidity": {}, "target_temps": {}});
        if !self.capabilities.enclosure {
            return empty;
        }
        plugins::enclosure(self.host).await.unwrap_or_else(|e| {
            warn!("Enclosure query failed: {}", e);
            empty
        })
    }

    /// Values for the allow-listed fields among `wanted`.
    pub async fn values(&self, wanted: &BTreeSet<&str>) -> HashMap<String, Value> {
        let mut values = HashMap::new();
        for name in wanted.iter().filter(|name| FIELDS.contains(name)) {
            if let Some(value) = self.field(name).await {
                values.insert(name.to_string(), value);
            }
        }
        values
    }
}

/// `e3_target` -> `(3, true)`.
fn extruder_field(name: &str) -> Option<(usize, bool)> {
    let rest = name.strip_prefix('e')?;
    let (index, kind) = rest.split_once('_')?;
    let index: usize = index.parse().ok()?;
    if !(1..=5).contains(&index) {
        return None;
    }
    match kind {
        "temp" => Some((index, false)),
        "target" => Some((index, true)),
        _ => None,
    }
}
