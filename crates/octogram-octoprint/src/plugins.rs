//! Companion plugin calls: power control, smart plugs, filament manager,
//! layer progress, enclosure sensors and print cost settings.

use crate::types::{PluginReply, WebcamProfile};
use crate::HostServices;
use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// Smart plug plugins in the order they are preferred when several are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugPlugin {
    TasmotaMqtt,
    TplinkSmartplug,
    TuyaSmartplug,
}

impl PlugPlugin {
    const PRIORITY: [PlugPlugin; 3] = [
        PlugPlugin::TasmotaMqtt,
        PlugPlugin::TplinkSmartplug,
        PlugPlugin::TuyaSmartplug,
    ];

    pub fn id(self) -> &'static str {
        match self {
            PlugPlugin::TasmotaMqtt => "tasmota_mqtt",
            PlugPlugin::TplinkSmartplug => "tplinksmartplug",
            PlugPlugin::TuyaSmartplug => "tuyasmartplug",
        }
    }

    /// Settings key holding the configured plug list.
    pub fn settings_key(self) -> &'static str {
        match self {
            PlugPlugin::TasmotaMqtt => "arrRelays",
            PlugPlugin::TplinkSmartplug | PlugPlugin::TuyaSmartplug => "arrSmartplugs",
        }
    }

    pub fn from_installed(installed: &[String]) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|plugin| installed.iter().any(|p| p.eq_ignore_ascii_case(plugin.id())))
    }
}

/// A configured plug. `address` is what the plugin API expects back
/// (`topic_relayN` for tasmota, the ip for tplink, the label for tuya).
#[derive(Debug, Clone, PartialEq)]
pub struct SmartPlug {
    pub label: String,
    pub address: String,
    pub state: String,
}

fn text_field(entry: &Value, key: &str) -> String {
    match entry.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

pub fn parse_plugs(plugin: PlugPlugin, list: &Value) -> Vec<SmartPlug> {
    let Some(entries) = list.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|entry| match plugin {
            PlugPlugin::TasmotaMqtt => {
                let address = format!("{}_{}", text_field(entry, "topic"), text_field(entry, "relayN"));
                SmartPlug {
                    label: address.clone(),
                    address,
                    state: text_field(entry, "currentstate"),
                }
            }
            PlugPlugin::TplinkSmartplug => SmartPlug {
                label: text_field(entry, "label"),
                address: text_field(entry, "ip"),
                state: text_field(entry, "currentState"),
            },
            PlugPlugin::TuyaSmartplug => SmartPlug {
                label: text_field(entry, "label"),
                address: text_field(entry, "label"),
                state: text_field(entry, "currentState"),
            },
        })
        .collect()
}

/// Payload for `turnOn`/`turnOff` addressed at one plug.
pub fn plug_command(plugin: PlugPlugin, on: bool, address: &str) -> Value {
    let command = if on { "turnOn" } else { "turnOff" };
    match plugin {
        PlugPlugin::TasmotaMqtt => {
            let (topic, relay) = address.rsplit_once('_').unwrap_or((address, ""));
            json!({"command": command, "topic": topic, "relayN": relay})
        }
        PlugPlugin::TplinkSmartplug => json!({"command": command, "ip": address}),
        PlugPlugin::TuyaSmartplug => json!({"command": command, "label": address}),
    }
}

pub async fn psu_is_on(host: &dyn HostServices) -> Result<bool> {
    let reply = host
        .plugin_api("psucontrol", json!({"command": "getPSUState"}))
        .await?;
    if !reply.is_success() {
        bail!("psucontrol getPSUState answered with code {}", reply.status);
    }
    reply
        .body
        .get("isPSUOn")
        .and_then(Value::as_bool)
        .ok_or_else(|| anyhow!("psucontrol reply without isPSUOn"))
}

pub async fn psu_switch(host: &dyn HostServices, on: bool) -> Result<PluginReply> {
    let command = if on { "turnPSUOn" } else { "turnPSUOff" };
    host.plugin_api("psucontrol", json!({ "command": command })).await
}

pub async fn list_plugs(host: &dyn HostServices, plugin: PlugPlugin) -> Result<Vec<SmartPlug>> {
    let settings = host.settings().await?;
    let list = settings
        .pointer(&format!("/plugins/{}/{}", plugin.id(), plugin.settings_key()))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(parse_plugs(plugin, &list))
}

pub async fn switch_plug(
    host: &dyn HostServices,
    plugin: PlugPlugin,
    address: &str,
    on: bool,
) -> Result<PluginReply> {
    host.plugin_api(plugin.id(), plug_command(plugin, on, address)).await
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SpoolProfile {
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub material: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Spool {
    pub id: Value,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub used: f64,
    #[serde(default)]
    pub profile: SpoolProfile,
}

impl Spool {
    pub fn id_text(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{} {} {}", self.profile.vendor, self.name, self.profile.material)
    }

    pub fn percent_left(&self) -> i64 {
        if self.weight <= 0.0 {
            return 0;
        }
        (100.0 - self.used / self.weight * 100.0) as i64
    }
}

#[derive(Debug, Deserialize)]
struct SpoolList {
    #[serde(default)]
    spools: Vec<Spool>,
}

#[derive(Debug, Deserialize)]
struct Selection {
    #[serde(default)]
    tool: i64,
    spool: Option<Spool>,
}

#[derive(Debug, Deserialize)]
struct SelectionList {
    #[serde(default)]
    selections: Vec<Selection>,
}

#[derive(Debug, Deserialize)]
struct SelectionReply {
    selection: Selection,
}

fn decode_reply<T: serde::de::DeserializeOwned>(what: &str, reply: PluginReply) -> Result<T> {
    if !reply.is_success() {
        bail!("{} answered with code {}: {}", what, reply.status, reply.body);
    }
    serde_json::from_value(reply.body).map_err(|e| anyhow!("{} decode failed: {}", what, e))
}

pub async fn spools(host: &dyn HostServices) -> Result<Vec<Spool>> {
    let reply = host.plugin_get("filamentmanager/spools").await?;
    let list: SpoolList = decode_reply("filamentmanager spools", reply)?;
    Ok(list.spools)
}

/// Spool loaded in tool 0, if any.
pub async fn selected_spool(host: &dyn HostServices) -> Result<Option<Spool>> {
    let reply = host.plugin_get("filamentmanager/selections").await?;
    let list: SelectionList = decode_reply("filamentmanager selections", reply)?;
    Ok(list
        .selections
        .into_iter()
        .find(|s| s.tool == 0)
        .and_then(|s| s.spool))
}

pub async fn select_spool(host: &dyn HostServices, spool_id: &str) -> Result<Spool> {
    let body = json!({"selection": {"spool": {"id": spool_id}, "tool": 0}});
    let reply = host.plugin_patch("filamentmanager/selections/0", body).await?;
    let selected: SelectionReply = decode_reply("filamentmanager selection", reply)?;
    selected
        .selection
        .spool
        .ok_or_else(|| anyhow!("filamentmanager selection reply without spool"))
}

/// `(current, total)` layer from DisplayLayerProgress.
pub async fn layer_progress(host: &dyn HostServices) -> Result<(String, String)> {
    let reply = host.plugin_get("DisplayLayerProgress/values").await?;
    if !reply.is_success() {
        bail!("DisplayLayerProgress answered with code {}", reply.status);
    }
    let layer = reply.body.get("layer").cloned().unwrap_or(Value::Null);
    Ok((text_field(&layer, "current"), text_field(&layer, "total")))
}

/// Enclosure sensors shaped as `{current_temps, humidity, target_temps}`, keyed by index id.
pub async fn enclosure(host: &dyn HostServices) -> Result<Value> {
    let inputs = host.plugin_get("enclosure/inputs").await?;
    let outputs = host.plugin_get("enclosure/outputs").await?;
    Ok(enclosure_from(&inputs.body, &outputs.body))
}

pub fn enclosure_from(inputs: &Value, outputs: &Value) -> Value {
    let mut current = serde_json::Map::new();
    let mut humidity = serde_json::Map::new();
    let mut targets = serde_json::Map::new();

    for input in inputs.as_array().into_iter().flatten() {
        if input.get("input_type").and_then(Value::as_str) != Some("temperature_sensor") {
            continue;
        }
        let id = text_field(input, "index_id");
        let label = text_field(input, "label");
        if let Some(temp) = input.get("temp_sensor_temp").filter(|v| !v.is_null()) {
            current.insert(id.clone(), json!({"label": label, "temp": temp}));
        }
        if let Some(hum) = input.get("temp_sensor_humidity").filter(|v| !v.is_null()) {
            humidity.insert(id, json!({"label": label, "humidity": hum}));
        }
    }
    for output in outputs.as_array().into_iter().flatten() {
        if output.get("output_type").and_then(Value::as_str) != Some("temp_hum_control") {
            continue;
        }
        let id = text_field(output, "index_id");
        let label = text_field(output, "label");
        if let Some(temp) = output.get("temp_ctr_set_value").filter(|v| !v.is_null()) {
            targets.insert(id, json!({"label": label, "temp": temp}));
        }
    }

    json!({
        "current_temps": current,
        "humidity": humidity,
        "target_temps": targets,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostSettings {
    pub currency: String,
    pub per_length: f64,
    pub per_time: f64,
}

impl CostSettings {
    /// `length_mm` of filament and `seconds` of printing.
    pub fn estimate(&self, length_mm: f64, seconds: f64) -> String {
        let cost = length_mm / 1000.0 * self.per_length + seconds / 3600.0 * self.per_time;
        format!("{}{:.2}", self.currency, cost)
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn cost_settings(settings: &Value) -> Option<CostSettings> {
    let cost = settings.pointer("/plugins/cost")?;
    Some(CostSettings {
        currency: text_field(cost, "currency"),
        per_length: number(cost.get("cost_per_length"))?,
        per_time: number(cost.get("cost_per_time"))?,
    })
}

/// Webcams from `/api/settings`: the multi-cam list when present, else the classic `webcam` block.
pub fn webcam_profiles(settings: &Value) -> Vec<WebcamProfile> {
    let profile = |name: String, cam: &Value| {
        let url = |key: &str| {
            cam.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        WebcamProfile {
            name,
            snapshot: url("snapshotUrl").or_else(|| url("snapshot")),
            stream: url("streamUrl").or_else(|| url("stream")),
            snapshot_timeout_secs: number(cam.get("snapshotTimeout"))
                .map(|t| t.clamp(1.0, 15.0) as u64)
                .unwrap_or(15),
            flip_h: cam.get("flipH").and_then(Value::as_bool).unwrap_or(false),
            flip_v: cam.get("flipV").and_then(Value::as_bool).unwrap_or(false),
            rotate90: cam.get("rotate90").and_then(Value::as_bool).unwrap_or(false),
        }
    };

    if let Some(cams) = settings.pointer("/webcam/webcams").and_then(Value::as_array) {
        let list: Vec<WebcamProfile> = cams
            .iter()
            .enumerate()
            .map(|(i, cam)| {
                let name = cam
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("webcam{}", i));
                profile(name, cam)
            })
            .filter(|p| p.snapshot.is_some() || p.stream.is_some())
            .collect();
        if !list.is_empty() {
            return list;
        }
    }

    settings
        .get("webcam")
        .map(|cam| profile("classic".to_string(), cam))
        .filter(|p| p.snapshot.is_some() || p.stream.is_some())
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_plug_priority_prefers_tasmota() {
        let installed = vec!["tuyasmartplug".to_string(), "tasmota_mqtt".to_string()];
        assert_eq!(PlugPlugin::from_installed(&installed), Some(PlugPlugin::TasmotaMqtt));
        assert_eq!(PlugPlugin::from_installed(&["psucontrol".to_string()]), None);
    }

    #[test]
    fn tasmota_plugs_address_topic_and_relay() {
        let list = json!([{"topic": "sonoff_1", "relayN": "2", "currentstate": "ON"}]);
        let plugs = parse_plugs(PlugPlugin::TasmotaMqtt, &list);
        assert_eq!(plugs[0].label, "sonoff_1_2");
        assert_eq!(plugs[0].state, "ON");
        let payload = plug_command(PlugPlugin::TasmotaMqtt, true, &plugs[0].address);
        assert_eq!(payload, json!({"command": "turnOn", "topic": "sonoff_1", "relayN": "2"}));
    }

    #[test]
    fn tplink_plugs_are_addressed_by_ip() {
        let list = json!([{"ip": "10.0.0.9", "label": "Printer", "currentState": "off"}]);
        let plugs = parse_plugs(PlugPlugin::TplinkSmartplug, &list);
        assert_eq!(plugs[0].label, "Printer");
        assert_eq!(
            plug_command(PlugPlugin::TplinkSmartplug, false, &plugs[0].address),
            json!({"command": "turnOff", "ip": "10.0.0.9"})
        );
        assert!(parse_plugs(PlugPlugin::TuyaSmartplug, &Value::Null).is_empty());
    }

    #[test]
    fn spool_percent_uses_weight_and_usage() {
        let spool: Spool = serde_json::from_value(json!({
            "id": 3, "name": "Galaxy", "weight": 1000.0, "used": 250.0,
            "profile": {"vendor": "Prusament", "material": "PLA"}
        }))
        .expect("spool");
        assert_eq!(spool.percent_left(), 75);
        assert_eq!(spool.id_text(), "3");
        assert_eq!(spool.describe(), "Prusament Galaxy PLA");
    }

    #[test]
    fn cost_estimate_combines_length_and_time() {
        let settings = json!({"plugins": {"cost": {"currency": "€", "cost_per_length": 0.05, "cost_per_time": "1.5"}}});
        let cost = cost_settings(&settings).expect("cost");
        assert_eq!(cost.estimate(2000.0, 7200.0), "€3.10");
        assert!(cost_settings(&json!({})).is_none());
    }

    #[test]
    fn enclosure_groups_sensors_by_kind() {
        let inputs = json!([
            {"index_id": 1, "label": "Chamber", "input_type": "temperature_sensor", "temp_sensor_temp": 31.5, "temp_sensor_humidity": 40},
            {"index_id": 2, "label": "Door", "input_type": "gpio"}
        ]);
        let outputs = json!([{"index_id": 5, "label": "Heater", "output_type": "temp_hum_control", "temp_ctr_set_value": 35}]);
        let value = enclosure_from(&inputs, &outputs);
        assert_eq!(value["current_temps"]["1"]["temp"], 31.5);
        assert_eq!(value["humidity"]["1"]["humidity"], 40);
        assert_eq!(value["target_temps"]["5"]["label"], "Heater");
        assert!(value["current_temps"].get("2").is_none());
    }

    #[test]
    fn classic_webcam_settings_are_read() {
        let settings = json!({"webcam": {
            "snapshotUrl": "http://cam/snap", "streamUrl": "", "flipH": true, "snapshotTimeout": 30
        }});
        let cams = webcam_profiles(&settings);
        assert_eq!(cams.len(), 1);
        assert_eq!(cams[0].snapshot.as_deref(), Some("http://cam/snap"));
        assert_eq!(cams[0].stream, None);
        assert!(cams[0].flip_h);
        assert_eq!(cams[0].snapshot_timeout_secs, 15);
        assert!(webcam_profiles(&json!({"webcam": {}})).is_empty());
    }
}
