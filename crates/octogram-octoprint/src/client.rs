//! REST client for the OctoPrint API.

use crate::types::*;
use crate::{FileStorage, HostServices, PrinterControl};
use anyhow::{anyhow, bail, Result};
use octogram_config::OctoPrintConfig;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, ClientBuilder, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_KEY_HEADER: &str = "X-Api-Key";

pub struct OctoPrintClient {
    client: Client,
    base: Url,
    api_key: String,
}

impl std::fmt::Debug for OctoPrintClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OctoPrintClient")
            .field("base", &self.base.as_str())
            .finish()
    }
}

/// Splits `a/b/c` into non-empty segments.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl OctoPrintClient {
    pub fn new(config: &OctoPrintConfig) -> Result<Self> {
        let mut base = Url::parse(config.base_url.trim())
            .map_err(|e| anyhow!("invalid octoprint base_url {:?}: {}", config.base_url, e))?;
        if base.cannot_be_a_base() {
            bail!("octoprint base_url {:?} cannot be a base URL", config.base_url);
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            base,
            api_key: config.api_key.trim().to_string(),
        })
    }

    /// Base URL plus the given path segments, each percent-encoded on its own.
    pub fn endpoint<'a, I>(&self, parts: I) -> Result<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("octoprint base_url cannot be a base URL"))?;
            path.pop_if_empty();
            for part in parts {
                path.push(part);
            }
        }
        Ok(url)
    }

    fn file_endpoint(&self, prefix: &[&str], origin: &str, path: &str) -> Result<Url> {
        self.endpoint(prefix.iter().copied().chain([origin]).chain(segments(path)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("OctoPrint request {} {}", method, url.path());
        self.client.request(method, url).header(API_KEY_HEADER, &self.api_key)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| anyhow!("octoprint {} request failed: {}", what, e.without_url()))
    }

    async fn expect_success(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("octoprint {} responded with code {}. Response was: {}", what, status.as_u16(), body)
    }

    async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("octoprint {} decode failed: {}", what, e.without_url()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(segments(path))?;
        let response = self.send(self.request(Method::GET, url), path).await?;
        let response = Self::expect_success(response, path).await?;
        Self::decode(response, path).await
    }

    async fn post_command(&self, path: &str, body: Value) -> Result<()> {
        let url = self.endpoint(segments(path))?;
        let response = self.send(self.request(Method::POST, url).json(&body), path).await?;
        Self::expect_success(response, path).await?;
        Ok(())
    }

    async fn plugin_reply(response: Response) -> PluginReply {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(if text.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        });
        PluginReply { status, body }
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct ProfileMap {
    #[serde(default)]
    profiles: BTreeMap<String, PrinterProfile>,
}

#[derive(Debug, Deserialize)]
struct InstalledPlugin {
    key: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PluginList {
    #[serde(default)]
    plugins: Vec<InstalledPlugin>,
}

fn connect_payload(request: &ConnectRequest) -> Value {
    let mut payload = json!({ "command": "connect" });
    if let Some(port) = &request.port {
        payload["port"] = json!(port);
    }
    if let Some(baudrate) = request.baudrate {
        payload["baudrate"] = json!(baudrate);
    }
    if let Some(profile) = &request.printer_profile {
        payload["printerProfile"] = json!(profile);
    }
    payload
}

/// `GET /api/system/commands` groups commands by source.
fn flatten_system_commands(body: BTreeMap<String, Vec<SystemCommand>>) -> Vec<SystemCommand> {
    let mut all = Vec::new();
    for source in ["core", "custom"] {
        if let Some(commands) = body.get(source) {
            all.extend(commands.iter().cloned().map(|mut command| {
                if command.source.is_empty() {
                    command.source = source.to_string();
                }
                command
            }));
        }
    }
    all
}

/// True when `job_path` is `path` itself or lies below the folder `path`.
pub fn path_in_use(job_path: &str, path: &str) -> bool {
    let path = path.trim_matches('/');
    let job_path = job_path.trim_matches('/');
    job_path == path || (!path.is_empty() && job_path.starts_with(&format!("{}/", path)))
}

fn selected_file(job: &JobSnapshot) -> Option<(String, String)> {
    let file = &job.job.file;
    match (&file.origin, &file.path) {
        (Some(origin), Some(path)) if !path.is_empty() => Some((origin.clone(), path.clone())),
        _ => None,
    }
}

#[async_trait::async_trait]
impl PrinterControl for OctoPrintClient {
    async fn printer(&self) -> Result<PrinterSnapshot> {
        let url = self.endpoint(["api", "printer"])?;
        let response = self.send(self.request(Method::GET, url), "api/printer").await?;
        // 409: printer is not operational
        if response.status() == StatusCode::CONFLICT {
            return Ok(PrinterSnapshot::offline());
        }
        let response = Self::expect_success(response, "api/printer").await?;
        Self::decode(response, "api/printer").await
    }

    async fn job(&self) -> Result<JobSnapshot> {
        self.get_json("api/job").await
    }

    async fn connection(&self) -> Result<ConnectionInfo> {
        self.get_json("api/connection").await
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<()> {
        self.post_command("api/connection", connect_payload(request)).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.post_command("api/connection", json!({"command": "disconnect"}))
            .await
    }

    async fn start_print(&self) -> Result<()> {
        self.post_command("api/job", json!({"command": "start"})).await
    }

    async fn unselect(&self) -> Result<()> {
        let job = self.job().await?;
        let Some((origin, path)) = selected_file(&job) else {
            return Ok(());
        };
        let url = self.file_endpoint(&["api", "files"], &origin, &path)?;
        let request = self
            .request(Method::POST, url)
            .json(&json!({"command": "unselect"}));
        let response = self.send(request, "api/files").await?;
        // 409: the file belongs to a running job
        if response.status() == StatusCode::CONFLICT {
            debug!("Not unselecting {}/{} while it is printing", origin, path);
            return Ok(());
        }
        Self::expect_success(response, "api/files").await?;
        Ok(())
    }

    async fn cancel_print(&self) -> Result<()> {
        self.post_command("api/job", json!({"command": "cancel"})).await
    }

    async fn toggle_pause(&self) -> Result<()> {
        self.post_command("api/job", json!({"command": "pause", "action": "toggle"}))
            .await
    }

    async fn home(&self, axes: &[&str]) -> Result<()> {
        self.post_command("api/printer/printhead", json!({"command": "home", "axes": axes}))
            .await
    }

    async fn set_temperature(&self, heater: &str, target: f64) -> Result<()> {
        if heater == "bed" {
            self.post_command("api/printer/bed", json!({"command": "target", "target": target}))
                .await
        } else if heater.starts_with("tool") {
            self.post_command(
                "api/printer/tool",
                json!({"command": "target", "targets": { heater: target }}),
            )
            .await
        } else {
            bail!("unknown heater {:?}", heater)
        }
    }

    async fn feed_rate(&self, percent: u32) -> Result<()> {
        self.post_command("api/printer/printhead", json!({"command": "feedrate", "factor": percent}))
            .await
    }

    async fn flow_rate(&self, percent: u32) -> Result<()> {
        self.post_command("api/printer/tool", json!({"command": "flowrate", "factor": percent}))
            .await
    }

    async fn commands(&self, commands: &[String]) -> Result<()> {
        self.post_command("api/printer/command", json!({ "commands": commands }))
            .await
    }

    async fn script(&self, name: &str) -> Result<()> {
        let url = self.endpoint(["api", "printer", "command"])?;
        let request = self.request(Method::POST, url).json(&json!({ "script": name }));
        let response = self.send(request, "api/printer/command").await?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("Unknown script: {}", name);
        }
        Self::expect_success(response, "api/printer/command").await?;
        Ok(())
    }

    async fn profiles(&self) -> Result<Vec<PrinterProfile>> {
        let map: ProfileMap = self.get_json("api/printerprofiles").await?;
        Ok(map.profiles.into_values().collect())
    }
}

#[async_trait::async_trait]
impl FileStorage for OctoPrintClient {
    async fn list(&self) -> Result<Vec<FileEntry>> {
        let mut url = self.endpoint(["api", "files"])?;
        url.query_pairs_mut().append_pair("recursive", "true");
        let response = self.send(self.request(Method::GET, url), "api/files").await?;
        let response = Self::expect_success(response, "api/files").await?;
        let list: FileList = Self::decode(response, "api/files").await?;
        Ok(list.files)
    }

    async fn entry(&self, origin: &str, path: &str) -> Result<Option<FileEntry>> {
        let url = self.file_endpoint(&["api", "files"], origin, path)?;
        let response = self.send(self.request(Method::GET, url), "api/files").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success(response, "api/files").await?;
        Ok(Some(Self::decode(response, "api/files").await?))
    }

    async fn add_folder(&self, origin: &str, path: &str) -> Result<()> {
        let path = path.trim_matches('/');
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        let url = self.endpoint(["api", "files", origin])?;
        let form = Form::new()
            .text("foldername", name.to_string())
            .text("path", parent.to_string());
        let response = self
            .send(self.request(Method::POST, url).multipart(form), "api/files")
            .await?;
        // 409: folder already exists
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::expect_success(response, "api/files").await?;
        Ok(())
    }

    async fn add_file(&self, origin: &str, folder: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        let url = self.endpoint(["api", "files", origin])?;
        let form = Form::new()
            .text("path", folder.trim_matches('/').to_string())
            .part("file", Part::bytes(bytes).file_name(name.to_string()));
        let response = self
            .send(self.request(Method::POST, url).multipart(form), "api/files")
            .await?;
        let response = Self::expect_success(response, "api/files").await?;
        let body: Value = Self::decode(response, "api/files").await?;
        let stored = body
            .pointer(&format!("/files/{}/path", origin))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(stored.unwrap_or_else(|| {
            let folder = folder.trim_matches('/');
            if folder.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", folder, name)
            }
        }))
    }

    async fn select(&self, origin: &str, path: &str, print: bool) -> Result<()> {
        let url = self.file_endpoint(&["api", "files"], origin, path)?;
        let request = self
            .request(Method::POST, url)
            .json(&json!({"command": "select", "print": print}));
        let response = self.send(request, "api/files").await?;
        Self::expect_success(response, "api/files").await?;
        Ok(())
    }

    async fn copy(&self, origin: &str, source: &str, destination: &str) -> Result<()> {
        let url = self.file_endpoint(&["api", "files"], origin, source)?;
        let request = self
            .request(Method::POST, url)
            .json(&json!({"command": "copy", "destination": destination}));
        let response = self.send(request, "api/files").await?;
        Self::expect_success(response, "api/files").await?;
        Ok(())
    }

    async fn move_entry(&self, origin: &str, source: &str, destination: &str) -> Result<()> {
        let url = self.file_endpoint(&["api", "files"], origin, source)?;
        let request = self
            .request(Method::POST, url)
            .json(&json!({"command": "move", "destination": destination}));
        let response = self.send(request, "api/files").await?;
        Self::expect_success(response, "api/files").await?;
        Ok(())
    }

    async fn remove(&self, origin: &str, path: &str) -> Result<()> {
        let url = self.file_endpoint(&["api", "files"], origin, path)?;
        let response = self.send(self.request(Method::DELETE, url), "api/files").await?;
        Self::expect_success(response, "api/files").await?;
        Ok(())
    }

    async fn is_busy(&self, origin: &str, path: &str) -> Result<bool> {
        let printer = self.printer().await?;
        if !printer.is_printing() && !printer.is_paused() {
            return Ok(false);
        }
        let job = self.job().await?;
        let same_origin = job.job.file.origin.as_deref() == Some(origin);
        Ok(same_origin && job.file_path().is_some_and(|p| path_in_use(p, path)))
    }

    async fn download(&self, origin: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.file_endpoint(&["downloads", "files"], origin, path)?;
        let response = self.send(self.request(Method::GET, url), "downloads/files").await?;
        let response = Self::expect_success(response, "downloads/files").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("octoprint download read failed: {}", e.without_url()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait::async_trait]
impl HostServices for OctoPrintClient {
    async fn installed_plugins(&self) -> Result<Vec<String>> {
        let list: PluginList = self.get_json("plugin/pluginmanager/plugins").await?;
        Ok(list
            .plugins
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| p.key)
            .collect())
    }

    async fn settings(&self) -> Result<Value> {
        self.get_json("api/settings").await
    }

    async fn update_settings(&self, patch: Value) -> Result<()> {
        self.post_command("api/settings", patch).await
    }

    async fn set_default_profile(&self, profile_id: &str) -> Result<()> {
        let url = self.endpoint(["api", "printerprofiles", profile_id])?;
        let request = self
            .request(Method::PATCH, url)
            .json(&json!({"profile": {"default": true}}));
        let response = self.send(request, "api/printerprofiles").await?;
        Self::expect_success(response, "api/printerprofiles").await?;
        Ok(())
    }

    async fn system_commands(&self) -> Result<Vec<SystemCommand>> {
        let body: BTreeMap<String, Vec<SystemCommand>> = self.get_json("api/system/commands").await?;
        Ok(flatten_system_commands(body))
    }

    async fn run_system_command(&self, source: &str, action: &str) -> Result<()> {
        let url = self.endpoint(["api", "system", "commands", source, action])?;
        let response = self
            .send(self.request(Method::POST, url), "api/system/commands")
            .await?;
        Self::expect_success(response, "api/system/commands").await?;
        Ok(())
    }

    async fn custom_controls(&self) -> Result<Value> {
        let body: Value = self.get_json("api/printer/command/custom").await?;
        Ok(body.get("controls").cloned().unwrap_or_else(|| json!([])))
    }

    async fn plugin_api(&self, plugin: &str, payload: Value) -> Result<PluginReply> {
        let url = self.endpoint(["api", "plugin", plugin])?;
        let response = self
            .send(self.request(Method::POST, url).json(&payload), plugin)
            .await?;
        Ok(Self::plugin_reply(response).await)
    }

    async fn plugin_get(&self, path: &str) -> Result<PluginReply> {
        let url = self.endpoint(["plugin"].into_iter().chain(segments(path)))?;
        let response = self.send(self.request(Method::GET, url), path).await?;
        Ok(Self::plugin_reply(response).await)
    }

    async fn plugin_patch(&self, path: &str, body: Value) -> Result<PluginReply> {
        let url = self.endpoint(["plugin"].into_iter().chain(segments(path)))?;
        let response = self
            .send(self.request(Method::PATCH, url).json(&body), path)
            .await?;
        Ok(Self::plugin_reply(response).await)
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        // Relative URLs point at the server itself and carry the API key.
        let request = match Url::parse(url) {
            Ok(absolute) => self.client.get(absolute),
            Err(_) => {
                let joined = self
                    .base
                    .join(url.trim_start_matches('/'))
                    .map_err(|e| anyhow!("invalid url {:?}: {}", url, e))?;
                self.request(Method::GET, joined)
            }
        };
        let response = self.send(request.timeout(timeout), "fetch").await?;
        let response = Self::expect_success(response, "fetch").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("octoprint fetch read failed: {}", e.without_url()))?;
        Ok(bytes.to_vec())
    }
}
