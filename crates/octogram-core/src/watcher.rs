//! Printer event feed.
//!
//! The bridge runs outside OctoPrint, so lifecycle events are synthesised
//! from successive `/api/printer` and `/api/job` polls, and the host's serial
//! hooks from lines appended to `serial.log`. Everything is published on the
//! [`EventBus`]; [`pump`] hands it to the notifier.

use crate::context::Shutdown;
use crate::notify::Notifier;
use anyhow::Result;
use octogram_config::WatcherConfig;
use octogram_ipc::{EventBus, HostSignal, PrinterEvent};
use octogram_octoprint::{JobSnapshot, PrinterControl, PrinterSnapshot};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What one poll saw of the printer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub connected: bool,
    pub printing: bool,
    pub paused: bool,
    pub error: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub origin: Option<String>,
    pub user: Option<String>,
    pub completion: Option<f64>,
    pub print_time: Option<f64>,
}

impl Observation {
    pub fn new(printer: &PrinterSnapshot, job: Option<&JobSnapshot>) -> Self {
        let flags = &printer.state.flags;
        let error = if flags.error {
            Some(printer.state.text.clone())
        } else {
            None
        };
        let mut observation = Self {
            connected: flags.operational || flags.printing || printer.is_paused(),
            printing: flags.printing,
            paused: printer.is_paused(),
            error,
            ..Self::default()
        };
        if let Some(job) = job {
            observation.file_name = job.job.file.name.clone();
            observation.file_path = job.job.file.path.clone();
            observation.origin = job.job.file.origin.clone();
            observation.user = job.job.user.clone();
            observation.completion = job.progress.completion;
            observation.print_time = job.progress.print_time;
        }
        observation
    }

    fn active(&self) -> bool {
        self.printing || self.paused
    }

    fn file_payload(&self) -> Value {
        json!({
            "name": self.file_name,
            "path": self.file_path,
            "origin": self.origin,
            "user": self.user,
        })
    }
}

fn with_file(event: &str, observation: &Observation) -> PrinterEvent {
    PrinterEvent::new(event).with_payload(observation.file_payload())
}

/// Events implied by going from `before` to `after`, in the order OctoPrint fires them.
pub fn transitions(before: &Observation, after: &Observation) -> Vec<PrinterEvent> {
    let mut events = Vec::new();

    if !before.connected && after.connected {
        events.push(PrinterEvent::new("Connected"));
    }
    if after.error.is_some() && after.error != before.error {
        let text = after.error.clone().unwrap_or_default();
        events.push(PrinterEvent::new("Error").with_payload(json!({"error": text})));
    }

    match (before.active(), after.active()) {
        (false, true) => events.push(with_file("PrintStarted", after)),
        (true, true) if before.printing && after.paused => events.push(with_file("PrintPaused", after)),
        (true, true) if before.paused && after.printing => events.push(with_file("PrintResumed", after)),
        (true, false) => {
            let finished = after.connected && after.error.is_none() && after.completion.unwrap_or(0.0) >= 100.0;
            if finished {
                let mut payload = before.file_payload();
                payload["time"] = json!(after.print_time.or(before.print_time));
                events.push(PrinterEvent::new("PrintDone").with_payload(payload));
            } else {
                let mut payload = before.file_payload();
                payload["reason"] = json!(if after.error.is_some() || !after.connected {
                    "error"
                } else {
                    "cancelled"
                });
                events.push(PrinterEvent::new("PrintFailed").with_payload(payload));
            }
        }
        _ => {}
    }

    if before.connected && !after.connected {
        events.push(PrinterEvent::new("Disconnected"));
    }
    events
}

/// Follows a growing log file from its end; survives truncation and rotation.
pub struct SerialTail {
    path: PathBuf,
    position: Option<u64>,
}

impl SerialTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: None,
        }
    }

    /// Complete lines appended since the last call. The first call only
    /// remembers where the file ends.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let Some(position) = self.position else {
            self.position = Some(len);
            return Ok(Vec::new());
        };
        let start = if len < position {
            debug!("{} shrank, reading from the start", self.path.display());
            0
        } else {
            position
        };
        file.seek(SeekFrom::Start(start))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let complete = buffer.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
        self.position = Some(start + complete as u64);
        Ok(String::from_utf8_lossy(&buffer[..complete])
            .lines()
            .map(str::to_string)
            .collect())
    }
}

/// Splits a `serial.log` line into the signal it records.
pub fn serial_signal(line: &str) -> Option<HostSignal> {
    if let Some((_, received)) = line.split_once("Recv: ") {
        return Some(HostSignal::SerialReceived(received.trim_end().to_string()));
    }
    if let Some((_, sent)) = line.split_once("Send: ") {
        return Some(HostSignal::GcodeSent(sent.trim_end().to_string()));
    }
    None
}

/// Strips the line number, checksum and comment of a sent G-code line.
fn bare_gcode(line: &str) -> &str {
    let line = line.split(';').next().unwrap_or_default();
    let line = line.split('*').next().unwrap_or_default().trim();
    match line.split_once(' ') {
        Some((first, rest)) if first.starts_with('N') && first[1..].chars().all(|c| c.is_ascii_digit()) => rest.trim(),
        _ => line,
    }
}

/// The host's serial hooks: pause-for-user prompts, user notifications,
/// filament change requests and Z moves.
#[derive(Debug, Default)]
pub struct SerialHooks {
    triggered: bool,
    z: Option<f64>,
}

impl SerialHooks {
    pub fn received(&mut self, line: &str) -> Option<PrinterEvent> {
        if line.contains("echo:busy: paused for user") || line.contains("//action:paused") {
            if self.triggered {
                return None;
            }
            self.triggered = true;
            return Some(PrinterEvent::new("plugin_pause_for_user_event_notify"));
        }
        self.triggered = false;
        let (_, text) = line.split_once("echo:UserNotif")?;
        Some(PrinterEvent::new("UserNotif").with_payload(json!({"UserNotif": text.trim()})))
    }

    pub fn sent(&mut self, line: &str) -> Option<PrinterEvent> {
        let gcode = bare_gcode(line);
        let mut words = gcode.split_whitespace();
        let command = words.next()?.to_uppercase();
        if command == "M600" {
            info!("M600 registered");
            return Some(PrinterEvent::new("gCode_M600"));
        }
        if command != "G0" && command != "G1" {
            return None;
        }
        let z = words
            .find_map(|word| word.strip_prefix('Z').or_else(|| word.strip_prefix('z')))
            .and_then(|value| value.parse::<f64>().ok())?;
        let old = self.z.replace(z);
        if old == Some(z) {
            return None;
        }
        Some(PrinterEvent::new("ZChange").with_payload(json!({"new": z, "old": old})))
    }

    /// Routes a serial signal; printer events pass through untouched.
    pub fn translate(&mut self, signal: HostSignal) -> Option<PrinterEvent> {
        match signal {
            HostSignal::Event(event) => Some(event),
            HostSignal::SerialReceived(line) => self.received(&line),
            HostSignal::GcodeSent(line) => self.sent(&line),
        }
    }
}

pub struct Watcher {
    printer: Arc<dyn PrinterControl>,
    bus: EventBus,
    interval: Duration,
    serial: Option<SerialTail>,
    last: Option<Observation>,
}

impl Watcher {
    pub fn new(printer: Arc<dyn PrinterControl>, bus: EventBus, config: &WatcherConfig) -> Self {
        Self {
            printer,
            bus,
            interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            serial: config.serial_log.as_ref().map(SerialTail::new),
            last: None,
        }
    }

    async fn observe(&self) -> Observation {
        let snapshot = match self.printer.printer().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("Printer state unavailable: {:#}", e);
                PrinterSnapshot::offline()
            }
        };
        let job = if snapshot.is_operational() || snapshot.is_printing() || snapshot.is_paused() {
            match self.printer.job().await {
                Ok(job) => Some(job),
                Err(e) => {
                    debug!("Job state unavailable: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        Observation::new(&snapshot, job.as_ref())
    }

    /// One poll: publishes transitions, serial lines and, without a serial
    /// log, a height-less `ZChange` while printing so that time based
    /// progress messages still go out. Returns what was published.
    pub async fn tick(&mut self) -> Vec<HostSignal> {
        let mut signals = Vec::new();
        let now = self.observe().await;
        if let Some(before) = &self.last {
            signals.extend(transitions(before, &now).into_iter().map(HostSignal::Event));
        }

        match &mut self.serial {
            Some(tail) => match tail.read_new_lines() {
                Ok(lines) => signals.extend(lines.iter().filter_map(|line| serial_signal(line))),
                Err(e) => debug!("Serial log unavailable: {}", e),
            },
            None if now.printing => {
                signals.push(HostSignal::Event(
                    PrinterEvent::new("ZChange").with_payload(json!({"new": null, "old": null})),
                ));
            }
            None => {}
        }
        self.last = Some(now);

        for signal in &signals {
            if let Err(e) = self.bus.publish(signal.clone()) {
                debug!("Nobody listens for host signals: {}", e);
            }
        }
        signals
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        info!("Watching the printer every {}s", self.interval.as_secs());
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("Printer watcher stopped");
    }
}

/// Feeds host signals to the notifier, one task per event.
pub async fn pump(notifier: Arc<Notifier>, mut signals: broadcast::Receiver<HostSignal>, shutdown: Shutdown) {
    let mut hooks = SerialHooks::default();
    loop {
        tokio::select! {
            received = signals.recv() => match received {
                Ok(signal) => {
                    if let Some(event) = hooks.translate(signal) {
                        debug!("Host event {} ({})", event.name, event.trace_id);
                        let notifier = Arc::clone(&notifier);
                        tokio::spawn(async move { notifier.on_event(&event).await });
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event bus closed, stopping the event pump");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event bus lagged by {} signals", n);
                }
            },
            _ = shutdown.wait() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Harness;
    use octogram_octoprint::{JobFile, JobInfo, JobProgress};
    use std::io::Write;

    fn names(events: &[PrinterEvent]) -> Vec<&str> {
        events.iter().map(|e| e.name.as_str()).collect()
    }

    fn idle() -> Observation {
        Observation {
            connected: true,
            ..Observation::default()
        }
    }

    fn printing() -> Observation {
        Observation {
            connected: true,
            printing: true,
            file_name: Some("cube.gcode".to_string()),
            file_path: Some("cube.gcode".to_string()),
            origin: Some("local".to_string()),
            completion: Some(42.0),
            ..Observation::default()
        }
    }

    #[test]
    fn print_lifecycle_transitions() {
        let offline = Observation::default();
        assert_eq!(names(&transitions(&offline, &idle())), vec!["Connected"]);

        let started = transitions(&idle(), &printing());
        assert_eq!(names(&started), vec!["PrintStarted"]);
        assert_eq!(started[0].payload_str("name"), Some("cube.gcode"));

        let paused = Observation {
            printing: false,
            paused: true,
            ..printing()
        };
        assert_eq!(names(&transitions(&printing(), &paused)), vec!["PrintPaused"]);
        assert_eq!(names(&transitions(&paused, &printing())), vec!["PrintResumed"]);

        let done = Observation {
            completion: Some(100.0),
            print_time: Some(3600.0),
            ..idle()
        };
        let finished = transitions(&printing(), &done);
        assert_eq!(names(&finished), vec!["PrintDone"]);
        assert_eq!(finished[0].payload["time"], json!(3600.0));

        let cancelled = transitions(&printing(), &idle());
        assert_eq!(names(&cancelled), vec!["PrintFailed"]);
        assert_eq!(cancelled[0].payload_str("reason"), Some("cancelled"));
    }

    #[test]
    fn losing_the_printer_mid_print_fails_the_print() {
        let broken = Observation {
            error: Some("Error: Thermal Runaway".to_string()),
            ..Observation::default()
        };
        assert_eq!(
            names(&transitions(&printing(), &broken)),
            vec!["Error", "PrintFailed", "Disconnected"]
        );
        assert!(transitions(&broken, &broken).is_empty());
    }

    #[test]
    fn pause_prompts_fire_once_until_other_output() {
        let mut hooks = SerialHooks::default();
        assert_eq!(
            hooks.received("echo:busy: paused for user").map(|e| e.name),
            Some("plugin_pause_for_user_event_notify".to_string())
        );
        assert!(hooks.received("//action:paused").is_none());
        assert!(hooks.received("ok").is_none());
        assert!(hooks.received("echo:busy: paused for user").is_some());

        let notif = hooks.received("echo:UserNotif Remove the brim").expect("event");
        assert_eq!(notif.payload_str("UserNotif"), Some("Remove the brim"));
    }

    #[test]
    fn sent_gcode_is_reduced_to_events() {
        let mut hooks = SerialHooks::default();
        assert_eq!(hooks.sent("N12 M600*45").map(|e| e.name), Some("gCode_M600".to_string()));
        let first = hooks.sent("N13 G1 Z0.2 F3000*12").expect("z");
        assert_eq!(first.payload["new"], json!(0.2));
        assert_eq!(first.payload["old"], Value::Null);
        assert!(hooks.sent("G1 X10 Y10 Z0.2").is_none());
        let second = hooks.sent("G0 Z0.4 ; next layer").expect("z");
        assert_eq!(second.payload["old"], json!(0.2));
        assert!(hooks.sent("M104 S200").is_none());
    }

    #[test]
    fn serial_log_lines_are_split() {
        assert!(matches!(
            serial_signal("2024-05-01 10:00:00,000 - Recv: echo:busy: paused for user"),
            Some(HostSignal::SerialReceived(line)) if line == "echo:busy: paused for user"
        ));
        assert!(matches!(
            serial_signal("2024-05-01 10:00:00,000 - Send: N5 M600*20"),
            Some(HostSignal::GcodeSent(line)) if line == "N5 M600*20"
        ));
        assert!(serial_signal("2024-05-01 10:00:00,000 - Changing monitoring state").is_none());
    }

    #[test]
    fn tail_reads_only_appended_complete_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("serial.log");
        std::fs::write(&path, "old line\n").expect("write");
        let mut tail = SerialTail::new(&path);
        assert!(tail.read_new_lines().expect("first").is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"Recv: ok\nRecv: par").expect("append");
        assert_eq!(tail.read_new_lines().expect("second"), vec!["Recv: ok"]);
        file.write_all(b"tial\n").expect("append");
        assert_eq!(tail.read_new_lines().expect("third"), vec!["Recv: partial"]);

        std::fs::write(&path, "Send: G28\n").expect("rotate");
        assert_eq!(tail.read_new_lines().expect("rotated"), vec!["Send: G28"]);
    }

    #[tokio::test]
    async fn watcher_publishes_transitions_after_a_baseline() {
        let h = Harness::new().await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut watcher = Watcher::new(h.ctx.printer.clone(), bus, &WatcherConfig::default());

        h.printer.set_operational(true);
        assert!(watcher.tick().await.is_empty());

        h.printer.set_printing(true);
        h.printer.set_job(JobSnapshot {
            job: JobInfo {
                file: JobFile {
                    name: Some("cube.gcode".to_string()),
                    path: Some("cube.gcode".to_string()),
                    origin: Some("local".to_string()),
                    size: None,
                },
                ..JobInfo::default()
            },
            progress: JobProgress {
                completion: Some(3.0),
                ..JobProgress::default()
            },
            state: "Printing".to_string(),
        });
        let signals = watcher.tick().await;
        assert!(matches!(&signals[0], HostSignal::Event(e) if e.name == "PrintStarted"));
        assert!(matches!(&signals[1], HostSignal::Event(e) if e.name == "ZChange"));
        assert!(matches!(rx.recv().await, Ok(HostSignal::Event(e)) if e.name == "PrintStarted"));
    }
}
