//! Printer events to chat notifications.

pub mod context;
pub mod descriptors;
pub mod template;
pub mod throttle;

pub use context::{NotifyContext, FIELDS};
pub use descriptors::{event_descriptions, notification_keys, Descriptor, DescriptorTable};
pub use template::{Template, TemplateError};
pub use throttle::ZThrottle;

use crate::context::Shutdown;
use crate::sink::SendSink;
use crate::store::ChatStore;
use octogram_config::NotificationsConfig;
use octogram_ipc::{OutboundMessage, PrinterEvent};
use octogram_octoprint::{Capabilities, FileStorage, HostServices, PrinterControl};
use octogram_policy::{PolicyEngine, RateLimiter};
use octogram_telegram::Emoji;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct Notifier {
    config: NotificationsConfig,
    descriptors: DescriptorTable,
    printer: Arc<dyn PrinterControl>,
    files: Arc<dyn FileStorage>,
    host: Arc<dyn HostServices>,
    capabilities: Capabilities,
    store: Arc<ChatStore>,
    sink: Arc<SendSink>,
    emoji: Emoji,
    throttle: Mutex<ZThrottle>,
    limiter: Mutex<RateLimiter>,
    shutdown: Shutdown,
    z: Mutex<f64>,
}

impl Notifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NotificationsConfig,
        printer: Arc<dyn PrinterControl>,
        files: Arc<dyn FileStorage>,
        host: Arc<dyn HostServices>,
        capabilities: Capabilities,
        store: Arc<ChatStore>,
        sink: Arc<SendSink>,
        emoji: Emoji,
        shutdown: Shutdown,
    ) -> Self {
        let descriptors = DescriptorTable::new(&config.normalized_messages());
        let limiter = PolicyEngine::new(Some(&config)).rate_limiter();
        Self {
            config,
            descriptors,
            printer,
            files,
            host,
            capabilities,
            store,
            sink,
            emoji,
            throttle: Mutex::new(ZThrottle::new(Instant::now())),
            limiter: Mutex::new(limiter),
            shutdown,
            z: Mutex::new(0.0),
        }
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Last height the print head was seen at.
    pub async fn current_z(&self) -> f64 {
        *self.z.lock().await
    }

    pub async fn record_z(&self, z: f64) {
        *self.z.lock().await = z;
    }

    /// Handles one printer event and hands the notification to the sink.
    pub async fn on_event(&self, event: &PrinterEvent) {
        let Some(message) = self.prepare(event).await else {
            return;
        };
        if !self.limiter.lock().await.record() {
            error!("Too many notifications, stopping the bridge");
            self.sink.disable();
            self.shutdown.trigger();
            return;
        }
        self.sink.send(message).await;
    }

    /// Applies the per-event side effects and throttles, then renders the message.
    pub async fn prepare(&self, event: &PrinterEvent) -> Option<OutboundMessage> {
        if !self.descriptors.is_known(&event.name) {
            debug!("No notification for event {}", event.name);
            return None;
        }
        let mut delay = 0;

        match event.name.as_str() {
            "ZChange" => {
                let new_z = event.payload.get("new").and_then(Value::as_f64);
                let old_z = event.payload.get("old").and_then(Value::as_f64);
                let printing = match self.printer.printer().await {
                    Ok(snapshot) => snapshot.is_printing(),
                    Err(e) => {
                        debug!("Cannot read printer state for ZChange: {}", e);
                        false
                    }
                };
                if !printing {
                    return None;
                }
                let height = self.store.notification_height().await;
                let time = self.store.notification_time().await;
                let necessary = self.throttle.lock().await.is_notification_necessary(
                    new_z,
                    old_z,
                    height,
                    time,
                    Instant::now(),
                );
                if let Some(z) = new_z {
                    self.record_z(z).await;
                }
                if !necessary {
                    return None;
                }
                debug!(
                    "Z-Change. new_z={:?} old_z={:?} notification_height={} notification_time={}",
                    new_z, old_z, height, time
                );
            }
            "PrintStarted" => {
                self.store.clear_muted().await;
                self.throttle.lock().await.print_started(Instant::now());
            }
            "PrintDone" => {
                self.store.clear_muted().await;
                delay = self.config.message_at_print_done_delay;
            }
            "PrintFailed" => self.store.clear_muted().await,
            "plugin_pause_for_user_event_notify" => {
                if !self.throttle.lock().await.user_notification_necessary(Instant::now()) {
                    return None;
                }
            }
            _ => {}
        }

        Some(self.build(&event.name, &event.payload).await.with_delay(delay))
    }

    /// Status reply for a single chat, bypassing subscriptions.
    pub async fn notify_chat(&self, event: &str, chat_id: &str) -> Option<OutboundMessage> {
        if !self.descriptors.is_known(event) {
            return None;
        }
        Some(self.build(event, &Value::Null).await.with_chat(chat_id))
    }

    /// True while printing when the throttle would let a progress message out.
    pub async fn status_due(&self) -> bool {
        let printing = self
            .printer
            .printer()
            .await
            .map(|s| s.is_printing())
            .unwrap_or(false);
        if !printing {
            return false;
        }
        let z = self.current_z().await;
        let height = self.store.notification_height().await;
        let time = self.store.notification_time().await;
        self.throttle
            .lock()
            .await
            .is_notification_necessary(Some(z), Some(z), height, time, Instant::now())
    }

    /// Renders the event's template and attaches media per its descriptor.
    pub async fn build(&self, trigger: &str, payload: &Value) -> OutboundMessage {
        let Some((event, descriptor)) = self.descriptors.resolve(trigger) else {
            return OutboundMessage::new(format!("Unknown event {}", trigger));
        };
        if event != trigger {
            debug!("Event {} uses the notification of {}", trigger, event);
        }
        let text = self.render(event, descriptor, payload).await;

        let mut message = OutboundMessage::new(text)
            .with_event(event)
            .with_markup(descriptor.markup)
            .silent(descriptor.silent)
            .with_image(descriptor.image)
            .with_gif(self.store.send_gif().await && descriptor.gif, 5)
            .inline(false);
        if event == "PrintStarted" {
            message = message.with_thumbnail(self.thumbnail().await);
        }
        if let Some(movie) = payload.get("movie").and_then(Value::as_str) {
            message = message.with_movie(movie.into());
        }
        info!("Notification for {} prepared", trigger);
        message
    }

    async fn render(&self, event: &str, descriptor: &Descriptor, payload: &Value) -> String {
        let z = self.current_z().await;
        let result = match Template::parse(&descriptor.text) {
            Ok(template) => {
                let ctx = NotifyContext::new(
                    event,
                    payload,
                    z,
                    self.printer.as_ref(),
                    self.host.as_ref(),
                    &self.capabilities,
                    &self.config,
                );
                let values = ctx.values(&template.fields()).await;
                template.render(&values, descriptor.markup, self.emoji)
            }
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            warn!("Caught an exception while formatting the message for {}: {}", event, e);
            format!(
                "{} I was not able to format the Notification for the event '{}' properly.\nPlease open your bridge configuration and check message settings for the event '{}'.",
                self.emoji.get("attention"),
                event,
                event
            )
        })
    }

    async fn thumbnail(&self) -> Option<String> {
        let job = self.printer.job().await.ok()?;
        let path = job.file_path()?;
        match self.files.entry("local", path).await {
            Ok(entry) => entry.and_then(|e| e.thumbnail),
            Err(e) => {
                warn!("Exception on getting thumbnail: {}", e);
                None
            }
        }
    }
}
