//! Octogram Policy Engine
//!
//! Command authorization and notification rate limiting

use octogram_config::{is_group_chat, ChatRecord, NotificationsConfig};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const RATE_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_SENDS_PER_MINUTE: u32 = 10;

#[derive(Clone)]
pub struct PolicyEngine {
    rate_limit: Option<u32>,
}

impl PolicyEngine {
    pub fn new(config: Option<&NotificationsConfig>) -> Self {
        let rate_limit = config
            .map(|c| c.rate_limit_per_minute)
            .or(Some(DEFAULT_SENDS_PER_MINUTE));
        Self { rate_limit }
    }

    /// Decides whether `command` may run for a message in `chat_id`.
    ///
    /// `chat` is the record of the conversation, `sender` the private record of the
    /// user who wrote the message (same as `chat` in private chats).
    pub fn is_command_allowed(
        &self,
        chat_id: &str,
        chat: Option<&ChatRecord>,
        sender: Option<&ChatRecord>,
        command: &str,
        bind_none: bool,
    ) -> bool {
        if command.is_empty() {
            return false;
        }
        if bind_none {
            return true;
        }

        let Some(chat) = chat else {
            return false;
        };
        if chat.accept_commands && chat.command_enabled(command) {
            return true;
        }

        if is_group_chat(chat_id) && chat.allow_users {
            if let Some(sender) = sender {
                return sender.accept_commands && sender.command_enabled(command);
            }
        }

        false
    }

    pub fn check_rate_limit(&self, count: u32) -> bool {
        self.rate_limit.is_none_or(|limit| count <= limit)
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.clone())
    }
}

/// Sliding one-minute window over notification sends.
pub struct RateLimiter {
    policy: PolicyEngine,
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(policy: PolicyEngine) -> Self {
        Self {
            policy,
            sent: VecDeque::new(),
        }
    }

    /// Records one send and returns false once the window holds more than the limit.
    pub fn record(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.sent.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        self.sent.push_back(now);
        let allowed = self.policy.check_rate_limit(self.sent.len() as u32);
        if !allowed {
            tracing::error!(
                "Notification rate limit exceeded: {} sends in the last minute",
                self.sent.len()
            );
        }
        allowed
    }

    pub fn in_window(&self) -> usize {
        self.sent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(accept: bool, allow_users: bool, command: Option<&str>) -> ChatRecord {
        let mut record = ChatRecord::new(&["/status", "/print"], &[]);
        record.accept_commands = accept;
        record.allow_users = allow_users;
        if let Some(command) = command {
            record.commands.insert(command.to_string(), true);
        }
        record
    }

    #[test]
    fn bind_none_commands_always_pass() {
        let policy = PolicyEngine::new(None);
        assert!(policy.is_command_allowed("42", None, None, "/help", true));
    }

    #[test]
    fn private_chat_needs_accept_and_command_flag() {
        let policy = PolicyEngine::new(None);
        let granted = chat(true, false, Some("/status"));
        assert!(policy.is_command_allowed("42", Some(&granted), Some(&granted), "/status", false));
        assert!(!policy.is_command_allowed("42", Some(&granted), Some(&granted), "/print", false));

        let disabled = chat(false, false, Some("/status"));
        assert!(!policy.is_command_allowed("42", Some(&disabled), Some(&disabled), "/status", false));
    }

    #[test]
    fn denied_everywhere_when_nothing_accepted() {
        let policy = PolicyEngine::new(None);
        let record = chat(false, false, Some("/print"));
        for command in ["/status", "/print", "/files"] {
            assert!(!policy.is_command_allowed("-100", Some(&record), Some(&record), command, false));
        }
    }

    #[test]
    fn group_falls_back_to_sender_rights_when_allowed() {
        let policy = PolicyEngine::new(None);
        let group = chat(false, true, None);
        let member = chat(true, false, Some("/print"));
        assert!(policy.is_command_allowed("-100", Some(&group), Some(&member), "/print", false));
        assert!(!policy.is_command_allowed("-100", Some(&group), Some(&member), "/status", false));
        assert!(!policy.is_command_allowed("-100", Some(&group), None, "/print", false));

        let closed_group = chat(false, false, None);
        assert!(!policy.is_command_allowed("-100", Some(&closed_group), Some(&member), "/print", false));
    }

    #[test]
    fn unknown_chat_is_denied() {
        let policy = PolicyEngine::new(None);
        assert!(!policy.is_command_allowed("42", None, None, "/status", false));
        assert!(!policy.is_command_allowed("42", None, None, "", true));
    }

    #[test]
    fn limiter_trips_above_cap_and_recovers_after_window() {
        let mut config = NotificationsConfig::default();
        config.rate_limit_per_minute = 3;
        let mut limiter = PolicyEngine::new(Some(&config)).rate_limiter();
        let start = Instant::now();
        assert!(limiter.record_at(start));
        assert!(limiter.record_at(start + Duration::from_secs(1)));
        assert!(limiter.record_at(start + Duration::from_secs(2)));
        assert!(!limiter.record_at(start + Duration::from_secs(3)));

        let later = start + Duration::from_secs(62);
        assert!(limiter.record_at(later));
        assert_eq!(limiter.in_window(), 2);
    }
}
