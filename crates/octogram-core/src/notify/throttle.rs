//! Height and time throttling for progress notifications.

use std::time::{Duration, Instant};

const USER_NOTIFICATION_WINDOW: Duration = Duration::from_secs(30);

/// Tracks the last height and time a progress message went out.
#[derive(Debug, Clone)]
pub struct ZThrottle {
    last_z: f64,
    last_time: Instant,
}

impl ZThrottle {
    pub fn new(now: Instant) -> Self {
        Self {
            last_z: 0.0,
            last_time: now,
        }
    }

    pub fn print_started(&mut self, now: Instant) {
        self.last_z = 0.0;
        self.last_time = now;
    }

    pub fn last_z(&self) -> f64 {
        self.last_z
    }

    /// Decides whether a Z change (or the passage of time) warrants a message.
    ///
    /// Jumps of a full millimetre or more are travel moves (z-hop, purge);
    /// they move the reference height without notifying.
    pub fn is_notification_necessary(
        &mut self,
        new_z: Option<f64>,
        old_z: Option<f64>,
        height: f64,
        time_minutes: i64,
        now: Instant,
    ) -> bool {
        if time_minutes > 0 {
            let interval = Duration::from_secs(time_minutes as u64 * 60);
            if now.saturating_duration_since(self.last_time) >= interval {
                self.last_time = now;
                return true;
            }
        }

        if height <= 0.0 {
            return false;
        }
        let (Some(new_z), Some(old_z)) = (new_z, old_z) else {
            return false;
        };
        if new_z < 0.0 {
            return false;
        }
        if (new_z - old_z).abs() >= 1.0 {
            self.last_z = new_z;
            return false;
        }
        if new_z >= self.last_z + height || new_z < self.last_z {
            self.last_z = new_z;
            return true;
        }
        false
    }

    /// Pause-for-user events repeat while the printer waits; only one per window.
    pub fn user_notification_necessary(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_time) >= USER_NOTIFICATION_WINDOW {
            self.last_time = now;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifies_every_height_step() {
        let start = Instant::now();
        let mut throttle = ZThrottle::new(start);
        throttle.print_started(start);
        assert!(!throttle.is_notification_necessary(Some(0.2), Some(0.0), 5.0, 0, start));
        assert!(!throttle.is_notification_necessary(Some(4.8), Some(4.6), 5.0, 0, start));
        assert!(throttle.is_notification_necessary(Some(5.0), Some(4.8), 5.0, 0, start));
        assert_eq!(throttle.last_z(), 5.0);
        assert!(!throttle.is_notification_necessary(Some(5.2), Some(5.0), 5.0, 0, start));
    }

    #[test]
    fn travel_moves_shift_reference_silently() {
        let start = Instant::now();
        let mut throttle = ZThrottle::new(start);
        assert!(!throttle.is_notification_necessary(Some(12.0), Some(2.0), 5.0, 0, start));
        assert_eq!(throttle.last_z(), 12.0);
        assert!(!throttle.is_notification_necessary(Some(-1.0), Some(12.0), 5.0, 0, start));
        assert!(!throttle.is_notification_necessary(Some(1.0), None, 5.0, 0, start));
    }

    #[test]
    fn lower_z_means_a_new_object() {
        let start = Instant::now();
        let mut throttle = ZThrottle::new(start);
        assert!(throttle.is_notification_necessary(Some(5.0), Some(4.9), 5.0, 0, start));
        assert!(throttle.is_notification_necessary(Some(4.5), Some(5.0), 5.0, 0, start));
    }

    #[test]
    fn time_interval_fires_without_height() {
        let start = Instant::now();
        let mut throttle = ZThrottle::new(start);
        let later = start + Duration::from_secs(15 * 60);
        assert!(!throttle.is_notification_necessary(Some(0.4), Some(0.2), 0.0, 15, start));
        assert!(throttle.is_notification_necessary(Some(0.4), Some(0.2), 0.0, 15, later));
        assert!(!throttle.is_notification_necessary(Some(0.6), Some(0.4), 0.0, 15, later));
    }

    #[test]
    fn user_notifications_once_per_window() {
        let start = Instant::now();
        let mut throttle = ZThrottle::new(start);
        let first = start + USER_NOTIFICATION_WINDOW;
        assert!(!throttle.user_notification_necessary(start));
        assert!(throttle.user_notification_necessary(first));
        assert!(!throttle.user_notification_necessary(first + Duration::from_secs(5)));
    }
}
