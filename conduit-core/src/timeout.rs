//! Per-stream timeout configuration.

use std::time::{Duration, Instant};

/// Read/write timeouts plus an absolute hard deadline for a stream.
///
/// The effective deadline for an operation is `min(now + duration,
/// expiration)`; `expiration` defaults to "never".
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    read: Option<Duration>,
    write: Option<Duration>,
    expiration: Option<Instant>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { read: None, write: None, expiration: None }
    }
}

impl Timeouts {
    /// No timeouts at all: operations wait indefinitely.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Symmetric read/write timeout, no hard expiration.
    #[must_use]
    pub fn symmetric(dur: Duration) -> Self {
        Self { read: Some(dur), write: Some(dur), expiration: None }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_read(mut self, dur: Duration) -> Self {
        self.read = Some(dur);
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn with_write(mut self, dur: Duration) -> Self {
        self.write = Some(dur);
        self
    }

    /// Set the absolute expiration point.
    #[must_use]
    pub fn with_expiration(mut self, at: Instant) -> Self {
        self.expiration = Some(at);
        self
    }

    #[must_use]
    pub fn read_duration(&self) -> Option<Duration> {
        self.read
    }

    #[must_use]
    pub fn write_duration(&self) -> Option<Duration> {
        self.write
    }

    #[must_use]
    pub fn expiration(&self) -> Option<Instant> {
        self.expiration
    }

    /// Effective deadline for a read issued `now`, or `None` for "wait
    /// forever".
    #[must_use]
    pub fn read_deadline(&self, now: Instant) -> Option<Instant> {
        Self::combine(self.read.map(|d| now + d), self.expiration)
    }

    /// Effective deadline for a write issued `now`, or `None` for "wait
    /// forever".
    #[must_use]
    pub fn write_deadline(&self, now: Instant) -> Option<Instant> {
        Self::combine(self.write.map(|d| now + d), self.expiration)
    }

    fn combine(dur_deadline: Option<Instant>, expiration: Option<Instant>) -> Option<Instant> {
        match (dur_deadline, expiration) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_caps_duration_deadline() {
        let now = Instant::now();
        let t = Timeouts::none()
            .with_read(Duration::from_secs(60))
            .with_expiration(now + Duration::from_secs(5));
        let d = t.read_deadline(now).unwrap();
        assert!(d <= now + Duration::from_secs(5));
    }

    #[test]
    fn no_timeouts_means_wait_forever() {
        let t = Timeouts::none();
        assert!(t.read_deadline(Instant::now()).is_none());
    }
}
