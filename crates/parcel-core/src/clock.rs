//! Last-activity clock the leader consults while its parcel is open.

use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

/// Time of the most recent admission, behind its own lock.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) -> Instant {
        let now = Instant::now();
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = now;
        now
    }

    pub(crate) fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_tracks_latest_touch() {
        let clock = ActivityClock::new();
        let first = clock.touch();
        tokio::time::advance(Duration::from_millis(30)).await;
        let second = clock.touch();
        assert_eq!(second - first, Duration::from_millis(30));
        assert_eq!(clock.last(), second);
    }
}
