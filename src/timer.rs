use std::time::{Duration, Instant};

/// A repeating deadline owned by whoever schedules background work.
///
/// Nothing runs on its own: the owner calls [`Interval::is_due`] from its
/// `poll`/`tick` path and does the work when it returns `true`. Dropping the
/// value cancels the schedule.
#[derive(Debug, Clone)]
pub struct Interval {
    period: Duration,
    next_due: Instant,
}

impl Interval {
    pub fn starting_at(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_due: now + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns `true` at most once per elapsed period. Missed periods are
    /// collapsed into a single firing.
    pub fn is_due(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due += self.period;
        if self.next_due <= now {
            self.next_due = now + self.period;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_period() {
        let start = Instant::now();
        let mut interval = Interval::starting_at(Duration::from_secs(2), start);

        assert!(!interval.is_due(start));
        assert!(!interval.is_due(start + Duration::from_millis(1_999)));
        assert!(interval.is_due(start + Duration::from_secs(2)));
        assert!(!interval.is_due(start + Duration::from_millis(2_500)));
        assert!(interval.is_due(start + Duration::from_secs(4)));
    }

    #[test]
    fn missed_periods_collapse() {
        let start = Instant::now();
        let mut interval = Interval::starting_at(Duration::from_secs(1), start);

        assert!(interval.is_due(start + Duration::from_secs(10)));
        assert!(!interval.is_due(start + Duration::from_millis(10_500)));
        assert!(interval.is_due(start + Duration::from_secs(11)));
    }
}
