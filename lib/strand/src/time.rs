use std::time::{Duration, Instant};

/// A fixed-period deadline driven off a monotonic clock. `fire` reports how
/// many whole periods elapsed since the last call, so a caller that was held
/// up past several deadlines still runs every tick it owes.
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    #[inline]
    pub fn new(period: Duration, now: Instant) -> Ticker {
        Ticker {
            period,
            next: now + period,
        }
    }

    /// Time left until the next deadline. Zero if the deadline has passed.
    #[inline]
    pub fn remaining(&self, now: Instant) -> Duration {
        if now >= self.next {
            Duration::from_secs(0)
        } else {
            self.next - now
        }
    }

    /// Number of periods elapsed since the last firing. Advances the deadline
    /// past `now`.
    #[inline]
    pub fn fire(&mut self, now: Instant) -> u32 {
        let mut count = 0;

        while now >= self.next {
            self.next += self.period;
            count += 1;
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_no_fire_before_deadline() {
        let now = Instant::now();
        let mut ticker = Ticker::new(Duration::from_millis(200), now);

        assert_eq!(ticker.fire(now + Duration::from_millis(100)), 0);
        assert_eq!(
            ticker.remaining(now + Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_ticker_fires_every_owed_period() {
        let now = Instant::now();
        let mut ticker = Ticker::new(Duration::from_millis(200), now);

        // Held up for three and a half periods
        assert_eq!(ticker.fire(now + Duration::from_millis(700)), 3);
        // Next deadline is at 800ms
        assert_eq!(
            ticker.remaining(now + Duration::from_millis(700)),
            Duration::from_millis(100)
        );
        assert_eq!(ticker.fire(now + Duration::from_millis(800)), 1);
    }

    #[test]
    fn test_ticker_remaining_zero_when_due() {
        let now = Instant::now();
        let ticker = Ticker::new(Duration::from_millis(500), now);

        assert_eq!(
            ticker.remaining(now + Duration::from_secs(2)),
            Duration::from_secs(0)
        );
    }
}
