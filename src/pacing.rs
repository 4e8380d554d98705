use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn unpaced() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn wait(&self) -> Duration {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let waited = match *last {
            Some(previous) if !self.interval.is_zero() => {
                let elapsed = previous.elapsed();
                if elapsed < self.interval {
                    let remaining = self.interval - elapsed;
                    thread::sleep(remaining);
                    remaining
                } else {
                    Duration::ZERO
                }
            }
            _ => Duration::ZERO,
        };
        *last = Some(Instant::now());
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_never_waits() {
        let pacer = Pacer::new(Duration::from_millis(50));
        assert_eq!(pacer.wait(), Duration::ZERO);
    }

    #[test]
    fn second_call_waits_for_interval() {
        let pacer = Pacer::new(Duration::from_millis(30));
        pacer.wait();
        let start = Instant::now();
        pacer.wait();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn unpaced_is_free() {
        let pacer = Pacer::unpaced();
        pacer.wait();
        assert_eq!(pacer.wait(), Duration::ZERO);
    }
}
