use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Rolling throughput estimate over a sliding one-second window. Bytes are
/// recorded as BODY/ARTICLE payloads arrive; readers see megabits/second.
#[derive(Debug, Clone, Default)]
pub struct SpeedMeter {
    samples: Arc<Mutex<VecDeque<(Instant, u64)>>>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64) {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        samples.push_back((now, bytes));
        Self::expire(&mut samples, now);
    }

    pub fn mbps(&self) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        Self::expire(&mut samples, Instant::now());
        let bytes: u64 = samples.iter().map(|(_, b)| b).sum();
        (bytes as f64 * 8.0) / 1_000_000.0
    }

    fn expire(samples: &mut VecDeque<(Instant, u64)>, now: Instant) {
        while let Some((t, _)) = samples.front() {
            if now.duration_since(*t) > WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
