use std::fmt;
use std::time::Duration;

/// Bytes moved over a wall-clock interval, printed as a human rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    bytes: u64,
    elapsed: Duration,
}

impl Throughput {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// `None` when no measurable time has passed
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.bytes as f64 / secs)
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];

        let Some(mut rate) = self.bytes_per_sec() else {
            return write!(f, "n/a");
        };
        let mut unit = 0;
        while rate >= 1024.0 && unit < UNITS.len() - 1 {
            rate /= 1024.0;
            unit += 1;
        }
        write!(f, "{rate:.2} {}", UNITS[unit])
    }
}
