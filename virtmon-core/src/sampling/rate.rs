//! Rates from two readings of a monotonic counter.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// Unit a counter delta is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateUnit {
    /// Bytes scaled to megabytes per second
    #[serde(rename = "MB/s")]
    MegabytesPerSec,
    /// Bytes scaled to megabits per second
    #[serde(rename = "Mb/s")]
    MegabitsPerSec,
    #[serde(rename = "ops/s")]
    OpsPerSec,
    #[serde(rename = "packets/s")]
    PacketsPerSec,
}

impl RateUnit {
    /// Factor applied to the raw delta.
    pub fn scale(&self) -> f64 {
        match self {
            Self::MegabytesPerSec => 1e-6,
            Self::MegabitsPerSec => 8.0 * 1e-6,
            Self::OpsPerSec | Self::PacketsPerSec => 1.0,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::MegabytesPerSec => "MB/s",
            Self::MegabitsPerSec => "Mb/s",
            Self::OpsPerSec => "ops/s",
            Self::PacketsPerSec => "packets/s",
        }
    }
}

impl FromStr for RateUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "MB/s" => Ok(Self::MegabytesPerSec),
            "Mb/s" => Ok(Self::MegabitsPerSec),
            "ops/s" => Ok(Self::OpsPerSec),
            "packets/s" => Ok(Self::PacketsPerSec),
            other => Err(format!("unknown rate unit: {}", other)),
        }
    }
}

/// Per-second rate between two counter readings taken `interval` apart.
///
/// A counter that went backwards (wraparound, domain restart) yields the
/// absolute delta rather than an error, so `rate(a, b) == rate(b, a)`.
pub fn rate(v1: u64, v2: u64, interval: Duration, unit: RateUnit) -> f64 {
    let delta = (v2 as i128 - v1 as i128).unsigned_abs() as f64;
    let scaled = delta * unit.scale();
    let secs = interval.as_secs_f64();
    if secs > 0.0 && secs != 1.0 {
        scaled / secs
    } else {
        scaled
    }
}

/// CPU utilisation in percent from two cumulative CPU times (nanoseconds).
pub fn cpu_utilization(t1: u64, t2: u64, interval: Duration, vcpus: u32) -> f64 {
    let wall = interval.as_nanos() as f64 * f64::from(vcpus.max(1));
    if wall == 0.0 {
        return 0.0;
    }
    let busy = (t2 as i128 - t1 as i128).unsigned_abs() as f64;
    busy / wall * 100.0
}

/// Takes two readings a fixed interval apart.
///
/// The wait is a suspension point: other domains keep being sampled while
/// this one sleeps.
#[derive(Debug, Clone, Copy)]
pub struct RateSampler {
    interval: Duration,
}

impl RateSampler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Read, wait the sampling interval, read again.
    ///
    /// Rates are computed against the nominal interval, not the measured one.
    pub async fn sample<T, F, Fut>(&self, read: F) -> Result<(T, T)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = read().await?;
        tokio::time::sleep(self.interval).await;
        let second = read().await?;
        Ok((first, second))
    }
}

impl Default for RateSampler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_interface_megabits() {
        let r = rate(1_000_000, 1_008_000, SECOND, RateUnit::MegabitsPerSec);
        assert!(close(r, 0.064), "got {}", r);
    }

    #[test]
    fn test_units() {
        assert!(close(rate(0, 2_000_000, SECOND, RateUnit::MegabytesPerSec), 2.0));
        assert!(close(rate(100, 220, SECOND, RateUnit::OpsPerSec), 120.0));
        assert!(close(rate(5, 15, SECOND, RateUnit::PacketsPerSec), 10.0));
    }

    #[test]
    fn test_divides_by_interval() {
        let r = rate(0, 600, Duration::from_secs(2), RateUnit::OpsPerSec);
        assert!(close(r, 300.0));
        // zero interval is treated as an undivided delta
        assert!(close(rate(0, 600, Duration::ZERO, RateUnit::OpsPerSec), 600.0));
    }

    #[test]
    fn test_wraparound_is_symmetric() {
        let pairs = [(0u64, 1u64), (1_008_000, 1_000_000), (u64::MAX, 0), (42, 42)];
        for unit in [
            RateUnit::MegabytesPerSec,
            RateUnit::MegabitsPerSec,
            RateUnit::OpsPerSec,
            RateUnit::PacketsPerSec,
        ] {
            for (a, b) in pairs {
                assert_eq!(rate(a, b, SECOND, unit), rate(b, a, SECOND, unit));
                assert!(rate(a, b, SECOND, unit) >= 0.0);
            }
        }
    }

    #[test]
    fn test_cpu_utilization() {
        // 1s of CPU time over 1s on 2 vCPUs = 50%
        let util = cpu_utilization(0, 1_000_000_000, SECOND, 2);
        assert!(close(util, 50.0));
        assert_eq!(cpu_utilization(0, 10, Duration::ZERO, 2), 0.0);
    }

    #[test]
    fn test_unit_parse() {
        for unit in [RateUnit::MegabytesPerSec, RateUnit::MegabitsPerSec, RateUnit::OpsPerSec] {
            assert_eq!(unit.symbol().parse::<RateUnit>().unwrap(), unit);
        }
        assert!("kB/s".parse::<RateUnit>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_waits_between_reads() {
        let sampler = RateSampler::new(Duration::from_secs(1));
        let counter = std::sync::atomic::AtomicU64::new(0);
        let reads = &counter;
        let started = tokio::time::Instant::now();

        let (first, second) = sampler
            .sample(move || async move {
                Ok(reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
            })
            .await
            .unwrap();

        assert_eq!((first, second), (0, 1));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
