use std::time::Duration;

/// One progress sample for a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: u64,
    /// Bytes per second since the attempt started.
    pub speed: u64,
}

/// Computes percent and average speed.
///
/// A `total_size` of 0 means the length is unknown; the denominator floors
/// to 1 so the figure is relative to bytes seen rather than a real
/// percentage. Elapsed time below one second also floors to 1.
pub fn measure(bytes_downloaded: u64, total_size: u64, elapsed: Duration) -> Progress {
    let percent = bytes_downloaded.saturating_mul(100) / total_size.max(1);
    let speed = (bytes_downloaded as f64 / elapsed.as_secs_f64().max(1.0)) as u64;
    Progress { percent, speed }
}
