use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle record of one file moving in one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: Uuid,
    pub direction: Direction,
    pub peer_id: String,
    pub name: String,
    pub size: u64,
    pub status: TransferStatus,
    /// 0.0 ..= 1.0
    pub progress: f64,
    pub speed_bps: f64,
}

impl Transfer {
    pub fn new(id: Uuid, direction: Direction, peer_id: &str, name: &str, size: u64) -> Self {
        Self {
            id,
            direction,
            peer_id: peer_id.to_string(),
            name: name.to_string(),
            size,
            status: TransferStatus::Queued,
            progress: 0.0,
            speed_bps: 0.0,
        }
    }

    pub fn record_progress(&mut self, bytes: u64, elapsed: Duration) {
        self.progress = fraction(bytes, self.size);
        self.speed_bps = throughput(bytes, elapsed);
    }
}

/// A send waiting for its peer's channel to open.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub path: PathBuf,
    pub transfer_id: Uuid,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Any status, progress or speed change.
    Updated(Transfer),
    /// A received file has been handed to the delivery collaborator.
    Delivered { transfer: Transfer, path: PathBuf },
}

pub fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

/// Bytes per second; zero until measurable time has passed.
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Queued.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
    }

    #[test]
    fn progress_and_speed() {
        let mut t = Transfer::new(Uuid::new_v4(), Direction::Send, "p", "f", 400);
        t.record_progress(100, Duration::from_secs(2));
        assert_eq!(t.progress, 0.25);
        assert_eq!(t.speed_bps, 50.0);

        assert_eq!(fraction(0, 0), 1.0);
        assert_eq!(throughput(10, Duration::ZERO), 0.0);
    }
}
