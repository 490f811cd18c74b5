//! Hourly allocation rotation
//!
//! A fresh allocation sized to the hourly budget is created at every
//! wall-clock hour boundary. This runs independently of the rolling budget
//! check in the monitor.

use chrono::{DateTime, DurationRound, Utc};
use requestor_core::{Allocation, RequestorResult, Session};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn hour_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::hours(1)).unwrap_or(at)
}

#[derive(Default)]
struct Rotation {
    current: Option<(DateTime<Utc>, Allocation)>,
    created: Vec<Allocation>,
}

pub struct AllocationRotator {
    session: Session,
    amount: Decimal,
    platform: String,
    rotation: Mutex<Rotation>,
}

impl AllocationRotator {
    pub fn new(session: Session, amount: Decimal, platform: impl Into<String>) -> Self {
        Self {
            session,
            amount,
            platform: platform.into(),
            rotation: Mutex::new(Rotation::default()),
        }
    }

    /// Allocation of the current hour, created on first use.
    pub async fn current(&self) -> RequestorResult<Allocation> {
        self.current_at(Utc::now()).await
    }

    /// Allocation of the hour containing `now`.
    pub async fn current_at(&self, now: DateTime<Utc>) -> RequestorResult<Allocation> {
        let hour = hour_start(now);
        let mut rotation = self.rotation.lock().await;
        if let Some((started, allocation)) = &rotation.current {
            if *started == hour && allocation.is_active() {
                return Ok(allocation.clone());
            }
        }
        self.open(&mut rotation, hour).await
    }

    /// Replace the current allocation regardless of the hour.
    pub async fn rotate_now(&self) -> RequestorResult<Allocation> {
        let mut rotation = self.rotation.lock().await;
        self.open(&mut rotation, hour_start(Utc::now())).await
    }

    async fn open(&self, rotation: &mut Rotation, hour: DateTime<Utc>) -> RequestorResult<Allocation> {
        let allocation = Allocation::create(&self.session, self.amount, &self.platform, None).await?;
        info!(allocation_id = %allocation.id(), %hour, amount = %self.amount, "Allocation rotated");
        rotation.current = Some((hour, allocation.clone()));
        rotation.created.push(allocation.clone());
        Ok(allocation)
    }

    /// Every allocation created so far, oldest first
    pub async fn allocations(&self) -> Vec<Allocation> {
        self.rotation.lock().await.created.clone()
    }

    /// Release every allocation still active.
    pub async fn release_all(&self) {
        let rotation = self.rotation.lock().await;
        for allocation in rotation.created.iter().filter(|a| a.is_active()) {
            if let Err(e) = allocation.release().await {
                warn!(allocation_id = %allocation.id(), error = %e, "Failed to release allocation");
            }
        }
    }

    /// Rotate at each hour boundary until the session closes.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let rotator = self.clone();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = hour_start(now) + chrono::Duration::hours(1);
                let wait = (next - now).to_std().unwrap_or_default();
                debug!(?wait, "Next allocation rotation");
                tokio::time::sleep(wait).await;

                if rotator.session.is_closed() {
                    break;
                }
                if let Err(e) = rotator.current_at(next).await {
                    warn!(error = %e, "Allocation rotation failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use requestor_core::{MockDaemon, SessionConfig};

    fn rotator() -> (Arc<MockDaemon>, AllocationRotator) {
        let mock = Arc::new(MockDaemon::new());
        let session = Session::new(mock.clone(), SessionConfig::default());
        (mock, AllocationRotator::new(session, Decimal::TWO, "erc20-holesky-tglm"))
    }

    #[test]
    fn test_hour_start() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 37, 12).unwrap();
        assert_eq!(hour_start(at), Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_one_allocation_per_hour() {
        let (mock, rotator) = rotator();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 14, 5, 0).unwrap();

        let first = rotator.current_at(t0).await.unwrap();
        let same = rotator.current_at(t0 + chrono::Duration::minutes(50)).await.unwrap();
        assert_eq!(first.id(), same.id());

        let next = rotator.current_at(t0 + chrono::Duration::minutes(56)).await.unwrap();
        assert_ne!(first.id(), next.id());
        assert_eq!(rotator.allocations().await.len(), 2);
        assert_eq!(mock.allocations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_release_all() {
        let (_, rotator) = rotator();
        let first = rotator.current().await.unwrap();
        let second = rotator.rotate_now().await.unwrap();
        rotator.release_all().await;
        assert!(!first.is_active());
        assert!(!second.is_active());
    }
}
