//! Cost per result of each activity

use chrono::{DateTime, Duration, Utc};
use requestor_types::ResourceId;
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityCost {
    pub started_at: DateTime<Utc>,
    /// Sum accepted through debit notes
    pub accepted: Decimal,
    pub results: u64,
    /// Set once the activity was found too expensive
    pub flagged: bool,
}

impl ActivityCost {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            accepted: Decimal::ZERO,
            results: 0,
            flagged: false,
        }
    }

    /// Accepted amount per result; an activity without results counts as one.
    pub fn cost_per_result(&self) -> Decimal {
        self.accepted / Decimal::from(self.results.max(1))
    }
}

/// Tracks activities against a maximum price per result. An activity is only
/// judged once its warm-up has passed.
#[derive(Debug, Clone)]
pub struct CostTracker {
    warmup: Duration,
    max_price: Option<Decimal>,
    activities: HashMap<ResourceId, ActivityCost>,
}

impl CostTracker {
    pub fn new(warmup: Duration, max_price: Option<Decimal>) -> Self {
        Self {
            warmup,
            max_price,
            activities: HashMap::new(),
        }
    }

    /// Start the warm-up of `activity` at `at`. Later calls keep the first time.
    pub fn start(&mut self, activity: &ResourceId, at: DateTime<Utc>) {
        self.activities
            .entry(activity.clone())
            .or_insert_with(|| ActivityCost::new(at));
    }

    pub fn add_results(&mut self, activity: &ResourceId, count: u64, at: DateTime<Utc>) {
        self.activities
            .entry(activity.clone())
            .or_insert_with(|| ActivityCost::new(at))
            .results += count;
    }

    /// Count a newly accepted amount. Returns the cost per result when this
    /// payment makes the activity too expensive; an activity is flagged once.
    pub fn add_payment(&mut self, activity: &ResourceId, amount: Decimal, at: DateTime<Utc>) -> Option<Decimal> {
        let cost = self
            .activities
            .entry(activity.clone())
            .or_insert_with(|| ActivityCost::new(at));
        cost.accepted += amount;

        let max_price = self.max_price?;
        if cost.flagged || at - cost.started_at < self.warmup {
            return None;
        }
        let ratio = cost.cost_per_result();
        if ratio > max_price {
            cost.flagged = true;
            return Some(ratio);
        }
        None
    }

    pub fn get(&self, activity: &ResourceId) -> Option<ActivityCost> {
        self.activities.get(activity).copied()
    }

    pub fn total_accepted(&self) -> Decimal {
        self.activities.values().map(|c| c.accepted).sum()
    }

    pub fn total_results(&self) -> u64 {
        self.activities.values().map(|c| c.results).sum()
    }
}
