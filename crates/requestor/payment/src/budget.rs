//! Rolling spending cap
//!
//! Amounts accepted within the trailing window are summed; a payment that
//! would push the sum over the budget is refused, and from then on every
//! later payment is refused too.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Outcome of a budget check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetDecision {
    /// Within budget; `spent` includes the new amount
    Allowed { spent: Decimal },
    /// Over budget; `spent` is what the window would have held
    Refused { spent: Decimal, budget: Decimal },
}

impl BudgetDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BudgetDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RollingBudget {
    budget: Decimal,
    window: Duration,
    accepted: VecDeque<(DateTime<Utc>, Decimal)>,
    exhausted: bool,
}

impl RollingBudget {
    /// Budget over a trailing hour
    pub fn per_hour(budget: Decimal) -> Self {
        Self::with_window(budget, Duration::hours(1))
    }

    pub fn with_window(budget: Decimal, window: Duration) -> Self {
        Self {
            budget,
            window,
            accepted: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn budget(&self) -> Decimal {
        self.budget
    }

    /// Set once a payment was refused; never cleared
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.window;
        self.accepted.retain(|(at, _)| *at > horizon);
    }

    /// Sum accepted within the window ending at `now`
    pub fn spent(&mut self, now: DateTime<Utc>) -> Decimal {
        self.evict(now);
        self.accepted.iter().map(|(_, amount)| amount).sum()
    }

    /// Check whether `amount` fits at `now`. A refusal exhausts the budget.
    /// An allowed amount is not recorded until [`record`](Self::record).
    pub fn check(&mut self, amount: Decimal, now: DateTime<Utc>) -> BudgetDecision {
        let spent = self.spent(now) + amount;
        if self.exhausted || spent > self.budget {
            self.exhausted = true;
            return BudgetDecision::Refused {
                spent,
                budget: self.budget,
            };
        }
        BudgetDecision::Allowed { spent }
    }

    /// Count `amount` as accepted at `at`.
    pub fn record(&mut self, amount: Decimal, at: DateTime<Utc>) {
        if !amount.is_zero() {
            self.accepted.push_back((at, amount));
        }
    }

    /// Check and record in one step.
    pub fn try_accept(&mut self, amount: Decimal, now: DateTime<Utc>) -> BudgetDecision {
        let decision = self.check(amount, now);
        if decision.is_allowed() {
            self.record(amount, now);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_second_note_over_budget_is_refused() {
        let now = Utc::now();
        let mut budget = RollingBudget::per_hour(Decimal::ONE);

        assert!(budget.try_accept(dec("0.6"), now).is_allowed());
        assert_eq!(
            budget.try_accept(dec("0.6"), now + Duration::minutes(5)),
            BudgetDecision::Refused {
                spent: dec("1.2"),
                budget: Decimal::ONE
            }
        );
        assert!(budget.is_exhausted());
        assert!(!budget.try_accept(dec("0.01"), now + Duration::minutes(6)).is_allowed());
    }

    #[test]
    fn test_landing_on_the_budget_is_allowed() {
        let now = Utc::now();
        let mut budget = RollingBudget::per_hour(dec("0.3"));
        assert!(budget.try_accept(dec("0.1"), now).is_allowed());
        assert!(budget.try_accept(dec("0.2"), now).is_allowed());
        assert_eq!(budget.spent(now), dec("0.3"));
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn test_old_payments_leave_the_window() {
        let now = Utc::now();
        let mut budget = RollingBudget::per_hour(Decimal::ONE);

        assert!(budget.try_accept(dec("0.8"), now).is_allowed());
        assert_eq!(budget.spent(now + Duration::minutes(59)), dec("0.8"));
        assert_eq!(budget.spent(now + Duration::minutes(61)), Decimal::ZERO);
        assert!(budget.try_accept(dec("0.8"), now + Duration::minutes(61)).is_allowed());
    }

    #[test]
    fn test_check_does_not_record() {
        let now = Utc::now();
        let mut budget = RollingBudget::per_hour(Decimal::ONE);
        assert!(budget.check(dec("0.9"), now).is_allowed());
        assert!(budget.check(dec("0.9"), now).is_allowed());
        assert_eq!(budget.spent(now), Decimal::ZERO);
    }

    proptest! {
        #[test]
        fn acceptance_stops_at_first_overflow(
            budget_cents in 10i64..500,
            notes in prop::collection::vec((0i64..100, 0i64..3600), 1..40),
        ) {
            let budget = Decimal::new(budget_cents, 2);
            let start = Utc::now();
            let mut rolling = RollingBudget::per_hour(budget);
            let mut sorted = notes.clone();
            sorted.sort_by_key(|(_, offset)| *offset);

            let mut total = Decimal::ZERO;
            let mut overflowed = false;
            for (cents, offset) in sorted {
                let amount = Decimal::new(cents, 2);
                let at = start + Duration::seconds(offset);
                let allowed = rolling.try_accept(amount, at).is_allowed();
                if !overflowed && total + amount <= budget {
                    prop_assert!(allowed);
                    total += amount;
                } else {
                    overflowed = true;
                    prop_assert!(!allowed);
                }
            }
            prop_assert!(rolling.spent(start + Duration::seconds(3599)) <= budget);
        }
    }
}
