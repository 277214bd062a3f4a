//! Loyalty points, streak schedules and rank-based refund tiers
//!
//! Points are an internal unit: `points_per_unit` points make one whole
//! currency unit. Conversions always floor.

use crate::error::SettlementError;

/// Daily streak bonus by day number; day 7 and later stay at the cap.
pub const DAILY_STREAK_BONUS: [i64; 7] = [10, 15, 20, 25, 30, 35, 50];

/// Weekly streak bonus by week number; week 4 and later stay at the cap.
pub const WEEKLY_STREAK_BONUS: [i64; 4] = [30, 40, 50, 70];

/// Monthly wager tiers as `(tier, price in minor units)`
pub const WAGER_TIERS: [(i64, i64); 3] = [(1, 5_000), (2, 7_500), (3, 10_000)];

/// `floor(points / points_per_unit)` whole currency units
pub fn points_to_currency(points: i64, points_per_unit: i64) -> Result<i64, SettlementError> {
    if points < 0 {
        return Err(SettlementError::InvalidInput(format!(
            "points must not be negative (got {})",
            points
        )));
    }
    if points_per_unit <= 0 {
        return Err(SettlementError::InvalidInput("points_per_unit must be positive".into()));
    }
    Ok(points / points_per_unit)
}

/// Points worth an amount of minor units, floored.
pub fn minor_to_points(minor: i64, unit: i64, points_per_unit: i64) -> Result<i64, SettlementError> {
    if minor < 0 {
        return Err(SettlementError::InvalidInput(format!(
            "amount must not be negative (got {})",
            minor
        )));
    }
    if unit <= 0 || points_per_unit <= 0 {
        return Err(SettlementError::InvalidInput(
            "unit and points_per_unit must be positive".into(),
        ));
    }
    Ok(((minor as i128 * points_per_unit as i128) / unit as i128) as i64)
}

pub fn meets_cashout_threshold(points: i64, threshold: i64) -> bool {
    points >= threshold
}

pub fn daily_loyalty_bonus(day_number: i64) -> i64 {
    streak_lookup(&DAILY_STREAK_BONUS, day_number)
}

pub fn weekly_loyalty_bonus(week_number: i64) -> i64 {
    streak_lookup(&WEEKLY_STREAK_BONUS, week_number)
}

fn streak_lookup(table: &[i64], period: i64) -> i64 {
    if period <= 0 {
        return 0;
    }
    let index = (period as usize).min(table.len()) - 1;
    table[index]
}

/// Backer vote weight carried by a sale
pub fn votes_for_amount(amount: i64, minor_units_per_vote: i64) -> i64 {
    if amount <= 0 || minor_units_per_vote <= 0 {
        return 0;
    }
    amount / minor_units_per_vote
}

/// Price of a wager tier
pub fn wager_tier_amount(tier: i64) -> Option<i64> {
    WAGER_TIERS
        .iter()
        .find(|(t, _)| *t == tier)
        .map(|(_, amount)| *amount)
}

/// Refund percentage for the final rank of a wager's target.
/// `None` means the target was not ranked at all.
pub fn wager_refund_percentage(final_rank: Option<i64>) -> i64 {
    match final_rank {
        Some(1..=10) => 100,
        Some(11) => 100,
        Some(12..=20) => 50,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cashout_threshold() {
        assert!(meets_cashout_threshold(2500, 2500));
        assert!(!meets_cashout_threshold(2499, 2500));
    }

    #[test]
    fn test_points_to_currency() {
        assert_eq!(points_to_currency(2599, 100).unwrap(), 25);
        assert_eq!(points_to_currency(0, 100).unwrap(), 0);
        assert!(points_to_currency(-1, 100).is_err());
        assert_eq!(minor_to_points(1_234, 100, 100).unwrap(), 1_234);
        assert_eq!(minor_to_points(1_234, 100, 10).unwrap(), 123);
    }

    #[test]
    fn test_daily_streak_saturates() {
        assert_eq!(daily_loyalty_bonus(0), 0);
        assert_eq!(daily_loyalty_bonus(-3), 0);
        assert_eq!(daily_loyalty_bonus(1), 10);
        assert_eq!(daily_loyalty_bonus(6), 35);
        assert_eq!(daily_loyalty_bonus(7), 50);
        assert_eq!(daily_loyalty_bonus(8), daily_loyalty_bonus(7));
        assert_eq!(daily_loyalty_bonus(365), 50);
    }

    #[test]
    fn test_weekly_streak_saturates() {
        assert_eq!(weekly_loyalty_bonus(0), 0);
        assert_eq!(weekly_loyalty_bonus(1), 30);
        assert_eq!(weekly_loyalty_bonus(4), 70);
        assert_eq!(weekly_loyalty_bonus(12), 70);
    }

    #[test]
    fn test_refund_tiers() {
        assert_eq!(wager_refund_percentage(Some(5)), 100);
        assert_eq!(wager_refund_percentage(Some(11)), 100);
        assert_eq!(wager_refund_percentage(Some(15)), 50);
        assert_eq!(wager_refund_percentage(Some(20)), 50);
        assert_eq!(wager_refund_percentage(Some(21)), 0);
        assert_eq!(wager_refund_percentage(Some(30)), 0);
        assert_eq!(wager_refund_percentage(None), 0);
    }

    #[test]
    fn test_votes_and_tiers() {
        assert_eq!(votes_for_amount(200, 10), 20);
        assert_eq!(votes_for_amount(9, 10), 0);
        assert_eq!(wager_tier_amount(2), Some(7_500));
        assert_eq!(wager_tier_amount(4), None);
    }
}
