//! Split Calculator
//!
//! Pure functions turning a gross amount and a set of recipients into an exact
//! distribution plan. All amounts are integer minor units (cents). Every
//! participant-facing share is floored to a whole `unit`; the platform line is
//! always the residual, so a plan's lines sum to its gross amount exactly.
//!
//! ## Rules
//!
//! | Event | Rule |
//! |-------|------|
//! | Direct sale | 70% creator (floored to unit) / platform residual |
//! | Pot closure | 40% top-10 investors (weighted) / 30% top-10 creators (weighted) / 7% lower-tier investors (equal) / platform residual |
//! | Points cashout | whole units to the account, single line |

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SettlementError;

/// Default minor units per whole currency unit
pub const DEFAULT_UNIT: i64 = 100;

/// Creator share of a direct sale, in basis points
pub const CREATOR_SHARE_BPS: i64 = 7_000;

/// Closure pot tier percentages
pub const INVESTOR_TIER_PERCENT: i64 = 40;
pub const CREATOR_TIER_PERCENT: i64 = 30;
pub const EQUITY_TIER_PERCENT: i64 = 7;

/// Per-rank weights for the top-10 investor tier, in absolute percent of the pot.
///
/// These are fixed constants, not derived from a decay formula. They sum to
/// 40.01 while the nominal tier is 40; shares are computed against the nominal
/// sum so the table values must not be changed or recomputed.
pub const INVESTOR_TOP10_WEIGHTS: [f64; 10] =
    [13.66, 6.83, 4.55, 3.41, 2.73, 2.28, 1.95, 1.71, 1.52, 1.37];
pub const INVESTOR_TOP10_NOMINAL_SUM: f64 = 40.0;

/// Per-rank weights for the top-10 creator tier (nominal 30, table sums to 29.99).
pub const CREATOR_TOP10_WEIGHTS: [f64; 10] =
    [10.24, 5.12, 3.41, 2.56, 2.05, 1.71, 1.46, 1.28, 1.14, 1.02];
pub const CREATOR_TOP10_NOMINAL_SUM: f64 = 30.0;

/// Payout rule identifiers stored with every ledger line
pub mod payout_rules {
    pub const DIRECT_SALE: &str = "70_30_v1";
    pub const CLOSURE_POT: &str = "40_30_7_23_v1";
    pub const POINTS_CONVERSION: &str = "points_conversion_v1";
}

// ============================================================================
// Plan Types
// ============================================================================

/// Who receives a line. The platform is never a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Platform,
    Account(String),
}

impl Recipient {
    pub fn account(id: impl Into<String>) -> Self {
        Recipient::Account(id.into())
    }

    pub fn account_id(&self) -> Option<&str> {
        match self {
            Recipient::Platform => None,
            Recipient::Account(id) => Some(id),
        }
    }

    pub fn is_platform(&self) -> bool {
        matches!(self, Recipient::Platform)
    }
}

/// Role of a line within its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRole {
    CreatorSale,
    PlatformSale,
    InvestorTopTier,
    CreatorTopTier,
    InvestorLowerTier,
    PlatformClosure,
    PointsConversion,
}

impl SplitRole {
    pub const ALL: [SplitRole; 7] = [
        SplitRole::CreatorSale,
        SplitRole::PlatformSale,
        SplitRole::InvestorTopTier,
        SplitRole::CreatorTopTier,
        SplitRole::InvestorLowerTier,
        SplitRole::PlatformClosure,
        SplitRole::PointsConversion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitRole::CreatorSale => "creator_sale",
            SplitRole::PlatformSale => "platform_sale",
            SplitRole::InvestorTopTier => "investor_top_tier",
            SplitRole::CreatorTopTier => "creator_top_tier",
            SplitRole::InvestorLowerTier => "investor_lower_tier",
            SplitRole::PlatformClosure => "platform_closure",
            SplitRole::PointsConversion => "points_conversion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.as_str() == value)
    }
}

/// One line of a distribution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionLine {
    pub recipient: Recipient,
    pub role: SplitRole,
    pub amount: i64,
    pub note: String,
}

impl DistributionLine {
    fn new(recipient: Recipient, role: SplitRole, amount: i64, note: impl Into<String>) -> Self {
        Self {
            recipient,
            role,
            amount,
            note: note.into(),
        }
    }
}

/// A complete distribution of one gross amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub gross: i64,
    pub rule: String,
    pub lines: Vec<DistributionLine>,
}

impl DistributionPlan {
    /// Sum of all lines
    pub fn total(&self) -> i64 {
        self.lines.iter().map(|l| l.amount).sum()
    }

    /// Per-role totals plus an `ALL` entry, for operator previews
    pub fn totals_by_role(&self) -> BTreeMap<String, i64> {
        let mut totals = BTreeMap::new();
        for line in &self.lines {
            *totals.entry(line.role.as_str().to_string()).or_insert(0) += line.amount;
        }
        totals.insert("ALL".to_string(), self.total());
        totals
    }

    /// Amount assigned to the platform
    pub fn platform_amount(&self) -> i64 {
        self.lines
            .iter()
            .filter(|l| l.recipient.is_platform())
            .map(|l| l.amount)
            .sum()
    }

    /// Check conservation, unit alignment and line uniqueness.
    pub fn verify(&self, unit: i64) -> Result<(), SettlementError> {
        let total = self.total();
        if total != self.gross {
            return Err(SettlementError::InvariantViolation(format!(
                "plan '{}' lines sum to {} but gross is {}",
                self.rule, total, self.gross
            )));
        }

        let mut seen = HashSet::new();
        for line in &self.lines {
            if line.amount < 0 {
                return Err(SettlementError::InvariantViolation(format!(
                    "negative line {} for {:?}",
                    line.amount, line.recipient
                )));
            }
            if !line.recipient.is_platform() && line.amount % unit != 0 {
                return Err(SettlementError::InvariantViolation(format!(
                    "line {} for {:?} is not a multiple of {}",
                    line.amount, line.recipient, unit
                )));
            }
            if !seen.insert((line.recipient.clone(), line.role)) {
                return Err(SettlementError::InvariantViolation(format!(
                    "duplicate line for {:?} as {}",
                    line.recipient,
                    line.role.as_str()
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Primitives
// ============================================================================

fn ensure_non_negative(name: &str, amount: i64) -> Result<(), SettlementError> {
    if amount < 0 {
        return Err(SettlementError::InvalidInput(format!(
            "{} must not be negative (got {})",
            name, amount
        )));
    }
    Ok(())
}

fn ensure_unit(unit: i64) -> Result<(), SettlementError> {
    if unit <= 0 {
        return Err(SettlementError::InvalidInput(format!("unit must be positive (got {})", unit)));
    }
    Ok(())
}

/// `amount - (amount mod unit)`
pub fn floor_to_unit(amount: i64, unit: i64) -> Result<i64, SettlementError> {
    ensure_non_negative("amount", amount)?;
    ensure_unit(unit)?;
    Ok(amount - amount % unit)
}

/// `floor(amount * percent / 100)` without floating point
fn percent_of(amount: i64, percent: i64) -> i64 {
    ((amount as i128 * percent as i128) / 100) as i64
}

// ============================================================================
// Splits
// ============================================================================

/// Direct sale: creator receives 70% rounded half-up then floored to unit; the
/// platform receives the residual.
pub fn direct_sale_split(
    gross: i64,
    creator_account: &str,
    unit: i64,
) -> Result<DistributionPlan, SettlementError> {
    ensure_non_negative("gross", gross)?;
    ensure_unit(unit)?;
    if creator_account.is_empty() {
        return Err(SettlementError::InvalidInput("creator account is required".into()));
    }

    let raw = ((gross as i128 * CREATOR_SHARE_BPS as i128 + 5_000) / 10_000) as i64;
    let creator_share = floor_to_unit(raw, unit)?;
    let platform_share = gross - creator_share;

    Ok(DistributionPlan {
        gross,
        rule: payout_rules::DIRECT_SALE.to_string(),
        lines: vec![
            DistributionLine::new(
                Recipient::account(creator_account),
                SplitRole::CreatorSale,
                creator_share,
                "70% sale (floored to unit)",
            ),
            DistributionLine::new(
                Recipient::Platform,
                SplitRole::PlatformSale,
                platform_share,
                "30% + rounding residual",
            ),
        ],
    })
}

/// Rank-weighted shares: recipient `i` receives
/// `floor_to_unit(floor(total * weights[i] / weight_sum))`.
pub fn weighted_rank_split(
    total: i64,
    weights: &[f64],
    weight_sum: f64,
    recipients: &[String],
    unit: i64,
) -> Result<Vec<(String, i64)>, SettlementError> {
    ensure_non_negative("total", total)?;
    ensure_unit(unit)?;
    if recipients.len() > weights.len() {
        return Err(SettlementError::InvalidInput(format!(
            "weighted split takes at most {} recipients (got {})",
            weights.len(),
            recipients.len()
        )));
    }
    if weight_sum <= 0.0 {
        return Err(SettlementError::InvalidInput("weight sum must be positive".into()));
    }

    let mut seen = HashSet::new();
    let mut shares = Vec::with_capacity(recipients.len());
    for (i, account) in recipients.iter().enumerate() {
        if !seen.insert(account.as_str()) {
            return Err(SettlementError::InvalidInput(format!(
                "account '{}' appears twice in a ranked tier",
                account
            )));
        }
        let raw = (total as f64 * (weights[i] / weight_sum)).floor() as i64;
        shares.push((account.clone(), floor_to_unit(raw, unit)?));
    }

    Ok(shares)
}

/// Equal shares among de-duplicated recipients (first occurrence order kept).
///
/// When the per-recipient share is below one unit, whole units are handed out
/// one each to the first recipients until the pool runs out; the rest get 0.
pub fn equal_pool_split(
    total: i64,
    recipients: &[String],
    unit: i64,
) -> Result<Vec<(String, i64)>, SettlementError> {
    ensure_non_negative("total", total)?;
    ensure_unit(unit)?;

    let mut seen = HashSet::new();
    let unique: Vec<&String> = recipients
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .collect();

    if unique.is_empty() {
        return Ok(Vec::new());
    }

    let per_recipient = floor_to_unit(total / unique.len() as i64, unit)?;
    if per_recipient >= unit {
        return Ok(unique
            .into_iter()
            .map(|r| (r.clone(), per_recipient))
            .collect());
    }

    let whole_units = (total / unit) as usize;
    Ok(unique
        .into_iter()
        .enumerate()
        .map(|(i, r)| (r.clone(), if i < whole_units { unit } else { 0 }))
        .collect())
}

/// Pot closure: 40/30/7 tiers with the platform taking the exact residual.
pub fn closure_pot_split(
    pot: i64,
    top_investors: &[String],
    top_creators: &[String],
    lower_investors: &[String],
    unit: i64,
) -> Result<DistributionPlan, SettlementError> {
    ensure_non_negative("pot", pot)?;
    ensure_unit(unit)?;

    let investor_total = percent_of(pot, INVESTOR_TIER_PERCENT);
    let creator_total = percent_of(pot, CREATOR_TIER_PERCENT);
    let equity_total = percent_of(pot, EQUITY_TIER_PERCENT);

    let mut lines = Vec::new();

    let investors = weighted_rank_split(
        investor_total,
        &INVESTOR_TOP10_WEIGHTS,
        INVESTOR_TOP10_NOMINAL_SUM,
        top_investors,
        unit,
    )?;
    for (i, (account, amount)) in investors.into_iter().enumerate() {
        lines.push(DistributionLine::new(
            Recipient::Account(account),
            SplitRole::InvestorTopTier,
            amount,
            format!("rank#{}", i + 1),
        ));
    }

    let creators = weighted_rank_split(
        creator_total,
        &CREATOR_TOP10_WEIGHTS,
        CREATOR_TOP10_NOMINAL_SUM,
        top_creators,
        unit,
    )?;
    for (i, (account, amount)) in creators.into_iter().enumerate() {
        lines.push(DistributionLine::new(
            Recipient::Account(account),
            SplitRole::CreatorTopTier,
            amount,
            format!("rank#{}", i + 1),
        ));
    }

    for (account, amount) in equal_pool_split(equity_total, lower_investors, unit)? {
        lines.push(DistributionLine::new(
            Recipient::Account(account),
            SplitRole::InvestorLowerTier,
            amount,
            "equal share",
        ));
    }

    let users_total: i64 = lines.iter().map(|l| l.amount).sum();
    lines.push(DistributionLine::new(
        Recipient::Platform,
        SplitRole::PlatformClosure,
        pot - users_total,
        "23% base + rounding residuals",
    ));

    Ok(DistributionPlan {
        gross: pot,
        rule: payout_rules::CLOSURE_POT.to_string(),
        lines,
    })
}

/// Points cashout: the whole amount goes to the account, which must be unit-aligned.
pub fn conversion_plan(account: &str, amount: i64, unit: i64) -> Result<DistributionPlan, SettlementError> {
    ensure_non_negative("amount", amount)?;
    ensure_unit(unit)?;
    if amount % unit != 0 {
        return Err(SettlementError::InvalidInput(format!(
            "conversion amount {} is not a multiple of {}",
            amount, unit
        )));
    }

    Ok(DistributionPlan {
        gross: amount,
        rule: payout_rules::POINTS_CONVERSION.to_string(),
        lines: vec![DistributionLine::new(
            Recipient::account(account),
            SplitRole::PointsConversion,
            amount,
            "points cashout",
        )],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accounts(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_floor_to_unit() {
        assert_eq!(floor_to_unit(699, 100).unwrap(), 600);
        assert_eq!(floor_to_unit(100, 100).unwrap(), 100);
        assert_eq!(floor_to_unit(50, 100).unwrap(), 0);
        assert_eq!(floor_to_unit(0, 100).unwrap(), 0);
        assert!(floor_to_unit(-1, 100).is_err());
        assert!(floor_to_unit(10, 0).is_err());
    }

    #[test]
    fn test_direct_sale_scenarios() {
        let plan = direct_sale_split(200, "creator", DEFAULT_UNIT).unwrap();
        let totals = plan.totals_by_role();
        assert_eq!(totals["creator_sale"], 100);
        assert_eq!(totals["platform_sale"], 100);
        assert_eq!(totals["ALL"], 200);

        let plan = direct_sale_split(999, "creator", DEFAULT_UNIT).unwrap();
        assert_eq!(plan.lines[0].amount, 600);
        assert_eq!(plan.lines[1].amount, 399);

        let plan = direct_sale_split(1999, "creator", DEFAULT_UNIT).unwrap();
        assert_eq!(plan.lines[0].amount, 1300);
        assert_eq!(plan.lines[1].amount, 699);
    }

    #[test]
    fn test_direct_sale_conserves_every_gross() {
        for gross in 0..5_000 {
            let plan = direct_sale_split(gross, "creator", DEFAULT_UNIT).unwrap();
            assert_eq!(plan.total(), gross);
            assert_eq!(plan.lines[0].amount % DEFAULT_UNIT, 0);
            assert!(plan.verify(DEFAULT_UNIT).is_ok());
        }
    }

    #[test]
    fn test_direct_sale_rejects_negative() {
        assert!(matches!(
            direct_sale_split(-5, "creator", DEFAULT_UNIT),
            Err(SettlementError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_weight_tables_sum_near_nominal() {
        let inv: f64 = INVESTOR_TOP10_WEIGHTS.iter().sum();
        let port: f64 = CREATOR_TOP10_WEIGHTS.iter().sum();
        assert!((inv - INVESTOR_TOP10_NOMINAL_SUM).abs() < 0.05);
        assert!((port - CREATOR_TOP10_NOMINAL_SUM).abs() < 0.05);
        assert!(INVESTOR_TOP10_WEIGHTS.windows(2).all(|w| w[0] > w[1]));
        assert!(CREATOR_TOP10_WEIGHTS.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_weighted_split_first_rank() {
        let shares = weighted_rank_split(
            400_000,
            &INVESTOR_TOP10_WEIGHTS,
            INVESTOR_TOP10_NOMINAL_SUM,
            &accounts("inv", 10),
            DEFAULT_UNIT,
        )
        .unwrap();
        assert_eq!(shares[0], ("inv1".to_string(), 136_600));
        assert_eq!(shares[9], ("inv10".to_string(), 13_700));
    }

    #[test]
    fn test_weighted_split_rejects_duplicates_and_overflow() {
        let dup = vec!["a".to_string(), "a".to_string()];
        assert!(weighted_rank_split(1000, &INVESTOR_TOP10_WEIGHTS, 40.0, &dup, 100).is_err());
        let eleven = accounts("x", 11);
        assert!(weighted_rank_split(1000, &INVESTOR_TOP10_WEIGHTS, 40.0, &eleven, 100).is_err());
    }

    #[test]
    fn test_equal_pool_round_robin() {
        // 700 minor units across 90 recipients: 7 whole units to hand out
        let shares = equal_pool_split(700, &accounts("lower", 90), DEFAULT_UNIT).unwrap();
        assert_eq!(shares.len(), 90);
        assert!(shares[..7].iter().all(|(_, a)| *a == 100));
        assert!(shares[7..].iter().all(|(_, a)| *a == 0));
    }

    #[test]
    fn test_equal_pool_empty() {
        assert!(equal_pool_split(10_000, &[], DEFAULT_UNIT).unwrap().is_empty());
    }

    #[test]
    fn test_closure_scenario_c() {
        let plan = closure_pot_split(
            1_000_000,
            &accounts("inv", 10),
            &accounts("port", 10),
            &accounts("lower", 90),
            DEFAULT_UNIT,
        )
        .unwrap();

        assert_eq!(plan.total(), 1_000_000);
        assert_eq!(plan.lines.len(), 111);
        for line in plan.lines.iter().filter(|l| !l.recipient.is_platform()) {
            assert_eq!(line.amount % DEFAULT_UNIT, 0);
        }
        assert!(plan.verify(DEFAULT_UNIT).is_ok());
        assert!(plan.platform_amount() >= percent_of(1_000_000, 23));
    }

    #[test]
    fn test_closure_deduplicates_lower_tier() {
        let lower = vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "c".to_string(),
            "b".to_string(),
        ];
        let plan = closure_pot_split(1_000_000, &[], &[], &lower, DEFAULT_UNIT).unwrap();
        let lower_lines: Vec<_> = plan
            .lines
            .iter()
            .filter(|l| l.role == SplitRole::InvestorLowerTier)
            .collect();
        assert_eq!(lower_lines.len(), 3);
        // 7% of 1_000_000 = 70_000 over 3 => 23_300 each after flooring
        assert!(lower_lines.iter().all(|l| l.amount == 23_300));
        assert_eq!(plan.total(), 1_000_000);
    }

    #[test]
    fn test_closure_conserves_for_many_pots() {
        let inv = accounts("inv", 10);
        let port = accounts("port", 7);
        let lower = accounts("lower", 33);
        for pot in (0..2_000_000).step_by(9_973) {
            let plan = closure_pot_split(pot, &inv, &port, &lower, DEFAULT_UNIT).unwrap();
            assert_eq!(plan.total(), pot);
            assert!(plan.verify(DEFAULT_UNIT).is_ok());
        }
        let plan = closure_pot_split(12_345, &[], &[], &[], DEFAULT_UNIT).unwrap();
        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.platform_amount(), 12_345);
    }

    #[test]
    fn test_verify_detects_broken_plan() {
        let mut plan = direct_sale_split(999, "creator", DEFAULT_UNIT).unwrap();
        plan.lines[1].amount -= 1;
        assert!(matches!(
            plan.verify(DEFAULT_UNIT),
            Err(SettlementError::InvariantViolation(_))
        ));

        let mut plan = direct_sale_split(999, "creator", DEFAULT_UNIT).unwrap();
        plan.lines[0].amount += 1;
        plan.lines[1].amount -= 1;
        assert!(plan.verify(DEFAULT_UNIT).is_err());
    }

    #[test]
    fn test_conversion_plan() {
        let plan = conversion_plan("acct", 2_500, DEFAULT_UNIT).unwrap();
        assert!(plan.verify(DEFAULT_UNIT).is_ok());
        assert_eq!(plan.platform_amount(), 0);
        assert!(conversion_plan("acct", 2_550, DEFAULT_UNIT).is_err());
    }

    #[test]
    fn test_role_round_trip_names() {
        for role in SplitRole::ALL {
            assert_eq!(SplitRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(SplitRole::parse("unknown"), None);
    }
}
