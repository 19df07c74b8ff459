//! Attack resolution
//!
//! A single uniform roll over `[1, range]` where
//! `range = attacker.hit + attacker.crit + defender.dodge + defender.block`.
//! The range is split into contiguous buckets in a fixed order:
//!
//! | bucket | size |
//! |---|---|
//! | crit | `attacker.crit` |
//! | hit | `attacker.hit` |
//! | block | `defender.block` |
//! | dodge | `defender.dodge` |
//!
//! The outcome is the bucket holding the roll. Severity is the roll's position inside
//! that bucket, `(roll - offset) / size`, always in `(0, 1]`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CombatError;

/// Combat stats of an actor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatStats {
    #[serde(default)]
    pub hit: u32,
    #[serde(default)]
    pub crit: u32,
    #[serde(default)]
    pub block: u32,
    #[serde(default)]
    pub dodge: u32,
}

impl CombatStats {
    pub fn new(hit: u32, crit: u32, block: u32, dodge: u32) -> Self {
        Self {
            hit,
            crit,
            block,
            dodge,
        }
    }
}

/// Which bucket a roll landed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Crit,
    Hit,
    Block,
    Dodge,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Crit => "crit",
            Outcome::Hit => "hit",
            Outcome::Block => "block",
            Outcome::Dodge => "dodge",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of one attack roll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttackResult {
    pub outcome: Outcome,
    /// Position within the bucket, in `(0, 1]`
    pub severity: f64,
    pub roll: u64,
    pub range: u64,
}

/// Total size of the roll range
pub fn attack_range(attacker: &CombatStats, defender: &CombatStats) -> u64 {
    u64::from(attacker.hit)
        + u64::from(attacker.crit)
        + u64::from(defender.dodge)
        + u64::from(defender.block)
}

/// Resolve a known roll
pub fn resolve_roll(
    attacker: &CombatStats,
    defender: &CombatStats,
    roll: u64,
) -> Result<AttackResult, CombatError> {
    let range = attack_range(attacker, defender);
    if range == 0 {
        return Err(CombatError::DegenerateRange);
    }
    if roll == 0 || roll > range {
        return Err(CombatError::RollOutOfRange { roll, range });
    }

    let buckets = [
        (Outcome::Crit, u64::from(attacker.crit)),
        (Outcome::Hit, u64::from(attacker.hit)),
        (Outcome::Block, u64::from(defender.block)),
        (Outcome::Dodge, u64::from(defender.dodge)),
    ];

    let mut offset = 0;
    for (outcome, size) in buckets {
        if size > 0 && roll <= offset + size {
            return Ok(AttackResult {
                outcome,
                severity: (roll - offset) as f64 / size as f64,
                roll,
                range,
            });
        }
        offset += size;
    }

    // The buckets cover [1, range] exactly, so a valid roll always lands above
    Err(CombatError::RollOutOfRange { roll, range })
}

/// Draw a roll uniformly from `[1, range]` and resolve it
pub fn resolve_attack<R: Rng + ?Sized>(
    attacker: &CombatStats,
    defender: &CombatStats,
    rng: &mut R,
) -> Result<AttackResult, CombatError> {
    let range = attack_range(attacker, defender);
    if range == 0 {
        return Err(CombatError::DegenerateRange);
    }
    let roll = rng.gen_range(1..=range);
    resolve_roll(attacker, defender, roll)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn attacker() -> CombatStats {
        CombatStats::new(40, 10, 30, 20)
    }

    fn defender() -> CombatStats {
        CombatStats::new(0, 0, 30, 20)
    }

    fn outcome(roll: u64) -> Outcome {
        resolve_roll(&attacker(), &defender(), roll).unwrap().outcome
    }

    #[test]
    fn test_range() {
        assert_eq!(attack_range(&attacker(), &defender()), 100);
    }

    #[test]
    fn test_representative_rolls() {
        assert_eq!(outcome(5), Outcome::Crit);
        assert_eq!(outcome(45), Outcome::Hit);
        assert_eq!(outcome(60), Outcome::Block);
        assert_eq!(outcome(95), Outcome::Dodge);
    }

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(outcome(1), Outcome::Crit);
        assert_eq!(outcome(10), Outcome::Crit);
        assert_eq!(outcome(11), Outcome::Hit);
        assert_eq!(outcome(50), Outcome::Hit);
        assert_eq!(outcome(51), Outcome::Block);
        assert_eq!(outcome(80), Outcome::Block);
        assert_eq!(outcome(81), Outcome::Dodge);
        assert_eq!(outcome(100), Outcome::Dodge);
    }

    #[test]
    fn test_severity() {
        let r = resolve_roll(&attacker(), &defender(), 10).unwrap();
        assert_eq!(r.severity, 1.0);

        let r = resolve_roll(&attacker(), &defender(), 11).unwrap();
        assert_eq!(r.severity, 1.0 / 40.0);

        let r = resolve_roll(&attacker(), &defender(), 65).unwrap();
        assert_eq!(r.outcome, Outcome::Block);
        assert_eq!(r.severity, 0.5);
    }

    #[test]
    fn test_zero_width_buckets_are_skipped() {
        let a = CombatStats::new(10, 0, 0, 0);
        let d = CombatStats::new(0, 0, 0, 0);
        for roll in 1..=10 {
            assert_eq!(resolve_roll(&a, &d, roll).unwrap().outcome, Outcome::Hit);
        }
    }

    #[test]
    fn test_degenerate_range() {
        let zero = CombatStats::default();
        assert_eq!(
            resolve_roll(&zero, &zero, 1),
            Err(CombatError::DegenerateRange)
        );
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(
            resolve_attack(&zero, &zero, &mut rng),
            Err(CombatError::DegenerateRange)
        );
    }

    #[test]
    fn test_roll_out_of_range() {
        assert!(resolve_roll(&attacker(), &defender(), 0).is_err());
        assert!(resolve_roll(&attacker(), &defender(), 101).is_err());
    }

    #[test]
    fn test_random_rolls_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let r = resolve_attack(&attacker(), &defender(), &mut rng).unwrap();
            assert!(r.roll >= 1 && r.roll <= 100);
            assert!(r.severity > 0.0 && r.severity <= 1.0);
        }
    }
}
