//! Stats Aggregator
//!
//! Per-farmer and global rollups over the position ledger.
//!
//! Active positions only contribute counts and sealed amounts; the stake
//! totals over them are homomorphic sums that stay sealed (bound to the
//! owner, or to the ledger for global liquidity). Withdrawn positions
//! contribute their revealed plaintext.
//!
//! The aggregator keeps incrementally maintained snapshots for reads. The
//! `fold_*` functions recompute the same values from scratch and are used on
//! recovery and in equivalence checks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::sealed::{Amount, Binding, ContentId, SealedError, SealedValue};
use crate::services::ledger::{Position, PositionState, RevealedFields};
use crate::services::proof_engine::{ProofEngine, ProofError};
use crate::types::OwnerId;

/// 포지션 생성당 평판 점수
pub const REPUTATION_PER_POSITION: u64 = 5;
/// 출금 완료당 평판 점수
pub const REPUTATION_PER_WITHDRAWAL: u64 = 10;
pub const MAX_REPUTATION: u32 = 100;

pub fn reputation(total_positions: u64, withdrawn_positions: u64) -> u32 {
    let score = total_positions
        .saturating_mul(REPUTATION_PER_POSITION)
        .saturating_add(withdrawn_positions.saturating_mul(REPUTATION_PER_WITHDRAWAL));
    score.min(u64::from(MAX_REPUTATION)) as u32
}

#[derive(Debug, Clone)]
pub struct FarmerStats {
    pub owner: OwnerId,
    pub reputation: u32,
    /// 활성 포지션 금액 합 (봉인, owner에게만 공개)
    pub active_stake: SealedValue<Amount>,
    pub withdrawn_stake: Amount,
    pub total_earned: Amount,
    pub active_positions: u64,
    pub total_positions: u64,
    pub withdrawn_positions: u64,
}

/// Non-sealed part of [`FarmerStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FarmerSummary {
    pub reputation: u32,
    pub withdrawn_stake: Amount,
    pub total_earned: Amount,
    pub active_positions: u64,
    pub total_positions: u64,
    pub withdrawn_positions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmerStatsView {
    pub owner: OwnerId,
    #[serde(flatten)]
    pub summary: FarmerSummary,
    /// 봉인된 active stake의 content id
    pub active_stake: ContentId,
}

impl FarmerStats {
    fn empty(engine: &ProofEngine, owner: &OwnerId) -> Result<Self, ProofError> {
        Ok(Self {
            owner: owner.clone(),
            reputation: 0,
            active_stake: engine.seal(Amount(0), Binding::owner(owner))?,
            withdrawn_stake: Amount(0),
            total_earned: Amount(0),
            active_positions: 0,
            total_positions: 0,
            withdrawn_positions: 0,
        })
    }

    pub fn public_summary(&self) -> FarmerSummary {
        FarmerSummary {
            reputation: self.reputation,
            withdrawn_stake: self.withdrawn_stake,
            total_earned: self.total_earned,
            active_positions: self.active_positions,
            total_positions: self.total_positions,
            withdrawn_positions: self.withdrawn_positions,
        }
    }

    pub fn view(&self) -> FarmerStatsView {
        FarmerStatsView {
            owner: self.owner.clone(),
            summary: self.public_summary(),
            active_stake: self.active_stake.content_id(),
        }
    }

    fn refresh_reputation(&mut self) {
        self.reputation = reputation(self.total_positions, self.withdrawn_positions);
    }
}

#[derive(Debug, Clone)]
pub struct GlobalStats {
    /// 활성 포지션 전체 금액 합 (봉인, ledger binding)
    pub total_liquidity: SealedValue<Amount>,
    pub total_positions: u64,
    pub active_positions: u64,
    pub total_pools: u64,
    pub total_rewards: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalSummary {
    pub total_positions: u64,
    pub active_positions: u64,
    pub total_pools: u64,
    pub total_rewards: Amount,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatsView {
    #[serde(flatten)]
    pub summary: GlobalSummary,
    pub total_liquidity: ContentId,
}

impl GlobalStats {
    fn empty(engine: &ProofEngine) -> Result<Self, ProofError> {
        Ok(Self {
            total_liquidity: engine.seal(Amount(0), Binding::ledger())?,
            total_positions: 0,
            active_positions: 0,
            total_pools: 0,
            total_rewards: Amount(0),
        })
    }

    pub fn public_summary(&self) -> GlobalSummary {
        GlobalSummary {
            total_positions: self.total_positions,
            active_positions: self.active_positions,
            total_pools: self.total_pools,
            total_rewards: self.total_rewards,
        }
    }

    pub fn view(&self) -> GlobalStatsView {
        GlobalStatsView {
            summary: self.public_summary(),
            total_liquidity: self.total_liquidity.content_id(),
        }
    }
}

fn revealed_of(position: &Position) -> Result<&RevealedFields, ProofError> {
    position
        .revealed
        .as_ref()
        .ok_or(ProofError::Sealed(SealedError::NotRevealed))
}

fn overflow() -> ProofError {
    ProofError::Sealed(SealedError::Overflow)
}

/// Recompute one farmer's stats from their positions
pub fn fold_farmer<'a, I>(engine: &ProofEngine, owner: &OwnerId, positions: I) -> Result<FarmerStats, ProofError>
where
    I: IntoIterator<Item = &'a Position>,
{
    let mut stats = FarmerStats::empty(engine, owner)?;
    let mut active = Vec::new();

    for position in positions.into_iter().filter(|p| &p.owner == owner) {
        stats.total_positions += 1;
        match position.state {
            PositionState::Active => {
                stats.active_positions += 1;
                active.push(&position.amount.value);
            }
            PositionState::Withdrawn => {
                let revealed = revealed_of(position)?;
                stats.withdrawn_positions += 1;
                stats.withdrawn_stake.0 = stats.withdrawn_stake.0.checked_add(revealed.amount.0).ok_or_else(overflow)?;
                stats.total_earned.0 = stats.total_earned.0.checked_add(revealed.earned.0).ok_or_else(overflow)?;
            }
        }
    }

    stats.active_stake = engine.sum(active, Binding::owner(owner))?;
    stats.refresh_reputation();
    Ok(stats)
}

/// Recompute global stats from every position
pub fn fold_global<'a, I>(engine: &ProofEngine, positions: I, total_pools: u64) -> Result<GlobalStats, ProofError>
where
    I: IntoIterator<Item = &'a Position>,
{
    let mut stats = GlobalStats::empty(engine)?;
    stats.total_pools = total_pools;
    let mut active = Vec::new();

    for position in positions {
        stats.total_positions += 1;
        match position.state {
            PositionState::Active => {
                stats.active_positions += 1;
                active.push(&position.amount.value);
            }
            PositionState::Withdrawn => {
                let revealed = revealed_of(position)?;
                stats.total_rewards.0 = stats.total_rewards.0.checked_add(revealed.earned.0).ok_or_else(overflow)?;
            }
        }
    }

    stats.total_liquidity = engine.sum(active, Binding::ledger())?;
    Ok(stats)
}

/// Incrementally maintained stats snapshots
pub struct StatsAggregator {
    engine: Arc<ProofEngine>,
    farmers: RwLock<HashMap<OwnerId, FarmerStats>>,
    global: RwLock<GlobalStats>,
}

impl StatsAggregator {
    pub fn new(engine: Arc<ProofEngine>) -> Result<Self, ProofError> {
        let global = GlobalStats::empty(&engine)?;
        Ok(Self {
            engine,
            farmers: RwLock::new(HashMap::new()),
            global: RwLock::new(global),
        })
    }

    /// Account for a newly committed position.
    ///
    /// Both snapshots change together or not at all.
    pub fn record_created(&self, position: &Position) -> Result<(), ProofError> {
        let mut farmers = self.farmers.write();
        let mut global = self.global.write();

        let current = match farmers.get(&position.owner) {
            Some(stats) => stats.clone(),
            None => FarmerStats::empty(&self.engine, &position.owner)?,
        };

        let mut farmer = current;
        farmer.active_stake = self.engine.add(
            &farmer.active_stake,
            &position.amount.value,
            Binding::owner(&position.owner),
        )?;
        farmer.active_positions += 1;
        farmer.total_positions += 1;
        farmer.refresh_reputation();

        let liquidity = self
            .engine
            .add(&global.total_liquidity, &position.amount.value, Binding::ledger())?;

        farmers.insert(position.owner.clone(), farmer);
        global.total_liquidity = liquidity;
        global.total_positions += 1;
        global.active_positions += 1;
        Ok(())
    }

    /// Account for a committed withdrawal
    pub fn record_withdrawn(&self, position: &Position, revealed: &RevealedFields) -> Result<(), ProofError> {
        let mut farmers = self.farmers.write();
        let mut global = self.global.write();

        let mut farmer = farmers
            .get(&position.owner)
            .cloned()
            .ok_or(ProofError::Sealed(SealedError::NotRevealed))?;
        farmer.active_stake = self.engine.sub(
            &farmer.active_stake,
            &position.amount.value,
            Binding::owner(&position.owner),
        )?;
        farmer.active_positions = farmer.active_positions.checked_sub(1).ok_or_else(overflow)?;
        farmer.withdrawn_positions += 1;
        farmer.withdrawn_stake.0 = farmer.withdrawn_stake.0.checked_add(revealed.amount.0).ok_or_else(overflow)?;
        farmer.total_earned.0 = farmer.total_earned.0.checked_add(revealed.earned.0).ok_or_else(overflow)?;
        farmer.refresh_reputation();

        let liquidity = self
            .engine
            .sub(&global.total_liquidity, &position.amount.value, Binding::ledger())?;
        let active = global.active_positions.checked_sub(1).ok_or_else(overflow)?;
        let rewards = global.total_rewards.0.checked_add(revealed.earned.0).ok_or_else(overflow)?;

        farmers.insert(position.owner.clone(), farmer);
        global.total_liquidity = liquidity;
        global.active_positions = active;
        global.total_rewards = Amount(rewards);
        Ok(())
    }

    pub fn record_pool_created(&self) {
        self.global.write().total_pools += 1;
    }

    pub fn farmer_stats(&self, owner: &OwnerId) -> Result<FarmerStats, ProofError> {
        match self.farmers.read().get(owner) {
            Some(stats) => Ok(stats.clone()),
            None => FarmerStats::empty(&self.engine, owner),
        }
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.global.read().clone()
    }

    /// Replace both snapshots with full folds over `positions`
    pub fn rebuild(&self, positions: &[&Position], total_pools: u64) -> Result<(), ProofError> {
        let mut by_owner: HashMap<&OwnerId, Vec<&Position>> = HashMap::new();
        for position in positions {
            by_owner.entry(&position.owner).or_default().push(position);
        }

        let mut farmers = HashMap::with_capacity(by_owner.len());
        for (owner, owned) in by_owner {
            farmers.insert(owner.clone(), fold_farmer(&self.engine, owner, owned)?);
        }
        let global = fold_global(&self.engine, positions.iter().copied(), total_pools)?;

        *self.farmers.write() = farmers;
        *self.global.write() = global;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reputation() {
        assert_eq!(reputation(0, 0), 0);
        assert_eq!(reputation(1, 0), 5);
        assert_eq!(reputation(1, 1), 15);
        assert_eq!(reputation(10, 5), 100);
        assert_eq!(reputation(u64::MAX, u64::MAX), 100);
    }
}
