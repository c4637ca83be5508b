//! Lifecycle Engine
//!
//! Owns the per-mint record: ordered phase history, curve ↔ mint map and
//! the pending-graduation set. Fuses bonding-curve and AMM observations
//! into `Bonding → Migrating → Graduated` (or `Abandoned`). A graduation
//! whose curve has no known mint is parked, never guessed; it resolves
//! opportunistically from later trades and is surfaced in the logs once
//! it ages past the resolution window.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::database_writer::{DbHandle, TokenRow, WriteTask};
use crate::event_router::EventRouter;
use crate::events::{
    GraduationEvent, IndexerEvent, PoolCreatedEvent, PriceTag, Program, TokenCreateEvent,
    TradeEvent,
};
use crate::volume_tracker::VolumeTracker;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    Bonding,
    Migrating,
    Graduated,
    Abandoned,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Bonding => "bonding",
            LifecyclePhase::Migrating => "migrating",
            LifecyclePhase::Graduated => "graduated",
            LifecyclePhase::Abandoned => "abandoned",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            LifecyclePhase::Bonding => 0,
            LifecyclePhase::Migrating => 1,
            LifecyclePhase::Graduated => 2,
            LifecyclePhase::Abandoned => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecyclePhase::Graduated | LifecyclePhase::Abandoned)
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub phase: LifecyclePhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub triggering_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MintState {
    pub mint: String,
    pub first_seen_slot: u64,
    pub first_seen_at: DateTime<Utc>,
    pub creator: Option<String>,
    pub first_program: Program,
    pub current_program: Program,
    pub curve: Option<String>,
    pub phases: Vec<PhaseRecord>,
    pub graduated: bool,
    pub graduation_slot: Option<u64>,
    pub graduation_at: Option<DateTime<Utc>>,
    pub tracked: bool,
    pub threshold_crossed: bool,
    pub threshold_crossed_at: Option<DateTime<Utc>>,
    pub last_price: Option<PriceTag>,
    pub volume: VolumeTracker,
    /// True once the mint has been persisted and `token:discovered`
    /// emitted; sub-threshold mints stay unannounced in-memory caches
    pub announced: bool,
}

impl MintState {
    pub fn current_phase(&self) -> Option<LifecyclePhase> {
        self.phases.last().map(|p| p.phase)
    }
}

/// A graduation waiting for its curve → mint mapping
#[derive(Debug, Clone)]
struct ParkedGraduation {
    event: GraduationEvent,
    parked_at: DateTime<Utc>,
    stale_logged: bool,
}

pub struct LifecycleEngine {
    shards: Vec<RwLock<HashMap<String, MintState>>>,
    curve_to_mint: RwLock<HashMap<String, String>>,
    pending_graduations: Mutex<HashMap<String, ParkedGraduation>>,
    db: DbHandle,
    router: Arc<EventRouter>,
}

impl LifecycleEngine {
    pub fn new(db: DbHandle, router: Arc<EventRouter>) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            curve_to_mint: RwLock::new(HashMap::new()),
            pending_graduations: Mutex::new(HashMap::new()),
            db,
            router,
        }
    }

    fn shard(&self, mint: &str) -> &RwLock<HashMap<String, MintState>> {
        let mut hasher = DefaultHasher::new();
        mint.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Run a closure under the per-mint lock; creates the record first if
    /// the mint is unseen. Returns whether the mint was newly discovered.
    pub fn with_mint_mut<F, R>(&self, trade: &TradeEvent, f: F) -> (bool, R)
    where
        F: FnOnce(&mut MintState) -> R,
    {
        let mut f = Some(f);
        let mut discovered = self.ensure_mint(trade);
        loop {
            {
                let mut shard = self.shard(&trade.mint).write();
                if let Some(state) = shard.get_mut(&trade.mint) {
                    let f = f.take().expect("closure consumed once");
                    return (discovered, f(state));
                }
            }
            // Pruned between ensure and lock; re-create
            discovered = self.ensure_mint(trade) || discovered;
        }
    }

    pub fn get(&self, mint: &str) -> Option<MintState> {
        self.shard(mint).read().get(mint).cloned()
    }

    pub fn mint_for_curve(&self, curve: &str) -> Option<String> {
        self.curve_to_mint.read().get(curve).cloned()
    }

    pub fn mint_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn pending_graduation_count(&self) -> usize {
        self.pending_graduations.lock().len()
    }

    /// First sight of a mint through any trade
    fn ensure_mint(&self, trade: &TradeEvent) -> bool {
        {
            let shard = self.shard(&trade.mint).read();
            if shard.contains_key(&trade.mint) {
                drop(shard);
                self.learn_curve(trade);
                return false;
            }
        }

        let initial_phase = match trade.program {
            Program::BondingCurve => LifecyclePhase::Bonding,
            // First sight on the AMM: the migration happened before we
            // watched, so there is no observable Migrating phase
            Program::AmmPool => LifecyclePhase::Graduated,
        };

        let state = MintState {
            mint: trade.mint.clone(),
            first_seen_slot: trade.slot,
            first_seen_at: trade.block_time,
            creator: None,
            first_program: trade.program,
            current_program: trade.program,
            curve: trade.curve.clone(),
            phases: vec![PhaseRecord {
                phase: initial_phase,
                started_at: trade.block_time,
                ended_at: None,
                triggering_signature: Some(trade.signature.clone()),
            }],
            graduated: initial_phase == LifecyclePhase::Graduated,
            graduation_slot: (initial_phase == LifecyclePhase::Graduated).then_some(trade.slot),
            graduation_at: (initial_phase == LifecyclePhase::Graduated)
                .then_some(trade.block_time),
            tracked: false,
            threshold_crossed: false,
            threshold_crossed_at: None,
            last_price: trade.price,
            volume: VolumeTracker::new(),
            announced: false,
        };

        let inserted = {
            let mut shard = self.shard(&trade.mint).write();
            if shard.contains_key(&trade.mint) {
                false
            } else {
                shard.insert(trade.mint.clone(), state);
                true
            }
        };

        self.learn_curve(trade);
        inserted
    }

    /// Persist and broadcast a mint the first time it proves worth
    /// saving. Until then the record is an in-memory cache only, so a
    /// sub-threshold mint leaves no rows and no discovery event behind.
    pub fn announce_mint(&self, mint: &str) {
        let snapshot = {
            let mut shard = self.shard(mint).write();
            let Some(state) = shard.get_mut(mint) else {
                return;
            };
            if state.announced {
                return;
            }
            state.announced = true;
            (
                state.first_program,
                state.creator.clone(),
                state.first_seen_slot,
                state.curve.clone(),
                state.phases.clone(),
            )
        };
        let (program, creator, slot, curve, phases) = snapshot;

        for phase in phases {
            self.db.submit(WriteTask::LifecyclePhase {
                mint: mint.to_string(),
                phase: phase.phase.as_str().to_string(),
                started_at: phase.started_at,
                ended_at: phase.ended_at,
                signature: phase.triggering_signature,
            });
        }
        if let Some(curve) = curve {
            self.db.submit(WriteTask::CurveMapping {
                curve,
                mint: mint.to_string(),
                slot,
                complete: false,
            });
        }
        self.router.queue(IndexerEvent::TokenDiscovered {
            mint: mint.to_string(),
            program,
            creator,
            slot,
        });
        debug!("🌱 Token discovered via {}: {}", program.as_str(), mint);
    }

    /// Learn the curve ↔ mint relation from a BC trade and retry any
    /// parked graduation on that curve
    fn learn_curve(&self, trade: &TradeEvent) {
        let Some(curve) = trade.curve.as_deref() else {
            return;
        };
        let newly_learned = {
            let mut map = self.curve_to_mint.write();
            match map.get(curve) {
                Some(known) if known == &trade.mint => false,
                Some(known) => {
                    warn!(
                        "🧭 Curve {} remapped {} -> {} (ignoring)",
                        curve, known, trade.mint
                    );
                    false
                }
                None => {
                    map.insert(curve.to_string(), trade.mint.clone());
                    true
                }
            }
        };

        if newly_learned {
            // The mapping row lands when the mint is announced; the
            // in-memory relation is enough to settle parked graduations
            self.resolve_pending(curve);
        }
    }

    /// Token creation carries creator and curve up front
    pub fn observe_create(&self, event: &TokenCreateEvent) {
        let mut shard = self.shard(&event.mint).write();
        let state = shard.entry(event.mint.clone()).or_insert_with(|| MintState {
            mint: event.mint.clone(),
            first_seen_slot: event.slot,
            first_seen_at: event.block_time,
            creator: None,
            first_program: Program::BondingCurve,
            current_program: Program::BondingCurve,
            curve: Some(event.curve.clone()),
            phases: vec![PhaseRecord {
                phase: LifecyclePhase::Bonding,
                started_at: event.block_time,
                ended_at: None,
                triggering_signature: Some(event.signature.clone()),
            }],
            graduated: false,
            graduation_slot: None,
            graduation_at: None,
            tracked: false,
            threshold_crossed: false,
            threshold_crossed_at: None,
            last_price: None,
            volume: VolumeTracker::new(),
            announced: true,
        });
        state.creator = Some(event.creator.clone());
        state.curve = Some(event.curve.clone());
        state.announced = true;
        drop(shard);

        self.curve_to_mint
            .write()
            .insert(event.curve.clone(), event.mint.clone());
        self.db.submit(WriteTask::LifecyclePhase {
            mint: event.mint.clone(),
            phase: LifecyclePhase::Bonding.as_str().to_string(),
            started_at: event.block_time,
            ended_at: None,
            signature: Some(event.signature.clone()),
        });
        self.db.submit(WriteTask::CurveMapping {
            curve: event.curve.clone(),
            mint: event.mint.clone(),
            slot: event.slot,
            complete: false,
        });
        self.router.queue(IndexerEvent::TokenDiscovered {
            mint: event.mint.clone(),
            program: Program::BondingCurve,
            creator: Some(event.creator.clone()),
            slot: event.slot,
        });
        self.resolve_pending(&event.curve);
    }

    /// Curve account data flipped `complete`: same meaning as a withdraw
    pub fn observe_curve_complete(
        &self,
        curve: &str,
        slot: u64,
        block_time: DateTime<Utc>,
    ) {
        self.observe_graduation(&GraduationEvent {
            signature: String::new(),
            slot,
            block_time,
            curve: curve.to_string(),
            mint: None,
        });
    }

    /// A withdraw / completion observation. Missing mints are parked.
    pub fn observe_graduation(&self, event: &GraduationEvent) {
        let mint = event
            .mint
            .clone()
            .or_else(|| self.mint_for_curve(&event.curve));

        let Some(mint) = mint else {
            info!(
                "🎓 Graduation parked, curve {} has no known mint yet",
                event.curve
            );
            self.pending_graduations.lock().insert(
                event.curve.clone(),
                ParkedGraduation {
                    event: event.clone(),
                    parked_at: Utc::now(),
                    stale_logged: false,
                },
            );
            return;
        };

        self.apply_migration(&mint, event);
    }

    fn apply_migration(&self, mint: &str, event: &GraduationEvent) {
        // A graduating mint is always worth keeping
        self.announce_mint(mint);
        let transitioned = {
            let mut shard = self.shard(mint).write();
            let Some(state) = shard.get_mut(mint) else {
                // Curve map knew the mint but the record was pruned;
                // park the graduation so nothing is silently discarded
                drop(shard);
                self.pending_graduations.lock().insert(
                    event.curve.clone(),
                    ParkedGraduation {
                        event: event.clone(),
                        parked_at: Utc::now(),
                        stale_logged: false,
                    },
                );
                return;
            };
            self.transition(state, LifecyclePhase::Migrating, event.block_time, &event.signature)
        };

        if transitioned {
            info!("🎓 Token migrating: {} (curve {})", mint, event.curve);
            self.db.submit(WriteTask::CurveMapping {
                curve: event.curve.clone(),
                mint: mint.to_string(),
                slot: event.slot,
                complete: true,
            });
            self.persist_token(mint);
        }
    }

    /// Pool creation graduates the mint
    pub fn observe_pool_created(&self, event: &PoolCreatedEvent) {
        let mint = &event.base_mint;

        let (transitioned, curve) = {
            let mut shard = self.shard(mint).write();
            let state = shard.entry(mint.clone()).or_insert_with(|| MintState {
                mint: mint.clone(),
                first_seen_slot: event.slot,
                first_seen_at: event.block_time,
                creator: Some(event.creator.clone()),
                first_program: Program::AmmPool,
                current_program: Program::AmmPool,
                curve: None,
                phases: Vec::new(),
                graduated: false,
                graduation_slot: None,
                graduation_at: None,
                tracked: false,
                threshold_crossed: false,
                threshold_crossed_at: None,
                last_price: None,
                volume: VolumeTracker::new(),
                // announce_mint below flips this once the transition lands
                announced: false,
            });

            let transitioned =
                self.transition(state, LifecyclePhase::Graduated, event.block_time, &event.signature);
            if transitioned {
                state.graduated = true;
                state.graduation_slot = Some(event.slot);
                state.graduation_at = Some(event.block_time);
                state.current_program = Program::AmmPool;
            }
            (transitioned, state.curve.clone())
        };

        if transitioned {
            self.announce_mint(mint);
            info!("🎓 Token graduated: {} -> pool {}", mint, event.pool);
            self.persist_token(mint);
            self.router.queue(IndexerEvent::TokenGraduated {
                mint: mint.clone(),
                curve: curve.unwrap_or_default(),
                slot: event.slot,
                signature: event.signature.clone(),
            });
        }
    }

    /// An AMM trade on a mint still marked bonding means the migration
    /// happened outside our view: graduate it directly.
    pub fn graduate_from_amm_observation(&self, trade: &TradeEvent) {
        if trade.program != Program::AmmPool {
            return;
        }
        let transitioned = {
            let mut shard = self.shard(&trade.mint).write();
            let Some(state) = shard.get_mut(&trade.mint) else {
                return;
            };
            if state.graduated {
                return;
            }
            let transitioned = self.transition(
                state,
                LifecyclePhase::Graduated,
                trade.block_time,
                &trade.signature,
            );
            if transitioned {
                state.graduated = true;
                state.graduation_slot = Some(trade.slot);
                state.graduation_at = Some(trade.block_time);
                state.current_program = Program::AmmPool;
            }
            transitioned
        };
        if transitioned {
            self.announce_mint(&trade.mint);
            info!("🎓 Token graduated via AMM activity: {}", trade.mint);
            self.persist_token(&trade.mint);
            self.router.queue(IndexerEvent::TokenGraduated {
                mint: trade.mint.clone(),
                curve: String::new(),
                slot: trade.slot,
                signature: trade.signature.clone(),
            });
        }
    }

    /// Monotone phase advance; returns false when the move would go
    /// backwards or leave a terminal phase
    fn transition(
        &self,
        state: &mut MintState,
        to: LifecyclePhase,
        at: DateTime<Utc>,
        signature: &str,
    ) -> bool {
        if let Some(current) = state.phases.last() {
            if current.phase.is_terminal() || current.phase.rank() >= to.rank() {
                return false;
            }
        }

        if let Some(current) = state.phases.last_mut() {
            current.ended_at = Some(at);
            self.db.submit(WriteTask::LifecyclePhase {
                mint: state.mint.clone(),
                phase: current.phase.as_str().to_string(),
                started_at: current.started_at,
                ended_at: Some(at),
                signature: current.triggering_signature.clone(),
            });
        }

        state.phases.push(PhaseRecord {
            phase: to,
            started_at: at,
            ended_at: None,
            triggering_signature: Some(signature.to_string()),
        });
        self.db.submit(WriteTask::LifecyclePhase {
            mint: state.mint.clone(),
            phase: to.as_str().to_string(),
            started_at: at,
            ended_at: None,
            signature: Some(signature.to_string()),
        });
        true
    }

    /// Re-check parked graduations against a freshly learned curve
    fn resolve_pending(&self, curve: &str) {
        let parked = self.pending_graduations.lock().remove(curve);
        if let Some(parked) = parked {
            info!("🎓 Parked graduation resolved for curve {}", curve);
            self.observe_graduation(&parked.event);
        }
    }

    /// Surface parked graduations older than the resolution window.
    /// They are logged, never discarded.
    pub fn sweep_pending(&self, resolution_window: std::time::Duration) {
        let now = Utc::now();
        let mut pending = self.pending_graduations.lock();
        for parked in pending.values_mut() {
            let age = now.signed_duration_since(parked.parked_at);
            if age.num_milliseconds() as u128 > resolution_window.as_millis()
                && !parked.stale_logged
            {
                warn!(
                    "🎓 Graduation for curve {} unresolved after {}s",
                    parked.event.curve,
                    age.num_seconds()
                );
                parked.stale_logged = true;
            }
        }
    }

    /// Close out bonding mints that never went anywhere
    pub fn sweep_abandoned(
        &self,
        window: std::time::Duration,
        min_trades: u64,
    ) -> Vec<String> {
        let now = Utc::now();
        let mut abandoned = Vec::new();
        let mut evicted = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write();
            for state in shard.values_mut() {
                if state.current_phase() != Some(LifecyclePhase::Bonding) {
                    continue;
                }
                let age = now.signed_duration_since(state.first_seen_at);
                if age.num_milliseconds() as u128 > window.as_millis()
                    && state.volume.total_trades() < min_trades
                {
                    if !state.announced {
                        // Never persisted: plain cache eviction
                        evicted.push(state.mint.clone());
                    } else if self.transition(state, LifecyclePhase::Abandoned, now, "") {
                        abandoned.push(state.mint.clone());
                    }
                }
            }
        }

        for mint in &evicted {
            self.shard(mint).write().remove(mint);
        }
        for mint in &abandoned {
            debug!("🪦 Token abandoned: {}", mint);
            self.persist_token(mint);
        }
        abandoned
    }

    /// UPSERT the current token record. Durability-layer retry applies;
    /// a failed lifecycle write never drops the trade task, which travels
    /// separately.
    pub fn persist_token(&self, mint: &str) {
        if let Some(row) = self.token_row(mint) {
            self.db.submit(WriteTask::TokenUpsert(row));
        }
    }

    pub fn token_row(&self, mint: &str) -> Option<TokenRow> {
        let state = self.get(mint)?;
        Some(TokenRow {
            mint_address: state.mint.clone(),
            first_seen_slot: state.first_seen_slot,
            first_seen_at: state.first_seen_at,
            creator: state.creator.clone(),
            first_program: state.first_program.as_str().to_string(),
            current_program: state.current_program.as_str().to_string(),
            graduated: state.graduated,
            graduation_slot: state.graduation_slot,
            graduation_at: state.graduation_at,
            peak_market_cap_usd: state.volume.peak_market_cap_usd(),
            total_trades: state.volume.total_trades(),
            volume_24h_usd: Some(state.volume.volume_24h_usd()),
            current_price_sol: state.last_price.map(|p| p.price_sol),
            current_price_usd: state.last_price.and_then(|p| p.price_usd),
            current_mcap_usd: state.last_price.and_then(|p| p.market_cap_usd),
            supply_assumed: state.last_price.map(|p| p.supply_assumed).unwrap_or(true),
            threshold_crossed: state.threshold_crossed,
            threshold_crossed_at: state.threshold_crossed_at,
        })
    }

    /// Cache ceiling maintenance: drop stale untracked mints first
    pub fn prune(&self, ceiling: usize) {
        let total = self.mint_count();
        if total <= ceiling {
            return;
        }
        let mut candidates: Vec<(String, DateTime<Utc>)> = Vec::new();
        for shard in &self.shards {
            for state in shard.read().values() {
                if !state.tracked {
                    candidates.push((state.mint.clone(), state.first_seen_at));
                }
            }
        }
        candidates.sort_by_key(|(_, seen)| *seen);
        let excess = total - ceiling;
        for (mint, _) in candidates.into_iter().take(excess) {
            self.shard(&mint).write().remove(&mint);
        }
    }
}
