//! Time-bounded, single-use challenge registry
//!
//! Records live in a sharded concurrent map so unrelated code ids never
//! contend on one lock. Each record carries an atomic status byte; every
//! transition out of `PENDING` is a compare-and-swap, which is what makes
//! redemption linearizable per code id.
//!
//! Status transitions:
//! - PENDING → CLAIMED (a redemption is evaluating its proofs)
//! - CLAIMED → PENDING (proof rejected or attempt abandoned; retryable until TTL)
//! - CLAIMED → RETIRED (proof accepted; record consumed and removed)
//! - PENDING → RETIRED (expired or evicted; record removed)
//!
//! Callers only ever see "pending and yours" or `ChallengeNotFound`.
//!
//! Code ids are also queued in arrival order. Every record shares one TTL,
//! so the front of that queue is both the oldest and the first to expire;
//! capacity handling pops from the front instead of scanning the map. The
//! queue lock is taken by registration and capacity handling only, never by
//! `claim` or `consume`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codegen::{CodeGenerator, RandomCodeGenerator, validate_challenge};
use crate::error::{Error, Result};
use crate::method::{ChallengeMethod, ExchangeType};

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
/// Terminal: consumed, expired or evicted.
const RETIRED: u8 = 2;

/// Longest accepted `client_id`.
pub const MAX_CLIENT_ID_LEN: usize = 255;

/// A registered challenge, as handed out by [`ChallengeRegistry::consume`]
/// and [`Claim::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub code_id: String,
    pub client_id: String,
    pub code_challenge: String,
    pub code_challenge_method: ChallengeMethod,
    pub requested_exchange_type: ExchangeType,
    pub created_at: Instant,
    pub expires_at: Instant,
}

/// Input to [`ChallengeRegistry::register`].
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub client_id: String,
    pub code_challenge: String,
    pub code_challenge_method: ChallengeMethod,
    pub requested_exchange_type: ExchangeType,
}

/// What to do when a registration arrives and the registry is full of live records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Fail the new registration with a retryable internal error.
    #[default]
    Reject,
    /// Drop the oldest unclaimed pending record to make room.
    EvictOldest,
}

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Lifetime of a pending record.
    pub ttl: Duration,
    /// Soft cap on stored records; concurrent registrations may overshoot briefly.
    pub max_pending: usize,
    pub eviction: EvictionPolicy,
    pub enabled_methods: Vec<ChallengeMethod>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_pending: 100_000,
            eviction: EvictionPolicy::Reject,
            enabled_methods: ChallengeMethod::ALL.to_vec(),
        }
    }
}

struct Slot {
    record: ChallengeRecord,
    state: AtomicU8,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.record.expires_at
    }

    /// PENDING → RETIRED. Fails if a redemption currently holds the record.
    fn retire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Owner and single writer of all pending challenges.
///
/// Shared as `Arc<ChallengeRegistry>`; there is no other access path to the
/// stored records.
pub struct ChallengeRegistry {
    slots: DashMap<String, Arc<Slot>>,
    /// Code ids oldest first. May hold ids already consumed; those are
    /// skipped when popped and pruned by the sweep.
    arrivals: Mutex<VecDeque<String>>,
    settings: RegistrySettings,
    generator: Box<dyn CodeGenerator>,
}

impl ChallengeRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self::with_generator(settings, Box::new(RandomCodeGenerator))
    }

    pub fn with_generator(settings: RegistrySettings, generator: Box<dyn CodeGenerator>) -> Self {
        info!(
            ttl_secs = settings.ttl.as_secs(),
            max_pending = settings.max_pending,
            eviction = ?settings.eviction,
            "challenge registry initialized"
        );
        Self {
            slots: DashMap::new(),
            arrivals: Mutex::new(VecDeque::new()),
            settings,
            generator,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Validate and store a new pending challenge, returning its code id.
    ///
    /// A generated id that collides with a live record fails with
    /// `Error::Internal` (retryable); the live record is left untouched.
    pub fn register(&self, request: RegistrationRequest) -> Result<String> {
        self.validate(&request)?;
        self.ensure_capacity()?;

        let code_id = self.generator.generate();
        let now = Instant::now();
        let client_id = request.client_id;
        let method = request.code_challenge_method;
        let exchange_type = request.requested_exchange_type;

        match self.slots.entry(code_id.clone()) {
            Entry::Occupied(_) => {
                warn!(client_id = %client_id, "generated code id collided with a live challenge");
                return Err(Error::Internal(
                    "code id collision, retry registration".into(),
                ));
            }
            Entry::Vacant(vacant) => {
                debug!(client_id = %client_id, %method, %exchange_type, "challenge registered");
                vacant.insert(Arc::new(Slot {
                    record: ChallengeRecord {
                        code_id: code_id.clone(),
                        client_id,
                        code_challenge: request.code_challenge,
                        code_challenge_method: method,
                        requested_exchange_type: exchange_type,
                        created_at: now,
                        expires_at: now + self.settings.ttl,
                    },
                    state: AtomicU8::new(PENDING),
                }));
            }
        }
        // Queued after the map entry is released: the queue lock is always
        // taken before any map shard lock.
        self.arrivals().push_back(code_id.clone());
        Ok(code_id)
    }

    /// Take exclusive hold of a pending, unexpired record.
    ///
    /// The returned [`Claim`] either commits (record consumed and removed) or,
    /// when dropped uncommitted, puts the record back to pending. While a claim
    /// is held, every other `claim`/`consume` of the same id sees
    /// `ChallengeNotFound`.
    pub fn claim(&self, code_id: &str) -> Result<Claim<'_>> {
        let slot = self
            .slots
            .get(code_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::ChallengeNotFound)?;

        if slot.is_expired(Instant::now()) {
            // Lazy reclamation; a concurrent holder keeps it alive until release.
            self.slots
                .remove_if(code_id, |_, stored| Arc::ptr_eq(stored, &slot) && stored.retire());
            debug!(client_id = %slot.record.client_id, "challenge expired before redemption");
            return Err(Error::ChallengeNotFound);
        }

        slot.state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ChallengeNotFound)?;

        Ok(Claim {
            registry: self,
            slot,
            settled: false,
        })
    }

    /// Atomically transition a pending record to consumed and return it.
    ///
    /// Absent, expired, consumed and currently-claimed ids are all
    /// `ChallengeNotFound`. Under concurrent calls for one id, exactly one
    /// succeeds.
    pub fn consume(&self, code_id: &str) -> Result<ChallengeRecord> {
        Ok(self.claim(code_id)?.commit())
    }

    /// Remove every expired record not currently held by a redemption.
    ///
    /// Returns the number of records removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        self.slots.retain(|_, slot| {
            if slot.is_expired(now) && slot.retire() {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.arrivals()
            .retain(|code_id| self.slots.contains_key(code_id));
        if removed > 0 {
            debug!(removed, remaining = self.slots.len(), "swept expired challenges");
        }
        removed
    }

    /// Number of stored records (pending or claimed, expired ones not yet swept).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn validate(&self, request: &RegistrationRequest) -> Result<()> {
        if request.client_id.is_empty() || request.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::InvalidRequest(format!(
                "client_id must be 1-{MAX_CLIENT_ID_LEN} characters"
            )));
        }
        if !self
            .settings
            .enabled_methods
            .contains(&request.code_challenge_method)
        {
            return Err(Error::InvalidRequest(format!(
                "code_challenge_method {} is not enabled",
                request.code_challenge_method
            )));
        }
        if request.requested_exchange_type.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one exchange type must be requested".into(),
            ));
        }
        validate_challenge(&request.code_challenge, request.code_challenge_method)
    }

    fn ensure_capacity(&self) -> Result<()> {
        if self.slots.len() < self.settings.max_pending {
            return Ok(());
        }
        self.reclaim_expired_front();
        if self.slots.len() < self.settings.max_pending {
            return Ok(());
        }

        match self.settings.eviction {
            EvictionPolicy::Reject => {
                warn!(
                    max_pending = self.settings.max_pending,
                    "challenge registry full, rejecting registration"
                );
                Err(Error::Internal("challenge registry at capacity".into()))
            }
            EvictionPolicy::EvictOldest => {
                if self.evict_oldest() {
                    Ok(())
                } else {
                    Err(Error::Internal(
                        "challenge registry at capacity, nothing evictable".into(),
                    ))
                }
            }
        }
    }

    fn arrivals(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.arrivals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stored(&self, code_id: &str) -> Option<Arc<Slot>> {
        self.slots.get(code_id).map(|entry| Arc::clone(entry.value()))
    }

    /// PENDING → RETIRED and remove. Fails while a redemption holds the slot.
    fn retire_and_remove(&self, code_id: &str, slot: &Arc<Slot>) -> bool {
        self.slots
            .remove_if(code_id, |_, stored| Arc::ptr_eq(stored, slot) && stored.retire())
            .is_some()
    }

    /// Remove expired records from the front of the arrival queue, stopping
    /// at the first live one. Held records keep their place in the queue.
    fn reclaim_expired_front(&self) -> usize {
        let now = Instant::now();
        let mut arrivals = self.arrivals();
        let mut held = Vec::new();
        let mut removed = 0usize;

        while let Some(code_id) = arrivals.pop_front() {
            let Some(slot) = self.stored(&code_id) else {
                continue;
            };
            if !slot.is_expired(now) {
                arrivals.push_front(code_id);
                break;
            }
            if self.retire_and_remove(&code_id, &slot) {
                removed += 1;
            } else {
                held.push(code_id);
            }
        }
        for code_id in held.into_iter().rev() {
            arrivals.push_front(code_id);
        }

        if removed > 0 {
            debug!(removed, "reclaimed expired challenges at capacity");
        }
        removed
    }

    /// Remove the oldest record not held by a redemption.
    fn evict_oldest(&self) -> bool {
        let mut arrivals = self.arrivals();
        let mut held = Vec::new();
        let mut evicted = false;

        while let Some(code_id) = arrivals.pop_front() {
            let Some(slot) = self.stored(&code_id) else {
                continue;
            };
            if self.retire_and_remove(&code_id, &slot) {
                evicted = true;
                break;
            }
            held.push(code_id);
        }
        for code_id in held.into_iter().rev() {
            arrivals.push_front(code_id);
        }

        if evicted {
            info!("evicted oldest pending challenge to make room");
        }
        evicted
    }
}

impl fmt::Debug for ChallengeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeRegistry")
            .field("records", &self.slots.len())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Exclusive hold on one pending record during a redemption attempt.
///
/// Dropping the claim without calling [`Claim::commit`] returns the record to
/// pending, so an abandoned or cancelled redemption never burns the code.
pub struct Claim<'a> {
    registry: &'a ChallengeRegistry,
    slot: Arc<Slot>,
    settled: bool,
}

impl Claim<'_> {
    pub fn record(&self) -> &ChallengeRecord {
        &self.slot.record
    }

    /// Consume the record: terminal, removed from the registry.
    pub fn commit(mut self) -> ChallengeRecord {
        self.settled = true;
        self.slot.state.store(RETIRED, Ordering::Release);
        self.registry
            .slots
            .remove_if(self.slot.record.code_id.as_str(), |_, stored| {
                Arc::ptr_eq(stored, &self.slot)
            });
        self.slot.record.clone()
    }

    /// Give the record back; it stays redeemable until its TTL.
    pub fn release(self) {}
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.slot.state.store(PENDING, Ordering::Release);
        }
    }
}

impl fmt::Debug for Claim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("client_id", &self.slot.record.client_id)
            .field("settled", &self.settled)
            .finish()
    }
}
