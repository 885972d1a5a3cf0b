// src/key_pool/mod.rs

//! In-memory API key pool.
//!
//! The pool owns every credential for the lifetime of the process and hands
//! them out per job. It tracks per-key call counts, a permanent failure set,
//! lease locks for exclusive use, and a rolling one-minute token budget.
//! All state sits behind a single mutex; no operation blocks or performs I/O.

mod lease;
mod slot;
mod stats;

pub use lease::KeyLease;
pub use slot::{preview_key, KeyStatus, QUOTA_WINDOW};
pub use stats::{KeyUsage, UsageStats};

use crate::error::{AppError, Result};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use slot::KeySlot;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_MIN_KEY_LENGTH: usize = 20;
pub const DEFAULT_TOKENS_PER_MINUTE: u64 = 250_000;

/// Identifier of one unit of work, e.g. "the 3rd mock test". Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(NonZeroU64);

impl JobId {
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for JobId {
    type Error = AppError;

    fn try_from(id: u64) -> Result<Self> {
        Self::new(id).ok_or(AppError::InvalidJobId { job_id: id })
    }
}

impl From<NonZeroU64> for JobId {
    fn from(id: NonZeroU64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Entries shorter than this (after trimming) are rejected.
    pub min_key_length: usize,
    /// Per-key token ceiling for one quota window.
    pub tokens_per_minute: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_key_length: DEFAULT_MIN_KEY_LENGTH,
            tokens_per_minute: DEFAULT_TOKENS_PER_MINUTE,
        }
    }
}

/// A key handed to a caller: the secret plus its stable pool index.
#[derive(Debug)]
pub struct KeyAssignment {
    pub key: SecretString,
    pub index: usize,
}

struct PoolState {
    slots: Vec<KeySlot>,
    assignments: HashMap<JobId, usize>,
    /// Jobs whose key failed; they are re-assigned on next lookup.
    orphaned: HashSet<JobId>,
}

impl PoolState {
    fn slot(&self, index: usize) -> Result<&KeySlot> {
        let pool_size = self.slots.len();
        self.slots
            .get(index)
            .ok_or(AppError::UnknownKey { index, pool_size })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut KeySlot> {
        let pool_size = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or(AppError::UnknownKey { index, pool_size })
    }

    fn assignment(&self, index: usize) -> KeyAssignment {
        KeyAssignment {
            key: self.slots[index].secret_copy(),
            index,
        }
    }

    fn healthy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_healthy()).count()
    }

    /// `(job - 1) mod n`, then linear probe for the first healthy key.
    fn assign(&mut self, job: JobId) -> Result<usize> {
        let size = self.slots.len();
        let preferred = ((job.get() - 1) % size as u64) as usize;

        let index = (0..size)
            .map(|offset| (preferred + offset) % size)
            .find(|&idx| self.slots[idx].is_healthy())
            .ok_or(AppError::PoolExhausted)?;

        self.assignments.insert(job, index);
        self.orphaned.remove(&job);
        debug!(
            job_id = job.get(),
            key.index = index,
            key.preferred = preferred,
            api_key.preview = %self.slots[index].preview(),
            "Assigned API key to job"
        );
        Ok(index)
    }

    fn select_available(&self, exclude: Option<usize>) -> Result<usize> {
        let mut busy = false;
        for (idx, slot) in self.slots.iter().enumerate() {
            if Some(idx) == exclude || !slot.is_healthy() {
                continue;
            }
            if slot.locked {
                busy = true;
                continue;
            }
            return Ok(idx);
        }

        if busy {
            Err(AppError::KeysBusy)
        } else {
            Err(AppError::PoolExhausted)
        }
    }
}

pub struct KeyPool {
    state: Mutex<PoolState>,
    options: PoolOptions,
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KeyPool")
            .field("size", &state.slots.len())
            .field("healthy", &state.healthy_count())
            .field("jobs", &state.assignments.len())
            .field("options", &self.options)
            .finish()
    }
}

impl KeyPool {
    /// Builds a pool from raw key strings.
    ///
    /// Entries are trimmed; blank, too-short and duplicate entries are
    /// skipped. Fails with [`AppError::InvalidConfiguration`] when nothing
    /// usable remains.
    #[instrument(skip(raw_keys), name = "key_pool_init")]
    pub fn new<I, S>(raw_keys: I, options: PoolOptions) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Instant::now();
        let mut seen = HashSet::new();
        let mut slots = Vec::new();

        for (position, raw) in raw_keys.into_iter().enumerate() {
            let key = raw.as_ref().trim();
            if key.is_empty() {
                debug!(position, "Skipping blank API key entry");
                continue;
            }
            if key.chars().count() < options.min_key_length {
                warn!(
                    position,
                    api_key.preview = %preview_key(key),
                    min_length = options.min_key_length,
                    "Skipping API key shorter than the minimum length"
                );
                continue;
            }
            if !seen.insert(key.to_string()) {
                warn!(
                    position,
                    api_key.preview = %preview_key(key),
                    "Skipping duplicate API key"
                );
                continue;
            }
            slots.push(KeySlot::new(key.to_string(), now));
        }

        if slots.is_empty() {
            return Err(AppError::invalid_configuration(
                "no usable API keys remain after trimming and validation",
            ));
        }

        info!(
            pool.size = slots.len(),
            tokens_per_minute = options.tokens_per_minute,
            "Key pool initialized"
        );

        Ok(Self {
            state: Mutex::new(PoolState {
                slots,
                assignments: HashMap::new(),
                orphaned: HashSet::new(),
            }),
            options,
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Always false: construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn healthy_count(&self) -> usize {
        self.state.lock().healthy_count()
    }

    pub fn status(&self, index: usize) -> Result<KeyStatus> {
        Ok(self.state.lock().slot(index)?.status())
    }

    /// The key at `index`, without recording or locking anything.
    pub fn key_at(&self, index: usize) -> Result<KeyAssignment> {
        let state = self.state.lock();
        state.slot(index)?;
        Ok(state.assignment(index))
    }

    /// Deterministically picks the job's key and records the mapping.
    pub fn assign_key_to_job(&self, job: JobId) -> Result<KeyAssignment> {
        let mut state = self.state.lock();
        let index = state.assign(job)?;
        Ok(state.assignment(index))
    }

    /// Returns the job's current key, re-assigning if that key has failed.
    pub fn get_key_for_job(&self, job: JobId) -> Result<KeyAssignment> {
        let mut state = self.state.lock();

        let recorded = state.assignments.get(&job).copied();
        let index = match recorded {
            Some(idx) if state.slots[idx].is_healthy() => idx,
            Some(_) => state.assign(job)?,
            None if state.orphaned.contains(&job) => {
                let idx = state.assign(job)?;
                info!(
                    job_id = job.get(),
                    key.index = idx,
                    "Job re-resolved to a healthy API key"
                );
                idx
            }
            None => return Err(AppError::UnknownJob { job_id: job.get() }),
        };

        Ok(state.assignment(index))
    }

    /// First healthy, unleased key in pool order other than `exclude`.
    pub fn get_next_available_key(&self, exclude: Option<usize>) -> Result<KeyAssignment> {
        let state = self.state.lock();
        let index = state.select_available(exclude)?;
        debug!(
            key.index = index,
            key.excluded = exclude,
            "Selected failover API key"
        );
        Ok(state.assignment(index))
    }

    /// Permanently excludes a key, releases its lease and orphans its jobs.
    /// Marking an already failed key again is a no-op.
    pub fn mark_key_failed(&self, index: usize, detail: &str) -> Result<()> {
        let mut state = self.state.lock();

        let slot = state.slot_mut(index)?;
        slot.locked = false;
        if slot.failed {
            debug!(key.index = index, "API key already marked failed");
            return Ok(());
        }
        slot.failed = true;
        slot.failure_detail = Some(detail.to_string());
        let preview = slot.preview().to_string();

        let affected: Vec<JobId> = state
            .assignments
            .iter()
            .filter(|(_, idx)| **idx == index)
            .map(|(job, _)| *job)
            .collect();
        for job in &affected {
            state.assignments.remove(job);
            state.orphaned.insert(*job);
        }

        warn!(
            key.index = index,
            api_key.preview = %preview,
            reason = detail,
            jobs_orphaned = affected.len(),
            healthy_keys = state.healthy_count(),
            "API key marked as failed"
        );
        Ok(())
    }

    /// Counts one completed call. Returns the new total for the key.
    pub fn increment_usage(&self, index: usize) -> Result<u64> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        slot.usage += 1;
        Ok(slot.usage)
    }

    /// Lazily restarts the key's quota window. Returns `true` on reset.
    pub fn reset_window_if_needed(&self, index: usize) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state.slot_mut(index)?.reset_window_if_needed(Instant::now()))
    }

    /// Whether `cost` more tokens fit into the key's current window.
    /// Only the quota budget is considered, not failure or lease state.
    pub fn can_handle(&self, index: usize, estimated_cost: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        slot.reset_window_if_needed(Instant::now());
        Ok(slot.fits(estimated_cost, self.options.tokens_per_minute))
    }

    /// Picks a healthy key for a request of `estimated_cost` tokens.
    ///
    /// Prefers the first key (pool order, skipping `exclude`) with room in
    /// its window. Otherwise falls back to the key whose window started
    /// longest ago, i.e. the one that frees up soonest. The excluded key is
    /// only returned when it is the last healthy key.
    pub fn get_best_key_for_cost(&self, estimated_cost: u64, exclude: Option<usize>) -> Result<usize> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let capacity = self.options.tokens_per_minute;

        for slot in state.slots.iter_mut() {
            slot.reset_window_if_needed(now);
        }

        let candidates = || {
            state
                .slots
                .iter()
                .enumerate()
                .filter(move |(idx, slot)| Some(*idx) != exclude && slot.is_healthy())
        };

        if let Some((idx, _)) = candidates().find(|(_, slot)| slot.fits(estimated_cost, capacity)) {
            return Ok(idx);
        }

        let fallback = candidates()
            .min_by_key(|(_, slot)| slot.window_start)
            .map(|(idx, _)| idx)
            .or_else(|| exclude.filter(|&idx| state.slots.get(idx).is_some_and(|s| s.is_healthy())));

        match fallback {
            Some(idx) => {
                debug!(
                    key.index = idx,
                    estimated_cost,
                    "No key has spare quota; falling back to the soonest window reset"
                );
                Ok(idx)
            }
            None => Err(AppError::PoolExhausted),
        }
    }

    /// Adds a finished call's cost to the key's window. Returns the new total.
    pub fn track_usage(&self, index: usize, actual_cost: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        slot.reset_window_if_needed(Instant::now());
        slot.window_usage = slot.window_usage.saturating_add(actual_cost);
        Ok(slot.window_usage)
    }

    /// Books `estimated_cost` against a healthy key's window if it fits.
    /// Check and booking happen under one lock, so concurrent jobs cannot
    /// both claim the last headroom. Returns `false` when it does not fit
    /// or the key has failed.
    pub fn reserve_usage(&self, index: usize, estimated_cost: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        if !slot.is_healthy() {
            return Ok(false);
        }
        slot.reset_window_if_needed(Instant::now());
        if !slot.admits(estimated_cost, self.options.tokens_per_minute) {
            return Ok(false);
        }
        slot.window_usage = slot.window_usage.saturating_add(estimated_cost);
        Ok(true)
    }

    /// Replaces a reservation with the tokens actually billed (zero when
    /// the call failed). Returns the new window total.
    pub fn settle_usage(&self, index: usize, reserved: u64, actual: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        if !slot.reset_window_if_needed(Instant::now()) {
            slot.window_usage = slot.window_usage.saturating_sub(reserved);
        }
        slot.window_usage = slot.window_usage.saturating_add(actual);
        Ok(slot.window_usage)
    }

    /// Fills the key's window to the ceiling so it is skipped until the
    /// window resets.
    pub fn saturate_window(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        slot.reset_window_if_needed(Instant::now());
        slot.window_usage = slot.window_usage.max(self.options.tokens_per_minute);
        debug!(key.index = index, "Quota window saturated");
        Ok(())
    }

    /// Time until the key's current quota window ends.
    pub fn window_remaining(&self, index: usize) -> Result<Duration> {
        let state = self.state.lock();
        Ok(state.slot(index)?.window_remaining(Instant::now()))
    }

    /// Locks the first available key other than `exclude` for exclusive use.
    pub fn acquire_key(&self, exclude: Option<usize>) -> Result<KeyLease<'_>> {
        let mut state = self.state.lock();
        let index = state.select_available(exclude)?;
        state.slots[index].locked = true;
        Ok(KeyLease::new(self, state.assignment(index)))
    }

    /// Locks the first unleased healthy key other than `exclude` whose
    /// window can absorb `estimated_cost`, and books the cost against it.
    /// `KeysBusy` means some healthy key exists but none is free with room.
    pub fn acquire_key_for_cost(&self, estimated_cost: u64, exclude: Option<usize>) -> Result<KeyLease<'_>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let capacity = self.options.tokens_per_minute;

        let mut busy = false;
        let mut chosen = None;
        for (idx, slot) in state.slots.iter_mut().enumerate() {
            if Some(idx) == exclude || !slot.is_healthy() {
                continue;
            }
            slot.reset_window_if_needed(now);
            if slot.locked || !slot.admits(estimated_cost, capacity) {
                busy = true;
                continue;
            }
            slot.locked = true;
            slot.window_usage = slot.window_usage.saturating_add(estimated_cost);
            chosen = Some(idx);
            break;
        }

        match chosen {
            Some(index) => Ok(KeyLease::new(self, state.assignment(index))),
            None if busy => Err(AppError::KeysBusy),
            None => Err(AppError::PoolExhausted),
        }
    }

    /// The key at `index`, or `KeyFailed` if it has been marked failed.
    pub fn healthy_key_at(&self, index: usize) -> Result<KeyAssignment> {
        let state = self.state.lock();
        if !state.slot(index)?.is_healthy() {
            return Err(AppError::KeyFailed { index });
        }
        Ok(state.assignment(index))
    }

    /// Locks a specific key for exclusive use.
    pub fn lease_key(&self, index: usize) -> Result<KeyLease<'_>> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        if slot.failed {
            return Err(AppError::KeyFailed { index });
        }
        if slot.locked {
            return Err(AppError::KeysBusy);
        }
        slot.locked = true;
        Ok(KeyLease::new(self, state.assignment(index)))
    }

    /// Clears the key's lease. Returns whether it was leased.
    pub fn release_key(&self, index: usize) -> Result<bool> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(index)?;
        Ok(std::mem::replace(&mut slot.locked, false))
    }

    /// Drops the job's assignment. Returns whether the job was known.
    pub fn complete_job(&self, job: JobId) -> bool {
        let mut state = self.state.lock();
        let assigned = state.assignments.remove(&job).is_some();
        let orphaned = state.orphaned.remove(&job);
        assigned || orphaned
    }

    /// Snapshot for progress reporting.
    pub fn stats(&self) -> UsageStats {
        let state = self.state.lock();
        let keys = state
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| KeyUsage {
                index,
                preview: slot.preview().to_string(),
                calls: slot.usage,
                window_tokens: slot.window_usage,
                status: slot.status(),
                failure: slot.failure_detail.clone(),
            })
            .collect();
        UsageStats::from_keys(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> KeyPool {
        let keys: Vec<String> = (0..n).map(|i| format!("AIzaSyTestKey{i:02}-abcdefghijkl")).collect();
        KeyPool::new(keys, PoolOptions::default()).unwrap()
    }

    fn job(id: u64) -> JobId {
        JobId::new(id).unwrap()
    }

    #[test]
    fn job_zero_is_rejected() {
        assert!(JobId::new(0).is_none());
        assert!(matches!(JobId::try_from(0), Err(AppError::InvalidJobId { job_id: 0 })));
        assert_eq!(JobId::try_from(7).unwrap().get(), 7);
    }

    #[test]
    fn orphaned_job_is_reassigned_on_lookup() {
        let pool = pool(3);
        assert_eq!(pool.assign_key_to_job(job(1)).unwrap().index, 0);

        pool.mark_key_failed(0, "quota").unwrap();
        {
            let state = pool.state.lock();
            assert!(!state.assignments.contains_key(&job(1)));
            assert!(state.orphaned.contains(&job(1)));
        }

        assert_eq!(pool.get_key_for_job(job(1)).unwrap().index, 1);
        let state = pool.state.lock();
        assert_eq!(state.assignments.get(&job(1)), Some(&1));
        assert!(state.orphaned.is_empty());
    }

    #[test]
    fn completed_job_becomes_unknown() {
        let pool = pool(2);
        pool.assign_key_to_job(job(4)).unwrap();
        assert!(pool.complete_job(job(4)));
        assert!(!pool.complete_job(job(4)));
        assert!(matches!(
            pool.get_key_for_job(job(4)),
            Err(AppError::UnknownJob { job_id: 4 })
        ));
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let pool = pool(2);
        assert!(matches!(
            pool.increment_usage(5),
            Err(AppError::UnknownKey { index: 5, pool_size: 2 })
        ));
    }

    #[test]
    fn mark_failed_releases_lease() {
        let pool = pool(2);
        let lease = pool.lease_key(1).unwrap();
        assert_eq!(pool.status(1).unwrap(), KeyStatus::Leased);
        pool.mark_key_failed(1, "auth").unwrap();
        assert_eq!(pool.status(1).unwrap(), KeyStatus::Failed);
        drop(lease);
        assert_eq!(pool.status(1).unwrap(), KeyStatus::Failed);
    }
}
