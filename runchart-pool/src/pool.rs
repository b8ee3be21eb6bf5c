//! Bounded runner pool.
//!
//! A [`RunnerPool`] owns a fixed number of [`Runner`]s and multiplexes them
//! over any number of machines, each identified by a [`MachineKey`]. A
//! machine is *resident* while a runner holds it; otherwise it lives in the
//! [`MachineStore`] as an encoded dump.
//!
//! Runners are handed out as [`PooledRunner`] guards and go back to their
//! slot on drop. Selection, eviction and flushing all happen under one lock,
//! and a checked-out runner is never selected, so a machine cannot be
//! evicted in the middle of a transition.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::store::MachineStore;
use parking_lot::Mutex;
use runchart_core::codec;
use runchart_core::{FlushError, FlushHook, Format, Runner, StateChart};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Identity of a logical machine: who owns it and which chart it runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineKey {
    pub owner: String,
    pub chart_type: String,
}

impl MachineKey {
    pub fn new(owner: impl Into<String>, chart_type: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            chart_type: chart_type.into(),
        }
    }

    /// Key of a chart, `None` if it has no owner.
    pub fn of(chart: &StateChart) -> Option<Self> {
        chart.owner().map(|owner| Self::new(owner, chart.name()))
    }
}

impl fmt::Display for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.chart_type)
    }
}

struct Slot {
    /// `None` while checked out.
    runner: Option<Runner>,
    /// Machine resident in this slot.
    key: Option<MachineKey>,
    last_used: u64,
}

impl Slot {
    fn idle_runner(&self) -> Option<&Runner> {
        self.runner.as_ref()
    }
}

struct Inner {
    slots: Vec<Slot>,
    templates: HashMap<String, StateChart>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn resident(&self, key: &MachineKey) -> Option<usize> {
        self.slots.iter().position(|s| s.key.as_ref() == Some(key))
    }

    /// Idle slot not serving `key`: unloaded first, then least recently used.
    fn eviction_candidate(&self, key: &MachineKey) -> Option<usize> {
        let mut lru: Option<(usize, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(runner) = slot.idle_runner() else {
                continue;
            };
            if slot.key.as_ref() == Some(key) {
                continue;
            }
            if !runner.is_loaded() {
                return Some(i);
            }
            if lru.map_or(true, |(_, used)| slot.last_used < used) {
                lru = Some((i, slot.last_used));
            }
        }
        lru.map(|(i, _)| i)
    }
}

/// Fixed-capacity set of runners shared by many machines.
pub struct RunnerPool {
    inner: Mutex<Inner>,
    store: Arc<dyn MachineStore>,
    config: PoolConfig,
}

impl RunnerPool {
    /// Creates a pool of `config.capacity` runners built by `factory`.
    pub fn new<F>(config: PoolConfig, store: Arc<dyn MachineStore>, mut factory: F) -> Self
    where
        F: FnMut() -> Runner,
    {
        let slots = (0..config.capacity)
            .map(|_| Slot {
                runner: Some(factory()),
                key: None,
                last_used: 0,
            })
            .collect();

        tracing::info!(
            "Created runner pool with {} runners (flush_on_release={}, autosave={})",
            config.capacity,
            config.flush_on_release,
            config.autosave
        );

        Self {
            inner: Mutex::new(Inner {
                slots,
                templates: HashMap::new(),
                clock: 0,
            }),
            store,
            config,
        }
    }

    /// Registers the template used for machines of `chart.name()` that have
    /// never been persisted.
    pub fn register_chart(&self, chart: StateChart) {
        tracing::debug!("Registered chart template {} ({})", chart.name(), chart.id());
        self.inner
            .lock()
            .templates
            .insert(chart.name().to_string(), chart);
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MachineStore> {
        &self.store
    }

    /// Keys of the machines currently held by a runner, sorted.
    pub fn resident_keys(&self) -> Vec<MachineKey> {
        let inner = self.inner.lock();
        let mut keys: Vec<MachineKey> = inner.slots.iter().filter_map(|s| s.key.clone()).collect();
        keys.sort();
        keys
    }

    /// An idle runner with nothing loaded.
    pub fn acquire_free(&self) -> Option<PooledRunner<'_>> {
        let mut inner = self.inner.lock();
        let idx = inner
            .slots
            .iter()
            .position(|s| s.idle_runner().is_some_and(|r| !r.is_loaded()))?;
        self.check_out(&mut inner, idx)
    }

    /// The idle runner holding `key`, if it is loaded and started.
    pub fn acquire_current(&self, key: &MachineKey) -> Result<Option<PooledRunner<'_>>, PoolError> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.resident(key) else {
            return Ok(None);
        };
        let started = match inner.slots[idx].idle_runner() {
            None => return Err(PoolError::Busy(key.clone())),
            Some(runner) => runner.is_started(),
        };
        if !started {
            return Ok(None);
        }
        Ok(self.check_out(&mut inner, idx))
    }

    /// An idle runner not serving `key`, emptied for reuse.
    ///
    /// Its previous machine, if any, is written to the store before the
    /// runner is cleared.
    pub fn acquire_for_eviction(&self, key: &MachineKey) -> Result<PooledRunner<'_>, PoolError> {
        let mut inner = self.inner.lock();
        let idx = inner.eviction_candidate(key).ok_or(PoolError::Exhausted {
            capacity: self.config.capacity,
        })?;
        self.evict(&mut inner, idx)?;
        self.check_out(&mut inner, idx).ok_or(PoolError::Exhausted {
            capacity: self.config.capacity,
        })
    }

    /// The runner for `key`, loading the machine if it is not resident.
    ///
    /// The machine comes from the store if it was persisted, otherwise it is
    /// a fresh copy of the registered template owned by `key.owner`.
    pub fn acquire_current_or_load(&self, key: &MachineKey) -> Result<PooledRunner<'_>, PoolError> {
        let mut inner = self.inner.lock();
        let exhausted = PoolError::Exhausted {
            capacity: self.config.capacity,
        };

        if let Some(idx) = inner.resident(key) {
            if inner.slots[idx].idle_runner().is_none() {
                return Err(PoolError::Busy(key.clone()));
            }
            return self.check_out(&mut inner, idx).ok_or(exhausted);
        }

        let idx = inner.eviction_candidate(key).ok_or(exhausted)?;

        let (chart, restored) = match self.store.load(key)? {
            Some(data) => {
                let chart = codec::decode(&data)?;
                if MachineKey::of(&chart).as_ref() != Some(key) {
                    return Err(PoolError::Corruption(format!(
                        "stored machine {} holds chart {:?} owned by {:?}",
                        key,
                        chart.name(),
                        chart.owner()
                    )));
                }
                (chart, true)
            }
            None => {
                let template = inner
                    .templates
                    .get(&key.chart_type)
                    .ok_or_else(|| PoolError::UnknownChartType(key.chart_type.clone()))?;
                let mut chart = template.clone();
                chart.set_owner(key.owner.clone());
                (chart, false)
            }
        };

        self.evict(&mut inner, idx)?;

        let autosave = self.config.autosave.then(|| self.autosave_hook(key));
        let slot = &mut inner.slots[idx];
        let runner = slot.runner.as_mut().ok_or(PoolError::Exhausted {
            capacity: self.config.capacity,
        })?;
        runner.load(chart)?;
        if let Some(hook) = autosave {
            runner.set_flush_hook(hook);
        }
        slot.key = Some(key.clone());

        tracing::info!(
            "Loaded machine {} into slot {} ({})",
            key,
            idx,
            if restored { "restored" } else { "new" }
        );

        self.check_out(&mut inner, idx).ok_or(PoolError::Exhausted {
            capacity: self.config.capacity,
        })
    }

    /// Writes every idle resident machine to the store.
    ///
    /// Returns the number of machines written.
    pub fn flush_all(&self) -> Result<usize, PoolError> {
        let inner = self.inner.lock();
        let mut flushed = 0;
        for slot in &inner.slots {
            if let (Some(runner), Some(key)) = (&slot.runner, &slot.key) {
                if runner.is_loaded() {
                    self.persist(key, runner)?;
                    flushed += 1;
                }
            }
        }
        tracing::debug!("Flushed {} machines", flushed);
        Ok(flushed)
    }

    fn check_out(&self, inner: &mut Inner, idx: usize) -> Option<PooledRunner<'_>> {
        let now = inner.tick();
        let slot = &mut inner.slots[idx];
        let runner = slot.runner.take()?;
        slot.last_used = now;
        tracing::debug!("Checked out slot {} ({:?})", idx, slot.key);
        Some(PooledRunner {
            pool: self,
            slot: idx,
            key: slot.key.clone(),
            runner,
        })
    }

    /// Persists and clears the machine held by an idle slot.
    fn evict(&self, inner: &mut Inner, idx: usize) -> Result<(), PoolError> {
        let slot = &mut inner.slots[idx];
        let Some(runner) = slot.runner.as_mut() else {
            return Ok(());
        };
        if runner.is_loaded() {
            if let Some(key) = &slot.key {
                self.persist(key, runner)?;
                tracing::info!("Evicted machine {} from slot {}", key, idx);
            }
        }
        runner.clear();
        runner.clear_flush_hook();
        slot.key = None;
        Ok(())
    }

    /// Returns a runner to its slot.
    ///
    /// The slot keeps the key it was checked out with while the runner holds
    /// that machine. A runner loaded with another machine is keyed by it
    /// instead and its autosave hook follows the new key.
    fn release(&self, idx: usize, checked_out: Option<MachineKey>, mut runner: Runner) {
        let mut inner = self.inner.lock();
        let key = runner.chart().and_then(MachineKey::of);

        let key = if key == checked_out {
            key
        } else {
            runner.clear_flush_hook();
            match key {
                Some(key) if inner.resident(&key).is_some_and(|other| other != idx) => {
                    tracing::warn!(
                        "Machine {} is already resident, discarding the copy in slot {}",
                        key,
                        idx
                    );
                    runner.clear();
                    None
                }
                Some(key) => {
                    if self.config.autosave {
                        runner.set_flush_hook(self.autosave_hook(&key));
                    }
                    Some(key)
                }
                None => None,
            }
        };

        if self.config.flush_on_release {
            if let Some(key) = &key {
                if let Err(e) = self.persist(key, &runner) {
                    tracing::warn!("Failed to flush machine {} on release: {}", key, e);
                }
            }
        }

        let now = inner.tick();
        let slot = &mut inner.slots[idx];
        slot.key = key;
        slot.last_used = now;
        slot.runner = Some(runner);
    }

    fn persist(&self, key: &MachineKey, runner: &Runner) -> Result<(), PoolError> {
        let data = runner.dump(Format::Binary)?;
        self.store.save(key, &data)
    }

    fn autosave_hook(&self, key: &MachineKey) -> FlushHook {
        let store = self.store.clone();
        let key = key.clone();
        Arc::new(move |chart: &StateChart| -> Result<(), FlushError> {
            let data = codec::encode(chart, Format::Binary)?;
            store.save(&key, &data)?;
            Ok(())
        })
    }
}

impl fmt::Debug for RunnerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerPool")
            .field("config", &self.config)
            .field("resident", &self.resident_keys())
            .finish()
    }
}

/// A runner checked out of a [`RunnerPool`].
///
/// Dereferences to the [`Runner`]. Dropping the guard returns the runner to
/// its slot, flushing it first when the pool is configured to.
pub struct PooledRunner<'a> {
    pool: &'a RunnerPool,
    slot: usize,
    key: Option<MachineKey>,
    runner: Runner,
}

impl PooledRunner<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Machine the runner held when it was checked out.
    pub fn key(&self) -> Option<&MachineKey> {
        self.key.as_ref()
    }
}

impl Deref for PooledRunner<'_> {
    type Target = Runner;

    fn deref(&self) -> &Runner {
        &self.runner
    }
}

impl DerefMut for PooledRunner<'_> {
    fn deref_mut(&mut self) -> &mut Runner {
        &mut self.runner
    }
}

impl Drop for PooledRunner<'_> {
    fn drop(&mut self) {
        let runner = std::mem::take(&mut self.runner);
        self.pool.release(self.slot, self.key.take(), runner);
    }
}

impl fmt::Debug for PooledRunner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledRunner")
            .field("slot", &self.slot)
            .field("key", &self.key)
            .field("runner", &self.runner)
            .finish()
    }
}
