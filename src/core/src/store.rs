//! Process-wide holder of the active spoofed location.
//!
//! Two slots of atomic words, each guarded by its own sequence counter. The
//! writer always fills the slot that is *not* live and then flips the
//! generation, so readers on the hot path never wait for a writer and never
//! see a mix of two fixes.

use crate::error::Result;
use crate::location::{LocationFix, Provider};
use log::warn;
use parking_lot::Mutex;
use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering, fence};

const WORDS: usize = 10;

#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct CoordinateState {
    pub fix: LocationFix,
    pub enabled: bool,
    pub generation: u64,
}

impl CoordinateState {
    fn encode(&self) -> [u64; WORDS] {
        let fix = &self.fix;
        [
            fix.latitude.to_bits(),
            fix.longitude.to_bits(),
            fix.altitude.to_bits(),
            fix.accuracy.to_bits() as u64,
            fix.bearing.to_bits() as u64,
            fix.speed.to_bits() as u64,
            fix.timestamp_ns,
            fix.provider as u64,
            self.enabled as u64,
            self.generation,
        ]
    }

    fn decode(words: &[u64; WORDS]) -> Self {
        Self {
            fix: LocationFix {
                latitude: f64::from_bits(words[0]),
                longitude: f64::from_bits(words[1]),
                altitude: f64::from_bits(words[2]),
                accuracy: f32::from_bits(words[3] as u32),
                bearing: f32::from_bits(words[4] as u32),
                speed: f32::from_bits(words[5] as u32),
                timestamp_ns: words[6],
                provider: Provider::from_repr(words[7] as u32).unwrap_or_default(),
            },
            enabled: words[8] != 0,
            generation: words[9],
        }
    }
}

#[derive(Default)]
struct Slot {
    seq: AtomicU64,
    words: [AtomicU64; WORDS],
}

impl Slot {
    fn load(&self) -> Option<[u64; WORDS]> {
        let before = self.seq.load(Ordering::Acquire);
        if before & 1 == 1 {
            return None;
        }

        let mut words = [0u64; WORDS];
        for (word, cell) in words.iter_mut().zip(&self.words) {
            *word = cell.load(Ordering::Relaxed);
        }

        fence(Ordering::Acquire);

        (self.seq.load(Ordering::Relaxed) == before).then_some(words)
    }

    fn store(&self, words: &[u64; WORDS]) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        for (cell, word) in self.words.iter().zip(words) {
            cell.store(*word, Ordering::Relaxed);
        }

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}

pub struct CoordinateStore {
    generation: AtomicU64,
    slots: [Slot; 2],
    writer: Mutex<()>,
    rejected: AtomicU64,
}

impl fmt::Debug for CoordinateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinateStore")
            .field("state", &self.snapshot())
            .field("rejected", &self.rejected_count())
            .finish()
    }
}

impl Default for CoordinateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinateStore {
    /// Starts disabled, i.e. every hook passes through.
    pub fn new() -> Self {
        let store = Self {
            generation: AtomicU64::new(0),
            slots: Default::default(),
            writer: Mutex::new(()),
            rejected: AtomicU64::new(0),
        };

        store.slots[0].store(&CoordinateState::default().encode());
        store
    }

    /// Wait-free unless a writer is mid-way through the same slot, which
    /// needs two updates to land during one read.
    pub fn snapshot(&self) -> CoordinateState {
        loop {
            let generation = self.generation.load(Ordering::Acquire);

            if let Some(words) = self.slots[(generation & 1) as usize].load() {
                return CoordinateState::decode(&words);
            }

            hint::spin_loop();
        }
    }

    pub fn read(&self) -> (LocationFix, bool) {
        let state = self.snapshot();
        (state.fix, state.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.snapshot().enabled
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replaces the fix, keeping the enabled flag. Invalid fixes leave the
    /// store untouched.
    pub fn update(&self, fix: LocationFix) -> Result<u64> {
        let fix = self.accept(fix)?;
        Ok(self.publish(|state| state.fix = fix))
    }

    pub fn set_enabled(&self, enabled: bool) -> u64 {
        self.publish(|state| state.enabled = enabled)
    }

    /// Replaces the fix and the flag in one publication.
    pub fn apply(&self, fix: LocationFix, enabled: bool) -> Result<u64> {
        let fix = self.accept(fix)?;
        Ok(self.publish(|state| {
            state.fix = fix;
            state.enabled = enabled;
        }))
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn accept(&self, fix: LocationFix) -> Result<LocationFix> {
        fix.validated().inspect_err(|err| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("store kept previous fix: {err}");
        })
    }

    fn publish<F: FnOnce(&mut CoordinateState)>(&self, mutate: F) -> u64 {
        let _guard = self.writer.lock();

        let current = self.generation.load(Ordering::Relaxed);
        // only this writer stores into slots, so the live one is stable here
        let mut state = self.slots[(current & 1) as usize]
            .load()
            .map(|words| CoordinateState::decode(&words))
            .unwrap_or_default();

        mutate(&mut state);

        let next = current.wrapping_add(1);
        state.generation = next;

        self.slots[(next & 1) as usize].store(&state.encode());
        self.generation.store(next, Ordering::Release);

        next
    }
}
