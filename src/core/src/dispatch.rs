//! Per-entry-point routing between the spoofed value and the original.

use crate::location::LocationFix;
use crate::store::CoordinateStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Original path plus override flag for one intercepted entry point.
#[derive(Debug, Default)]
pub struct DispatchEntry {
    original: AtomicUsize,
    overriding: AtomicBool,
}

impl DispatchEntry {
    pub fn original(&self) -> usize {
        self.original.load(Ordering::Acquire)
    }

    pub fn is_overriding(&self) -> bool {
        self.overriding.load(Ordering::Acquire)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Route {
    Spoof(LocationFix),
    /// Call through; `0` when the entry was never bound.
    Original(usize),
}

/// Fixed-size table indexed by the trampolines' compile-time slot numbers.
#[derive(Debug)]
pub struct DispatchTable {
    entries: Box<[DispatchEntry]>,
}

impl DispatchTable {
    pub fn new(len: usize) -> Self {
        Self {
            entries: (0..len).map(|_| DispatchEntry::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&DispatchEntry> {
        self.entries.get(index)
    }

    /// Records the original path and turns the override on.
    pub fn bind(&self, index: usize, original: usize) -> bool {
        let Some(entry) = self.entries.get(index) else {
            return false;
        };

        entry.original.store(original, Ordering::Release);
        entry.overriding.store(true, Ordering::SeqCst);
        true
    }

    pub fn set_override(&self, index: usize, overriding: bool) {
        if let Some(entry) = self.entries.get(index) {
            entry.overriding.store(overriding, Ordering::SeqCst);
        }
    }

    /// Turns every override off; the original paths stay usable.
    pub fn release_all(&self) {
        for entry in self.entries.iter() {
            entry.overriding.store(false, Ordering::SeqCst);
        }
    }
}

/// Looks up, once per intercepted call, where the call should go.
#[derive(Debug, Copy, Clone)]
pub struct Interceptor<'a> {
    store: &'a CoordinateStore,
    table: &'a DispatchTable,
}

impl<'a> Interceptor<'a> {
    pub fn new(store: &'a CoordinateStore, table: &'a DispatchTable) -> Self {
        Self { store, table }
    }

    pub fn route(&self, index: usize) -> Route {
        let Some(entry) = self.table.entry(index) else {
            return Route::Original(0);
        };

        if entry.is_overriding() {
            let (fix, enabled) = self.store.read();
            if enabled {
                return Route::Spoof(fix);
            }
        }

        Route::Original(entry.original())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LATITUDE: usize = 0;
    const LONGITUDE: usize = 1;

    #[test]
    fn disabled_store_routes_to_original() {
        let store = CoordinateStore::new();
        let table = DispatchTable::new(2);
        table.bind(LATITUDE, 0xa000);
        store.update(LocationFix::new(48.85, 2.29)).unwrap();

        let interceptor = Interceptor::new(&store, &table);
        assert_eq!(interceptor.route(LATITUDE), Route::Original(0xa000));

        store.set_enabled(true);
        assert!(matches!(interceptor.route(LATITUDE), Route::Spoof(fix) if fix.latitude == 48.85));
    }

    #[test]
    fn cleared_override_routes_to_original() {
        let store = CoordinateStore::new();
        store.apply(LocationFix::new(1.0, 2.0), true).unwrap();

        let table = DispatchTable::new(2);
        table.bind(LATITUDE, 0xa000);
        table.bind(LONGITUDE, 0xb000);
        table.set_override(LONGITUDE, false);

        let interceptor = Interceptor::new(&store, &table);
        assert!(matches!(interceptor.route(LATITUDE), Route::Spoof(_)));
        assert_eq!(interceptor.route(LONGITUDE), Route::Original(0xb000));

        table.release_all();
        assert_eq!(interceptor.route(LATITUDE), Route::Original(0xa000));
    }

    #[test]
    fn unbound_and_out_of_range_entries() {
        let store = CoordinateStore::new();
        store.apply(LocationFix::new(1.0, 2.0), true).unwrap();
        let table = DispatchTable::new(1);
        let interceptor = Interceptor::new(&store, &table);

        assert_eq!(interceptor.route(0), Route::Original(0));
        assert_eq!(interceptor.route(7), Route::Original(0));
        assert!(!table.bind(7, 0x1));
    }

    #[test]
    fn interceptor_debug_shows_live_state() {
        let store = CoordinateStore::new();
        store.apply(LocationFix::new(12.5, 3.0), true).unwrap();
        let table = DispatchTable::new(1);

        let rendered = format!("{:?}", Interceptor::new(&store, &table));
        assert!(rendered.starts_with("Interceptor"));
        assert!(rendered.contains("latitude: 12.5"));
        assert!(rendered.contains("enabled: true"));
    }
}
