use super::*;
use std::collections::HashSet;

#[derive(Default)]
struct FakeLibraries {
    loaded: Mutex<HashSet<String>>,
    symbols: Mutex<HashMap<(String, String), usize>>,
}

impl FakeLibraries {
    fn load(&self, library: &str, symbols: &[(&str, usize)]) {
        self.loaded.lock().insert(library.into());

        let mut table = self.symbols.lock();
        for (symbol, address) in symbols {
            table.insert((library.into(), (*symbol).into()), *address);
        }
    }
}

impl NativeLookup for Arc<FakeLibraries> {
    fn is_loaded(&self, library: &str) -> bool {
        self.loaded.lock().contains(library)
    }

    fn lookup(&self, library: &str, symbol: &str) -> Option<usize> {
        self.symbols.lock().get(&(library.into(), symbol.into())).copied()
    }
}

struct FakeMethods;

impl MethodLookup for FakeMethods {
    fn lookup_method(&self, class: &str, method: &str, signature: &str, is_static: bool) -> Option<usize> {
        match (class, method, signature, is_static) {
            ("android/location/Location", "getLatitude", "()D", false) => Some(0x7000_1000),
            _ => None,
        }
    }
}

fn resolver() -> (Arc<FakeLibraries>, SymbolResolver<Arc<FakeLibraries>>) {
    let libraries = Arc::new(FakeLibraries::default());
    let resolver = SymbolResolver::new(libraries.clone()).with_retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    });

    (libraries, resolver)
}

#[test]
fn resolves_loaded_native_symbol() {
    let (libraries, resolver) = resolver();
    libraries.load("libgnss.so", &[("gnss_vtable", 0x5000)]);

    let descriptor = SymbolDescriptor::native("libgnss.so", "gnss_vtable").with_slot_offset(0x18);
    let handle = resolver.resolve(&descriptor, None).handle().unwrap();

    assert_eq!(handle.address(), 0x5018);
    assert_eq!(handle.kind(), HandleKind::Slot);
    assert_eq!(handle.abi(), Abi::current());
    assert_eq!(handle.descriptor().to_string(), "libgnss.so!gnss_vtable+0x18");
}

#[test]
fn same_descriptor_yields_same_handle() {
    let (libraries, resolver) = resolver();
    libraries.load("libgnss.so", &[("gnss_vtable", 0x5000)]);

    let descriptor = SymbolDescriptor::native("libgnss.so", "gnss_vtable");
    let first = resolver.resolve(&descriptor, None).handle().unwrap();
    let second = resolver.resolve(&descriptor, None).handle().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.id(), second.id());
}

#[test]
fn failures_are_per_descriptor() {
    let (libraries, resolver) = resolver();
    libraries.load("libgnss.so", &[("gnss_vtable", 0x5000)]);

    let descriptors = [
        SymbolDescriptor::native("libgnss.so", "missing"),
        SymbolDescriptor::native("libgnss.so", "gnss_vtable"),
        SymbolDescriptor::managed("android/location/Location", "getFoo", "()D"),
        SymbolDescriptor::managed("android/location/Location", "getLatitude", "()D"),
    ];

    let results: Vec<_> = descriptors
        .iter()
        .map(|descriptor| resolver.resolve(descriptor, Some(&FakeMethods)))
        .collect();

    assert!(matches!(results[0], Resolution::Failed(Error::Resolution { .. })));
    assert!(matches!(results[1], Resolution::Resolved(_)));
    assert!(matches!(results[2], Resolution::Failed(Error::Resolution { .. })));
    assert!(matches!(results[3], Resolution::Resolved(_)));
}

#[test]
fn managed_handles_carry_the_art_layout() {
    let (_, resolver) = resolver();
    let resolver = resolver.with_art_layout(ArtLayout::Legacy);

    let descriptor = SymbolDescriptor::managed("android/location/Location", "getLatitude", "()D");
    let handle = resolver.resolve(&descriptor, Some(&FakeMethods)).handle().unwrap();

    assert_eq!(handle.address(), 0x7000_1000);
    assert_eq!(handle.kind(), HandleKind::ArtMethod(ArtLayout::Legacy));

    assert!(matches!(
        resolver.resolve(
            &SymbolDescriptor::managed("android/location/Location", "getLongitude", "()D"),
            None
        ),
        Resolution::Failed(_)
    ));
}

#[test]
fn load_notification_resolves_deferred() {
    let (libraries, resolver) = resolver();
    let descriptor = SymbolDescriptor::native("libgnss.so", "gnss_vtable");

    assert!(matches!(resolver.resolve(&descriptor, None), Resolution::Deferred));
    assert!(matches!(resolver.resolve(&descriptor, None), Resolution::Deferred));
    assert_eq!(resolver.pending_count(), 1);

    assert!(resolver.notify_library_loaded("libgnss.so").is_empty());
    assert_eq!(resolver.pending_count(), 1);

    libraries.load("libgnss.so", &[("gnss_vtable", 0x9000)]);
    assert!(resolver.notify_library_loaded("libother.so").is_empty());

    let progress = resolver.notify_library_loaded("libgnss.so");
    assert_eq!(progress.resolved.len(), 1);
    assert_eq!(progress.resolved[0].address(), 0x9000);
    assert_eq!(resolver.pending_count(), 0);
}

#[test]
fn backoff_gives_up_after_max_attempts() {
    let (_, resolver) = resolver();
    let descriptor = SymbolDescriptor::native("libnever.so", "anything");
    let start = Instant::now();

    assert!(matches!(resolver.resolve(&descriptor, None), Resolution::Deferred));

    // not due yet
    assert!(resolver.poll_deferred(start).is_empty());

    let mut now = start;
    let mut failed = Vec::new();
    for _ in 0..10 {
        now += Duration::from_millis(100);
        failed.extend(resolver.poll_deferred(now).failed);
    }

    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Error::Resolution { .. }));
    assert_eq!(resolver.pending_count(), 0);
}

#[test]
fn backoff_resolves_once_library_appears() {
    let (libraries, resolver) = resolver();
    let descriptor = SymbolDescriptor::native("libgnss.so", "gnss_vtable");
    let start = Instant::now();

    resolver.resolve(&descriptor, None);
    libraries.load("libgnss.so", &[("gnss_vtable", 0x9000)]);

    let progress = resolver.poll_deferred(start + Duration::from_secs(1));
    assert_eq!(progress.resolved.len(), 1);
    assert!(progress.failed.is_empty());
}

#[test]
fn retry_delay_is_capped() {
    let policy = RetryPolicy::default();

    assert_eq!(policy.delay(0), Duration::from_millis(100));
    assert_eq!(policy.delay(3), Duration::from_millis(800));
    assert_eq!(policy.delay(30), policy.max_delay);
}
