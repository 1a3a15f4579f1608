/// Property-based tests for registration and resolution invariants.
///
/// These tests use proptest to generate random inputs and verify invariants
/// that should hold for all valid containers.
use diwire::{Container, Lifetime, ProviderOptions, Scopes, Teardown};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct TestService {
    id: u32,
}

// Property: any sequence of registrations for the same key resolves to the
// last one.
proptest! {
    #[test]
    fn last_registration_wins(ids in prop::collection::vec(0u32..1000, 1..10)) {
        let container = Container::builder().build();
        for id in &ids {
            container.add_instance(TestService { id: *id }).unwrap();
        }

        let resolved = container.resolve::<TestService>().unwrap();
        prop_assert_eq!(resolved.id, *ids.last().unwrap());
    }
}

// Property: a scoped factory builds once no matter how many resolves hit it.
proptest! {
    #[test]
    fn scoped_factory_builds_once(resolves in 1usize..50, seed in 0u32..1000) {
        let constructions = Arc::new(AtomicU32::new(0));
        let container = Container::builder().build();
        {
            let constructions = constructions.clone();
            container
                .add_factory::<TestService, _>([], move |_| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    Ok(TestService { id: seed })
                })
                .unwrap();
        }

        let mut previous: Option<Arc<TestService>> = None;
        for _ in 0..resolves {
            let current = container.resolve::<TestService>().unwrap();
            if let Some(previous) = &previous {
                prop_assert!(Arc::ptr_eq(previous, &current));
            }
            previous = Some(current);
        }
        prop_assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }
}

// Property: transient factories build exactly once per resolve.
proptest! {
    #[test]
    fn transient_builds_per_resolve(resolves in 1u32..50) {
        let constructions = Arc::new(AtomicU32::new(0));
        let container = Container::builder().build();
        {
            let constructions = constructions.clone();
            container
                .add_factory_with::<TestService, _>(
                    ProviderOptions::new().lifetime(Lifetime::Transient),
                    [],
                    move |_| {
                        Ok(TestService {
                            id: constructions.fetch_add(1, Ordering::SeqCst),
                        })
                    },
                )
                .unwrap();
        }

        for _ in 0..resolves {
            container.resolve::<TestService>().unwrap();
        }
        prop_assert_eq!(constructions.load(Ordering::SeqCst), resolves);
    }
}

// Property: cleanup callbacks drain in exact reverse registration order,
// regardless of how many resources a window acquires.
proptest! {
    #[test]
    fn cleanup_is_lifo_for_any_count(count in 1usize..20) {
        #[derive(Clone)]
        struct Acquired(u32);

        let order: Arc<parking_lot::Mutex<Vec<usize>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let scopes = Scopes::standard();
        let request = scopes.by_name("request").unwrap();
        let container = Container::builder().scopes(scopes).build();
        {
            let order = order.clone();
            container
                .add_generator_with::<Acquired, _>(
                    ProviderOptions::new()
                        .scope(request)
                        .lifetime(Lifetime::Transient),
                    [],
                    move |_| {
                        let order = order.clone();
                        let position = ORDER_COUNTER.fetch_add(1, Ordering::SeqCst) as usize;
                        let teardown: Teardown = Box::new(move || {
                            order.lock().push(position);
                            Ok(())
                        });
                        Ok((Acquired(position as u32), teardown))
                    },
                )
                .unwrap();
        }

        static ORDER_COUNTER: AtomicU32 = AtomicU32::new(0);
        let base = ORDER_COUNTER.load(Ordering::SeqCst) as usize;

        let window = container.enter_scope(Some(request)).unwrap();
        for _ in 0..count {
            window.resolve::<Acquired>().unwrap();
        }
        window.close().unwrap();

        let drained = order.lock().clone();
        let expected: Vec<usize> = (base..base + count).rev().collect();
        prop_assert_eq!(drained, expected);
    }
}

// Property: scope jumps land exactly on the requested level and close
// cleanly, for any depth in the hierarchy.
proptest! {
    #[test]
    fn scope_jumps_land_on_target(depth in 1usize..6) {
        let names: [&'static str; 6] = ["app", "s1", "s2", "s3", "s4", "s5"];
        let mut builder = Scopes::builder();
        for name in names.iter().take(depth + 1) {
            builder = builder.scope(name);
        }
        let scopes = builder.build().unwrap();
        let target = scopes.by_name(names[depth]).unwrap();

        let container = Container::builder().scopes(scopes).build();
        container.add_instance(1u8).unwrap();

        let window = container.enter_scope(Some(target)).unwrap();
        prop_assert_eq!(window.scope().level(), depth as u32);
        window.close().unwrap();
    }
}
