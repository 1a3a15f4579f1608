//! Concurrent resolution: single construction of cached providers under
//! thread contention.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::thread;
use diwire::{Container, Lifetime, ProviderOptions, Scopes};

struct Shared {
    #[allow(dead_code)]
    payload: Vec<u8>,
}

#[test]
fn cached_provider_builds_once_under_contention() {
    let constructions = Arc::new(AtomicU32::new(0));
    let container = Container::builder().build();
    {
        let constructions = constructions.clone();
        container
            .add_factory::<Shared, _>([], move |_| {
                constructions.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(Shared {
                    payload: vec![0; 64],
                })
            })
            .unwrap();
    }

    let resolver = container.compile().unwrap();
    thread::scope(|scope| {
        for _ in 0..16 {
            let resolver = resolver.clone();
            scope.spawn(move |_| {
                let first = resolver.resolve::<Shared>().unwrap();
                let second = resolver.resolve::<Shared>().unwrap();
                assert!(Arc::ptr_eq(&first, &second));
            });
        }
    })
    .unwrap();

    assert_eq!(constructions.load(Ordering::SeqCst), 1);
}

#[test]
fn transients_stay_distinct_across_threads() {
    let counter = Arc::new(AtomicU32::new(0));
    struct Ticket(u32);

    let container = Container::builder().build();
    {
        let counter = counter.clone();
        container
            .add_factory_with::<Ticket, _>(
                ProviderOptions::new().lifetime(Lifetime::Transient),
                [],
                move |_| Ok(Ticket(counter.fetch_add(1, Ordering::SeqCst))),
            )
            .unwrap();
    }

    let resolver = container.compile().unwrap();
    thread::scope(|scope| {
        for _ in 0..8 {
            let resolver = resolver.clone();
            scope.spawn(move |_| {
                for _ in 0..10 {
                    resolver.resolve::<Ticket>().unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 80);
}

#[test]
fn scoped_windows_are_independent_across_threads() {
    let constructions = Arc::new(AtomicU32::new(0));
    struct WindowState;

    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    {
        let constructions = constructions.clone();
        container
            .add_factory_with::<WindowState, _>(
                ProviderOptions::new().scope(request),
                [],
                move |_| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    Ok(WindowState)
                },
            )
            .unwrap();
    }

    let resolver = container.compile().unwrap();
    thread::scope(|outer| {
        for _ in 0..8 {
            let resolver = resolver.clone();
            outer.spawn(move |_| {
                let window = resolver.enter_scope(None).unwrap();
                let first = window.resolve::<WindowState>().unwrap();
                let second = window.resolve::<WindowState>().unwrap();
                assert!(Arc::ptr_eq(&first, &second));
                window.close().unwrap();
            });
        }
    })
    .unwrap();

    // One construction per window.
    assert_eq!(constructions.load(Ordering::SeqCst), 8);
}

#[test]
fn scoped_open_generic_builds_once_under_contention() {
    use diwire::{Dependency, Key, KeyArg, TypeVar};

    struct BoxOf;
    struct Boxed {
        #[allow(dead_code)]
        arg: Key,
    }

    let constructions = Arc::new(AtomicU32::new(0));
    let t = TypeVar::new("T");
    let container = Container::builder().build();
    {
        let constructions = constructions.clone();
        container
            .add_factory_with::<Boxed, _>(
                ProviderOptions::new()
                    .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                    .type_vars([t.clone()]),
                [Dependency::keyed("arg", Key::type_of_var(&t))],
                move |args| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    Ok(Boxed {
                        arg: args.take_type_arg()?,
                    })
                },
            )
            .unwrap();
    }

    let resolver = container.compile().unwrap();
    let closed = Key::generic::<BoxOf>([KeyArg::Key(Key::of::<u64>())]);
    thread::scope(|scope| {
        for _ in 0..16 {
            let resolver = resolver.clone();
            let closed = closed.clone();
            scope.spawn(move |_| {
                let first = resolver
                    .resolve_key(&closed)
                    .unwrap()
                    .downcast::<Boxed>()
                    .unwrap();
                let second = resolver
                    .resolve_key(&closed)
                    .unwrap()
                    .downcast::<Boxed>()
                    .unwrap();
                assert!(Arc::ptr_eq(&first, &second));
            });
        }
    })
    .unwrap();

    assert_eq!(constructions.load(Ordering::SeqCst), 1);
}

#[test]
fn root_cache_is_shared_by_concurrent_windows() {
    let constructions = Arc::new(AtomicU32::new(0));
    struct AppWide;

    let scopes = Scopes::standard();
    let container = Container::builder().scopes(scopes).build();
    {
        let constructions = constructions.clone();
        container
            .add_factory::<AppWide, _>([], move |_| {
                constructions.fetch_add(1, Ordering::SeqCst);
                Ok(AppWide)
            })
            .unwrap();
    }

    let resolver = container.compile().unwrap();
    thread::scope(|outer| {
        for _ in 0..8 {
            let resolver = resolver.clone();
            outer.spawn(move |_| {
                let window = resolver.enter_scope(None).unwrap();
                window.resolve::<AppWide>().unwrap();
                window.close().unwrap();
            });
        }
    })
    .unwrap();

    assert_eq!(constructions.load(Ordering::SeqCst), 1);
}
