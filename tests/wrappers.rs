//! Wrapper dependency kinds: Maybe, Provider handles, FromContext, All.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use diwire::{
    Container, Context, Dependency, DiError, Key, Lifetime, ProviderOptions, Scopes,
};

struct Cache {
    size: u32,
}

struct Service {
    cache: Option<Arc<Cache>>,
}

#[test]
fn maybe_dependency_resolves_to_none_when_unregistered() {
    let container = Container::builder().build();
    container
        .add_factory::<Service, _>([Dependency::maybe::<Cache>("cache")], |args| {
            Ok(Service {
                cache: args.take_maybe::<Cache>()?,
            })
        })
        .unwrap();

    assert!(container.resolve::<Service>().unwrap().cache.is_none());
}

#[test]
fn maybe_dependency_resolves_to_the_binding_when_registered() {
    let container = Container::builder().build();
    container.add_instance(Cache { size: 128 }).unwrap();
    container
        .add_factory::<Service, _>([Dependency::maybe::<Cache>("cache")], |args| {
            Ok(Service {
                cache: args.take_maybe::<Cache>()?,
            })
        })
        .unwrap();

    let service = container.resolve::<Service>().unwrap();
    assert_eq!(service.cache.clone().unwrap().size, 128);
}

#[test]
fn maybe_at_the_surface_swallows_not_registered_only() {
    let container = Container::builder().build();
    assert!(container.resolve_maybe::<Cache>().unwrap().is_none());

    container.add_instance(Cache { size: 1 }).unwrap();
    assert!(container.resolve_maybe::<Cache>().unwrap().is_some());

    // A failing provider is not a missing provider.
    struct Broken;
    container
        .add_factory::<Broken, _>([], |_| {
            Err(DiError::InvalidProviderSpec("boom".into()))
        })
        .unwrap();
    assert!(container.resolve_maybe::<Broken>().is_err());
}

#[test]
fn provider_handle_defers_resolution() {
    let constructions = Arc::new(AtomicU32::new(0));
    struct Expensive {
        n: u32,
    }
    struct Lazy {
        handle: diwire::ProviderHandle<Expensive>,
    }

    let container = Container::builder().build();
    {
        let constructions = constructions.clone();
        container
            .add_factory_with::<Expensive, _>(
                ProviderOptions::new().lifetime(Lifetime::Transient),
                [],
                move |_| {
                    Ok(Expensive {
                        n: constructions.fetch_add(1, Ordering::SeqCst),
                    })
                },
            )
            .unwrap();
    }
    container
        .add_factory::<Lazy, _>([Dependency::provider::<Expensive>("handle")], |args| {
            Ok(Lazy {
                handle: args.take_provider::<Expensive>()?,
            })
        })
        .unwrap();

    let lazy = container.resolve::<Lazy>().unwrap();
    assert_eq!(constructions.load(Ordering::SeqCst), 0);

    // Each invocation resolves at that moment: transients come out fresh.
    let first = lazy.handle.get().unwrap();
    let second = lazy.handle.get().unwrap();
    assert_ne!(first.n, second.n);
    assert_eq!(constructions.load(Ordering::SeqCst), 2);
}

#[test]
fn all_returns_bindings_in_registration_order() {
    struct Plugin {
        name: &'static str,
    }
    struct Host {
        plugins: Vec<Arc<Plugin>>,
    }

    let container = Container::builder().build();
    container
        .add_instance_with(ProviderOptions::new().component("auth"), Plugin { name: "auth" })
        .unwrap();
    container.add_instance(Plugin { name: "core" }).unwrap();
    container
        .add_instance_with(
            ProviderOptions::new().component("metrics"),
            Plugin { name: "metrics" },
        )
        .unwrap();

    container
        .add_factory::<Host, _>([Dependency::all::<Plugin>("plugins")], |args| {
            Ok(Host {
                plugins: args.take_all::<Plugin>()?,
            })
        })
        .unwrap();

    let host = container.resolve::<Host>().unwrap();
    let names: Vec<&str> = host.plugins.iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["auth", "core", "metrics"]);

    // The typed surface agrees.
    let all = container.resolve_all::<Plugin>().unwrap();
    assert_eq!(all.len(), 3);
}

#[test]
fn all_is_empty_for_unknown_base_keys() {
    struct Unseen;
    let container = Container::builder().build();
    container.add_instance(1u8).unwrap();
    assert!(container.resolve_all::<Unseen>().unwrap().is_empty());
}

#[test]
fn from_context_reads_the_nearest_frame() {
    #[derive(Clone)]
    struct RequestId(u64);
    #[derive(Debug)]
    struct Handler {
        id: u64,
    }

    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    container
        .add_factory_with::<Handler, _>(
            ProviderOptions::new().scope(request),
            [Dependency::from_context::<RequestId>("request_id")],
            |args| {
                let id = args.take::<RequestId>()?;
                Ok(Handler { id: id.0 })
            },
        )
        .unwrap();

    let scope = container
        .enter_scope_with_context(Some(request), Context::new().with(RequestId(17)))
        .unwrap();
    assert_eq!(scope.resolve::<Handler>().unwrap().id, 17);
    scope.close().unwrap();

    // Without the frame the lookup fails with a located message.
    let bare = container.enter_scope(Some(request)).unwrap();
    let error = bare.resolve::<Handler>().unwrap_err();
    assert!(matches!(error, DiError::NotRegistered(_)));
    assert!(error.to_string().contains("RequestId"));
    bare.close().unwrap();
}

#[test]
fn context_frames_are_inherited_by_deeper_scopes() {
    #[derive(Clone)]
    struct TenantId(&'static str);

    let scopes = Scopes::builder()
        .scope("app")
        .scope("session")
        .scope("request")
        .build()
        .unwrap();
    let session = scopes.by_name("session").unwrap();
    let container = Container::builder().scopes(scopes).build();
    container.add_instance(0u8).unwrap();

    let outer = container
        .enter_scope_with_context(Some(session), Context::new().with(TenantId("acme")))
        .unwrap();
    let inner = outer.enter_scope(None).unwrap();

    let tenant = inner.from_context::<TenantId>().unwrap();
    assert_eq!(tenant.0, "acme");

    inner.close().unwrap();
    outer.close().unwrap();
}

#[test]
fn maybe_from_context_yields_none_when_absent() {
    #[derive(Clone)]
    struct TraceId(u64);
    struct Traced {
        trace: Option<Arc<TraceId>>,
    }

    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    container
        .add_factory_with::<Traced, _>(
            ProviderOptions::new().scope(request),
            [Dependency::keyed(
                "trace",
                Key::of::<TraceId>().from_context().maybe(),
            )],
            |args| {
                Ok(Traced {
                    trace: args.take_maybe::<TraceId>()?,
                })
            },
        )
        .unwrap();

    let without = container.enter_scope(Some(request)).unwrap();
    assert!(without.resolve::<Traced>().unwrap().trace.is_none());
    without.close().unwrap();

    let with = container
        .enter_scope_with_context(Some(request), Context::new().with(TraceId(5)))
        .unwrap();
    assert_eq!(with.resolve::<Traced>().unwrap().trace.clone().unwrap().0, 5);
    with.close().unwrap();
}
