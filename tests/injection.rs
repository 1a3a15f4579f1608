//! The injection wrapper: argument filling, overrides, scope auto-opening,
//! and explicit resolvers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use diwire::{
    Container, Context, Dependency, InjectCall, InjectOptions, ProviderOptions, Scopes,
};

struct Greeter {
    prefix: &'static str,
}

#[test]
fn injected_arguments_are_resolved_at_call_time() {
    let container = Container::builder().build();
    container.add_instance(Greeter { prefix: "hi" }).unwrap();

    let greet = container
        .inject(
            "greet",
            vec![Dependency::of::<Greeter>("greeter")],
            InjectOptions::new(),
            |_ctx, args| {
                let greeter = args.take::<Greeter>()?;
                Ok(format!("{} there", greeter.prefix))
            },
        )
        .unwrap();

    assert_eq!(greet.call().unwrap(), "hi there");
}

#[test]
fn caller_arguments_override_injected_ones() {
    let container = Container::builder().build();
    container.add_instance(Greeter { prefix: "hi" }).unwrap();

    let greet = container
        .inject(
            "greet",
            vec![Dependency::of::<Greeter>("greeter")],
            InjectOptions::new(),
            |_ctx, args| {
                let greeter = args.take::<Greeter>()?;
                Ok(greeter.prefix.to_string())
            },
        )
        .unwrap();

    let loud = greet
        .call_with(InjectCall::new().arg("greeter", Greeter { prefix: "HEY" }))
        .unwrap();
    assert_eq!(loud, "HEY");
    // Without the override the registered binding answers again.
    assert_eq!(greet.call().unwrap(), "hi");
}

#[test]
fn auto_open_scope_opens_the_required_level() {
    struct PerRequest {
        serial: u32,
    }

    let serials = Arc::new(AtomicU32::new(0));
    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    {
        let serials = serials.clone();
        container
            .add_factory_with::<PerRequest, _>(
                ProviderOptions::new().scope(request),
                [],
                move |_| {
                    Ok(PerRequest {
                        serial: serials.fetch_add(1, Ordering::SeqCst),
                    })
                },
            )
            .unwrap();
    }

    let handler = container
        .inject(
            "handler",
            vec![Dependency::of::<PerRequest>("state")],
            InjectOptions::new(),
            |_ctx, args| Ok(args.take::<PerRequest>()?.serial),
        )
        .unwrap();

    // Each call opens (and closes) its own request window.
    let first = handler.call().unwrap();
    let second = handler.call().unwrap();
    assert_ne!(first, second);
}

#[test]
fn scoped_cleanup_runs_when_the_auto_opened_scope_closes() {
    struct Resource;

    let teardowns = Arc::new(AtomicU32::new(0));
    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    {
        let teardowns = teardowns.clone();
        container
            .add_generator_with::<Resource, _>(
                ProviderOptions::new().scope(request),
                [],
                move |_| {
                    let teardowns = teardowns.clone();
                    let teardown: diwire::Teardown = Box::new(move || {
                        teardowns.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok((Resource, teardown))
                },
            )
            .unwrap();
    }

    let handler = container
        .inject(
            "handler",
            vec![Dependency::of::<Resource>("resource")],
            InjectOptions::new(),
            |_ctx, args| {
                args.take::<Resource>()?;
                Ok(())
            },
        )
        .unwrap();

    handler.call().unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn explicit_resolver_reuses_the_callers_window() {
    struct PerRequest;

    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    container
        .add_factory_with::<PerRequest, _>(
            ProviderOptions::new().scope(request),
            [],
            |_| Ok(PerRequest),
        )
        .unwrap();

    let handler = container
        .inject(
            "handler",
            vec![Dependency::of::<PerRequest>("state")],
            InjectOptions::new(),
            |ctx, args| {
                let injected = args.take::<PerRequest>()?;
                // The same window resolves the same scoped instance.
                let direct = ctx.resolver().resolve::<PerRequest>()?;
                Ok(Arc::ptr_eq(&injected, &direct))
            },
        )
        .unwrap();

    let window = container.enter_scope(Some(request)).unwrap();
    let shared = handler
        .call_with(InjectCall::new().resolver(window.clone()))
        .unwrap();
    assert!(shared);
    window.close().unwrap();
}

#[test]
fn context_argument_feeds_from_context_dependencies() {
    #[derive(Clone)]
    struct UserId(u64);

    let scopes = Scopes::standard();
    let container = Container::builder().scopes(scopes).build();
    container.add_instance(0u8).unwrap();

    let handler = container
        .inject(
            "handler",
            vec![Dependency::from_context::<UserId>("user_id")],
            InjectOptions::new(),
            |_ctx, args| Ok(args.take::<UserId>()?.0),
        )
        .unwrap();

    let value = handler
        .call_with(InjectCall::new().context(Context::new().with(UserId(99))))
        .unwrap();
    assert_eq!(value, 99);
}

#[tokio::test]
async fn acall_resolves_async_dependencies() {
    struct Remote;
    struct Report(&'static str);

    let container = Container::builder().build();
    container
        .add_async_factory::<Remote, _, _>([], |_args| async { Ok(Remote) })
        .unwrap();

    let handler = container
        .inject(
            "handler",
            vec![Dependency::of::<Remote>("remote")],
            InjectOptions::new(),
            |_ctx, args| {
                args.take::<Remote>()?;
                Ok(Report("done"))
            },
        )
        .unwrap();

    // The sync path refuses the suspension; the async path completes.
    assert!(handler.call().is_err());
    assert_eq!(handler.acall().await.unwrap().0, "done");
}

#[test]
fn optional_injected_dependencies_fall_back_to_none() {
    struct Absent;

    let container = Container::builder().build();
    container.add_instance(0u8).unwrap();

    let handler = container
        .inject(
            "handler",
            vec![Dependency::maybe::<Absent>("maybe_absent")],
            InjectOptions::new(),
            |_ctx, args| Ok(args.take_maybe::<Absent>()?.is_none()),
        )
        .unwrap();

    assert!(handler.call().unwrap());
}
