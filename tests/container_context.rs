//! Deferred-registration recorder behavior.

use diwire::{Container, ContainerContext, Dependency, DiError};

struct Config {
    name: &'static str,
}

struct App {
    config_name: &'static str,
}

#[test]
fn recorded_registrations_replay_in_order() {
    let context = ContainerContext::new();
    context.add_instance(Config { name: "recorded" }).unwrap();
    context
        .add_factory::<App, _>([Dependency::of::<Config>("config")], |args| {
            let config = args.take::<Config>()?;
            Ok(App {
                config_name: config.name,
            })
        })
        .unwrap();

    let container = Container::builder().build();
    assert!(matches!(
        container.resolve::<Config>(),
        Err(DiError::NotRegistered(_))
    ));

    context.set_current(&container).unwrap();
    assert_eq!(container.resolve::<App>().unwrap().config_name, "recorded");
}

#[test]
fn calls_after_binding_apply_immediately() {
    let context = ContainerContext::new();
    let container = Container::builder().build();
    context.set_current(&container).unwrap();

    context.add_instance(Config { name: "direct" }).unwrap();
    assert_eq!(container.resolve::<Config>().unwrap().name, "direct");
}

#[test]
fn recorders_are_independent_instances() {
    let first = ContainerContext::new();
    let second = ContainerContext::new();
    first.add_instance(1u32).unwrap();
    second.add_instance(2u64).unwrap();

    let container_a = Container::builder().build();
    let container_b = Container::builder().build();
    first.set_current(&container_a).unwrap();
    second.set_current(&container_b).unwrap();

    assert_eq!(*container_a.resolve::<u32>().unwrap(), 1);
    assert!(container_a.resolve::<u64>().is_err());
    assert_eq!(*container_b.resolve::<u64>().unwrap(), 2);
    assert!(container_b.resolve::<u32>().is_err());
}

#[test]
fn replay_order_preserves_overrides() {
    let context = ContainerContext::new();
    context.add_instance(1u8).unwrap();
    context.add_instance(2u8).unwrap();

    let container = Container::builder().build();
    context.set_current(&container).unwrap();

    // Later registrations replace earlier ones, as with direct calls.
    assert_eq!(*container.resolve::<u8>().unwrap(), 2);
}

#[test]
fn recorded_injections_bind_with_the_container() {
    let context = ContainerContext::new();
    context.add_instance(Config { name: "ctx" }).unwrap();

    let handler = context
        .inject(
            "handler",
            vec![Dependency::of::<Config>("config")],
            diwire::InjectOptions::new(),
            |_ctx, args| Ok(args.take::<Config>()?.name),
        )
        .unwrap();

    // Calling before binding is a registration-surface error.
    assert!(matches!(
        handler.call(),
        Err(DiError::InvalidRegistration(_))
    ));

    let container = Container::builder().build();
    context.set_current(&container).unwrap();
    assert_eq!(handler.call().unwrap(), "ctx");
}

#[test]
fn rebinding_replays_the_record_and_redirects() {
    let context = ContainerContext::new();
    context.add_instance(Config { name: "shared" }).unwrap();

    let handler = context
        .inject(
            "handler",
            vec![Dependency::of::<Config>("config")],
            diwire::InjectOptions::new(),
            |_ctx, args| Ok(args.take::<Config>()?.name),
        )
        .unwrap();

    let first = Container::builder().build();
    context.set_current(&first).unwrap();
    assert_eq!(handler.call().unwrap(), "shared");

    // Binding a different container replays the full record into it; the
    // wrapper and passthroughs follow the new binding.
    let second = Container::builder().build();
    context.set_current(&second).unwrap();
    assert_eq!(second.resolve::<Config>().unwrap().name, "shared");
    assert_eq!(handler.call().unwrap(), "shared");

    // The second container answers independently of the first.
    second.add_instance(Config { name: "rebound" }).unwrap();
    assert_eq!(handler.call().unwrap(), "rebound");
    assert_eq!(first.resolve::<Config>().unwrap().name, "shared");
}

#[test]
fn passthroughs_follow_the_bound_container() {
    let context = ContainerContext::new();
    context.add_instance(7u32).unwrap();

    // Unbound passthroughs are a registration-surface error.
    assert!(matches!(
        context.resolve::<u32>(),
        Err(DiError::InvalidRegistration(_))
    ));
    assert!(matches!(
        context.enter_scope(None),
        Err(DiError::InvalidRegistration(_))
    ));

    let container = Container::builder()
        .scopes(diwire::Scopes::standard())
        .build();
    context.set_current(&container).unwrap();
    assert_eq!(*context.resolve::<u32>().unwrap(), 7);

    let window = context.enter_scope(None).unwrap();
    assert_eq!(window.scope().name(), "request");
    window.close().unwrap();

    // A rebind redirects resolution to the new container.
    let other = Container::builder().build();
    context.set_current(&other).unwrap();
    other.add_instance(9u32).unwrap();
    assert_eq!(*context.resolve::<u32>().unwrap(), 9);
}

#[test]
fn recorded_decorations_replay_too() {
    struct Count(u32);

    let context = ContainerContext::new();
    context.add_instance(Count(1)).unwrap();
    context
        .decorate::<Count, _>(
            diwire::DecorateOptions::new(),
            [Dependency::of::<Count>("inner")],
            |args| {
                let inner = args.take::<Count>()?;
                Ok(Count(inner.0 + 10))
            },
        )
        .unwrap();

    let container = Container::builder().build();
    context.set_current(&container).unwrap();
    assert_eq!(container.resolve::<Count>().unwrap().0, 11);
}
