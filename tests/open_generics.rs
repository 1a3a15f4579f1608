//! Open-generic templates resolved through the container: matching,
//! caching, specificity, and constraint validation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use diwire::{
    Container, Dependency, DiError, Key, KeyArg, Lifetime, ProviderOptions, TypeVar,
};

// Template family markers.
struct BoxOf;
struct PairOf;

/// The value produced for `BoxOf[...]` keys: remembers which argument key
/// it was built for.
struct Boxed {
    arg: Key,
}

fn closed_box(arg: Key) -> Key {
    Key::generic::<BoxOf>([KeyArg::Key(arg)])
}

#[test]
fn open_template_builds_values_per_type_argument() {
    let t = TypeVar::new("T");
    let container = Container::builder().build();
    container
        .add_factory_with::<Boxed, _>(
            ProviderOptions::new()
                .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                .type_vars([t.clone()]),
            [Dependency::keyed("arg", Key::type_of_var(&t))],
            |args| {
                Ok(Boxed {
                    arg: args.take_type_arg()?,
                })
            },
        )
        .unwrap();

    let int_box = container
        .resolve_key(&closed_box(Key::of::<i32>()))
        .unwrap()
        .downcast::<Boxed>()
        .unwrap();
    assert_eq!(int_box.arg, Key::of::<i32>());

    let string_box = container
        .resolve_key(&closed_box(Key::of::<String>()))
        .unwrap()
        .downcast::<Boxed>()
        .unwrap();
    assert_eq!(string_box.arg, Key::of::<String>());
}

#[test]
fn scoped_open_generics_cache_per_closed_key() {
    let constructions = Arc::new(AtomicU32::new(0));
    let t = TypeVar::new("T");
    let container = Container::builder().build();
    {
        let constructions = constructions.clone();
        container
            .add_factory_with::<Boxed, _>(
                ProviderOptions::new()
                    .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                    .type_vars([t.clone()])
                    .lifetime(Lifetime::Scoped),
                [Dependency::keyed("arg", Key::type_of_var(&t))],
                move |args| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    Ok(Boxed {
                        arg: args.take_type_arg()?,
                    })
                },
            )
            .unwrap();
    }

    let key = closed_box(Key::of::<i32>());
    let first = container.resolve_key(&key).unwrap().downcast::<Boxed>().unwrap();
    let second = container.resolve_key(&key).unwrap().downcast::<Boxed>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(constructions.load(Ordering::SeqCst), 1);

    // A different closed key is a different cache entry.
    container.resolve_key(&closed_box(Key::of::<u8>())).unwrap();
    assert_eq!(constructions.load(Ordering::SeqCst), 2);
}

#[test]
fn transient_open_generics_build_fresh_values() {
    let t = TypeVar::new("T");
    let container = Container::builder().build();
    container
        .add_factory_with::<Boxed, _>(
            ProviderOptions::new()
                .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                .type_vars([t.clone()])
                .lifetime(Lifetime::Transient),
            [Dependency::keyed("arg", Key::type_of_var(&t))],
            |args| {
                Ok(Boxed {
                    arg: args.take_type_arg()?,
                })
            },
        )
        .unwrap();

    let key = closed_box(Key::of::<i32>());
    let first = container.resolve_key(&key).unwrap().downcast::<Boxed>().unwrap();
    let second = container.resolve_key(&key).unwrap().downcast::<Boxed>().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn more_specific_templates_win() {
    struct Marked {
        label: &'static str,
    }

    let t = TypeVar::new("T");
    let u = TypeVar::new("U");
    let container = Container::builder().build();

    // Fully open pair template.
    container
        .add_factory_with::<Marked, _>(
            ProviderOptions::new()
                .provides(Key::generic::<PairOf>([
                    KeyArg::Var(t.id()),
                    KeyArg::Var(u.id()),
                ]))
                .type_vars([t.clone(), u.clone()]),
            [],
            |_| Ok(Marked { label: "open" }),
        )
        .unwrap();

    // Left side pinned to i32: strictly more specific.
    let v = TypeVar::new("V");
    container
        .add_factory_with::<Marked, _>(
            ProviderOptions::new()
                .provides(Key::generic::<PairOf>([
                    KeyArg::Key(Key::of::<i32>()),
                    KeyArg::Var(v.id()),
                ]))
                .type_vars([v.clone()]),
            [],
            |_| Ok(Marked { label: "pinned" }),
        )
        .unwrap();

    let pinned = container
        .resolve_key(&Key::generic::<PairOf>([
            KeyArg::Key(Key::of::<i32>()),
            KeyArg::Key(Key::of::<String>()),
        ]))
        .unwrap()
        .downcast::<Marked>()
        .unwrap();
    assert_eq!(pinned.label, "pinned");

    let open = container
        .resolve_key(&Key::generic::<PairOf>([
            KeyArg::Key(Key::of::<u8>()),
            KeyArg::Key(Key::of::<String>()),
        ]))
        .unwrap()
        .downcast::<Marked>()
        .unwrap();
    assert_eq!(open.label, "open");
}

#[test]
fn constrained_variables_reject_foreign_arguments() {
    let t = TypeVar::new("T").constrained([Key::of::<i32>(), Key::of::<i64>()]);
    let container = Container::builder().build();
    container
        .add_factory_with::<Boxed, _>(
            ProviderOptions::new()
                .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                .type_vars([t.clone()]),
            [Dependency::keyed("arg", Key::type_of_var(&t))],
            |args| {
                Ok(Boxed {
                    arg: args.take_type_arg()?,
                })
            },
        )
        .unwrap();

    assert!(container.resolve_key(&closed_box(Key::of::<i32>())).is_ok());
    assert!(matches!(
        container.resolve_key(&closed_box(Key::of::<String>())),
        Err(DiError::InvalidGenericArgument(_))
    ));
}

#[test]
fn dependency_templates_substitute_and_recurse() {
    struct Wrapper {
        boxed: Arc<Boxed>,
    }

    let t = TypeVar::new("T");
    let container = Container::builder().build();
    container
        .add_factory_with::<Boxed, _>(
            ProviderOptions::new()
                .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                .type_vars([t.clone()]),
            [Dependency::keyed("arg", Key::type_of_var(&t))],
            |args| {
                Ok(Boxed {
                    arg: args.take_type_arg()?,
                })
            },
        )
        .unwrap();

    // Pair[T] depends on Box[T]: the dependency template substitutes the
    // matched argument and recurses through ordinary resolution.
    let p = TypeVar::new("P");
    container
        .add_factory_with::<Wrapper, _>(
            ProviderOptions::new()
                .provides(Key::generic::<PairOf>([KeyArg::Var(p.id())]))
                .type_vars([p.clone()]),
            [Dependency::keyed(
                "boxed",
                Key::generic::<BoxOf>([KeyArg::Var(p.id())]),
            )],
            |args| {
                Ok(Wrapper {
                    boxed: args.take::<Boxed>()?,
                })
            },
        )
        .unwrap();

    let wrapper = container
        .resolve_key(&Key::generic::<PairOf>([KeyArg::Key(Key::of::<u16>())]))
        .unwrap()
        .downcast::<Wrapper>()
        .unwrap();
    assert_eq!(wrapper.boxed.arg, Key::of::<u16>());
}

#[test]
fn maybe_wrapping_an_open_matchable_key_resolves() {
    let t = TypeVar::new("T");
    let container = Container::builder().build();
    container
        .add_factory_with::<Boxed, _>(
            ProviderOptions::new()
                .provides(Key::generic::<BoxOf>([KeyArg::Var(t.id())]))
                .type_vars([t.clone()]),
            [Dependency::keyed("arg", Key::type_of_var(&t))],
            |args| {
                Ok(Boxed {
                    arg: args.take_type_arg()?,
                })
            },
        )
        .unwrap();

    // Maybe over a closed generic with an open match yields the value.
    let value = container
        .resolve_key(&closed_box(Key::of::<i32>()).maybe())
        .unwrap()
        .downcast::<Option<diwire::Value>>()
        .unwrap();
    assert!(value.is_some());

    // Maybe over an unmatched generic family yields none.
    struct Unknown;
    let missing = container
        .resolve_key(&Key::generic::<Unknown>([KeyArg::Key(Key::of::<i32>())]).maybe())
        .unwrap()
        .downcast::<Option<diwire::Value>>()
        .unwrap();
    assert!(missing.is_none());
}
