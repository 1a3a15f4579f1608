//! Cleanup semantics: generator teardowns, context-manager disposal, LIFO
//! ordering, and error capture at scope exit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use diwire::{
    Container, Dependency, DiError, Dispose, ProviderOptions, Scopes, Teardown,
};
use parking_lot::Mutex;

struct Engine;

struct Session {
    #[allow(dead_code)]
    engine: Arc<Engine>,
}

fn request_container() -> (Container, diwire::Scope) {
    let scopes = Scopes::standard();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();
    (container, request)
}

#[test]
fn generator_teardown_runs_exactly_once_at_scope_exit() {
    let teardowns = Arc::new(AtomicU32::new(0));
    let (container, request) = request_container();
    container.add_instance(Engine).unwrap();
    {
        let teardowns = teardowns.clone();
        container
            .add_generator_with::<Session, _>(
                ProviderOptions::new().scope(request),
                [Dependency::of::<Engine>("engine")],
                move |args| {
                    let engine = args.take::<Engine>()?;
                    let teardowns = teardowns.clone();
                    let teardown: Teardown = Box::new(move || {
                        teardowns.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok((Session { engine }, teardown))
                },
            )
            .unwrap();
    }

    let scope = container.enter_scope(Some(request)).unwrap();
    let first = scope.resolve::<Session>().unwrap();
    let second = scope.resolve::<Session>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);

    scope.close().unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);

    // The resolver is closed; nothing is rebuilt afterwards.
    assert!(scope.resolve::<Session>().is_err());
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn cleanup_callbacks_run_lifo() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (container, request) = request_container();

    struct First;
    struct Second {
        #[allow(dead_code)]
        first: Arc<First>,
    }

    {
        let order = order.clone();
        container
            .add_generator_with::<First, _>(
                ProviderOptions::new().scope(request),
                [],
                move |_| {
                    let order = order.clone();
                    let teardown: Teardown = Box::new(move || {
                        order.lock().push("first");
                        Ok(())
                    });
                    Ok((First, teardown))
                },
            )
            .unwrap();
    }
    {
        let order = order.clone();
        container
            .add_generator_with::<Second, _>(
                ProviderOptions::new().scope(request),
                [Dependency::of::<First>("first")],
                move |args| {
                    let first = args.take::<First>()?;
                    let order = order.clone();
                    let teardown: Teardown = Box::new(move || {
                        order.lock().push("second");
                        Ok(())
                    });
                    Ok((Second { first }, teardown))
                },
            )
            .unwrap();
    }

    let scope = container.enter_scope(Some(request)).unwrap();
    scope.resolve::<Second>().unwrap();
    scope.close().unwrap();

    // Second registered after First, so it tears down first.
    assert_eq!(*order.lock(), vec!["second", "first"]);
}

#[test]
fn context_manager_disposal_runs_at_scope_exit() {
    static DISPOSED: AtomicU32 = AtomicU32::new(0);

    struct Connection;
    impl Dispose for Connection {
        fn dispose(&self) {
            DISPOSED.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (container, request) = request_container();
    container
        .add_context_manager_with::<Connection, _>(
            ProviderOptions::new().scope(request),
            [],
            |_| Ok(Connection),
        )
        .unwrap();

    let scope = container.enter_scope(Some(request)).unwrap();
    scope.resolve::<Connection>().unwrap();
    assert_eq!(DISPOSED.load(Ordering::SeqCst), 0);
    scope.close().unwrap();
    assert_eq!(DISPOSED.load(Ordering::SeqCst), 1);
}

#[test]
fn transient_cleanup_registers_on_the_declaring_scope() {
    let teardowns = Arc::new(AtomicU32::new(0));
    let container = Container::builder().scopes(Scopes::standard()).build();

    struct Temp;
    {
        let teardowns = teardowns.clone();
        container
            .add_generator_with::<Temp, _>(
                ProviderOptions::new().lifetime(diwire::Lifetime::Transient),
                [],
                move |_| {
                    let teardowns = teardowns.clone();
                    let teardown: Teardown = Box::new(move || {
                        teardowns.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    Ok((Temp, teardown))
                },
            )
            .unwrap();
    }

    // Root-declared transients resolved inside a request window register
    // their teardown on the root resolver, not the window.
    let scope = container.enter_scope(None).unwrap();
    scope.resolve::<Temp>().unwrap();
    scope.resolve::<Temp>().unwrap();
    scope.close().unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);

    container.close().unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);
}

#[test]
fn cleanup_errors_surface_after_draining() {
    let ran_after_failure = Arc::new(AtomicU32::new(0));
    let (container, request) = request_container();

    struct Flaky;
    struct Steady;

    {
        container
            .add_generator_with::<Steady, _>(
                ProviderOptions::new().scope(request),
                [],
                {
                    let ran = ran_after_failure.clone();
                    move |_| {
                        let ran = ran.clone();
                        let teardown: Teardown = Box::new(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        Ok((Steady, teardown))
                    }
                },
            )
            .unwrap();
    }
    container
        .add_generator_with::<Flaky, _>(
            ProviderOptions::new().scope(request),
            [],
            |_| {
                let teardown: Teardown =
                    Box::new(|| Err(DiError::InvalidProviderSpec("teardown broke".into())));
                Ok((Flaky, teardown))
            },
        )
        .unwrap();

    let scope = container.enter_scope(Some(request)).unwrap();
    scope.resolve::<Steady>().unwrap();
    scope.resolve::<Flaky>().unwrap();

    let error = scope.close().unwrap_err();
    assert!(error.to_string().contains("teardown broke"));
    // The earlier callback still ran.
    assert_eq!(ran_after_failure.load(Ordering::SeqCst), 1);
}

#[test]
fn async_teardown_on_sync_close_is_an_error() {
    let (container, request) = request_container();

    struct Streamy;
    container
        .add_async_generator_with::<Streamy, _, _>(
            ProviderOptions::new().scope(request),
            [],
            |_args| async move {
                let teardown: diwire::AsyncTeardown =
                    Box::new(|| Box::pin(async { Ok(()) }) as diwire::TeardownFuture);
                Ok((Streamy, teardown))
            },
        )
        .unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let scope = container.enter_scope(Some(request)).unwrap();
        scope.aresolve::<Streamy>().await.unwrap();
        let error = scope.close().unwrap_err();
        assert!(matches!(error, DiError::AsyncInSyncContext(_)));
    });
}

#[test]
fn closing_a_jump_scope_unwinds_intermediates_lifo() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let scopes = Scopes::builder()
        .scope("app")
        .scope("session")
        .scope("request")
        .build()
        .unwrap();
    let session = scopes.by_name("session").unwrap();
    let request = scopes.by_name("request").unwrap();
    let container = Container::builder().scopes(scopes).build();

    struct SessionRes;
    struct RequestRes;

    {
        let order = order.clone();
        container
            .add_generator_with::<SessionRes, _>(
                ProviderOptions::new().scope(session),
                [],
                move |_| {
                    let order = order.clone();
                    let teardown: Teardown = Box::new(move || {
                        order.lock().push("session");
                        Ok(())
                    });
                    Ok((SessionRes, teardown))
                },
            )
            .unwrap();
    }
    {
        let order = order.clone();
        container
            .add_generator_with::<RequestRes, _>(
                ProviderOptions::new().scope(request),
                [],
                move |_| {
                    let order = order.clone();
                    let teardown: Teardown = Box::new(move || {
                        order.lock().push("request");
                        Ok(())
                    });
                    Ok((RequestRes, teardown))
                },
            )
            .unwrap();
    }

    // Jump straight to request; the session resolver is built as an owned
    // intermediate and unwound with the window.
    let window = container.enter_scope(Some(request)).unwrap();
    window.resolve::<SessionRes>().unwrap();
    window.resolve::<RequestRes>().unwrap();
    window.close().unwrap();

    assert_eq!(*order.lock(), vec!["request", "session"]);
}
