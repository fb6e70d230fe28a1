//! Integration Tests for Scopes, Controllers, and Execution Contexts
//!
//! These tests drive the public API end to end on a current-thread runtime
//! inside a `LocalSet`, the same way an application would.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::{FutureExt, LocalBoxFuture};
use tether_core::{
    create_scope, Atom, AtomContext, AtomRef, AtomStatus, BoxError, CloseMode,
    ContextStatus, Error, ExecFuture, ExecTarget, ExecutionContext, Extension, Flow, Preset,
    ResolveFuture, Scope, ScopeConfig, Tag,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn run_local<F: Future>(future: F) -> F::Output {
    init_logging();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    tokio::task::LocalSet::new().block_on(&runtime, future)
}

/// `derived = counter + 1` with a reactive edge.
fn counter_and_derived() -> (Atom<i32>, Atom<i32>) {
    let counter = Atom::new("counter", |_| async { Ok(0) });
    let derived = Atom::builder("derived").reactive(&counter).build({
        let counter = counter.clone();
        move |ctx: AtomContext| {
            let value = ctx.dep(&counter);
            async move { Ok::<_, BoxError>(value? + 1) }
        }
    });
    (counter, derived)
}

#[derive(Debug, thiserror::Error)]
#[error("payment declined")]
struct PaymentDeclined;

// ---- Scope and controller ----

/// Updating a reactive dependency re-resolves its dependent.
#[test]
fn update_propagates_to_reactive_dependents() {
    run_local(async {
        let (counter, derived) = counter_and_derived();
        let scope = Scope::new();

        assert_eq!(scope.resolve(&derived).await.unwrap(), 1);

        scope.controller(&counter).update(|c| c + 1).unwrap();

        // The queued frame is settled before resolve returns
        assert_eq!(scope.resolve(&derived).await.unwrap(), 2);
        assert_eq!(scope.controller(&counter).get().unwrap(), 1);
    });
}

/// A selection only notifies when its derived value changes.
#[test]
fn select_fires_only_on_derived_change() {
    run_local(async {
        let counter = Atom::new("counter", |_| async { Ok(0) });
        let scope = Scope::new();
        let controller = scope.controller(&counter);
        controller.resolve().await.unwrap();

        let is_even = scope.select(&counter, |c: &i32| c % 2 == 0).unwrap();
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let _subscription = is_even
            .subscribe(move |_| seen.set(seen.get() + 1))
            .unwrap();

        // even -> even
        controller.set(2).unwrap();
        scope.flush().await.unwrap();
        assert_eq!(calls.get(), 0);

        // even -> odd
        controller.set(3).unwrap();
        scope.flush().await.unwrap();
        assert_eq!(calls.get(), 1);
        assert!(!is_even.get());
    });
}

/// Reading a controller before its atom resolved fails.
#[test]
fn controller_get_before_resolution_fails() {
    run_local(async {
        let slow = Atom::new("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(1)
        });
        let scope = Scope::new();
        let controller = scope.controller(&slow);

        assert!(matches!(controller.get(), Err(Error::NotResolved { .. })));

        // Still not readable while the first resolution is in flight
        let pending = tokio::task::spawn_local({
            let controller = controller.clone();
            async move { controller.resolve().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(controller.state(), AtomStatus::Resolving);
        assert!(matches!(controller.get(), Err(Error::NotResolved { .. })));

        assert_eq!(pending.await.unwrap().unwrap(), 1);
        assert_eq!(controller.get().unwrap(), 1);
    });
}

/// Invalidation runs the previous cleanups newest first before the factory
/// runs again.
#[test]
fn invalidate_runs_cleanups_in_reverse_before_rerun() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::<String>::new()));
        let runs = Rc::new(Cell::new(0));

        let atom = Atom::new("resource", {
            let log = Rc::clone(&log);
            let runs = Rc::clone(&runs);
            move |ctx: AtomContext| {
                runs.set(runs.get() + 1);
                let run = runs.get();
                log.borrow_mut().push(format!("run {run}"));
                for step in 1..=3 {
                    let log = Rc::clone(&log);
                    ctx.cleanup(move || log.borrow_mut().push(format!("cleanup {run}.{step}")));
                }
                async move { Ok(run) }
            }
        });

        let scope = Scope::new();
        scope.resolve(&atom).await.unwrap();
        scope.controller(&atom).invalidate().unwrap();
        scope.flush().await.unwrap();

        assert_eq!(
            *log.borrow(),
            vec!["run 1", "cleanup 1.3", "cleanup 1.2", "cleanup 1.1", "run 2"]
        );
        assert_eq!(scope.get(&atom).unwrap(), Some(2));
    });
}

/// Repeated invalidations within one frame collapse into one factory run.
#[test]
fn duplicate_invalidations_collapse() {
    run_local(async {
        let runs = Rc::new(Cell::new(0));
        let atom = Atom::new("config", {
            let runs = Rc::clone(&runs);
            move |_| {
                runs.set(runs.get() + 1);
                async { Ok(()) }
            }
        });
        let scope = Scope::new();
        scope.resolve(&atom).await.unwrap();

        let controller = scope.controller(&atom);
        controller.invalidate().unwrap();
        controller.invalidate().unwrap();
        controller.invalidate().unwrap();
        scope.flush().await.unwrap();

        assert_eq!(runs.get(), 2);
    });
}

/// A dependent that invalidates its own source mid-chain is a loop.
#[test]
fn dependent_invalidating_its_source_is_a_loop() {
    run_local(async {
        let a = Atom::new("a", |_| async { Ok(1) });
        let b = Atom::builder("b")
            .reactive(&a)
            .build(|_| async { Ok(2) });
        let scope = Scope::new();
        scope.resolve(&b).await.unwrap();

        let reported = Rc::new(RefCell::new(None));
        let subscription = scope
            .on_update(&b, {
                let source = scope.controller(&a);
                let reported = Rc::clone(&reported);
                move || {
                    if let Err(err) = source.invalidate() {
                        *reported.borrow_mut() = Some(err);
                    }
                }
            })
            .unwrap();

        scope.controller(&a).invalidate().unwrap();
        let err = scope.flush().await.unwrap_err();

        assert_eq!(err.to_string(), "infinite invalidation loop detected: a -> b -> a");
        assert!(matches!(
            reported.borrow().as_ref(),
            Some(Error::InfiniteInvalidationLoop { path }) if path == &["a", "b", "a"]
        ));

        // The failure is reported once
        subscription.unsubscribe();
        scope.flush().await.unwrap();
    });
}

/// Dependents are walked depth first: each one finishes its own subtree
/// before the next sibling starts.
#[test]
fn invalidation_walks_dependents_depth_first() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let logged = |name: &'static str, sources: &[&Atom<()>]| {
            let mut builder = Atom::builder(name);
            for source in sources {
                builder = builder.reactive(*source);
            }
            let log = Rc::clone(&log);
            builder.build(move |_| {
                log.borrow_mut().push(name);
                async { Ok(()) }
            })
        };
        let a = logged("a", &[]);
        let b = logged("b", &[&a]);
        let c = logged("c", &[&a]);
        let d = logged("d", &[&b]);
        let scope = Scope::new();
        scope.resolve(&d).await.unwrap();
        scope.resolve(&c).await.unwrap();
        log.borrow_mut().clear();

        scope.controller(&a).invalidate().unwrap();
        scope.flush().await.unwrap();

        assert_eq!(*log.borrow(), vec!["a", "b", "d", "c"]);
    });
}

/// A write issued by another task while a chain is running is queued
/// behind it, not reported as a loop.
#[test]
fn write_during_a_running_chain_is_queued() {
    run_local(async {
        let a = Atom::new("a", |_| async { Ok(1) });
        let b = Atom::builder("b").reactive(&a).build({
            let a = a.clone();
            move |ctx: AtomContext| {
                let value = ctx.dep(&a);
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, BoxError>(value? * 2)
                }
            }
        });
        let scope = Scope::new();
        assert_eq!(scope.resolve(&b).await.unwrap(), 2);

        scope.controller(&a).invalidate().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        scope.controller(&a).set(10).unwrap();
        scope.flush().await.unwrap();

        assert_eq!(scope.get(&a).unwrap(), Some(10));
        assert_eq!(scope.get(&b).unwrap(), Some(20));
    });
}

/// An atom whose factory takes 20ms and returns how many times it has run.
fn slow_run_counter() -> Atom<i32> {
    let runs = Rc::new(Cell::new(0));
    Atom::new("slow", move |_| {
        runs.set(runs.get() + 1);
        let run = runs.get();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(run)
        }
    })
}

/// A `set` issued while the atom re-resolves is applied once the run settles.
#[test]
fn set_during_resolution_applies_after_it_settles() {
    run_local(async {
        let atom = slow_run_counter();
        let scope = Scope::new();
        assert_eq!(scope.resolve(&atom).await.unwrap(), 1);
        let controller = scope.controller(&atom);

        controller.invalidate().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(controller.state(), AtomStatus::Resolving);

        controller.set(99).unwrap();
        scope.flush().await.unwrap();

        assert_eq!(controller.state(), AtomStatus::Resolved);
        assert_eq!(controller.get().unwrap(), 99);
    });
}

/// An `update` issued while the atom re-resolves sees the fresh value.
#[test]
fn update_during_resolution_applies_to_the_new_value() {
    run_local(async {
        let atom = slow_run_counter();
        let scope = Scope::new();
        assert_eq!(scope.resolve(&atom).await.unwrap(), 1);
        let controller = scope.controller(&atom);

        controller.invalidate().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(controller.state(), AtomStatus::Resolving);

        controller.update(|n| n + 100).unwrap();
        scope.flush().await.unwrap();

        assert_eq!(controller.get().unwrap(), 102);
    });
}

/// Dispose runs every cleanup across atoms newest first and is idempotent.
#[test]
fn dispose_orders_cleanups_across_atoms() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = |name: &'static str, steps: usize| {
            let log = Rc::clone(&log);
            Atom::new(name, move |ctx: AtomContext| {
                for step in 0..steps {
                    let log = Rc::clone(&log);
                    ctx.cleanup(move || log.borrow_mut().push(format!("{name}{step}")));
                }
                async { Ok(()) }
            })
        };
        let db = make("db", 2);
        let cache = make("cache", 1);

        let scope = Scope::new();
        scope.resolve(&db).await.unwrap();
        scope.resolve(&cache).await.unwrap();
        scope.dispose().await;
        scope.dispose().await;

        assert_eq!(*log.borrow(), vec!["cache0", "db1", "db0"]);
        assert!(scope.is_disposed());
        assert!(matches!(scope.flush().await, Err(Error::ScopeDisposed)));
        assert!(matches!(
            scope.controller(&db).invalidate(),
            Err(Error::ScopeDisposed)
        ));
    });
}

/// Presets replace values and definitions per scope.
#[test]
fn presets_isolate_scopes() {
    run_local(async {
        let url = Atom::new("url", |_| async { Ok("postgres://prod".to_string()) });
        let client = Atom::builder("client").dep(&url).build({
            let url = url.clone();
            move |ctx: AtomContext| {
                let url = ctx.dep(&url);
                async move { Ok::<_, BoxError>(format!("client({})", url?)) }
            }
        });

        let test_scope = create_scope(
            ScopeConfig::new()
                .name("test")
                .preset(Preset::value(&url, "sqlite::memory:".to_string())),
        );
        let prod_scope = Scope::new();

        assert_eq!(
            test_scope.resolve(&client).await.unwrap(),
            "client(sqlite::memory:)"
        );
        assert_eq!(
            prod_scope.resolve(&client).await.unwrap(),
            "client(postgres://prod)"
        );
    });
}

/// The snapshot serializes to the shape tooling expects.
#[test]
fn snapshot_serializes_to_json() {
    run_local(async {
        let (_, derived) = counter_and_derived();
        let scope = create_scope(ScopeConfig::new().name("app"));
        scope.resolve(&derived).await.unwrap();
        let _listener = scope.on_update(&derived, || {}).unwrap();

        let json = serde_json::to_value(scope.snapshot().unwrap()).unwrap();

        assert_eq!(json["scope"], "app");
        assert_eq!(json["atoms"][0]["name"], "derived");
        assert_eq!(json["atoms"][0]["status"], "resolved");
        assert_eq!(json["atoms"][0]["listeners"], 1);
        assert_eq!(json["atoms"][1]["dependents"][0], "derived");
    });
}

// ---- Extensions ----

struct Recorder {
    name: &'static str,
    log: Rc<RefCell<Vec<String>>>,
}

impl Extension for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn wrap_resolve(&self, next: ResolveFuture, atom: &AtomRef, _scope: &Scope) -> ResolveFuture {
        let log = Rc::clone(&self.log);
        let label = format!("{}:{}", self.name, atom.name());
        async move {
            log.borrow_mut().push(format!("{label}:before"));
            let result = next.await;
            log.borrow_mut().push(format!("{label}:after"));
            result
        }
        .boxed_local()
    }

    fn wrap_exec(&self, next: ExecFuture, target: &ExecTarget, _ctx: &ExecutionContext) -> ExecFuture {
        self.log
            .borrow_mut()
            .push(format!("{}:exec:{}", self.name, target.name()));
        next
    }
}

/// The first registered extension is the outermost wrapper.
#[test]
fn extensions_wrap_in_registration_order() {
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let atom = Atom::new("config", {
            let log = Rc::clone(&log);
            move |_| {
                log.borrow_mut().push("factory".to_string());
                async { Ok(1) }
            }
        });
        let scope = create_scope(
            ScopeConfig::new()
                .extension(Recorder {
                    name: "outer",
                    log: Rc::clone(&log),
                })
                .extension(Recorder {
                    name: "inner",
                    log: Rc::clone(&log),
                }),
        );

        scope.resolve(&atom).await.unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "factory",
                "outer:config:before",
                "inner:config:before",
                "inner:config:after",
                "outer:config:after",
            ]
        );

        log.borrow_mut().clear();
        let flow = Flow::new("greet", |_, name: String| async move { Ok(format!("hi {name}")) });
        let ctx = scope.create_context().unwrap();
        assert_eq!(ctx.exec(&flow, "ada".to_string()).await.unwrap(), "hi ada");
        assert_eq!(
            *log.borrow(),
            vec!["inner:exec:greet", "outer:exec:greet"]
        );
    });
}

struct Rejecting;

impl Extension for Rejecting {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn wrap_resolve(&self, _next: ResolveFuture, atom: &AtomRef, _scope: &Scope) -> ResolveFuture {
        let name = atom.name().to_string();
        async move {
            Err(Error::NotResolved { atom: name })
        }
        .boxed_local()
    }
}

struct FailingInit;

impl Extension for FailingInit {
    fn name(&self) -> &str {
        "failing-init"
    }

    fn init<'a>(&'a self, _scope: &'a Scope) -> LocalBoxFuture<'a, Result<(), BoxError>> {
        async { Err::<(), BoxError>("no credentials".into()) }.boxed_local()
    }
}

/// A wrapper error becomes the cached failure; an init error blocks every
/// resolution.
#[test]
fn extension_failures_surface_as_errors() {
    run_local(async {
        let runs = Rc::new(Cell::new(0));
        let atom = Atom::new("guarded", {
            let runs = Rc::clone(&runs);
            move |_| {
                runs.set(runs.get() + 1);
                async { Ok(1) }
            }
        });

        let scope = create_scope(ScopeConfig::new().extension(Rejecting));
        assert!(matches!(
            scope.resolve(&atom).await,
            Err(Error::NotResolved { .. })
        ));
        assert_eq!(scope.status(&atom), AtomStatus::Failed);
        assert!(scope.get(&atom).is_err());

        let scope = create_scope(ScopeConfig::new().extension(FailingInit));
        let err = scope.ready().await.unwrap_err();
        assert!(matches!(err, Error::ExtensionInit { ref extension, .. } if extension == "failing-init"));
        assert!(matches!(
            scope.resolve(&atom).await,
            Err(Error::ExtensionInit { .. })
        ));
    });
}

// ---- Execution contexts ----

/// A failing flow reports its error, the context still closes, and later
/// executions are rejected.
#[test]
fn failing_flow_then_close_rejects_new_work() {
    run_local(async {
        let scope = Scope::new();
        let ctx = scope.create_context().unwrap();
        let closed = Rc::new(Cell::new(false));
        ctx.on_close({
            let closed = Rc::clone(&closed);
            move || closed.set(true)
        });

        let charge = Flow::new("charge", |_, amount: u32| async move {
            if amount > 100 {
                return Err::<u32, BoxError>(Box::new(PaymentDeclined));
            }
            Ok(amount)
        });

        let err = ctx.exec(&charge, 500).await.unwrap_err();
        assert!(matches!(err, Error::FlowFailed { ref flow, .. } if flow == "charge"));
        assert!(err.downcast_source::<PaymentDeclined>().is_some());

        ctx.close().await;
        assert!(closed.get());
        assert_eq!(ctx.status(), ContextStatus::Closed);

        let err = ctx.exec(&charge, 5).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ExecutionContextClosed {
                status: ContextStatus::Closed,
                ..
            }
        ));
    });
}

/// A nested execution gets its own data map.
#[test]
fn nested_exec_has_isolated_data() {
    run_local(async {
        let user = Tag::<String>::new("user");
        let scope = Scope::new();
        let ctx = scope.create_context().unwrap();
        ctx.set(&user, "ada".to_string());

        let inspect = Flow::new("inspect", {
            let user = user.clone();
            move |child: ExecutionContext, _: ()| {
                let user = user.clone();
                async move {
                    let own = child.get(&user);
                    let contains = child.contains(&user);
                    let from_parent = child.parent().and_then(|parent| parent.get(&user));
                    Ok((own, contains, from_parent))
                }
            }
        });

        let (own, contains, from_parent) = ctx.exec(&inspect, ()).await.unwrap();
        assert_eq!(own, None);
        assert!(!contains);
        assert_eq!(from_parent.as_deref(), Some("ada"));
    });
}

/// Flows resolve their declared atoms before the body runs.
#[test]
fn flow_dependencies_are_resolved_first() {
    run_local(async {
        let rate = Atom::new("rate", |_| async { Ok(3u32) });
        let scope = Scope::new();
        let price = Flow::builder("price").dep(&rate).build({
            let rate = rate.clone();
            move |ctx: ExecutionContext, quantity: u32| {
                let rate = ctx.dep(&rate);
                async move { Ok::<_, BoxError>(rate? * quantity) }
            }
        });

        let ctx = scope.create_context().unwrap();
        assert_eq!(ctx.exec(&price, 4).await.unwrap(), 12);
        assert_eq!(scope.status(&rate), AtomStatus::Resolved);
    });
}

/// A flow's dependencies reflect writes queued just before `exec`.
#[test]
fn flow_dependencies_observe_queued_writes() {
    run_local(async {
        let rate = Atom::new("rate", |_| async { Ok(3u32) });
        let scope = Scope::new();
        scope.resolve(&rate).await.unwrap();
        let price = Flow::builder("price").dep(&rate).build({
            let rate = rate.clone();
            move |ctx: ExecutionContext, quantity: u32| {
                let rate = ctx.dep(&rate);
                async move { Ok::<_, BoxError>(rate? * quantity) }
            }
        });

        scope.controller(&rate).set(5).unwrap();
        let ctx = scope.create_context().unwrap();
        assert_eq!(ctx.exec(&price, 4).await.unwrap(), 20);
    });
}

/// An abort close cancels in-flight work.
#[test]
fn abort_close_cancels_in_flight_work() {
    run_local(async {
        let scope = Scope::new();
        let ctx = scope.create_context().unwrap();

        let worker = tokio::task::spawn_local({
            let ctx = ctx.clone();
            async move {
                ctx.run("long-poll", |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
                .await
            }
        });
        tokio::task::yield_now().await;

        ctx.close_with(CloseMode::Abort).await;

        let err = worker.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.status(), ContextStatus::Closed);
    });
}

/// Every close call returns the same handle and cleanups run once.
#[test]
fn close_is_idempotent() {
    run_local(async {
        let ctx = Scope::new().create_context().unwrap();
        let cleanups = Rc::new(Cell::new(0));
        ctx.on_close({
            let cleanups = Rc::clone(&cleanups);
            move || cleanups.set(cleanups.get() + 1)
        });

        let first = ctx.close();
        let second = ctx.close();

        first.await;
        second.clone().await;
        ctx.close().await;

        assert!(second.is_settled());
        assert_eq!(cleanups.get(), 1);
    });
}

/// The fail-fast and settled parallel helpers.
#[test]
fn parallel_helpers() {
    run_local(async {
        let ctx = Scope::new().create_context().unwrap();
        let double = Flow::new("double", |_, n: u32| async move { Ok(n * 2) });
        let halve = Flow::new("halve", |_, n: u32| async move {
            if n % 2 == 1 {
                return Err::<u32, BoxError>("odd".into());
            }
            Ok(n / 2)
        });

        let doubled = ctx
            .parallel((1..=3).map(|n| ctx.exec(&double, n)))
            .await
            .unwrap();
        assert_eq!(doubled, vec![2, 4, 6]);

        assert!(ctx
            .parallel((1..=3).map(|n| ctx.exec(&halve, n)))
            .await
            .is_err());

        let settled = ctx
            .parallel_settled((1..=4).map(|n| ctx.exec(&halve, n)))
            .await
            .unwrap();
        assert_eq!(settled.succeeded(), 2);
        assert_eq!(settled.failed(), 2);
        assert_eq!(settled.values().copied().collect::<Vec<_>>(), vec![1, 2]);
    });
}

/// Values flow through extensions type-erased and come out unchanged.
#[test]
fn erased_values_pass_through_extensions_unchanged() {
    struct Inspector {
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Extension for Inspector {
        fn name(&self) -> &str {
            "inspector"
        }

        fn wrap_resolve(&self, next: ResolveFuture, atom: &AtomRef, _scope: &Scope) -> ResolveFuture {
            let seen = Rc::clone(&self.seen);
            let name = atom.name().to_string();
            async move {
                let value = next.await?;
                if let Some(n) = value.downcast_ref::<i32>() {
                    seen.borrow_mut().push(format!("{name}={n}"));
                }
                Ok::<_, Error>(value)
            }
            .boxed_local()
        }
    }

    run_local(async {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let atom = Atom::new("n", |_| async { Ok(21) });
        let scope = create_scope(ScopeConfig::new().extension(Inspector {
            seen: Rc::clone(&seen),
        }));

        assert_eq!(scope.resolve(&atom).await.unwrap(), 21);
        assert_eq!(*seen.borrow(), vec!["n=21".to_string()]);
    });
}
