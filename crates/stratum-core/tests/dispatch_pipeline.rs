//! End-to-end dispatch tests.
//!
//! These drive layers through the runtime the way a host would: register
//! handles, obtain a call context, and invoke by type and implementation
//! name. Remote scenarios wire two runtimes to one loopback transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use stratum_core::distributed::DistributedLayer;
use stratum_core::{
    AccessDecision, BoxFuture, CallContext, Layer, LayerError, LayerHandle, LayerTarget,
    LoopbackTransport, OperationDescriptor, PluginLayer, Runtime, Session, StackFrame, Transport,
};
use tokio::sync::{Barrier, Notify};

#[derive(Debug, thiserror::Error)]
#[error("insufficient funds")]
struct InsufficientFunds;

/// Stateful billing layer: keeps a running balance and refuses overdrafts.
struct Billing {
    balance: std::sync::Mutex<i64>,
}

impl Billing {
    fn new(balance: i64) -> Self {
        Self {
            balance: std::sync::Mutex::new(balance),
        }
    }
}

impl LayerTarget for Billing {
    fn call<'a>(
        &'a self,
        _cx: &'a CallContext,
        operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move {
            let amount = args.first().and_then(Value::as_i64).unwrap_or_default();
            let mut balance = self.balance.lock().unwrap();
            match operation {
                "balance" => Ok(json!(*balance)),
                "charge" if amount > *balance => Err(LayerError::target(InsufficientFunds)),
                "charge" => {
                    *balance -= amount;
                    Ok(json!(*balance))
                }
                other => Err(LayerError::InvalidArguments {
                    operation: other.to_string(),
                    reason: "unsupported".into(),
                }),
            }
        })
    }
}

impl Layer for Billing {
    fn type_name(&self) -> &str {
        "billing::Account"
    }
}

/// Layer whose body calls another layer on the same worker and reports the
/// stack depth it saw from inside the nested call.
struct Checkout {
    nested_depth: AtomicUsize,
}

impl LayerTarget for Checkout {
    fn call<'a>(
        &'a self,
        cx: &'a CallContext,
        _operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move {
            let remaining = cx
                .invoke("billing::Account", "main", "charge", args.to_vec())
                .await?;
            let depth = cx
                .invoke("diag::Depth", "default", "depth", vec![])
                .await?;
            self.nested_depth
                .store(depth.as_u64().unwrap_or_default() as usize, Ordering::SeqCst);
            Ok(remaining)
        })
    }
}

impl Layer for Checkout {
    fn type_name(&self) -> &str {
        "shop::Checkout"
    }
}

struct Depth;

impl LayerTarget for Depth {
    fn call<'a>(
        &'a self,
        cx: &'a CallContext,
        _operation: &'a str,
        _args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move { Ok(json!(cx.stack_depth())) })
    }
}

impl Layer for Depth {
    fn type_name(&self) -> &str {
        "diag::Depth"
    }
}

/// Layer that parks inside its body so several workers overlap, then records
/// the innermost frame it sees.
struct Gate {
    name: &'static str,
    both_inside: Arc<Barrier>,
    entered: Option<Arc<Notify>>,
    release: Option<Arc<Notify>>,
    seen: std::sync::Mutex<Option<StackFrame>>,
}

impl Gate {
    fn new(name: &'static str, both_inside: Arc<Barrier>) -> Self {
        Self {
            name,
            both_inside,
            entered: None,
            release: None,
            seen: std::sync::Mutex::new(None),
        }
    }

    fn announce(mut self, entered: Arc<Notify>) -> Self {
        self.entered = Some(entered);
        self
    }

    fn hold(mut self, release: Arc<Notify>) -> Self {
        self.release = Some(release);
        self
    }

    fn seen_type(&self) -> Option<String> {
        self.seen.lock().unwrap().as_ref().map(|f| f.type_name.clone())
    }
}

impl LayerTarget for Gate {
    fn call<'a>(
        &'a self,
        cx: &'a CallContext,
        _operation: &'a str,
        _args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move {
            if let Some(entered) = &self.entered {
                entered.notify_one();
            }
            self.both_inside.wait().await;
            if let Some(release) = &self.release {
                release.notified().await;
            }
            *self.seen.lock().unwrap() = cx.current_frame();
            Ok(Value::Null)
        })
    }
}

impl Layer for Gate {
    fn type_name(&self) -> &str {
        self.name
    }
}

#[tokio::test]
async fn target_failure_reaches_caller_unchanged() {
    let runtime = Runtime::builder().build();
    let handle = runtime
        .register(LayerHandle::builder(Billing::new(10)).implementation("billing"))
        .await
        .unwrap();
    let cx = runtime.spawn_context().await;
    let depth = cx.stack_depth();

    let err = cx
        .invoke("billing::Account", "billing", "charge", vec![json!(50)])
        .await
        .unwrap_err();

    assert!(err.target_error().unwrap().is::<InsufficientFunds>());
    assert!(!err.is_rejection());
    assert_eq!(err.to_string(), "insufficient funds");
    let snap = handle.snapshot();
    assert_eq!(snap.invocation_count, 1);
    assert_eq!(snap.error_count, 1);
    assert_eq!(snap.execution_samples, 1);
    assert_eq!(cx.stack_depth(), depth);
}

#[tokio::test]
async fn stateful_layer_keeps_state_across_calls() {
    let runtime = Runtime::builder().build();
    runtime
        .register(LayerHandle::builder(Billing::new(100)).implementation("billing"))
        .await
        .unwrap();
    let cx = runtime.spawn_context().await;

    cx.invoke("billing::Account", "billing", "charge", vec![json!(30)])
        .await
        .unwrap();
    let balance = cx
        .invoke("billing::Account", "billing", "balance", vec![])
        .await
        .unwrap();
    assert_eq!(balance, json!(70));
}

#[tokio::test]
async fn nested_invocations_restore_stack() {
    let runtime = Runtime::builder().build();
    runtime
        .register(LayerHandle::builder(Billing::new(100)).implementation("main"))
        .await
        .unwrap();
    runtime
        .register(LayerHandle::builder(Depth).implementation("default"))
        .await
        .unwrap();
    let checkout = Arc::new(Checkout {
        nested_depth: AtomicUsize::new(0),
    });
    runtime
        .register(LayerHandle::plugin(PluginLayer::new("shop::Checkout", checkout.clone())))
        .await
        .unwrap();

    let cx = runtime.spawn_context().await;
    let depth = cx.stack_depth();

    let remaining = cx
        .invoke("shop::Checkout", "", "pay", vec![json!(25)])
        .await
        .unwrap();

    assert_eq!(remaining, json!(75));
    // Checkout frame plus the Depth frame itself.
    assert_eq!(checkout.nested_depth.load(Ordering::SeqCst), depth + 2);
    assert_eq!(cx.stack_depth(), depth);
}

#[tokio::test]
async fn refused_calls_leave_no_frame_behind() {
    let runtime = Runtime::builder().build();
    let plugin = PluginLayer::new("billing::Account", Arc::new(Billing::new(0)))
        .with_operations(vec![
            OperationDescriptor::new("balance"),
            OperationDescriptor::new("charge").with_permission("billing.write"),
        ])
        .with_access(|cx| {
            if cx.session().name() == "blocked" {
                Some(AccessDecision::denied("account frozen"))
            } else {
                Some(AccessDecision::GRANTED)
            }
        });
    let handle = runtime
        .register(LayerHandle::plugin(plugin).implementation("main"))
        .await
        .unwrap();

    let guest = runtime.spawn_context().await;
    let err = guest
        .invoke("billing::Account", "main", "charge", vec![json!(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, LayerError::PermissionDenied { .. }));
    assert!(err.is_rejection());
    assert_eq!(guest.stack_depth(), 0);

    let blocked = runtime
        .bind_context(guest.worker().id(), Arc::new(Session::new("blocked")))
        .await;
    let err = blocked
        .invoke("billing::Account", "main", "balance", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "account frozen");
    assert!(err.is_rejection());
    assert_eq!(blocked.stack_depth(), 0);

    let snap = handle.snapshot();
    assert_eq!(snap.invocation_count, 2);
    assert_eq!(snap.error_count, 0);
}

#[tokio::test]
async fn concurrent_workers_share_statistics() {
    let runtime = Runtime::builder().build();
    let handle = runtime
        .register(LayerHandle::builder(Depth).implementation("default"))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let runtime = runtime.clone();
        tasks.push(tokio::spawn(async move {
            let cx = runtime.spawn_context().await;
            for _ in 0..25 {
                cx.invoke("diag::Depth", "default", "depth", vec![])
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snap = handle.snapshot();
    assert_eq!(snap.invocation_count, 200);
    assert_eq!(snap.execution_samples, 200);
    assert_eq!(runtime.workers().len().await, 8);
}

#[tokio::test]
async fn overlapping_workers_each_see_their_own_frame() {
    let runtime = Runtime::builder().build();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let both_inside = Arc::new(Barrier::new(2));

    let first = Arc::new(Gate::new("svc::A", both_inside.clone()).announce(entered.clone()));
    let second = Arc::new(Gate::new("svc::B", both_inside).hold(release.clone()));
    runtime
        .register(LayerHandle::plugin(PluginLayer::new("svc::A", first.clone())))
        .await
        .unwrap();
    runtime
        .register(LayerHandle::plugin(PluginLayer::new("svc::B", second.clone())))
        .await
        .unwrap();

    let cx_a = runtime.spawn_context().await;
    let cx_b = runtime.spawn_context().await;
    let guest = cx_a.session();
    assert!(Arc::ptr_eq(&guest, &cx_b.session()));

    let a = tokio::spawn(async move { cx_a.invoke("svc::A", "", "run", vec![]).await });
    entered.notified().await;
    let b = tokio::spawn(async move { cx_b.invoke("svc::B", "", "run", vec![]).await });

    // A returns while B is still inside its body.
    a.await.unwrap().unwrap();
    release.notify_one();
    b.await.unwrap().unwrap();

    assert_eq!(first.seen_type().as_deref(), Some("svc::A"));
    assert_eq!(second.seen_type().as_deref(), Some("svc::B"));
    assert_eq!(guest.total_depth(), 0);
}

#[tokio::test]
async fn missing_layer_falls_back_to_remote_node() {
    let transport = Arc::new(LoopbackTransport::new());

    let server = Runtime::builder().transport(transport.clone()).build();
    let served = server
        .register(LayerHandle::builder(Billing::new(40)).implementation("main"))
        .await
        .unwrap();
    server
        .export(&transport, "billing::Account", "main", "^main(-.*)?$")
        .await
        .unwrap();

    let client = Runtime::builder().transport(transport.clone()).build();
    let cx = client.spawn_context().await;

    let balance = cx
        .invoke("billing::Account", "main-eu", "balance", vec![])
        .await
        .unwrap();
    assert_eq!(balance, json!(40));

    let err = cx
        .invoke("billing::Account", "main", "charge", vec![json!(100)])
        .await
        .unwrap_err();
    assert!(err.target_error().unwrap().is::<InsufficientFunds>());

    // Client-side forwarding handle and server-side handle both counted.
    let remote = client.layer("billing::Account", "main").await.unwrap();
    assert_eq!(remote.snapshot().invocation_count, 1);
    assert_eq!(remote.snapshot().error_count, 1);
    assert_eq!(served.snapshot().invocation_count, 2);
    // Remote calls ran on throwaway system workers, never as guest.
    assert!(server.workers().is_empty().await);
    assert_eq!(server.guest_session().completed_bindings(), 0);
}

#[tokio::test]
async fn unpublished_layer_is_not_found_even_with_transport() {
    let transport = Arc::new(LoopbackTransport::new());
    let runtime = Runtime::builder().transport(transport.clone()).build();
    let cx = runtime.spawn_context().await;

    let err = cx
        .invoke("billing::Account", "main", "balance", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, LayerError::NotFound { .. }));
}

#[tokio::test]
async fn publication_without_endpoint_reports_bridge_error() {
    let transport = Arc::new(LoopbackTransport::new());
    let runtime = Runtime::builder().transport(transport.clone()).build();
    runtime
        .publish("billing::Account", "main", "^main$")
        .await
        .unwrap();
    assert_eq!(
        runtime
            .bridge()
            .resolve_pattern("billing::Account", "main")
            .await
            .as_deref(),
        Some("^main$")
    );

    let cx = runtime.spawn_context().await;
    let err = cx
        .invoke("billing::Account", "main", "balance", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, LayerError::Bridge(_)));
}

#[tokio::test]
async fn no_transport_properties() {
    let runtime = Runtime::builder().build();
    let bridge = runtime.bridge();

    assert!(!bridge.is_connected());
    assert!(!bridge.is_published("billing::Account", "main").await);
    assert!(bridge.resolve_pattern("billing::Account", "main").await.is_none());

    let err = runtime
        .publish("billing::Account", "main", "^main$")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Network transport implementation not found");

    // A forwarding layer built by hand fails the same way.
    let handle = LayerHandle::builder(DistributedLayer::new(
        bridge.clone(),
        "billing::Account",
        "main",
    ))
    .build();
    let cx = runtime.spawn_context().await;
    let err = handle.invoke(&cx, "balance", vec![]).await.unwrap_err();
    assert!(matches!(err, LayerError::TransportUnavailable));
    assert_eq!(handle.snapshot().error_count, 1);
}

#[tokio::test]
async fn transport_trait_is_object_safe() {
    let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
    assert_eq!(transport.name(), "loopback");
    assert!(!transport.is_published("billing::Account", "main").await);
}
