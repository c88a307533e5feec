use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use stratum_core::{
    BoxFuture, CachingProxy, CallContext, Layer, LayerDescriptor, LayerError, LayerHandle,
    LayerTarget, Runtime, StatisticsSnapshot,
};

const ECHO_TYPE: &str = "probe::Echo";

/// Returns its arguments.
struct Echo;

impl LayerTarget for Echo {
    fn call<'a>(
        &'a self,
        _cx: &'a CallContext,
        _operation: &'a str,
        args: &'a [Value],
    ) -> BoxFuture<'a, Result<Value, LayerError>> {
        Box::pin(async move { Ok(Value::Array(args.to_vec())) })
    }
}

impl Layer for Echo {
    fn type_name(&self) -> &str {
        ECHO_TYPE
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub workers: usize,
    pub calls_per_worker: usize,
    pub elapsed_ms: f64,
    pub layers: Vec<LayerReport>,
}

#[derive(Debug, Serialize)]
pub struct LayerReport {
    #[serde(flatten)]
    pub descriptor: LayerDescriptor,
    pub statistics: StatisticsSnapshot,
}

/// Register the echo layers, drive them from `workers` concurrent workers
/// making `calls` invocations each, and collect statistics.
pub async fn run(
    runtime: &Runtime,
    workers: usize,
    calls: usize,
) -> Result<ProbeReport> {
    runtime
        .register(LayerHandle::builder(Echo).implementation("direct"))
        .await?;
    runtime
        .register(
            LayerHandle::builder(Echo)
                .implementation("cached")
                .proxy(Arc::new(CachingProxy::new(["echo"]))),
        )
        .await?;

    tracing::info!(workers, calls, "Starting load probe");
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(workers);
    for worker in 0..workers {
        let runtime = runtime.clone();
        tasks.push(tokio::spawn(async move {
            let cx = runtime.spawn_context().await;
            for call in 0..calls {
                let args = vec![Value::from(worker), Value::from(call % 8)];
                cx.invoke(ECHO_TYPE, "direct", "echo", args.clone()).await?;
                cx.invoke(ECHO_TYPE, "cached", "echo", args).await?;
            }
            Ok::<_, LayerError>(())
        }));
    }

    for task in tasks {
        task.await.context("probe worker panicked")??;
    }

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    tracing::info!(elapsed_ms, "Load probe finished");

    let layers = runtime
        .statistics()
        .await
        .into_iter()
        .map(|(descriptor, statistics)| LayerReport {
            descriptor,
            statistics,
        })
        .collect();

    Ok(ProbeReport {
        workers,
        calls_per_worker: calls,
        elapsed_ms,
        layers,
    })
}
