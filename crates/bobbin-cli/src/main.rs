//! bobbin demo: one queue, one worker and an event listener on an in-memory
//! store, walking through global and local pause.
//!
//! Usage: `bobbin-cli [worker-config.json]`

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use bobbin_core::{
    Backoff, EventKind, InMemoryStore, Job, JobError, JobOptions, JobState, JobStore, Processor,
    ProcessorRegistry, Queue, QueueEvent, QueueEvents, QueueEventsConfig, Worker, WorkerConfig,
    WorkerOptions, processor_fn,
};

const QUEUE: &str = "demo";

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Fails the first `n` executions, then greets.
struct HelloProcessor {
    remaining_failures: AtomicU32,
}

impl HelloProcessor {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Processor for HelloProcessor {
    async fn process(&self, job: Job) -> Result<Value, JobError> {
        let payload: HelloPayload = job.data_as()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(JobError::new(format!("intentional failure (left={left})")));
        }
        Ok(json!({ "greeting": format!("Hello, {}!", payload.name) }))
    }
}

fn load_config() -> Result<WorkerConfig, Box<dyn Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(WorkerConfig::from_json(&std::fs::read_to_string(path)?)?),
        None => Ok(WorkerConfig {
            drain_delay_ms: 1_000,
            ..WorkerConfig::default()
        }),
    }
}

async fn print_counts(queue: &Queue, label: &str) -> Result<(), Box<dyn Error>> {
    let counts = queue.get_job_counts(&JobState::ALL).await?;
    println!("{label}: {}", serde_json::to_string(&counts)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
    let queue = Queue::new(QUEUE, Arc::clone(&store));

    // (A) event listener
    let events = QueueEvents::new(QUEUE, Arc::clone(&store), QueueEventsConfig::default());
    for kind in [EventKind::Paused, EventKind::Resumed, EventKind::Drained] {
        events.on(kind, |event, id| println!("event {id}: {}", event.kind()));
    }
    events.on(EventKind::Waiting, |event, id| {
        if let QueueEvent::Waiting { job_id, prev } = event {
            let prev = prev.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            println!("event {id}: job {job_id} waiting (prev={prev})");
        }
    });
    events.on(EventKind::Completed, |event, id| {
        if let QueueEvent::Completed { job_id, return_value } = event {
            println!("event {id}: job {job_id} completed -> {return_value}");
        }
    });
    events.on(EventKind::Failed, |event, id| {
        if let QueueEvent::Failed { job_id, failed_reason } = event {
            println!("event {id}: job {job_id} failed: {failed_reason}");
        }
    });
    events.wait_until_ready().await?;

    // (B) processors, routed by job name
    let mut registry = ProcessorRegistry::new();
    registry.register("hello", Arc::new(HelloProcessor::new(2)))?;
    registry.register(
        "nap",
        Arc::new(processor_fn(|job: Job| async move {
            let ms = job.data["ms"].as_u64().unwrap_or(100);
            sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        })),
    )?;

    // (C) global pause: a delayed job lands in paused once its delay elapses
    queue
        .add("nap", json!({ "ms": 50 }), JobOptions::new().with_delay(Duration::from_millis(300)))
        .await?;
    print_counts(&queue, "after delayed add").await?;
    queue.pause().await?;
    sleep(Duration::from_millis(500)).await;
    print_counts(&queue, "paused, delay elapsed").await?;

    // (D) start the worker; nothing runs until resume
    let worker = Worker::new(QUEUE, registry, WorkerOptions::new(Arc::clone(&store)).with_config(config))?;
    queue
        .add(
            "hello",
            json!({ "name": "bobbin" }),
            JobOptions::new()
                .with_attempts(3)
                .with_backoff(Backoff::exponential(Duration::from_millis(100))),
        )
        .await?;
    queue.resume().await?;

    // (E) local pause waits for the running job, then holds new ones back
    queue.add("nap", json!({ "ms": 300 }), JobOptions::new()).await?;
    sleep(Duration::from_millis(50)).await;
    worker.pause().await;
    info!(in_flight = worker.in_flight(), "worker drained");
    queue.add("nap", json!({ "ms": 10 }), JobOptions::new()).await?;
    print_counts(&queue, "worker paused").await?;
    worker.resume();

    // (F) poll until everything settled
    loop {
        let done = queue
            .get_job_count_by_types(&[JobState::Completed, JobState::Failed])
            .await?;
        if done == 4 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    print_counts(&queue, "final").await?;

    worker.close().await?;
    events.close().await;
    queue.close().await?;
    Ok(())
}
