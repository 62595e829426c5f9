use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use mediarepo_service::caching::CacheOutcome;
use mediarepo_service::config::Config;
use mediarepo_service::services::SharedServices;
use mediarepo_test::Fakes;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_payload};

/// What happened to the requests of one workload.
#[derive(Debug, Default)]
struct Outcomes {
    hits: AtomicUsize,
    admitted: AtomicUsize,
    misses: AtomicUsize,
    errors: AtomicUsize,
}

impl Outcomes {
    fn record(&self, outcome: Option<CacheOutcome>) {
        let counter = match outcome {
            Some(CacheOutcome::Hit) => &self.hits,
            Some(CacheOutcome::Admitted) => &self.admitted,
            Some(CacheOutcome::Miss) => &self.misses,
            None => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub async fn perform_stresstest(
    service_config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let fakes = Fakes::new();
    fakes.remote.set_latency(workloads.upstream_latency);
    fakes.thumbnailer.set_latency(workloads.upstream_latency);
    fakes.previewer.set_latency(workloads.upstream_latency);

    // start the repository services
    let runtime = tokio::runtime::Handle::current();
    let services = SharedServices::new(service_config, fakes.collaborators(), runtime)
        .context("failed to start repository services")?;
    let services = Arc::new(services);

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(prepare_workload(i, &fakes, workload)))
        .collect();

    // warmup: run each workload once to make sure the upstreams have been hit
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let services = Arc::clone(&services);
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                let _ = process_payload(&services, &workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let services = Arc::clone(&services);
        let concurrency = workload.concurrency;

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let outcomes = Arc::new(Outcomes::default());
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let services = Arc::clone(&services);
                        let task_durations = Arc::clone(&task_durations);
                        let outcomes = Arc::clone(&outcomes);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = process_payload(&services, &workload).await;
                            outcomes.record(outcome.ok());

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations, outcomes)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, outcomes) = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        let hits = outcomes.hits.load(Ordering::Relaxed);
        let admitted = outcomes.admitted.load(Ordering::Relaxed);
        let misses = outcomes.misses.load(Ordering::Relaxed);
        let errors = outcomes.errors.load(Ordering::Relaxed);
        let hit_ratio = hits as f32 / ops as f32 * 100.0;
        println!(
            "  hits: {hits} ({hit_ratio:.1}%); admitted: {admitted}; misses: {misses}; errors: {errors}"
        );
    }

    Ok(())
}
