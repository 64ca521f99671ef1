//! The `Generator` wires the pacer, the synthesizer and the sink into one
//! running pipeline.
//!
//! This separates **rate generation** (the pacer task) from **work execution**
//! (worker tasks) and keeps the hot path in workers focused on building and
//! publishing one event.
//!
//! # High-level flow
//! 1. The configuration is validated, the synthesizer is probed once and the
//!    transport is checked. Any failure here aborts before the first emission.
//! 2. A shared execution context is created: the in-flight semaphore with
//!    `max_in_flight` permits and the run's cancellation token.
//! 3. The pacer task is spawned. It waits for each emission's deadline and a
//!    free permit, then hands the emission to the worker pool over a bounded
//!    channel.
//! 4. `max_in_flight` worker tasks are spawned. Each worker repeatedly:
//!    - takes the next emission from the channel,
//!    - synthesizes the event for its index,
//!    - delivers it through the sink and folds the resulting metric into a
//!      worker-local aggregate,
//!    - drops the emission, which returns its permit to the pacer.
//! 5. On cancellation (external, `run_for` elapsed, or a failed worker) the
//!    pacer stops and closes the channel. Workers drain what was already
//!    emitted without starting new retries. The generator waits up to `shutdown_grace` for
//!    them and merges their aggregates into the final result.
//!
//! # Tuning knobs
//! - `max_in_flight`: bound on emitted-but-unfinished events and size of the
//!   worker pool. Higher values hide more transport latency; lower values make
//!   backpressure bite sooner.
//! - `retry`: ceiling and delay curve for retryable failures. A long backoff
//!   keeps a permit busy for its whole duration.
//! - `shutdown_grace`: how long a clean shutdown may take before workers are
//!   aborted and the run is reported as failed.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::DeliveryAggregate,
    config::GeneratorConfig,
    error::Error,
    event::{Clock, IdSource, RandomIds, Synthesizer, SystemClock},
    pacer::{Emission, Pacer},
    sink::{DeliveryFailure, PublisherSink},
    transport::Transport,
};
use internals::*;

/// An emission this late counts as the pacer falling behind.
const BEHIND_SCHEDULE: Duration = Duration::from_secs(1);

pub struct Generator<T, C = SystemClock, I = RandomIds> {
    config: GeneratorConfig,
    synthesizer: Synthesizer<C, I>,
    sink: PublisherSink<T>,
}

impl<T: Transport> Generator<T> {
    /// A generator stamping events with the wall clock and random identifiers.
    pub fn new(config: GeneratorConfig, transport: T) -> Self {
        let sink = PublisherSink::new(transport, config.topic.clone(), config.retry)
            .with_attributes(config.attributes.clone());
        Self {
            config,
            synthesizer: Synthesizer::system(),
            sink,
        }
    }
}

impl<T, C, I> Generator<T, C, I>
where
    T: Transport,
    C: Clock + 'static,
    I: IdSource + 'static,
{
    /// Replace the clock and identifier source.
    pub fn with_synthesizer<C2, I2>(
        self,
        synthesizer: Synthesizer<C2, I2>,
    ) -> Generator<T, C2, I2> {
        Generator {
            config: self.config,
            synthesizer,
            sink: self.sink,
        }
    }

    /// Forward every dropped event to `failures`.
    pub fn with_failure_channel(mut self, failures: mpsc::Sender<DeliveryFailure>) -> Self {
        self.sink = self.sink.with_failure_channel(failures);
        self
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Run until `cancel` fires or the configured duration elapses.
    ///
    /// Returns the merged delivery totals once every emitted event has been
    /// published or dropped.
    pub async fn run(self, cancel: CancellationToken) -> Result<DeliveryAggregate, Error> {
        let Self {
            config,
            synthesizer,
            sink,
        } = self;

        config.validate()?;
        synthesizer.probe()?;
        sink.check().await?;

        let workers = config.max_in_flight;
        let run_token = cancel.child_token();
        if let Some(limit) = config.run_for {
            tokio::spawn(stop_after(limit, run_token.clone()));
        }

        let ctx = ExecutionContext::new(workers, run_token.clone());
        let (tx, rx) = mpsc::channel(workers);

        tracing::info!(
            events_per_second = config.rate.events_per_second().get(),
            topic = %config.topic,
            max_in_flight = workers,
            "Spawning pacer task..."
        );
        let pacer = Pacer::new(config.rate, ctx.permits.clone(), run_token.clone());
        let pacer = tokio::spawn(pacer_task(ctx.clone(), pacer, tx));

        tracing::info!("Spawning {workers} workers...");
        let handles = spawn_workers(
            ctx.clone(),
            workers,
            Arc::new(synthesizer),
            Arc::new(sink),
            rx,
        );

        // The pacer only returns once the run is over
        let pacer_result = pacer.await;
        run_token.cancel();
        tracing::info!(
            in_flight = ctx.in_flight(),
            "Pacer stopped, waiting for in-flight publishes..."
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let results = match tokio::time::timeout(config.shutdown_grace, join_all(handles)).await {
            Ok(results) => results,
            Err(_) => {
                tracing::error!(
                    in_flight = ctx.in_flight(),
                    "Shutdown grace period of {:?} elapsed, aborting workers",
                    config.shutdown_grace
                );
                aborts.iter().for_each(|a| a.abort());
                return Err(Error::ShutdownTimedOut(config.shutdown_grace));
            }
        };
        let emitted = pacer_result.map_err(|e| Error::TaskFailed(format!("pacer: {e}")))?;

        tracing::info!("Merging worker results...");
        let mut total = DeliveryAggregate::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(Ok(agg)) => total.merge(agg),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!("Worker panicked with error: {e}");
                    failure.get_or_insert(Error::TaskFailed(format!("worker: {e}")));
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        tracing::info!(
            emitted,
            published = total.published,
            failed = total.failed,
            "Generator stopped cleanly"
        );
        Ok(total)
    }
}

async fn stop_after(limit: Duration, token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(limit) => {
            tracing::info!("Run duration of {limit:?} elapsed, shutting down...");
            token.cancel();
        }
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Pacer and worker plumbing behind [`Generator::run`].
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// State shared by the pacer and every worker.
    #[derive(Clone)]
    pub struct ExecutionContext {
        /// One permit per event allowed in flight.
        pub permits: Arc<Semaphore>,
        /// Fires once the run should wind down.
        pub cancel: CancellationToken,
        capacity: usize,
    }

    impl ExecutionContext {
        pub fn new(max_in_flight: usize, cancel: CancellationToken) -> Self {
            Self {
                permits: Arc::new(Semaphore::new(max_in_flight)),
                cancel,
                capacity: max_in_flight,
            }
        }

        /// Events emitted and not yet finished.
        pub fn in_flight(&self) -> usize {
            self.capacity - self.permits.available_permits()
        }
    }

    /// Drives the pacer and forwards emissions to the workers.
    ///
    /// Returns the number of emitted indices.
    pub async fn pacer_task(
        ctx: ExecutionContext,
        mut pacer: Pacer,
        tx: mpsc::Sender<Emission>,
    ) -> u64 {
        tracing::debug!("Pacer task started.");
        let mut behind = false;

        while let Some(emission) = pacer.next().await {
            let lag = emission.lag();
            if lag >= BEHIND_SCHEDULE && !behind {
                behind = true;
                tracing::warn!(
                    index = %emission.index(),
                    ?lag,
                    in_flight = ctx.in_flight(),
                    "Pacer is behind schedule, sink is applying backpressure"
                );
            } else if lag < BEHIND_SCHEDULE && behind {
                behind = false;
                tracing::info!(index = %emission.index(), "Pacer caught up with schedule");
            }

            // Capacity equals the permit count, so this only waits if every
            // worker is gone.
            if tx.send(emission).await.is_err() {
                tracing::debug!("All workers gone, pacer stopping.");
                break;
            }
        }

        tracing::debug!(emitted = pacer.emitted(), "Pacer task finished.");
        pacer.emitted()
    }

    /// Spawns `workers` Tokio tasks that synthesize and deliver emissions.
    ///
    /// A worker that cannot synthesize an event, or that panics, cancels the
    /// run; the others drain the channel and return their aggregates.
    pub fn spawn_workers<T, C, I>(
        ctx: ExecutionContext,
        workers: usize,
        synthesizer: Arc<Synthesizer<C, I>>,
        sink: Arc<PublisherSink<T>>,
        rx: mpsc::Receiver<Emission>,
    ) -> Vec<JoinHandle<Result<DeliveryAggregate, Error>>>
    where
        T: Transport,
        C: Clock + 'static,
        I: IdSource + 'static,
    {
        let rx = Arc::new(Mutex::new(rx));
        (0..workers)
            .map(|i| {
                let ctx = ctx.clone();
                let synthesizer = synthesizer.clone();
                let sink = sink.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    let mut agg = DeliveryAggregate::new();
                    // Cancels the run unless the worker exits cleanly, panics included.
                    let stop_run = ctx.cancel.clone().drop_guard();
                    tracing::debug!("Worker {i} started.");

                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(emission) = next else {
                            break;
                        };

                        let event = match synthesizer.synthesize(emission.index()) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::error!("Worker {i} cannot synthesize events: {e}");
                                return Err(e.into());
                            }
                        };
                        let metric = sink.deliver(&event, &ctx.cancel).await;
                        agg.consume(&metric);

                        // Hands the permit back to the pacer.
                        drop(emission);
                    }

                    tracing::debug!("Worker {i} shutting down.");
                    stop_run.disarm();
                    Ok(agg)
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use super::*;
    use crate::{
        config::RateSpec,
        event::{
            SynthesisError,
            testing::{BrokenIds, ExhaustibleIds},
        },
        transport::{Message, PublishError},
    };

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicU64>);

    impl Transport for Counting {
        async fn publish(&self, _topic: &str, _message: &Message) -> Result<(), PublishError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Panics on its first publish and counts the ones after.
    #[derive(Clone, Default)]
    struct PanicsOnce {
        panicked: Arc<AtomicBool>,
        published: Arc<AtomicU64>,
    }

    impl Transport for PanicsOnce {
        async fn publish(&self, _topic: &str, _message: &Message) -> Result<(), PublishError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("transport bug");
            }
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(rate: u64) -> GeneratorConfig {
        GeneratorConfig::builder()
            .rate(RateSpec::new(rate).unwrap())
            .topic("t")
            .max_in_flight(4)
            .run_for(Duration::from_secs(2))
            .build()
    }

    #[test]
    fn in_flight_counts_held_permits() {
        let ctx = ExecutionContext::new(4, CancellationToken::new());
        assert_eq!(ctx.in_flight(), 0);
        let _a = ctx.permits.clone().try_acquire_owned().unwrap();
        let _b = ctx.permits.clone().try_acquire_owned().unwrap();
        assert_eq!(ctx.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_expected_number_of_workers() {
        let n = 10;
        let ctx = ExecutionContext::new(n, CancellationToken::new());
        let (_tx, rx) = mpsc::channel(n);
        let sink = PublisherSink::new(Counting::default(), "t", Default::default());
        let workers = spawn_workers(ctx, n, Arc::new(Synthesizer::system()), Arc::new(sink), rx);

        assert_eq!(workers.len(), n);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_fails_before_emitting() {
        let transport = Counting::default();
        let config = GeneratorConfig {
            topic: String::new(),
            ..config(10)
        };

        let err = Generator::new(config, transport.clone())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_randomness_fails_before_emitting() {
        let transport = Counting::default();
        let err = Generator::new(config(10), transport.clone())
            .with_synthesizer(Synthesizer::new(SystemClock, BrokenIds))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ClockOrRandomnessUnavailable(SynthesisError::Randomness(_))
        ));
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_for_stops_the_run() {
        let transport = Counting::default();
        let total = Generator::new(config(10), transport.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        let published = transport.0.load(Ordering::SeqCst);
        assert_eq!(total.published, published);
        assert!((19..=21).contains(&published), "published {published}");
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancellation_is_clean() {
        let transport = Counting::default();
        let config = GeneratorConfig {
            run_for: None,
            ..config(100)
        };
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Generator::new(config, transport.clone()).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let total = run.await.unwrap().unwrap();

        assert_eq!(total.failed, 0);
        assert!((99..=101).contains(&total.published));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_panic_stops_the_run() {
        let transport = PanicsOnce::default();
        let config = GeneratorConfig {
            run_for: Some(Duration::from_secs(60)),
            ..config(10)
        };
        let started = tokio::time::Instant::now();

        let err = Generator::new(config, transport.clone())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TaskFailed(_)), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failure_mid_run_stops_the_run() {
        let transport = Counting::default();
        let config = GeneratorConfig {
            run_for: Some(Duration::from_secs(60)),
            ..config(10)
        };
        // two ids for the startup probe, then two per event for three events
        let ids = ExhaustibleIds::new(2 + 2 * 3);
        let started = tokio::time::Instant::now();

        let err = Generator::new(config, transport.clone())
            .with_synthesizer(Synthesizer::new(SystemClock, ids))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ClockOrRandomnessUnavailable(SynthesisError::Randomness(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.0.load(Ordering::SeqCst), 3);
    }
}
