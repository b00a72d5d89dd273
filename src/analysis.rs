//! This module contains the core harvesting pipeline logic.

use crate::acquisition::AcquisitionService;
use crate::broker_registry::{BrokerConnection, BrokerRegistry, ChosenBrokerMarker};
use crate::candidates::{CandidateTask, build_candidate_queues};
use crate::candle::CandleSnapshot;
use crate::candle_store::CandleStore;
use crate::config::{RunConfig, TimeframeRequest};
use crate::error::PipelineError;
use crate::error_sink::{ErrorRecord, ErrorSink};
use crate::extrema::ExtremaDetector;
use crate::scheduler::RoundRobinScheduler;
use crate::session::SessionGate;
use crate::storage_utils::AsyncStorageManager;
use crate::terminal::{MarketTerminal, TerminalFactory};
use crate::tick_metadata::{TickMetadata, TickMetadataRegistry};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    /// Broker circuit open; the task never touched the terminal.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerSummary {
    pub tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub brokers: BTreeMap<String, BrokerSummary>,
    pub chosen: Vec<ChosenBrokerMarker>,
    pub errors: usize,
}

/// Components shared by every worker.
struct Harvester {
    acquisition: AcquisitionService,
    detector: ExtremaDetector,
    store: CandleStore,
    timeframes: Vec<TimeframeRequest>,
    sink: ErrorSink,
    ticks: TickMetadataRegistry,
    breaker_threshold: u32,
}

impl Harvester {
    /// Everything that happens inside one session for one task.
    async fn harvest(
        &self,
        terminal: &mut dyn MarketTerminal,
        storage: &AsyncStorageManager,
        broker: &BrokerConnection,
        task: &CandidateTask,
    ) -> TaskOutcome {
        let symbol = task.symbol.as_str();

        if let Err(e) = self.acquisition.select_symbol(terminal, symbol).await {
            self.sink
                .record(ErrorRecord::new(broker.normalized.as_str(), &e).symbol(symbol))
                .await;
            return TaskOutcome::Failed;
        }

        self.store_tick_metadata(terminal, storage, broker, symbol)
            .await;

        let mut persisted = 0;
        for request in &self.timeframes {
            let timeframe = request.timeframe;
            let report_error = |e: &PipelineError| {
                ErrorRecord::new(broker.normalized.as_str(), e)
                    .symbol(symbol)
                    .timeframe(timeframe)
            };

            let fetched = match self
                .acquisition
                .fetch(terminal, symbol, timeframe, request.bars)
                .await
            {
                Ok(fetched) => fetched,
                Err(failure) => {
                    self.sink
                        .record(report_error(&failure.error).bars(request.bars, failure.available))
                        .await;
                    continue;
                }
            };

            let available = fetched.candles.len();
            let snapshot = CandleSnapshot::new(symbol, timeframe, fetched.candles);

            let report = match self.store.write_snapshot(storage, &snapshot, Utc::now()).await {
                Ok(report) => report,
                Err(e) => {
                    self.sink
                        .record(report_error(&e).bars(request.bars, Some(available)))
                        .await;
                    continue;
                }
            };
            for issue in &report.issues {
                self.sink
                    .record(report_error(issue).bars(request.bars, Some(available)))
                    .await;
            }
            if report.full_written {
                persisted += 1;
            }

            let labels = self.detector.detect(&snapshot.plain_candles());
            debug!(
                symbol,
                %timeframe,
                highs = labels.highs.len(),
                lows = labels.lows.len(),
                "extrema detected"
            );
            if let Err(e) = self
                .store
                .write_extrema(storage, symbol, timeframe, &labels)
                .await
            {
                self.sink.record(report_error(&e)).await;
            }
        }

        if persisted > 0 {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Failed
        }
    }

    async fn store_tick_metadata(
        &self,
        terminal: &mut dyn MarketTerminal,
        storage: &AsyncStorageManager,
        broker: &BrokerConnection,
        symbol: &str,
    ) {
        let info = match terminal.symbol_info(symbol).await {
            Ok(info) => info,
            Err(e) => {
                let err = PipelineError::Data(format!("symbol info for {symbol}: {e}"));
                self.sink
                    .record(ErrorRecord::new(broker.normalized.as_str(), &err).symbol(symbol))
                    .await;
                return;
            }
        };

        let record = TickMetadata::new(symbol, &broker.identity, info);
        if let Err(e) = self.store.write_tick_metadata(storage, &record).await {
            self.sink
                .record(ErrorRecord::new(broker.normalized.as_str(), &e).symbol(symbol))
                .await;
        }
        match self.ticks.merge(record).await {
            Ok(true) => debug!(symbol, "combined tick metadata updated"),
            Ok(false) => {}
            Err(e) => {
                self.sink
                    .record(ErrorRecord::new(broker.normalized.as_str(), &e).symbol(symbol))
                    .await
            }
        }
    }
}

/// Per-broker task runner: owns the broker's storage root, its failure counter and stats.
struct BrokerWorker {
    broker: BrokerConnection,
    storage: AsyncStorageManager,
    harvester: Arc<Harvester>,
    consecutive_failures: u32,
    summary: BrokerSummary,
}

impl BrokerWorker {
    fn new(broker: BrokerConnection, root: &AsyncStorageManager, harvester: Arc<Harvester>) -> Self {
        let storage = root.child(&broker.settings.base_folder);
        Self {
            broker,
            storage,
            harvester,
            consecutive_failures: 0,
            summary: BrokerSummary::default(),
        }
    }

    /// One full acquire -> harvest -> release cycle.
    async fn run_task(&mut self, gate: &mut SessionGate, task: CandidateTask) -> TaskOutcome {
        self.summary.tasks += 1;

        if self.summary.circuit_open {
            debug!(broker = %self.broker.normalized, symbol = %task.symbol, "circuit open, skipping");
            self.summary.skipped += 1;
            return TaskOutcome::Skipped;
        }

        let outcome = match gate.acquire(&self.broker.identity, &self.broker.settings).await {
            Ok(terminal) => {
                self.consecutive_failures = 0;
                self.harvester
                    .harvest(terminal, &self.storage, &self.broker, &task)
                    .await
            }
            Err(e) => {
                self.harvester
                    .sink
                    .record(ErrorRecord::new(self.broker.normalized.as_str(), &e).symbol(&task.symbol))
                    .await;
                if e.is_connection() {
                    self.note_connection_failure().await;
                }
                TaskOutcome::Failed
            }
        };
        gate.release().await;

        match outcome {
            TaskOutcome::Succeeded => self.summary.succeeded += 1,
            TaskOutcome::Failed => self.summary.failed += 1,
            TaskOutcome::Skipped => self.summary.skipped += 1,
        }
        outcome
    }

    async fn note_connection_failure(&mut self) {
        self.consecutive_failures += 1;
        let threshold = self.harvester.breaker_threshold;
        if threshold == 0 || self.consecutive_failures < threshold {
            return;
        }

        self.summary.circuit_open = true;
        let err = PipelineError::Connection(format!(
            "{} consecutive connection failures, skipping {} for the rest of the run",
            self.consecutive_failures, self.broker.normalized
        ));
        warn!(broker = %self.broker.normalized, "circuit opened");
        self.harvester
            .sink
            .record(ErrorRecord::new(self.broker.normalized.as_str(), &err))
            .await;
    }
}

/// Runs the full harvesting pipeline:
/// 1. Picks one representative account per broker identity.
/// 2. Lists each representative's symbols and builds the candidate queues.
/// 3. Drains the queues round-robin, one session per task.
///
/// Every failure past configuration loading lands in the error log; none of them stops the run.
/// `gate` serves the registry, the queue build and (in sequential mode) every task; the
/// caller releases it once more after this returns.
pub async fn run_analysis_pipeline(
    run: &RunConfig,
    storage: &AsyncStorageManager,
    factory: Arc<dyn TerminalFactory>,
    gate: &mut SessionGate,
) -> RunSummary {
    let app = &run.app;
    let sink = ErrorSink::new(storage.clone(), app.error_log_file.as_str());
    let ticks =
        TickMetadataRegistry::open_or_empty(storage.clone(), app.tick_metadata_file.as_str(), &sink)
            .await;

    // Step 1: Broker representatives
    info!("--- Step 1: Selecting broker representatives ---");
    let registry = BrokerRegistry::build(&run.brokers, gate, storage, &sink).await;
    if registry.is_empty() {
        warn!("no broker could be reached");
    } else {
        info!(brokers = registry.len(), "representatives selected");
    }

    // Step 2: Candidate queues
    info!("--- Step 2: Building candidate queues ---");
    let queues = build_candidate_queues(&registry, &run.catalog, gate, &sink).await;
    info!(
        tasks = queues.total(),
        queues = queues.queue_count(),
        "candidate queues ready"
    );
    if queues.is_empty() {
        warn!("no catalog symbol is offered by any broker");
    }

    // Step 3: Harvest
    info!("--- Step 3: Harvesting candles ---");
    let harvester = Arc::new(Harvester {
        acquisition: AcquisitionService::new(app.retry),
        detector: ExtremaDetector::new(app.extrema.left, app.extrema.right),
        store: CandleStore::new(app.slice_sizes.clone(), app.latest_candle_naming),
        timeframes: app.timeframes.clone(),
        sink: sink.clone(),
        ticks,
        breaker_threshold: app.circuit_breaker_threshold,
    });

    let mut workers: BTreeMap<String, BrokerWorker> = registry
        .representatives()
        .map(|broker| {
            (
                broker.normalized.clone(),
                BrokerWorker::new(broker.clone(), storage, harvester.clone()),
            )
        })
        .collect();

    let scheduler = RoundRobinScheduler::new(queues);
    if app.parallel_brokers {
        let timeout = Duration::from_millis(app.connect_timeout_ms);
        workers = run_parallel(scheduler, workers, factory, timeout).await;
    } else {
        for task in scheduler {
            match workers.get_mut(&task.broker) {
                Some(worker) => {
                    worker.run_task(gate, task).await;
                }
                None => error!(broker = %task.broker, "task for unknown broker"),
            }
        }
    }

    RunSummary {
        brokers: workers
            .into_iter()
            .map(|(name, worker)| (name, worker.summary))
            .collect(),
        chosen: registry.markers().to_vec(),
        errors: sink.len().await,
    }
}

/// One worker per broker identity, each with its own terminal session. Tasks reach workers
/// over channels in scheduler order, so each broker still processes its symbols in order.
async fn run_parallel(
    scheduler: RoundRobinScheduler,
    workers: BTreeMap<String, BrokerWorker>,
    factory: Arc<dyn TerminalFactory>,
    connect_timeout: Duration,
) -> BTreeMap<String, BrokerWorker> {
    let mut senders: HashMap<String, mpsc::UnboundedSender<CandidateTask>> = HashMap::new();
    let mut handles = Vec::with_capacity(workers.len());

    for (name, mut worker) in workers {
        let (tx, mut rx) = mpsc::unbounded_channel::<CandidateTask>();
        senders.insert(name.clone(), tx);
        let mut gate = SessionGate::new(factory.create(), connect_timeout);

        handles.push(tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                worker.run_task(&mut gate, task).await;
            }
            gate.force_release().await;
            (name, worker)
        }));
    }

    for task in scheduler {
        match senders.get(&task.broker) {
            Some(tx) => {
                if tx.send(task).is_err() {
                    error!("broker worker stopped early");
                }
            }
            None => error!(broker = %task.broker, "task for unknown broker"),
        }
    }
    drop(senders);

    let mut finished = BTreeMap::new();
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((name, worker)) => {
                finished.insert(name, worker);
            }
            Err(e) => error!(error = %e, "broker worker panicked"),
        }
    }
    finished
}
