// src/pipeline/stream.rs
use crate::clustering::{ClusterMarker, Clusterer};
use crate::error::ConfigError;
use crate::formatters::LineFormatter;
use crate::input_format::{FieldSpec, LineParser, ParseContext};
use crate::pipeline::cluster::Cluster;
use crate::pipeline::config::{DeferTransformation, PipelineConfig, RejectedRecordAction};
use crate::pipeline::context::{
    CompletionStatus, Counters, ExecutionResult, Phase, PhaseEvent, PhaseStatus, ProgressEvent,
};
use crate::pipeline::fault::{
    guarded, guarded_async, position, ErrorHandler, FaultOrigin, FaultReport, FaultReporter,
};
use crate::pipeline::global_cache::GlobalCache;
use crate::pipeline::io::{LineSink, LineSource};
use crate::pipeline::record::{Record, TraceBin};
use crate::pipeline::registry::{FieldRegistry, TypeDefiner};
use crate::pipeline::stage::{stage_channel, StageReceiver, StageSender};
use crate::pipeline::transform::{Router, Transformer};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Runs before the first line is read (intake) or written (output)
pub type Initializer = Box<dyn FnOnce(&GlobalCache) -> anyhow::Result<()> + Send>;
/// Runs after processing when the matching initializer succeeded
pub type Disposer = Box<dyn FnOnce(&GlobalCache) -> anyhow::Result<()> + Send>;
/// Inspects a freshly parsed record; `false` rejects it
pub type RecordInitiator = Arc<dyn Fn(&Record, &TraceBin) -> anyhow::Result<bool> + Send + Sync>;
pub type PhaseHandler = Arc<dyn Fn(&PhaseEvent) + Send + Sync>;
pub type ProgressHandler = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Ready,
    Running,
    Executed,
    Disposed,
}

/// Why the intake stage stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntakeEnd {
    Depleted,
    LimitReached,
    TimedOut,
    Stopped,
}

/// Everything an execution consumes
struct Parts {
    source: Box<dyn LineSource>,
    sink: Box<dyn LineSink>,
    parser: Box<dyn LineParser>,
    formatter: Box<dyn LineFormatter>,
    marker: Option<ClusterMarker>,
    initiator: Option<RecordInitiator>,
    transformer: Transformer,
    router: Router,
    error_handler: Option<ErrorHandler>,
    intake_initializer: Option<Initializer>,
    output_initializer: Option<Initializer>,
    intake_disposer: Option<Disposer>,
    output_disposer: Option<Disposer>,
    phase_handler: Option<PhaseHandler>,
    progress_handler: Option<ProgressHandler>,
}

/// State shared by the stage workers of one execution
struct Shared {
    cache: Arc<GlobalCache>,
    registry: Arc<FieldRegistry>,
    counters: Counters,
    faults: FaultReporter,
    canceled: Arc<AtomicBool>,
    phase_handler: Option<PhaseHandler>,
}

impl Shared {
    fn phase(&self, phase: Phase, status: PhaseStatus) {
        let event = PhaseEvent {
            phase,
            status,
            counts: self.counters.snapshot(),
        };
        debug!(phase = ?phase, status = ?status, "Phase");
        if let Some(handler) = &self.phase_handler {
            if let Err(e) = guarded(|| {
                handler(&event);
                Ok(())
            }) {
                warn!(error = %e, "Phase handler failed");
            }
        }
    }

    /// Every stage stops on cancellation or once any fault was captured
    fn should_stop(&self) -> bool {
        self.canceled.load(Ordering::SeqCst) || self.faults.fault().is_some()
    }

    /// Next queued item, or `None` once the input closed or the run was
    /// stopped. Items still queued at that point are dropped.
    async fn next_item<T>(&self, rx: &mut StageReceiver<T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.faults.token().cancelled() => None,
            item = rx.recv() => item,
        }
    }
}

/// A cluster after routing: every record with its target
struct RoutedCluster {
    clstr_no: usize,
    records: Vec<(usize, Record)>,
}

/// A line as it leaves the intake stage
struct IntakeItem {
    text: String,
    source_no: usize,
    line_no: usize,
    is_header: bool,
}

/// Staged, concurrent line-to-line pipeline.
///
/// Lines flow from the source through parsing, clustering, transformation
/// and routing to the sink. Each stage is a tokio task connected to the next
/// by a queue. An instance runs once.
pub struct StreamPipeline {
    config: PipelineConfig,
    registry: Arc<FieldRegistry>,
    cache: Arc<GlobalCache>,
    token: CancellationToken,
    canceled: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    parts: Mutex<Option<Parts>>,
    deferred: Arc<Mutex<Vec<Cluster>>>,
    log_guard: Mutex<Option<WorkerGuard>>,
}

impl StreamPipeline {
    pub fn new(
        config: PipelineConfig,
        source: impl LineSource + 'static,
        sink: impl LineSink + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = FieldRegistry::new(config.allow_on_the_fly_input_fields)
            .with_explicit_types(&config.explicit_type_definitions)?;
        let names: Vec<String> = FieldSpec::parse_list(&config.input_fields)?
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        registry.declare(&names);

        let cache = GlobalCache::from_elements(&config.global_cache_elements)?;
        let parser = config.input_format.create_parser(&config)?;
        let formatter = config.output_format.create_formatter(&config)?;

        debug!(
            input_format = config.input_format.name(),
            output_format = config.output_format.name(),
            fields = names.len(),
            cache_elements = cache.len(),
            "Pipeline configured"
        );

        Ok(StreamPipeline {
            config,
            registry: Arc::new(registry),
            cache: Arc::new(cache),
            token: CancellationToken::new(),
            canceled: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::Ready),
            parts: Mutex::new(Some(Parts {
                source: Box::new(source),
                sink: Box::new(sink),
                parser,
                formatter,
                marker: None,
                initiator: None,
                transformer: Transformer::identity(),
                router: Router::default(),
                error_handler: None,
                intake_initializer: None,
                output_initializer: None,
                intake_disposer: None,
                output_disposer: None,
                phase_handler: None,
                progress_handler: None,
            })),
            deferred: Arc::new(Mutex::new(Vec::new())),
            log_guard: Mutex::new(None),
        })
    }

    fn configure(mut self, f: impl FnOnce(&mut Parts)) -> Self {
        if let Some(parts) = self.parts.get_mut().as_mut() {
            f(parts);
        }
        self
    }

    pub fn with_type_definer(self, definer: TypeDefiner) -> Self {
        self.registry.set_type_definer(definer);
        self
    }

    pub fn with_cluster_marker(self, marker: ClusterMarker) -> Self {
        self.configure(|parts| parts.marker = Some(marker))
    }

    pub fn with_record_initiator<F>(self, f: F) -> Self
    where
        F: Fn(&Record, &TraceBin) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.configure(|parts| parts.initiator = Some(Arc::new(f)))
    }

    pub fn with_transformer(self, transformer: Transformer) -> Self {
        self.configure(|parts| parts.transformer = transformer)
    }

    pub fn with_router(self, router: Router) -> Self {
        self.configure(|parts| parts.router = router)
    }

    /// Replace the parser built from the configured input format
    pub fn with_line_parser(self, parser: Box<dyn LineParser>) -> Self {
        self.configure(|parts| parts.parser = parser)
    }

    /// Replace the formatter built from the configured output format
    pub fn with_line_formatter(self, formatter: Box<dyn LineFormatter>) -> Self {
        self.configure(|parts| parts.formatter = formatter)
    }

    pub fn with_error_handler<F>(self, f: F) -> Self
    where
        F: Fn(&FaultReport) + Send + Sync + 'static,
    {
        self.configure(|parts| parts.error_handler = Some(Arc::new(f)))
    }

    pub fn with_intake_initializer<F>(self, f: F) -> Self
    where
        F: FnOnce(&GlobalCache) -> anyhow::Result<()> + Send + 'static,
    {
        self.configure(|parts| parts.intake_initializer = Some(Box::new(f)))
    }

    pub fn with_output_initializer<F>(self, f: F) -> Self
    where
        F: FnOnce(&GlobalCache) -> anyhow::Result<()> + Send + 'static,
    {
        self.configure(|parts| parts.output_initializer = Some(Box::new(f)))
    }

    pub fn with_intake_disposer<F>(self, f: F) -> Self
    where
        F: FnOnce(&GlobalCache) -> anyhow::Result<()> + Send + 'static,
    {
        self.configure(|parts| parts.intake_disposer = Some(Box::new(f)))
    }

    pub fn with_output_disposer<F>(self, f: F) -> Self
    where
        F: FnOnce(&GlobalCache) -> anyhow::Result<()> + Send + 'static,
    {
        self.configure(|parts| parts.output_disposer = Some(Box::new(f)))
    }

    pub fn on_phase<F>(self, f: F) -> Self
    where
        F: Fn(&PhaseEvent) + Send + Sync + 'static,
    {
        self.configure(|parts| parts.phase_handler = Some(Arc::new(f)))
    }

    pub fn on_progress<F>(self, f: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.configure(|parts| parts.progress_handler = Some(Arc::new(f)))
    }

    /// Keep the log writer alive for the pipeline's lifetime
    pub fn with_log_guard(self, guard: WorkerGuard) -> Self {
        *self.log_guard.lock() = Some(guard);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn global_cache(&self) -> &Arc<GlobalCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<FieldRegistry> {
        &self.registry
    }

    /// Clusters held back when transformation is deferred indefinitely.
    /// Each call takes what has accumulated so far.
    pub fn deferred_clusters(&self) -> Vec<Cluster> {
        std::mem::take(&mut *self.deferred.lock())
    }

    /// Ask a running execution to stop. Stages finish the item at hand;
    /// the execution completes as `Canceled`.
    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.canceled.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Release resources. Has no effect while an execution is running.
    pub fn dispose(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Running {
            warn!("Dispose ignored while the pipeline is executing");
            return;
        }
        *lifecycle = Lifecycle::Disposed;
        self.parts.lock().take();
        if self.config.close_logger_on_dispose {
            self.log_guard.lock().take();
        }
    }

    /// Run the pipeline to completion. A pipeline executes at most once;
    /// later calls (and calls after `dispose`) return `InvalidAttempt`.
    pub async fn execute(&self) -> ExecutionResult {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Ready {
                warn!(state = ?*lifecycle, "Pipeline cannot execute again");
                return ExecutionResult::invalid_attempt();
            }
            *lifecycle = Lifecycle::Running;
        }

        let parts = self.parts.lock().take();
        let result = match parts {
            Some(parts) => self.run(parts).await,
            None => ExecutionResult::invalid_attempt(),
        };

        *self.lifecycle.lock() = Lifecycle::Executed;
        info!(
            status = %result.completion_status,
            rows_read = result.rows_read,
            clusters_read = result.clusters_read,
            rows_written = result.rows_written,
            clusters_written = result.clusters_written,
            "Execution finished"
        );
        result
    }

    async fn run(&self, parts: Parts) -> ExecutionResult {
        let Parts {
            source,
            sink,
            parser,
            formatter,
            marker,
            initiator,
            transformer,
            router,
            error_handler,
            intake_initializer,
            output_initializer,
            intake_disposer,
            output_disposer,
            phase_handler,
            progress_handler,
        } = parts;

        let shared = Arc::new(Shared {
            cache: self.cache.clone(),
            registry: self.registry.clone(),
            counters: Counters::default(),
            faults: FaultReporter::new(error_handler, self.token.clone()),
            canceled: self.canceled.clone(),
            phase_handler,
        });

        let (intake_ready, output_ready) =
            self.initialize(&shared, intake_initializer, output_initializer);
        if !(intake_ready && output_ready) {
            self.dispose_parts(&shared, intake_ready, intake_disposer, output_ready, output_disposer);
            return ExecutionResult::new(
                CompletionStatus::InitializationError,
                shared.counters.snapshot(),
            );
        }

        let started = Instant::now();
        let deadline = self.config.time_limit.map(|limit| started + limit);
        let config = &self.config;

        let (line_tx, line_rx) = stage_channel(config.stage_capacity(config.intake_buffer_factor));
        let (record_tx, record_rx) =
            stage_channel(config.stage_capacity(config.intake_buffer_factor));
        let (cluster_tx, cluster_rx) =
            stage_channel(config.stage_capacity(config.transform_buffer_factor));
        let (transformed_tx, transformed_rx) =
            stage_channel(config.stage_capacity(config.transform_buffer_factor));
        let (routed_tx, routed_rx) =
            stage_channel(config.stage_capacity(config.output_buffer_factor));

        let intake = tokio::spawn(intake_stage(
            shared.clone(),
            source,
            line_tx,
            config.headers_in_first_input_row,
            config.intake_record_limit,
            deadline,
        ));
        let parse = tokio::spawn(parse_stage(
            shared.clone(),
            parser,
            initiator,
            config.rejected_record_action,
            line_rx,
            record_tx,
        ));
        let cluster = tokio::spawn(cluster_stage(
            shared.clone(),
            Clusterer::new(marker, config.marker_starts_cluster),
            config.defer_transformation,
            self.deferred.clone(),
            record_rx,
            cluster_tx,
        ));
        let transform = tokio::spawn(transform_stage(
            shared.clone(),
            transformer,
            config.concurrency_level,
            cluster_rx,
            transformed_tx,
        ));
        let route = tokio::spawn(route_stage(shared.clone(), router, transformed_rx, routed_tx));
        let output = tokio::spawn(output_stage(
            shared.clone(),
            sink,
            formatter,
            OutputFields {
                configured: self.output_field_names(),
                positional: config.output_format.is_positional(),
            },
            config.headers_in_first_output_row,
            progress_handler.map(|handler| (config.progress_interval, handler, started)),
            routed_rx,
        ));

        let intake_end = match intake.await {
            Ok(end) => end,
            Err(e) => {
                shared.faults.report(FaultOrigin::Intake, String::new(), anyhow::anyhow!(e));
                IntakeEnd::Stopped
            }
        };
        for (origin, task) in [
            (FaultOrigin::Parsing, parse),
            (FaultOrigin::Clustering, cluster),
            (FaultOrigin::Transforming, transform),
            (FaultOrigin::Routing, route),
            (FaultOrigin::Output, output),
        ] {
            if let Err(e) = task.await {
                shared.faults.report(origin, String::new(), anyhow::anyhow!(e));
            }
        }

        self.dispose_parts(&shared, true, intake_disposer, true, output_disposer);

        let status = if shared.faults.has_fault() {
            CompletionStatus::Failed
        } else if self.canceled.load(Ordering::SeqCst) {
            CompletionStatus::Canceled
        } else {
            match intake_end {
                IntakeEnd::LimitReached => CompletionStatus::LimitReached,
                IntakeEnd::TimedOut => CompletionStatus::TimedOut,
                IntakeEnd::Depleted | IntakeEnd::Stopped => CompletionStatus::IntakeDepleted,
            }
        };
        ExecutionResult::new(status, shared.counters.snapshot())
    }

    fn output_field_names(&self) -> Vec<String> {
        self.config
            .output_fields
            .iter()
            .map(|spec| match spec.split_once('|') {
                Some((name, _)) => name.trim().to_string(),
                None => spec.trim().to_string(),
            })
            .collect()
    }

    /// Returns whether intake and output are ready. Without eager
    /// initialization the output is only initialized after the intake.
    fn initialize(
        &self,
        shared: &Shared,
        intake: Option<Initializer>,
        output: Option<Initializer>,
    ) -> (bool, bool) {
        let run = |origin: FaultOrigin, init: Option<Initializer>| match init {
            Some(init) => match guarded(|| init(&shared.cache)) {
                Ok(()) => true,
                Err(e) => {
                    shared.faults.report(origin, String::new(), e);
                    false
                }
            },
            None => true,
        };

        let intake_ready = run(FaultOrigin::InitializingIntake, intake);
        let output_ready = if intake_ready || self.config.eager_initialization {
            run(FaultOrigin::InitializingOutput, output)
        } else {
            false
        };
        (intake_ready, output_ready)
    }

    fn dispose_parts(
        &self,
        shared: &Shared,
        intake_ready: bool,
        intake: Option<Disposer>,
        output_ready: bool,
        output: Option<Disposer>,
    ) {
        for (ready, origin, disposer) in [
            (intake_ready, FaultOrigin::DisposingIntake, intake),
            (output_ready, FaultOrigin::DisposingOutput, output),
        ] {
            if let (true, Some(disposer)) = (ready, disposer) {
                if let Err(e) = guarded(|| disposer(&shared.cache)) {
                    shared.faults.report(origin, String::new(), e);
                }
            }
        }
    }
}

async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn intake_stage(
    shared: Arc<Shared>,
    mut source: Box<dyn LineSource>,
    tx: StageSender<IntakeItem>,
    headers: bool,
    limit: Option<usize>,
    deadline: Option<Instant>,
) -> IntakeEnd {
    shared.phase(Phase::Intake, PhaseStatus::Starting);

    let mut line_no = 0;
    let mut rows = 0;
    let mut seen_sources = HashSet::new();
    let end = loop {
        if limit.is_some_and(|limit| rows >= limit) {
            break IntakeEnd::LimitReached;
        }
        let supplied = tokio::select! {
            biased;
            _ = shared.faults.token().cancelled() => break IntakeEnd::Stopped,
            _ = deadline_passed(deadline) => break IntakeEnd::TimedOut,
            supplied = guarded_async(source.supply(&shared.cache)) => supplied,
        };
        let line = match supplied {
            Ok(Some(line)) => line,
            Ok(None) => break IntakeEnd::Depleted,
            Err(e) => {
                shared.faults.report(FaultOrigin::Intake, position::after_line(line_no), e);
                break IntakeEnd::Stopped;
            }
        };

        line_no += 1;
        let is_header = headers && seen_sources.insert(line.source_no);
        if !is_header {
            rows += 1;
            shared.counters.add_row_read();
        }
        let item = IntakeItem {
            text: line.text,
            source_no: line.source_no,
            line_no,
            is_header,
        };
        if !tx.send(item).await || shared.should_stop() {
            break IntakeEnd::Stopped;
        }
    };

    match end {
        IntakeEnd::LimitReached => info!(rows, "Intake record limit reached"),
        IntakeEnd::TimedOut => info!(rows, "Time limit reached"),
        _ => debug!(rows, lines = line_no, end = ?end, "Intake finished"),
    }
    shared.phase(Phase::Intake, PhaseStatus::Finished);
    end
}

async fn parse_stage(
    shared: Arc<Shared>,
    mut parser: Box<dyn LineParser>,
    initiator: Option<RecordInitiator>,
    rejected: RejectedRecordAction,
    mut rx: StageReceiver<IntakeItem>,
    tx: StageSender<Record>,
) {
    let mut rec_no = 0;

    while let Some(line) = shared.next_item(&mut rx).await {
        let ctx = ParseContext {
            registry: &shared.registry,
            line_no: line.line_no,
            source_no: line.source_no,
        };
        let parsed = if line.is_header {
            guarded(|| parser.parse_header(&line.text, &ctx)).map(|()| Vec::new())
        } else {
            guarded(|| parser.parse_line(&line.text, &ctx))
        };
        let records = match parsed {
            Ok(records) => records,
            Err(e) => {
                shared.faults.report(FaultOrigin::Parsing, position::at_line(line.line_no), e);
                return;
            }
        };

        for mut record in records {
            rec_no += 1;
            record.set_rec_no(rec_no);
            record.set_source_no(line.source_no);

            if let Some(initiator) = &initiator {
                let bin = TraceBin::new();
                match guarded(|| initiator(&record, &bin)) {
                    Ok(true) => {}
                    Ok(false) if rejected == RejectedRecordAction::Exclude => {
                        debug!(rec_no, "Record rejected");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        shared
                            .faults
                            .report(FaultOrigin::InitiatingRecord, position::at_record(rec_no), e);
                        return;
                    }
                }
                if !bin.is_empty() {
                    record.set_trace_bin(Some(bin));
                }
            }

            if !tx.send(record).await {
                return;
            }
        }
    }
}

async fn cluster_stage(
    shared: Arc<Shared>,
    mut clusterer: Clusterer,
    defer: DeferTransformation,
    deferred: Arc<Mutex<Vec<Cluster>>>,
    mut rx: StageReceiver<Record>,
    tx: StageSender<Cluster>,
) {
    let mut held = Vec::new();

    // the cluster to forward now, if any
    let emit = |cluster: Cluster, held: &mut Vec<Cluster>| {
        shared.counters.add_cluster_read();
        match defer {
            DeferTransformation::NotDeferred => Some(cluster),
            DeferTransformation::UntilClusteringCompleted => {
                held.push(cluster);
                None
            }
            DeferTransformation::Indefinitely => {
                deferred.lock().push(cluster);
                None
            }
        }
    };

    while let Some(record) = shared.next_item(&mut rx).await {
        let rec_no = record.rec_no();
        match guarded(|| clusterer.add_record(record)) {
            Ok(Some(cluster)) => {
                if let Some(cluster) = emit(cluster, &mut held) {
                    if !tx.send(cluster).await {
                        return;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                shared.faults.report(FaultOrigin::Clustering, position::at_record(rec_no), e);
                return;
            }
        }
    }

    // an interrupted intake leaves the last cluster incomplete
    if shared.faults.token().is_cancelled() {
        return;
    }
    if let Some(cluster) = clusterer.flush() {
        if let Some(cluster) = emit(cluster, &mut held) {
            if !tx.send(cluster).await {
                return;
            }
        }
    }
    debug!(clusters = clusterer.clusters_emitted(), held = held.len(), "Clustering completed");
    for cluster in held {
        if !tx.send(cluster).await {
            return;
        }
    }
}

async fn transform_stage(
    shared: Arc<Shared>,
    transformer: Transformer,
    concurrency: usize,
    mut rx: StageReceiver<Cluster>,
    tx: StageSender<Cluster>,
) {
    shared.phase(Phase::Transformation, PhaseStatus::Starting);

    let mut running = FuturesUnordered::new();
    let mut input_open = true;
    loop {
        if shared.should_stop() || (!input_open && running.is_empty()) {
            break;
        }
        tokio::select! {
            Some((clstr_no, joined)) = running.next(), if !running.is_empty() => {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => Err(anyhow::anyhow!("transformation task failed: {}", e)),
                };
                match result {
                    // a result finishing after a fault is dropped
                    Ok(_) if shared.should_stop() => break,
                    Ok(clusters) => {
                        for cluster in clusters {
                            if !tx.send(cluster).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        shared
                            .faults
                            .report(FaultOrigin::Transforming, position::at_cluster(clstr_no), e);
                        break;
                    }
                }
            }
            item = shared.next_item(&mut rx), if input_open && running.len() < concurrency => {
                match item {
                    Some(cluster) => {
                        let clstr_no = cluster.clstr_no();
                        let transformer = transformer.clone();
                        let cache = shared.cache.clone();
                        let task = tokio::task::spawn_blocking(move || {
                            guarded(|| transformer.apply(cluster, &cache))
                        });
                        running.push(task.map(move |joined| (clstr_no, joined)));
                    }
                    None => input_open = false,
                }
            }
        }
    }

    shared.phase(Phase::Transformation, PhaseStatus::Finished);
}

async fn route_stage(
    shared: Arc<Shared>,
    router: Router,
    mut rx: StageReceiver<Cluster>,
    tx: StageSender<RoutedCluster>,
) {
    while let Some(cluster) = shared.next_item(&mut rx).await {
        let clstr_no = cluster.clstr_no();
        match guarded(|| router.route(cluster, &shared.cache)) {
            Ok(records) => {
                if !tx.send(RoutedCluster { clstr_no, records }).await {
                    return;
                }
            }
            Err(e) => {
                shared.faults.report(FaultOrigin::Routing, position::at_cluster(clstr_no), e);
                return;
            }
        }
    }
}

/// Output field names: the configured ones, or the registry for positional
/// formats. Self-describing formats follow each record's own keys.
struct OutputFields {
    configured: Vec<String>,
    positional: bool,
}

impl OutputFields {
    fn resolve(&self, registry: &FieldRegistry) -> Vec<String> {
        if self.configured.is_empty() && self.positional {
            registry.fields()
        } else {
            self.configured.clone()
        }
    }
}

async fn output_stage(
    shared: Arc<Shared>,
    mut sink: Box<dyn LineSink>,
    formatter: Box<dyn LineFormatter>,
    fields: OutputFields,
    headers: bool,
    progress: Option<(usize, ProgressHandler, Instant)>,
    mut rx: StageReceiver<RoutedCluster>,
) {
    shared.phase(Phase::Output, PhaseStatus::Starting);

    let mut targets = BTreeSet::new();
    let mut failed = false;
    'clusters: while let Some(routed) = shared.next_item(&mut rx).await {
        // format the whole cluster before delivering any of it
        let mut lines = Vec::with_capacity(routed.records.len());
        for (target, record) in &routed.records {
            let names = fields.resolve(&shared.registry);
            match guarded(|| formatter.format(record, &names)) {
                Ok(line) => lines.push((*target, line, names)),
                Err(e) => {
                    shared
                        .faults
                        .report(FaultOrigin::Output, position::at_record(record.rec_no()), e);
                    failed = true;
                    break 'clusters;
                }
            }
        }

        for (target, line, names) in lines {
            if targets.insert(target) && headers {
                if let Some(header) = formatter.header(&names) {
                    if let Err(e) =
                        guarded_async(sink.consume(Some(header.clone()), target, &shared.cache)).await
                    {
                        shared
                            .faults
                            .report(FaultOrigin::Output, position::at_output_line(&header), e);
                        failed = true;
                        break 'clusters;
                    }
                }
            }
            let context = position::at_output_line(&line);
            if let Err(e) = guarded_async(sink.consume(Some(line), target, &shared.cache)).await {
                shared.faults.report(FaultOrigin::Output, context, e);
                failed = true;
                break 'clusters;
            }
            shared.counters.add_rows_written(1);
        }

        let written = shared.counters.add_cluster_written();
        if let Some((interval, handler, started)) = &progress {
            if *interval > 0 && written % interval == 0 {
                let event = ProgressEvent {
                    counts: shared.counters.snapshot(),
                    elapsed: started.elapsed(),
                };
                debug!(clusters_written = written, clstr_no = routed.clstr_no, "Progress");
                if let Err(e) = guarded(|| {
                    handler(&event);
                    Ok(())
                }) {
                    warn!(error = %e, "Progress handler failed");
                }
            }
        }
    }

    if !failed {
        let ends: Vec<usize> = if targets.is_empty() {
            vec![1]
        } else {
            targets.into_iter().collect()
        };
        for target in ends {
            if let Err(e) = guarded_async(sink.consume(None, target, &shared.cache)).await {
                shared.faults.report(FaultOrigin::Output, String::new(), e);
                break;
            }
        }
    }

    shared.phase(Phase::Output, PhaseStatus::Finished);
}
