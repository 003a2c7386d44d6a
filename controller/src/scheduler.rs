//! Turns "this node is unhealthy" into a cordon followed by a buffered drain.
//!
//! A single dispatch loop consumes node notifications in order and owns every `DrainRecord`. Cordoning happens
//! inline; each drain runs as its own task, waits for the start time it reserved from the `DrainBuffer`, and
//! reports progress back to the loop over a channel.
use crate::buffer::DrainBuffer;
use crate::error::Result;
use crate::events::{EventRecorder, EventSeverity};
use crate::filter::NodeFilterChain;
use crate::metrics::DrainerMetrics;
use crate::runner::Shutdown;
use crate::statemachine::{DrainPhase, DrainRecord};
use crate::watch::NodeEvent;
use models::constants::{
    EVENT_REASON_CORDON_FAILED, EVENT_REASON_CORDON_SUCCEEDED, EVENT_REASON_DRAIN_FAILED,
    EVENT_REASON_DRAIN_SUCCEEDED,
};
use models::node::{
    matching_condition, unhealthy_since, CordonDrainer, CordonOutcome, NodeConditionSpec,
};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{event, instrument, Level};

/// Progress reported by a drain task. `generation` identifies the task that sent it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DrainProgress {
    Started {
        node_name: String,
        generation: u64,
    },
    Completed {
        node_name: String,
        generation: u64,
        retries: u32,
        /// `None` if the drain succeeded.
        error: Option<String>,
    },
}

/// The drain task currently responsible for a node.
#[derive(Debug)]
struct DrainTask {
    generation: u64,
    handle: AbortHandle,
}

/// Everything a drain task needs, shared across tasks.
struct DrainTaskContext<D, R> {
    drainer: Arc<D>,
    recorder: Arc<R>,
    metrics: DrainerMetrics,
    progress: mpsc::UnboundedSender<DrainProgress>,
    shutdown: Shutdown,
}

impl<D, R> Clone for DrainTaskContext<D, R> {
    fn clone(&self) -> Self {
        DrainTaskContext {
            drainer: Arc::clone(&self.drainer),
            recorder: Arc::clone(&self.recorder),
            metrics: self.metrics.clone(),
            progress: self.progress.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

pub struct DrainScheduler<D: CordonDrainer, R: EventRecorder> {
    drainer: Arc<D>,
    recorder: Arc<R>,
    metrics: DrainerMetrics,
    filters: NodeFilterChain,
    conditions: Vec<NodeConditionSpec>,
    buffer: DrainBuffer,
    records: HashMap<String, DrainRecord>,
    tasks: HashMap<String, DrainTask>,
    next_generation: u64,
}

impl<D, R> DrainScheduler<D, R>
where
    D: CordonDrainer + 'static,
    R: EventRecorder + 'static,
{
    pub fn new(
        drainer: D,
        recorder: R,
        metrics: DrainerMetrics,
        filters: NodeFilterChain,
        conditions: Vec<NodeConditionSpec>,
        buffer: DrainBuffer,
    ) -> Self {
        DrainScheduler {
            drainer: Arc::new(drainer),
            recorder: Arc::new(recorder),
            metrics,
            filters,
            conditions,
            buffer,
            records: HashMap::new(),
            tasks: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn record(&self, node_name: &str) -> Option<&DrainRecord> {
        self.records.get(node_name)
    }

    pub fn records(&self) -> impl Iterator<Item = &DrainRecord> {
        self.records.values()
    }

    /// Dispatches node events until the event stream ends or shutdown is triggered.
    ///
    /// On the way out, drains still waiting for their start time are abandoned, while drains that have started
    /// are awaited.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<NodeEvent>,
        shutdown: Shutdown,
    ) -> Result<()> {
        let (progress_sender, mut progress) = mpsc::unbounded_channel();
        let context = DrainTaskContext {
            drainer: Arc::clone(&self.drainer),
            recorder: Arc::clone(&self.recorder),
            metrics: self.metrics.clone(),
            progress: progress_sender,
            shutdown: shutdown.clone(),
        };
        let mut drains = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &context, &mut drains).await,
                    None => {
                        event!(Level::INFO, "Node event stream ended.");
                        break;
                    }
                },
                Some(update) = progress.recv() => self.handle_progress(update),
                Some(joined) = drains.join_next() => log_join_error(joined),
            }
        }

        if !drains.is_empty() {
            event!(
                Level::INFO,
                remaining = drains.len(),
                "Waiting for in-flight drains to finish."
            );
        }
        while let Some(joined) = drains.join_next().await {
            log_join_error(joined);
        }
        // Every task has exited, so this drains whatever they reported.
        while let Ok(update) = progress.try_recv() {
            self.handle_progress(update);
        }
        Ok(())
    }

    async fn handle_event(
        &mut self,
        event: NodeEvent,
        context: &DrainTaskContext<D, R>,
        drains: &mut JoinSet<()>,
    ) {
        match event {
            NodeEvent::Applied(node) => self.handle_node(node, context, drains).await,
            NodeEvent::Deleted(node) => self.forget_node(&node.name_any()),
            NodeEvent::Restarted(nodes) => {
                let present: HashSet<String> = nodes.iter().map(|node| node.name_any()).collect();
                for node in nodes {
                    self.handle_node(node, context, drains).await;
                }
                let departed: Vec<String> = self
                    .records
                    .keys()
                    .filter(|name| !present.contains(*name))
                    .cloned()
                    .collect();
                for node_name in departed {
                    self.forget_node(&node_name);
                }
            }
        }
    }

    #[instrument(skip_all, fields(node = %node.name_any()))]
    async fn handle_node(
        &mut self,
        node: Node,
        context: &DrainTaskContext<D, R>,
        drains: &mut JoinSet<()>,
    ) {
        let node_name = node.name_any();

        if matching_condition(&node, &self.conditions).is_none() {
            if self
                .records
                .get(&node_name)
                .map_or(false, |record| record.phase.is_terminal())
            {
                event!(Level::INFO, "Node has recovered, clearing its drain record.");
                self.records.remove(&node_name);
            }
            return;
        }

        if !self.filters.evaluate(&node) {
            return;
        }

        let since = unhealthy_since(&node, &self.conditions);
        if let Some(record) = self.records.get(&node_name) {
            if !record.superseded_by(since) {
                event!(
                    Level::DEBUG,
                    phase = %record.phase,
                    "Node already has a drain record, ignoring."
                );
                return;
            }
            event!(
                Level::INFO,
                "Node became unhealthy again since its last drain."
            );
            self.records.remove(&node_name);
        }

        self.cordon_and_schedule(node, since, context, drains).await;
    }

    async fn cordon_and_schedule(
        &mut self,
        node: Node,
        since: Option<chrono::DateTime<chrono::Utc>>,
        context: &DrainTaskContext<D, R>,
        drains: &mut JoinSet<()>,
    ) {
        let node_name = node.name_any();

        match self.drainer.cordon(&node).await {
            Ok(CordonOutcome::NodeGone) => {
                event!(Level::INFO, "Node disappeared before it could be cordoned.");
                return;
            }
            Ok(outcome) => {
                event!(Level::INFO, ?outcome, "Cordoned node.");
                self.recorder
                    .publish(
                        &node,
                        EventSeverity::Normal,
                        EVENT_REASON_CORDON_SUCCEEDED,
                        "Cordoned node".to_string(),
                    )
                    .await;
                self.metrics.record_cordon(true);
            }
            Err(err) => {
                event!(Level::ERROR, "Failed to cordon node: '{}'", err);
                self.recorder
                    .publish(
                        &node,
                        EventSeverity::Warning,
                        EVENT_REASON_CORDON_FAILED,
                        format!("Cordoning failed: {}", err),
                    )
                    .await;
                self.metrics.record_cordon(false);
                return;
            }
        }

        let mut record = DrainRecord::cordoned(&node_name, since);
        let now = Instant::now();
        let start_at = self.buffer.reserve(now);
        if let Err(err) = record.schedule(start_at) {
            event!(Level::ERROR, "{}", err);
            return;
        }
        event!(
            Level::INFO,
            delay_secs = (start_at - now).as_secs_f64(),
            "Scheduled drain."
        );
        self.records.insert(node_name.clone(), record);

        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = drains.spawn(drain_when_due(context.clone(), node, start_at, generation));
        self.tasks.insert(node_name, DrainTask { generation, handle });
    }

    fn handle_progress(&mut self, update: DrainProgress) {
        let (node_name, generation, transition) = match &update {
            DrainProgress::Started {
                node_name,
                generation,
            } => (node_name, *generation, None),
            DrainProgress::Completed {
                node_name,
                generation,
                retries,
                error,
            } => (node_name, *generation, Some((*retries, error.clone()))),
        };

        if self.tasks.get(node_name).map(|task| task.generation) != Some(generation) {
            event!(
                Level::DEBUG,
                node = %node_name,
                generation,
                "Ignoring progress from a cancelled drain."
            );
            return;
        }
        if transition.is_some() {
            self.tasks.remove(node_name);
        }

        let record = match self.records.get_mut(node_name) {
            Some(record) => record,
            None => {
                event!(
                    Level::DEBUG,
                    node = %node_name,
                    "Drain progress for a node that is no longer tracked."
                );
                return;
            }
        };

        let result = match transition {
            None => record.start(),
            Some((retries, error)) => record.complete(retries, error),
        };
        if let Err(err) = result {
            event!(Level::ERROR, "{}", err);
        }
    }

    fn forget_node(&mut self, node_name: &str) {
        if let Some(task) = self.tasks.remove(node_name) {
            event!(Level::INFO, node = %node_name, "Cancelling drain of departed node.");
            task.handle.abort();
        }
        if let Some(record) = self.records.remove(node_name) {
            event!(
                Level::INFO,
                node = %node_name,
                phase = %record.phase,
                "Node left the cluster, dropping its drain record."
            );
        }
        self.filters.forget(node_name);
    }

    /// The number of tracked nodes in each phase.
    pub fn phase_counts(&self) -> HashMap<DrainPhase, usize> {
        let mut counts = HashMap::new();
        for record in self.records.values() {
            *counts.entry(record.phase).or_insert(0) += 1;
        }
        counts
    }
}

/// Waits until `start_at`, then drains the node and reports the outcome.
async fn drain_when_due<D: CordonDrainer, R: EventRecorder>(
    context: DrainTaskContext<D, R>,
    node: Node,
    start_at: Instant,
    generation: u64,
) {
    let node_name = node.name_any();

    tokio::select! {
        _ = sleep_until(start_at) => {}
        _ = context.shutdown.wait() => {
            event!(Level::INFO, node = %node_name, "Shutting down, abandoning scheduled drain.");
            return;
        }
    }

    let _ = context.progress.send(DrainProgress::Started {
        node_name: node_name.clone(),
        generation,
    });
    event!(Level::INFO, node = %node_name, "Draining node.");

    let (retries, error) = match context.drainer.drain(&node).await {
        Ok(report) => {
            context
                .recorder
                .publish(
                    &node,
                    EventSeverity::Normal,
                    EVENT_REASON_DRAIN_SUCCEEDED,
                    format!(
                        "Drained node: {} pods evicted, {} skipped",
                        report.count("evicted"),
                        report.count("filtered-out")
                    ),
                )
                .await;
            context.metrics.record_drain(true);
            (report.retries, None)
        }
        Err(err) => {
            event!(Level::ERROR, node = %node_name, "Failed to drain node: '{}'", err);
            context
                .recorder
                .publish(
                    &node,
                    EventSeverity::Warning,
                    EVENT_REASON_DRAIN_FAILED,
                    format!("Draining failed: {}", err),
                )
                .await;
            context.metrics.record_drain(false);
            let retries = err.report().map_or(0, |report| report.retries);
            (retries, Some(err.to_string()))
        }
    };

    let _ = context.progress.send(DrainProgress::Completed {
        node_name,
        generation,
        retries,
        error,
    });
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    match joined {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => event!(Level::DEBUG, "Drain task was cancelled."),
        Err(err) => event!(Level::ERROR, "Drain task did not complete: '{}'", err),
    }
}
