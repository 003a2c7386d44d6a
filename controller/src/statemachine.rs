//! The per-node drain lifecycle.
//!
//! A node with no record is unseen. Once cordoned it is tracked by a `DrainRecord` which moves through
//! `Cordoned -> Scheduled -> Draining -> {Succeeded, Failed}`. Terminal records are kept so that further
//! notifications for the same node are ignored until it recovers or disappears.
use chrono::{DateTime, Utc};
use snafu::{ensure, Snafu};
use std::fmt;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DrainPhase {
    Cordoned,
    Scheduled,
    Draining,
    Succeeded,
    Failed,
}

impl DrainPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DrainPhase::Succeeded | DrainPhase::Failed)
    }

    /// Whether a record may move from this phase directly to `next`.
    pub fn can_transition_to(&self, next: DrainPhase) -> bool {
        matches!(
            (self, next),
            (DrainPhase::Cordoned, DrainPhase::Scheduled)
                | (DrainPhase::Scheduled, DrainPhase::Draining)
                | (DrainPhase::Draining, DrainPhase::Succeeded)
                | (DrainPhase::Draining, DrainPhase::Failed)
        )
    }
}

impl fmt::Display for DrainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Node '{}' cannot move from {} to {}", node_name, from, to))]
pub struct InvalidTransition {
    node_name: String,
    from: DrainPhase,
    to: DrainPhase,
}

/// Bookkeeping for a single node's drain.
#[derive(Clone, Debug, PartialEq)]
pub struct DrainRecord {
    pub node_name: String,
    pub phase: DrainPhase,
    /// When the drain is allowed to start, once scheduled.
    pub start_at: Option<Instant>,
    /// When the node entered the unhealthy condition that triggered this drain.
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub retries: u32,
    pub last_error: Option<String>,
}

impl DrainRecord {
    pub fn cordoned(node_name: &str, unhealthy_since: Option<DateTime<Utc>>) -> Self {
        DrainRecord {
            node_name: node_name.to_string(),
            phase: DrainPhase::Cordoned,
            start_at: None,
            unhealthy_since,
            retries: 0,
            last_error: None,
        }
    }

    fn advance(&mut self, next: DrainPhase) -> Result<(), InvalidTransition> {
        ensure!(
            self.phase.can_transition_to(next),
            InvalidTransitionSnafu {
                node_name: self.node_name.clone(),
                from: self.phase,
                to: next,
            }
        );
        self.phase = next;
        Ok(())
    }

    pub fn schedule(&mut self, start_at: Instant) -> Result<(), InvalidTransition> {
        self.advance(DrainPhase::Scheduled)?;
        self.start_at = Some(start_at);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.advance(DrainPhase::Draining)
    }

    /// Records the outcome of the drain. `error` is `None` if the drain succeeded.
    pub fn complete(&mut self, retries: u32, error: Option<String>) -> Result<(), InvalidTransition> {
        let next = match error {
            None => DrainPhase::Succeeded,
            Some(_) => DrainPhase::Failed,
        };
        self.advance(next)?;
        self.retries = retries;
        self.last_error = error;
        Ok(())
    }

    /// A terminal record is superseded once the node re-enters an unhealthy condition after the one that
    /// triggered this drain.
    pub fn superseded_by(&self, unhealthy_since: Option<DateTime<Utc>>) -> bool {
        if !self.phase.is_terminal() {
            return false;
        }
        match (self.unhealthy_since, unhealthy_since) {
            (Some(recorded), Some(observed)) => observed > recorded,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}
