use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub type TaskId = String;
pub type BidderId = String;
pub type AccountId = u64;

/* --------- Precio ofertado --------- */

/// Precio ofertado por una tarea: finito y > 0. Es la única clave de
/// ordenación del scheduler, así que tiene orden total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Bid(f64);

impl Bid {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationError::InvalidBid(value));
        }
        Ok(Bid(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for Bid {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bid {}

impl Ord for Bid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Bid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<f64> for Bid {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Bid::new(value)
    }
}

impl From<Bid> for f64 {
    fn from(bid: Bid) -> f64 {
        bid.0
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* --------- Descriptor de ejecución --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Number,
    String,
    Boolean,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
}

/// Qué se ejecuta. El scheduler nunca mira dentro; sólo el runner usa `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub command: String,

    /// Salidas que el script promete producir
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
}

impl TaskSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }

        let mut seen = HashSet::new();
        for out in &self.outputs {
            let name = out.name.trim();
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ValidationError::InvalidOutputName(out.name.clone()));
            }
            if !seen.insert(name) {
                return Err(ValidationError::DuplicateOutput(out.name.clone()));
            }
        }
        Ok(())
    }
}

/* --------- Ciclo de vida --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Preempted,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Quién cortó la última ejecución.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KilledBy {
    None,
    User,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub bidder_id: BidderId,
    pub user_account: AccountId,
    pub bid: Bid,
    pub spec: TaskSpec,
    pub state: TaskState,

    /* -------- Variables del contrato -------- */
    pub submitted_at: DateTime<Utc>,
    pub first_started_at: Option<DateTime<Utc>>,
    /// Última admisión
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Veces que la tarea fue admitida (una re-admisión tras preempción es una "recompra")
    pub times_started: u32,
    /// Milisegundos acumulados de ejecuciones ya cerradas
    pub run_ms: u64,
    pub killed_by: KilledBy,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
}

impl TaskRecord {
    pub fn new(bidder_id: BidderId, user_account: AccountId, bid: Bid, spec: TaskSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            bidder_id,
            user_account,
            bid,
            spec,
            state: TaskState::Queued,
            submitted_at: Utc::now(),
            first_started_at: None,
            started_at: None,
            finished_at: None,
            times_started: 0,
            run_ms: 0,
            killed_by: KilledBy::None,
            exit_code: None,
            failure: None,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.started_at = Some(now);
        self.first_started_at.get_or_insert(now);
        self.times_started += 1;
    }

    pub fn mark_preempted(&mut self, now: DateTime<Utc>) {
        self.close_run(now);
        self.state = TaskState::Preempted;
        self.killed_by = KilledBy::Provider;
    }

    pub fn mark_queued(&mut self) {
        self.state = TaskState::Queued;
    }

    /// Lleva la tarea a un estado terminal.
    pub fn finish(&mut self, state: TaskState, killed_by: KilledBy, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        if self.state == TaskState::Running {
            self.close_run(now);
        }
        self.state = state;
        self.killed_by = killed_by;
        self.finished_at = Some(now);
    }

    fn close_run(&mut self, now: DateTime<Utc>) {
        if let Some(started) = self.started_at {
            self.run_ms += millis_between(started, now);
        }
    }

    /// Tiempo entre el envío y la primera admisión (o hasta ahora si nunca corrió).
    pub fn waiting_ms(&self, now: DateTime<Utc>) -> u64 {
        let until = self
            .first_started_at
            .or(self.finished_at)
            .unwrap_or(now);
        millis_between(self.submitted_at, until)
    }

    /// Tiempo total de ejecución, incluida la ejecución en curso.
    pub fn running_ms(&self, now: DateTime<Utc>) -> u64 {
        match (self.state, self.started_at) {
            (TaskState::Running, Some(started)) => self.run_ms + millis_between(started, now),
            _ => self.run_ms,
        }
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
