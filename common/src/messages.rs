use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::task::{AccountId, Bid, BidderId, KilledBy, TaskId, TaskRecord, TaskSpec, TaskState};

/* --------- Envío de tareas --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub bidder_id: BidderId,
    /// Cuenta del ledger desde la que se retiene la oferta
    pub user_account: AccountId,
    pub bid_price: f64,
    pub spec: TaskSpec,
}

impl SubmitTaskRequest {
    /// Valida el mensaje y devuelve la oferta ya tipada.
    pub fn validate(&self) -> Result<Bid, ValidationError> {
        if self.bidder_id.trim().is_empty() {
            return Err(ValidationError::EmptyBidder);
        }
        let bid = Bid::new(self.bid_price)?;
        self.spec.validate()?;
        Ok(bid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task: TaskRecord,
    /// Precio de reserva contra el que se validó la oferta
    pub reserve_price: f64,
}

/* --------- Capacidad y estado del scheduler --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Entero con signo para poder rechazar valores negativos con un error propio
    pub capacity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub bidder_id: BidderId,
    pub bid: Bid,
    pub state: TaskState,
}

impl From<&TaskRecord> for TaskSummary {
    fn from(rec: &TaskRecord) -> Self {
        Self {
            id: rec.id.clone(),
            bidder_id: rec.bidder_id.clone(),
            bid: rec.bid,
            state: rec.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub capacity: usize,
    /// En orden de desalojo: primero la oferta más baja
    pub running: Vec<TaskSummary>,
    /// En orden de promoción: primero la oferta más alta
    pub queued: Vec<TaskSummary>,
    /// Oferta mínima en ejecución cuando el nodo está lleno
    pub clearing_price: Option<f64>,
}

/* --------- Precio --------- */

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Último valor crudo del proceso (centrado en 0)
    pub current: f64,
    pub reserve_price: f64,
    pub floor: f64,
    pub ceil: f64,
}

/* --------- Notificaciones al bidder --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub waiting_ms: u64,
    pub running_ms: u64,
    pub times_started: u32,
    pub killed_by: KilledBy,
}

impl RunSummary {
    pub fn of(rec: &TaskRecord, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            waiting_ms: rec.waiting_ms(now),
            running_ms: rec.running_ms(now),
            times_started: rec.times_started,
            killed_by: rec.killed_by,
        }
    }
}

/// Una notificación por transición de estado de una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Notification {
    Queued {
        task_id: TaskId,
        bid: Bid,
    },
    Admitted {
        task_id: TaskId,
        bid: Bid,
        times_started: u32,
    },
    Started {
        task_id: TaskId,
    },
    Output {
        task_id: TaskId,
        stream: OutputStream,
        line: String,
    },
    Preempted {
        task_id: TaskId,
        bid: Bid,
    },
    Completed {
        task_id: TaskId,
        exit_code: i32,
        summary: RunSummary,
    },
    Failed {
        task_id: TaskId,
        reason: String,
        exit_code: Option<i32>,
        summary: RunSummary,
    },
    Cancelled {
        task_id: TaskId,
        summary: RunSummary,
    },
}

impl Notification {
    pub fn task_id(&self) -> &str {
        match self {
            Notification::Queued { task_id, .. }
            | Notification::Admitted { task_id, .. }
            | Notification::Started { task_id }
            | Notification::Output { task_id, .. }
            | Notification::Preempted { task_id, .. }
            | Notification::Completed { task_id, .. }
            | Notification::Failed { task_id, .. }
            | Notification::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notification::Completed { .. }
                | Notification::Failed { .. }
                | Notification::Cancelled { .. }
        )
    }
}

/* --------- Sesión websocket del bidder --------- */

/// Lo que el provider contesta fuera del flujo de notificaciones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionReply {
    Submitted(SubmitTaskResponse),
    Error { kind: String, error_message: String },
}

impl From<ErrorBody> for SessionReply {
    fn from(body: ErrorBody) -> Self {
        SessionReply::Error {
            kind: body.status,
            error_message: body.error_message,
        }
    }
}

/// Comandos que el bidder puede mandar después del envío.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionCommand {
    Cancel,
}

/// Cuerpo de error, mismo formato que usa el banco central.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub error_message: String,
}

/* --------- Colaboradores externos --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransfer {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryAnnouncement {
    pub address: String,
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
    pub reserve_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{OutputDecl, OutputKind};

    fn request(bid_price: f64) -> SubmitTaskRequest {
        SubmitTaskRequest {
            bidder_id: "alice".into(),
            user_account: 3,
            bid_price,
            spec: TaskSpec {
                command: "python job.py".into(),
                outputs: vec![OutputDecl { name: "correct".into(), kind: OutputKind::Boolean }],
            },
        }
    }

    #[test]
    fn submit_request_validation() {
        assert_eq!(request(2.0).validate().unwrap().value(), 2.0);
        assert_eq!(request(0.0).validate(), Err(ValidationError::InvalidBid(0.0)));

        let mut anon = request(2.0);
        anon.bidder_id = " ".into();
        assert_eq!(anon.validate(), Err(ValidationError::EmptyBidder));
    }

    #[test]
    fn submit_request_wire_format() {
        let raw = r#"{
            "bidder_id": "alice",
            "user_account": 3,
            "bid_price": 1.75,
            "spec": { "command": "python job.py", "outputs": [{ "name": "correct", "type": "boolean" }] }
        }"#;
        let req: SubmitTaskRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.spec.outputs[0].kind, OutputKind::Boolean);
        assert_eq!(req.validate().unwrap().value(), 1.75);
    }

    #[test]
    fn notifications_are_tagged_by_status() {
        let n = Notification::Preempted {
            task_id: "t1".into(),
            bid: Bid::new(3.0).unwrap(),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["status"], "preempted");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["bid"], 3.0);
        assert!(!n.is_terminal());

        let done = Notification::Cancelled {
            task_id: "t1".into(),
            summary: RunSummary {
                waiting_ms: 1,
                running_ms: 2,
                times_started: 1,
                killed_by: KilledBy::User,
            },
        };
        assert!(done.is_terminal());
        assert_eq!(done.task_id(), "t1");
        assert_eq!(serde_json::to_value(&done).unwrap()["summary"]["killed_by"], "user");
    }

    #[test]
    fn session_command_parses_cancel() {
        let cmd: SessionCommand = serde_json::from_str(r#"{"action":"cancel"}"#).unwrap();
        assert_eq!(cmd, SessionCommand::Cancel);
    }
}
