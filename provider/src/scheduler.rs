//! Motor de admisión y preempción por precio.
//!
//! Todo el estado compartido (`running`, `queued`, `capacity`) vive detrás de
//! un único `Mutex`. Cada operación decide bajo el lock, publica las
//! notificaciones en ese mismo orden y devuelve acciones (`Dispatch`) que se
//! ejecutan contra el runner ya sin el lock: lanzar o matar procesos nunca
//! bloquea otras decisiones.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use common::{
    AccountId, Bid, BidderId, KilledBy, Notification, OutputStream, RunSummary,
    SchedulerSnapshot, TaskId, TaskRecord, TaskSpec, TaskState, TaskSummary,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::BidderHub;
use crate::runner::{RunHandle, RunnerEvent, TaskRunner};

/// Registros terminales que se conservan para consultas; los más viejos se olvidan.
pub const DEFAULT_TERMINAL_RETENTION: usize = 1024;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("capacidad inválida: {0} (debe ser >= 0)")]
    InvalidCapacity(i64),

    #[error("tarea {0} desconocida")]
    UnknownTask(TaskId),

    #[error("la tarea {id} ya terminó ({state:?})")]
    AlreadyTerminal { id: TaskId, state: TaskState },
}

/// Orden de `running`: primero la oferta más baja y, a igual oferta, la
/// admitida hace más tiempo. Es el orden de desalojo.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RunningKey {
    bid: Bid,
    admitted: u64,
    id: TaskId,
}

/// Orden de `queued`: primero la oferta más alta y, a igual oferta, la
/// enviada antes. Es el orden de promoción.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueuedKey {
    bid: Reverse<Bid>,
    submitted: u64,
    id: TaskId,
}

struct TaskEntry {
    record: TaskRecord,
    /// Secuencia de envío; una tarea desalojada vuelve a la cola con la misma
    submitted: u64,
    /// Ejecución actual si la tarea está en `running`
    run: Option<u64>,
    cancel_requested: bool,
}

impl TaskEntry {
    fn running_key(&self, run: u64) -> RunningKey {
        RunningKey {
            bid: self.record.bid,
            admitted: run,
            id: self.record.id.clone(),
        }
    }

    fn queued_key(&self) -> QueuedKey {
        QueuedKey {
            bid: Reverse(self.record.bid),
            submitted: self.submitted,
            id: self.record.id.clone(),
        }
    }

    fn handle(&self, run: u64) -> RunHandle {
        RunHandle {
            task_id: self.record.id.clone(),
            run,
        }
    }
}

enum Dispatch {
    Start(TaskRecord, RunHandle),
    Terminate(RunHandle),
}

/// Lo que produce una transición: acciones para el runner y avisos para los bidders.
#[derive(Default)]
struct Effects {
    dispatches: Vec<Dispatch>,
    notices: Vec<(BidderId, Notification)>,
}

impl Effects {
    fn notify(&mut self, record: &TaskRecord, notification: Notification) {
        self.notices.push((record.bidder_id.clone(), notification));
    }
}

enum RunEnd {
    Finished { exit_code: i32 },
    Failed { reason: String, exit_code: Option<i32> },
    Terminated,
}

fn fatal(msg: impl Display) -> ! {
    error!("inconsistencia interna del scheduler: {}", msg);
    panic!("inconsistencia interna del scheduler: {msg}");
}

/* ---------------- estado protegido por el lock ---------------- */

struct SchedulerState {
    capacity: usize,
    tasks: HashMap<TaskId, TaskEntry>,
    running: BTreeSet<RunningKey>,
    queued: BTreeSet<QueuedKey>,
    seq: u64,
    /// Tareas terminales en orden de cierre
    terminal: VecDeque<TaskId>,
    retention: usize,
}

impl SchedulerState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tasks: HashMap::new(),
            running: BTreeSet::new(),
            queued: BTreeSet::new(),
            seq: 0,
            terminal: VecDeque::new(),
            retention: DEFAULT_TERMINAL_RETENTION,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn insert(&mut self, record: TaskRecord) -> TaskId {
        let submitted = self.next_seq();
        let id = record.id.clone();
        self.tasks.insert(
            id.clone(),
            TaskEntry {
                record,
                submitted,
                run: None,
                cancel_requested: false,
            },
        );
        id
    }

    /// Anota una tarea recién cerrada y olvida las más viejas por encima del límite.
    fn retire(&mut self, id: &TaskId) {
        self.terminal.push_back(id.clone());
        while self.terminal.len() > self.retention {
            if let Some(old) = self.terminal.pop_front() {
                self.tasks.remove(&old);
                debug!("registro de la tarea {} descartado", old);
            }
        }
    }

    fn record(&self, id: &str) -> TaskRecord {
        match self.tasks.get(id) {
            Some(entry) => entry.record.clone(),
            None => fatal(format!("tarea {id} desaparecida del registro")),
        }
    }

    /// Admitir, desalojar-y-admitir o encolar.
    fn place(&mut self, id: &TaskId, now: DateTime<Utc>, fx: &mut Effects) {
        if self.running.len() < self.capacity {
            self.admit(id, now, fx);
            return;
        }

        let bid = match self.tasks.get(id) {
            Some(entry) => entry.record.bid,
            None => fatal(format!("place de tarea inexistente {id}")),
        };
        let victim = match self.running.first() {
            Some(lowest) if bid > lowest.bid => Some(lowest.id.clone()),
            _ => None,
        };

        match victim {
            Some(victim) => {
                info!(
                    "oferta {} de la tarea {} supera a la mínima en ejecución; desalojando {}",
                    bid, id, victim
                );
                self.evict(&victim, now, fx);
                self.admit(id, now, fx);
            }
            None => self.enqueue(id, fx),
        }
    }

    fn admit(&mut self, id: &TaskId, now: DateTime<Utc>, fx: &mut Effects) {
        let run = self.next_seq();
        let Some(entry) = self.tasks.get_mut(id) else {
            fatal(format!("admit de tarea inexistente {id}"));
        };

        entry.run = Some(run);
        entry.record.mark_running(now);
        self.running.insert(entry.running_key(run));

        fx.notify(
            &entry.record,
            Notification::Admitted {
                task_id: id.clone(),
                bid: entry.record.bid,
                times_started: entry.record.times_started,
            },
        );
        fx.dispatches
            .push(Dispatch::Start(entry.record.clone(), entry.handle(run)));

        debug!(
            "admitida tarea {} (bid={}, run={}) -> running={}/{}",
            id,
            entry.record.bid,
            run,
            self.running.len(),
            self.capacity
        );
    }

    fn enqueue(&mut self, id: &TaskId, fx: &mut Effects) {
        let Some(entry) = self.tasks.get_mut(id) else {
            fatal(format!("enqueue de tarea inexistente {id}"));
        };

        entry.record.mark_queued();
        self.queued.insert(entry.queued_key());
        fx.notify(
            &entry.record,
            Notification::Queued {
                task_id: id.clone(),
                bid: entry.record.bid,
            },
        );

        debug!(
            "encolada tarea {} (bid={}) -> queued={}",
            id,
            entry.record.bid,
            self.queued.len()
        );
    }

    /// Saca la tarea de `running`. Vuelve a la cola con su oferta original,
    /// salvo que el bidder ya la hubiera cancelado.
    fn evict(&mut self, id: &TaskId, now: DateTime<Utc>, fx: &mut Effects) {
        let Some(entry) = self.tasks.get_mut(id) else {
            fatal(format!("evict de tarea inexistente {id}"));
        };
        let Some(run) = entry.run.take() else {
            fatal(format!("evict de la tarea {id} que no está corriendo"));
        };
        if !self.running.remove(&entry.running_key(run)) {
            fatal(format!("la tarea {id} no estaba en el índice de running"));
        }

        fx.dispatches.push(Dispatch::Terminate(entry.handle(run)));

        if entry.cancel_requested {
            entry.record.finish(TaskState::Cancelled, KilledBy::User, now);
            fx.notify(
                &entry.record,
                Notification::Cancelled {
                    task_id: id.clone(),
                    summary: RunSummary::of(&entry.record, now),
                },
            );
            info!("tarea {} desalojada mientras se cancelaba -> CANCELLED", id);
            self.retire(id);
            return;
        }

        entry.record.mark_preempted(now);
        self.queued.insert(entry.queued_key());
        fx.notify(
            &entry.record,
            Notification::Preempted {
                task_id: id.clone(),
                bid: entry.record.bid,
            },
        );
        info!(
            "tarea {} (bid={}) desalojada y reencolada -> running={} queued={}",
            id,
            entry.record.bid,
            self.running.len(),
            self.queued.len()
        );
    }

    /// Admite desde la cola mientras haya capacidad libre.
    fn promote(&mut self, now: DateTime<Utc>, fx: &mut Effects) {
        while self.running.len() < self.capacity {
            let Some(next) = self.queued.pop_first() else {
                break;
            };
            debug!("promoviendo tarea {} (bid={})", next.id, next.bid.0);
            self.admit(&next.id, now, fx);
        }
    }

    /// Desaloja las ofertas más bajas hasta entrar en la capacidad.
    fn shrink(&mut self, now: DateTime<Utc>, fx: &mut Effects) {
        while self.running.len() > self.capacity {
            let Some(lowest) = self.running.first().map(|k| k.id.clone()) else {
                break;
            };
            self.evict(&lowest, now, fx);
        }
    }

    fn resize(&mut self, capacity: usize, now: DateTime<Utc>, fx: &mut Effects) {
        let old = self.capacity;
        self.capacity = capacity;
        self.shrink(now, fx);
        self.promote(now, fx);
        info!(
            "capacidad {} -> {} (running={} queued={})",
            old,
            capacity,
            self.running.len(),
            self.queued.len()
        );
    }

    /// Cierra la ejecución si `handle` sigue siendo la actual. Los avisos de
    /// ejecuciones ya desalojadas o de tareas ausentes no hacen nada.
    fn end_run(&mut self, handle: &RunHandle, end: RunEnd, now: DateTime<Utc>, fx: &mut Effects) -> bool {
        let Some(entry) = self.tasks.get_mut(&handle.task_id) else {
            debug!("aviso para tarea desconocida {}; ignorado", handle.task_id);
            return false;
        };
        if entry.run != Some(handle.run) {
            debug!(
                "aviso obsoleto de {} (run={}); ignorado",
                handle.task_id, handle.run
            );
            return false;
        }

        entry.run = None;
        if !self.running.remove(&entry.running_key(handle.run)) {
            fatal(format!(
                "la tarea {} tenía run {} pero no estaba en running",
                handle.task_id, handle.run
            ));
        }

        let task_id = handle.task_id.clone();
        let notice = match end {
            RunEnd::Finished { exit_code } => {
                entry.record.exit_code = Some(exit_code);
                entry.record.finish(TaskState::Completed, KilledBy::None, now);
                Notification::Completed {
                    task_id,
                    exit_code,
                    summary: RunSummary::of(&entry.record, now),
                }
            }
            RunEnd::Failed { reason, exit_code } => {
                entry.record.exit_code = exit_code;
                entry.record.failure = Some(reason.clone());
                entry.record.finish(TaskState::Failed, KilledBy::None, now);
                Notification::Failed {
                    task_id,
                    reason,
                    exit_code,
                    summary: RunSummary::of(&entry.record, now),
                }
            }
            RunEnd::Terminated if entry.cancel_requested => {
                entry.record.finish(TaskState::Cancelled, KilledBy::User, now);
                Notification::Cancelled {
                    task_id,
                    summary: RunSummary::of(&entry.record, now),
                }
            }
            RunEnd::Terminated => {
                let reason = "terminada sin que nadie lo pidiera".to_string();
                entry.record.failure = Some(reason.clone());
                entry.record.finish(TaskState::Failed, KilledBy::Provider, now);
                Notification::Failed {
                    task_id,
                    reason,
                    exit_code: None,
                    summary: RunSummary::of(&entry.record, now),
                }
            }
        };

        info!(
            "tarea {} -> {:?} (running={} queued={})",
            handle.task_id,
            entry.record.state,
            self.running.len(),
            self.queued.len()
        );
        fx.notify(&entry.record, notice);

        self.retire(&handle.task_id);
        self.promote(now, fx);
        true
    }

    /// El runner lanzó el proceso. Si mientras tanto la ejecución quedó
    /// obsoleta (o se pidió cancelarla) hay que volver a pedir el terminate,
    /// porque el anterior pudo llegar antes que el start.
    fn started(&mut self, handle: &RunHandle, fx: &mut Effects) {
        match self.tasks.get(&handle.task_id) {
            Some(entry) if entry.run == Some(handle.run) => {
                fx.notify(
                    &entry.record,
                    Notification::Started {
                        task_id: handle.task_id.clone(),
                    },
                );
                if entry.cancel_requested {
                    fx.dispatches.push(Dispatch::Terminate(handle.clone()));
                }
            }
            _ => {
                debug!(
                    "start de {} (run={}) llegó tarde; terminando",
                    handle.task_id, handle.run
                );
                fx.dispatches.push(Dispatch::Terminate(handle.clone()));
            }
        }
    }

    fn output(&self, handle: &RunHandle, stream: OutputStream, line: String, fx: &mut Effects) {
        match self.tasks.get(&handle.task_id) {
            Some(entry) if entry.run == Some(handle.run) => fx.notify(
                &entry.record,
                Notification::Output {
                    task_id: handle.task_id.clone(),
                    stream,
                    line,
                },
            ),
            _ => {}
        }
    }

    fn cancel(&mut self, id: &str, now: DateTime<Utc>, fx: &mut Effects) -> Result<TaskRecord, SchedulerError> {
        let Some(entry) = self.tasks.get_mut(id) else {
            return Err(SchedulerError::UnknownTask(id.to_string()));
        };
        if entry.record.state.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal {
                id: id.to_string(),
                state: entry.record.state,
            });
        }

        match entry.run {
            // Sigue ocupando su hueco hasta que el runner confirme.
            Some(run) => {
                if !entry.cancel_requested {
                    entry.cancel_requested = true;
                    fx.dispatches.push(Dispatch::Terminate(entry.handle(run)));
                    info!("cancelando tarea {} en ejecución (run={})", id, run);
                }
            }
            None => {
                if !self.queued.remove(&entry.queued_key()) {
                    fatal(format!("la tarea {id} no corre pero tampoco está en cola"));
                }
                entry.record.finish(TaskState::Cancelled, KilledBy::User, now);
                fx.notify(
                    &entry.record,
                    Notification::Cancelled {
                        task_id: id.to_string(),
                        summary: RunSummary::of(&entry.record, now),
                    },
                );
                info!("tarea {} cancelada desde la cola", id);
            }
        }

        let record = entry.record.clone();
        if record.state.is_terminal() {
            self.retire(&record.id);
        }
        self.promote(now, fx);
        Ok(record)
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let summary = |id: &TaskId| self.tasks.get(id).map(|e| TaskSummary::from(&e.record));

        let clearing_price = if self.capacity > 0 && self.running.len() >= self.capacity {
            self.running.first().map(|k| k.bid.value())
        } else {
            None
        };

        SchedulerSnapshot {
            capacity: self.capacity,
            running: self.running.iter().filter_map(|k| summary(&k.id)).collect(),
            queued: self.queued.iter().filter_map(|k| summary(&k.id)).collect(),
            clearing_price,
        }
    }

    fn assert_invariants(&self) {
        if self.running.len() > self.capacity {
            fatal(format!(
                "{} tareas en running con capacidad {}",
                self.running.len(),
                self.capacity
            ));
        }
        if self.running.len() < self.capacity && !self.queued.is_empty() {
            fatal(format!(
                "capacidad libre ({}/{}) con {} tareas en cola",
                self.running.len(),
                self.capacity,
                self.queued.len()
            ));
        }
        if let (Some(lowest), Some(highest)) = (self.running.first(), self.queued.first()) {
            if lowest.bid < highest.bid.0 {
                fatal(format!(
                    "oferta mínima en running {} < máxima en cola {}",
                    lowest.bid, highest.bid.0
                ));
            }
        }
    }
}

/* ---------------- API pública ---------------- */

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    runner: Arc<dyn TaskRunner>,
    hub: Arc<BidderHub>,
}

impl Scheduler {
    pub fn new(capacity: usize, runner: Arc<dyn TaskRunner>, hub: Arc<BidderHub>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::new(capacity)),
            runner,
            hub,
        }
    }

    /// Cambia cuántos registros terminales se conservan.
    pub fn with_retention(self, retention: usize) -> Self {
        self.lock().retention = retention;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|_| fatal("lock del scheduler envenenado por un pánico previo"))
    }

    /// Sección crítica: decide, comprueba invariantes y publica avisos en
    /// orden. Devuelve las acciones pendientes para el runner.
    fn apply<T>(
        &self,
        op: impl FnOnce(&mut SchedulerState, DateTime<Utc>, &mut Effects) -> T,
    ) -> (T, Vec<Dispatch>) {
        let mut state = self.lock();
        let mut fx = Effects::default();

        let out = op(&mut *state, Utc::now(), &mut fx);
        state.assert_invariants();

        for (bidder, notice) in fx.notices {
            self.hub.publish(&bidder, notice);
        }
        (out, fx.dispatches)
    }

    fn transition<T>(
        &self,
        op: impl FnOnce(&mut SchedulerState, DateTime<Utc>, &mut Effects) -> T,
    ) -> T {
        let (out, dispatches) = self.apply(op);
        self.dispatch(dispatches);
        out
    }

    /// Ejecuta las acciones fuera del lock. Un fallo de spawn vuelve a entrar
    /// como fallo de la tarea y puede generar más acciones (promociones).
    fn dispatch(&self, dispatches: Vec<Dispatch>) {
        let mut pending: VecDeque<Dispatch> = dispatches.into();

        while let Some(action) = pending.pop_front() {
            let more = match action {
                Dispatch::Terminate(handle) => {
                    self.runner.terminate(&handle);
                    continue;
                }
                Dispatch::Start(record, handle) => match self.runner.start(&record, handle.clone()) {
                    Ok(()) => self.apply(|st, _, fx| st.started(&handle, fx)).1,
                    Err(e) => {
                        warn!("no se pudo lanzar la tarea {}: {}", handle.task_id, e);
                        let end = RunEnd::Failed {
                            reason: format!("spawn: {e}"),
                            exit_code: None,
                        };
                        self.apply(|st, now, fx| st.end_run(&handle, end, now, fx)).1
                    }
                },
            };
            pending.extend(more);
        }
    }

    pub fn submit(
        &self,
        bidder_id: BidderId,
        user_account: AccountId,
        bid: Bid,
        spec: TaskSpec,
    ) -> TaskRecord {
        self.transition(|st, now, fx| {
            let id = st.insert(TaskRecord::new(bidder_id, user_account, bid, spec));
            st.place(&id, now, fx);
            st.record(&id)
        })
    }

    /// Salida normal del proceso. `false` si el aviso era obsoleto.
    pub fn on_finished(&self, handle: &RunHandle, exit_code: i32) -> bool {
        self.transition(|st, now, fx| st.end_run(handle, RunEnd::Finished { exit_code }, now, fx))
    }

    pub fn on_failed(&self, handle: &RunHandle, reason: String, exit_code: Option<i32>) -> bool {
        self.transition(|st, now, fx| {
            st.end_run(handle, RunEnd::Failed { reason, exit_code }, now, fx)
        })
    }

    /// Confirmación de un terminate pedido por el scheduler. Para una
    /// cancelación cierra la tarea como `Cancelled`; para una ejecución ya
    /// desalojada no hace nada.
    pub fn on_terminated(&self, handle: &RunHandle) -> bool {
        self.transition(|st, now, fx| st.end_run(handle, RunEnd::Terminated, now, fx))
    }

    pub fn on_output(&self, handle: &RunHandle, stream: OutputStream, line: String) {
        self.apply(|st, _, fx| st.output(handle, stream, line, fx));
    }

    pub fn resize(&self, capacity: i64) -> Result<SchedulerSnapshot, SchedulerError> {
        let capacity =
            usize::try_from(capacity).map_err(|_| SchedulerError::InvalidCapacity(capacity))?;
        Ok(self.transition(|st, now, fx| {
            st.resize(capacity, now, fx);
            st.snapshot()
        }))
    }

    pub fn cancel(&self, id: &str) -> Result<TaskRecord, SchedulerError> {
        self.transition(|st, now, fx| st.cancel(id, now, fx))
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(id).map(|e| e.record.clone())
    }

    /// Todas las tareas en orden de envío.
    pub fn list(&self) -> Vec<TaskRecord> {
        let state = self.lock();
        let mut entries: Vec<&TaskEntry> = state.tasks.values().collect();
        entries.sort_by_key(|e| e.submitted);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.lock().snapshot()
    }

    /// (capacity, running, queued) para el registry.
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.lock();
        (state.capacity, state.running.len(), state.queued.len())
    }
}

/// Reentrada de los avisos asíncronos del runner en el scheduler.
pub async fn pump_runner_events(
    scheduler: Arc<Scheduler>,
    mut events: mpsc::UnboundedReceiver<RunnerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RunnerEvent::Output {
                handle,
                stream,
                line,
            } => scheduler.on_output(&handle, stream, line),
            RunnerEvent::Finished { handle, exit_code } => {
                scheduler.on_finished(&handle, exit_code);
            }
            RunnerEvent::Failed {
                handle,
                reason,
                exit_code,
            } => {
                scheduler.on_failed(&handle, reason, exit_code);
            }
            RunnerEvent::Terminated(handle) => {
                scheduler.on_terminated(&handle);
            }
        }
    }
    info!("canal de eventos del runner cerrado");
}
