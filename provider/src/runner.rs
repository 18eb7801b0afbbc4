use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{OutputStream, TaskId, TaskRecord};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tiempo que esperamos a que se vacíen stdout/stderr tras una salida normal.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Identifica una ejecución concreta de una tarea. Una tarea desalojada y
/// vuelta a admitir tiene otro `run`, así los avisos de la ejecución vieja
/// no se confunden con los de la nueva.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHandle {
    pub task_id: TaskId,
    pub run: u64,
}

/// Lo que el runner reporta de forma asíncrona. Por cada handle llega
/// exactamente uno de `Finished`, `Failed` o `Terminated`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Output {
        handle: RunHandle,
        stream: OutputStream,
        line: String,
    },
    Finished {
        handle: RunHandle,
        exit_code: i32,
    },
    Failed {
        handle: RunHandle,
        reason: String,
        exit_code: Option<i32>,
    },
    Terminated(RunHandle),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("el comando de la tarea está vacío")]
    EmptyCommand,

    #[error("no se pudo lanzar {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Ejecución fuera de banda de las tareas. Ninguna llamada bloquea.
pub trait TaskRunner: Send + Sync {
    /// Lanza la tarea. Un error aquí nunca llega a `running`.
    fn start(&self, task: &TaskRecord, handle: RunHandle) -> Result<(), SpawnError>;

    /// Pide la terminación forzosa. Idempotente: un handle ya terminado o
    /// desconocido se ignora.
    fn terminate(&self, handle: &RunHandle);
}

/* --------- Runner de procesos del sistema --------- */

/// Lanza `<launcher> <launcher_args...> <command>` como proceso hijo.
/// Con `sh -c` corre el comando tal cual; con `docker run python` reproduce
/// el despliegue clásico del provider.
pub struct ProcessRunner {
    launcher: String,
    launcher_args: Vec<String>,
    grace: Duration,
    events: mpsc::UnboundedSender<RunnerEvent>,
    live: Arc<Mutex<HashMap<RunHandle, oneshot::Sender<()>>>>,
}

enum Exit {
    Natural(std::io::Result<ExitStatus>),
    Terminated,
}

impl ProcessRunner {
    pub fn new(
        launcher: String,
        launcher_args: Vec<String>,
        grace: Duration,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Self {
        Self {
            launcher,
            launcher_args,
            grace,
            events,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Procesos vivos ahora mismo.
    #[cfg(all(test, unix))]
    fn live_count(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TaskRunner for ProcessRunner {
    fn start(&self, task: &TaskRecord, handle: RunHandle) -> Result<(), SpawnError> {
        let command = task.spec.command.trim();
        if command.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }

        let mut cmd = Command::new(&self.launcher);
        cmd.args(&self.launcher_args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Grupo propio: las señales llegan también a los nietos (sh -c ...).
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Io {
            program: self.launcher.clone(),
            source,
        })?;

        info!(
            "lanzada tarea {} (run={}, pid={:?}): {}",
            handle.task_id,
            handle.run,
            child.id(),
            command
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), stop_tx);

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(
                stdout,
                OutputStream::Stdout,
                handle.clone(),
                self.events.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(
                stderr,
                OutputStream::Stderr,
                handle.clone(),
                self.events.clone(),
            )));
        }

        tokio::spawn(supervise(
            child,
            stop_rx,
            pumps,
            handle,
            self.grace,
            self.events.clone(),
            Arc::clone(&self.live),
        ));

        Ok(())
    }

    fn terminate(&self, handle: &RunHandle) {
        let stop = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);

        match stop {
            Some(tx) => {
                debug!("pidiendo terminación de {} (run={})", handle.task_id, handle.run);
                let _ = tx.send(());
            }
            None => debug!(
                "terminate ignorado: {} (run={}) ya no está vivo",
                handle.task_id, handle.run
            ),
        }
    }
}

/// Espera a que el proceso salga solo o a que nos pidan matarlo, y reporta
/// un único evento final.
async fn supervise(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    pumps: Vec<JoinHandle<()>>,
    handle: RunHandle,
    grace: Duration,
    events: mpsc::UnboundedSender<RunnerEvent>,
    live: Arc<Mutex<HashMap<RunHandle, oneshot::Sender<()>>>>,
) {
    let exit = tokio::select! {
        status = child.wait() => Exit::Natural(status),
        _ = stop_rx => {
            shutdown(&mut child, grace, &handle).await;
            Exit::Terminated
        }
    };

    // Si salió solo, un terminate posterior ya no tiene a quién avisar.
    live.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&handle);

    match exit {
        Exit::Terminated => {
            for pump in pumps {
                pump.abort();
            }
        }
        Exit::Natural(_) => drain(pumps).await,
    }

    let event = match exit {
        Exit::Terminated => RunnerEvent::Terminated(handle),
        Exit::Natural(Ok(status)) if status.success() => RunnerEvent::Finished {
            handle,
            exit_code: status.code().unwrap_or(0),
        },
        Exit::Natural(Ok(status)) => RunnerEvent::Failed {
            handle,
            reason: describe_exit(status),
            exit_code: status.code(),
        },
        Exit::Natural(Err(e)) => RunnerEvent::Failed {
            handle,
            reason: format!("error esperando el proceso: {e}"),
            exit_code: None,
        },
    };

    if events.send(event).is_err() {
        warn!("el scheduler ya no escucha eventos del runner");
    }
}

/// Terminación en dos fases: SIGTERM, plazo de gracia y luego kill.
async fn shutdown(child: &mut Child, grace: Duration, handle: &RunHandle) {
    signal_group(child, "TERM").await;

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("tarea {} salió tras SIGTERM", handle.task_id),
        Err(_) => {
            warn!(
                "tarea {} (run={}) no salió en {:?} tras SIGTERM, forzando kill",
                handle.task_id, handle.run, grace
            );
            signal_group(child, "KILL").await;
            if let Err(e) = child.kill().await {
                warn!("kill de la tarea {} falló: {}", handle.task_id, e);
            }
        }
    }
}

#[cfg(unix)]
async fn signal_group(child: &Child, signal: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    let result = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!("no se pudo enviar SIG{} al grupo {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
async fn signal_group(child: &mut Child, _signal: &str) {
    let _ = child.start_kill();
}

async fn pump_lines<R>(
    reader: R,
    stream: OutputStream,
    handle: RunHandle,
    events: mpsc::UnboundedSender<RunnerEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event = RunnerEvent::Output {
            handle: handle.clone(),
            stream,
            line,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Deja que la salida pendiente llegue antes del evento final. Si algún
/// nieto mantiene el pipe abierto no esperamos más del límite.
async fn drain(pumps: Vec<JoinHandle<()>>) {
    for mut pump in pumps {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("el proceso terminó con código {code}"),
        None => format!("el proceso terminó por señal ({status})"),
    }
}
