use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    ErrorBody, OutputDecl, OutputKind, PriceQuote, ResizeRequest, SchedulerSnapshot,
    SubmitTaskRequest, SubmitTaskResponse, TaskRecord, TaskSpec, TaskSummary,
};
use reqwest::{Client, Response};

/// - En Docker: PROVIDER_URL=http://provider:8080
/// - Local: default http://localhost:8080
fn provider_base_url() -> String {
    env::var("PROVIDER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "bidder")]
#[command(about = "CLI para ofertar tareas a un provider")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una tarea con su oferta
    Submit {
        /// Precio ofertado
        #[arg(long)]
        bid: f64,

        /// Cuenta del banco desde la que se retiene la oferta
        #[arg(long)]
        account: u64,

        #[arg(long, default_value = "bidder")]
        bidder: String,

        /// Salida declarada, formato nombre:tipo (number|string|boolean|json)
        #[arg(long = "output", value_parser = parse_output)]
        outputs: Vec<OutputDecl>,

        /// Espera hasta que la tarea termine
        #[arg(long)]
        wait: bool,

        /// Comando a ejecutar
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Consulta una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Lista todas las tareas del provider
    List,
    /// Cancela una tarea
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Precio de reserva actual
    Price,
    /// Historial de precios de reserva
    History,
    /// Tareas corriendo y en cola
    Scheduler,
    /// Cambia la capacidad del provider
    Resize {
        #[arg(allow_negative_numbers = true)]
        capacity: i64,
    },
}

fn parse_output(raw: &str) -> Result<OutputDecl, String> {
    let (name, kind) = raw
        .split_once(':')
        .ok_or_else(|| format!("se esperaba nombre:tipo, llegó {raw:?}"))?;
    let kind = match kind {
        "number" => OutputKind::Number,
        "string" => OutputKind::String,
        "boolean" => OutputKind::Boolean,
        "json" => OutputKind::Json,
        other => return Err(format!("tipo de salida desconocido: {other}")),
    };
    Ok(OutputDecl {
        name: name.to_string(),
        kind,
    })
}

/// Convierte una respuesta no exitosa en error con el mensaje del provider.
async fn ok_or_report(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("{} ({}): {}", body.status, status, body.error_message),
        Err(_) => bail!("el provider respondió {}", status),
    }
}

fn print_task(t: &TaskRecord) {
    println!("Tarea {}", t.id);
    println!("  bidder     : {}", t.bidder_id);
    println!("  oferta     : {}", t.bid);
    println!("  estado     : {:?}", t.state);
    println!("  comando    : {}", t.spec.command);
    println!("  arranques  : {}", t.times_started);
    println!("  run_ms     : {}", t.run_ms);
    println!("  enviada    : {}", t.submitted_at);
    if let Some(started) = t.started_at {
        println!("  iniciada   : {}", started);
    }
    if let Some(done) = t.finished_at {
        println!("  finalizada : {} (killed_by={:?})", done, t.killed_by);
    }
    if let Some(code) = t.exit_code {
        println!("  exit_code  : {}", code);
    }
    if let Some(ref reason) = t.failure {
        println!("  fallo      : {}", reason);
    }
}

fn print_summaries(title: &str, tasks: &[TaskSummary]) {
    println!("{} ({}):", title, tasks.len());
    for t in tasks {
        println!("  {}  bid={}  {:?}  ({})", t.id, t.bid, t.state, t.bidder_id);
    }
}

async fn fetch_task(client: &Client, base_url: &str, id: &str) -> Result<TaskRecord> {
    let url = format!("{}/api/v1/tasks/{}", base_url, id);
    let resp = ok_or_report(client.get(&url).send().await?).await?;
    Ok(resp.json().await?)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = provider_base_url();

    match cli.command {
        Commands::Submit {
            bid,
            account,
            bidder,
            outputs,
            wait,
            command,
        } => {
            let req = SubmitTaskRequest {
                bidder_id: bidder,
                user_account: account,
                bid_price: bid,
                spec: TaskSpec {
                    command: command.join(" "),
                    outputs,
                },
            };
            req.validate().context("oferta inválida")?;

            let url = format!("{}/api/v1/tasks", base_url);
            let resp = ok_or_report(client.post(&url).json(&req).send().await?).await?;
            let SubmitTaskResponse {
                task,
                reserve_price,
            } = resp.json().await?;

            println!("Tarea enviada (precio de reserva {:.4}):", reserve_price);
            print_task(&task);

            if wait {
                let mut last = task.state;
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let current = fetch_task(&client, &base_url, &task.id).await?;
                    if current.state != last {
                        println!("  -> {:?}", current.state);
                        last = current.state;
                    }
                    if current.state.is_terminal() {
                        print_task(&current);
                        break;
                    }
                }
            }
        }

        Commands::Status { id } => {
            let task = fetch_task(&client, &base_url, &id).await?;
            print_task(&task);
        }

        Commands::List => {
            let url = format!("{}/api/v1/tasks", base_url);
            let resp = ok_or_report(client.get(&url).send().await?).await?;
            let tasks: Vec<TaskRecord> = resp.json().await?;
            if tasks.is_empty() {
                println!("No hay tareas.");
            }
            for t in tasks {
                println!("{}  bid={}  {:?}  {}", t.id, t.bid, t.state, t.spec.command);
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let resp = ok_or_report(client.delete(&url).send().await?).await?;
            let task: TaskRecord = resp.json().await?;
            println!("Cancelación pedida; estado actual {:?}", task.state);
        }

        Commands::Price => {
            let url = format!("{}/api/v1/price", base_url);
            let resp = ok_or_report(client.get(&url).send().await?).await?;
            let quote: PriceQuote = resp.json().await?;
            println!("Precio de reserva: {:.4}", quote.reserve_price);
            println!("  banda  : [{}, {}]", quote.floor, quote.ceil);
            println!("  serie  : {:.4}", quote.current);
        }

        Commands::History => {
            let url = format!("{}/parameters/spot_price", base_url);
            let resp = ok_or_report(client.get(&url).send().await?).await?;
            let history: Vec<f64> = resp.json().await?;
            for (i, p) in history.iter().enumerate() {
                println!("{:>4}  {:.4}", i, p);
            }
        }

        Commands::Scheduler => {
            let url = format!("{}/api/v1/scheduler", base_url);
            let resp = ok_or_report(client.get(&url).send().await?).await?;
            let snap: SchedulerSnapshot = resp.json().await?;
            println!("Capacidad: {}", snap.capacity);
            match snap.clearing_price {
                Some(p) => println!("Precio de corte: {}", p),
                None => println!("Precio de corte: (hay huecos libres)"),
            }
            print_summaries("Corriendo", &snap.running);
            print_summaries("En cola", &snap.queued);
        }

        Commands::Resize { capacity } => {
            let url = format!("{}/api/v1/capacity", base_url);
            let resp = ok_or_report(
                client
                    .put(&url)
                    .json(&ResizeRequest { capacity })
                    .send()
                    .await?,
            )
            .await?;
            let snap: SchedulerSnapshot = resp.json().await?;
            println!(
                "Capacidad {} (corriendo={}, en cola={})",
                snap.capacity,
                snap.running.len(),
                snap.queued.len()
            );
        }
    }

    Ok(())
}
