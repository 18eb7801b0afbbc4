use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

/// Cada flag se puede dar también por variable de entorno (útil en Docker).
#[derive(Parser, Debug, Clone)]
#[command(name = "provider")]
#[command(about = "Nodo provider: admite tareas por precio y las ejecuta")]
pub struct ProviderConfig {
    #[arg(long, env = "PROVIDER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Tareas simultáneas
    #[arg(long, env = "PROVIDER_CAPACITY", default_value_t = 7)]
    pub capacity: usize,

    #[arg(long, env = "PRICE_FLOOR", default_value_t = 1.0)]
    pub price_floor: f64,

    #[arg(long, env = "PRICE_CEIL", default_value_t = 2.0)]
    pub price_ceil: f64,

    /// Semilla del proceso de precio; aleatoria si no se da
    #[arg(long, env = "PRICE_SEED")]
    pub price_seed: Option<u64>,

    #[arg(long, env = "PRICE_TICK_MS", default_value_t = 5000)]
    pub price_tick_ms: u64,

    /// Precios de reserva que se guardan para /parameters/spot_price
    #[arg(long, env = "PRICE_HISTORY", default_value_t = 64)]
    pub price_history: usize,

    #[arg(long, env = "TASK_LAUNCHER", default_value = "sh")]
    pub launcher: String,

    #[arg(
        long = "launcher-arg",
        env = "TASK_LAUNCHER_ARGS",
        default_value = "-c",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub launcher_args: Vec<String>,

    /// Tareas terminadas que se siguen pudiendo consultar
    #[arg(long, env = "TERMINAL_RETENTION", default_value_t = 1024)]
    pub terminal_retention: usize,

    /// Espera entre SIGTERM y SIGKILL
    #[arg(long, env = "TERMINATE_GRACE_MS", default_value_t = 5000)]
    pub terminate_grace_ms: u64,

    /// Banco central; sin él no se retienen fondos
    #[arg(long, env = "LEDGER_URL")]
    pub ledger_url: Option<String>,

    #[arg(long, env = "ESCROW_ACCOUNT", default_value_t = 0)]
    pub escrow_account: u64,

    /// Servicio de descubrimiento; sin él no se anuncia nada
    #[arg(long, env = "REGISTRY_URL")]
    pub registry_url: Option<String>,

    #[arg(long, env = "REGISTRY_INTERVAL_SECS", default_value_t = 10)]
    pub registry_interval_secs: u64,

    #[arg(long, env = "PUBLIC_ADDRESS")]
    pub public_address: Option<String>,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.price_floor.is_finite() || !self.price_ceil.is_finite() {
            bail!(
                "banda de precios no finita: floor={}, ceil={}",
                self.price_floor,
                self.price_ceil
            );
        }
        if self.price_ceil <= self.price_floor {
            bail!(
                "price-ceil ({}) debe ser mayor que price-floor ({})",
                self.price_ceil,
                self.price_floor
            );
        }
        if self.price_tick_ms == 0 {
            bail!("price-tick-ms debe ser > 0");
        }
        if self.registry_url.is_some() && self.registry_interval_secs == 0 {
            bail!("registry-interval-secs debe ser > 0");
        }
        if self.launcher.trim().is_empty() {
            bail!("launcher vacío");
        }
        Ok(())
    }

    pub fn price_tick(&self) -> Duration {
        Duration::from_millis(self.price_tick_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn registry_interval(&self) -> Duration {
        Duration::from_secs(self.registry_interval_secs)
    }

    /// Dirección que se anuncia al registry: la configurada o hostname:puerto.
    pub fn public_address(&self) -> String {
        if let Some(addr) = &self.public_address {
            return addr.clone();
        }
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let host = if host.is_empty() { "localhost".to_string() } else { host };
        format!("{}:{}", host, self.listen.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ProviderConfig {
        let mut argv = vec!["provider"];
        argv.extend_from_slice(args);
        ProviderConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = parse(&[]);
        assert_eq!(cfg.capacity, 7);
        assert_eq!(cfg.terminal_retention, 1024);
        assert_eq!(cfg.launcher, "sh");
        assert_eq!(cfg.launcher_args, vec!["-c"]);
        assert_eq!(cfg.price_tick(), Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn launcher_args_accept_hyphens_and_repeat() {
        let cfg = parse(&[
            "--launcher",
            "docker",
            "--launcher-arg",
            "run",
            "--launcher-arg",
            "--rm",
        ]);
        assert_eq!(cfg.launcher_args, vec!["run", "--rm"]);
    }

    #[test]
    fn rejects_inverted_band_and_zero_tick() {
        assert!(parse(&["--price-floor", "3", "--price-ceil", "2"]).validate().is_err());
        assert!(parse(&["--price-floor", "2", "--price-ceil", "2"]).validate().is_err());
        assert!(parse(&["--price-tick-ms", "0"]).validate().is_err());
    }

    #[test]
    fn public_address_defaults_to_host_and_port() {
        let cfg = parse(&["--listen", "127.0.0.1:9100"]);
        assert!(cfg.public_address().ends_with(":9100"));

        let cfg = parse(&["--public-address", "10.1.2.3:80"]);
        assert_eq!(cfg.public_address(), "10.1.2.3:80");
    }
}
