//! Retención de fondos antes de admitir una tarea.

use async_trait::async_trait;
use common::{AccountId, ErrorBody, LedgerTransfer};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("fondos insuficientes en la cuenta {account}")]
    InsufficientFunds { account: AccountId },

    #[error("el banco rechazó la transferencia ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("banco inalcanzable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Mueve `amount` de la cuenta del usuario a la cuenta de escrow.
    async fn hold(&self, account: AccountId, amount: f64) -> Result<(), LedgerError>;
}

/// Sin banco configurado: todo envío tiene fondos.
pub struct OpenLedger;

#[async_trait]
impl Ledger for OpenLedger {
    async fn hold(&self, account: AccountId, amount: f64) -> Result<(), LedgerError> {
        debug!("sin banco: se acepta {} de la cuenta {}", amount, account);
        Ok(())
    }
}

pub struct HttpLedger {
    client: reqwest::Client,
    transfer_url: String,
    escrow: AccountId,
}

impl HttpLedger {
    pub fn new(base_url: &str, escrow: AccountId) -> Self {
        Self {
            client: reqwest::Client::new(),
            transfer_url: format!("{}/transfer", base_url.trim_end_matches('/')),
            escrow,
        }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn hold(&self, account: AccountId, amount: f64) -> Result<(), LedgerError> {
        let body = LedgerTransfer {
            from: account,
            to: self.escrow,
            amount,
        };
        let resp = self.client.post(&self.transfer_url).json(&body).send().await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::FORBIDDEN => Err(LedgerError::InsufficientFunds { account }),
            s => {
                let message = match resp.json::<ErrorBody>().await {
                    Ok(body) => body.error_message,
                    Err(_) => s.canonical_reason().unwrap_or("sin detalle").to_string(),
                };
                warn!("transferencia rechazada ({}): {}", s, message);
                Err(LedgerError::Rejected {
                    status: s.as_u16(),
                    message,
                })
            }
        }
    }
}
