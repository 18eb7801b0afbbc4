use thiserror::Error;

/// Errores de validación de una oferta. Se detectan antes de llegar al
/// scheduler y nunca modifican su estado.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("bid_price debe ser un número finito mayor que 0 (recibido {0})")]
    InvalidBid(f64),

    #[error("bidder_id vacío")]
    EmptyBidder,

    #[error("el comando de la tarea está vacío")]
    EmptyCommand,

    #[error("nombre de salida declarada inválido: {0:?}")]
    InvalidOutputName(String),

    #[error("salida declarada duplicada: {0}")]
    DuplicateOutput(String),

    #[error("la oferta {bid} está por debajo del precio de reserva {reserve:.4}")]
    BelowReserve { bid: f64, reserve: f64 },
}

/// Banda de precios inválida para el proceso de precio de reserva.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("banda de precios inválida: floor={floor}, ceil={ceil} (se requiere ceil > floor, ambos finitos)")]
pub struct PriceBandError {
    pub floor: f64,
    pub ceil: f64,
}
