//! Proceso estocástico del precio de reserva.
//!
//! `p[t+1] = -0.7 * p[t] + ruido`, con ruido gaussiano de media 0 y
//! desviación `0.39 * (ceil - floor)`. El coeficiente negativo hace que la
//! serie oscile alrededor de 0 en vez de derivar como un paseo aleatorio.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::PriceBandError;

pub const FEEDBACK: f64 = -0.7;
pub const NOISE_SCALE: f64 = 0.39;

#[derive(Debug, Clone)]
pub struct PriceProcess {
    floor: f64,
    ceil: f64,
    seed: u64,
    previous: f64,
    noise: Normal<f64>,
    rng: StdRng,
}

impl PriceProcess {
    pub fn new(floor: f64, ceil: f64, seed: u64) -> Result<Self, PriceBandError> {
        if !floor.is_finite() || !ceil.is_finite() || ceil <= floor {
            return Err(PriceBandError { floor, ceil });
        }
        let noise = Normal::new(0.0, NOISE_SCALE * (ceil - floor))
            .map_err(|_| PriceBandError { floor, ceil })?;

        Ok(Self {
            floor,
            ceil,
            seed,
            previous: 0.0,
            noise,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Último valor emitido, sin avanzar la secuencia.
    pub fn current(&self) -> f64 {
        self.previous
    }

    /// Precio de reserva: la serie cruda desplazada al centro de la banda y
    /// recortada a `[floor, ceil]`.
    pub fn reserve_price(&self) -> f64 {
        let midpoint = (self.floor + self.ceil) / 2.0;
        (midpoint + self.previous).clamp(self.floor, self.ceil)
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }

    pub fn ceil(&self) -> f64 {
        self.ceil
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Vuelve al estado inicial con la misma semilla.
    pub fn reset(&mut self) {
        self.previous = 0.0;
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}

/// Secuencia infinita: `next()` nunca devuelve `None`.
impl Iterator for PriceProcess {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        self.previous = FEEDBACK * self.previous + self.noise.sample(&mut self.rng);
        Some(self.previous)
    }
}
