use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{PriceQuote, PriceProcess};
use tracing::debug;

/// Precio de reserva compartido. Solo el ticker avanza el proceso; las
/// lecturas devuelven siempre el último valor.
pub struct PriceFeed {
    inner: Mutex<FeedState>,
}

struct FeedState {
    process: PriceProcess,
    // precios de reserva emitidos, el más reciente al final
    history: VecDeque<f64>,
    limit: usize,
}

impl PriceFeed {
    pub fn new(process: PriceProcess, history_limit: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_limit.min(1024));
        if history_limit > 0 {
            history.push_back(process.reserve_price());
        }
        Self {
            inner: Mutex::new(FeedState {
                process,
                history,
                limit: history_limit,
            }),
        }
    }

    /// Avanza un paso y devuelve el nuevo precio de reserva.
    pub fn tick(&self) -> f64 {
        let mut st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        st.process.next();
        let reserve = st.process.reserve_price();

        if st.limit > 0 {
            if st.history.len() == st.limit {
                st.history.pop_front();
            }
            st.history.push_back(reserve);
        }
        reserve
    }

    pub fn reserve_price(&self) -> f64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process
            .reserve_price()
    }

    pub fn quote(&self) -> PriceQuote {
        let st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        PriceQuote {
            current: st.process.current(),
            reserve_price: st.process.reserve_price(),
            floor: st.process.floor(),
            ceil: st.process.ceil(),
        }
    }

    /// Del más antiguo al más reciente.
    pub fn history(&self) -> Vec<f64> {
        let st = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        st.history.iter().copied().collect()
    }
}

pub async fn run_price_ticker(feed: Arc<PriceFeed>, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        let reserve = feed.tick();
        debug!("nuevo precio de reserva: {:.4}", reserve);
    }
}
