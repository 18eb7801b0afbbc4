// provider/src/state.rs

use std::sync::Arc;

use crate::channel::BidderHub;
use crate::ledger::Ledger;
use crate::price_feed::PriceFeed;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub price: Arc<PriceFeed>,
    // el mismo hub que usa el scheduler para publicar
    pub hub: Arc<BidderHub>,
    pub ledger: Arc<dyn Ledger>,
}

#[cfg(test)]
pub(crate) use testing::{test_state, test_state_with_ledger};

#[cfg(test)]
mod testing {
    use super::*;
    use crate::ledger::OpenLedger;
    use crate::runner::{RunHandle, SpawnError, TaskRunner};
    use common::{PriceProcess, TaskRecord};

    /// Acepta todo start y no hace nada; las tareas quedan "corriendo".
    struct IdleRunner;

    impl TaskRunner for IdleRunner {
        fn start(&self, _task: &TaskRecord, _handle: RunHandle) -> Result<(), SpawnError> {
            Ok(())
        }

        fn terminate(&self, _handle: &RunHandle) {}
    }

    pub(crate) fn test_state_with_ledger(capacity: usize, ledger: Arc<dyn Ledger>) -> AppState {
        let hub = Arc::new(BidderHub::new());
        let scheduler = Arc::new(Scheduler::new(capacity, Arc::new(IdleRunner), hub.clone()));
        let process = PriceProcess::new(1.0, 2.0, 3).expect("banda válida");
        AppState {
            scheduler,
            price: Arc::new(PriceFeed::new(process, 16)),
            hub,
            ledger,
        }
    }

    pub(crate) fn test_state(capacity: usize) -> AppState {
        test_state_with_ledger(capacity, Arc::new(OpenLedger))
    }
}
