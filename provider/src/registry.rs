use std::time::Duration;

use common::RegistryAnnouncement;
use tracing::{debug, warn};

use crate::state::AppState;

pub fn build_announcement(state: &AppState, address: &str) -> RegistryAnnouncement {
    let (capacity, running, queued) = state.scheduler.counts();
    RegistryAnnouncement {
        address: address.to_string(),
        capacity,
        running,
        queued,
        reserve_price: state.price.reserve_price(),
    }
}

/// Anuncia este provider al servicio de descubrimiento cada `every`. Un
/// registry caído solo produce un warning; se reintenta en la próxima vuelta.
pub async fn run_registry_loop(state: AppState, registry_url: String, address: String, every: Duration) {
    let client = reqwest::Client::new();
    let url = format!("{}/add-provider", registry_url.trim_end_matches('/'));

    loop {
        let announcement = build_announcement(&state, &address);
        match client.post(&url).json(&announcement).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("anunciado en {} ({:?})", url, announcement)
            }
            Ok(resp) => warn!("registry respondió {} a {}", resp.status(), url),
            Err(e) => warn!("no se pudo anunciar en {}: {}", url, e),
        }
        tokio::time::sleep(every).await;
    }
}
