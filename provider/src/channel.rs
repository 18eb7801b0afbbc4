use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use common::{BidderId, Notification};
use tokio::sync::mpsc;
use tracing::debug;

/// Reparte notificaciones a las conexiones abiertas de cada bidder.
///
/// La entrega es best-effort: una conexión caída se descarta en el siguiente
/// `publish` o `subscribe` y el scheduler nunca se entera.
#[derive(Default)]
pub struct BidderHub {
    subscribers: Mutex<HashMap<BidderId, Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl BidderHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, bidder: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // bidders que se fueron y no volvieron a recibir nada
        subscribers.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });

        subscribers
            .entry(bidder.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// No bloquea nunca. Devuelve a cuántas conexiones llegó.
    pub fn publish(&self, bidder: &str, notification: Notification) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(senders) = subscribers.get_mut(bidder) else {
            debug!(
                "sin conexiones para {}; se descarta {:?}",
                bidder, notification
            );
            return 0;
        };

        senders.retain(|tx| tx.send(notification.clone()).is_ok());
        let delivered = senders.len();
        if delivered == 0 {
            subscribers.remove(bidder);
        }
        delivered
    }

    #[cfg(test)]
    fn subscriber_count(&self, bidder: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bidder)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> Notification {
        Notification::Started {
            task_id: id.to_string(),
        }
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let hub = BidderHub::new();
        assert_eq!(hub.publish("nadie", started("t1")), 0);
    }

    #[test]
    fn every_connection_of_the_bidder_gets_it() {
        let hub = BidderHub::new();
        let mut a = hub.subscribe("alice");
        let mut b = hub.subscribe("alice");
        let mut other = hub.subscribe("bob");

        assert_eq!(hub.publish("alice", started("t1")), 2);
        assert_eq!(a.try_recv().unwrap(), started("t1"));
        assert_eq!(b.try_recv().unwrap(), started("t1"));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn closed_connections_are_pruned() {
        let hub = BidderHub::new();
        let keep = hub.subscribe("alice");
        let gone = hub.subscribe("alice");
        drop(gone);

        assert_eq!(hub.publish("alice", started("t1")), 1);
        assert_eq!(hub.subscriber_count("alice"), 1);

        drop(keep);
        assert_eq!(hub.publish("alice", started("t2")), 0);
        assert_eq!(hub.subscriber_count("alice"), 0);
    }

    #[test]
    fn subscribe_prunes_bidders_that_left() {
        let hub = BidderHub::new();
        drop(hub.subscribe("alice"));
        drop(hub.subscribe("bob"));

        let _carol = hub.subscribe("carol");
        assert_eq!(hub.subscriber_count("alice"), 0);
        assert_eq!(hub.subscriber_count("bob"), 0);
        assert_eq!(hub.subscriber_count("carol"), 1);
        assert_eq!(hub.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn order_is_preserved_per_connection() {
        let hub = BidderHub::new();
        let mut rx = hub.subscribe("alice");
        for i in 0..5 {
            hub.publish("alice", started(&format!("t{i}")));
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), started(&format!("t{i}")));
        }
    }
}
