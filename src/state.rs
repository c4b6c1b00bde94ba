use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::offer::OfferTransport;
use crate::models::event::PickupEvent;
use crate::models::vendor::VendorBackend;
use crate::observability::metrics::Metrics;
use crate::store::{IdentityProvider, PickupStore, VendorDirectory};

/// In-memory side of a running dispatch: the ranked candidates, where the
/// iteration stands, vendors rejected during this session, and the armed
/// timer. The store row stays authoritative; this is cache plus scheduler.
pub struct DispatchSession {
    pub candidates: Vec<VendorBackend>,
    pub index: usize,
    pub rejected: HashSet<String>,
    pub timer: Option<JoinHandle<()>>,
}

impl DispatchSession {
    /// Empty session, filled in by dispatch under the session lock.
    pub fn new() -> Self {
        Self {
            candidates: Vec::new(),
            index: 0,
            rejected: HashSet::new(),
            timer: None,
        }
    }

    pub fn current(&self) -> Option<&VendorBackend> {
        self.candidates.get(self.index)
    }
}

impl Default for DispatchSession {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn PickupStore>,
    pub vendors: Arc<dyn VendorDirectory>,
    pub identity: Arc<dyn IdentityProvider>,
    pub offers: Arc<dyn OfferTransport>,
    pub sessions: DashMap<Uuid, Arc<Mutex<DispatchSession>>>,
    pub pickup_events_tx: broadcast::Sender<PickupEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn PickupStore>,
        vendors: Arc<dyn VendorDirectory>,
        identity: Arc<dyn IdentityProvider>,
        offers: Arc<dyn OfferTransport>,
    ) -> Self {
        let (pickup_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        Self {
            config,
            store,
            vendors,
            identity,
            offers,
            sessions: DashMap::new(),
            pickup_events_tx,
            metrics: Metrics::new(),
        }
    }

    /// Best-effort fan-out; nobody listening is fine.
    pub fn publish(&self, event: PickupEvent) {
        let _ = self.pickup_events_tx.send(event);
    }

    /// The session handle for a pickup, cloned out so no map guard is held
    /// across an await.
    pub fn session(&self, pickup_id: Uuid) -> Option<Arc<Mutex<DispatchSession>>> {
        self.sessions.get(&pickup_id).map(|entry| entry.value().clone())
    }
}
