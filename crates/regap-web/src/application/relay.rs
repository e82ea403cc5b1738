//! Wiring of the registry, the forwarder and both connection managers.

use std::sync::Arc;

use regap_core::ClientsStore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::application::forwarder::{Forwarder, ForwarderError};
use crate::application::tcp_manager::TcpManager;
use crate::application::ws_manager::WsManager;

/// The two halves of the relay joined by a started [`Forwarder`].
pub struct Relay {
    pub store: Arc<ClientsStore>,
    pub forwarder: Arc<Forwarder>,
    pub ws: Arc<WsManager>,
    pub tcp: Arc<TcpManager>,
    listeners: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Builds both managers, starts both forwarder listeners and then the
    /// forwarder itself.
    ///
    /// # Errors
    ///
    /// Propagates [`ForwarderError`] from starting either listener.
    pub fn start(secret: &str) -> Result<Self, ForwarderError> {
        let store = Arc::new(ClientsStore::new());
        let forwarder = Arc::new(Forwarder::new());
        let ws = Arc::new(WsManager::new(Arc::clone(&store), Arc::clone(&forwarder)));
        let tcp = Arc::new(TcpManager::new(
            Arc::clone(&store),
            Arc::clone(&forwarder),
            secret,
        ));

        let listeners = vec![
            forwarder.start_from_tcp_listener(ws.clone())?,
            forwarder.start_from_ws_listener(tcp.clone())?,
        ];
        forwarder.start();
        info!("forwarder started");

        Ok(Self {
            store,
            forwarder,
            ws,
            tcp,
            listeners,
        })
    }

    /// Stops the forwarder and both listeners and waits for them to exit.
    pub async fn shutdown(self) {
        let store = &self.store;
        let tables = [&store.deliverers, &store.controllers, &store.gamepads];
        if tables.iter().any(|t| !t.is_empty()) {
            info!(
                deliverers = store.deliverers.len(),
                controllers = store.controllers.len(),
                gamepads = store.gamepads.len(),
                "clients still registered at shutdown"
            );
        }
        self.forwarder.stop();
        self.forwarder.stop_from_tcp_listener();
        self.forwarder.stop_from_ws_listener();
        for listener in self.listeners {
            if let Err(e) = listener.await {
                debug!("forwarder listener ended abnormally: {e}");
            }
        }
        info!("forwarder stopped");
    }
}
