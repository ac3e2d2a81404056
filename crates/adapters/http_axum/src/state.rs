//! Shared application state for axum handlers.

use std::sync::Arc;

use gattbridge_app::bridge::BridgeHandle;
use gattbridge_app::ports::data_model::DataModelServer;

/// State shared across all handlers.
///
/// Generic over the data-model server to avoid dynamic dispatch. `Clone` is
/// implemented manually so the server type itself does not need to be
/// `Clone` — only the `Arc` wrapper is cloned.
pub struct AppState<S> {
    /// Front door to the bridge event loop.
    pub bridge: BridgeHandle,
    /// Directory for resolving endpoint ids to their dynamic slots.
    pub server: Arc<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
            server: Arc::clone(&self.server),
        }
    }
}

impl<S: DataModelServer> AppState<S> {
    /// Bundle the bridge handle with the data-model directory.
    #[must_use]
    pub fn new(bridge: BridgeHandle, server: Arc<S>) -> Self {
        Self { bridge, server }
    }
}
