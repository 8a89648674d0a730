//! HTTP delivery: MJPEG stream, snapshot and status

mod handlers;
mod routes;

use std::sync::Arc;

use crate::stream::{ClientRegistry, StreamHandle};

pub use routes::create_router;

/// State shared by all HTTP handlers
pub struct WebState {
    pub stream: StreamHandle,
    pub clients: Arc<ClientRegistry>,
}

impl WebState {
    pub fn new(stream: StreamHandle) -> Arc<Self> {
        Arc::new(Self {
            stream,
            clients: Arc::new(ClientRegistry::new()),
        })
    }
}
