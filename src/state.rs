//! The server's shared state, cloned (cheaply, via `Arc`) into every
//! request. Grounded in the teacher's `Chat` struct
//! (`examples/chat/src/chat.rs`), which plays the same "one value per
//! process, `Arc`-wrapped by `App`" role for a chat room's database pool
//! and broadcast channel.

use bb8::Pool;
use cookie::Key;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::db::ConnectionManager;
use crate::events::EventBus;
use crate::pipeline::{Pipeline, TriggerRegistry};

pub struct AppState {
    pub pool: Pool<ConnectionManager>,
    pub catalog: Arc<Catalog>,
    pub events: Arc<EventBus>,
    pub triggers: Arc<TriggerRegistry>,
    pub pipeline: Pipeline,
    pub session_key: Key,
    pub node_id: String,
}

impl AppState {
    pub fn new(pool: Pool<ConnectionManager>, catalog: Arc<Catalog>, events: Arc<EventBus>, session_key: Key, node_id: String) -> Self {
        let triggers = Arc::new(TriggerRegistry::default());
        let pipeline = Pipeline {
            catalog: catalog.clone(),
            events: events.clone(),
            triggers: triggers.clone(),
            node_id: node_id.clone(),
        };

        Self {
            pool,
            catalog,
            events,
            triggers,
            pipeline,
            session_key,
            node_id,
        }
    }
}
