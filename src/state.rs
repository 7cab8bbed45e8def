//! Shared application state passed to both the public and admin servers.

use std::sync::Arc;

use crate::config::Config;
use crate::tunnel::ClientManager;

pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ClientManager>,
}
