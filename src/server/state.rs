use std::sync::Arc;

use crate::acme::Manager;

pub struct AppState {
    manager: Arc<Manager>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }
}

pub type SharedState = Arc<AppState>;
