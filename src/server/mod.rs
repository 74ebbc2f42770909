mod config;
mod error;
mod handlers;
mod implementation;
mod state;

pub use {
    config::Config, error::Error, error::Result, handlers::router, implementation::Server,
    state::AppState, state::SharedState,
};
