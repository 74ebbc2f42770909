use dotenvy::dotenv;
use envconfig::Envconfig;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = certport_server::server::Config::init_from_env().unwrap();

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();

    let server = config.server().expect("invalid server configuration");
    server.run().await.expect("server failed");
}
