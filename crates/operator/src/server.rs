use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use actix_web::{middleware, web::Data, App, HttpServer};
use anyhow::Result;
use nopea_core::supervisor::Supervisor;
use nopea_core::util::metrics::Metrics;
use tokio::sync::watch;

use crate::handlers::{health, metrics, webhook};

/// State shared between the controller wiring and the web server.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub registry: prometheus::Registry,
    pub metrics: Metrics,
    pub webhook_secret: Option<String>,
    pub leadership: watch::Receiver<bool>,
    pub leader_election_enabled: bool,
    pub watching: Arc<AtomicBool>,
}

impl AppState {
    /// Ready to serve: leader (when HA is on) and actively watching.
    pub fn is_ready(&self) -> bool {
        let leading = !self.leader_election_enabled || *self.leadership.borrow();
        leading && self.watching.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Serve the diagnostics, readiness, metrics and webhook routes.
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(health::ready)
            .service(metrics::metrics)
            .service(webhook::webhook)
    })
    .bind(("0.0.0.0", port))?
    .shutdown_timeout(5);

    server.run().await?;
    Ok(())
}
