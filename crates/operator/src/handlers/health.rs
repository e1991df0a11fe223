use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};

use crate::server::AppState;

/// Diagnostics: a snapshot of every running worker.
#[get("/")]
pub async fn index(state: Data<AppState>, _req: HttpRequest) -> impl Responder {
    let mut workers = Vec::new();
    for name in state.supervisor.list() {
        if let Some(handle) = state.supervisor.lookup(&name) {
            if let Some(snapshot) = handle.state().await {
                workers.push(snapshot);
            }
        }
    }
    HttpResponse::Ok().json(workers)
}

#[get("/health")]
pub async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/ready")]
pub async fn ready(state: Data<AppState>, _req: HttpRequest) -> impl Responder {
    if state.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("not ready")
    }
}
