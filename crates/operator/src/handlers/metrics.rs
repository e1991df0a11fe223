use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};
use prometheus::{Encoder, TextEncoder};

use crate::server::AppState;

#[get("/metrics")]
pub async fn metrics(state: Data<AppState>, _req: HttpRequest) -> impl Responder {
    let families = state.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&families, &mut buffer).is_err() {
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}
