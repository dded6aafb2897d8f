use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use std::sync::Arc;

use crate::circuit_breaker::HaltRegistry;
use crate::metrics;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    halted_pairs: Vec<String>,
}

pub async fn health_check(halts: web::Data<Arc<HaltRegistry>>) -> impl Responder {
    let halted_pairs = halts.halted_pairs();
    let status = if halted_pairs.is_empty() { "ok" } else { "degraded" };
    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        halted_pairs,
    })
}

pub async fn metrics_text() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

// Ops-only surface; order/trade queries are served outside the core
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/metrics").route(web::get().to(metrics_text)));
}
