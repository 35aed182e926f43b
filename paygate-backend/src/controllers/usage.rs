//! Usage counters for operators

use actix_web::{HttpResponse, Responder, web};

use crate::AppState;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/usage").route(web::get().to(get_usage)));
}

async fn get_usage(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.gate.usage().snapshot())
}
