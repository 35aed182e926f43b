//! Paid resources
//!
//! Handlers take a [`Paid`] argument. Extracting it runs the payment gate,
//! so a handler body only executes once the payment has settled.

use actix_web::dev::Payload;
use actix_web::error::InternalError;
use actix_web::http::StatusCode;
use actix_web::{FromRequest, HttpRequest, HttpResponse, web};
use futures_util::future::LocalBoxFuture;
use paygate_types::{PAYMENT_HEADER, PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER};

use crate::AppState;
use crate::error::GateRejection;
use crate::payment::{AuthorizedContext, PaymentRequest};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/paid/{operation}")
            .route(web::get().to(paid_operation))
            .route(web::post().to(paid_operation)),
    );
}

/// A request whose payment has been verified and settled
pub struct Paid(pub AuthorizedContext);

impl Paid {
    pub fn context(&self) -> &AuthorizedContext {
        &self.0
    }
}

/// Status, structured body and (for challenges) the `PAYMENT-REQUIRED` header
pub(crate) fn rejection_response(rejection: &GateRejection) -> HttpResponse {
    let status =
        StatusCode::from_u16(rejection.http_status()).unwrap_or(StatusCode::PAYMENT_REQUIRED);
    let mut response = HttpResponse::build(status);
    if let Some(challenge) = rejection.challenge() {
        match challenge.to_base64() {
            Ok(encoded) => {
                response.insert_header((PAYMENT_REQUIRED_HEADER, encoded));
            }
            Err(e) => log::error!("[Gate] Failed to encode challenge header: {}", e),
        }
    }
    response.json(rejection.to_body())
}

impl FromRequest for Paid {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let state = req
                .app_data::<web::Data<AppState>>()
                .cloned()
                .ok_or_else(|| actix_web::error::ErrorInternalServerError("app state missing"))?;

            let operation = req.match_info().get("operation").unwrap_or_default().to_string();
            let resource = req.uri().path().to_string();
            let header = req
                .headers()
                .get(PAYMENT_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let request = PaymentRequest {
                operation: &operation,
                resource: &resource,
                header: header.as_deref(),
            };

            match state.gate.authorize(&request).await {
                Ok(ctx) => Ok(Paid(ctx)),
                Err(rejection) => {
                    let response = rejection_response(&rejection);
                    Err(InternalError::from_response(rejection, response).into())
                }
            }
        })
    }
}

/// Settlement header plus the JSON body every paid response carries
pub(crate) fn paid_response(ctx: &AuthorizedContext, network: &str, result: serde_json::Value) -> HttpResponse {
    let mut response = HttpResponse::Ok();
    match ctx.settlement_response(network).to_base64() {
        Ok(encoded) => {
            response.insert_header((PAYMENT_RESPONSE_HEADER, encoded));
        }
        Err(e) => log::error!("[Gate] Failed to encode settlement header: {}", e),
    }
    response.json(serde_json::json!({
        "success": true,
        "operation": ctx.operation,
        "payer": ctx.proof.payer().to_checksum(),
        "amount": ctx.price,
        "transaction": ctx.receipt.tx_hash,
        "result": result,
    }))
}

async fn paid_operation(state: web::Data<AppState>, paid: Paid, body: web::Bytes) -> HttpResponse {
    let ctx = paid.context();
    log::info!(
        "[Gate] Serving '{}' for {} (tx {})",
        ctx.operation,
        ctx.proof.payer(),
        ctx.receipt.tx_hash
    );
    let echo = String::from_utf8_lossy(&body).into_owned();
    paid_response(ctx, &state.config.network, serde_json::Value::String(echo))
}
