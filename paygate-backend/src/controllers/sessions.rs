//! Session wallet API
//!
//! Callers prove they own the address they act for by personal-signing
//! `paygate:{METHOD}:{path}:{timestamp}:{keccak(body)}` and sending the
//! result in the `X-OWNER-*` headers. Each signed message is consumed through
//! the nonce store, so a captured request cannot be replayed and a client
//! repeating an identical request must move the timestamp on.

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, web};
use chrono::Utc;
use ethers::core::types::Signature;
use ethers::types::H256;
use ethers::utils::keccak256;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::Arc;

use super::paid::{paid_response, rejection_response};
use crate::AppState;
use crate::domain_types::{EthAddress, TokenAmount};
use crate::error::SessionError;
use crate::nonce_ledger::AUTH_CLAIMANT_PREFIX;
use crate::sessions::SessionWalletManager;

pub const OWNER_ADDRESS_HEADER: &str = "X-OWNER-ADDRESS";
pub const OWNER_TIMESTAMP_HEADER: &str = "X-OWNER-TIMESTAMP";
pub const OWNER_SIGNATURE_HEADER: &str = "X-OWNER-SIGNATURE";

/// Largest clock lead accepted on an owner timestamp, in seconds
const MAX_FUTURE_SKEW_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Decimal token amount, e.g. "1.00"
    spending_cap: String,
}

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    operation: String,
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/sessions")
            .route("", web::post().to(create_session))
            .route("", web::get().to(list_sessions))
            .route("/{id}", web::get().to(get_session))
            .route("/{id}/fund", web::post().to(confirm_funding))
            .route("/{id}/activate", web::post().to(activate_session))
            .route("/{id}/pay", web::post().to(pay))
            .route("/{id}/close", web::post().to(close_session)),
    );
}

/// Message an owner signs to authenticate one request
pub fn owner_auth_message(method: &str, path: &str, timestamp: i64, body: &[u8]) -> String {
    format!(
        "paygate:{}:{}:{}:0x{}",
        method.to_uppercase(),
        path,
        timestamp,
        hex::encode(keccak256(body))
    )
}

/// Ledger key under which a signed owner message is consumed
fn owner_auth_nonce(owner: EthAddress, message: &str) -> H256 {
    let mut preimage = b"paygate-owner-auth".to_vec();
    preimage.extend_from_slice(owner.0.as_bytes());
    preimage.extend_from_slice(message.as_bytes());
    H256::from(keccak256(preimage))
}

fn unauthorized(message: &str) -> HttpResponse {
    HttpResponse::Unauthorized().json(serde_json::json!({
        "success": false,
        "error": message
    }))
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "success": false,
        "error": message
    }))
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|h| h.to_str().ok())
}

/// Whether `timestamp` lies inside the freshness window around `now`.
/// At most `MAX_FUTURE_SKEW_SECS` (or half the window) may be in the future.
fn timestamp_is_fresh(now: i64, timestamp: i64, window_secs: u64) -> bool {
    let future_skew = MAX_FUTURE_SKEW_SECS.min(window_secs / 2);
    let max_age = window_secs - future_skew;
    if timestamp > now {
        now.abs_diff(timestamp) <= future_skew
    } else {
        now.abs_diff(timestamp) <= max_age
    }
}

/// Resolve the authenticated owner, or the response to send instead.
/// A valid signature is consumed, so a second use is rejected.
async fn validate_owner(
    state: &web::Data<AppState>,
    req: &HttpRequest,
    body: &[u8],
) -> Result<EthAddress, HttpResponse> {
    let (Some(address), Some(timestamp), Some(signature)) = (
        header(req, OWNER_ADDRESS_HEADER),
        header(req, OWNER_TIMESTAMP_HEADER),
        header(req, OWNER_SIGNATURE_HEADER),
    ) else {
        return Err(unauthorized("Owner address, timestamp and signature headers are required"));
    };

    let owner = EthAddress::parse(address.trim()).map_err(|e| unauthorized(&e))?;
    let timestamp: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| unauthorized("Owner timestamp must be unix seconds"))?;

    let window = state.config.freshness_window.as_secs();
    if !timestamp_is_fresh(Utc::now().timestamp(), timestamp, window) {
        return Err(unauthorized("Owner signature has expired"));
    }

    let signature =
        Signature::from_str(signature.trim()).map_err(|_| unauthorized("Malformed owner signature"))?;
    let message = owner_auth_message(req.method().as_str(), req.path(), timestamp, body);
    match signature.recover(message.as_str()) {
        Ok(recovered) if EthAddress::from(recovered) == owner => {}
        _ => return Err(unauthorized("Owner signature does not match address")),
    }

    let nonces = state.gate.nonce_store();
    let nonce = owner_auth_nonce(owner, &message);
    let claimant = format!("{}{}", AUTH_CLAIMANT_PREFIX, owner);
    let consumed = match nonces.claim(nonce, &claimant).await {
        Ok(true) => nonces.confirm(nonce).await,
        Ok(false) => return Err(unauthorized("Owner signature already used")),
        Err(e) => Err(e),
    };
    consumed.map_err(|e| {
        log::error!("[Sessions] Could not record owner signature for {}: {}", owner, e);
        HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "success": false,
            "error": "Owner authentication is temporarily unavailable"
        }))
    })?;

    Ok(owner)
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, HttpResponse> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("Invalid request body: {}", e)))
}

fn manager(state: &web::Data<AppState>) -> Result<Arc<SessionWalletManager>, HttpResponse> {
    state.sessions.clone().ok_or_else(|| {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "success": false,
            "error": "Session wallets are not enabled on this server"
        }))
    })
}

fn error_response(e: SessionError) -> HttpResponse {
    if let SessionError::Payment(rejection) = &e {
        return rejection_response(rejection);
    }
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        log::error!("[Sessions] {}", e);
    }
    HttpResponse::build(status).json(serde_json::json!({
        "success": false,
        "error": e.to_string()
    }))
}

fn session_response(record: &crate::sessions::SessionRecord) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "session": record,
        "remaining": record.remaining()
    }))
}

async fn create_session(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let body: CreateSessionRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    let cap = match TokenAmount::from_decimal_str(&body.spending_cap, state.config.token_decimals) {
        Ok(cap) => cap,
        Err(e) => {
            return bad_request(format!("Invalid spending cap: {}", e));
        }
    };

    match manager.create_session(owner, cap).await {
        Ok(record) => session_response(&record),
        Err(e) => error_response(e),
    }
}

async fn list_sessions(state: web::Data<AppState>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match manager.list(owner).await {
        Ok(sessions) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "sessions": sessions
        })),
        Err(e) => error_response(e),
    }
}

async fn get_session(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match manager.get(&path, owner).await {
        Ok(record) => session_response(&record),
        Err(e) => error_response(e),
    }
}

async fn confirm_funding(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match manager.confirm_funding(&path, owner).await {
        Ok(record) => session_response(&record),
        Err(e) => error_response(e),
    }
}

async fn activate_session(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match manager.activate(&path, owner).await {
        Ok(record) => session_response(&record),
        Err(e) => error_response(e),
    }
}

async fn pay(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let body: PayRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match manager
        .spend(&path, owner, &body.operation, state.gate.as_ref())
        .await
    {
        Ok(ctx) => paid_response(
            &ctx,
            &state.config.network,
            serde_json::json!({ "session": path.as_str() }),
        ),
        Err(e) => error_response(e),
    }
}

async fn close_session(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let owner = match validate_owner(&state, &req, &body).await {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let manager = match manager(&state) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match manager.close(&path, owner).await {
        Ok(record) => session_response(&record),
        Err(e) => error_response(e),
    }
}
