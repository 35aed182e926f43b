use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use dotenv::dotenv;

use paygate_backend::config::Config;
use paygate_backend::nonce_ledger::spawn_eviction_task;
use paygate_backend::payment::spawn_in_doubt_resolver;
use paygate_backend::{build_state, controllers};
use paygate_types::{PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env().map_err(std::io::Error::other)?;
    let port = config.port;
    log::info!(
        "Starting paygate in {} mode on network {} (token {}, settlement {})",
        config.mode,
        config.network,
        config.token,
        config.settlement_contract
    );

    let eviction_interval = config.nonce_eviction_interval;
    let eviction_horizon = config.freshness_window;
    let in_doubt_age = config.in_doubt_age();

    let state = build_state(config).map_err(std::io::Error::other)?;
    log::info!(
        "Serving {} paid operations, nonce store: {}",
        state.gate.pricing().len(),
        state.gate.nonce_store().store_name()
    );

    let eviction = spawn_eviction_task(
        state.gate.nonce_store(),
        eviction_interval,
        eviction_horizon,
    );
    let resolver = spawn_in_doubt_resolver(state.gate.clone(), eviction_interval, in_doubt_age);

    let state = web::Data::new(state);

    log::info!("Listening on port {}", port);
    let result = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .expose_headers(vec![PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER])
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .configure(controllers::paid::config)
            .configure(controllers::usage::config)
            .configure(controllers::sessions::config)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    eviction.abort();
    resolver.abort();
    result
}
