//! Backend entry point: configuration, service assembly, worker runtime,
//! and the HTTP server.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
#[cfg(debug_assertions)]
use utoipa::OpenApi;
#[cfg(debug_assertions)]
use utoipa_swagger_ui::SwaggerUi;

use backend::domain::config::AppConfig;
#[cfg(debug_assertions)]
use backend::doc::ApiDoc;
use backend::inbound::http;
use backend::server::build_services;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let config = Arc::new(
        AppConfig::from_env().map_err(|error| std::io::Error::other(error.to_string()))?,
    );
    let bind_addr = config.bind_addr;
    if config.admin_token.is_none() {
        warn!("ADMIN_TOKEN unset; admin endpoints will refuse every request");
    }

    let services = build_services(config)
        .await
        .map_err(|error| std::io::Error::other(error.to_string()))?;
    services.runtime.spawn();
    info!(%bind_addr, "worker runtime started; binding HTTP server");

    let http_state = services.http_state;
    HttpServer::new(move || {
        let app = App::new()
            .app_data(web::Data::new(http_state.clone()))
            .configure(http::configure);

        #[cfg(debug_assertions)]
        let app =
            app.service(SwaggerUi::new("/docs/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()));

        app
    })
    .bind(bind_addr)?
    .run()
    .await
}
