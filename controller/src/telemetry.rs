use crate::error::{self, Result};
use crate::runner::Shutdown;
use models::constants::{COMPONENT, HEALTH_CHECK_ROUTE, METRICS_ROUTE};

use actix_web::{
    get,
    web::{self, Data},
    App, HttpResponse, HttpServer,
};
use opentelemetry::{global, metrics::MetricsError};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use snafu::ResultExt;
use std::net::SocketAddr;
use tracing::{event, Level};

/// Builds a meter provider whose instruments are exported into `registry` under the controller's namespace.
pub fn prometheus_meter_provider(registry: &Registry) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace(COMPONENT)
        .without_scope_info()
        .without_target_info()
        .build()
        .context(error::PrometheusExporterSnafu)?;

    Ok(SdkMeterProvider::builder().with_reader(exporter).build())
}

#[get("/metrics")]
pub async fn vending_metrics(registry: Data<Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families[..], &mut buf) {
        global::handle_error(MetricsError::Other(err.to_string()));
    }

    let body = String::from_utf8(buf).unwrap_or_default();
    HttpResponse::Ok()
        .insert_header((http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT))
        .body(body)
}

/// Liveness endpoint. Any request succeeds while the server is running.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().finish()
}

pub fn configure_routes(config: &mut web::ServiceConfig) {
    config
        .service(vending_metrics)
        .route(HEALTH_CHECK_ROUTE, web::to(health_check));
}

/// Serves `/metrics` and `/healthz` until `shutdown` fires, then stops gracefully.
pub async fn serve(address: SocketAddr, registry: Registry, shutdown: Shutdown) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(registry.clone()))
            .configure(configure_routes)
    })
    .bind(address)
    .context(error::PrometheusServerSnafu)?
    // Termination signals are handled by the lifecycle runner.
    .disable_signals()
    .run();
    let handle = server.handle();
    event!(
        Level::INFO,
        %address,
        metrics = METRICS_ROUTE,
        health = HEALTH_CHECK_ROUTE,
        "Serving telemetry."
    );

    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result.context(error::PrometheusServerSnafu),
        _ = shutdown.wait() => {
            handle.stop(true).await;
            server.await.context(error::PrometheusServerSnafu)
        }
    }
}
