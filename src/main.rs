// Hurricane Hunter API v0.1
use axum::http::{HeaderName, Method};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod errors;
mod helpers;
mod models;
mod routes;
mod services;

use config::AppConfig;
use services::aggregator::{hazard_cache, trajectory_cache, Aggregator};
use services::clock::{SharedClock, SystemClock};
use services::fetcher::FanOutFetcher;
use services::proximity::ProximityClassifier;
use services::sources::HttpSourceAdapter;

/// Hurricane Hunter API — OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Hurricane Hunter API",
        version = "0.1.0",
        description = "Weather balloon tracking service. Aggregates balloon trajectory \
            feeds and storm-alert feeds from independent upstream sources, caches each \
            dataset with a TTL, and flags balloons currently within a buffer distance of \
            an active hazard area.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service and dataset health"),
        (name = "Trajectories", description = "Balloon trajectories and monitoring flags"),
        (name = "Hazards", description = "Active hazard areas"),
    ),
    paths(
        routes::health::health_check,
        routes::trajectories::list_trajectories,
        routes::trajectories::get_trajectory,
        routes::hazards::list_hazards,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            services::cache::DatasetHealth,
            routes::trajectories::PointResponse,
            routes::trajectories::TrajectoryResponse,
            routes::hazards::HazardResponse,
            models::Severity,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env();

    // Initialize tracing; LOG_FORMAT=json switches to JSON lines
    let log_json = config.as_ref().map(|c| c.log_json).unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hurricane_hunter_api=debug,tower_http=debug".into()),
        )
        .with(log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!log_json).then(tracing_subscriber::fmt::layer))
        .init();

    let config = match config {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let clock: SharedClock = Arc::new(SystemClock);

    let adapter = HttpSourceAdapter::new(&config.user_agent, config.source_timeout(), clock.clone())
        .expect("Failed to build HTTP client");
    let fetcher = FanOutFetcher::new(Arc::new(adapter), clock.clone(), config.fetch_deadline());

    let trajectory_sources = config.trajectory_sources();
    let hazard_sources = config.hazard_sources();
    tracing::info!(
        "Configured {} trajectory sources and {} hazard sources",
        trajectory_sources.len(),
        hazard_sources.len()
    );

    let aggregator = Aggregator::new(
        trajectory_cache(
            fetcher.clone(),
            trajectory_sources,
            config.trajectory_ttl(),
            clock.clone(),
        ),
        hazard_cache(fetcher, hazard_sources, config.hazard_ttl(), clock.clone()),
        ProximityClassifier::new(config.threshold_km).expect("Threshold validated by config"),
    );

    if config.refresh_ahead {
        tokio::spawn(services::refresher::run_refresher(
            aggregator.clone(),
            clock,
        ));
    }

    // CORS — read-only API, restrict methods to GET; expose X-Data-Stale
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(
            routes::trajectories::STALE_HEADER,
        )]);

    let app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/trajectories",
            get(routes::trajectories::list_trajectories),
        )
        .route(
            "/api/v1/trajectories/:id",
            get(routes::trajectories::get_trajectory),
        )
        .route("/api/v1/hazards", get(routes::hazards::list_hazards))
        .with_state(aggregator)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
