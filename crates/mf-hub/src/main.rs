use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use mf_core::store::Connector;
use mf_core::QueryOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod connectors;

use config::Config;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "mf-hub",
    version,
    about = "MONGOFRAME Query Hub: MongoDB aggregations as data frames"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3100")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "mf-hub.toml")]
    config: PathBuf,
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    pub connector: Arc<dyn Connector>,
    pub connector_name: &'static str,
    pub options: QueryOptions,
    pub start_time: Instant,
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/ds/query", post(api::query))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mf_hub=info,mf_core=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config);
    let options = config.query_options();
    let (connector, connector_name) = connectors::default_connector();

    let state = Arc::new(AppState {
        connector,
        connector_name,
        options: options.clone(),
        start_time: Instant::now(),
    });

    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| format!("Invalid bind address {:?}: {}", args.bind, e))?;
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  MONGOFRAME Query Hub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Query:      http://{}/api/ds/query", addr);
    tracing::info!("  Health:     http://{}/api/health", addr);
    tracing::info!("  Connector:  {}", connector_name);
    tracing::info!(
        "  Limits:     {} parallel queries, timeout {:?}",
        options.max_parallel_queries,
        options.query_timeout
    );
    if options.default_settings.is_some() {
        tracing::info!("  Datasource: default from {:?}", args.config);
    }
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use mf_core::store::memory::{MemoryConnector, MemoryItem};
    use mf_core::DataSourceSettings;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(connector: MemoryConnector) -> Router {
        let mut settings = DataSourceSettings::default();
        settings.json_data.url = "mongodb://localhost:27017".into();
        app(Arc::new(AppState {
            connector: Arc::new(connector),
            connector_name: "memory",
            options: QueryOptions {
                default_settings: Some(settings),
                ..QueryOptions::default()
            },
            start_time: Instant::now(),
        }))
    }

    async fn post_query(app: Router, body: String) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::post("/api/ds/query")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_query_endpoint() {
        let connector = MemoryConnector::from_docs([bson::doc! { "n": 1_i64 }]);
        let body = json!({
            "queries": [
                {
                    "refId": "A",
                    "timeRange": {"from": 0, "to": 1000},
                    "database": "db",
                    "collection": "c",
                    "aggregation": "[]",
                    "valueFields": ["n"],
                    "valueFieldTypes": ["int64"]
                },
                {"refId": "B", "timeRange": {"from": 0, "to": 1000}, "queryType": "Graph"}
            ]
        });
        let (status, bytes) = post_query(test_app(connector), body.to_string()).await;
        assert_eq!(status, StatusCode::OK);

        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value["results"]["A"]["frames"][0]["fields"][0],
            json!({"name": "n", "type": "int64", "labels": {}, "values": [1]})
        );
        assert!(value["results"]["B"]["error"]
            .as_str()
            .unwrap()
            .starts_with("Query type must be one of"));
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_the_store() {
        let connector = MemoryConnector::new(vec![
            MemoryItem::Doc(bson::doc! { "n": 1_i64 }),
            MemoryItem::Stall,
        ]);
        let state = connector.state();
        let body = json!({
            "queries": [{
                "refId": "A",
                "timeRange": {"from": 0, "to": 1000},
                "database": "db",
                "collection": "c",
                "aggregation": "[]",
                "valueFields": ["n"],
                "valueFieldTypes": ["int64"]
            }]
        });
        let request = post_query(test_app(connector), body.to_string());
        let gone = tokio::time::timeout(Duration::from_millis(100), request).await;
        assert!(gone.is_err());

        for _ in 0..200 {
            if state.closes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!((state.connects(), state.closes()), (1, 1));
    }

    #[tokio::test]
    async fn test_bad_envelope_is_rejected() {
        let (status, bytes) =
            post_query(test_app(MemoryConnector::default()), "{\"queries\": 3}".into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&bytes).starts_with("Invalid query request"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app(MemoryConnector::default())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["connector"], "memory");
    }
}
