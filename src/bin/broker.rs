use accord::{
    auth::RequestAuthenticator,
    broker::{BrokerConfig, HttpNotifier, SessionBroker},
    config::AppConfig,
    database::{Database, SqliteAgentRepository, SqliteTransactionRepository},
    error::AccordError,
    identity::{HEADER_AGENT_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP},
    intent::KeywordInterpreter,
    model::{CommitRequest, CreateSessionRequest, Offer},
    repository::MemorySessionRepository,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "broker")]
#[command(about = "Neutral broker for agent commerce negotiation sessions")]
struct Args {
    #[arg(short, long, default_value = "sqlite://accord.db")]
    database_url: String,

    #[arg(short, long, default_value = "8400")]
    port: u16,

    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let config = AppConfig::load_with_env_overrides(path)?;
            config.validate()?;
            config
        }
        None => AppConfig::default(),
    };

    let database = Database::connect(
        &args.database_url,
        config.database.max_connections.unwrap_or(10),
    )
    .await?;
    let agents = Arc::new(SqliteAgentRepository::new(database.clone()));
    let transactions = Arc::new(SqliteTransactionRepository::new(database));

    let broker = Arc::new(SessionBroker::new(
        agents.clone(),
        Arc::new(MemorySessionRepository::new()),
        transactions,
        Arc::new(KeywordInterpreter::new()),
        Arc::new(HttpNotifier::new()),
        BrokerConfig {
            collection_window: config.collection_window(),
        },
    ));
    let authenticator = Arc::new(RequestAuthenticator::with_replay_window(
        agents,
        config.auth.replay_window_secs,
    ));

    let app_state = AppState {
        broker,
        authenticator,
    };

    let app = Router::new()
        .route("/register", post(register_agent))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/offers", get(get_offers).post(submit_offer))
        .route("/sessions/:session_id/commit", post(commit_session))
        .route("/sessions/:session_id/cancel", post(cancel_session))
        .route("/health", get(health_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    tracing::info!(port = args.port, "broker listening");

    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    broker: Arc<SessionBroker>,
    authenticator: Arc<RequestAuthenticator>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_response(e: AccordError) -> ApiError {
    let status = match &e {
        AccordError::Auth(reason) if reason.is_forbidden() => StatusCode::FORBIDDEN,
        AccordError::Auth(_) => StatusCode::UNAUTHORIZED,
        AccordError::AgentNotFound(_)
        | AccordError::SessionNotFound(_)
        | AccordError::OfferNotFound(_) => StatusCode::NOT_FOUND,
        AccordError::Session(_) => StatusCode::CONFLICT,
        AccordError::MandateChain(_) | AccordError::Validation(_) | AccordError::Constraint(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {}", e);
    }
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "message": e.to_string()
        })),
    )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verifies the header triple against the exact raw body bytes before any
/// JSON parsing happens.
async fn authenticate(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<accord::AgentRecord, ApiError> {
    state
        .authenticator
        .authenticate(
            method.as_str(),
            uri.path(),
            header(headers, HEADER_AGENT_ID),
            header(headers, HEADER_SIGNATURE),
            header(headers, HEADER_TIMESTAMP),
            body,
            Utc::now(),
        )
        .await
        .map_err(error_response)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "status": "error",
                "message": format!("invalid request body: {}", e)
            })),
        )
    })
}

async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let signature = header(&headers, HEADER_SIGNATURE).ok_or_else(|| {
        error_response(AccordError::Auth(
            accord::error::AuthReason::IncompleteCredentials,
        ))
    })?;
    let record = state
        .authenticator
        .register(&body, signature, Utc::now())
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "success",
            "agent_id": record.agent_id
        })),
    ))
}

async fn create_session(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = authenticate(&state, &method, &uri, &headers, &body).await?;
    let mut request: CreateSessionRequest = parse_body(&body)?;
    // The authenticated identity wins over whatever the body claims.
    request.agent_id = caller.agent_id;

    let descriptor = state
        .broker
        .open_session(request)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(descriptor))))
}

async fn get_session(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path(session_id): Path<uuid::Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &method, &uri, &headers, &[]).await?;
    let descriptor = state
        .broker
        .describe_session(session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!(descriptor)))
}

async fn get_offers(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path(session_id): Path<uuid::Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authenticate(&state, &method, &uri, &headers, &[]).await?;
    let offers = state
        .broker
        .session_offers(session_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!(offers)))
}

async fn submit_offer(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path(session_id): Path<uuid::Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let caller = authenticate(&state, &method, &uri, &headers, &body).await?;
    let offer: Offer = parse_body(&body)?;
    let descriptor = state
        .broker
        .submit_offer(session_id, caller.agent_id, offer)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!(descriptor))))
}

async fn commit_session(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path(session_id): Path<uuid::Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &method, &uri, &headers, &body).await?;
    let request: CommitRequest = parse_body(&body)?;
    let transaction = state
        .broker
        .commit_session(session_id, caller.agent_id, request)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!(transaction)))
}

async fn cancel_session(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path(session_id): Path<uuid::Uuid>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate(&state, &method, &uri, &headers, &[]).await?;
    state
        .broker
        .cancel_session(session_id, caller.agent_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({"status": "cancelled"})))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}
