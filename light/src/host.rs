use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use onair_common::{
    config::ConfigView, feed::MAX_FEED_BODY_BYTES, feed_url, parse_snapshot, ConfigUpdate,
    FeedError, FetchOutcome, LightEngine, Millis, PollTimer, RuntimeConfig, ScheduleEvent,
    Snapshot,
};

const TICK_INTERVAL_MS: u64 = 100;
const FETCH_TIMEOUT_SECS: u64 = 10;
// Matches the 10-bit PWM range used on the device.
const MAX_DUTY: u32 = 1023;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<LightEngine>>,
    runtime: Arc<Mutex<RuntimeConfig>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    config: ConfigView,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    if runtime.feed.is_configured() {
        info!("feed configured from {}", runtime.feed.base_url);
    } else {
        warn!("feed path not configured; set ONAIR_FEED_PATH or PUT /api/config");
    }

    let engine = LightEngine::new(runtime.brightness, PollTimer::default());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
        .build()
        .context("failed to build feed HTTP client")?;

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        runtime: Arc::new(Mutex::new(runtime)),
        store,
    };

    spawn_control_loop(app_state.clone(), client);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/refresh", post(handle_refresh))
        .with_state(app_state);

    let port = std::env::var("ONAIR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("onair light listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(base_url) = std::env::var("ONAIR_FEED_BASE_URL") {
        runtime.feed.base_url = base_url;
    }
    if let Ok(feed_path) = std::env::var("ONAIR_FEED_PATH") {
        runtime.feed.feed_path = feed_path;
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

// Fetch, advance and render all run in this one task, so a snapshot is never
// applied in the middle of an advance.
fn spawn_control_loop(app_state: AppState, client: reqwest::Client) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let poll_due = app_state
                .engine
                .lock()
                .await
                .poll_due(monotonic_ms(), true);
            if poll_due {
                update_feed(&app_state, &client).await;
            }

            let now = monotonic_ms();
            let (events, active, duties) = {
                let mut engine = app_state.engine.lock().await;
                let events = engine.tick(now);
                (events, engine.active_category(), engine.render(MAX_DUTY))
            };

            log_schedule_events(&events);
            if let Some(duties) = duties {
                info!("LED output -> {} {:?}", active.as_str(), duties);
            }
        }
    });
}

async fn update_feed(app_state: &AppState, client: &reqwest::Client) {
    let url = {
        let runtime = app_state.runtime.lock().await;
        if !runtime.feed.is_configured() {
            debug!("feed path not configured; skipping poll");
            return;
        }
        feed_url(&runtime.feed.base_url, &runtime.feed.feed_path)
    };

    debug!("updating feed from {url}");
    let result = fetch_feed(client, &url).await;
    let now = monotonic_ms();

    if let Err(err) = &result {
        warn!("feed update failed, keeping previous schedule: {err}");
    }

    let outcome = app_state.engine.lock().await.apply_fetch(result, now);
    if let FetchOutcome::Applied { current, next } = outcome {
        info!(
            "feed updated: current={} next={}",
            current.as_str(),
            next.as_str()
        );
    }
}

async fn fetch_feed(client: &reqwest::Client, url: &str) -> Result<Snapshot, FeedError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| FeedError::Transport(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status.as_u16()));
    }

    if response
        .content_length()
        .is_some_and(|len| len > MAX_FEED_BODY_BYTES as u64)
    {
        return Err(FeedError::BodyTooLarge);
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| FeedError::Transport(err.to_string()))?;
    parse_snapshot(&body)
}

fn log_schedule_events(events: &[ScheduleEvent]) {
    for event in events {
        match event {
            ScheduleEvent::CurrentExpired(category) => {
                info!("current {} event ended", category.as_str())
            }
            ScheduleEvent::NextPromoted(category) => {
                info!("next {} event started", category.as_str())
            }
            ScheduleEvent::NextDiscarded(category) => {
                info!("next {} event elapsed before it was seen", category.as_str())
            }
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.lock().await.status(monotonic_ms());
    Json(status)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let view = state.runtime.lock().await.view();
    Json(view)
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> axum::response::Response {
    let mut runtime = state.runtime.lock().await;
    let mut updated = runtime.clone();

    let outcome = match updated.apply_update(update) {
        Ok(outcome) => outcome,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    if let Err(err) = state.store.save_runtime_config(&updated).await {
        warn!("failed to persist runtime config: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save config");
    }
    *runtime = updated;

    {
        let mut engine = state.engine.lock().await;
        engine.set_brightness(runtime.brightness);
        if outcome.feed_changed {
            engine.request_refresh();
        }
    }

    info!(
        "config saved (restart required: {})",
        outcome.restart_required
    );
    Json(ConfigUpdateResponse {
        restart_required: outcome.restart_required,
        config: runtime.view(),
    })
    .into_response()
}

async fn handle_refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.lock().await.request_refresh();
    Json(serde_json::json!({ "refreshing": true }))
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("ONAIR_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        Self::in_dir(PathBuf::from(data_dir))
    }

    fn in_dir(base: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(base.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> Millis {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = START.get_or_init(Instant::now).elapsed().as_millis();
    Millis::from_counter(elapsed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("onair-light-{name}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn store_defaults_when_nothing_saved() {
        let store = AppStore::in_dir(scratch_dir("empty"));
        let runtime = store.load_runtime_config().await.unwrap();
        assert_eq!(runtime, RuntimeConfig::default());
    }

    #[tokio::test]
    async fn store_round_trips_saved_config() {
        let dir = scratch_dir("saved").join("nested");
        let store = AppStore::in_dir(dir.clone());

        let mut runtime = RuntimeConfig::default();
        runtime.feed.feed_path = "team calendar".to_string();
        runtime.brightness.meeting = 40;
        store.save_runtime_config(&runtime).await.unwrap();

        let loaded = store.load_runtime_config().await.unwrap();
        assert_eq!(loaded, runtime);

        tokio::fs::remove_dir_all(dir.parent().unwrap()).await.unwrap();
    }
}
