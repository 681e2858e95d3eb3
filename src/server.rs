use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Method, Request, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use tera::{Context, Tera};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::context::NetContext;
use crate::error::NetError;
use crate::hotspot::{Band, HotspotListing, HotspotManager, Ownership, SecurityType};
use crate::status::{Classification, Readiness};

lazy_static! {
    pub static ref TEMPLATES: Tera = {
        let mut tera = Tera::default();
        if let Err(e) = tera.add_raw_template("index.html", include_str!("../templates/index.html")) {
            error!("Template parsing error: {}", e);
        }
        tera.autoescape_on(vec![".html"]);
        tera
    };
}

/// Header every state-changing request must carry. Cross-origin pages can
/// only set it after a preflight, and the CORS layer allows GET alone.
pub const REQUEST_HEADER: &str = "x-netpilot-request";

pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

pub struct AppState {
    ctx: NetContext,
    hotspots: Mutex<HotspotManager>,
}

impl AppState {
    pub fn new(ctx: NetContext) -> crate::Result<Self> {
        let hotspots = ctx.hotspots()?;
        Ok(Self {
            ctx,
            hotspots: Mutex::new(hotspots),
        })
    }
}

/// A hotspot as shown over HTTP. Never carries the password.
#[derive(Debug, Serialize)]
pub struct HotspotView {
    pub name: String,
    pub ssid: String,
    pub security: SecurityType,
    pub wifi_interface: String,
    pub gateway: Option<Ipv4Addr>,
    pub band: Band,
    pub channel: u8,
    pub ownership: Ownership,
}

impl From<HotspotListing> for HotspotView {
    fn from(listing: HotspotListing) -> Self {
        let config = listing.config;
        Self {
            name: config.name,
            ssid: config.ssid,
            security: config.security,
            wifi_interface: config.wifi_interface,
            gateway: config.gateway,
            band: config.band,
            channel: config.channel,
            ownership: listing.ownership,
        }
    }
}

struct ApiError(StatusCode, String);

impl From<NetError> for ApiError {
    fn from(err: NetError) -> Self {
        let status = match &err {
            NetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            NetError::HotspotNotFound(_) => StatusCode::NOT_FOUND,
            NetError::HotspotExists(_) => StatusCode::CONFLICT,
            NetError::ControlPlaneUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            NetError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

/// Runs `f` on the blocking pool; every backend call shells out.
async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppState) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(ApiError::from)
}

fn with_hotspots<T>(state: &AppState, f: impl FnOnce(&mut HotspotManager) -> T) -> T {
    let mut hotspots = state.hotspots.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut hotspots)
}

async fn require_request_header(req: Request<Body>, next: Next) -> Response {
    if req.headers().contains_key(REQUEST_HEADER) {
        return next.run(req).await;
    }
    ApiError(
        StatusCode::FORBIDDEN,
        format!("missing {} header", REQUEST_HEADER),
    )
    .into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    let actions = Router::new()
        .route("/api/hotspots/:name/start", post(hotspot_start_handler))
        .route("/api/hotspots/:name/stop", post(hotspot_stop_handler))
        .route_layer(middleware::from_fn(require_request_header));

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/networks", get(networks_handler))
        .route("/api/hotspots", get(hotspots_handler))
        .route("/api/hotspots/:name", get(hotspot_status_handler))
        .route("/api/diagnostics", get(diagnostics_handler))
        .merge(actions)
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(ctx: NetContext, config: ServerConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(ctx)?);
    let app = router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    println!("Starting server at http://{}", addr);
    info!(%addr, "dashboard listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = blocking(&state, |state| {
        let classification = state.ctx.detector().classify(Readiness::Associated);
        let hotspots: Vec<HotspotView> = with_hotspots(state, |h| h.list())?
            .into_iter()
            .map(HotspotView::from)
            .collect();
        Ok((classification, hotspots))
    })
    .await;

    let (classification, hotspots) = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e) => return e.into_response(),
    };

    let mut context = Context::new();
    let (state_label, ssid, ip) = match &classification {
        Classification::Connected { ssid, ip } => ("connected", ssid.clone(), ip.clone()),
        Classification::NotConnected => ("not connected", String::new(), None),
        Classification::Indeterminate => ("indeterminate", String::new(), None),
    };
    context.insert("state", state_label);
    context.insert("ssid", &ssid);
    context.insert("ip", &ip);
    context.insert("hotspots", &hotspots);
    context.insert("pending", &state.ctx.queue().len());

    match TEMPLATES.render("index.html", &context) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Template render error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Template error").into_response()
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let (classification, status) = blocking(&state, |state| {
        let classification = state.ctx.detector().classify(Readiness::Associated);
        let status = state.ctx.backend().query_connection_status()?;
        Ok((classification, status))
    })
    .await?;
    Ok(Json(json!({ "classification": classification, "connection": status })))
}

async fn networks_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let networks = blocking(&state, |state| state.ctx.backend().scan_networks()).await?;
    let body: Vec<_> = networks
        .iter()
        .map(|n| {
            json!({
                "ssid": n.identity.ssid,
                "security": n.identity.security,
                "signal": n.signal,
                "in_use": n.in_use,
            })
        })
        .collect();
    Ok(Json(body))
}

async fn hotspots_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let listings = blocking(&state, |state| with_hotspots(state, |h| h.list())).await?;
    let views: Vec<HotspotView> = listings.into_iter().map(HotspotView::from).collect();
    Ok(Json(views))
}

async fn hotspot_status_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = blocking(&state, move |state| with_hotspots(state, |h| h.status(&name))).await?;
    Ok(Json(status))
}

async fn hotspot_start_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = blocking(&state, move |state| with_hotspots(state, |h| h.start(&name))).await?;
    Ok(Json(status))
}

async fn hotspot_stop_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(&state, move |state| with_hotspots(state, |h| h.stop(&name))).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn diagnostics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ctx.queue().drain())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, NmcliBackend};
    use crate::config::Config;
    use crate::exec::fake::FakeRunner;
    use crate::hotspot::HotspotConfig;

    async fn spawn_app(dir: &std::path::Path) -> (String, Arc<AppState>) {
        let fake = Arc::new(FakeRunner::new());
        let backend: Arc<dyn Backend> = Arc::new(NmcliBackend::new(fake.clone()));
        let config = Config {
            hotspot_dir: Some(dir.to_path_buf()),
            settle_ms: 0,
            ..Config::default()
        };
        let ctx = NetContext::with_backend(fake, backend, &config).unwrap();
        let state = Arc::new(AppState::new(ctx).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    async fn get(url: String) -> (u16, String) {
        tokio::task::spawn_blocking(move || match ureq::get(&url).call() {
            Ok(response) => (response.status(), response.into_string().unwrap()),
            Err(ureq::Error::Status(code, response)) => (code, response.into_string().unwrap()),
            Err(e) => panic!("request failed: {}", e),
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hotspot_api_hides_password() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(dir.path()).await;
        with_hotspots(&state, |h| {
            h.create(HotspotConfig {
                name: "lab".into(),
                ssid: "Lab AP".into(),
                password: "supersecret".into(),
                ..HotspotConfig::default()
            })
        })
        .unwrap();

        let (code, body) = get(format!("{}/api/hotspots", base)).await;
        assert_eq!(code, 200);
        assert!(body.contains("\"name\":\"lab\""));
        assert!(!body.contains("supersecret"));

        let (code, body) = get(format!("{}/api/hotspots/ghost", base)).await;
        assert_eq!(code, 404);
        assert!(body.contains("not found"));
    }

    async fn post(url: String, marked: bool) -> u16 {
        tokio::task::spawn_blocking(move || {
            let mut request = ureq::post(&url);
            if marked {
                request = request.set(REQUEST_HEADER, "1");
            }
            match request.call() {
                Ok(response) => response.status(),
                Err(ureq::Error::Status(code, _)) => code,
                Err(e) => panic!("request failed: {}", e),
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_actions_require_request_header() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(dir.path()).await;

        assert_eq!(post(format!("{}/api/hotspots/ghost/start", base), false).await, 403);
        assert_eq!(post(format!("{}/api/hotspots/ghost/stop", base), false).await, 403);
        assert!(!state.ctx.queue().has_pending());

        assert_eq!(post(format!("{}/api/hotspots/ghost/start", base), true).await, 404);
        assert!(state.ctx.queue().has_pending());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dashboard_and_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(dir.path()).await;
        state.ctx.queue().push_warning("uplink missing");

        let (code, body) = get(format!("{}/", base)).await;
        assert_eq!(code, 200);
        assert!(body.contains("netpilot"));

        let (code, body) = get(format!("{}/api/diagnostics", base)).await;
        assert_eq!(code, 200);
        assert!(body.contains("uplink missing"));
        assert!(!state.ctx.queue().has_pending());
    }
}
