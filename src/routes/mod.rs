use std::convert::Infallible;
use std::net::SocketAddr;

use axum::http::{header::USER_AGENT, request::Parts, HeaderMap, HeaderValue};
use axum::{
    async_trait,
    extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts},
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{state::AppState, store::Database};

pub mod auth;
pub mod documents;
pub mod health;
pub mod users;

pub fn create_router<D: Database>(state: AppState<D>) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_deref());

    let auth_routes = Router::new()
        .route("/login", post(auth::login::<D>))
        .route("/refresh", post(auth::refresh::<D>))
        .route("/logout", post(auth::logout::<D>))
        .route("/me", get(auth::me::<D>));

    let users_routes = Router::new()
        .route("/", get(users::list_users::<D>))
        .route(
            "/:id",
            get(users::get_user::<D>)
                .put(users::update_user::<D>)
                .delete(users::delete_user::<D>),
        )
        .route("/:id/password", put(users::update_password::<D>));

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents::<D>).post(documents::upload_document::<D>),
        )
        .route("/public/:token", get(documents::get_document_by_token::<D>))
        .route(
            "/:id",
            get(documents::get_document::<D>).delete(documents::delete_document::<D>),
        )
        .route("/:id/share", post(documents::share_document::<D>))
        .route("/:id/unshare", post(documents::unshare_document::<D>));

    let public_routes = Router::new()
        .route("/docs/:id", get(documents::get_public_document::<D>))
        .route(
            "/docs/token/:token",
            get(documents::get_public_document_by_token::<D>),
        );

    Router::new()
        .nest("/api/auth", auth_routes)
        .route("/api/register", post(users::register::<D>))
        .nest("/api/users", users_routes)
        .nest("/api/docs", documents_routes)
        .nest("/public", public_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024 * 512))
}

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let allow_origin = match origins {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = %value, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// User agent and best-effort client address of the caller.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub user_agent: String,
    pub ip_address: String,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_agent = header_str(&parts.headers, USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string();
        let socket = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Ok(Self {
            user_agent,
            ip_address: client_ip(&parts.headers, socket),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket address.
fn client_ip(headers: &HeaderMap, socket: Option<String>) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or(socket)
        .unwrap_or_else(|| "unknown".to_string())
}
