//! HTTP control surface of the sidecar.
//!
//! ## Endpoints
//!
//! - `GET /backups` - list all backups, optionally filtered by `?status=`
//! - `GET /backups/{label}` - details of one backup; `latest` is accepted
//!   as a label, as is the label pgBackRest reported for the backup
//! - `GET /backups/backup/{label}` - same as above, the form used in
//!   `Location` headers
//! - `POST /backups` - request a backup
//!
//! There is no authentication; the API is meant to be reachable only from
//! inside the pod.

mod backups;
mod error;

use axum::{
    Router,
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::core::BackupSlot;

pub use backups::location;
pub use error::ApiError;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: AppContext,
    pub slot: BackupSlot,
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/backups", get(backups::list).post(backups::create))
        .route("/backups/", get(backups::list).post(backups::create))
        .route("/backups/backup/{label}", get(backups::show))
        .route("/backups/{label}", get(backups::show))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "HTTP request"
    );
    response
}

/// HTTP server for the backup API.
pub struct WebServer {
    listener: TcpListener,
    state: ApiState,
}

impl WebServer {
    /// Bind the listener. Done separately from serving so that a port
    /// conflict is reported before any background work starts.
    pub async fn bind(state: ApiState, bind_addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled, then stop accepting connections
    /// and let in-flight requests complete.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "Backup API listening");

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::warn!("Backup API stopped");
        Ok(())
    }
}
