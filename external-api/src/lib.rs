//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, diagnostics, and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /coordination
//! /config
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::net::SocketAddr;

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{error, info, trace};
use zk_coordination::Coordinator;

pub use crate::models::{CoordinationStatus, Health, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    coordinator: Coordinator,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, coordinator: Coordinator) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            coordinator,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(addr: SocketAddr, state: State, coordinator: Coordinator) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        // Provides:
        // /health
        // /ping
        // /metrics
        // /metrics-text
        // /coordination
        // /config
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/coordination", routing::get(handlers::coordination))
            .route("/config", routing::get(handlers::config))
            .layer(TraceLayer::new_for_http())
            .layer(Extension(state))
            .layer(Extension(coordinator));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let coordinator = self.coordinator.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, coordinator),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {
    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;
    use zk_coordination::{
        Coordinator,
        metrics::{START_TIME, UPTIME},
        party::member_name,
    };

    use crate::models::{CacheStatus, CoordinationStatus, Health, PartyStatus, ServerResult, State};

    /// healthy only while both the process reports good health and the
    /// coordination session is usable
    pub(crate) async fn ok(
        Extension(state): Extension<State>,
        Extension(coordinator): Extension<Coordinator>,
    ) -> ServerResult<impl IntoResponse> {
        let health = *state.lock();
        Ok(match health {
            Health::Good if coordinator.is_connected() => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn coordination(
        Extension(coordinator): Extension<Coordinator>,
    ) -> ServerResult<impl IntoResponse> {
        let mut parties = Vec::new();
        for party in coordinator.parties() {
            // membership can't be listed without a session
            let mut members = party
                .list()
                .await
                .map(|m| m.iter().map(|id| member_name(id).to_owned()).collect::<Vec<_>>())
                .unwrap_or_default();
            members.sort();
            parties.push(PartyStatus {
                path: party.path().to_owned(),
                members,
            });
        }
        let caches = coordinator
            .shared_caches()
            .iter()
            .map(|cache| CacheStatus {
                path: cache.path().to_owned(),
                synced: cache.is_synced(),
            })
            .collect();
        let config = coordinator.config();

        Ok(Json(CoordinationStatus {
            service_id: coordinator.service_id().to_owned(),
            prefix: coordinator.namespace().prefix().to_owned(),
            hosts: config.hosts.clone(),
            session_state: coordinator.session_state().to_string(),
            session_id: coordinator.session().session_id(),
            connected: coordinator.is_connected(),
            lock_held: coordinator.have_lock(),
            caches,
            parties,
        }))
    }

    pub(crate) async fn config(
        Extension(coordinator): Extension<Coordinator>,
    ) -> ServerResult<impl IntoResponse> {
        // the validated config isn't serializable, so serve what was read from disk
        let path = coordinator
            .config()
            .path()
            .context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(serde_json::to_string_pretty(&config::parse_wire(cfg)?)?)
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Snapshot of the coordinator served on `/coordination`
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct CoordinationStatus {
        /// this instance's id
        pub service_id: String,
        /// namespace prefix all relative paths resolve under
        pub prefix: String,
        /// coordination service members
        pub hosts: Vec<String>,
        /// raw session state reported by the client
        pub session_state: String,
        /// current session, if any
        pub session_id: Option<u64>,
        /// whether the session is established and set up
        pub connected: bool,
        /// whether this instance holds the lock
        pub lock_held: bool,
        /// registered shared caches
        pub caches: Vec<CacheStatus>,
        /// parties set up by this instance
        pub parties: Vec<PartyStatus>,
    }

    /// Sync state of one shared cache
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct CacheStatus {
        /// cache path relative to the prefix
        pub path: String,
        /// whether the cache worker has caught up
        pub synced: bool,
    }

    /// Membership of one party
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct PartyStatus {
        /// absolute party path
        pub path: String,
        /// sorted member ids, empty while disconnected
        pub members: Vec<String>,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
