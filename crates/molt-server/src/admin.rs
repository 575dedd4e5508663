//! Admin HTTP front-end.
//!
//! A thin call-through onto the supervisor, served by axum on a dedicated
//! thread with its own current-thread tokio runtime. Every endpoint is a GET
//! with query parameters and answers `OK.` or `ERROR.` followed by a reason,
//! except `/server-status` which returns JSON.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use molt::{AuxiliaryServer, BindAddress, Listener, PoolStatus, Supervisor, SupervisorError};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

const INDEX: &str = "\
/server-cycle?skew=<secs>&workers=<n>&force=<0|1>
/server-prune-worker
/server-resume-spawning
/server-suspend-spawning
/server-set-max-rss?max_rss=<KiB>
/server-set-max-total-mem?max_total_mem=<KiB>
/server-profile-memory?enable=<0|1>&min_delta=<KiB>
/server-status
";

#[derive(Clone)]
struct AdminState {
    supervisor: Supervisor,
}

/// Plain-text outcome of an admin call.
#[derive(Debug)]
enum Reply {
    Ok,
    Error(StatusCode, String),
}

impl From<Result<(), SupervisorError>> for Reply {
    fn from(result: Result<(), SupervisorError>) -> Self {
        match result {
            Ok(()) => Reply::Ok,
            Err(SupervisorError::ShuttingDown) => {
                Reply::Error(StatusCode::SERVICE_UNAVAILABLE, SupervisorError::ShuttingDown.to_string())
            }
            Err(e) => Reply::Error(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }
}

impl From<QueryRejection> for Reply {
    fn from(rejection: QueryRejection) -> Self {
        Reply::Error(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Ok => (StatusCode::OK, "OK.\n").into_response(),
            Reply::Error(status, message) => {
                warn!(%status, reason = %message, "admin request refused");
                (status, format!("ERROR.\n{message}\n")).into_response()
            }
        }
    }
}

/// Run a supervisor call that may sleep (cycle skew) off the async thread.
async fn blocking<F>(call: F) -> Reply
where
    F: FnOnce() -> Result<(), SupervisorError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.into(),
        Err(e) => Reply::Error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/server-cycle", get(server_cycle))
        .route("/server-prune-worker", get(prune_worker))
        .route("/server-resume-spawning", get(resume_spawning))
        .route("/server-suspend-spawning", get(suspend_spawning))
        .route("/server-set-max-rss", get(set_max_rss))
        .route("/server-set-max-total-mem", get(set_max_total_mem))
        .route("/server-profile-memory", get(profile_memory))
        .route("/server-status", get(status))
        .with_state(AdminState { supervisor })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn index() -> &'static str {
    INDEX
}

#[derive(Debug, Deserialize)]
struct CycleParams {
    #[serde(default)]
    skew: u64,
    workers: Option<usize>,
    #[serde(default)]
    force: u8,
}

async fn server_cycle(
    State(state): State<AdminState>,
    params: Result<Query<CycleParams>, QueryRejection>,
) -> Reply {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return rejection.into(),
    };
    let supervisor = state.supervisor;
    blocking(move || {
        supervisor.handle_cycle(Duration::from_secs(params.skew), params.workers, params.force != 0)
    })
    .await
}

async fn prune_worker(State(state): State<AdminState>) -> Reply {
    state.supervisor.handle_prune_worker().map(|_| ()).into()
}

async fn resume_spawning(State(state): State<AdminState>) -> Reply {
    state.supervisor.set_allow_spawning(true).into()
}

async fn suspend_spawning(State(state): State<AdminState>) -> Reply {
    state.supervisor.set_allow_spawning(false).into()
}

#[derive(Debug, Deserialize)]
struct MaxRssParams {
    max_rss: u64,
}

async fn set_max_rss(
    State(state): State<AdminState>,
    params: Result<Query<MaxRssParams>, QueryRejection>,
) -> Reply {
    match params {
        Ok(Query(params)) => state.supervisor.set_max_rss(params.max_rss).into(),
        Err(rejection) => rejection.into(),
    }
}

#[derive(Debug, Deserialize)]
struct MaxTotalMemParams {
    max_total_mem: u64,
}

async fn set_max_total_mem(
    State(state): State<AdminState>,
    params: Result<Query<MaxTotalMemParams>, QueryRejection>,
) -> Reply {
    match params {
        Ok(Query(params)) => state.supervisor.set_max_total_mem(params.max_total_mem).into(),
        Err(rejection) => rejection.into(),
    }
}

#[derive(Debug, Deserialize)]
struct ProfileMemoryParams {
    #[serde(default)]
    enable: u8,
    #[serde(default)]
    min_delta: u64,
}

/// Workers only pick the flag up when forked, so this cycles the pool.
async fn profile_memory(
    State(state): State<AdminState>,
    params: Result<Query<ProfileMemoryParams>, QueryRejection>,
) -> Reply {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return rejection.into(),
    };
    let supervisor = state.supervisor;
    blocking(move || {
        supervisor.set_profile_memory(params.enable != 0, params.min_delta)?;
        supervisor.handle_cycle(Duration::ZERO, None, false)
    })
    .await
}

async fn status(State(state): State<AdminState>) -> Json<PoolStatus> {
    Json(state.supervisor.status())
}

/// The admin front-end as a coordinator-managed server.
pub struct AdminServer {
    address: BindAddress,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl AdminServer {
    pub fn new(address: BindAddress) -> Self {
        Self {
            address,
            cancel: CancellationToken::new(),
            thread: None,
        }
    }
}

impl AuxiliaryServer for AdminServer {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn address(&self) -> &BindAddress {
        &self.address
    }

    fn start(&mut self, listener: Listener, supervisor: Supervisor) -> io::Result<()> {
        let Listener::Tcp(listener) = listener else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "admin front-end needs a host:port address",
            ));
        };
        listener.set_nonblocking(true)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let cancel = self.cancel.clone();
        let app = router(supervisor);
        let address = self.address.clone();

        let handle = thread::Builder::new()
            .name("admin".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!(address = %address, error = %e, "cannot register admin listener");
                            return;
                        }
                    };
                    info!("Starting admin front-end on {}", address);
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(cancel.cancelled_owned())
                        .await
                    {
                        error!(error = %e, "admin front-end failed");
                    }
                    info!("Admin front-end stopped");
                });
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        let Some(handle) = self.thread.take() else {
            return;
        };
        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("admin front-end did not stop in time");
        }
    }
}
