//! HTTP operator surface.
//!
//! Thin handlers over [`Queue`]: every route is one engine call. Errors are
//! returned as a JSON string with a status derived from the error kind.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::model::{JobId, JobRecord, JobResult};
use crate::queue::Queue;
use crate::store::Store;

const DEFAULT_COUNT: usize = 10;
const DEFAULT_CREATE_COUNT: usize = 2;
/// Upper bound on `count` for every route that takes one.
pub const MAX_COUNT: usize = 10_000;

#[derive(Debug, Deserialize)]
struct CountParams {
    count: Option<usize>,
}

impl CountParams {
    fn count_or(&self, default: usize) -> Result<usize> {
        match self.count {
            Some(count) if count > MAX_COUNT => Err(Error::InvalidArgument(format!(
                "count {count} exceeds the maximum of {MAX_COUNT}"
            ))),
            Some(count) => Ok(count),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequeueResponse {
    new_id: JobId,
}

/// Error wrapper mapping engine errors onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidJobId(_) | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) | Error::SourceRecordMissing(_) | Error::UnknownPendingEntry(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(self.0.to_string())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router<S: Store>(queue: Queue<S>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/debug/create", post(create_dummy_jobs::<S>))
        .route("/jobs/completed", get(completed::<S>))
        .route("/jobs/aborted", get(aborted::<S>))
        .route("/jobs/pending", get(pending::<S>))
        .route("/jobs/reenqueue/{id}", post(requeue::<S>))
        .route("/jobs/{id}", get(job::<S>))
        .with_state(queue)
}

/// Serve the operator API on `listener` until `cancel` fires.
pub async fn serve<S: Store>(
    listener: TcpListener,
    queue: Queue<S>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router(queue))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("http server stopped");
    Ok(())
}

async fn hello() -> &'static str {
    "Hello, World!"
}

async fn create_dummy_jobs<S: Store>(
    State(queue): State<Queue<S>>,
    Query(params): Query<CountParams>,
) -> ApiResult<Json<&'static str>> {
    let ids = queue
        .create_dummy_jobs(params.count_or(DEFAULT_CREATE_COUNT)?)
        .await?;
    info!(count = ids.len(), "dummy jobs created");
    Ok(Json("OK"))
}

async fn completed<S: Store>(
    State(queue): State<Queue<S>>,
    Query(params): Query<CountParams>,
) -> ApiResult<Json<Vec<JobResult>>> {
    let results = queue.completed(params.count_or(DEFAULT_COUNT)?).await?;
    Ok(Json(results))
}

async fn aborted<S: Store>(
    State(queue): State<Queue<S>>,
    Query(params): Query<CountParams>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    let records = queue.list_aborted(params.count_or(DEFAULT_COUNT)?).await?;
    Ok(Json(records))
}

async fn pending<S: Store>(
    State(queue): State<Queue<S>>,
    Query(params): Query<CountParams>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    let records = queue.list_idle(params.count_or(DEFAULT_COUNT)?).await?;
    Ok(Json(records))
}

async fn requeue<S: Store>(
    State(queue): State<Queue<S>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequeueResponse>> {
    let id: JobId = id.parse()?;
    let result = queue.requeue(id).await?;
    Ok(Json(RequeueResponse {
        new_id: result.new_id(),
    }))
}

async fn job<S: Store>(
    State(queue): State<Queue<S>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    let id: JobId = id.parse()?;
    match queue.get(id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(Error::NotFound(format!("job {id}")).into()),
    }
}
