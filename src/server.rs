//! Code to support server mode: upload/progress/download for agent batch
//! jobs, plus the FSBO search endpoints.
//!
//! Progress streaming is server-sent events. The controller tails the
//! job's append-only progress log from wherever the subscriber left off,
//! sleeping ~300ms between polls, and finishes with one terminal event.
//! Multiple subscribers per job are fine because the log only grows.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Multipart, Path as UrlPath, Query};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::ScrapeCache;
use crate::engine::{build_sources, ProgressCallback, Resolver};
use crate::fsbo::pipeline::{FsboAggregator, FsboProgressCallback};
use crate::fsbo::store::FsboStore;
use crate::fsbo::{FsboSearchCriteria, LocationType};
use crate::gateway::SharedHttpClient;
use crate::input::read_input;
use crate::jobs::{new_job_id, now_stamp, Job, JobStatus, JobStore};
use crate::models::Property;
use crate::output::{
    export_results_zip, generate_summary, preview_rows, read_archive_rows,
};

/// How long the SSE tail sleeps between polls of the progress log.
const SSE_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Resolver options fixed at server startup.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub sources: Vec<String>,
    pub google_api_key: String,
    pub google_cse_id: String,
    pub enrich: bool,
    pub max_concurrent: usize,
}

/// Transient, in-memory progress for one FSBO search.
#[derive(Default)]
struct FsboSearchState {
    progress: Vec<Value>,
    status: String,
    error: Option<String>,
}

pub struct AppState {
    pub jobs: JobStore,
    pub cache: ScrapeCache,
    pub fsbo_store: FsboStore,
    pub client: SharedHttpClient,
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    fsbo_states: Mutex<HashMap<String, FsboSearchState>>,
    fsbo_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl AppState {
    pub fn new(
        jobs: JobStore,
        cache: ScrapeCache,
        fsbo_store: FsboStore,
        client: SharedHttpClient,
        data_dir: PathBuf,
        engine: EngineConfig,
    ) -> AppState {
        AppState {
            jobs,
            cache,
            fsbo_store,
            client,
            data_dir,
            engine,
            fsbo_states: Mutex::new(HashMap::new()),
            fsbo_tasks: Mutex::new(HashMap::new()),
        }
    }

    fn fsbo_push_progress(&self, search_id: &str, event: Value) {
        let mut states = self.fsbo_states.lock().unwrap();
        if let Some(state) = states.get_mut(search_id) {
            state.progress.push(event);
        }
    }

    fn fsbo_set_status(&self, search_id: &str, status: &str, error: Option<String>) {
        let mut states = self.fsbo_states.lock().unwrap();
        let state = states.entry(search_id.to_owned()).or_default();
        state.status = status.to_owned();
        state.error = error;
    }

    fn fsbo_snapshot(
        &self,
        search_id: &str,
        from_index: usize,
    ) -> Option<(Vec<Value>, String, Option<String>)> {
        let states = self.fsbo_states.lock().unwrap();
        states.get(search_id).map(|state| {
            let events = if from_index < state.progress.len() {
                state.progress[from_index..].to_vec()
            } else {
                vec![]
            };
            (events, state.status.clone(), state.error.clone())
        })
    }

    fn fsbo_abort_task(&self, search_id: &str) -> bool {
        match self.fsbo_tasks.lock().unwrap().remove(search_id) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }
}

/// An error message to serialize as JSON on error.
#[derive(Serialize)]
struct ErrorResponse {
    /// A human-readable error.
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
}

fn not_found(message: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, message)
}

fn bad_request(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, message)
}

fn internal_error(err: anyhow::Error) -> ApiError {
    error!("internal error: {:?}", err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Run the server. Should not return.
pub async fn run_server(listen_addr: &str, state: Arc<AppState>) -> Result<()> {
    state.cache.initialize().await?;
    state.fsbo_store.initialize().await?;
    tokio::fs::create_dir_all(&state.data_dir).await?;

    let app = Router::new()
        .route("/api/upload", post(handle_upload))
        .route("/api/progress/:job_id", get(handle_progress))
        .route("/api/download/:job_id", get(handle_download))
        .route("/api/jobs", get(handle_list_jobs))
        .route("/api/jobs/:job_id/results", get(handle_job_results))
        .route("/api/jobs/:job_id/cancel", post(handle_cancel))
        .route("/api/jobs/:job_id/resume", post(handle_resume))
        .route("/api/jobs/:job_id", delete(handle_delete_job))
        .route("/api/cache/stats", get(handle_cache_stats))
        .route("/api/fsbo/search", post(handle_fsbo_search))
        .route("/api/fsbo/progress/:search_id", get(handle_fsbo_progress))
        .route("/api/fsbo/results/:search_id", get(handle_fsbo_results))
        .route("/api/fsbo/download/:search_id", get(handle_fsbo_download))
        .route("/api/fsbo/searches", get(handle_fsbo_searches))
        .route("/api/fsbo/searches/:search_id", delete(handle_fsbo_delete))
        .layer(Extension(state));

    let listen_addr = listen_addr.parse().with_context(|| {
        format!("could not parse listen address: {:?}", listen_addr)
    })?;
    info!("listening on {}", listen_addr);

    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
        .context("web server failed to start")
}

// ── Agent batch jobs ──

async fn handle_upload(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    // Take the first field that carries a file.
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("malformed upload: {}", err)))?
    {
        if let Some(filename) = field.file_name().map(|f| f.to_owned()) {
            let bytes = field
                .bytes()
                .await
                .map_err(|err| bad_request(format!("could not read upload: {}", err)))?;
            upload = Some((filename, bytes.to_vec()));
            break;
        }
    }
    let Some((filename, bytes)) = upload else {
        return Err(bad_request("no file in upload"));
    };

    let ext = PathBuf::from(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !matches!(ext.as_str(), "csv" | "xlsx" | "xls") {
        return Err(bad_request(
            "Only .csv, .xlsx, or .xls files are supported.",
        ));
    }

    let job_id = new_job_id();
    let upload_path = state.data_dir.join(format!("{}.{}", job_id, ext));
    tokio::fs::write(&upload_path, &bytes)
        .await
        .map_err(|err| internal_error(err.into()))?;

    let properties = match read_input(&upload_path) {
        Ok(properties) => properties,
        Err(err) => {
            let _ = tokio::fs::remove_file(&upload_path).await;
            return Err(bad_request(err.to_string()));
        }
    };
    if properties.is_empty() {
        let _ = tokio::fs::remove_file(&upload_path).await;
        return Err(bad_request("No valid addresses found in file."));
    }

    let total = properties.len();
    state.jobs.insert(
        &job_id,
        Job::new(upload_path.display().to_string(), total, filename),
    );

    spawn_pipeline(&state, &job_id, properties);

    Ok(Json(json!({ "job_id": job_id, "total": total })))
}

/// Schedule the background resolution task for a queued job.
fn spawn_pipeline(state: &Arc<AppState>, job_id: &str, properties: Vec<Property>) {
    let task_state = state.clone();
    let task_job_id = job_id.to_owned();
    let handle = tokio::spawn(async move {
        run_pipeline(task_state, task_job_id, properties).await;
    });
    state.jobs.register_task(job_id, handle);
}

async fn run_pipeline(state: Arc<AppState>, job_id: String, properties: Vec<Property>) {
    state.jobs.set_status(&job_id, JobStatus::Running);

    let progress: ProgressCallback = {
        let state = state.clone();
        let job_id = job_id.clone();
        Arc::new(move |event| {
            let mut value = serde_json::to_value(&event).unwrap_or_default();
            value["type"] = json!("progress");
            state.jobs.append_progress(&job_id, value);
        })
    };

    let sources = build_sources(
        &state.engine.sources,
        &state.client,
        &state.engine.google_api_key,
        &state.engine.google_cse_id,
    );
    let resolver = Resolver::new(
        sources,
        state.cache.clone(),
        state.client.clone(),
        state.engine.enrich,
        state.engine.max_concurrent,
        Some(progress),
    );

    let outcome = async {
        let results = resolver.run(&properties).await?;

        let upload_path = state
            .jobs
            .get(&job_id)
            .map(|job| PathBuf::from(job.upload_path))
            .context("job vanished mid-run")?;
        let result_path = state.data_dir.join(format!("{}_results.zip", job_id));

        let summary = generate_summary(&results);
        let preview = preview_rows(&results, 20);

        // The export touches disk; keep it off the event loop.
        let export_results = results;
        let export_path = result_path.clone();
        tokio::task::spawn_blocking(move || {
            export_results_zip(&export_results, &upload_path, &export_path)
        })
        .await
        .context("export task panicked")??;

        Ok::<_, anyhow::Error>((result_path, summary, preview))
    }
    .await;

    match outcome {
        Ok((result_path, summary, preview)) => {
            if state.jobs.set_status(&job_id, JobStatus::Complete) {
                state.jobs.update(&job_id, |job| {
                    job.result_path = Some(result_path.display().to_string());
                    job.summary = serde_json::to_value(&summary).ok();
                    job.preview_rows = Some(Value::Array(preview));
                });
            }
        }
        Err(err) => {
            error!("job {} failed: {:?}", job_id, err);
            if state.jobs.set_status(&job_id, JobStatus::Error) {
                state.jobs.update(&job_id, |job| {
                    job.error = Some(err.to_string());
                });
            }
        }
    }

    state.jobs.remove_task(&job_id);
}

struct SseTail {
    last_index: usize,
    pending: VecDeque<Event>,
    finished: bool,
}

/// Terminal SSE event for a job, if it has reached one.
fn job_terminal_event(job: &Job) -> Option<Value> {
    match job.status {
        JobStatus::Complete => Some(json!({
            "type": "complete",
            "summary": job.summary,
            "preview_rows": job.preview_rows,
        })),
        JobStatus::Error | JobStatus::Interrupted => Some(json!({
            "type": "error",
            "message": job.error,
        })),
        JobStatus::Cancelled => Some(json!({
            "type": "cancelled",
            "message": "Job was cancelled.",
        })),
        _ => None,
    }
}

async fn handle_progress(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !state.jobs.contains(&job_id) {
        return Err(not_found("Job not found."));
    }

    let tail = SseTail {
        last_index: 0,
        pending: VecDeque::new(),
        finished: false,
    };
    let stream = futures::stream::unfold(tail, move |mut tail| {
        let state = state.clone();
        let job_id = job_id.clone();
        async move {
            loop {
                if let Some(event) = tail.pending.pop_front() {
                    return Some((Ok::<_, Infallible>(event), tail));
                }
                if tail.finished {
                    return None;
                }

                let Some(job) = state.jobs.get(&job_id) else {
                    return None;
                };

                let events = state.jobs.progress_since(&job_id, tail.last_index);
                tail.last_index += events.len();
                for value in events {
                    tail.pending.push_back(Event::default().data(value.to_string()));
                }

                if let Some(terminal) = job_terminal_event(&job) {
                    tail.pending
                        .push_back(Event::default().data(terminal.to_string()));
                    tail.finished = true;
                }

                if tail.pending.is_empty() {
                    tokio::time::sleep(SSE_POLL_INTERVAL).await;
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn handle_download(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.get(&job_id).ok_or_else(|| not_found("Job not found."))?;
    let result_path = match (&job.status, &job.result_path) {
        (JobStatus::Complete, Some(path)) => PathBuf::from(path),
        _ => return Err(bad_request("Results not ready yet.")),
    };

    let bytes = tokio::fs::read(&result_path)
        .await
        .map_err(|_| not_found("Result file not found."))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"agent_finder_results.zip\"".to_owned(),
            ),
        ],
        bytes,
    ))
}

async fn handle_list_jobs(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<Value>> {
    Json(state.jobs.list())
}

async fn handle_job_results(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state.jobs.get(&job_id).ok_or_else(|| not_found("Job not found."))?;
    if job.status != JobStatus::Complete {
        return Err(not_found("Job not found or not complete"));
    }
    let Some(result_path) = job.result_path else {
        return Err(not_found("Result file not found"));
    };

    let rows = tokio::task::spawn_blocking(move || {
        read_archive_rows(&PathBuf::from(result_path))
    })
    .await
    .map_err(|err| internal_error(err.into()))?
    .map_err(internal_error)?;

    Ok(Json(json!({ "results": rows })))
}

async fn handle_cancel(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state.jobs.get(&job_id).ok_or_else(|| not_found("Job not found."))?;
    if !job.status.is_active() {
        return Err(bad_request("Job is not running."));
    }

    // Mark cancelled before aborting so the task can't race to complete.
    state.jobs.set_status(&job_id, JobStatus::Cancelled);
    state.jobs.update(&job_id, |job| {
        job.error = Some("Cancelled by user.".to_owned());
    });
    state.jobs.abort_task(&job_id);

    Ok(Json(json!({ "ok": true })))
}

async fn handle_resume(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let old_job = state.jobs.get(&job_id).ok_or_else(|| not_found("Job not found."))?;
    if !old_job.status.is_resumable() {
        return Err(bad_request(
            "Only cancelled, errored, or interrupted jobs can be resumed.",
        ));
    }

    let upload_path = PathBuf::from(&old_job.upload_path);
    if !upload_path.is_file() {
        return Err(bad_request("Original upload file no longer exists."));
    }

    let properties = read_input(&upload_path)
        .map_err(|err| bad_request(format!("Could not read original file: {}", err)))?;
    if properties.is_empty() {
        return Err(bad_request("No valid addresses found in original file."));
    }

    // A resume is a brand-new job over the same upload; the cache makes
    // the already-resolved rows free.
    let new_job_id = new_job_id();
    let total = properties.len();
    state.jobs.insert(
        &new_job_id,
        Job::new(
            old_job.upload_path.clone(),
            total,
            old_job.filename.clone(),
        ),
    );
    spawn_pipeline(&state, &new_job_id, properties);

    Ok(Json(json!({ "job_id": new_job_id, "total": total })))
}

async fn handle_delete_job(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state.jobs.delete(&job_id).ok_or_else(|| not_found("Job not found."))?;

    if !job.upload_path.is_empty() {
        let _ = tokio::fs::remove_file(&job.upload_path).await;
    }
    if let Some(result_path) = &job.result_path {
        let _ = tokio::fs::remove_file(result_path).await;
    }

    Ok(Json(json!({ "ok": true })))
}

async fn handle_cache_stats(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let stats = state.cache.stats().await.map_err(internal_error)?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ── FSBO search ──

async fn handle_fsbo_search(
    Extension(state): Extension<Arc<AppState>>,
    Json(criteria): Json<FsboSearchCriteria>,
) -> Result<Json<Value>, ApiError> {
    if criteria.location.trim().is_empty() {
        return Err(bad_request("location is required"));
    }

    let search_id = new_job_id();
    let (search_state, city_zip) = match criteria.location_type {
        LocationType::Zip => (String::new(), criteria.location.clone()),
        LocationType::CityState => {
            let mut parts = criteria.location.splitn(2, ',');
            let city = parts.next().unwrap_or("").trim().to_owned();
            let st = parts.next().unwrap_or("").trim().to_uppercase();
            (st, city)
        }
    };
    let criteria_json = serde_json::to_string(&criteria).unwrap_or_default();

    state
        .fsbo_store
        .save_search(
            &search_id,
            &search_state,
            &city_zip,
            &criteria.location,
            &criteria.location_type.to_string(),
            &now_stamp(),
            &criteria_json,
        )
        .await
        .map_err(internal_error)?;
    state.fsbo_set_status(&search_id, "running", None);

    let task_state = state.clone();
    let task_search_id = search_id.clone();
    let handle = tokio::spawn(async move {
        run_fsbo_search(task_state, task_search_id, criteria).await;
    });
    state
        .fsbo_tasks
        .lock()
        .unwrap()
        .insert(search_id.clone(), handle);

    Ok(Json(json!({ "search_id": search_id })))
}

async fn run_fsbo_search(
    state: Arc<AppState>,
    search_id: String,
    criteria: FsboSearchCriteria,
) {
    let progress: FsboProgressCallback = {
        let state = state.clone();
        let search_id = search_id.clone();
        Arc::new(move |event| {
            let mut value = serde_json::to_value(&event).unwrap_or_default();
            value["type"] = json!("progress");
            state.fsbo_push_progress(&search_id, value);
        })
    };

    let aggregator = FsboAggregator::new(&state.client, Some(progress));
    let listings = aggregator.run(&criteria).await;

    let outcome = async {
        state.fsbo_store.save_listings(&search_id, &listings).await?;
        state
            .fsbo_store
            .update_search_complete(&search_id, listings.len() as i64)
            .await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    match outcome {
        Ok(()) => state.fsbo_set_status(&search_id, "complete", None),
        Err(err) => {
            error!("FSBO search {} failed: {:?}", search_id, err);
            let _ = state.fsbo_store.set_search_status(&search_id, "error").await;
            state.fsbo_set_status(&search_id, "error", Some(err.to_string()));
        }
    }

    state.fsbo_tasks.lock().unwrap().remove(&search_id);
}

async fn handle_fsbo_progress(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(search_id): UrlPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Searches from a previous process have no live progress; answer with
    // their stored terminal state.
    if state.fsbo_snapshot(&search_id, 0).is_none() {
        let row = state
            .fsbo_store
            .get_search(&search_id)
            .await
            .map_err(internal_error)?
            .ok_or_else(|| not_found("Search not found."))?;
        state.fsbo_set_status(&search_id, &row.status, None);
    }

    let tail = SseTail {
        last_index: 0,
        pending: VecDeque::new(),
        finished: false,
    };
    let search_total = {
        let state = state.clone();
        let search_id = search_id.clone();
        move || {
            let state = state.clone();
            let search_id = search_id.clone();
            async move {
                state
                    .fsbo_store
                    .count_listings(&search_id)
                    .await
                    .unwrap_or(0)
            }
        }
    };

    let stream = futures::stream::unfold(tail, move |mut tail| {
        let state = state.clone();
        let search_id = search_id.clone();
        let search_total = search_total.clone();
        async move {
            loop {
                if let Some(event) = tail.pending.pop_front() {
                    return Some((Ok::<_, Infallible>(event), tail));
                }
                if tail.finished {
                    return None;
                }

                let Some((events, status, error)) =
                    state.fsbo_snapshot(&search_id, tail.last_index)
                else {
                    return None;
                };
                tail.last_index += events.len();
                for value in events {
                    tail.pending.push_back(Event::default().data(value.to_string()));
                }

                let terminal = match status.as_str() {
                    "complete" => Some(json!({
                        "type": "complete",
                        "total_listings": search_total().await,
                    })),
                    "error" => Some(json!({ "type": "error", "message": error })),
                    "cancelled" => Some(json!({ "type": "cancelled" })),
                    _ => None,
                };
                if let Some(terminal) = terminal {
                    tail.pending
                        .push_back(Event::default().data(terminal.to_string()));
                    tail.finished = true;
                }

                if tail.pending.is_empty() {
                    tokio::time::sleep(SSE_POLL_INTERVAL).await;
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_per_page")]
    per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    50
}

async fn handle_fsbo_results(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(search_id): UrlPath<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>, ApiError> {
    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 500);

    let total = state
        .fsbo_store
        .count_listings(&search_id)
        .await
        .map_err(internal_error)?;
    let listings = state
        .fsbo_store
        .get_listings(&search_id, (page - 1) * per_page, per_page)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "results": listings,
        "total": total,
        "page": page,
        "per_page": per_page,
    })))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    #[serde(default = "default_fmt")]
    fmt: String,
}

fn default_fmt() -> String {
    "csv".to_owned()
}

async fn handle_fsbo_download(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(search_id): UrlPath<String>,
    Query(params): Query<DownloadParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.fmt != "csv" {
        return Err(bad_request("only fmt=csv is supported"));
    }

    let listings = state
        .fsbo_store
        .all_listings(&search_id)
        .await
        .map_err(internal_error)?;

    let mut writer = csv::Writer::from_writer(vec![]);
    writer
        .write_record([
            "address",
            "city",
            "state",
            "zip_code",
            "price",
            "beds",
            "baths",
            "sqft",
            "property_type",
            "days_on_market",
            "owner_name",
            "phone",
            "email",
            "listing_url",
            "source",
            "contact_status",
        ])
        .map_err(|err| internal_error(err.into()))?;
    for l in &listings {
        let opt_num = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
        writer
            .write_record([
                l.address.clone(),
                l.city.clone(),
                l.state.clone(),
                l.zip_code.clone(),
                opt_num(l.price),
                l.beds.map(|n| n.to_string()).unwrap_or_default(),
                l.baths.map(|n| n.to_string()).unwrap_or_default(),
                l.sqft.map(|n| n.to_string()).unwrap_or_default(),
                l.property_type.clone().unwrap_or_default(),
                opt_num(l.days_on_market),
                l.owner_name.clone().unwrap_or_default(),
                l.phone.clone().unwrap_or_default(),
                l.email.clone().unwrap_or_default(),
                l.listing_url.clone(),
                l.source.clone(),
                l.contact_status.to_string(),
            ])
            .map_err(|err| internal_error(err.into()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| internal_error(anyhow::anyhow!("csv flush failed: {}", err)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"fsbo_{}.csv\"", search_id),
            ),
        ],
        bytes,
    ))
}

async fn handle_fsbo_searches(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let searches = state.fsbo_store.get_searches().await.map_err(internal_error)?;
    Ok(Json(serde_json::to_value(searches).unwrap_or_default()))
}

async fn handle_fsbo_delete(
    Extension(state): Extension<Arc<AppState>>,
    UrlPath(search_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    if state.fsbo_abort_task(&search_id) {
        state.fsbo_set_status(&search_id, "cancelled", None);
    }
    state
        .fsbo_store
        .delete_search(&search_id)
        .await
        .map_err(internal_error)?;
    state.fsbo_states.lock().unwrap().remove(&search_id);
    Ok(Json(json!({ "ok": true })))
}
