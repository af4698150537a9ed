//! Text-to-speech task endpoints.
//!
//! Thin JSON wrappers over [`murmur_core::Orchestrator`]; every rule about
//! validation, deduplication and state lives there.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use murmur_core::{CoreError, TaskFilter, TaskId, TaskStatus};
use tracing::warn;

use crate::error::ServerError;
use crate::schemas::v1::tts::{
    BatchItemResponse, ConvertMultipleRequest, ConvertRequest, DEFAULT_LIST_LIMIT,
    LanguagesResponse, ListQuery, MAX_LIST_LIMIT, TaskResponse, download_filename, voice_params,
};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tts", get(list_tasks))
        .route("/tts/convert", post(convert))
        .route("/tts/convert-multiple", post(convert_multiple))
        .route("/tts/languages", get(languages))
        .route("/tts/{id}", get(get_task))
        .route("/tts/{id}/cancel", post(cancel_task))
        .route("/tts/{id}/download", get(download_audio))
}

/// Submit one text. Answers with the new task, or with the existing one when
/// an identical submission is still queued or processing.
pub async fn convert(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TaskResponse>), ServerError> {
    let Json(req) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let task = state
        .orchestrator
        .submit(
            &req.text,
            voice_params(req.language, req.voice),
            req.custom_label,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(task.into())))
}

/// Submit several texts; each item succeeds or fails on its own.
pub async fn convert_multiple(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ConvertMultipleRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Vec<BatchItemResponse>>), ServerError> {
    let Json(req) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let results = state
        .orchestrator
        .submit_batch(&req.texts, voice_params(req.language, req.voice))
        .await?;
    let items = results
        .into_iter()
        .enumerate()
        .map(|(index, result)| BatchItemResponse::new(index, result))
        .collect();
    Ok((StatusCode::ACCEPTED, Json(items)))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let filter = match q.status.as_deref() {
        None | Some("") => TaskFilter::default(),
        Some(raw) => TaskFilter::status(
            TaskStatus::from_str(raw)
                .map_err(|_| ServerError::BadRequest(format!("unknown status '{raw}'")))?,
        ),
    };
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(CoreError::Validation(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        ))
        .into());
    }
    let tasks = state.orchestrator.list(filter.with_limit(limit)).await?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task = state.orchestrator.get_status(&TaskId::from(id)).await?;
    Ok(Json(task.into()))
}

/// Cancel a queued task. Anything past `queued` answers 409.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task = state.orchestrator.cancel(&TaskId::from(id)).await?;
    Ok(Json(task.into()))
}

/// Audio of a completed task as a WAV attachment.
pub async fn download_audio(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let task = state.orchestrator.get_status(&TaskId::from(id)).await?;
    if task.status != TaskStatus::Completed {
        return Err(ServerError::BadRequest(format!(
            "task is not completed (status: {})",
            task.status
        )));
    }
    let Some(path) = task.result_ref.as_deref() else {
        return Err(ServerError::NotFound("audio file not found".into()));
    };
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        warn!(task_id = %task.id, path, error = %e, "audio file unreadable");
        ServerError::NotFound("audio file not found".into())
    })?;

    let disposition = format!("attachment; filename=\"{}\"", download_filename(&task));
    Ok((
        [
            (header::CONTENT_TYPE, "audio/wav".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

pub async fn languages(State(state): State<Arc<AppState>>) -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        languages: state.orchestrator.supported_languages().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::routes::test_support::app;

    #[tokio::test]
    async fn convert_completes_and_deduplicates() {
        let gate = Arc::new(Semaphore::new(0));
        let app = app(1, Some(gate.clone())).await;

        let (status, first) = app
            .post(
                "/v1/tts/convert",
                json!({ "text": "  Hyvää   päivää ", "custom_label": "greeting" }),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["input_text"], "Hyvää päivää");
        assert_eq!(first["language"], "fi");
        assert_eq!(first["custom_label"], "greeting");

        let (_, second) = app
            .post("/v1/tts/convert", json!({ "text": "Hyvää päivää" }))
            .await;
        assert_eq!(second["id"], first["id"]);

        gate.add_permits(1);
        let id = first["id"].as_str().expect("id");
        let done = app.wait_for(id, "completed").await;
        assert_eq!(done["attempt_count"], 1);
        assert_eq!(done["device"], "cpu");
        assert_eq!(done["audio"]["sample_rate"], 16_000);
        assert!(
            done["result_ref"]
                .as_str()
                .expect("result_ref")
                .ends_with(&format!("tts_{id}.wav"))
        );
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let app = app(1, None).await;

        let (status, body) = app.post("/v1/tts/convert", json!({ "text": "   " })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "validation_error");

        let (status, _) = app
            .post("/v1/tts/convert", json!({ "text": "Hei", "language": "xx" }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/v1/tts/convert")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .expect("request"),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn convert_multiple_reports_each_item() {
        let app = app(2, None).await;

        let (status, body) = app
            .post(
                "/v1/tts/convert-multiple",
                json!({ "texts": ["Yksi", "", "Kolme"] }),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let items = body.as_array().expect("array");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["index"], 0);
        assert!(items[0]["task"]["id"].is_string());
        assert_eq!(items[1]["error"]["code"], "validation_error");
        assert!(items[1].get("task").is_none());
        assert!(items[2]["task"]["id"].is_string());

        let (status, _) = app
            .post("/v1/tts/convert-multiple", json!({ "texts": [] }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let app = app(1, None).await;
        let (status, body) = app.get("/v1/tts/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let (status, _) = app
            .post("/v1/tts/does-not-exist/cancel", json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_only_queued_tasks() {
        let gate = Arc::new(Semaphore::new(0));
        let app = app(1, Some(gate.clone())).await;

        let (_, running) = app.post("/v1/tts/convert", json!({ "text": "Eka" })).await;
        let running_id = running["id"].as_str().expect("id").to_owned();
        app.wait_for(&running_id, "processing").await;

        let (_, waiting) = app.post("/v1/tts/convert", json!({ "text": "Toka" })).await;
        let waiting_id = waiting["id"].as_str().expect("id").to_owned();

        let (status, body) = app
            .post(&format!("/v1/tts/{waiting_id}/cancel"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert!(body["completed_at"].is_string());

        let (status, body) = app
            .post(&format!("/v1/tts/{running_id}/cancel"), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_state");

        gate.add_permits(1);
        app.wait_for(&running_id, "completed").await;
        let (status, _) = app
            .post(&format!("/v1/tts/{running_id}/cancel"), json!({}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let gate = Arc::new(Semaphore::new(0));
        let app = app(1, Some(gate.clone())).await;

        let (_, a) = app.post("/v1/tts/convert", json!({ "text": "A" })).await;
        let (_, b) = app.post("/v1/tts/convert", json!({ "text": "B" })).await;
        app.post(&format!("/v1/tts/{}/cancel", b["id"].as_str().expect("id")), json!({}))
            .await;

        let (status, all) = app.get("/v1/tts").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = all
            .as_array()
            .expect("array")
            .iter()
            .map(|t| t["id"].as_str().expect("id"))
            .collect();
        assert_eq!(ids, vec![a["id"].as_str().expect("id"), b["id"].as_str().expect("id")]);

        let (_, cancelled) = app.get("/v1/tts?status=cancelled").await;
        assert_eq!(cancelled.as_array().expect("array").len(), 1);
        assert_eq!(cancelled[0]["id"], b["id"]);

        let (status, _) = app.get("/v1/tts?status=sleeping").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        gate.add_permits(1);
    }

    #[tokio::test]
    async fn list_limit_keeps_the_newest_tasks() {
        let gate = Arc::new(Semaphore::new(0));
        let app = app(1, Some(gate.clone())).await;

        let mut ids = Vec::new();
        for text in ["Yksi", "Kaksi", "Kolme"] {
            let (_, task) = app.post("/v1/tts/convert", json!({ "text": text })).await;
            ids.push(task["id"].as_str().expect("id").to_owned());
        }

        let (status, newest) = app.get("/v1/tts?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let got: Vec<&str> = newest
            .as_array()
            .expect("array")
            .iter()
            .map(|t| t["id"].as_str().expect("id"))
            .collect();
        assert_eq!(got, vec![ids[1].as_str(), ids[2].as_str()]);

        for bad in ["0", "1001"] {
            let (status, body) = app.get(&format!("/v1/tts?limit={bad}")).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
            assert_eq!(body["code"], "validation_error");
        }

        gate.add_permits(3);
    }

    #[tokio::test]
    async fn download_serves_completed_audio() {
        let gate = Arc::new(Semaphore::new(0));
        let app = app(1, Some(gate.clone())).await;

        let (_, task) = app
            .post(
                "/v1/tts/convert",
                json!({ "text": "Lataa minut", "custom_label": "aamu" }),
            )
            .await;
        let id = task["id"].as_str().expect("id").to_owned();
        let uri = format!("/v1/tts/{id}/download");

        let (status, body) = app.get(&uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");

        gate.add_permits(1);
        let done = app.wait_for(&id, "completed").await;

        let (status, headers, bytes) = app
            .send_raw(Request::builder().uri(&uri).body(Body::empty()).expect("request"))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "audio/wav");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"aamu.wav\""
        );
        assert_eq!(&bytes[..4], b"RIFF");
        assert!(bytes.len() > 3200);

        std::fs::remove_file(done["result_ref"].as_str().expect("result_ref"))
            .expect("remove audio");
        let (status, body) = app.get(&uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let (status, _) = app.get("/v1/tts/missing/download").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn languages_lists_backend_languages() {
        let app = app(1, None).await;
        let (status, body) = app.get("/v1/tts/languages").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["languages"], json!(["fi"]));
    }
}
