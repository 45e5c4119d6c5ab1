use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use garde::Validate;
use image::ImageFormat;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{JobView, RejectedFile, ReprocessRequest, SubmitResponse};
use crate::models::job::{JobRecord, JobStatus};
use crate::routes::error::{ApiError, ApiResult};
use crate::services::compositor::{self, HighlightLayer};
use crate::services::queue::QueueError;
use crate::services::retouch::{self, RetouchParams};
use crate::services::validation::{self, Upload};

/// Multipart field names carrying images.
const IMAGE_FIELDS: [&str; 2] = ["image", "images"];

/// POST /api/v1/jobs: Upload one or more images for watermark removal.
pub async fn submit_jobs(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if !field.name().is_some_and(|name| IMAGE_FIELDS.contains(&name)) {
            continue;
        }
        let display_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("image-{}", uploads.len() + 1));
        let declared_mime = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        uploads.push(Upload {
            display_name,
            declared_mime,
            bytes: bytes.to_vec(),
        });
    }

    if uploads.is_empty() {
        return Err(ApiError::BadRequest("No image files in request".to_string()));
    }

    // Decoding is CPU-bound.
    let max_bytes = state.max_upload_bytes;
    let checked = tokio::task::spawn_blocking(move || {
        uploads
            .into_iter()
            .map(|upload| validation::validate_upload(upload, max_bytes))
            .collect::<Vec<_>>()
    })
    .await?;

    let mut sources = Vec::new();
    let mut rejected = Vec::new();
    for outcome in checked {
        match outcome {
            Ok(source) => sources.push(source),
            Err(e) => {
                tracing::warn!(error = %e, "Upload rejected");
                metrics::counter!("clearwell_uploads_rejected_total").increment(1);
                rejected.push(RejectedFile {
                    file_name: e.file_name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let accepted: Vec<JobView> = state
        .queue
        .submit(sources)
        .into_iter()
        .filter_map(|id| state.queue.get(id))
        .map(|job| JobView::from(&job))
        .collect();

    let status = if accepted.is_empty() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(SubmitResponse { accepted, rejected })))
}

/// GET /api/v1/jobs: All jobs in submission order.
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    Json(state.queue.jobs().iter().map(JobView::from).collect())
}

/// GET /api/v1/jobs/{job_id}: Check one job's status.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    let job = find(&state, job_id)?;
    Ok(Json(JobView::from(&job)))
}

/// DELETE /api/v1/jobs/{job_id}: Remove a job from the queue.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.queue.remove(job_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/jobs/{job_id}/source: The original upload.
pub async fn get_source(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let job = find(&state, job_id)?;
    let payload = &job.source().payload;
    Ok((
        [(header::CONTENT_TYPE, payload.mime_type.clone())],
        payload.bytes.clone(),
    ))
}

/// GET /api/v1/jobs/{job_id}/result: Download the processed image.
pub async fn download_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let job = find(&state, job_id)?;
    let result = job
        .result()
        .ok_or(QueueError::NotCompleted(job_id))?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        download_name(&job.source().display_name, &result.mime_type)
    );
    Ok((
        [
            (header::CONTENT_TYPE, result.mime_type.clone()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        result.bytes.clone(),
    ))
}

/// POST /api/v1/jobs/{job_id}/reprocess: Re-queue a job, optionally guided by
/// highlight strokes painted over the source image.
pub async fn reprocess_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ReprocessRequest>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    request.validate()?;
    let job = find(&state, job_id)?;
    if job.status() == JobStatus::Processing {
        return Err(QueueError::Busy(job_id).into());
    }

    let guide = if request.strokes.is_empty() {
        None
    } else {
        let source = job.source().clone();
        let highlight = state.highlight;
        let default_width = state.default_brush_size;
        let strokes = request.strokes;

        let guide = tokio::task::spawn_blocking(move || {
            let mut layer = HighlightLayer::new(source.width, source.height, highlight);
            for stroke in strokes {
                layer.paint(&stroke.into_stroke(default_width));
            }
            compositor::composite(&source.payload, &layer)
        })
        .await??;
        Some(guide)
    };

    state.queue.request_manual_reprocess(job_id, guide)?;
    let job = find(&state, job_id)?;
    Ok((StatusCode::ACCEPTED, Json(JobView::from(&job))))
}

/// POST /api/v1/jobs/{job_id}/retouch: Adjust a finished result and save it.
pub async fn retouch_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(params): Json<RetouchParams>,
) -> ApiResult<Json<JobView>> {
    params.validate()?;
    let job = find(&state, job_id)?;
    let result = job
        .result()
        .cloned()
        .ok_or(QueueError::NotCompleted(job_id))?;

    if !params.is_identity() {
        let based_on = result.clone();
        let retouched =
            tokio::task::spawn_blocking(move || retouch::apply(&result, &params)).await??;
        state.queue.replace_result(job_id, &based_on, retouched)?;
    }

    let job = find(&state, job_id)?;
    Ok(Json(JobView::from(&job)))
}

/// `clearwell-<stem>.<ext>`, with the extension taken from the result's MIME
/// type so a JPEG result of `photo.png` downloads as `clearwell-photo.jpg`.
fn download_name(display_name: &str, mime_type: &str) -> String {
    let safe = display_name.replace(['"', '\\', '/'], "_");
    let extension = ImageFormat::from_mime_type(mime_type)
        .and_then(|format| format.extensions_str().first().copied());

    match extension {
        Some(ext) => {
            let stem = match safe.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem,
                _ => safe.as_str(),
            };
            format!("clearwell-{stem}.{ext}")
        }
        None => format!("clearwell-{safe}"),
    }
}

fn find(state: &AppState, job_id: Uuid) -> Result<JobRecord, ApiError> {
    state
        .queue
        .get(job_id)
        .ok_or_else(|| QueueError::NotFound(job_id).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_name_follows_result_format() {
        assert_eq!(download_name("photo.png", "image/png"), "clearwell-photo.png");
        assert_eq!(download_name("photo.png", "image/jpeg"), "clearwell-photo.jpg");
        assert_eq!(download_name("archive.v2.webp", "image/png"), "clearwell-archive.v2.png");
        assert_eq!(download_name("scan", "image/png"), "clearwell-scan.png");
        assert_eq!(download_name(".hidden", "image/png"), "clearwell-.hidden.png");
    }

    #[test]
    fn download_name_keeps_source_name_for_unknown_types() {
        assert_eq!(
            download_name("photo.png", "application/octet-stream"),
            "clearwell-photo.png"
        );
        assert_eq!(download_name("a\"b.png", "image/png"), "clearwell-a_b.png");
    }
}
