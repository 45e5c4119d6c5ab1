use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;

use crate::models::job::ImagePayload;
use crate::services::transform::{TransformError, TransformRequest, TransformationClient};

/// MIME type assumed when the service omits one on an image part.
const FALLBACK_RESULT_MIME: &str = "image/png";

/// Client for the Gemini `generateContent` image editing endpoint.
pub struct GeminiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl TransformationClient for GeminiClient {
    async fn transform(&self, request: TransformRequest) -> Result<ImagePayload, TransformError> {
        let started = Instant::now();
        let body = build_request_body(&request);

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        metrics::histogram!("clearwell_transform_seconds").record(started.elapsed().as_secs_f64());

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|envelope| envelope.error.message)
                .unwrap_or_else(|_| format!("Transformation service returned {status}"));
            tracing::warn!(status = %status, error = %message, "Gemini request rejected");
            return Err(TransformError::Service(message));
        }

        extract_image(&text)
    }
}

/// JSON body for `generateContent`: source image, optional guide, instruction.
fn build_request_body(request: &TransformRequest) -> serde_json::Value {
    let engine = &base64::engine::general_purpose::STANDARD;
    let mut parts = vec![serde_json::json!({
        "inline_data": {
            "mime_type": request.source.mime_type,
            "data": engine.encode(&request.source.bytes),
        }
    })];

    if let Some(guide) = &request.guide {
        parts.push(serde_json::json!({
            "inline_data": {
                "mime_type": guide.mime_type,
                "data": engine.encode(&guide.bytes),
            }
        }));
    }

    parts.push(serde_json::json!({ "text": request.instruction() }));

    serde_json::json!({
        "contents": [{ "parts": parts }],
        "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] }
    })
}

/// First inline image found across all candidates.
fn extract_image(body: &str) -> Result<ImagePayload, TransformError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|e| TransformError::Service(format!("Malformed service response: {e}")))?;

    let inline = parsed
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.inline_data)
        .find(|data| data.data.as_deref().is_some_and(|d| !d.is_empty()))
        .ok_or(TransformError::NoImageReturned)?;

    let encoded = inline.data.unwrap_or_default();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| TransformError::Service(format!("Invalid image encoding: {e}")))?;

    Ok(ImagePayload {
        bytes,
        mime_type: inline
            .mime_type
            .unwrap_or_else(|| FALLBACK_RESULT_MIME.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transform::{DEFAULT_INSTRUCTION, GUIDED_INSTRUCTION};

    fn request(guide: bool) -> TransformRequest {
        TransformRequest {
            source: ImagePayload::new(vec![1, 2, 3], "image/jpeg"),
            guide: guide.then(|| ImagePayload::new(vec![4, 5], "image/png")),
        }
    }

    #[test]
    fn body_without_guide_has_source_and_default_instruction() {
        let body = build_request_body(&request(false));
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(parts[0]["inline_data"]["data"], "AQID");
        assert_eq!(parts[1]["text"], DEFAULT_INSTRUCTION);
    }

    #[test]
    fn body_with_guide_sends_guide_second() {
        let body = build_request_body(&request(true));
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[1]["inline_data"]["data"], "BAU=");
        assert_eq!(parts[2]["text"], GUIDED_INSTRUCTION);
    }

    #[test]
    fn extracts_first_image_part() {
        let body = r#"{
            "candidates": [{
                "content": { "parts": [
                    { "text": "Here is your image" },
                    { "inlineData": { "mimeType": "image/jpeg", "data": "AQID" } },
                    { "inlineData": { "mimeType": "image/png", "data": "BAU=" } }
                ]}
            }]
        }"#;

        let image = extract_image(body).unwrap();
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type, "image/jpeg");
    }

    #[test]
    fn missing_mime_type_falls_back() {
        let body = r#"{"candidates":[{"content":{"parts":[{"inlineData":{"data":"AQID"}}]}}]}"#;
        assert_eq!(extract_image(body).unwrap().mime_type, FALLBACK_RESULT_MIME);
    }

    #[test]
    fn text_only_response_is_no_image() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"I cannot do that"}]}}]}"#;
        assert!(matches!(
            extract_image(body),
            Err(TransformError::NoImageReturned)
        ));

        assert!(matches!(
            extract_image(r#"{"candidates":[]}"#),
            Err(TransformError::NoImageReturned)
        ));
    }

    #[test]
    fn garbage_response_is_service_error() {
        assert!(matches!(
            extract_image("<html>bad gateway</html>"),
            Err(TransformError::Service(_))
        ));
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        let client = GeminiClient::new("https://example.test/", "gemini-2.5-flash-image", "k");
        assert_eq!(
            client.endpoint(),
            "https://example.test/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
    }
}
