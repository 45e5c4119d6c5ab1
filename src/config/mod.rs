use std::time::Duration;

use image::Rgba;
use serde::Deserialize;

use crate::services::compositor::DEFAULT_HIGHLIGHT;
use crate::services::queue::QueueSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// API key for the Gemini transformation service
    pub gemini_api_key: String,

    /// Image model used for watermark removal
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Base URL of the Gemini API
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    /// Hard timeout for a single transformation call, in seconds
    #[serde(default = "default_transform_timeout_secs")]
    pub transform_timeout_secs: u64,

    /// Window for coalescing queue changes into one admission pass
    #[serde(default = "default_admission_debounce_ms")]
    pub admission_debounce_ms: u64,

    /// Per-file upload limit in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Whole request body limit in bytes (a batch of uploads)
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Mask highlight color as `#rrggbb` or `#rrggbbaa`
    #[serde(default = "default_highlight_color")]
    pub highlight_color: String,

    /// Brush width used when a stroke does not carry one
    #[serde(default = "default_brush_size")]
    pub default_brush_size: f32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_transform_timeout_secs() -> u64 {
    120
}

fn default_admission_debounce_ms() -> u64 {
    500
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_request_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_highlight_color() -> String {
    "#ff0000cc".to_string()
}

fn default_brush_size() -> f32 {
    20.0
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            debounce: Duration::from_millis(self.admission_debounce_ms),
            call_timeout: Duration::from_secs(self.transform_timeout_secs),
        }
    }

    /// Parsed highlight color; falls back to translucent red when malformed.
    pub fn highlight(&self) -> Rgba<u8> {
        parse_hex_rgba(&self.highlight_color).unwrap_or_else(|| {
            tracing::warn!(value = %self.highlight_color, "Invalid HIGHLIGHT_COLOR, using default");
            DEFAULT_HIGHLIGHT
        })
    }
}

/// `#rrggbb` or `#rrggbbaa`, leading `#` optional.
pub fn parse_hex_rgba(value: &str) -> Option<Rgba<u8>> {
    let hex = value.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return None;
    }

    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    let alpha = if hex.len() == 8 { channel(6)? } else { 255 };
    Some(Rgba([channel(0)?, channel(2)?, channel(4)?, alpha]))
}
