use image::Rgba;

use crate::config::AppConfig;
use crate::services::queue::QueueCoordinator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: QueueCoordinator,
    pub max_upload_bytes: usize,
    pub highlight: Rgba<u8>,
    pub default_brush_size: f32,
}

impl AppState {
    pub fn new(
        queue: QueueCoordinator,
        max_upload_bytes: usize,
        highlight: Rgba<u8>,
        default_brush_size: f32,
    ) -> Self {
        Self {
            queue,
            max_upload_bytes,
            highlight,
            default_brush_size,
        }
    }

    pub fn from_config(queue: QueueCoordinator, config: &AppConfig) -> Self {
        Self::new(
            queue,
            config.max_upload_bytes,
            config.highlight(),
            config.default_brush_size,
        )
    }
}
