pub mod compositor;
pub mod gemini;
pub mod queue;
pub mod retouch;
pub mod transform;
pub mod validation;
