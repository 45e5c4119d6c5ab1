//! Clearwell batch watermark removal
//!
//! This library provides the core of the clearwell service: a single-concurrency
//! job queue that feeds user-submitted images to a generative image model, the
//! mask compositor that turns highlight strokes into a region guide, and the
//! HTTP surface the browser front end talks to.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
