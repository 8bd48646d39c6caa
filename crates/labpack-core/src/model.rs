//! Typed rows of the project schema.

use serde::{Deserialize, Serialize};

/// One recorded experiment (a vessel recording and its metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub name: String,
    pub created_utc: String,
    pub notes: Option<String>,
    pub fps: Option<f64>,
    pub pixel_size_um: Option<f64>,
}

impl Dataset {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            created_utc: chrono::Utc::now().to_rfc3339(),
            notes: None,
            fps: None,
            pixel_size_um: None,
        }
    }
}

/// One row of the measurement table, keyed by `(dataset_id, t_seconds)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    pub t_seconds: f64,
    pub inner_diam: Option<f64>,
    pub outer_diam: Option<f64>,
    pub pressure: Option<f64>,
}

/// A labelled annotation at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub dataset_id: i64,
    pub t_seconds: f64,
    pub label: String,
    pub frame: Option<i64>,
    pub note: Option<String>,
}

impl EventRecord {
    #[must_use]
    pub fn new(id: i64, dataset_id: i64, t_seconds: f64, label: impl Into<String>) -> Self {
        Self {
            id,
            dataset_id,
            t_seconds,
            label: label.into(),
            frame: None,
            note: None,
        }
    }
}

/// A layout or settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_ts: i64,
}
