//! Prometheus metrics for monitoring qs-agent ingestion.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)
//! - Gauges: point-in-time sizes, labelled by file type

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================

    pub static ref REFRESH_DURATION: HistogramVec = register_histogram_vec!(
        "qs_agent_refresh_duration_seconds",
        "Time spent in one scheduler refresh tick",
        &["file_type"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .unwrap();
    pub static ref CHECKPOINT_DURATION: HistogramVec = register_histogram_vec!(
        "qs_agent_checkpoint_duration_seconds",
        "Time spent reading or writing file offsets",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================

    pub static ref EVENTS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "qs_agent_events_processed_total",
        "Events dispatched successfully (success, skip or finish)",
        &["file_type"]
    )
    .unwrap();
    pub static ref FILES_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "qs_agent_files_created_total",
        "Files seen for the first time and persisted",
        &["file_type"]
    )
    .unwrap();
    pub static ref FILES_RETIRED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "qs_agent_files_retired_total",
        "Archived files dropped because they finished or expired",
        &["file_type"]
    )
    .unwrap();
    pub static ref ROTATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "qs_agent_rotations_total",
        "Partition directory rotations",
        &["file_type"]
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================

    pub static ref EVENTS_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "qs_agent_events_failed_total",
        "Events whose dispatch failed",
        &["file_type"]
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================

    pub static ref QUEUE_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "qs_agent_queue_size",
        "Files scheduled but not yet picked up by a worker",
        &["file_type"]
    )
    .unwrap();
    pub static ref ARCHIVED_FILES: IntGaugeVec = register_int_gauge_vec!(
        "qs_agent_archived_files",
        "Files from previous partition directories still tracked",
        &["file_type"]
    )
    .unwrap();
}

/// Metric handles resolved for one pipeline's file type.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub events_processed: IntCounter,
    pub events_failed: IntCounter,
    pub files_created: IntCounter,
    pub files_retired: IntCounter,
    pub rotations: IntCounter,
    pub queue_size: IntGauge,
    pub archived_files: IntGauge,
}

impl PipelineMetrics {
    pub fn for_file_type(file_type: &str) -> Self {
        Self {
            events_processed: EVENTS_PROCESSED_TOTAL.with_label_values(&[file_type]),
            events_failed: EVENTS_FAILED_TOTAL.with_label_values(&[file_type]),
            files_created: FILES_CREATED_TOTAL.with_label_values(&[file_type]),
            files_retired: FILES_RETIRED_TOTAL.with_label_values(&[file_type]),
            rotations: ROTATIONS_TOTAL.with_label_values(&[file_type]),
            queue_size: QUEUE_SIZE.with_label_values(&[file_type]),
            archived_files: ARCHIVED_FILES.with_label_values(&[file_type]),
        }
    }
}
