//! Trigger and status request handling
//!
//! Paths carry the scan id as a `scan_id=<id>` segment:
//! `/scan/scan_id=<id>` accepts a scan, `GET /status/scan_id=<id>` reports
//! its persisted state.

use crate::error::VscannerError;
use crate::jobs::{JobQueue, ScanJob};
use crate::scanner::ScanEngine;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

const SCAN_ID_MARKER: &str = "/scan_id=";
const STATUS_PREFIX: &str = "/status/";

/// Shared state behind the trigger endpoint
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScanEngine>,
    pub queue: JobQueue,
}

/// Status code plus JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    fn message(message: &str) -> Self {
        Self {
            status: StatusCode::OK,
            body: json!({ "message": message }),
        }
    }

    fn error(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": error.into() }),
        }
    }
}

/// Extracts everything after the first `/scan_id=`, up to any repeated marker.
/// Later slashes belong to the identifier.
pub fn parse_scan_id(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once(SCAN_ID_MARKER)?;
    let id = rest.split(SCAN_ID_MARKER).next().unwrap_or("");
    (!id.is_empty()).then_some(id)
}

/// Routes one request
pub async fn handle(state: &AppState, method: &Method, path: &str) -> ApiResponse {
    if path.starts_with(STATUS_PREFIX) {
        if *method != Method::GET {
            return ApiResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        return status(state, path).await;
    }
    trigger(state, path).await
}

async fn trigger(state: &AppState, path: &str) -> ApiResponse {
    let Some(scan_id) = parse_scan_id(path) else {
        return ApiResponse::error(StatusCode::BAD_REQUEST, "scan_id is required");
    };
    info!("Scan trigger received for {scan_id}");

    match state.engine.start(scan_id).await {
        Ok(_) => {}
        Err(VscannerError::ScanNotFound(_)) => {
            return ApiResponse::error(StatusCode::NOT_FOUND, "scan not found");
        }
        Err(VscannerError::InvalidTransition { .. }) => {
            return ApiResponse::error(StatusCode::CONFLICT, "scan already started");
        }
        Err(e) => return fail_before_ack(state, scan_id, e).await,
    }

    if let Err(e) = state.queue.submit(ScanJob::new(scan_id)) {
        return fail_before_ack(state, scan_id, e).await;
    }

    ApiResponse::message("started")
}

/// Records the failure on the scan and answers 500
async fn fail_before_ack(state: &AppState, scan_id: &str, e: VscannerError) -> ApiResponse {
    let message = e.to_string();
    error!("Scan {scan_id} could not be accepted: {message}");
    if let Err(write_err) = state.engine.abort(scan_id, &message).await {
        error!("Could not record failure of scan {scan_id}: {write_err}");
    }
    ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, message)
}

async fn status(state: &AppState, path: &str) -> ApiResponse {
    let Some(scan_id) = parse_scan_id(path) else {
        return ApiResponse::error(StatusCode::BAD_REQUEST, "scan_id is required");
    };
    match state.engine.status(scan_id).await {
        Ok(status) => match serde_json::to_value(&status) {
            Ok(body) => ApiResponse {
                status: StatusCode::OK,
                body,
            },
            Err(e) => ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(VscannerError::ScanNotFound(_)) => {
            ApiResponse::error(StatusCode::NOT_FOUND, "scan not found")
        }
        Err(e) => ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
