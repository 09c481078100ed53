//! HTTP status surface: health, per-camera stats, live snapshots, an MJPEG
//! stream, cached detection results, and Prometheus metrics.
//!
//! The server runs on its own thread so the capture and event paths never
//! touch the actix runtime.

use std::{sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::error;

use crate::{bus::EventBus, fleet::BufferService, snapshot::encode_jpeg};

/// Shared state backing the HTTP handlers.
struct ServerState {
    buffers: Arc<BufferService>,
    bus: Arc<dyn EventBus>,
    prometheus: &'static PrometheusHandle,
}

/// Handle for the status server thread.
pub struct StatusServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StatusServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the status server thread.
pub fn spawn_status_server(
    buffers: Arc<BufferService>,
    bus: Arc<dyn EventBus>,
    prometheus: &'static PrometheusHandle,
    host: String,
    port: u16,
) -> Result<StatusServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let handle = std::thread::Builder::new()
        .name("status-server".into())
        .spawn(move || {
            let system = actix_web::rt::System::new();
            let result: Result<(), String> = system.block_on(async move {
                let bound = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            buffers: buffers.clone(),
                            bus: bus.clone(),
                            prometheus,
                        }))
                        .route("/health", web::get().to(health_handler))
                        .route("/cameras", web::get().to(cameras_handler))
                        .route("/snapshot/{camera_id}", web::get().to(snapshot_handler))
                        .route("/stream/{camera_id}", web::get().to(stream_handler))
                        .route("/detect/{camera_id}", web::get().to(detect_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .disable_signals()
                .bind((host.as_str(), port));

                let server = match bound {
                    Ok(server) => server.run(),
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("binding {host}:{port}: {err}")));
                        return Ok(());
                    }
                };
                let srv_handle = server.handle();
                let _ = ready_tx.send(Ok(()));
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });
                server.await.map_err(|err| err.to_string())
            });
            if let Err(err) = result {
                error!("HTTP server error: {err}");
            }
        })
        .context("failed to spawn status server thread")?;

    // Surface bind failures to the caller instead of dying silently.
    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => Ok(StatusServer {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }),
        Ok(Err(err)) => anyhow::bail!("status server failed to start: {err}"),
        Err(_) => anyhow::bail!("status server did not come up"),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    cameras_healthy: bool,
    bus_connected: bool,
    cameras: usize,
}

/// Aggregate readiness: degraded unless some camera is connected with
/// buffered frames and the bus link is up.
async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    let cameras_healthy = state.buffers.is_healthy();
    let bus_connected = state.bus.is_connected();
    let healthy = cameras_healthy && bus_connected;
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        cameras_healthy,
        bus_connected,
        cameras: state.buffers.camera_ids().len(),
    };
    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn cameras_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.buffers.all_stats())
}

/// Latest frame for a camera, JPEG-encoded on demand.
async fn snapshot_handler(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let camera_id = path.into_inner();
    let Some(frame) = state.buffers.latest_frame(&camera_id) else {
        return HttpResponse::NotFound().json(json!({"error": "no frame available"}));
    };
    match encode_jpeg(&frame.pixels, frame.width, frame.height) {
        Ok(jpeg) => HttpResponse::Ok().content_type("image/jpeg").body(jpeg),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Multipart MJPEG stream of a camera's latest frames.
async fn stream_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let camera_id = path.into_inner();
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(100));
        let mut last_frame: u64 = 0;
        loop {
            interval.tick().await;
            let Some(frame) = state.buffers.latest_frame(&camera_id) else {
                continue;
            };
            if frame.frame_number == last_frame {
                continue;
            }
            last_frame = frame.frame_number;
            let Ok(jpeg) = encode_jpeg(&frame.pixels, frame.width, frame.height) else {
                continue;
            };
            drop(frame);

            let mut payload = Vec::with_capacity(jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        ))
        .streaming(stream)
}

/// Latest cached detection result for a camera.
async fn detect_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let camera_id = path.into_inner();
    let Some(result) = state.buffers.detection_result(&camera_id) else {
        return HttpResponse::NotFound().json(json!({"error": "no detection result"}));
    };
    HttpResponse::Ok().json(json!({
        "camera_id": camera_id,
        "frame_number": result.frame_number,
        "age_ms": result.timestamp.elapsed().as_millis() as u64,
        "detections": result.detections,
    }))
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.prometheus.render())
}
