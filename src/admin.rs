//! Loopback host control API.
//!
//! Stands in for the desktop shell: a dashboard polls `/admin/status`,
//! follows `/admin/events` and posts commands to `/admin/commands`. It binds
//! 127.0.0.1 only and outlives gateway stop so the listener can be restarted.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::events::{CommandOutcome, HostCommand, HostEvent, StatusSnapshot};
use crate::gateway::Gateway;

/// Default admin port.
pub const DEFAULT_ADMIN_PORT: u16 = 3001;

/// Build the admin router.
pub fn admin_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/events", get(get_events))
        .route("/admin/commands", post(post_command))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serve the admin API on 127.0.0.1 until the task is dropped.
pub async fn serve_admin(gateway: Arc<Gateway>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    tracing::info!(addr = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, admin_router(gateway)).await?;
    Ok(())
}

async fn get_status(State(gateway): State<Arc<Gateway>>) -> Json<StatusSnapshot> {
    Json(gateway.status().await)
}

async fn get_events(
    State(gateway): State<Arc<Gateway>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let initial = HostEvent::StatusUpdate(gateway.status().await);
    let live = BroadcastStream::new(gateway.context().subscribe()).filter_map(|event| async move {
        match event {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Admin event stream lagged: {}", e);
                None
            }
        }
    });

    let stream = futures::stream::once(async move { initial })
        .chain(live)
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &HostEvent) -> Event {
    let name = match event {
        HostEvent::StatusUpdate(_) => "status-update",
        HostEvent::LogUpdate { .. } => "log-update",
        HostEvent::RequestApproval(_) => "request-approval",
        HostEvent::CloseApproval { .. } => "close-approval",
    };
    Event::default()
        .event(name)
        .json_data(event)
        .unwrap_or_else(|_| Event::default().event(name).data("{}"))
}

async fn post_command(
    State(gateway): State<Arc<Gateway>>,
    Json(command): Json<HostCommand>,
) -> Result<impl IntoResponse> {
    let outcome: CommandOutcome = gateway.handle_command(command).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::GatewayOptions;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn gateway() -> Arc<Gateway> {
        Arc::new(Gateway::new(
            GatewayConfig {
                port: 0,
                ..Default::default()
            },
            GatewayOptions::default(),
        ))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let response = admin_router(gateway())
            .oneshot(
                Request::builder()
                    .uri("/admin/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["isRunning"], false);
        assert_eq!(body["config"]["port"], 0);
        assert_eq!(body["config"]["approveRequests"], true);
    }

    #[tokio::test]
    async fn test_start_and_stop_commands() {
        let gateway = gateway();
        let router = admin_router(gateway.clone());

        let post = |body: &'static str| {
            Request::builder()
                .method("POST")
                .uri("/admin/commands")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(post(r#"{"type":"start-server"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["isRunning"], true);

        let response = router
            .oneshot(post(r#"{"type":"stop-server"}"#))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["isRunning"], false);
        assert!(!gateway.context().is_running());
    }
}
