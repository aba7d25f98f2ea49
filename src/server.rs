use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::Stream;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    aggregator::{Publisher, SubscriptionId},
    blobstore::BlobStore,
    render,
    types::{BlobRef, Snapshot},
};

/// Shared state for the live endpoint: the publisher to read and subscribe
/// to, and the blob store to serve artifacts from.
#[derive(Clone)]
pub struct AppState {
    publisher: Publisher,
    store: Arc<dyn BlobStore>,
}

impl AppState {
    pub fn new(publisher: Publisher, store: Arc<dyn BlobStore>) -> Self {
        Self { publisher, store }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/events", get(get_events));

    Router::new()
        .route("/", get(get_page))
        .route("/blobs/{key}", get(get_blob))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the live endpoint until `shutdown` is cancelled.
pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving live results");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_page(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot = app.publisher.current();
    Html(render::render_page(&snapshot, &|blob: &BlobRef| app.store.link(blob)))
}

async fn get_status(State(app): State<AppState>) -> Json<Snapshot> {
    Json(app.publisher.current().as_ref().clone())
}

async fn get_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // The first item is the current snapshot.
    let (id, rx) = app.publisher.subscribe_channel();
    info!(subscription = id, "live viewer attached");
    let detach = Detach {
        publisher: app.publisher.clone(),
        id,
    };
    let stream = UnboundedReceiverStream::new(rx).map(move |snapshot| {
        let _attached = &detach;
        let event = match Event::default().event("snapshot").json_data(snapshot.as_ref()) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "failed to encode snapshot");
                Event::default().event("error").data(e.to_string())
            }
        };
        Ok::<_, Infallible>(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Drops the viewer's subscription when its event stream goes away.
struct Detach {
    publisher: Publisher,
    id: SubscriptionId,
}

impl Drop for Detach {
    fn drop(&mut self) {
        if self.publisher.unsubscribe(self.id) {
            info!(subscription = self.id, "live viewer detached");
        }
    }
}

async fn get_blob(State(app): State<AppState>, Path(key): Path<String>) -> Response {
    match app.store.get(&key).await {
        Ok(Some(blob)) => ([(header::CONTENT_TYPE, blob.content_type)], blob.bytes).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no such artifact").into_response(),
        Err(e) => {
            error!(key = %key, error = %format!("{e:#}"), "failed to read artifact");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
