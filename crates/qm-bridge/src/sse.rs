//! SSE fan-out of the engine's event stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseFrame, KeepAlive, Sse},
};
use futures_util::Stream;
use serde::Deserialize;

use qm_events::Event;

use crate::http_api::ApiState;

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Query filters; present criteria are ANDed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SseFilter {
    pub project: Option<String>,
    pub workflow: Option<String>,
}

impl SseFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(project) = &self.project {
            if &event.project_id != project {
                return false;
            }
        }
        if let Some(workflow) = &self.workflow {
            match &event.workflow_id {
                Some(id) if id.as_str() == workflow => {}
                _ => return false,
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET /api/v1/sse/events?project=&workflow=`
///
/// One frame per event: the SSE `event:` field is the dotted event type and
/// `data:` is the JSON envelope. A `: heartbeat` comment goes out every
/// 30 s. There is no replay on reconnect; clients re-fetch state over the
/// JSON API. Slow clients fall under the bus's drop-oldest policy.
pub async fn sse_events(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<SseFilter>,
) -> Sse<impl Stream<Item = Result<SseFrame, Infallible>>> {
    let subscription = state.ctx().bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match subscription.recv().await {
                Some(event) => {
                    if !filter.matches(&event) {
                        continue;
                    }
                    let data = match serde_json::to_string(&event) {
                        Ok(data) => data,
                        Err(_) => continue,
                    };
                    yield Ok(SseFrame::default().event(event.kind.as_str()).data(data));
                }
                None => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
