//! AWS Lambda handler.
//!
//! One function serves both the schedule and manual invocations:
//!
//! - a payload without `action` (EventBridge schedule) runs a collection;
//! - `{"action": "...", "sources": [...]}` selects an operation.
//!
//! Errors are reported in the response body so a failed run never counts as
//! a failed invocation (and is never retried by the platform).

use lambda_runtime::{Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::models::RunRecord;
use crate::services::CachedImage;
use crate::trigger::{StartStatus, Trigger};

const DEFAULT_HISTORY: usize = 20;

/// Operation requested by the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Run a collection and wait for it
    #[default]
    Collect,
    /// Acquire the lock and report; the run continues in this invocation
    Start,
    Status,
    Invalidate,
    /// Purge the image cache
    Purge,
    History,
    /// Cache a single image
    Image,
}

/// Lambda invocation payload.
#[derive(Debug, Default, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub action: Option<Action>,

    /// Source ids for `invalidate`
    #[serde(default)]
    pub sources: Vec<String>,

    /// Image URL for `image`
    #[serde(default)]
    pub url: Option<String>,

    /// Number of runs for `history`
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Request {
    /// Read a payload, treating anything unrecognized as a scheduled event.
    pub fn from_payload(payload: Value) -> Self {
        serde_json::from_value(payload).unwrap_or_else(|e| {
            warn!("Unrecognized payload ({}), collecting", e);
            Self::default()
        })
    }
}

/// Lambda response payload.
#[derive(Debug, Default, Serialize)]
pub struct Response {
    /// Status line or start result
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shows: Option<usize>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<CachedImage>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<RunRecord>,

    /// Error message if the operation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub execution_time_ms: u64,
}

impl Response {
    fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Main Lambda handler function.
#[instrument(skip(trigger, event), fields(request_id = %event.context.request_id))]
pub async fn handler(
    trigger: &Trigger,
    event: LambdaEvent<Value>,
) -> std::result::Result<Response, LambdaError> {
    let start = std::time::Instant::now();
    let request = Request::from_payload(event.payload);
    info!("Handling {:?}", request.action.unwrap_or_default());

    let mut response = match dispatch(trigger, &request).await {
        Ok(response) => response,
        Err(e) => {
            error!("Request failed: {}", e);
            Response {
                status: "error".to_string(),
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };
    response.execution_time_ms = start.elapsed().as_millis() as u64;
    Ok(response)
}

/// Run the requested operation.
pub async fn dispatch(trigger: &Trigger, request: &Request) -> Result<Response> {
    match request.action.unwrap_or_default() {
        // Background work does not survive the invocation, so both wait
        Action::Collect | Action::Start => match trigger.run_now().await? {
            Some(report) => {
                info!(
                    "Collected {} shows with {} faults",
                    report.feed.shows.len(),
                    report.feed.faults.len()
                );
                Ok(Response {
                    status: trigger.status().await,
                    shows: Some(report.feed.shows.len()),
                    faults: report.feed.faults,
                    ..Default::default()
                })
            }
            None => Ok(Response::status(StartStatus::AlreadyInProgress.as_str())),
        },
        Action::Status => Ok(Response::status(trigger.status().await)),
        Action::Invalidate => Ok(Response::status(trigger.invalidate(&request.sources).await)),
        Action::Purge => {
            let removed = trigger.purge_images().await?;
            Ok(Response {
                removed: Some(removed),
                ..Response::status(trigger.status().await)
            })
        }
        Action::History => {
            let history = trigger
                .history(request.limit.unwrap_or(DEFAULT_HISTORY))
                .await?;
            Ok(Response {
                history,
                ..Response::status(trigger.status().await)
            })
        }
        Action::Image => {
            let Some(url) = request.url.as_deref() else {
                return Ok(Response {
                    error: Some("image requires a url".to_string()),
                    ..Response::status("error")
                });
            };
            match trigger.cache_image(url).await? {
                Some(image) => Ok(Response {
                    image: Some(image),
                    ..Response::status(trigger.status().await)
                }),
                None => Ok(Response::status(StartStatus::AlreadyInProgress.as_str())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Config, Show};
    use crate::sources::{SourceHandler, SourceRegistry};
    use crate::storage::Stores;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct OneShow;

    #[async_trait]
    impl SourceHandler for OneShow {
        fn id(&self) -> &str {
            "hall"
        }
        fn label(&self) -> &str {
            "The Hall"
        }
        async fn fetch(&self) -> Result<Vec<Show>> {
            Ok(vec![Show {
                title: "Quiet Night".to_string(),
                dt: 1,
                ..Show::default()
            }])
        }
    }

    fn trigger() -> Trigger {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(OneShow));
        Trigger::from_config(&Config::default(), &Stores::in_memory(), registry).unwrap()
    }

    #[test]
    fn test_scheduled_event_collects() {
        let request = Request::from_payload(json!({
            "source": "aws.events",
            "detail-type": "Scheduled Event",
            "detail": {}
        }));
        assert_eq!(request.action, None);

        let request = Request::from_payload(json!("not an object"));
        assert_eq!(request.action.unwrap_or_default(), Action::Collect);

        let request = Request::from_payload(json!({
            "action": "invalidate",
            "sources": ["a", "b"]
        }));
        assert_eq!(request.action, Some(Action::Invalidate));
        assert_eq!(request.sources, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dispatch_actions() {
        let trigger = trigger();

        let response = dispatch(&trigger, &Request::default()).await.unwrap();
        assert_eq!(response.shows, Some(1));
        assert_eq!(response.status, "Done");

        let status = Request {
            action: Some(Action::Status),
            ..Request::default()
        };
        assert_eq!(dispatch(&trigger, &status).await.unwrap().status, "Done");

        let invalidate = Request {
            action: Some(Action::Invalidate),
            sources: vec!["hall".to_string()],
            ..Request::default()
        };
        let response = dispatch(&trigger, &invalidate).await.unwrap();
        assert_eq!(response.status, "Invalidated cache for: hall");

        let purge = Request {
            action: Some(Action::Purge),
            ..Request::default()
        };
        let response = dispatch(&trigger, &purge).await.unwrap();
        assert_eq!(response.removed, Some(0));
        assert_eq!(response.status, "Done purge 0");

        let history = Request {
            action: Some(Action::History),
            limit: Some(5),
            ..Request::default()
        };
        assert_eq!(dispatch(&trigger, &history).await.unwrap().history.len(), 1);

        let image = Request {
            action: Some(Action::Image),
            ..Request::default()
        };
        let response = dispatch(&trigger, &image).await.unwrap();
        assert!(response.error.is_some());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let value = serde_json::to_value(Response::status("idle")).unwrap();
        assert_eq!(value, json!({"status": "idle", "execution_time_ms": 0}));
    }
}
