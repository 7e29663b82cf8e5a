//! [`DetectionReporter`] – forwards finished cycles to the dashboard backend.
//!
//! Subscribes to [`Topic::Decisions`][sortline_middleware::Topic::Decisions] and POSTs one detection record per cycle
//! that sent a command to the backend's `/detections` endpoint.  Reporting is
//! best effort: failures are logged and never reach the belt.

use std::time::Duration;

use serde::Serialize;
use sortline_middleware::TopicReceiver;
use sortline_types::{ActuatorCommand, CycleOutcome, EventPayload, SortError};
use tracing::{debug, info, warn};

/// Body of `POST /detections`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
    #[serde(rename = "type")]
    pub kind: String,
    /// `A`, `B`, or `UNCLASSIFIED`.
    pub category: String,
    pub confidence: f64,
    pub status: String,
}

impl DetectionReport {
    /// Build the record for `outcome`, or `None` when the cycle sent nothing.
    pub fn from_outcome(outcome: &CycleOutcome) -> Option<Self> {
        let command = outcome.command()?;
        let (kind, confidence) = match outcome {
            CycleOutcome::Routed {
                label, confidence, ..
            }
            | CycleOutcome::Unmatched { label, confidence } => (label.clone(), confidence.unwrap_or(0.0)),
            CycleOutcome::Malformed { .. } => ("malformed".to_string(), 0.0),
            CycleOutcome::TimedOut { .. } | CycleOutcome::QueueOffline { .. } => {
                ("unknown".to_string(), 0.0)
            }
        };
        let category = match command {
            ActuatorCommand::RouteLeft => "A",
            ActuatorCommand::RouteRight => "B",
            ActuatorCommand::PassThrough => "UNCLASSIFIED",
        };
        Some(Self {
            kind,
            category: category.to_string(),
            confidence,
            status: command.name().to_string(),
        })
    }
}

/// HTTP sink for detection records.
pub struct DetectionReporter {
    client: reqwest::Client,
    url: String,
}

impl DetectionReporter {
    /// Build a reporter posting to `url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Report`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SortError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SortError::Report(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one record.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Report`] on transport failure or a non-2xx reply.
    pub async fn report(&self, report: &DetectionReport) -> Result<(), SortError> {
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|e| SortError::Report(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SortError::Report(format!("backend replied {status}")));
        }
        debug!(kind = %report.kind, category = %report.category, "detection reported");
        Ok(())
    }

    /// Report every finished cycle received on `decisions` until the bus
    /// closes.
    pub async fn run(self, mut decisions: TopicReceiver) {
        info!(url = %self.url, "detection reporter started");
        while let Some(event) = decisions.next_event().await {
            let EventPayload::CycleCompleted { cycle, outcome, .. } = event.payload else {
                continue;
            };
            let Some(report) = DetectionReport::from_outcome(&outcome) else {
                continue;
            };
            if let Err(e) = self.report(&report).await {
                warn!(cycle, error = %e, "detection report failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sortline_middleware::{EventBus, Topic};
    use sortline_types::Event;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn routed_outcome_maps_to_category() {
        let report = DetectionReport::from_outcome(&CycleOutcome::Routed {
            label: "plastic_cap_v2".into(),
            command: ActuatorCommand::RouteLeft,
            confidence: Some(0.93),
        })
        .unwrap();
        assert_eq!(
            report,
            DetectionReport {
                kind: "plastic_cap_v2".into(),
                category: "A".into(),
                confidence: 0.93,
                status: "route-left".into(),
            }
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "plastic_cap_v2");
    }

    #[test]
    fn fail_safe_outcomes_are_unclassified() {
        let timed_out = DetectionReport::from_outcome(&CycleOutcome::TimedOut { attempts: 40 }).unwrap();
        assert_eq!(timed_out.category, "UNCLASSIFIED");
        assert_eq!(timed_out.status, "pass-through");

        let offline = CycleOutcome::QueueOffline {
            pass_through_sent: false,
        };
        assert!(DetectionReport::from_outcome(&offline).is_none());
    }

    /// Accept HTTP requests on a loopback port, forward each body, and reply
    /// `status`.
    async fn fake_backend(status: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let body = loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break String::new();
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&buf).to_string();
                    if let Some((head, body)) = text.split_once("\r\n\r\n") {
                        let len = head
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if body.len() >= len {
                            break body.to_string();
                        }
                    }
                };
                let reply = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = tx.send(body).await;
            }
        });
        (format!("http://{addr}/detections"), rx)
    }

    #[tokio::test]
    async fn report_posts_json_body() {
        let (url, mut bodies) = fake_backend("201 Created").await;
        let reporter = DetectionReporter::new(url, Duration::from_secs(2)).unwrap();
        let report = DetectionReport::from_outcome(&CycleOutcome::Routed {
            label: "metal".into(),
            command: ActuatorCommand::RouteRight,
            confidence: None,
        })
        .unwrap();

        reporter.report(&report).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&bodies.recv().await.unwrap()).unwrap();
        assert_eq!(body["type"], "metal");
        assert_eq!(body["category"], "B");
        assert_eq!(body["status"], "route-right");
    }

    #[tokio::test]
    async fn non_success_reply_is_report_error() {
        let (url, _bodies) = fake_backend("500 Internal Server Error").await;
        let reporter = DetectionReporter::new(url, Duration::from_secs(2)).unwrap();
        let report = DetectionReport::from_outcome(&CycleOutcome::TimedOut { attempts: 1 }).unwrap();
        let err = reporter.report(&report).await.unwrap_err();
        assert!(matches!(err, SortError::Report(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn run_forwards_bus_decisions() {
        let (url, mut bodies) = fake_backend("201 Created").await;
        let bus = Arc::new(EventBus::default());
        let reporter = DetectionReporter::new(url, Duration::from_secs(2)).unwrap();
        let task = tokio::spawn(reporter.run(bus.subscribe_to(Topic::Decisions)));

        bus.publish_to(
            Topic::Decisions,
            Event::new(
                "test",
                EventPayload::CycleCompleted {
                    cycle: 1,
                    outcome: CycleOutcome::Malformed {
                        reason: "expected value".into(),
                    },
                    elapsed_ms: 3,
                },
            ),
        )
        .unwrap();

        let body: serde_json::Value = serde_json::from_str(&bodies.recv().await.unwrap()).unwrap();
        assert_eq!(body["type"], "malformed");
        assert_eq!(body["category"], "UNCLASSIFIED");
        task.abort();
    }
}
