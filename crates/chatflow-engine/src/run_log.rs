use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use chatflow_core::event::EventBus;
use chatflow_core::types::{FlowEvent, PairKey};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{yyyymmdd}.jsonl`, flushing after every line so a crash never
/// loses what was already written. `level` controls verbosity:
/// 1 = run summary and incidents, 2 = plus suspensions, handoffs and
/// integration calls, 3 = plus every node entered.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    flow_id: String,
    contact: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(pair: &PairKey, event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            flow_id: pair.flow_id.to_string(),
            contact: pair.contact_id.to_string(),
            event_type,
            node_id: None,
            detail: None,
        }
    }

    fn node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

struct DailyFile {
    day: String,
    writer: BufWriter<tokio::fs::File>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self {
            log_dir,
            level: level.clamp(1, 3),
        }
    }

    /// Subscribe now and log in the background until cancelled or the bus closes.
    pub fn spawn(self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    pub async fn run(self, mut rx: broadcast::Receiver<FlowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut file: Option<DailyFile> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            let Ok(json) = serde_json::to_string(&entry) else {
                                continue;
                            };
                            if let Err(e) = self.append(&mut file, &json).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(mut f) = file {
            f.writer.flush().await.ok();
        }
    }

    /// Append a line, switching files when the date rolls over.
    async fn append(&self, file: &mut Option<DailyFile>, json: &str) -> std::io::Result<()> {
        let today = Utc::now().format("%Y%m%d").to_string();
        if file.as_ref().map(|f| f.day != today).unwrap_or(true) {
            if let Some(mut old) = file.take() {
                old.writer.flush().await?;
            }
            let writer = open_day(&self.log_dir, &today).await?;
            *file = Some(DailyFile { day: today, writer });
        }
        if let Some(f) = file.as_mut() {
            f.writer.write_all(json.as_bytes()).await?;
            f.writer.write_all(b"\n").await?;
            f.writer.flush().await?;
        }
        Ok(())
    }

    /// Convert a FlowEvent to a log entry (None when filtered by level).
    fn event_to_entry(&self, event: &FlowEvent) -> Option<LogEntry> {
        match event {
            // L1: run summary and incidents
            FlowEvent::RunStarted { pair, flow_version } => Some(
                LogEntry::new(pair, "run_started").detail(serde_json::json!({ "version": flow_version })),
            ),
            FlowEvent::RunCompleted { pair, steps } => {
                Some(LogEntry::new(pair, "run_completed").detail(serde_json::json!({ "steps": steps })))
            }
            FlowEvent::RunFailed {
                pair,
                node_id,
                reason,
                fatal_state,
            } => {
                let mut entry = LogEntry::new(pair, "run_failed").detail(serde_json::json!({
                    "reason": reason,
                    "fatal_state": fatal_state,
                }));
                entry.node_id = node_id.clone();
                Some(entry)
            }
            FlowEvent::FlowSwitched { from, to } => {
                Some(LogEntry::new(from, "flow_switched").detail(serde_json::json!({ "to": to.0 })))
            }

            // L2
            FlowEvent::Suspended { pair, node_id } if self.level >= 2 => {
                Some(LogEntry::new(pair, "suspended").node(node_id))
            }
            FlowEvent::Handoff { pair, target } if self.level >= 2 => Some(
                LogEntry::new(pair, "handoff").detail(serde_json::json!({ "target": target.to_string() })),
            ),
            FlowEvent::IntegrationCalled {
                pair,
                node_id,
                kind,
                succeeded,
                elapsed_ms,
            } if self.level >= 2 => Some(LogEntry::new(pair, "integration_called").node(node_id).detail(
                serde_json::json!({
                    "kind": kind,
                    "succeeded": succeeded,
                    "elapsed_ms": elapsed_ms,
                }),
            )),
            FlowEvent::RenderWarning { pair, node_id, token } if self.level >= 2 => Some(
                LogEntry::new(pair, "render_warning")
                    .node(node_id)
                    .detail(serde_json::json!({ "token": token })),
            ),

            // L3
            FlowEvent::NodeEntered { pair, node_id, kind } if self.level >= 3 => Some(
                LogEntry::new(pair, "node_entered")
                    .node(node_id)
                    .detail(serde_json::json!({ "kind": kind })),
            ),

            _ => None,
        }
    }
}

async fn open_day(dir: &Path, day: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    let path = dir.join(format!("{}.jsonl", day));
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    debug!(path = %path.display(), "Opened run log");
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::types::{ContactId, FlowId, HandoffTarget};

    fn pair() -> PairKey {
        PairKey::new(FlowId::from_str("welcome"), ContactId::from_str("c1"))
    }

    #[test]
    fn test_event_level_filtering() {
        let entered = FlowEvent::NodeEntered {
            pair: pair(),
            node_id: "menu".into(),
            kind: "menu",
        };
        let suspended = FlowEvent::Suspended {
            pair: pair(),
            node_id: "menu".into(),
        };
        let started = FlowEvent::RunStarted {
            pair: pair(),
            flow_version: 3,
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&started).is_some());
        assert!(l1.event_to_entry(&suspended).is_none());
        assert!(l1.event_to_entry(&entered).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&suspended).is_some());
        assert!(l2.event_to_entry(&entered).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&entered).is_some());
    }

    #[test]
    fn test_entry_shape() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger
            .event_to_entry(&FlowEvent::Handoff {
                pair: pair(),
                target: HandoffTarget::Queue("sales".into()),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"handoff\""));
        assert!(json.contains("queue:sales"));
        assert!(!json.contains("node_id"));
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_bus_closes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let handle = RunLogger::new(dir.path().to_path_buf(), 1).spawn(&bus, CancellationToken::new());

        bus.publish(FlowEvent::RunStarted {
            pair: pair(),
            flow_version: 1,
        });
        bus.publish(FlowEvent::Suspended {
            pair: pair(),
            node_id: "menu".into(),
        });
        bus.publish(FlowEvent::RunFailed {
            pair: pair(),
            node_id: Some("hook".into()),
            reason: "HTTP 500".into(),
            fatal_state: false,
        });
        drop(bus);
        handle.await.unwrap();

        let day = Utc::now().format("%Y%m%d").to_string();
        let content = std::fs::read_to_string(dir.path().join(format!("{}.jsonl", day))).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "run_started");
        assert_eq!(lines[1]["node_id"], "hook");
        assert_eq!(lines[1]["detail"]["fatal_state"], false);
    }
}
