//! The event log: a single-writer queue feeding both sinks.
//!
//! `log()` never blocks and never fails the caller. A dedicated writer thread
//! drains the queue every second or every 128 events, whichever comes first,
//! into the Parquet columnar sink and the per-session JSONL sink. Sink errors
//! go to `<log_dir>/events.err`, not to producers.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use rvbbit_core::Result;

use crate::columnar::{query_columnar, ColumnarFilter, ColumnarSink};
use crate::event::Event;
use crate::jsonl::{query_session, JsonlSink};

/// Tuning knobs for the log.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub dir: PathBuf,
    pub queue_capacity: usize,
    pub drain_batch: usize,
    pub drain_interval: Duration,
    pub roll_rows: usize,
    pub roll_age: Duration,
}

impl EventLogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            queue_capacity: 4096,
            drain_batch: 128,
            drain_interval: Duration::from_secs(1),
            roll_rows: 100_000,
            roll_age: Duration::from_secs(24 * 3600),
        }
    }
}

enum Control {
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct QueueState {
    queue: VecDeque<Event>,
    control: Vec<Control>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
    dropped: AtomicU64,
    capacity: usize,
    drain_batch: usize,
}

/// Handle to the process-wide event log. Cheap to clone.
#[derive(Clone)]
pub struct EventLog {
    shared: Arc<Shared>,
    dir: PathBuf,
}

impl EventLog {
    /// Start the writer thread and return a handle.
    pub fn start(config: EventLogConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(config.queue_capacity),
                control: Vec::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            dropped: AtomicU64::new(0),
            capacity: config.queue_capacity,
            drain_batch: config.drain_batch,
        });

        let worker_shared = shared.clone();
        let worker_config = config.clone();
        std::thread::Builder::new()
            .name("rvbbit-event-writer".into())
            .spawn(move || writer_loop(worker_shared, worker_config))?;

        Ok(Self {
            shared,
            dir: config.dir,
        })
    }

    /// Append an event. Non-blocking; on overflow the oldest non-critical
    /// queued event is dropped (error events are never dropped).
    pub fn log(&self, event: Event) {
        let mut st = self.shared.state.lock();
        if st.closed {
            return;
        }
        if st.queue.len() >= self.shared.capacity {
            let victim = st.queue.iter().position(|e| !e.is_critical());
            match victim {
                Some(i) => {
                    st.queue.remove(i);
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                }
                None if !event.is_critical() => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                None => {
                    // Queue full of errors and the incoming event is an
                    // error too: grow past capacity rather than lose it.
                }
            }
        }
        let should_wake = st.queue.len() + 1 >= self.shared.drain_batch;
        st.queue.push_back(event);
        drop(st);
        if should_wake {
            self.shared.cond.notify_one();
        }
    }

    /// Wait until every previously logged event is durable in both sinks.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.control.push(Control::Flush(tx));
        }
        self.shared.cond.notify_one();
        let _ = rx.await;
    }

    /// Flush both sinks and close the columnar file (writes its footer).
    /// The log accepts no events afterwards.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.control.push(Control::Close(tx));
        }
        self.shared.cond.notify_one();
        let _ = rx.await;
    }

    /// Events dropped by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// All events of one session, from the JSONL sink.
    pub fn query_session(&self, session_id: &str) -> Result<Vec<Event>> {
        query_session(&self.dir, session_id)
    }

    /// Predicate scan over the columnar sink. Only sees rows in closed or
    /// flushed row groups; call [`EventLog::close`] first for a full view.
    pub fn query_columnar(&self, filter: &ColumnarFilter) -> Result<Vec<Event>> {
        query_columnar(&self.dir, filter)
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

fn writer_loop(shared: Arc<Shared>, config: EventLogConfig) {
    let mut jsonl = match JsonlSink::new(config.dir.join("echoes_jsonl")) {
        Ok(s) => Some(s),
        Err(e) => {
            log_sink_error(&config.dir, &format!("jsonl sink init failed: {e}"));
            None
        }
    };
    let mut columnar =
        match ColumnarSink::new(config.dir.join("echoes"), config.roll_rows, config.roll_age) {
            Ok(s) => Some(s),
            Err(e) => {
                log_sink_error(&config.dir, &format!("columnar sink init failed: {e}"));
                None
            }
        };

    loop {
        let (events, controls, closed) = {
            let mut st = shared.state.lock();
            if st.queue.is_empty() && st.control.is_empty() && !st.closed {
                let _ = shared.cond.wait_for(&mut st, config.drain_interval);
            }
            let events: Vec<Event> = st.queue.drain(..).collect();
            let controls: Vec<Control> = st.control.drain(..).collect();
            (events, controls, st.closed)
        };

        if !events.is_empty() {
            if let Some(sink) = jsonl.as_mut() {
                for event in &events {
                    if let Err(e) = sink.write(event) {
                        log_sink_error(&config.dir, &format!("jsonl write failed: {e}"));
                    }
                }
            }
            if let Some(sink) = columnar.as_mut() {
                if let Err(e) = sink.write_batch(&events) {
                    log_sink_error(&config.dir, &format!("columnar write failed: {e}"));
                }
            }
        }

        let mut shutdown = false;
        for control in controls {
            match control {
                Control::Flush(ack) => {
                    if let Some(sink) = jsonl.as_mut() {
                        if let Err(e) = sink.flush() {
                            log_sink_error(&config.dir, &format!("jsonl flush failed: {e}"));
                        }
                    }
                    if let Some(sink) = columnar.as_mut() {
                        if let Err(e) = sink.flush() {
                            log_sink_error(&config.dir, &format!("columnar flush failed: {e}"));
                        }
                    }
                    let _ = ack.send(());
                }
                Control::Close(ack) => {
                    if let Some(sink) = jsonl.as_mut() {
                        let _ = sink.flush();
                    }
                    if let Some(sink) = columnar.as_mut() {
                        if let Err(e) = sink.close() {
                            log_sink_error(&config.dir, &format!("columnar close failed: {e}"));
                        }
                    }
                    let _ = ack.send(());
                    shutdown = true;
                }
            }
        }

        if shutdown {
            break;
        }
        if closed {
            // closed flag without a Close control: finish quietly
            if let Some(sink) = columnar.as_mut() {
                let _ = sink.close();
            }
            break;
        }
    }
}

fn log_sink_error(dir: &std::path::Path, message: &str) {
    tracing::warn!(target: "rvbbit_events", "{message}");
    if let Ok(mut f) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("events.err"))
    {
        let _ = writeln!(f, "{} {message}", chrono::Utc::now().to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeKind;

    fn test_config(dir: &std::path::Path) -> EventLogConfig {
        EventLogConfig {
            drain_interval: Duration::from_millis(50),
            ..EventLogConfig::new(dir)
        }
    }

    #[tokio::test]
    async fn log_flush_query_includes_event() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(test_config(tmp.path())).unwrap();

        let ev = Event::new(NodeKind::CascadeStart, "sess-1", "casc", "caller");
        let trace = ev.trace_id.clone();
        log.log(ev);
        log.flush().await;

        let events = log.query_session("sess-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trace_id, trace);
    }

    #[tokio::test]
    async fn session_id_constant_and_trace_ids_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(test_config(tmp.path())).unwrap();

        for i in 0..20 {
            log.log(
                Event::new(NodeKind::AgentMsg, "sess-2", "casc", "caller")
                    .with_content(serde_json::json!({ "i": i })),
            );
        }
        log.flush().await;

        let events = log.query_session("sess-2").unwrap();
        assert_eq!(events.len(), 20);
        assert!(events.iter().all(|e| e.session_id == "sess-2"));
        let traces: std::collections::HashSet<_> =
            events.iter().map(|e| e.trace_id.clone()).collect();
        assert_eq!(traces.len(), 20);
    }

    #[tokio::test]
    async fn parent_chain_points_backwards() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(test_config(tmp.path())).unwrap();

        let parent = Event::new(NodeKind::CellStart, "sess-3", "casc", "caller");
        let parent_trace = parent.trace_id.clone();
        let child = Event::new(NodeKind::AgentMsg, "sess-3", "casc", "caller")
            .with_parent(parent_trace.clone());
        log.log(parent);
        log.log(child);
        log.flush().await;

        let events = log.query_session("sess-3").unwrap();
        let child = events
            .iter()
            .find(|e| e.parent_trace_id.is_some())
            .unwrap();
        let referenced = child.parent_trace_id.clone().unwrap();
        assert!(events.iter().any(|e| e.trace_id == referenced));
    }

    #[tokio::test]
    async fn overflow_drops_non_critical_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.queue_capacity = 4;
        // Keep the writer asleep so the queue actually fills.
        config.drain_interval = Duration::from_secs(30);
        config.drain_batch = 1000;
        let log = EventLog::start(config).unwrap();

        for _ in 0..4 {
            log.log(Event::new(NodeKind::AgentMsg, "s", "c", "x"));
        }
        log.log(Event::new(NodeKind::Error, "s", "c", "x"));
        log.log(Event::new(NodeKind::Error, "s", "c", "x"));
        assert_eq!(log.dropped(), 2);

        log.flush().await;
        let events = log.query_session("s").unwrap();
        let errors = events
            .iter()
            .filter(|e| e.node_kind == NodeKind::Error)
            .count();
        assert_eq!(errors, 2, "error events must survive overflow");
    }

    #[tokio::test]
    async fn close_finalizes_columnar_files() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::start(test_config(tmp.path())).unwrap();

        log.log(Event::new(NodeKind::CascadeComplete, "sess-4", "casc", "caller"));
        log.close().await;

        let rows = log
            .query_columnar(&ColumnarFilter {
                session_id: Some("sess-4".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);

        // Logging after close is a no-op, not a panic.
        log.log(Event::new(NodeKind::AgentMsg, "sess-4", "casc", "caller"));
    }
}
