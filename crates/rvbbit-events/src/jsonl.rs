//! Per-session JSONL sink: one newline-delimited JSON file per session under
//! `<log_dir>/echoes_jsonl/`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use rvbbit_core::{Error, Result};

use crate::event::Event;

/// How many session files stay open at once before the least recently used
/// handle is closed.
const MAX_OPEN_FILES: usize = 64;

pub(crate) struct JsonlSink {
    dir: PathBuf,
    /// session_id -> (file, last-use tick)
    open: HashMap<String, (File, u64)>,
    tick: u64,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            open: HashMap::new(),
            tick: 0,
        })
    }

    pub fn write(&mut self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        self.tick += 1;
        let tick = self.tick;

        if !self.open.contains_key(&event.session_id) {
            if self.open.len() >= MAX_OPEN_FILES {
                if let Some(oldest) = self
                    .open
                    .iter()
                    .min_by_key(|(_, (_, t))| *t)
                    .map(|(k, _)| k.clone())
                {
                    self.open.remove(&oldest);
                }
            }
            let path = session_path(&self.dir, &event.session_id);
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.open.insert(event.session_id.clone(), (file, tick));
        }

        let (file, last) = self
            .open
            .get_mut(&event.session_id)
            .ok_or_else(|| Error::Other("jsonl handle vanished".into()))?;
        *last = tick;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        for (file, _) in self.open.values_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn session_path(dir: &Path, session_id: &str) -> PathBuf {
    // Session ids are UUIDs/ULIDs; strip anything path-hostile anyway.
    let safe: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    dir.join(format!("{safe}.jsonl"))
}

/// Read back every event of one session, in append order.
pub fn query_session(log_dir: &Path, session_id: &str) -> Result<Vec<Event>> {
    let path = session_path(&log_dir.join("echoes_jsonl"), session_id);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeKind;

    #[test]
    fn write_and_query_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let jsonl_dir = tmp.path().join("echoes_jsonl");
        let mut sink = JsonlSink::new(&jsonl_dir).unwrap();

        for i in 0..3 {
            let ev = Event::new(NodeKind::AgentMsg, "sess-a", "casc", "caller")
                .with_content(serde_json::json!({ "i": i }));
            sink.write(&ev).unwrap();
        }
        sink.write(&Event::new(NodeKind::AgentMsg, "sess-b", "casc", "caller"))
            .unwrap();
        sink.flush().unwrap();

        let a = query_session(tmp.path(), "sess-a").unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[2].content["i"], 2);
        let b = query_session(tmp.path(), "sess-b").unwrap();
        assert_eq!(b.len(), 1);
        assert!(query_session(tmp.path(), "missing").unwrap().is_empty());
    }
}
