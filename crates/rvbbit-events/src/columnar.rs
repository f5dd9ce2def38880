//! Columnar sink: rolled Parquet files under `<log_dir>/echoes/`.
//!
//! Key columns are materialized for predicate scans; the full event is kept
//! in a `json` column so rows round-trip losslessly.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use rvbbit_core::{Error, Result};

use crate::event::Event;

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("timestamp_ms", DataType::Int64, false),
        Field::new("session_id", DataType::Utf8, false),
        Field::new("trace_id", DataType::Utf8, false),
        Field::new("parent_trace_id", DataType::Utf8, true),
        Field::new("caller_id", DataType::Utf8, false),
        Field::new("node_kind", DataType::Utf8, false),
        Field::new("cell_name", DataType::Utf8, false),
        Field::new("cascade_id", DataType::Utf8, false),
        Field::new("depth", DataType::UInt32, false),
        Field::new("duration_ms", DataType::Int64, true),
        Field::new("tokens_in", DataType::Int64, true),
        Field::new("tokens_out", DataType::Int64, true),
        Field::new("cost", DataType::Float64, true),
        Field::new("is_winner", DataType::Boolean, true),
        Field::new("json", DataType::Utf8, false),
    ]))
}

pub(crate) struct ColumnarSink {
    dir: PathBuf,
    roll_rows: usize,
    roll_age: Duration,
    schema: Arc<Schema>,
    writer: Option<ArrowWriter<File>>,
    rows_in_file: usize,
    opened_at: Instant,
}

impl ColumnarSink {
    pub fn new(dir: impl Into<PathBuf>, roll_rows: usize, roll_age: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            roll_rows,
            roll_age,
            schema: schema(),
            writer: None,
            rows_in_file: 0,
            opened_at: Instant::now(),
        })
    }

    pub fn write_batch(&mut self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = self.to_batch(events)?;

        if self.writer.is_none() {
            self.open_file()?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write(&batch)
                .map_err(|e| Error::Other(format!("parquet write: {e}")))?;
        }
        self.rows_in_file += events.len();

        if self.rows_in_file >= self.roll_rows || self.opened_at.elapsed() >= self.roll_age {
            self.roll()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| Error::Other(format!("parquet flush: {e}")))?;
        }
        Ok(())
    }

    /// Close the current file (writes the Parquet footer).
    pub fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .close()
                .map_err(|e| Error::Other(format!("parquet close: {e}")))?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        self.close()?;
        self.rows_in_file = 0;
        Ok(())
    }

    fn open_file(&mut self) -> Result<()> {
        let name = format!("events-{}.parquet", rvbbit_core::ids::new_trace_id());
        let file = File::create(self.dir.join(name))?;
        let writer = ArrowWriter::try_new(file, self.schema.clone(), None)
            .map_err(|e| Error::Other(format!("parquet open: {e}")))?;
        self.writer = Some(writer);
        self.rows_in_file = 0;
        self.opened_at = Instant::now();
        Ok(())
    }

    fn to_batch(&self, events: &[Event]) -> Result<RecordBatch> {
        let timestamp_ms: Int64Array = events
            .iter()
            .map(|e| Some(e.timestamp.timestamp_millis()))
            .collect();
        let session_id: StringArray = events.iter().map(|e| Some(e.session_id.as_str())).collect();
        let trace_id: StringArray = events.iter().map(|e| Some(e.trace_id.as_str())).collect();
        let parent_trace_id: StringArray = events
            .iter()
            .map(|e| e.parent_trace_id.as_deref())
            .collect();
        let caller_id: StringArray = events.iter().map(|e| Some(e.caller_id.as_str())).collect();
        let node_kind: StringArray = events
            .iter()
            .map(|e| Some(e.node_kind.as_str()))
            .collect();
        let cell_name: StringArray = events.iter().map(|e| Some(e.cell_name.as_str())).collect();
        let cascade_id: StringArray = events.iter().map(|e| Some(e.cascade_id.as_str())).collect();
        let depth: UInt32Array = events.iter().map(|e| Some(e.depth)).collect();
        let duration_ms: Int64Array = events
            .iter()
            .map(|e| e.duration_ms.map(|v| v as i64))
            .collect();
        let tokens_in: Int64Array = events
            .iter()
            .map(|e| e.tokens_in.map(|v| v as i64))
            .collect();
        let tokens_out: Int64Array = events
            .iter()
            .map(|e| e.tokens_out.map(|v| v as i64))
            .collect();
        let cost: Float64Array = events.iter().map(|e| e.cost).collect();
        let is_winner: BooleanArray = events.iter().map(|e| e.is_winner).collect();
        let json: StringArray = events
            .iter()
            .map(|e| serde_json::to_string(e).ok())
            .collect();

        RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(timestamp_ms) as ArrayRef,
                Arc::new(session_id),
                Arc::new(trace_id),
                Arc::new(parent_trace_id),
                Arc::new(caller_id),
                Arc::new(node_kind),
                Arc::new(cell_name),
                Arc::new(cascade_id),
                Arc::new(depth),
                Arc::new(duration_ms),
                Arc::new(tokens_in),
                Arc::new(tokens_out),
                Arc::new(cost),
                Arc::new(is_winner),
                Arc::new(json),
            ],
        )
        .map_err(|e| Error::Other(format!("arrow batch: {e}")))
    }
}

/// Predicate over the columnar sink. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ColumnarFilter {
    pub session_id: Option<String>,
    pub caller_id: Option<String>,
    pub node_kind: Option<String>,
    pub cascade_id: Option<String>,
    pub since_ms: Option<i64>,
    pub limit: Option<usize>,
}

impl ColumnarFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(s) = &self.session_id {
            if &event.session_id != s {
                return false;
            }
        }
        if let Some(c) = &self.caller_id {
            if &event.caller_id != c {
                return false;
            }
        }
        if let Some(k) = &self.node_kind {
            if event.node_kind.as_str() != k {
                return false;
            }
        }
        if let Some(c) = &self.cascade_id {
            if &event.cascade_id != c {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if event.timestamp.timestamp_millis() < since {
                return false;
            }
        }
        true
    }
}

/// Scan the rolled Parquet files under `<log_dir>/echoes/`.
pub fn query_columnar(log_dir: &Path, filter: &ColumnarFilter) -> Result<Vec<Event>> {
    let dir = log_dir.join("echoes");
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(&dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "parquet").unwrap_or(false))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    paths.sort();

    let mut out = Vec::new();
    'files: for path in paths {
        let file = File::open(&path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::Other(format!("parquet read {}: {e}", path.display())))?
            .build()
            .map_err(|e| Error::Other(format!("parquet read {}: {e}", path.display())))?;
        for batch in reader {
            let batch = batch.map_err(|e| Error::Other(format!("parquet batch: {e}")))?;
            let json_col = batch
                .column_by_name("json")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| Error::Other("columnar file missing json column".into()))?;
            for i in 0..json_col.len() {
                if json_col.is_null(i) {
                    continue;
                }
                let event: Event = serde_json::from_str(json_col.value(i))?;
                if filter.matches(&event) {
                    out.push(event);
                    if let Some(limit) = filter.limit {
                        if out.len() >= limit {
                            break 'files;
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NodeKind;

    #[test]
    fn parquet_round_trip_with_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("echoes");
        let mut sink = ColumnarSink::new(&dir, 100_000, Duration::from_secs(86_400)).unwrap();

        let mut events = Vec::new();
        for i in 0..10 {
            let session = if i % 2 == 0 { "sess-even" } else { "sess-odd" };
            events.push(
                Event::new(NodeKind::CellComplete, session, "casc", "caller-x")
                    .with_cell(format!("cell{i}")),
            );
        }
        sink.write_batch(&events).unwrap();
        sink.close().unwrap();

        let all = query_columnar(tmp.path(), &ColumnarFilter::default()).unwrap();
        assert_eq!(all.len(), 10);

        let filter = ColumnarFilter {
            session_id: Some("sess-even".into()),
            ..Default::default()
        };
        let even = query_columnar(tmp.path(), &filter).unwrap();
        assert_eq!(even.len(), 5);
        assert!(even.iter().all(|e| e.session_id == "sess-even"));
    }

    #[test]
    fn rolls_at_row_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("echoes");
        let mut sink = ColumnarSink::new(&dir, 5, Duration::from_secs(86_400)).unwrap();

        for _ in 0..3 {
            let events: Vec<Event> = (0..3)
                .map(|_| Event::new(NodeKind::AgentMsg, "s", "c", "x"))
                .collect();
            sink.write_batch(&events).unwrap();
        }
        sink.close().unwrap();

        let files = std::fs::read_dir(&dir).unwrap().count();
        assert!(files >= 2, "expected a roll after 5 rows, saw {files} file(s)");

        let all = query_columnar(tmp.path(), &ColumnarFilter::default()).unwrap();
        assert_eq!(all.len(), 9);
    }

    #[test]
    fn empty_dir_queries_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let all = query_columnar(tmp.path(), &ColumnarFilter::default()).unwrap();
        assert!(all.is_empty());
    }
}
