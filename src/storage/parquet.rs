//! Parquet capture with buffered writers and file rotation

use super::Persistence;
use crate::feed::{GreeksSnapshot, Trade};
use crate::filter::VolatilityEvent;
use crate::surface::SurfaceFit;
use crate::tracker::ChainSnapshot;
use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

fn ts_field() -> Field {
    Field::new(
        "timestamp",
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    )
}

/// Raw trades: prices kept as strings to preserve Decimal precision
fn trade_schema() -> Schema {
    Schema::new(vec![
        ts_field(),
        Field::new("instrument", DataType::Utf8, false),
        Field::new("price", DataType::Utf8, false),
        Field::new("amount", DataType::Utf8, false),
        Field::new("direction", DataType::Utf8, false),
        Field::new("trade_id", DataType::Utf8, false),
        Field::new("iv", DataType::Float64, true),
    ])
}

/// Greeks snapshots, the high-volume capture stream
fn greeks_schema() -> Schema {
    let f64_field = |name: &str| Field::new(name, DataType::Float64, false);
    Schema::new(vec![
        ts_field(),
        Field::new("instrument", DataType::Utf8, false),
        f64_field("mark_price"),
        f64_field("mark_iv"),
        f64_field("underlying_price"),
        f64_field("delta"),
        f64_field("gamma"),
        f64_field("vega"),
        f64_field("theta"),
        f64_field("rho"),
        Field::new("bid_iv", DataType::Float64, true),
        Field::new("ask_iv", DataType::Float64, true),
        f64_field("open_interest"),
        f64_field("volume"),
    ])
}

/// Low-volume derived artifacts (volatility events, chain snapshots,
/// surface fits) share one schema with a JSON payload column
fn event_schema() -> Schema {
    Schema::new(vec![
        ts_field(),
        Field::new("kind", DataType::Utf8, false),
        Field::new("instrument", DataType::Utf8, true),
        Field::new("payload", DataType::Utf8, false),
    ])
}

/// Row for the shared event schema
#[derive(Debug, Clone)]
struct EventRow {
    timestamp_ms: i64,
    kind: &'static str,
    instrument: Option<String>,
    payload: String,
}

/// Writes one record stream to rotating Parquet files
struct ParquetWriter {
    output_dir: PathBuf,
    prefix: &'static str,
    seq: u64,
}

impl ParquetWriter {
    fn new(output_dir: PathBuf, prefix: &'static str) -> Self {
        Self {
            output_dir,
            prefix,
            seq: 0,
        }
    }

    /// Next file path; the sequence number keeps same-second flushes
    /// from colliding
    fn next_path(&mut self) -> PathBuf {
        let filename = format!(
            "{}_{}_{:05}.parquet",
            self.prefix,
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.seq
        );
        self.seq += 1;
        self.output_dir.join(filename)
    }

    fn write_batch(&mut self, schema: Arc<Schema>, columns: Vec<ArrayRef>) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.next_path();
        let file = File::create(&path)?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
        writer.write(&RecordBatch::try_new(schema, columns)?)?;
        writer.close()?;

        Ok(path)
    }
}

fn micros_column(rows: &[i64]) -> ArrayRef {
    let micros: Vec<i64> = rows.iter().map(|ms| ms * 1000).collect();
    Arc::new(TimestampMicrosecondArray::from(micros).with_timezone("UTC"))
}

fn write_trades(writer: &mut ParquetWriter, rows: &[Trade]) -> anyhow::Result<PathBuf> {
    let schema = Arc::new(trade_schema());
    let columns: Vec<ArrayRef> = vec![
        micros_column(&rows.iter().map(|t| t.timestamp_ms).collect::<Vec<_>>()),
        Arc::new(StringArray::from(
            rows.iter().map(|t| t.instrument.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|t| t.price.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|t| t.amount.to_string()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|t| format!("{:?}", t.direction).to_lowercase())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|t| t.trade_id.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|t| t.iv).collect::<Vec<_>>(),
        )),
    ];
    writer.write_batch(schema, columns)
}

fn write_greeks(writer: &mut ParquetWriter, rows: &[GreeksSnapshot]) -> anyhow::Result<PathBuf> {
    let schema = Arc::new(greeks_schema());
    let f64_col = |get: fn(&GreeksSnapshot) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(rows.iter().map(get).collect::<Vec<_>>()))
    };
    let columns: Vec<ArrayRef> = vec![
        micros_column(&rows.iter().map(|g| g.timestamp_ms).collect::<Vec<_>>()),
        Arc::new(StringArray::from(
            rows.iter().map(|g| g.instrument.as_str()).collect::<Vec<_>>(),
        )),
        f64_col(|g| g.mark_price),
        f64_col(|g| g.mark_iv),
        f64_col(|g| g.underlying_price),
        f64_col(|g| g.delta),
        f64_col(|g| g.gamma),
        f64_col(|g| g.vega),
        f64_col(|g| g.theta),
        f64_col(|g| g.rho),
        Arc::new(Float64Array::from(
            rows.iter().map(|g| g.bid_iv).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|g| g.ask_iv).collect::<Vec<_>>(),
        )),
        f64_col(|g| g.open_interest),
        f64_col(|g| g.volume),
    ];
    writer.write_batch(schema, columns)
}

fn write_events(writer: &mut ParquetWriter, rows: &[EventRow]) -> anyhow::Result<PathBuf> {
    let schema = Arc::new(event_schema());
    let columns: Vec<ArrayRef> = vec![
        micros_column(&rows.iter().map(|e| e.timestamp_ms).collect::<Vec<_>>()),
        Arc::new(StringArray::from(
            rows.iter().map(|e| e.kind).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|e| e.instrument.clone()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|e| e.payload.as_str()).collect::<Vec<_>>(),
        )),
    ];
    writer.write_batch(schema, columns)
}

/// Parquet capture configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub output_dir: PathBuf,
    /// Rows buffered before a flush
    pub buffer_size: usize,
    /// Maximum time between flushes
    pub flush_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data"),
            buffer_size: 1000,
            flush_interval_secs: 60,
        }
    }
}

/// Capture statistics
#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub rows_received: u64,
    pub rows_written: u64,
    pub files_written: u64,
    pub last_flush: Option<chrono::DateTime<Utc>>,
}

/// Parquet-backed persistence.
///
/// Each record kind gets its own buffered writer task; a full buffer
/// or the flush interval triggers a write, and dropping the store
/// flushes whatever remains.
pub struct ParquetStore {
    config: StoreConfig,
    trade_tx: mpsc::Sender<Trade>,
    greeks_tx: mpsc::Sender<GreeksSnapshot>,
    event_tx: mpsc::Sender<EventRow>,
    stats: Arc<RwLock<StoreStats>>,
}

impl ParquetStore {
    pub fn new(config: StoreConfig) -> Self {
        let (trade_tx, trade_rx) = mpsc::channel(10_000);
        let (greeks_tx, greeks_rx) = mpsc::channel(10_000);
        let (event_tx, event_rx) = mpsc::channel(10_000);
        let stats = Arc::new(RwLock::new(StoreStats::default()));

        let mut trade_writer = ParquetWriter::new(config.output_dir.clone(), "trades");
        tokio::spawn(Self::run_writer(
            trade_rx,
            config.clone(),
            stats.clone(),
            move |rows: &[Trade]| write_trades(&mut trade_writer, rows),
        ));

        let mut greeks_writer = ParquetWriter::new(config.output_dir.clone(), "greeks");
        tokio::spawn(Self::run_writer(
            greeks_rx,
            config.clone(),
            stats.clone(),
            move |rows: &[GreeksSnapshot]| write_greeks(&mut greeks_writer, rows),
        ));

        let mut event_writer = ParquetWriter::new(config.output_dir.clone(), "events");
        tokio::spawn(Self::run_writer(
            event_rx,
            config.clone(),
            stats.clone(),
            move |rows: &[EventRow]| write_events(&mut event_writer, rows),
        ));

        Self {
            config,
            trade_tx,
            greeks_tx,
            event_tx,
            stats,
        }
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.config.output_dir
    }

    pub async fn stats(&self) -> StoreStats {
        self.stats.read().await.clone()
    }

    /// Generic buffered writer loop: flush on full buffer, flush
    /// interval, or channel close
    async fn run_writer<R, F>(
        mut rx: mpsc::Receiver<R>,
        config: StoreConfig,
        stats: Arc<RwLock<StoreStats>>,
        mut flush: F,
    ) where
        R: Send + 'static,
        F: FnMut(&[R]) -> anyhow::Result<PathBuf> + Send + 'static,
    {
        let mut buffer: Vec<R> = Vec::with_capacity(config.buffer_size);
        let mut flush_timer = tokio::time::interval(tokio::time::Duration::from_secs(
            config.flush_interval_secs.max(1),
        ));
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush_timer.tick().await;

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Some(row) => {
                            stats.write().await.rows_received += 1;
                            buffer.push(row);
                            if buffer.len() >= config.buffer_size {
                                Self::flush_buffer(&mut buffer, &mut flush, &stats).await;
                            }
                        }
                        None => {
                            Self::flush_buffer(&mut buffer, &mut flush, &stats).await;
                            tracing::info!("Capture writer shutting down");
                            break;
                        }
                    }
                }

                _ = flush_timer.tick() => {
                    Self::flush_buffer(&mut buffer, &mut flush, &stats).await;
                }
            }
        }
    }

    async fn flush_buffer<R, F>(buffer: &mut Vec<R>, flush: &mut F, stats: &Arc<RwLock<StoreStats>>)
    where
        F: FnMut(&[R]) -> anyhow::Result<PathBuf>,
    {
        if buffer.is_empty() {
            return;
        }
        let count = buffer.len();
        match flush(buffer) {
            Ok(path) => {
                let mut s = stats.write().await;
                s.rows_written += count as u64;
                s.files_written += 1;
                s.last_flush = Some(Utc::now());
                tracing::debug!(count, path = ?path, "Flushed capture buffer");
            }
            Err(e) => {
                tracing::error!(error = %e, count, "Failed to flush capture buffer");
            }
        }
        buffer.clear();
    }

    async fn send_event(
        &self,
        timestamp_ms: i64,
        kind: &'static str,
        instrument: Option<String>,
        payload: impl serde::Serialize,
    ) -> anyhow::Result<()> {
        let row = EventRow {
            timestamp_ms,
            kind,
            instrument,
            payload: serde_json::to_string(&payload)?,
        };
        self.event_tx
            .send(row)
            .await
            .map_err(|_| anyhow::anyhow!("capture writer closed"))
    }
}

#[async_trait]
impl Persistence for ParquetStore {
    async fn insert_trade(&self, trade: &Trade) -> anyhow::Result<()> {
        self.trade_tx
            .send(trade.clone())
            .await
            .map_err(|_| anyhow::anyhow!("capture writer closed"))
    }

    async fn insert_volatility_event(&self, event: &VolatilityEvent) -> anyhow::Result<()> {
        self.send_event(
            event.timestamp_ms,
            "volatility_event",
            Some(event.instrument.clone()),
            event,
        )
        .await
    }

    async fn insert_greeks_snapshot(&self, snapshot: &GreeksSnapshot) -> anyhow::Result<()> {
        self.greeks_tx
            .send(snapshot.clone())
            .await
            .map_err(|_| anyhow::anyhow!("capture writer closed"))
    }

    async fn insert_chain_snapshot(&self, snapshot: &ChainSnapshot) -> anyhow::Result<()> {
        self.send_event(snapshot.timestamp_ms, "chain_snapshot", None, snapshot)
            .await
    }

    async fn insert_surface_fit(&self, fit: &SurfaceFit) -> anyhow::Result<()> {
        self.send_event(fit.timestamp_ms, "surface_fit", None, fit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Direction;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn trade() -> Trade {
        Trade {
            timestamp_ms: 1_700_000_000_000,
            instrument: "BTC-PERPETUAL".to_string(),
            price: dec!(42500.5),
            amount: dec!(0.1),
            direction: Direction::Buy,
            trade_id: "t-1".to_string(),
            iv: None,
        }
    }

    fn store(dir: &TempDir) -> ParquetStore {
        ParquetStore::new(StoreConfig {
            output_dir: dir.path().to_path_buf(),
            buffer_size: 1, // flush immediately
            flush_interval_secs: 1,
        })
    }

    #[tokio::test]
    async fn test_trade_capture_writes_a_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.insert_trade(&trade()).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stats = store.stats().await;
        assert_eq!(stats.rows_received, 1);
        assert_eq!(stats.rows_written, 1);
        assert!(stats.files_written >= 1);

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(!files.is_empty());
    }

    #[tokio::test]
    async fn test_volatility_event_capture() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let event = VolatilityEvent {
            timestamp_ms: 1_700_000_000_000,
            instrument: "BTC-PERPETUAL".to_string(),
            price: "42500.5".to_string(),
            volatility: 0.02,
            threshold: 0.01,
            window_size: 100,
            ar_lag: 1,
            excess_ratio: 2.0,
        };
        store.insert_volatility_event(&event).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stats = store.stats().await;
        assert_eq!(stats.rows_written, 1);
    }

    #[tokio::test]
    async fn test_null_store_accepts_everything() {
        let store = super::super::NullStore;
        store.insert_trade(&trade()).await.unwrap();
    }

    #[test]
    fn test_writer_paths_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let mut writer = ParquetWriter::new(dir.path().to_path_buf(), "trades");
        let a = writer.next_path();
        let b = writer.next_path();
        assert_ne!(a, b);
    }
}
