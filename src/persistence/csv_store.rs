//! CSV-backed lifecycle store: one folder per record kind, one file per day

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

use super::{
    GenerationRow, HypothesisRecord, LifecycleStore, PatternRecord, PositionRecord,
    RiskEventRecord, TrialRecord,
};

type CsvWriter = Arc<AsyncRwLock<csv::Writer<std::fs::File>>>;

const FOLDERS: [&str; 6] = [
    "hypotheses",
    "trials",
    "patterns",
    "positions",
    "generations",
    "risk_events",
];

/// CSV persistence manager
pub struct CsvPersistence {
    data_dir: PathBuf,
    hypothesis_writer: CsvWriter,
    trial_writer: CsvWriter,
    pattern_writer: CsvWriter,
    position_writer: CsvWriter,
    generation_writer: CsvWriter,
    risk_event_writer: CsvWriter,
}

impl CsvPersistence {
    /// Create a new CSV persistence manager
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);

        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        for folder in FOLDERS {
            fs::create_dir_all(data_dir.join(folder))
                .with_context(|| format!("Failed creating {} folder", folder))?;
        }

        let today = Utc::now().format("%Y-%m-%d");
        let open = |folder: &str| -> Result<CsvWriter> {
            let writer =
                Self::create_writer(&data_dir.join(folder), &format!("{}_{}.csv", folder, today))?;
            Ok(Arc::new(AsyncRwLock::new(writer)))
        };

        let store = Self {
            hypothesis_writer: open("hypotheses")?,
            trial_writer: open("trials")?,
            pattern_writer: open("patterns")?,
            position_writer: open("positions")?,
            generation_writer: open("generations")?,
            risk_event_writer: open("risk_events")?,
            data_dir,
        };
        info!(data_dir = %store.data_dir.display(), "💾 CSV persistence ready");
        Ok(store)
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    async fn append<T: Serialize + Send + Sync>(
        writer: &CsvWriter,
        record: &T,
        kind: &str,
    ) -> Result<()> {
        let mut writer = writer.write().await;
        writer
            .serialize(record)
            .with_context(|| format!("Failed to write {} record", kind))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {} writer", kind))?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Load every generation row on disk, oldest first
    pub fn load_generation_history(&self) -> Result<Vec<GenerationRow>> {
        let dir = self.data_dir.join("generations");
        let mut records = Vec::new();

        for entry in
            fs::read_dir(&dir).with_context(|| format!("Failed reading {}", dir.display()))?
        {
            let path = entry?.path();
            let is_csv = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false);
            if !is_csv {
                continue;
            }

            let file = std::fs::File::open(&path).context("Failed to open generation file")?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize() {
                let record: GenerationRow =
                    result.context("Failed to deserialize generation record")?;
                records.push(record);
            }
        }

        records.sort_by_key(|r| (r.timestamp, r.generation_number));
        Ok(records)
    }
}

#[async_trait]
impl LifecycleStore for CsvPersistence {
    async fn save_hypothesis(&self, record: HypothesisRecord) -> Result<()> {
        Self::append(&self.hypothesis_writer, &record, "hypothesis").await
    }

    async fn save_trial(&self, record: TrialRecord) -> Result<()> {
        Self::append(&self.trial_writer, &record, "trial").await
    }

    async fn save_pattern(&self, record: PatternRecord) -> Result<()> {
        Self::append(&self.pattern_writer, &record, "pattern").await
    }

    async fn save_position(&self, record: PositionRecord) -> Result<()> {
        Self::append(&self.position_writer, &record, "position").await
    }

    async fn save_generation(&self, record: GenerationRow) -> Result<()> {
        Self::append(&self.generation_writer, &record, "generation").await
    }

    async fn save_risk_event(&self, record: RiskEventRecord) -> Result<()> {
        Self::append(&self.risk_event_writer, &record, "risk_event").await
    }

    async fn last_generation(&self) -> Result<Option<u32>> {
        Ok(self
            .load_generation_history()?
            .iter()
            .map(|r| r.generation_number)
            .max())
    }
}
