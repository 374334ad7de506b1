//! In-process stores: one that keeps everything, one that drops everything

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

use super::{
    GenerationRow, HypothesisRecord, LifecycleStore, PatternRecord, PositionRecord,
    RiskEventRecord, TrialRecord,
};

#[derive(Debug, Default)]
struct Records {
    hypotheses: Vec<HypothesisRecord>,
    trials: Vec<TrialRecord>,
    patterns: Vec<PatternRecord>,
    positions: Vec<PositionRecord>,
    generations: Vec<GenerationRow>,
    risk_events: Vec<RiskEventRecord>,
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Records) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut records)
    }

    pub fn hypotheses(&self) -> Vec<HypothesisRecord> {
        self.with(|r| r.hypotheses.clone())
    }

    pub fn trials(&self) -> Vec<TrialRecord> {
        self.with(|r| r.trials.clone())
    }

    pub fn patterns(&self) -> Vec<PatternRecord> {
        self.with(|r| r.patterns.clone())
    }

    pub fn positions(&self) -> Vec<PositionRecord> {
        self.with(|r| r.positions.clone())
    }

    pub fn generations(&self) -> Vec<GenerationRow> {
        self.with(|r| r.generations.clone())
    }

    pub fn risk_events(&self) -> Vec<RiskEventRecord> {
        self.with(|r| r.risk_events.clone())
    }
}

#[async_trait]
impl LifecycleStore for MemoryStore {
    async fn save_hypothesis(&self, record: HypothesisRecord) -> Result<()> {
        self.with(|r| r.hypotheses.push(record));
        Ok(())
    }

    async fn save_trial(&self, record: TrialRecord) -> Result<()> {
        self.with(|r| r.trials.push(record));
        Ok(())
    }

    async fn save_pattern(&self, record: PatternRecord) -> Result<()> {
        self.with(|r| r.patterns.push(record));
        Ok(())
    }

    async fn save_position(&self, record: PositionRecord) -> Result<()> {
        self.with(|r| r.positions.push(record));
        Ok(())
    }

    async fn save_generation(&self, record: GenerationRow) -> Result<()> {
        self.with(|r| r.generations.push(record));
        Ok(())
    }

    async fn save_risk_event(&self, record: RiskEventRecord) -> Result<()> {
        self.with(|r| r.risk_events.push(record));
        Ok(())
    }

    async fn last_generation(&self) -> Result<Option<u32>> {
        Ok(self.with(|r| r.generations.iter().map(|g| g.generation_number).max()))
    }
}

/// Discards every record (persistence disabled)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl LifecycleStore for NoopStore {
    async fn save_hypothesis(&self, _record: HypothesisRecord) -> Result<()> {
        Ok(())
    }

    async fn save_trial(&self, _record: TrialRecord) -> Result<()> {
        Ok(())
    }

    async fn save_pattern(&self, _record: PatternRecord) -> Result<()> {
        Ok(())
    }

    async fn save_position(&self, _record: PositionRecord) -> Result<()> {
        Ok(())
    }

    async fn save_generation(&self, _record: GenerationRow) -> Result<()> {
        Ok(())
    }

    async fn save_risk_event(&self, _record: RiskEventRecord) -> Result<()> {
        Ok(())
    }
}
