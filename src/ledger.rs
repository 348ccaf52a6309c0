use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::gateway::OrderSide;
use crate::sizing;

const STATE_FILE: &str = "state.json";
const HISTORY_FILE: &str = "history.jsonl";
const BACKUP_PREFIX: &str = "state_backup_";

/// One tracked position. Serialized as-is into the state snapshot, so
/// field names are part of the on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub signal: OrderSide,
    pub current_level: u32,
    pub is_active: bool,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub capital: Decimal,
    pub leverage: u32,
    pub order_id: String,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub alert_id: String,
    pub timestamp: String,
    pub pending_reinforcement: bool,
    pub next_level: u32,
}

impl PositionRecord {
    pub fn realized_pnl(&self, close_price: Decimal) -> Decimal {
        let raw = match self.signal {
            OrderSide::Buy => (close_price - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - close_price) * self.quantity,
        };
        sizing::round_pnl(raw)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotState {
    #[serde(default)]
    pub positions: HashMap<String, PositionRecord>,
    #[serde(default)]
    pub processed_alerts: HashMap<String, i64>,
}

impl BotState {
    pub fn prune_alerts(&mut self, now: i64, ttl_secs: i64) {
        self.processed_alerts
            .retain(|_, seen| now - *seen < ttl_secs);
    }

    pub fn is_duplicate_alert(&self, alert_id: &str) -> bool {
        self.processed_alerts.contains_key(alert_id)
    }

    pub fn record_alert(&mut self, alert_id: &str, now: i64) {
        self.processed_alerts.insert(alert_id.to_string(), now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    PositionOpened,
    ReinforcementOpened,
    PositionClosed,
    OpenFailedWithExposure,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::PositionOpened => "POSITION_OPENED",
            HistoryKind::ReinforcementOpened => "REINFORCEMENT_OPENED",
            HistoryKind::PositionClosed => "POSITION_CLOSED",
            HistoryKind::OpenFailedWithExposure => "OPEN_FAILED_WITH_EXPOSURE",
        }
    }

    fn position_status(&self) -> &'static str {
        match self {
            HistoryKind::PositionOpened | HistoryKind::ReinforcementOpened => "ACTIVE",
            _ => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseType {
    TakeProfit,
    StopLoss,
    ManualClose,
    AutoCleanup,
    AutoCleanupPreOpen,
}

impl CloseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseType::TakeProfit => "TAKE_PROFIT",
            CloseType::StopLoss => "STOP_LOSS",
            CloseType::ManualClose => "MANUAL_CLOSE",
            CloseType::AutoCleanup => "AUTO_CLEANUP",
            CloseType::AutoCleanupPreOpen => "AUTO_CLEANUP_PRE_OPEN",
        }
    }
}

/// Event data handed to the ledger. The ledger fills in the bookkeeping
/// columns (id, timestamps, status, duration).
#[derive(Debug, Clone, Default)]
pub struct HistoryDraft {
    pub entry_type: Option<HistoryKind>,
    pub symbol: String,
    pub direction: String,
    pub level: u32,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub capital: Decimal,
    pub leverage: u32,
    pub tp_price: Decimal,
    pub sl_price: Decimal,
    pub close_price: Decimal,
    pub close_type: Option<CloseType>,
    pub profit_loss: Decimal,
    pub order_id: String,
    pub tp_order_id: String,
    pub sl_order_id: String,
    pub next_reinforcement_level: u32,
    pub open_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub timestamp: String,
    pub entry_type: HistoryKind,
    pub symbol: String,
    pub direction: String,
    pub level: u32,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub capital: Decimal,
    pub leverage: u32,
    pub tp_price: Decimal,
    pub sl_price: Decimal,
    pub close_price: Decimal,
    pub close_type: String,
    pub profit_loss: Decimal,
    pub status: String,
    pub order_id: String,
    pub tp_order_id: String,
    pub sl_order_id: String,
    pub next_reinforcement_level: u32,
    pub duration: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub ok: bool,
    pub data_dir: String,
    pub state_file_exists: bool,
    pub history_records: u64,
    pub backups: usize,
    pub last_saved: Option<String>,
}

pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<BotState>;
    fn save(&self, state: &BotState) -> Result<()>;
    fn append_history(&self, draft: HistoryDraft) -> Result<HistoryRecord>;
    fn read_history(&self, limit: Option<usize>) -> Result<Vec<HistoryRecord>>;
    fn status(&self) -> Result<LedgerStatus>;
}

fn duration_hms(open_timestamp: &str, now: DateTime<Utc>) -> String {
    match DateTime::parse_from_rfc3339(open_timestamp) {
        Ok(opened) => {
            let secs = (now - opened.with_timezone(&Utc)).num_seconds().max(0);
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        Err(e) => {
            log::warn!(
                "[LEDGER] cannot compute duration from '{}': {}",
                open_timestamp,
                e
            );
            String::new()
        }
    }
}

/// Stores the bot state as an atomically replaced JSON snapshot plus
/// rotated backups, and the trade history as an append-only JSONL file.
pub struct FileLedger {
    data_dir: PathBuf,
    backups_kept: usize,
    next_history_id: Mutex<u64>,
}

impl FileLedger {
    pub fn new(data_dir: &Path, backups_kept: usize) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let history_path = data_dir.join(HISTORY_FILE);
        let existing = if history_path.exists() {
            count_lines(&history_path)?
        } else {
            0
        };

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            backups_kept,
            next_history_id: Mutex::new(existing + 1),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_FILE)
    }

    fn backup_paths(&self) -> Result<Vec<PathBuf>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.data_dir)
            .with_context(|| format!("failed to list {}", self.data_dir.display()))?
        {
            let path = entry?.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false);
            if is_backup {
                backups.push(path);
            }
        }
        // names embed the save time, so lexical order is chronological
        backups.sort();
        Ok(backups)
    }

    fn write_backup(&self, rendered: &str) -> Result<()> {
        let name = format!(
            "{}{}.json",
            BACKUP_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        fs::write(self.data_dir.join(&name), rendered)
            .with_context(|| format!("failed to write backup {}", name))?;

        let backups = self.backup_paths()?;
        if backups.len() > self.backups_kept {
            for stale in &backups[..backups.len() - self.backups_kept] {
                if let Err(e) = fs::remove_file(stale) {
                    log::warn!("[LEDGER] failed to prune backup {}: {}", stale.display(), e);
                }
            }
        }
        Ok(())
    }

    fn load_from(path: &Path) -> Result<BotState> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

fn count_lines(path: &Path) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

impl LedgerStore for FileLedger {
    fn load(&self) -> Result<BotState> {
        let path = self.state_path();
        if !path.exists() {
            log::info!("[LEDGER] no saved state at {}, starting fresh", path.display());
            return Ok(BotState::default());
        }

        match Self::load_from(&path) {
            Ok(state) => Ok(state),
            Err(e) => {
                log::error!("[LEDGER] state file unreadable: {:#}", e);
                // newest backup first
                for backup in self.backup_paths()?.iter().rev() {
                    match Self::load_from(backup) {
                        Ok(state) => {
                            log::warn!("[LEDGER] recovered state from {}", backup.display());
                            return Ok(state);
                        }
                        Err(e) => {
                            log::warn!("[LEDGER] backup {} unreadable: {:#}", backup.display(), e)
                        }
                    }
                }
                log::error!("[LEDGER] no usable backup, starting with empty state");
                Ok(BotState::default())
            }
        }
    }

    fn save(&self, state: &BotState) -> Result<()> {
        let rendered =
            serde_json::to_string_pretty(state).context("failed to serialize state")?;

        // write the new snapshot next to the old one, then swap
        let tmp = self.data_dir.join(format!("{}.tmp", STATE_FILE));
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(rendered.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all().ok();
        fs::rename(&tmp, self.state_path())
            .with_context(|| format!("failed to replace {}", self.state_path().display()))?;

        self.write_backup(&rendered)?;
        log::debug!(
            "[LEDGER] state saved ({} positions, {} alerts)",
            state.positions.len(),
            state.processed_alerts.len()
        );
        Ok(())
    }

    fn append_history(&self, draft: HistoryDraft) -> Result<HistoryRecord> {
        let entry_type = draft
            .entry_type
            .context("history draft is missing its entry type")?;
        let now = Utc::now();

        let duration = match (&entry_type, draft.open_timestamp.as_deref()) {
            (HistoryKind::PositionClosed, Some(opened)) => duration_hms(opened, now),
            _ => String::new(),
        };

        let mut next_id = self.next_history_id.lock().unwrap();
        let record = HistoryRecord {
            id: *next_id,
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry_type,
            symbol: draft.symbol,
            direction: draft.direction,
            level: draft.level,
            entry_price: draft.entry_price,
            quantity: draft.quantity,
            capital: draft.capital,
            leverage: draft.leverage,
            tp_price: draft.tp_price,
            sl_price: draft.sl_price,
            close_price: draft.close_price,
            close_type: draft.close_type.map(|c| c.as_str().to_string()).unwrap_or_default(),
            profit_loss: draft.profit_loss,
            status: entry_type.position_status().to_string(),
            order_id: draft.order_id,
            tp_order_id: draft.tp_order_id,
            sl_order_id: draft.sl_order_id,
            next_reinforcement_level: draft.next_reinforcement_level,
            duration,
            created_at: now.to_rfc3339(),
        };

        let line = serde_json::to_string(&record).context("failed to serialize history record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .with_context(|| format!("failed to open {}", self.history_path().display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("failed to append {}", self.history_path().display()))?;

        *next_id += 1;
        log::info!(
            "[LEDGER] record added: {} {} (id {})",
            record.entry_type.as_str(),
            record.symbol,
            record.id
        );
        Ok(record)
    }

    fn read_history(&self, limit: Option<usize>) -> Result<Vec<HistoryRecord>> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("[LEDGER] skipping unreadable history line: {}", e),
            }
        }

        if let Some(limit) = limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }
        Ok(records)
    }

    fn status(&self) -> Result<LedgerStatus> {
        let state_path = self.state_path();
        let history_path = self.history_path();

        let history_records = if history_path.exists() {
            count_lines(&history_path)?
        } else {
            0
        };

        let last_saved = fs::metadata(&state_path)
            .and_then(|m| m.modified())
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());

        Ok(LedgerStatus {
            ok: true,
            data_dir: self.data_dir.display().to_string(),
            state_file_exists: state_path.exists(),
            history_records,
            backups: self.backup_paths()?.len(),
            last_saved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sample_position() -> PositionRecord {
        PositionRecord {
            signal: OrderSide::Buy,
            current_level: 1,
            is_active: true,
            quantity: dec("0.025"),
            entry_price: dec("2000"),
            capital: dec("50"),
            leverage: 1,
            order_id: "101".to_string(),
            tp_order_id: Some("102".to_string()),
            sl_order_id: Some("103".to_string()),
            alert_id: "ETHUSDC_BUY_2025-01-01T00:00:00Z".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            pending_reinforcement: false,
            next_level: 1,
        }
    }

    #[test]
    fn save_then_load_round_trips_state() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 10).unwrap();

        let mut state = BotState::default();
        state
            .positions
            .insert("ETHUSDC".to_string(), sample_position());
        state.record_alert("ETHUSDC_BUY_t1", 1_700_000_000);
        ledger.save(&state).unwrap();

        let loaded = ledger.load().unwrap();
        assert_eq!(loaded.positions.len(), 1);
        let pos = &loaded.positions["ETHUSDC"];
        assert_eq!(pos.signal, OrderSide::Buy);
        assert_eq!(pos.entry_price, dec("2000"));
        assert!(loaded.is_duplicate_alert("ETHUSDC_BUY_t1"));
    }

    #[test]
    fn missing_state_file_yields_empty_state() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 10).unwrap();
        let state = ledger.load().unwrap();
        assert!(state.positions.is_empty());
        assert!(state.processed_alerts.is_empty());
    }

    #[test]
    fn corrupt_state_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 10).unwrap();

        let mut state = BotState::default();
        state
            .positions
            .insert("ETHUSDC".to_string(), sample_position());
        ledger.save(&state).unwrap();

        fs::write(dir.path().join(STATE_FILE), "{ not json").unwrap();

        let recovered = ledger.load().unwrap();
        assert_eq!(recovered.positions.len(), 1);
    }

    #[test]
    fn history_ids_survive_restarts() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 10).unwrap();

        let draft = |sym: &str| HistoryDraft {
            entry_type: Some(HistoryKind::PositionOpened),
            symbol: sym.to_string(),
            direction: "BUY".to_string(),
            level: 1,
            ..HistoryDraft::default()
        };

        assert_eq!(ledger.append_history(draft("ETHUSDC")).unwrap().id, 1);
        assert_eq!(ledger.append_history(draft("BTCUSDC")).unwrap().id, 2);

        let reopened = FileLedger::new(dir.path(), 10).unwrap();
        assert_eq!(reopened.append_history(draft("ETHUSDC")).unwrap().id, 3);

        let all = reopened.read_history(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].status, "ACTIVE");
    }

    #[test]
    fn read_history_returns_the_tail() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 10).unwrap();

        for i in 0..5 {
            ledger
                .append_history(HistoryDraft {
                    entry_type: Some(HistoryKind::PositionOpened),
                    symbol: format!("SYM{}", i),
                    ..HistoryDraft::default()
                })
                .unwrap();
        }

        let tail = ledger.read_history(Some(2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].symbol, "SYM3");
        assert_eq!(tail[1].symbol, "SYM4");
    }

    #[test]
    fn close_records_carry_duration() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 10).unwrap();

        let opened = (Utc::now() - chrono::Duration::seconds(90)).to_rfc3339();
        let record = ledger
            .append_history(HistoryDraft {
                entry_type: Some(HistoryKind::PositionClosed),
                symbol: "ETHUSDC".to_string(),
                close_type: Some(CloseType::TakeProfit),
                open_timestamp: Some(opened),
                ..HistoryDraft::default()
            })
            .unwrap();

        assert_eq!(record.status, "CLOSED");
        assert_eq!(record.close_type, "TAKE_PROFIT");
        assert!(record.duration.starts_with("00:01:3"), "got {}", record.duration);
    }

    #[test]
    fn backups_are_pruned_to_the_limit() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path(), 2).unwrap();

        let state = BotState::default();
        for _ in 0..4 {
            ledger.save(&state).unwrap();
        }

        let status = ledger.status().unwrap();
        assert!(status.backups <= 2, "got {} backups", status.backups);
        assert!(status.state_file_exists);
    }

    #[test]
    fn expired_alerts_are_pruned() {
        let mut state = BotState::default();
        state.record_alert("old", 1_000);
        state.record_alert("fresh", 4_000);
        state.prune_alerts(4_600, 3_600);
        assert!(!state.is_duplicate_alert("old"));
        assert!(state.is_duplicate_alert("fresh"));
    }

    #[test]
    fn pnl_is_signed_by_direction() {
        let mut pos = sample_position();
        assert_eq!(pos.realized_pnl(dec("2006")), dec("0.1500"));
        assert_eq!(pos.realized_pnl(dec("1994")), dec("-0.1500"));

        pos.signal = OrderSide::Sell;
        assert_eq!(pos.realized_pnl(dec("1994")), dec("0.1500"));
    }
}
