/// Event journal: tamper-evident audit trail for the SCADA monitor and the
/// injector.
///
/// One JSON object per line. Each entry carries the SHA-256 of the previous
/// entry, so a modified, dropped or reordered line breaks the chain.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::topology::Anomaly;
use crate::types::{ConnectionState, ControllerId, IoAddress};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum JournalEvent {
    /// Monitor or injector came up
    MonitorStartup { controllers: usize, lines: usize },

    ConnectionChanged { controller: String, state: String },

    /// Reply disagreed with the request or the declared I/O size
    ProtocolMismatch { controller: String, detail: String },

    /// Consistency checker finding
    AnomalyDetected {
        kind: String,
        line: String,
        element: String,
        detail: String,
    },

    /// Interlock monitor state transition
    StateChange {
        from_state: String,
        to_state: String,
        trigger: String,
    },

    /// Write issued by the command injector
    InjectedWrite {
        controller: String,
        table: String,
        offset: usize,
        value: u16,
        acknowledged: bool,
    },

    /// Legitimate train command from the operator console
    OperatorCommand {
        train: String,
        controller: String,
        table: String,
        offset: usize,
        value: u16,
    },

    JournalReset { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,

    /// Component that wrote the entry (e.g. "HMI", "INJECTOR")
    pub source: String,

    pub event: JournalEvent,

    /// Empty for the first entry
    pub prev_hash: String,

    pub entry_hash: String,
}

impl JournalEntry {
    fn new(sequence: u64, source: String, event: JournalEvent, prev_hash: String) -> Self {
        let timestamp = Utc::now();
        let entry_hash = Self::digest(sequence, &timestamp, &source, &event, &prev_hash);
        Self {
            sequence,
            timestamp,
            source,
            event,
            prev_hash,
            entry_hash,
        }
    }

    fn digest(
        sequence: u64,
        timestamp: &DateTime<Utc>,
        source: &str,
        event: &JournalEvent,
        prev_hash: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sequence.to_le_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(source.as_bytes());
        hasher.update(serde_json::to_string(event).unwrap_or_default().as_bytes());
        hasher.update(prev_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn verify_hash(&self) -> bool {
        Self::digest(
            self.sequence,
            &self.timestamp,
            &self.source,
            &self.event,
            &self.prev_hash,
        ) == self.entry_hash
    }

    pub fn verify_chain(&self, prev: &JournalEntry) -> bool {
        self.prev_hash == prev.entry_hash && self.sequence == prev.sequence + 1
    }
}

struct ChainState {
    sequence: u64,
    last_hash: String,
}

/// Append-only writer. Clones share one file and one chain.
#[derive(Clone)]
pub struct EventJournal {
    source: String,
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
    chain: Arc<Mutex<ChainState>>,
}

impl EventJournal {
    /// New journal file `<source>_<timestamp>.jsonl` under `dir` (default `./event_logs`)
    pub fn create(source: &str, dir: Option<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.unwrap_or_else(|| PathBuf::from("event_logs"));
        std::fs::create_dir_all(&dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        Self::at_path(source, dir.join(format!("{}_{}.jsonl", source, stamp)))
    }

    /// Start a fresh chain at an explicit path, truncating anything there
    pub fn at_path(source: &str, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(Self {
            source: source.to_string(),
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            chain: Arc::new(Mutex::new(ChainState {
                sequence: 0,
                last_hash: String::new(),
            })),
        })
    }

    pub fn record(&self, event: JournalEvent) {
        let mut chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = JournalEntry::new(chain.sequence, self.source.clone(), event, chain.last_hash.clone());
        chain.sequence += 1;
        chain.last_hash = entry.entry_hash.clone();

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(writer, "{}", json);
            let _ = writer.flush();
        }
    }

    pub fn log_startup(&self, controllers: usize, lines: usize) {
        self.record(JournalEvent::MonitorStartup { controllers, lines });
    }

    pub fn log_connection_change(&self, controller: &ControllerId, state: ConnectionState) {
        self.record(JournalEvent::ConnectionChanged {
            controller: controller.to_string(),
            state: state.to_string(),
        });
    }

    pub fn log_protocol_mismatch(&self, controller: &ControllerId, detail: &str) {
        self.record(JournalEvent::ProtocolMismatch {
            controller: controller.to_string(),
            detail: detail.to_string(),
        });
    }

    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        self.record(JournalEvent::AnomalyDetected {
            kind: anomaly.kind.to_string(),
            line: anomaly.line.to_string(),
            element: anomaly.element.clone(),
            detail: anomaly.detail.clone(),
        });
    }

    pub fn log_state_change(&self, from_state: String, to_state: String, trigger: String) {
        self.record(JournalEvent::StateChange {
            from_state,
            to_state,
            trigger,
        });
    }

    pub fn log_injected_write(&self, addr: &IoAddress, value: u16, acknowledged: bool) {
        self.record(JournalEvent::InjectedWrite {
            controller: addr.controller.to_string(),
            table: format!("{:?}", addr.table),
            offset: addr.offset,
            value,
            acknowledged,
        });
    }

    pub fn log_operator_command(&self, train: &str, addr: &IoAddress, value: u16) {
        self.record(JournalEvent::OperatorCommand {
            train: train.to_string(),
            controller: addr.controller.to_string(),
            table: format!("{:?}", addr.table),
            offset: addr.offset,
            value,
        });
    }

    pub fn log_reset(&self, reason: String) {
        self.record(JournalEvent::JournalReset { reason });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries written so far
    pub fn sequence(&self) -> u64 {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).sequence
    }
}

impl fmt::Debug for EventJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventJournal")
            .field("source", &self.source)
            .field("path", &self.path)
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// Outcome of checking a journal file
#[derive(Debug)]
pub struct VerificationResult {
    pub total_entries: usize,
    pub verified: bool,
    pub issues: Vec<String>,
}

/// Re-hash every entry and walk the chain
pub fn verify_journal_file(path: impl AsRef<Path>) -> Result<VerificationResult, String> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;

    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| format!("line {} read error: {}", n + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry =
            serde_json::from_str(&line).map_err(|e| format!("line {} parse error: {}", n + 1, e))?;
        entries.push(entry);
    }

    let mut issues = Vec::new();

    if let Some(first) = entries.first()
        && !first.prev_hash.is_empty()
    {
        issues.push(format!("entry 0: first entry has non-empty prev_hash '{}'", first.prev_hash));
    }

    for (i, entry) in entries.iter().enumerate() {
        if !entry.verify_hash() {
            issues.push(format!("entry {}: hash mismatch (modified)", i));
        }
        if entry.sequence != i as u64 {
            issues.push(format!("entry {}: expected sequence {}, got {}", i, i, entry.sequence));
        }
    }

    for (i, pair) in entries.windows(2).enumerate() {
        if !pair[1].verify_chain(&pair[0]) {
            issues.push(format!("entry {}: chain broken (missing or reordered entry)", i + 1));
        }
    }

    Ok(VerificationResult {
        total_entries: entries.len(),
        verified: issues.is_empty(),
        issues,
    })
}
