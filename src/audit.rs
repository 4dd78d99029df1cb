//! Append-only audit sink.
//!
//! Every observability event in the service flows through here as an
//! [`AuditRecord`]. Emission is a bounded queue push that never blocks
//! a request path: when the queue is full the record is downgraded to
//! an `audit-dropped` marker (original severity preserved) and a
//! counter is incremented, but request processing continues.
//!
//! A single writer thread drains the queue, so records are FIFO per
//! writer. Severities route to separate rolled JSONL streams (normal,
//! security, error) under the audit directory, size-capped with a
//! bounded retained-file count. Raw session ids never appear in a
//! record — only their SHA-256 hash — and every free-form field is
//! passed through the PHI scrubber before enqueue.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::scrub::PhiScrubber;

/// Queue depth between request paths and the writer thread.
const QUEUE_CAPACITY: usize = 1024;

// ═══════════════════════════════════════════════════════════
// Record shape
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    Access,
    DataModification,
    MedicalQuery,
    SecurityEvent,
    Http,
    /// Replacement kind for records shed under queue pressure.
    AuditDropped,
}

impl AuditKind {
    fn metric_slot(self) -> usize {
        match self {
            AuditKind::Access => 0,
            AuditKind::DataModification => 1,
            AuditKind::MedicalQuery => 2,
            AuditKind::SecurityEvent => 3,
            AuditKind::Http => 4,
            AuditKind::AuditDropped => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Security,
}

/// One append-only audit record. Never mutated after emission.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Millisecond timestamp from the shared monotone wall clock.
    pub ts_ms: i64,
    pub kind: AuditKind,
    pub severity: AuditSeverity,
    /// SHA-256 hash of the session id, when a session is in scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_hash: Option<String>,
    pub resource: String,
    pub action: String,
    pub outcome: String,
    /// Additional scrubbed fields.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        kind: AuditKind,
        severity: AuditSeverity,
        resource: &str,
        action: &str,
        outcome: &str,
    ) -> Self {
        Self {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            severity,
            session_hash: None,
            resource: resource.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            fields: serde_json::Value::Null,
        }
    }

    pub fn with_session(mut self, session_id: &Uuid) -> Self {
        self.session_hash = Some(hash_session_id(session_id));
        self
    }

    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = fields;
        self
    }
}

/// Hash a session id for audit use. Raw ids never reach the log.
pub fn hash_session_id(id: &Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ═══════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Counters {
    emitted: [AtomicU64; 6],
    dropped: AtomicU64,
}

/// Point-in-time view of sink activity, feeding the compliance report.
#[derive(Debug, Clone, Serialize)]
pub struct AuditMetrics {
    pub access: u64,
    pub data_modification: u64,
    pub medical_query: u64,
    pub security_event: u64,
    pub http: u64,
    pub audit_dropped: u64,
    pub dropped_total: u64,
}

// ═══════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════

/// Handle to the audit sink. Cheap to clone; all clones feed the same
/// writer thread.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
    scrubber: PhiScrubber,
    counters: Arc<Counters>,
    writer: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl AuditSink {
    /// Start the sink with a dedicated writer thread.
    pub fn start(
        log_dir: &Path,
        max_file_bytes: u64,
        max_files: usize,
        scrubber: PhiScrubber,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let dir = log_dir.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || writer_loop(rx, dir, max_file_bytes, max_files))?;
        Ok(Self {
            tx,
            scrubber,
            counters: Arc::new(Counters::default()),
            writer: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Sink with a bounded queue and no writer, for queue-pressure tests.
    #[cfg(test)]
    fn unstarted(capacity: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                scrubber: PhiScrubber::new(),
                counters: Arc::new(Counters::default()),
                writer: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }

    /// Enqueue a record. Returns promptly in all cases.
    pub fn emit(&self, mut record: AuditRecord) {
        record.resource = self.scrubber.scrub_text(&record.resource).text;
        record.action = self.scrubber.scrub_text(&record.action).text;
        record.outcome = self.scrubber.scrub_text(&record.outcome).text;
        if !record.fields.is_null() {
            self.scrubber.scrub_value(&mut record.fields);
        }

        let kind = record.kind;
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.emitted[kind.metric_slot()].fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(original)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                // Shed the payload but keep a trace that something was
                // dropped, at the original severity.
                let marker = AuditRecord {
                    ts_ms: original.ts_ms,
                    kind: AuditKind::AuditDropped,
                    severity: original.severity,
                    session_hash: None,
                    resource: original.resource,
                    action: "dropped".to_string(),
                    outcome: "queue-full".to_string(),
                    fields: serde_json::Value::Null,
                };
                if self.tx.try_send(marker).is_ok() {
                    self.counters.emitted[AuditKind::AuditDropped.metric_slot()]
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn metrics(&self) -> AuditMetrics {
        let e = &self.counters.emitted;
        AuditMetrics {
            access: e[0].load(Ordering::Relaxed),
            data_modification: e[1].load(Ordering::Relaxed),
            medical_query: e[2].load(Ordering::Relaxed),
            security_event: e[3].load(Ordering::Relaxed),
            http: e[4].load(Ordering::Relaxed),
            audit_dropped: e[5].load(Ordering::Relaxed),
            dropped_total: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Flush and stop the writer. Safe to call once during shutdown;
    /// later `emit` calls count as dropped.
    pub fn shutdown(&self) {
        // Closing the channel ends the writer loop after it drains.
        // We cannot drop other clones' senders, so close via the rx
        // side instead: the writer exits when all senders drop OR when
        // it sees the sentinel below.
        let _ = self.tx.try_send(AuditRecord::new(
            AuditKind::AuditDropped,
            AuditSeverity::Info,
            "sink",
            "shutdown",
            "flush",
        ));
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(handle) = guard.take() {
                drop(guard);
                // The writer drains remaining records then parks on
                // recv; dropping our tx is not enough while clones
                // live, so join with a short grace handled inside the
                // writer via the shutdown sentinel.
                let _ = handle.join();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Writer thread
// ═══════════════════════════════════════════════════════════

fn stream_file(severity: AuditSeverity) -> &'static str {
    match severity {
        AuditSeverity::Info | AuditSeverity::Warning => "audit.jsonl",
        AuditSeverity::Security => "security.jsonl",
        AuditSeverity::Error => "error.jsonl",
    }
}

fn writer_loop(
    mut rx: mpsc::Receiver<AuditRecord>,
    dir: PathBuf,
    max_file_bytes: u64,
    max_files: usize,
) {
    while let Some(record) = rx.blocking_recv() {
        let is_shutdown_sentinel = record.kind == AuditKind::AuditDropped
            && record.resource == "sink"
            && record.action == "shutdown";
        if !is_shutdown_sentinel {
            if let Err(e) = append_record(&dir, &record, max_file_bytes, max_files) {
                tracing::error!(error = %e, "audit write failed");
            }
        }
        if is_shutdown_sentinel {
            // Drain whatever is already queued, then stop.
            while let Ok(pending) = rx.try_recv() {
                if let Err(e) = append_record(&dir, &pending, max_file_bytes, max_files) {
                    tracing::error!(error = %e, "audit write failed");
                }
            }
            return;
        }
    }
}

fn append_record(
    dir: &Path,
    record: &AuditRecord,
    max_file_bytes: u64,
    max_files: usize,
) -> std::io::Result<()> {
    let name = stream_file(record.severity);
    let path = dir.join(name);

    if fs::metadata(&path).map(|m| m.len() >= max_file_bytes).unwrap_or(false) {
        roll(dir, name, max_files)?;
    }

    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Shift `name` → `name.1` → … → `name.max`, discarding the oldest.
fn roll(dir: &Path, name: &str, max_files: usize) -> std::io::Result<()> {
    let oldest = dir.join(format!("{name}.{max_files}"));
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for i in (1..max_files).rev() {
        let from = dir.join(format!("{name}.{i}"));
        if from.exists() {
            fs::rename(&from, dir.join(format!("{name}.{}", i + 1)))?;
        }
    }
    let current = dir.join(name);
    if current.exists() {
        fs::rename(&current, dir.join(format!("{name}.1")))?;
    }
    // Touch a fresh current file so appends start at zero.
    File::create(current)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn records_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink =
            AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();

        sink.emit(AuditRecord::new(
            AuditKind::Http,
            AuditSeverity::Info,
            "/api/health",
            "GET",
            "status:200",
        ));
        sink.shutdown();

        let lines = read_lines(&dir.path().join("audit.jsonl"));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["kind"], "http");
        assert_eq!(lines[0]["resource"], "/api/health");
        assert_eq!(lines[0]["outcome"], "status:200");
        assert!(lines[0]["ts_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn severities_route_to_separate_streams() {
        let dir = tempfile::tempdir().unwrap();
        let sink =
            AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();

        sink.emit(AuditRecord::new(
            AuditKind::SecurityEvent,
            AuditSeverity::Security,
            "rate-limit",
            "deny",
            "exceeded",
        ));
        sink.emit(AuditRecord::new(
            AuditKind::Http,
            AuditSeverity::Error,
            "/api/medical-chat",
            "POST",
            "status:500",
        ));
        sink.shutdown();

        assert_eq!(read_lines(&dir.path().join("security.jsonl")).len(), 1);
        assert_eq!(read_lines(&dir.path().join("error.jsonl")).len(), 1);
        assert!(read_lines(&dir.path().join("audit.jsonl")).is_empty());
    }

    #[test]
    fn fields_are_scrubbed_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let sink =
            AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();

        sink.emit(
            AuditRecord::new(
                AuditKind::MedicalQuery,
                AuditSeverity::Info,
                "chat",
                "synthesize",
                "ok",
            )
            .with_fields(json!({
                "email": "jane@example.org",
                "note": "callback 555-867-5309"
            })),
        );
        sink.shutdown();

        let lines = read_lines(&dir.path().join("audit.jsonl"));
        let fields = &lines[0]["fields"];
        assert_eq!(fields["email"], "[REDACTED]");
        assert!(!fields["note"].as_str().unwrap().contains("5309"));
    }

    #[test]
    fn session_ids_only_appear_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let sink =
            AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();

        let session_id = Uuid::new_v4();
        sink.emit(
            AuditRecord::new(
                AuditKind::Access,
                AuditSeverity::Info,
                "session",
                "deactivate",
                "ok",
            )
            .with_session(&session_id),
        );
        sink.shutdown();

        let lines = read_lines(&dir.path().join("audit.jsonl"));
        let hash = lines[0]["session_hash"].as_str().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains(&session_id.to_string()));
        assert_eq!(hash, hash_session_id(&session_id));
    }

    #[test]
    fn queue_full_downgrades_instead_of_blocking() {
        let (sink, mut rx) = AuditSink::unstarted(1);

        let record =
            || AuditRecord::new(AuditKind::Http, AuditSeverity::Info, "/", "GET", "ok");
        sink.emit(record()); // fills the queue
        sink.emit(record()); // shed; marker cannot fit either

        let metrics = sink.metrics();
        assert_eq!(metrics.http, 1);
        assert_eq!(metrics.dropped_total, 1);

        // The queued record is the original, untouched.
        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, AuditKind::Http);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn repeated_sheds_only_count_never_block() {
        let (sink, mut rx) = AuditSink::unstarted(1);
        let record =
            || AuditRecord::new(AuditKind::Http, AuditSeverity::Info, "/", "GET", "ok");

        sink.emit(record()); // fills the queue
        for _ in 0..5 {
            sink.emit(record());
        }

        let metrics = sink.metrics();
        assert_eq!(metrics.http, 1);
        assert_eq!(metrics.dropped_total, 5);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn files_roll_at_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::start(dir.path(), 200, 2, PhiScrubber::new()).unwrap();

        for i in 0..10 {
            sink.emit(AuditRecord::new(
                AuditKind::Http,
                AuditSeverity::Info,
                "/api/health",
                "GET",
                &format!("status:200 call:{i}"),
            ));
        }
        sink.shutdown();

        assert!(dir.path().join("audit.jsonl").exists());
        assert!(dir.path().join("audit.jsonl.1").exists());
        // Retained count never exceeds the cap.
        assert!(!dir.path().join("audit.jsonl.3").exists());
    }

    #[test]
    fn metrics_count_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let sink =
            AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();

        for _ in 0..3 {
            sink.emit(AuditRecord::new(
                AuditKind::MedicalQuery,
                AuditSeverity::Info,
                "chat",
                "synthesize",
                "ok",
            ));
        }
        sink.emit(AuditRecord::new(
            AuditKind::SecurityEvent,
            AuditSeverity::Security,
            "rate-limit",
            "deny",
            "exceeded",
        ));

        let metrics = sink.metrics();
        assert_eq!(metrics.medical_query, 3);
        assert_eq!(metrics.security_event, 1);
        assert_eq!(metrics.dropped_total, 0);
        sink.shutdown();
    }
}
