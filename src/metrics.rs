use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Operational counters for monitoring
#[derive(Clone)]
pub struct Metrics {
    pub logins: Arc<AtomicUsize>,
    pub uploads: Arc<AtomicUsize>,
    pub bytes_uploaded: Arc<AtomicU64>,
    pub datasets_published: Arc<AtomicUsize>,
    pub parser_tasks_finished: Arc<AtomicUsize>,
    pub parser_tasks_failed: Arc<AtomicUsize>,
    pub files_relocated: Arc<AtomicUsize>,
    pub mails_sent: Arc<AtomicUsize>,
    pub mails_failed: Arc<AtomicUsize>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            logins: Arc::new(AtomicUsize::new(0)),
            uploads: Arc::new(AtomicUsize::new(0)),
            bytes_uploaded: Arc::new(AtomicU64::new(0)),
            datasets_published: Arc::new(AtomicUsize::new(0)),
            parser_tasks_finished: Arc::new(AtomicUsize::new(0)),
            parser_tasks_failed: Arc::new(AtomicUsize::new(0)),
            files_relocated: Arc::new(AtomicUsize::new(0)),
            mails_sent: Arc::new(AtomicUsize::new(0)),
            mails_failed: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn inc_logins(&self) {
        self.logins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_datasets_published(&self) {
        self.datasets_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parser_finished(&self) {
        self.parser_tasks_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parser_failed(&self) {
        self.parser_tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_files_relocated(&self) {
        self.files_relocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_mails(&self, sent: usize, failed: usize) {
        self.mails_sent.fetch_add(sent, Ordering::Relaxed);
        self.mails_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            logins: self.logins.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            datasets_published: self.datasets_published.load(Ordering::Relaxed),
            parser_tasks_finished: self.parser_tasks_finished.load(Ordering::Relaxed),
            parser_tasks_failed: self.parser_tasks_failed.load(Ordering::Relaxed),
            files_relocated: self.files_relocated.load(Ordering::Relaxed),
            mails_sent: self.mails_sent.load(Ordering::Relaxed),
            mails_failed: self.mails_failed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub logins: usize,
    pub uploads: usize,
    pub bytes_uploaded: u64,
    pub datasets_published: usize,
    pub parser_tasks_finished: usize,
    pub parser_tasks_failed: usize,
    pub files_relocated: usize,
    pub mails_sent: usize,
    pub mails_failed: usize,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 9] = [
            ("fdm_logins", "Successful logins", self.logins as u64),
            ("fdm_uploads", "Files uploaded", self.uploads as u64),
            ("fdm_bytes_uploaded", "Bytes uploaded", self.bytes_uploaded),
            ("fdm_datasets_published", "Datasets published", self.datasets_published as u64),
            ("fdm_parser_tasks_finished", "File parser tasks finished", self.parser_tasks_finished as u64),
            ("fdm_parser_tasks_failed", "File parser tasks failed", self.parser_tasks_failed as u64),
            ("fdm_files_relocated", "Files moved out of temporary storage", self.files_relocated as u64),
            ("fdm_mails_sent", "Mails delivered", self.mails_sent as u64),
            ("fdm_mails_failed", "Mail delivery attempts failed", self.mails_failed as u64),
        ];
        let mut body = String::new();
        for (name, help, value) in counters {
            body.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
        }
        body.push_str(&format!(
            "# HELP fdm_uptime_seconds Uptime seconds\n# TYPE fdm_uptime_seconds gauge\nfdm_uptime_seconds {}\n",
            self.uptime_seconds
        ));
        body
    }
}
