use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Walking,
    Hashing,
    Planning,
    Executing,
    Done,
}

impl ProgressStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProgressStage::Walking,
            1 => ProgressStage::Hashing,
            2 => ProgressStage::Planning,
            3 => ProgressStage::Executing,
            _ => ProgressStage::Done,
        }
    }
}

/// Point-in-time copy of the run counters handed to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub stage: ProgressStage,
    pub files_scanned: u64,
    pub files_hashed: u64,
    pub bytes_hashed: u64,
    pub files_processed: u64,
    pub bytes_freed: u64,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Shared counters; cheap to clone into worker tasks.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Counters>,
    callback: Option<ProgressCallback>,
}

#[derive(Default)]
struct Counters {
    stage: AtomicU8,
    files_scanned: AtomicU64,
    files_hashed: AtomicU64,
    bytes_hashed: AtomicU64,
    files_processed: AtomicU64,
    bytes_freed: AtomicU64,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            inner: Arc::new(Counters::default()),
            callback,
        }
    }

    pub fn set_stage(&self, stage: ProgressStage) {
        self.inner.stage.store(stage as u8, Ordering::Relaxed);
        self.emit();
    }

    pub fn file_scanned(&self) {
        let n = self.inner.files_scanned.fetch_add(1, Ordering::Relaxed) + 1;
        // Walks can be huge; throttle.
        if n % 256 == 0 {
            self.emit();
        }
    }

    pub fn bytes_hashed(&self, bytes: u64) {
        self.inner.bytes_hashed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn file_hashed(&self) {
        self.inner.files_hashed.fetch_add(1, Ordering::Relaxed);
        self.emit();
    }

    pub fn file_processed(&self, freed: u64) {
        self.inner.files_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_freed.fetch_add(freed, Ordering::Relaxed);
        self.emit();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: ProgressStage::from_u8(self.inner.stage.load(Ordering::Relaxed)),
            files_scanned: self.inner.files_scanned.load(Ordering::Relaxed),
            files_hashed: self.inner.files_hashed.load(Ordering::Relaxed),
            bytes_hashed: self.inner.bytes_hashed.load(Ordering::Relaxed),
            files_processed: self.inner.files_processed.load(Ordering::Relaxed),
            bytes_freed: self.inner.bytes_freed.load(Ordering::Relaxed),
        }
    }

    fn emit(&self) {
        if let Some(cb) = &self.callback {
            cb(&self.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn counters_accumulate_and_notify() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = ProgressTracker::new(Some(Arc::new(move |snap: &ProgressSnapshot| {
            sink.lock().unwrap().push(*snap);
        })));

        tracker.set_stage(ProgressStage::Hashing);
        tracker.bytes_hashed(100);
        tracker.file_hashed();
        tracker.file_processed(40);

        let snap = tracker.snapshot();
        assert_eq!(snap.stage, ProgressStage::Hashing);
        assert_eq!(snap.bytes_hashed, 100);
        assert_eq!(snap.files_hashed, 1);
        assert_eq!(snap.bytes_freed, 40);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
