use std::collections::HashMap;
use std::path::PathBuf;
use std::thread::JoinHandle;

use media_io::CancellationToken;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::JobFailure;
use crate::job::{
    ClipboardOutcome, CommandOutcome, EncodeParameters, JobSnapshot, JobStatus, UploadOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was processing; its token is set and it will end `Canceled`.
    Requested,
    /// The job was not processing and has been dropped from the registry.
    Removed,
    NotFound,
}

pub(crate) struct JobRecord {
    seq: u64,
    snapshot: JobSnapshot,
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    next_seq: u64,
}

/// The set of jobs in flight and recently finished.
///
/// This is the only state shared between job threads; every mutation goes
/// through the internal lock.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &self,
        id: String,
        params: &EncodeParameters,
        frame_count: usize,
        token: CancellationToken,
        thread: JoinHandle<()>,
    ) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let snapshot = JobSnapshot {
            id: id.clone(),
            format: params.format,
            backend: params.backend,
            output_path: params.output_path.clone(),
            status: JobStatus::Starting,
            frame_count,
            current_frame: 0,
            message: None,
            indeterminate: true,
            failure: None,
            upload: None,
            clipboard: None,
            command: None,
        };
        inner.jobs.insert(
            id,
            JobRecord {
                seq,
                snapshot,
                token,
                thread: Some(thread),
            },
        );
    }

    /// Applies a status change if the state machine allows it. Returns
    /// whether the job exists and the change was applied.
    pub(crate) fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        indeterminate: bool,
        failure: Option<JobFailure>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(record) = inner.jobs.get_mut(id) else {
            return false;
        };
        let current = record.snapshot.status;
        if current != status && !current.can_transition_to(status) {
            warn!(job_id = %id, from = %current, to = %status, "ignoring status change");
            return false;
        }
        record.snapshot.status = status;
        record.snapshot.indeterminate = indeterminate;
        if failure.is_some() {
            record.snapshot.failure = failure;
        }
        true
    }

    pub(crate) fn set_indeterminate(&self, id: &str, indeterminate: bool) -> Option<JobStatus> {
        let mut inner = self.inner.lock();
        let record = inner.jobs.get_mut(id)?;
        record.snapshot.indeterminate = indeterminate;
        Some(record.snapshot.status)
    }

    pub(crate) fn update_progress(&self, id: &str, frame: usize, message: &str) -> bool {
        self.with_snapshot(id, |snapshot| {
            snapshot.current_frame = frame;
            snapshot.message = Some(message.to_string());
        })
    }

    pub(crate) fn record_upload(&self, id: &str, outcome: UploadOutcome) -> bool {
        self.with_snapshot(id, |snapshot| snapshot.upload = Some(outcome))
    }

    pub(crate) fn record_clipboard(&self, id: &str, outcome: ClipboardOutcome) -> bool {
        self.with_snapshot(id, |snapshot| snapshot.clipboard = Some(outcome))
    }

    pub(crate) fn record_command(&self, id: &str, outcome: CommandOutcome) -> bool {
        self.with_snapshot(id, |snapshot| snapshot.command = Some(outcome))
    }

    fn with_snapshot(&self, id: &str, update: impl FnOnce(&mut JobSnapshot)) -> bool {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(id) {
            Some(record) => {
                update(&mut record.snapshot);
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.inner.lock().jobs.get(id).map(|r| r.snapshot.status)
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.inner.lock().jobs.get(id).map(|r| r.snapshot.clone())
    }

    /// All jobs in submission order.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let inner = self.inner.lock();
        let mut records = inner.jobs.values().collect::<Vec<_>>();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.snapshot.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A processing job gets its token set. Any other job is dropped from
    /// the registry without going through the `Canceled` path; its token
    /// is still set so a thread that has not begun encoding stops early.
    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let mut inner = self.inner.lock();
        let Some(record) = inner.jobs.get(id) else {
            return CancelOutcome::NotFound;
        };
        if record.snapshot.status == JobStatus::Processing {
            record.token.cancel();
            debug!(job_id = %id, "cancellation requested");
            return CancelOutcome::Requested;
        }
        if let Some(record) = inner.jobs.remove(id) {
            record.token.cancel();
        }
        debug!(job_id = %id, "job removed");
        CancelOutcome::Removed
    }

    /// Removes every job in a terminal state and waits for its thread to
    /// finish cleaning up. Returns the removed ids.
    pub fn clear_finished(&self) -> Vec<String> {
        let removed = {
            let mut inner = self.inner.lock();
            let finished = inner
                .jobs
                .iter()
                .filter(|(_, r)| r.snapshot.status.is_terminal())
                .map(|(id, r)| (r.seq, id.clone()))
                .collect::<Vec<_>>();
            let mut removed = finished
                .into_iter()
                .filter_map(|(seq, id)| inner.jobs.remove(&id).map(|r| (seq, id, r.thread)))
                .collect::<Vec<_>>();
            removed.sort_by_key(|(seq, _, _)| *seq);
            removed
        };

        removed
            .into_iter()
            .map(|(_, id, thread)| {
                if let Some(thread) = thread {
                    if thread.join().is_err() {
                        warn!(job_id = %id, "job thread panicked");
                    }
                }
                id
            })
            .collect()
    }

    /// Re-checks completed outputs on disk and flips
    /// `Completed ⇄ FileDeletedOrMoved`. Returns the jobs that changed.
    pub fn refresh_outputs(&self) -> Vec<(String, JobStatus, PathBuf)> {
        let mut inner = self.inner.lock();
        let mut changed = Vec::new();
        for (id, record) in inner.jobs.iter_mut() {
            let snapshot = &mut record.snapshot;
            let exists = snapshot.output_path.exists();
            let next = match (snapshot.status, exists) {
                (JobStatus::Completed, false) => JobStatus::FileDeletedOrMoved,
                (JobStatus::FileDeletedOrMoved, true) => JobStatus::Completed,
                _ => continue,
            };
            snapshot.status = next;
            changed.push((id.clone(), next, snapshot.output_path.clone()));
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn register(registry: &JobRegistry, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        registry.insert(
            id.to_string(),
            &EncodeParameters::default(),
            3,
            token.clone(),
            thread::spawn(|| {}),
        );
        token
    }

    #[test]
    fn cancel_depends_on_status() {
        let registry = JobRegistry::new();
        let processing = register(&registry, "a");
        register(&registry, "b");
        assert!(registry.set_status("a", JobStatus::Processing, true, None));

        assert_eq!(registry.cancel("a"), CancelOutcome::Requested);
        assert!(processing.is_canceled());
        assert_eq!(registry.status("a"), Some(JobStatus::Processing));

        assert_eq!(registry.cancel("b"), CancelOutcome::Removed);
        assert_eq!(registry.status("b"), None);
        assert_eq!(registry.cancel("missing"), CancelOutcome::NotFound);
    }

    #[test]
    fn terminal_status_is_not_overwritten() {
        let registry = JobRegistry::new();
        register(&registry, "a");
        assert!(registry.set_status("a", JobStatus::Canceled, false, None));
        assert!(!registry.set_status("a", JobStatus::Completed, false, None));
        assert_eq!(registry.status("a"), Some(JobStatus::Canceled));
    }

    #[test]
    fn clear_finished_is_idempotent() {
        let registry = JobRegistry::new();
        for id in ["a", "b", "c"] {
            register(&registry, id);
        }
        registry.set_status("a", JobStatus::Completed, false, None);
        registry.set_status("b", JobStatus::Error, false, None);

        assert_eq!(registry.clear_finished(), vec!["a", "b"]);
        assert!(registry.clear_finished().is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].id, "c");
    }

    #[test]
    fn refresh_tracks_output_presence() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.gif");
        let registry = JobRegistry::new();
        let params = EncodeParameters {
            output_path: out.clone(),
            ..Default::default()
        };
        registry.insert(
            "a".into(),
            &params,
            1,
            CancellationToken::new(),
            thread::spawn(|| {}),
        );
        registry.set_status("a", JobStatus::Completed, false, None);

        let changed = registry.refresh_outputs();
        assert_eq!(changed.len(), 1);
        assert_eq!(registry.status("a"), Some(JobStatus::FileDeletedOrMoved));

        std::fs::write(&out, b"gif").unwrap();
        registry.refresh_outputs();
        assert_eq!(registry.status("a"), Some(JobStatus::Completed));
        assert!(registry.refresh_outputs().is_empty());
    }
}
