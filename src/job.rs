//! Job execution seam
//!
//! What a job actually does is outside the coordinator. A `JobRunner` is
//! handed the PROCESS parameters and a `JobControl` through which it reports
//! events and polls for interrupts between units of work.

use crate::distributed::protocol::{InterruptKind, NamedObject, ProcessMessage, WorkerStats};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Event emitted by a running job
#[derive(Debug, Clone)]
pub enum JobEvent {
    Progress { total: i64, processed: i64 },
    Output(NamedObject),
    Feedback(Vec<NamedObject>),
    Log(String),
}

/// Pending interrupt, shared between the job and whoever delivers signals
///
/// The most severe interrupt raised wins (Shutdown > Hard > Soft).
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicU8);

impl InterruptFlag {
    pub fn raise(&self, kind: InterruptKind) {
        self.0.fetch_max(severity(kind), Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<InterruptKind> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            1 => Some(InterruptKind::Soft),
            2 => Some(InterruptKind::Hard),
            _ => Some(InterruptKind::Shutdown),
        }
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

fn severity(kind: InterruptKind) -> u8 {
    match kind {
        InterruptKind::Soft => 1,
        InterruptKind::Hard => 2,
        InterruptKind::Shutdown => 3,
    }
}

/// Handle given to a running job
#[derive(Clone)]
pub struct JobControl {
    events: mpsc::UnboundedSender<JobEvent>,
    interrupt: Arc<InterruptFlag>,
}

impl JobControl {
    pub fn new(events: mpsc::UnboundedSender<JobEvent>, interrupt: Arc<InterruptFlag>) -> Self {
        Self { events, interrupt }
    }

    pub fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    pub fn progress(&self, total: i64, processed: i64) {
        self.emit(JobEvent::Progress { total, processed });
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(JobEvent::Log(line.into()));
    }

    pub fn interrupted(&self) -> Option<InterruptKind> {
        self.interrupt.current()
    }

    /// True when the job should stop before its next unit of work
    pub fn should_stop(&self) -> bool {
        self.interrupted().is_some()
    }

    /// True when in-flight work must be abandoned
    pub fn must_abort(&self) -> bool {
        matches!(self.interrupted(), Some(InterruptKind::Hard | InterruptKind::Shutdown))
    }
}

/// Result of one job run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobReport {
    pub stats: WorkerStats,
    /// Zero on success
    pub status: i32,
}

/// Executes the job on one worker (or locally)
pub trait JobRunner: Send + Sync {
    fn run(&self, job: &ProcessMessage, control: &JobControl) -> anyhow::Result<JobReport>;
}

/// Walks the requested entry range, reporting progress
///
/// Each entry counts as one unit of work and `entry_bytes` bytes read.
#[derive(Debug, Clone)]
pub struct CountingRunner {
    pub entry_bytes: u64,
    pub entry_delay: std::time::Duration,
    /// Entries processed when the job asks for all (-1)
    pub default_entries: i64,
}

impl Default for CountingRunner {
    fn default() -> Self {
        Self {
            entry_bytes: 1024,
            entry_delay: std::time::Duration::ZERO,
            default_entries: 1000,
        }
    }
}

impl JobRunner for CountingRunner {
    fn run(&self, job: &ProcessMessage, control: &JobControl) -> anyhow::Result<JobReport> {
        let started = Instant::now();
        let total = if job.entries < 0 { self.default_entries } else { job.entries };
        let step = (total / 10).max(1);

        control.log(format!("processing {} entries with {}", total, job.selector));

        let mut processed = 0;
        while processed < total {
            if control.should_stop() {
                break;
            }
            if !self.entry_delay.is_zero() {
                std::thread::sleep(self.entry_delay);
            }
            processed += 1;
            if processed % step == 0 || processed == total {
                control.progress(total, processed);
            }
        }

        let aborted = control.must_abort();
        if !aborted {
            control.emit(JobEvent::Output(NamedObject::new(
                "entries",
                processed.to_le_bytes().to_vec(),
            )));
        }

        let elapsed = started.elapsed().as_secs_f32();
        Ok(JobReport {
            stats: WorkerStats {
                bytes_read: processed as u64 * self.entry_bytes,
                real_time: elapsed,
                cpu_time: elapsed,
            },
            status: if aborted { 1 } else { 0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(entries: i64) -> ProcessMessage {
        ProcessMessage {
            dataset: "ds".into(),
            selector: "count".into(),
            options: String::new(),
            entries,
            first_entry: 0,
            inputs: Vec::new(),
        }
    }

    #[test]
    fn test_interrupt_flag_keeps_most_severe() {
        let flag = InterruptFlag::default();
        assert_eq!(flag.current(), None);

        flag.raise(InterruptKind::Hard);
        flag.raise(InterruptKind::Soft);
        assert_eq!(flag.current(), Some(InterruptKind::Hard));

        flag.raise(InterruptKind::Shutdown);
        assert_eq!(flag.current(), Some(InterruptKind::Shutdown));

        flag.clear();
        assert_eq!(flag.current(), None);
    }

    #[test]
    fn test_counting_runner_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let control = JobControl::new(tx, Arc::new(InterruptFlag::default()));

        let report = CountingRunner::default().run(&job(20), &control).unwrap();
        assert_eq!(report.status, 0);
        assert_eq!(report.stats.bytes_read, 20 * 1024);

        let mut last_progress = None;
        let mut outputs = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                JobEvent::Progress { processed, .. } => last_progress = Some(processed),
                JobEvent::Output(_) => outputs += 1,
                _ => {}
            }
        }
        assert_eq!(last_progress, Some(20));
        assert_eq!(outputs, 1);
    }

    #[test]
    fn test_hard_interrupt_aborts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let flag = Arc::new(InterruptFlag::default());
        flag.raise(InterruptKind::Hard);
        let control = JobControl::new(tx, flag);

        let report = CountingRunner::default().run(&job(100), &control).unwrap();
        assert_eq!(report.status, 1);
        assert_eq!(report.stats.bytes_read, 0);
    }

    #[test]
    fn test_soft_interrupt_finishes_cleanly() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let flag = Arc::new(InterruptFlag::default());
        flag.raise(InterruptKind::Soft);
        let control = JobControl::new(tx, flag);

        let report = CountingRunner::default().run(&job(100), &control).unwrap();
        assert_eq!(report.status, 0);
    }
}
