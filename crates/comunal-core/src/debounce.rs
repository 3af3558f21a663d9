//! Debounced saves.
//!
//! Each document is either idle or has exactly one pending timer holding the
//! latest payload. A new request replaces the pending one; when the idle
//! window passes without another request the timer writes the payload it
//! holds. Immediate requests cancel the timer and write on the caller's
//! thread. A write that has already started is never cancelled.
//!
//! Every request and every cancel draws a generation number. Writes to one
//! document run under a per-document fence holding the newest generation
//! that claimed it, and a write whose generation is older than the fence is
//! skipped. A timer that took its payload just before an immediate write or a
//! cancel therefore cannot land stale data afterwards.

use crate::error::StoreError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Something that can persist one named document.
pub trait DocumentWriter: Send + Sync + 'static {
    fn document_name(&self) -> &str;
    fn write_document(&self, payload: &Value) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDisposition {
    Written,
    Scheduled,
    /// A newer write or a cancel claimed the document first.
    Superseded,
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub written: Vec<String>,
    pub failed: Vec<(String, StoreError)>,
}

struct Pending {
    generation: u64,
    timer: JoinHandle<()>,
    payload: Value,
    writer: Arc<dyn DocumentWriter>,
}

/// Newest generation allowed to write; held for the duration of a write.
type Fence = Arc<Mutex<u64>>;

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    fence: Fence,
}

#[derive(Default)]
struct Shared {
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl Shared {
    fn issue_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Timer callback: write the pending payload if it is still the one this
    /// timer was scheduled for.
    fn fire(&self, document: &str, generation: u64) {
        let Some((pending, fence)) = self.take_due(document, generation) else {
            return;
        };
        match write_fenced(&fence, pending.generation, &*pending.writer, &pending.payload) {
            Ok(SaveDisposition::Written) => debug!(document, "debounced save written"),
            Ok(_) => debug!(document, "debounced save superseded"),
            Err(e) => error!(document, "debounced save failed: {e}"),
        }
    }

    fn take_due(&self, document: &str, generation: u64) -> Option<(Pending, Fence)> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(document)?;
        if slot.pending.as_ref().map(|p| p.generation) != Some(generation) {
            return None;
        }
        let pending = slot.pending.take()?;
        Some((pending, Arc::clone(&slot.fence)))
    }
}

fn write_fenced(
    fence: &Mutex<u64>,
    generation: u64,
    writer: &dyn DocumentWriter,
    payload: &Value,
) -> Result<SaveDisposition, StoreError> {
    let mut newest = fence.lock();
    if *newest > generation {
        return Ok(SaveDisposition::Superseded);
    }
    *newest = generation;
    writer.write_document(payload)?;
    Ok(SaveDisposition::Written)
}

pub struct DebounceCoordinator {
    runtime: Handle,
    window: Duration,
    shared: Arc<Shared>,
}

impl DebounceCoordinator {
    pub fn new(runtime: Handle, window: Duration) -> Self {
        Self {
            runtime,
            window,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Build on the runtime of the calling context, if there is one.
    pub fn from_current(window: Duration) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|runtime| Self::new(runtime, window))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn request_save(
        &self,
        writer: Arc<dyn DocumentWriter>,
        payload: Value,
        immediate: bool,
    ) -> Result<SaveDisposition, StoreError> {
        let document = writer.document_name().to_string();

        if immediate {
            let (generation, fence) = {
                let mut slots = self.shared.slots.lock();
                let slot = slots.entry(document.clone()).or_default();
                if let Some(pending) = slot.pending.take() {
                    pending.timer.abort();
                    debug!(document = %document, "pending save superseded by immediate write");
                }
                (self.shared.issue_generation(), Arc::clone(&slot.fence))
            };
            let disposition = write_fenced(&fence, generation, &*writer, &payload)?;
            if disposition == SaveDisposition::Superseded {
                debug!(document = %document, "immediate write overtaken by a newer one");
            }
            return Ok(disposition);
        }

        let mut slots = self.shared.slots.lock();
        let generation = self.shared.issue_generation();
        let slot = slots.entry(document.clone()).or_default();
        if let Some(previous) = slot.pending.take() {
            previous.timer.abort();
        }
        let shared = Arc::clone(&self.shared);
        let window = self.window;
        let task_document = document.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            let result =
                tokio::task::spawn_blocking(move || shared.fire(&task_document, generation)).await;
            if let Err(e) = result {
                if e.is_panic() {
                    error!("debounced save panicked: {e}");
                }
            }
        });
        slot.pending = Some(Pending {
            generation,
            timer,
            payload,
            writer,
        });
        Ok(SaveDisposition::Scheduled)
    }

    pub fn state(&self, document: &str) -> SaveState {
        let slots = self.shared.slots.lock();
        match slots.get(document).and_then(|s| s.pending.as_ref()) {
            Some(_) => SaveState::Pending,
            None => SaveState::Idle,
        }
    }

    pub fn pending_documents(&self) -> Vec<String> {
        let slots = self.shared.slots.lock();
        let mut names: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.pending.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop a pending save without writing it. Timer payloads taken before
    /// this call are fenced off too; a write already running is waited for.
    /// Returns whether a pending save was dropped.
    pub fn cancel(&self, document: &str) -> bool {
        let (dropped, generation, fence) = {
            let mut slots = self.shared.slots.lock();
            let slot = slots.entry(document.to_string()).or_default();
            let dropped = slot.pending.take();
            (dropped, self.shared.issue_generation(), Arc::clone(&slot.fence))
        };
        {
            let mut newest = fence.lock();
            *newest = (*newest).max(generation);
        }
        match dropped {
            Some(pending) => {
                pending.timer.abort();
                warn!(document, "pending save discarded");
                true
            }
            None => false,
        }
    }

    /// Write every pending payload now, on the calling thread.
    pub fn flush_all(&self) -> FlushReport {
        let drained: Vec<(String, Pending, Fence)> = {
            let mut slots = self.shared.slots.lock();
            slots
                .iter_mut()
                .filter_map(|(name, slot)| {
                    slot.pending
                        .take()
                        .map(|p| (name.clone(), p, Arc::clone(&slot.fence)))
                })
                .collect()
        };

        let mut report = FlushReport::default();
        for (document, pending, fence) in drained {
            pending.timer.abort();
            match write_fenced(&fence, pending.generation, &*pending.writer, &pending.payload) {
                Ok(SaveDisposition::Written) => report.written.push(document),
                Ok(_) => debug!(document = %document, "flush skipped a superseded payload"),
                Err(e) => {
                    error!(document = %document, "flush failed: {e}");
                    report.failed.push((document, e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    struct CountingWriter {
        name: String,
        writes: Mutex<Vec<Value>>,
    }

    impl CountingWriter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                writes: Mutex::new(Vec::new()),
            })
        }

        fn writes(&self) -> Vec<Value> {
            self.writes.lock().clone()
        }
    }

    impl DocumentWriter for CountingWriter {
        fn document_name(&self) -> &str {
            &self.name
        }

        fn write_document(&self, payload: &Value) -> Result<(), StoreError> {
            self.writes.lock().push(payload.clone());
            Ok(())
        }
    }

    const WINDOW: Duration = Duration::from_millis(60);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_collapses_into_one_write_of_last_payload() {
        let coordinator = DebounceCoordinator::new(Handle::current(), WINDOW);
        let writer = CountingWriter::new("habitantes.dat");
        for n in 0..10 {
            let disposition = coordinator
                .request_save(writer.clone(), json!({"n": n}), false)
                .unwrap();
            assert_eq!(disposition, SaveDisposition::Scheduled);
        }
        assert_eq!(coordinator.state("habitantes.dat"), SaveState::Pending);
        assert!(writer.writes().is_empty());

        sleep(WINDOW * 5).await;
        assert_eq!(writer.writes(), vec![json!({"n": 9})]);
        assert_eq!(coordinator.state("habitantes.dat"), SaveState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_spaced_beyond_window_each_write() {
        let coordinator = DebounceCoordinator::new(Handle::current(), WINDOW);
        let writer = CountingWriter::new("faenas.dat");
        coordinator.request_save(writer.clone(), json!(1), false).unwrap();
        sleep(WINDOW * 4).await;
        coordinator.request_save(writer.clone(), json!(2), false).unwrap();
        sleep(WINDOW * 4).await;
        assert_eq!(writer.writes(), vec![json!(1), json!(2)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_write_bypasses_and_cancels_timer() {
        let coordinator = DebounceCoordinator::new(Handle::current(), WINDOW);
        let writer = CountingWriter::new("perfiles.dat");
        coordinator
            .request_save(writer.clone(), json!({"v": "debounced"}), false)
            .unwrap();
        let disposition = coordinator
            .request_save(writer.clone(), json!({"v": "now"}), true)
            .unwrap();
        assert_eq!(disposition, SaveDisposition::Written);
        assert_eq!(writer.writes(), vec![json!({"v": "now"})]);
        assert_eq!(coordinator.state("perfiles.dat"), SaveState::Idle);

        sleep(WINDOW * 4).await;
        assert_eq!(writer.writes().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn documents_are_debounced_independently() {
        let coordinator = DebounceCoordinator::new(Handle::current(), WINDOW);
        let a = CountingWriter::new("a.dat");
        let b = CountingWriter::new("b.dat");
        for n in 0..3 {
            coordinator.request_save(a.clone(), json!(n), false).unwrap();
            coordinator.request_save(b.clone(), json!(n * 10), false).unwrap();
        }
        assert_eq!(coordinator.pending_documents(), vec!["a.dat", "b.dat"]);
        sleep(WINDOW * 5).await;
        assert_eq!(a.writes(), vec![json!(2)]);
        assert_eq!(b.writes(), vec![json!(20)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_and_cancel() {
        let coordinator = DebounceCoordinator::new(Handle::current(), Duration::from_secs(30));
        let kept = CountingWriter::new("kept.dat");
        let dropped = CountingWriter::new("dropped.dat");
        coordinator.request_save(kept.clone(), json!("final"), false).unwrap();
        coordinator.request_save(dropped.clone(), json!("lost"), false).unwrap();

        assert!(coordinator.cancel("dropped.dat"));
        assert!(!coordinator.cancel("dropped.dat"));

        let report = coordinator.flush_all();
        assert_eq!(report.written, vec!["kept.dat".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(kept.writes(), vec![json!("final")]);
        assert!(dropped.writes().is_empty());
        assert!(coordinator.pending_documents().is_empty());
    }

    fn pending_generation(coordinator: &DebounceCoordinator, document: &str) -> u64 {
        let slots = coordinator.shared.slots.lock();
        slots[document].pending.as_ref().unwrap().generation
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_payload_taken_before_immediate_write_is_not_written() {
        let coordinator = DebounceCoordinator::new(Handle::current(), Duration::from_secs(30));
        let writer = CountingWriter::new("habitantes.dat");
        coordinator
            .request_save(writer.clone(), json!({"v": "old"}), false)
            .unwrap();
        let generation = pending_generation(&coordinator, "habitantes.dat");

        // the timer has woken and taken its payload but not yet written it
        let (due, fence) = coordinator
            .shared
            .take_due("habitantes.dat", generation)
            .unwrap();
        due.timer.abort();

        let disposition = coordinator
            .request_save(writer.clone(), json!({"v": "new"}), true)
            .unwrap();
        assert_eq!(disposition, SaveDisposition::Written);

        let late = write_fenced(&fence, due.generation, &*due.writer, &due.payload).unwrap();
        assert_eq!(late, SaveDisposition::Superseded);
        assert_eq!(writer.writes(), vec![json!({"v": "new"})]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_fences_a_payload_already_taken_by_its_timer() {
        let coordinator = DebounceCoordinator::new(Handle::current(), Duration::from_secs(30));
        let writer = CountingWriter::new("faenas.dat");
        coordinator
            .request_save(writer.clone(), json!("stale"), false)
            .unwrap();
        let generation = pending_generation(&coordinator, "faenas.dat");
        let (due, fence) = coordinator.shared.take_due("faenas.dat", generation).unwrap();
        due.timer.abort();

        assert!(!coordinator.cancel("faenas.dat"));
        let late = write_fenced(&fence, due.generation, &*due.writer, &due.payload).unwrap();
        assert_eq!(late, SaveDisposition::Superseded);
        assert!(writer.writes().is_empty());

        // later requests still go through
        coordinator.request_save(writer.clone(), json!("fresh"), true).unwrap();
        assert_eq!(writer.writes(), vec![json!("fresh")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_timer_generation_is_ignored() {
        let coordinator = DebounceCoordinator::new(Handle::current(), Duration::from_secs(30));
        let writer = CountingWriter::new("perfiles.dat");
        coordinator.request_save(writer.clone(), json!(1), false).unwrap();
        let first = pending_generation(&coordinator, "perfiles.dat");
        coordinator.request_save(writer.clone(), json!(2), false).unwrap();
        assert!(coordinator.shared.take_due("perfiles.dat", first).is_none());
        coordinator.shared.fire("perfiles.dat", first);
        assert!(writer.writes().is_empty());
        assert_eq!(coordinator.flush_all().written, vec!["perfiles.dat".to_string()]);
        assert_eq!(writer.writes(), vec![json!(2)]);
    }

    #[test]
    fn from_current_needs_a_runtime() {
        assert!(DebounceCoordinator::from_current(WINDOW).is_none());
    }
}
