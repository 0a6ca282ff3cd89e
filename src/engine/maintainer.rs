//! STRATA - Segment Maintainer
//! Starts a merge whenever the read-only queue grows past the configured
//! threshold. The queue is checked after every segment zero move and again
//! after every successful merge, so segments frozen while a merge was
//! running are picked up once it ends.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{MergeHandle, Shared, Strata};
use crate::types::{MergeResult, Record};

type Tasks = Arc<Mutex<Vec<MergeHandle>>>;

fn merge_if_needed<K: Record, V: Record + Default>(
    weak: &Weak<Shared<K, V>>,
    tasks: &Tasks,
    threshold: usize,
) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let engine = Strata::from_shared(shared);
    if engine.read_only_segments_count() < threshold || engine.is_merging() {
        return;
    }
    log::debug!(
        "Read-only queue holds {} segments, starting a merge",
        engine.read_only_segments_count()
    );
    let handle = engine.start_merge_operation();
    let mut tasks = tasks.lock();
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

/// Background merge scheduler attached to one engine.
///
/// Handles of the merges it starts are kept until
/// [`complete_running_tasks`](Maintainer::complete_running_tasks) joins them.
pub struct Maintainer {
    tasks: Tasks,
}

impl Maintainer {
    pub fn new<K: Record, V: Record + Default>(engine: &Strata<K, V>) -> Self {
        let tasks: Tasks = Arc::new(Mutex::new(Vec::new()));
        let threshold = engine.options().config.read_only_segments_merge_threshold;

        let (weak, pending) = (engine.downgrade(), tasks.clone());
        engine.on_segment_zero_moved_forward(move |_| {
            merge_if_needed(&weak, &pending, threshold);
        });

        let (weak, pending) = (engine.downgrade(), tasks.clone());
        engine.on_merge_operation_ended(move |result| {
            if result == MergeResult::Success {
                merge_if_needed(&weak, &pending, threshold);
            }
        });
        Self { tasks }
    }

    /// Number of merges started and not yet joined.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every merge started so far, including merges those merges
    /// started on completion.
    pub fn complete_running_tasks(&self) -> Vec<MergeResult> {
        let mut results = Vec::new();
        loop {
            let handles: Vec<MergeHandle> = std::mem::take(&mut *self.tasks.lock());
            if handles.is_empty() {
                return results;
            }
            results.extend(handles.into_iter().map(MergeHandle::join));
        }
    }
}
