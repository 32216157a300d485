//! Round-robin worker pinning

/// Pin the current thread to core `worker % cores`. Best effort: silently
/// degrades to unpinned when the platform exposes no core ids.
pub(crate) fn pin_round_robin(worker: usize) {
    let Some(cores) = core_affinity::get_core_ids() else {
        return;
    };
    if cores.is_empty() {
        return;
    }
    let core = cores[worker % cores.len()];
    if !core_affinity::set_for_current(core) {
        tracing::debug!(worker, "failed to pin worker thread");
    }
}
