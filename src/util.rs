//! Small thread helpers shared by the long-running loop threads.

/// Pin the calling thread to one CPU core. Latency-critical loop threads
/// (the follower, the dispatch worker) opt in so the scheduler cannot
/// migrate them mid-deadline.
pub(crate) fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::warn!(core, "failed to pin thread to core");
        } else {
            tracing::info!(core, "thread pinned to core");
        }
    }
}
