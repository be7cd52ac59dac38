//! The cleaner thread's lifecycle handle. Periodically picks an internal
//! pair with the largest accumulated `workdone` and flushes its buffered
//! messages toward a child, independent of any foreground insert.
//!
//! The handle's `Drop` impl signals shutdown and joins the thread, so a
//! closed file never leaves a cleaner thread running against a freed
//! cache.

use crate::cache::file::CacheFile;
use crate::cache::table::CacheTable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Owns the background cleaner thread for one [`CacheTable`]. Dropping
/// this handle signals the thread to stop and joins it, so a closed file
/// never leaves a cleaner thread running against a freed cache.
pub struct CleanerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CleanerHandle {
    /// Spawns the cleaner thread: every `period`, runs `iterations` sweeps
    /// of [`CacheTable::run_cleaner_once`]. Both are caller-tunable.
    pub fn spawn<F: CacheFile + 'static>(
        table: Arc<CacheTable<F>>,
        period: Duration,
        iterations: u32,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let thread = std::thread::spawn(move || {
            while !shutdown_for_thread.load(Ordering::Acquire) {
                std::thread::sleep(period);
                if shutdown_for_thread.load(Ordering::Acquire) {
                    break;
                }
                for _ in 0..iterations {
                    table.run_cleaner_once();
                }
            }
        });
        Self { shutdown, thread: Some(thread) }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            log::debug!("cleaner thread stopped");
        }
    }
}
