//! Background committer
//!
//! A thread that commits once enough journal has accumulated, and trims the
//! resident index while it is at it. Journal writers wake it when they push
//! the volume over the threshold; otherwise it polls.

use crate::store::Store;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handle of the background thread; stops it when dropped
pub struct BackgroundCommit {
    store: Arc<Store>,
    thread: Option<JoinHandle<()>>,
    running: Arc<Mutex<bool>>,
}

impl BackgroundCommit {
    pub fn is_running(&self) -> bool {
        *self.running.lock()
    }

    pub fn stop(&mut self) {
        *self.running.lock() = false;
        {
            let mut wake = self.store.bg_wake.lock();
            *wake = true;
            self.store.bg_cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BackgroundCommit {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the background committer of `store`
pub fn spawn_background(store: &Arc<Store>) -> BackgroundCommit {
    let running = Arc::new(Mutex::new(true));
    let thread = {
        let store = Arc::clone(store);
        let running = Arc::clone(&running);
        thread::spawn(move || background_loop(&store, &running))
    };
    BackgroundCommit {
        store: Arc::clone(store),
        thread: Some(thread),
        running,
    }
}

fn background_loop(store: &Store, running: &Mutex<bool>) {
    let interval = Duration::from_millis(store.config.bg_interval_ms.max(1));
    // Start trimming well before the arena limit turns into NoMemory
    let shrink_above = store.config.max_resident_znodes / 4 * 3;

    while *running.lock() {
        {
            let mut wake = store.bg_wake.lock();
            if !*wake {
                store.bg_cv.wait_for(&mut wake, interval);
            }
            *wake = false;
        }
        if !*running.lock() {
            break;
        }
        if store.is_read_only() {
            continue;
        }

        let pending = store.bg_bytes.load(Ordering::Acquire);
        if pending >= store.config.bg_commit_bytes {
            debug!("background commit after {} journal bytes", pending);
            if let Err(e) = store.run_commit(false) {
                warn!("background commit failed: {}", e);
            }
        }
        if store.index_stats().resident > shrink_above {
            store.shrink(store.config.shrink_batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::io::MemDevice;
    use crate::node::InodeNode;
    use crate::store::MountMode;
    use std::time::Instant;

    #[test]
    fn test_commits_after_threshold() {
        let mut config = Config::small(4096, 32);
        config.bg_commit_bytes = 2048;
        config.bg_interval_ms = 10;
        let dev = Arc::new(MemDevice::for_config(&config));
        Store::format(&*dev, &config).unwrap();
        let store = Arc::new(Store::mount(dev, config, MountMode::ReadWrite).unwrap());
        let mut bg = spawn_background(&store);
        assert!(bg.is_running());

        let before = store.commit_number();
        for inum in 100..140 {
            store.write_inode(&InodeNode::new(inum, 0o644)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.commit_number() == before && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(store.commit_number() > before);

        bg.stop();
        assert!(!bg.is_running());
    }

    #[test]
    fn test_idle_volume_is_left_alone() {
        let mut config = Config::small(4096, 16);
        config.bg_interval_ms = 5;
        let dev = Arc::new(MemDevice::for_config(&config));
        Store::format(&*dev, &config).unwrap();
        let store = Arc::new(Store::mount(dev, config, MountMode::ReadWrite).unwrap());
        store.run_commit(true).unwrap();
        let cmt = store.commit_number();
        let bg = spawn_background(&store);
        thread::sleep(Duration::from_millis(50));
        drop(bg);
        assert_eq!(store.commit_number(), cmt);
    }
}
