//! Working-tree coordination shared by every pipeline invocation in the process.
use super::error::PipelineError;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the lock guarding one working directory. Two invocations on the
/// same source share it; different sources proceed in parallel.
pub fn lock_for(working_dir: &Path) -> Arc<Mutex<()>> {
    let mut locks = LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks
        .entry(working_dir.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Runs `f` while holding the lock for `working_dir`.
pub fn with_lock<T>(working_dir: &Path, f: impl FnOnce() -> T) -> T {
    let lock = lock_for(working_dir);
    let _guard: MutexGuard<()> = lock.lock().unwrap_or_else(|e| e.into_inner());
    f()
}

/// Cooperative cancellation shared between the caller and a running stage.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            log::info!("Cancellation requested, stopping");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn should_hand_out_one_lock_per_directory() {
        let a = lock_for(Path::new("/tmp/subpack-test/a"));
        let again = lock_for(Path::new("/tmp/subpack-test/a"));
        let b = lock_for(Path::new("/tmp/subpack-test/b"));
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn should_serialize_work_on_the_same_directory() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let active = active.clone();
                let overlapped = overlapped.clone();
                thread::spawn(move || {
                    with_lock(Path::new("/tmp/subpack-test/shared"), || {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn should_report_cancellation_to_every_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(PipelineError::Cancelled)));
    }
}
