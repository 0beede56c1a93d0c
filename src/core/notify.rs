//! Purpose: Best-effort store-wide wakeups via a named semaphore, with a polling fallback.
//! Exports: `Notifier`, `WaitOutcome`, `store_semaphore_name`.
//! Role: Lets blocked get/wait/receive_next wake early after a seal or delete.
//! Invariants: Correctness never depends on a post; waiters always re-check the store.
//! Invariants: Unsupported semaphore operations degrade to sleeping for the tick.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

// macOS caps semaphore names at 31 bytes.
const NAME_HEX_LEN: usize = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Debug)]
pub(crate) enum NotifyError {
    Unavailable,
    Io(io::Error),
}

pub(crate) trait SemaphoreBackend: Send + Sync {
    type Handle: Send + Sync;

    fn open(&self, name: &str) -> Result<Self::Handle, NotifyError>;
    fn post(&self, handle: &Self::Handle) -> Result<(), NotifyError>;
    fn wait(&self, handle: &Self::Handle, timeout: Duration) -> Result<WaitOutcome, NotifyError>;
    fn close(&self, handle: &Self::Handle);
}

pub(crate) struct Semaphore<B: SemaphoreBackend> {
    handle: B::Handle,
    backend: B,
}

impl<B: SemaphoreBackend> Semaphore<B> {
    fn open_with_backend(name: &str, backend: B) -> Result<Self, NotifyError> {
        let handle = backend.open(name)?;
        Ok(Self { handle, backend })
    }

    fn post(&self) -> Result<(), NotifyError> {
        self.backend.post(&self.handle)
    }

    fn wait(&self, timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        self.backend.wait(&self.handle, timeout)
    }
}

impl<B: SemaphoreBackend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.backend.close(&self.handle);
    }
}

pub(crate) struct OsSemaphoreBackend;

#[cfg(unix)]
pub(crate) struct SemHandle(*mut libc::sem_t);

// SAFETY: POSIX named semaphores are process-shared and safe to use from any thread.
#[cfg(unix)]
unsafe impl Send for SemHandle {}
#[cfg(unix)]
unsafe impl Sync for SemHandle {}

#[cfg(unix)]
impl SemaphoreBackend for OsSemaphoreBackend {
    type Handle = SemHandle;

    fn open(&self, name: &str) -> Result<Self::Handle, NotifyError> {
        let full = format!("/{name}");
        let c_name = CString::new(full).map_err(|_| NotifyError::Unavailable)?;
        let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t;
        let handle =
            unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, mode as libc::c_uint, 0) };
        if handle == libc::SEM_FAILED {
            return Err(map_sem_error(io::Error::last_os_error()));
        }
        Ok(SemHandle(handle))
    }

    fn post(&self, handle: &Self::Handle) -> Result<(), NotifyError> {
        let rc = unsafe { libc::sem_post(handle.0) };
        if rc != 0 {
            return Err(map_sem_error(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn wait(&self, handle: &Self::Handle, timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        let start = Instant::now();
        let poll = Duration::from_millis(2).min(timeout.max(Duration::from_millis(1)));

        loop {
            let rc = unsafe { libc::sem_trywait(handle.0) };
            if rc == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN => {
                    if start.elapsed() >= timeout {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    std::thread::sleep(poll);
                }
                Some(code) if code == libc::EINTR => continue,
                _ => return Err(map_sem_error(err)),
            }
        }
    }

    fn close(&self, handle: &Self::Handle) {
        unsafe {
            libc::sem_close(handle.0);
        }
    }
}

#[cfg(not(unix))]
impl SemaphoreBackend for OsSemaphoreBackend {
    type Handle = ();

    fn open(&self, _name: &str) -> Result<Self::Handle, NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn post(&self, _handle: &Self::Handle) -> Result<(), NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn wait(&self, _handle: &Self::Handle, _timeout: Duration) -> Result<WaitOutcome, NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn close(&self, _handle: &Self::Handle) {}
}

#[cfg(unix)]
fn map_sem_error(err: io::Error) -> NotifyError {
    match err.raw_os_error() {
        Some(code) if code == libc::ENOSYS || code == libc::ENOTSUP => NotifyError::Unavailable,
        _ => NotifyError::Io(err),
    }
}

/// Store-wide wakeup channel shared by every connection to one store.
pub struct Notifier {
    semaphore: Option<Semaphore<OsSemaphoreBackend>>,
}

impl Notifier {
    pub fn for_store(root: &Path) -> Self {
        let name = store_semaphore_name(root);
        let semaphore = match Semaphore::open_with_backend(&name, OsSemaphoreBackend) {
            Ok(semaphore) => Some(semaphore),
            Err(err) => {
                tracing::warn!(?err, "store notify semaphore unavailable; falling back to polling");
                None
            }
        };
        Self { semaphore }
    }

    pub fn is_available(&self) -> bool {
        self.semaphore.is_some()
    }

    pub fn post(&self) {
        if let Some(semaphore) = &self.semaphore {
            if let Err(err) = semaphore.post() {
                tracing::debug!(?err, "notify post failed");
            }
        }
    }

    /// Sleeps at most `tick`, returning early when another client posts.
    pub fn wait_tick(&self, tick: Duration) -> WaitOutcome {
        match &self.semaphore {
            Some(semaphore) => match semaphore.wait(tick) {
                Ok(outcome) => outcome,
                Err(_) => {
                    std::thread::sleep(tick);
                    WaitOutcome::TimedOut
                }
            },
            None => {
                std::thread::sleep(tick);
                WaitOutcome::TimedOut
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("available", &self.is_available())
            .finish()
    }
}

pub fn store_semaphore_name(root: &Path) -> String {
    let bytes = canonical_path_bytes(root);
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(NAME_HEX_LEN);
    for byte in digest.iter().take(NAME_HEX_LEN / 2) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("shms-{hex}")
}

fn canonical_path_bytes(path: &Path) -> Vec<u8> {
    let resolved = std::fs::canonicalize(path);
    let path = resolved.as_ref().map_or(path, |value| value.as_path());
    #[cfg(unix)]
    {
        path.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        path.to_string_lossy().as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Condvar, Mutex};

    #[derive(Clone, Default)]
    struct TestBackend {
        semaphores: Arc<Mutex<HashMap<String, Arc<TestSemaphoreState>>>>,
    }

    struct TestSemaphoreState {
        count: Mutex<u64>,
        ready: Condvar,
    }

    impl SemaphoreBackend for TestBackend {
        type Handle = Arc<TestSemaphoreState>;

        fn open(&self, name: &str) -> Result<Self::Handle, NotifyError> {
            let mut guard = self.semaphores.lock().expect("lock");
            Ok(guard
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(TestSemaphoreState {
                        count: Mutex::new(0),
                        ready: Condvar::new(),
                    })
                })
                .clone())
        }

        fn post(&self, handle: &Self::Handle) -> Result<(), NotifyError> {
            let mut count = handle.count.lock().expect("lock");
            *count += 1;
            handle.ready.notify_all();
            Ok(())
        }

        fn wait(
            &self,
            handle: &Self::Handle,
            timeout: Duration,
        ) -> Result<WaitOutcome, NotifyError> {
            let count = handle.count.lock().expect("lock");
            let (mut count, _) = handle
                .ready
                .wait_timeout_while(count, timeout, |count| *count == 0)
                .expect("wait");
            if *count > 0 {
                *count -= 1;
                return Ok(WaitOutcome::Signaled);
            }
            Ok(WaitOutcome::TimedOut)
        }

        fn close(&self, _handle: &Self::Handle) {}
    }

    #[test]
    fn semaphore_name_is_stable_and_short() {
        let path = Path::new(".scratch/stores/test");
        let first = store_semaphore_name(path);
        let second = store_semaphore_name(path);
        assert_eq!(first, second);
        assert!(first.starts_with("shms-"));
        assert!(first.len() + 1 <= 31);
    }

    #[test]
    fn distinct_stores_get_distinct_names() {
        assert_ne!(
            store_semaphore_name(Path::new("/tmp/store-a")),
            store_semaphore_name(Path::new("/tmp/store-b"))
        );
    }

    #[test]
    fn test_backend_post_wakes_other_handle() {
        let backend = TestBackend::default();
        let name = store_semaphore_name(Path::new("test-store"));
        let waiter = Semaphore::open_with_backend(&name, backend.clone()).expect("open");
        let poster = Semaphore::open_with_backend(&name, backend).expect("open");

        assert_eq!(
            waiter.wait(Duration::from_millis(5)).expect("wait"),
            WaitOutcome::TimedOut
        );
        poster.post().expect("post");
        assert_eq!(
            waiter.wait(Duration::from_millis(50)).expect("wait"),
            WaitOutcome::Signaled
        );
    }

    #[test]
    fn notifier_tick_is_bounded_without_posts() {
        let notifier = Notifier { semaphore: None };
        let start = Instant::now();
        assert_eq!(notifier.wait_tick(Duration::from_millis(5)), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(!notifier.is_available());
    }
}
