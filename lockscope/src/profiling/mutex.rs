//! Contention-sampling mutex
//!
//! `ProfiledMutex<T>` is a `std::sync::Mutex<T>` that reports contended
//! acquisitions to a [`ContentionContext`]. The fast path is a `try_lock`;
//! only when it fails does the lock consult the speed limit and time the
//! blocking wait. The sample is submitted from the guard's drop, after the
//! inner mutex is unlocked, so stack capture and pooling never extend the
//! critical section.
//!
//! Without an active profiler `lock()` is a plain `Mutex::lock`.

use super::context::{self, inside_sampling, ContentionContext};
use lockscope_common::ContentionSite;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{LockResult, Mutex, MutexGuard, PoisonError, TryLockError, TryLockResult};
use std::time::{Duration, Instant};

pub struct ProfiledMutex<T: ?Sized> {
    context: Option<&'static ContentionContext>,
    inner: Mutex<T>,
}

impl<T> ProfiledMutex<T> {
    /// Mutex reporting to the process-wide context.
    pub const fn new(value: T) -> Self {
        Self { context: None, inner: Mutex::new(value) }
    }

    /// Mutex reporting to `context` instead of the process-wide one.
    pub const fn with_context(value: T, context: &'static ContentionContext) -> Self {
        Self { context: Some(context), inner: Mutex::new(value) }
    }

    pub fn into_inner(self) -> LockResult<T> {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> ProfiledMutex<T> {
    fn context(&self) -> &'static ContentionContext {
        self.context.unwrap_or_else(context::global)
    }

    /// Acquire the mutex, sampling the wait if it was contended.
    pub fn lock(&self) -> LockResult<ProfiledMutexGuard<'_, T>> {
        let ctx = self.context();
        if !ctx.is_active() || inside_sampling() {
            return wrap(self.inner.lock(), ReleaseProbe::idle());
        }
        match self.inner.try_lock() {
            Ok(guard) => return Ok(ProfiledMutexGuard { guard, probe: ReleaseProbe::idle() }),
            Err(TryLockError::Poisoned(poisoned)) => {
                return Err(PoisonError::new(ProfiledMutexGuard {
                    guard: poisoned.into_inner(),
                    probe: ReleaseProbe::idle(),
                }));
            }
            Err(TryLockError::WouldBlock) => {}
        }

        let Some(sampling_range) = ctx.admit() else {
            return wrap(self.inner.lock(), ReleaseProbe::idle());
        };
        let version = ctx.version();
        let start = Instant::now();
        let result = self.inner.lock();
        let probe = ReleaseProbe {
            context: Some(ctx),
            version,
            site: ContentionSite { duration_ns: nanos(start.elapsed()), sampling_range },
            unlock_started: None,
        };
        wrap(result, probe)
    }

    /// Non-blocking acquire. Never sampled: it cannot wait.
    pub fn try_lock(&self) -> TryLockResult<ProfiledMutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(ProfiledMutexGuard { guard, probe: ReleaseProbe::idle() }),
            Err(TryLockError::Poisoned(poisoned)) => Err(TryLockError::Poisoned(PoisonError::new(
                ProfiledMutexGuard { guard: poisoned.into_inner(), probe: ReleaseProbe::idle() },
            ))),
            Err(TryLockError::WouldBlock) => Err(TryLockError::WouldBlock),
        }
    }

    pub fn get_mut(&mut self) -> LockResult<&mut T> {
        self.inner.get_mut()
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.is_poisoned()
    }
}

impl<T: Default> Default for ProfiledMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for ProfiledMutex<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ProfiledMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfiledMutex").field("inner", &&self.inner).finish_non_exhaustive()
    }
}

/// RAII guard for [`ProfiledMutex`]
///
/// Field order matters: `guard` is dropped (unlocking the mutex) before
/// `probe` submits the sample.
pub struct ProfiledMutexGuard<'a, T: ?Sized> {
    guard: MutexGuard<'a, T>,
    probe: ReleaseProbe,
}

impl<T: ?Sized> Deref for ProfiledMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for ProfiledMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for ProfiledMutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.probe.context.is_some() {
            self.probe.unlock_started = Some(Instant::now());
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ProfiledMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.guard, f)
    }
}

/// Pending contention report carried by a sampled guard
struct ReleaseProbe {
    context: Option<&'static ContentionContext>,
    version: u64,
    site: ContentionSite,
    unlock_started: Option<Instant>,
}

impl ReleaseProbe {
    const fn idle() -> Self {
        Self { context: None, version: 0, site: ContentionSite::new(0), unlock_started: None }
    }
}

impl Drop for ReleaseProbe {
    fn drop(&mut self) {
        let Some(ctx) = self.context else {
            return;
        };
        if let Some(started) = self.unlock_started {
            self.site.duration_ns = self.site.duration_ns.saturating_add(nanos(started.elapsed()));
        }
        ctx.submit_contention(&self.site, self.version);
    }
}

fn wrap<T: ?Sized>(
    result: LockResult<MutexGuard<'_, T>>,
    probe: ReleaseProbe,
) -> LockResult<ProfiledMutexGuard<'_, T>> {
    match result {
        Ok(guard) => Ok(ProfiledMutexGuard { guard, probe }),
        Err(poisoned) => Err(PoisonError::new(ProfiledMutexGuard { guard: poisoned.into_inner(), probe })),
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectorConfig;
    use crate::profiling::context::ContextOptions;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn test_context() -> &'static ContentionContext {
        ContentionContext::leak(ContextOptions {
            collector: CollectorConfig::new(Duration::from_millis(50), 1000).unwrap(),
            expected_per_second: 1000,
        })
        .unwrap()
    }

    #[test]
    fn test_plain_locking_without_profiler() {
        let ctx = test_context();
        let mutex = ProfiledMutex::with_context(0_u32, ctx);
        *mutex.lock().unwrap() += 1;
        *mutex.try_lock().unwrap() += 1;
        assert_eq!(mutex.into_inner().unwrap(), 2);
        assert!(ctx.collector_stats().is_none());
    }

    #[test]
    fn test_unsized_mutex_debug() {
        let mutex: &ProfiledMutex<[u8]> = &ProfiledMutex::with_context([1_u8, 2], test_context());
        assert_eq!(mutex.lock().unwrap().len(), 2);
        let rendered = format!("{mutex:?}");
        assert!(rendered.starts_with("ProfiledMutex"));
        assert!(rendered.contains("[1, 2]"));
    }

    #[test]
    fn test_try_lock_would_block() {
        let mutex = ProfiledMutex::with_context((), test_context());
        let _held = mutex.lock().unwrap();
        assert!(matches!(mutex.try_lock(), Err(TryLockError::WouldBlock)));
    }

    #[test]
    fn test_poison_is_reported() {
        let mutex = Arc::new(ProfiledMutex::with_context(5, test_context()));
        let clone = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        let recovered = mutex.lock().unwrap_err().into_inner();
        assert_eq!(*recovered, 5);
    }

    #[test]
    fn test_uncontended_locks_are_not_sampled() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context();
        ctx.start_profiler(dir.path().join("quiet.prof")).unwrap();
        let mutex = ProfiledMutex::with_context(0_u64, ctx);
        for _ in 0..100 {
            *mutex.lock().unwrap() += 1;
        }
        let summary = ctx.stop_profiler().unwrap();
        assert_eq!(summary.samples, 0);
    }

    #[test]
    fn test_contended_wait_is_sampled() {
        const HOLD: Duration = Duration::from_millis(40);
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context();
        ctx.start_profiler(dir.path().join("contended.prof")).unwrap();

        let mutex = Arc::new(ProfiledMutex::with_context(0_u64, ctx));
        let barrier = Arc::new(Barrier::new(2));
        let holder = {
            let mutex = Arc::clone(&mutex);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut guard = mutex.lock().unwrap();
                barrier.wait();
                thread::sleep(HOLD);
                *guard += 1;
            })
        };
        barrier.wait();
        *mutex.lock().unwrap() += 1;
        holder.join().unwrap();

        let summary = ctx.stop_profiler().unwrap();
        assert_eq!(summary.samples, 1);
        // the uncalibrated limiter admits at full range, so no scaling
        assert!(summary.total_duration_ns >= nanos(HOLD) / 2);
        assert_eq!(*mutex.lock().unwrap(), 2);
    }
}
