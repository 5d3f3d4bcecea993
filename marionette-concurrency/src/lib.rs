//! Process-wide concurrency control.
//!
//! One [`ConcurrencyManager`] arbitrates three independent resources for
//! every supervisor in the process:
//!
//! 1. **Task slots** — counted admission for concurrently running tasks.
//! 2. **Window locks** — exclusive per-hwnd locks, with an atomic batch
//!    acquire used at task start.
//! 3. **API gate** — a counting semaphore plus a minimum gap between
//!    model-call admissions.
//!
//! The resources it protects (OS windows, provider quota) are genuinely
//! process-global, so a single shared instance is the expected topology;
//! tests inject their own.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use marionette_types::{AgentError, Hwnd};

/// Tunables for the manager.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// How many tasks may run at once.
    pub max_concurrent_tasks: usize,
    /// How many model calls may be in flight at once.
    pub max_api_concurrency: usize,
    /// Default wait bound for a single window lock.
    pub window_lock_timeout: Duration,
    /// Per-window wait bound inside a batch acquire.
    pub batch_window_timeout: Duration,
    /// Minimum gap between model-call admissions.
    pub min_api_interval: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_api_concurrency: 5,
            window_lock_timeout: Duration::from_secs(300),
            batch_window_timeout: Duration::from_secs(10),
            min_api_interval: Duration::from_millis(100),
        }
    }
}

/// Bookkeeping for one admitted task.
#[derive(Debug, Clone)]
pub struct TaskSlotInfo {
    /// The admitted task.
    pub task_id: String,
    /// When the slot was taken.
    pub acquired_at: Instant,
    /// Windows the task declared.
    pub target_hwnds: HashSet<Hwnd>,
}

/// Ownership record for a held window lock. Dropping it releases the
/// underlying lock.
#[derive(Debug)]
struct WindowOwner {
    task_id: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

/// Point-in-time counters, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyStats {
    /// Currently admitted tasks.
    pub active_tasks: usize,
    /// Slot ceiling.
    pub max_tasks: usize,
    /// Currently held window locks.
    pub locked_windows: usize,
    /// Free API permits.
    pub available_api_slots: usize,
    /// API permit ceiling.
    pub max_api_concurrency: usize,
}

/// A held API permit. Dropping it releases the slot.
#[derive(Debug)]
pub struct ApiPermit {
    _permit: OwnedSemaphorePermit,
}

/// A held window lock bound to the manager. Dropping it releases the
/// window.
pub struct WindowLockGuard<'a> {
    manager: &'a ConcurrencyManager,
    hwnd: Hwnd,
}

impl Drop for WindowLockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_window(self.hwnd);
    }
}

/// The process-wide resource arbiter.
pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    active_tasks: StdMutex<HashMap<String, TaskSlotInfo>>,
    window_locks: StdMutex<HashMap<Hwnd, Arc<Mutex<()>>>>,
    window_owners: StdMutex<HashMap<Hwnd, WindowOwner>>,
    api_semaphore: Arc<Semaphore>,
    last_api_call: Mutex<Option<Instant>>,
}

impl ConcurrencyManager {
    /// Create a manager with the given limits.
    #[must_use]
    pub fn new(config: ConcurrencyConfig) -> Self {
        info!(
            max_tasks = config.max_concurrent_tasks,
            max_api = config.max_api_concurrency,
            "concurrency manager initialized"
        );
        let api_semaphore = Arc::new(Semaphore::new(config.max_api_concurrency));
        Self {
            config,
            active_tasks: StdMutex::new(HashMap::new()),
            window_locks: StdMutex::new(HashMap::new()),
            window_owners: StdMutex::new(HashMap::new()),
            api_semaphore,
            last_api_call: Mutex::new(None),
        }
    }

    /// The limits this manager enforces.
    #[must_use]
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    // --- task slots ---

    /// Try to admit a task. Non-blocking: returns `false` when all slots
    /// are taken. Idempotent for a task that already holds a slot.
    pub fn acquire_task_slot(&self, task_id: &str, target_hwnds: HashSet<Hwnd>) -> bool {
        let mut tasks = self.active_tasks.lock().expect("task slot map poisoned");
        if tasks.contains_key(task_id) {
            warn!(task_id, "task already holds a slot");
            return true;
        }
        if tasks.len() >= self.config.max_concurrent_tasks {
            info!(
                active = tasks.len(),
                max = self.config.max_concurrent_tasks,
                "no available task slots"
            );
            return false;
        }
        tasks.insert(
            task_id.to_string(),
            TaskSlotInfo {
                task_id: task_id.to_string(),
                acquired_at: Instant::now(),
                target_hwnds,
            },
        );
        debug!(task_id, active = tasks.len(), "task slot acquired");
        true
    }

    /// Release a task's slot. Idempotent.
    pub fn release_task_slot(&self, task_id: &str) {
        let mut tasks = self.active_tasks.lock().expect("task slot map poisoned");
        if tasks.remove(task_id).is_some() {
            debug!(task_id, active = tasks.len(), "task slot released");
        }
    }

    /// Currently admitted tasks.
    #[must_use]
    pub fn active_tasks(&self) -> HashMap<String, TaskSlotInfo> {
        self.active_tasks
            .lock()
            .expect("task slot map poisoned")
            .clone()
    }

    /// Number of currently admitted tasks.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.lock().expect("task slot map poisoned").len()
    }

    /// Free slots remaining.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.config
            .max_concurrent_tasks
            .saturating_sub(self.active_task_count())
    }

    // --- window locks ---

    fn lock_for(&self, hwnd: Hwnd) -> Arc<Mutex<()>> {
        let mut locks = self.window_locks.lock().expect("window lock map poisoned");
        Arc::clone(locks.entry(hwnd).or_default())
    }

    /// Try to take the exclusive lock for one window within `timeout`
    /// (the configured default when `None`). On timeout the current
    /// owner is logged and `false` returned.
    pub async fn acquire_window(
        &self,
        hwnd: Hwnd,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> bool {
        let wait = timeout.unwrap_or(self.config.window_lock_timeout);
        let lock = self.lock_for(hwnd);

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => {
                let mut owners = self.window_owners.lock().expect("window owner map poisoned");
                owners.insert(
                    hwnd,
                    WindowOwner {
                        task_id: task_id.to_string(),
                        acquired_at: Instant::now(),
                        _guard: guard,
                    },
                );
                debug!(hwnd, task_id, "window lock acquired");
                true
            }
            Err(_) => {
                let owner = self.get_window_owner(hwnd);
                warn!(
                    hwnd,
                    current_owner = owner.as_deref().unwrap_or("unknown"),
                    "window lock timeout"
                );
                false
            }
        }
    }

    /// Release a window lock. Idempotent; releasing an unheld window is
    /// a no-op.
    pub fn release_window(&self, hwnd: Hwnd) {
        let mut owners = self.window_owners.lock().expect("window owner map poisoned");
        if owners.remove(&hwnd).is_some() {
            debug!(hwnd, "window lock released");
        }
    }

    /// The task currently holding a window, if any.
    #[must_use]
    pub fn get_window_owner(&self, hwnd: Hwnd) -> Option<String> {
        self.window_owners
            .lock()
            .expect("window owner map poisoned")
            .get(&hwnd)
            .map(|o| o.task_id.clone())
    }

    /// Whether a window is currently locked.
    #[must_use]
    pub fn is_window_locked(&self, hwnd: Hwnd) -> bool {
        self.window_owners
            .lock()
            .expect("window owner map poisoned")
            .contains_key(&hwnd)
    }

    /// Take the lock for one window, releasing it when the guard drops.
    ///
    /// # Errors
    ///
    /// `AgentError::ResourceLock` when acquisition times out.
    pub async fn window_lock(
        &self,
        hwnd: Hwnd,
        task_id: &str,
    ) -> Result<WindowLockGuard<'_>, AgentError> {
        if self.acquire_window(hwnd, task_id, None).await {
            Ok(WindowLockGuard { manager: self, hwnd })
        } else {
            Err(AgentError::ResourceLock(format!(
                "failed to acquire window lock: hwnd={hwnd}"
            )))
        }
    }

    /// Acquire every window in `hwnds`, atomically: on any failure all
    /// locks taken by this call are released before returning `false`.
    ///
    /// Windows are taken in ascending hwnd order so two overlapping batch
    /// acquisitions cannot deadlock against each other.
    pub async fn acquire_windows(&self, hwnds: &HashSet<Hwnd>, task_id: &str) -> bool {
        let mut ordered: Vec<Hwnd> = hwnds.iter().copied().collect();
        ordered.sort_unstable();

        let mut acquired: Vec<Hwnd> = Vec::with_capacity(ordered.len());
        for hwnd in ordered {
            if self
                .acquire_window(hwnd, task_id, Some(self.config.batch_window_timeout))
                .await
            {
                acquired.push(hwnd);
            } else {
                for held in acquired {
                    self.release_window(held);
                }
                return false;
            }
        }
        true
    }

    /// Release every window in `hwnds`.
    pub fn release_windows(&self, hwnds: &HashSet<Hwnd>) {
        for hwnd in hwnds {
            self.release_window(*hwnd);
        }
    }

    // --- API gate ---

    /// Take an API permit, enforcing the minimum inter-call gap. The
    /// permit releases on drop, including on error paths.
    pub async fn api_slot(&self) -> ApiPermit {
        let permit = Arc::clone(&self.api_semaphore)
            .acquire_owned()
            .await
            .expect("api semaphore closed");

        let mut last = self.last_api_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.config.min_api_interval {
                tokio::time::sleep(self.config.min_api_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        ApiPermit { _permit: permit }
    }

    /// Free API permits (approximate under contention).
    #[must_use]
    pub fn available_api_slots(&self) -> usize {
        self.api_semaphore.available_permits()
    }

    // --- hygiene ---

    /// Force-release window locks held longer than `max_age`. Returns
    /// how many were released. Guards against tasks that died without
    /// cleaning up.
    pub fn cleanup_stale_locks(&self, max_age: Duration) -> usize {
        let mut owners = self.window_owners.lock().expect("window owner map poisoned");
        let stale: Vec<Hwnd> = owners
            .iter()
            .filter(|(_, owner)| owner.acquired_at.elapsed() > max_age)
            .map(|(hwnd, owner)| {
                warn!(
                    hwnd,
                    task_id = %owner.task_id,
                    age_s = owner.acquired_at.elapsed().as_secs(),
                    "releasing stale window lock"
                );
                *hwnd
            })
            .collect();
        for hwnd in &stale {
            owners.remove(hwnd);
        }
        stale.len()
    }

    /// Drop every slot and lock. For tests.
    pub fn reset(&self) {
        self.active_tasks
            .lock()
            .expect("task slot map poisoned")
            .clear();
        self.window_owners
            .lock()
            .expect("window owner map poisoned")
            .clear();
        self.window_locks
            .lock()
            .expect("window lock map poisoned")
            .clear();
        info!("concurrency manager reset");
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            active_tasks: self.active_task_count(),
            max_tasks: self.config.max_concurrent_tasks,
            locked_windows: self
                .window_owners
                .lock()
                .expect("window owner map poisoned")
                .len(),
            available_api_slots: self.available_api_slots(),
            max_api_concurrency: self.config.max_api_concurrency,
        }
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_manager() -> ConcurrencyManager {
        ConcurrencyManager::new(ConcurrencyConfig {
            max_concurrent_tasks: 2,
            max_api_concurrency: 3,
            window_lock_timeout: Duration::from_millis(200),
            batch_window_timeout: Duration::from_millis(50),
            min_api_interval: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn task_slots_are_bounded() {
        let mgr = small_manager();
        assert!(mgr.acquire_task_slot("t1", HashSet::new()));
        assert!(mgr.acquire_task_slot("t2", HashSet::new()));
        assert!(!mgr.acquire_task_slot("t3", HashSet::new()));
        assert_eq!(mgr.active_task_count(), 2);
        assert_eq!(mgr.available_slots(), 0);

        mgr.release_task_slot("t1");
        assert!(mgr.acquire_task_slot("t3", HashSet::new()));
    }

    #[tokio::test]
    async fn task_slot_is_idempotent_per_task() {
        let mgr = small_manager();
        assert!(mgr.acquire_task_slot("t1", HashSet::new()));
        assert!(mgr.acquire_task_slot("t1", HashSet::new()));
        assert_eq!(mgr.active_task_count(), 1);

        mgr.release_task_slot("t1");
        mgr.release_task_slot("t1"); // second release is a no-op
        assert_eq!(mgr.active_task_count(), 0);
    }

    #[tokio::test]
    async fn window_lock_is_exclusive() {
        let mgr = small_manager();
        assert!(mgr.acquire_window(100, "t1", None).await);
        assert!(mgr.is_window_locked(100));
        assert_eq!(mgr.get_window_owner(100).as_deref(), Some("t1"));

        // Second taker times out without blocking forever.
        assert!(!mgr.acquire_window(100, "t2", Some(Duration::from_millis(20))).await);
        assert_eq!(mgr.get_window_owner(100).as_deref(), Some("t1"));

        mgr.release_window(100);
        assert!(!mgr.is_window_locked(100));
        assert!(mgr.acquire_window(100, "t2", None).await);
    }

    #[tokio::test]
    async fn window_lock_guard_releases_on_drop() {
        let mgr = small_manager();
        {
            let _guard = mgr.window_lock(7, "t1").await.unwrap();
            assert!(mgr.is_window_locked(7));
        }
        assert!(!mgr.is_window_locked(7));
    }

    #[tokio::test]
    async fn batch_acquire_is_atomic() {
        let mgr = small_manager();
        let all: HashSet<Hwnd> = [1, 2, 3].into_iter().collect();

        assert!(mgr.acquire_windows(&all, "t1").await);
        for hwnd in &all {
            assert_eq!(mgr.get_window_owner(*hwnd).as_deref(), Some("t1"));
        }
        mgr.release_windows(&all);

        // Hold one member; the batch must fail and leave nothing behind.
        assert!(mgr.acquire_window(2, "holder", None).await);
        assert!(!mgr.acquire_windows(&all, "t2").await);
        assert!(!mgr.is_window_locked(1));
        assert!(!mgr.is_window_locked(3));
        assert_eq!(mgr.get_window_owner(2).as_deref(), Some("holder"));
    }

    #[tokio::test]
    async fn api_gate_caps_concurrency() {
        let mgr = Arc::new(small_manager());
        let in_flight = Arc::new(StdMutex::new((0usize, 0usize))); // (current, peak)

        let mut handles = Vec::new();
        for _ in 0..6 {
            let mgr = Arc::clone(&mgr);
            let in_flight = Arc::clone(&in_flight);
            handles.push(tokio::spawn(async move {
                let _permit = mgr.api_slot().await;
                {
                    let mut counts = in_flight.lock().unwrap();
                    counts.0 += 1;
                    counts.1 = counts.1.max(counts.0);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.lock().unwrap().0 -= 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let (current, peak) = *in_flight.lock().unwrap();
        assert_eq!(current, 0);
        assert!(peak <= 3, "peak in-flight {peak} exceeded the permit cap");
        assert_eq!(mgr.available_api_slots(), 3);
    }

    #[tokio::test]
    async fn api_gate_enforces_minimum_interval() {
        let mgr = ConcurrencyManager::new(ConcurrencyConfig {
            min_api_interval: Duration::from_millis(50),
            ..ConcurrencyConfig::default()
        });

        let start = Instant::now();
        drop(mgr.api_slot().await);
        drop(mgr.api_slot().await);
        assert!(
            start.elapsed() >= Duration::from_millis(50),
            "second admission ignored the minimum gap"
        );
    }

    #[tokio::test]
    async fn stale_locks_are_swept() {
        let mgr = small_manager();
        assert!(mgr.acquire_window(9, "dead-task", None).await);

        // Nothing is stale yet.
        assert_eq!(mgr.cleanup_stale_locks(Duration::from_secs(60)), 0);
        assert!(mgr.is_window_locked(9));

        // With a zero age bound the lock is reclaimed.
        assert_eq!(mgr.cleanup_stale_locks(Duration::ZERO), 1);
        assert!(!mgr.is_window_locked(9));
        assert!(mgr.acquire_window(9, "t2", None).await);
    }

    #[tokio::test]
    async fn stats_reflect_state() {
        let mgr = small_manager();
        mgr.acquire_task_slot("t1", HashSet::new());
        assert!(mgr.acquire_window(5, "t1", None).await);

        let stats = mgr.stats();
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.max_tasks, 2);
        assert_eq!(stats.locked_windows, 1);
        assert_eq!(stats.available_api_slots, 3);

        mgr.reset();
        assert_eq!(mgr.stats().active_tasks, 0);
        assert_eq!(mgr.stats().locked_windows, 0);
    }
}
