//! Scheduling engine.
//!
//! One logical timer per [`TimerInfo`]. Pending fire times live in a
//! min-heap served by a single dispatcher task; stale heap items are skipped
//! by comparing generations instead of being removed eagerly. A due timer is
//! re-armed for its next occurrence before the handler runs, so a slow
//! handler never delays the following tick.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod clock;
mod cron;
mod errors;
mod table;

pub use clock::{Clock, SystemClock, TokioClock};
pub use cron::{CronParseError, CronSchedule};
pub use errors::{SchedulerError, SchedulerResult};
pub use table::FireTable;

use crate::model::TimerInfo;

/// What `start_timer` does with an already pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Leave a pending fire time untouched; reuse a persisted one if it is
    /// still in the future.
    Keep,
    /// Always compute a fresh fire time.
    Replace,
}

/// Which timers `cancel_timers` applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSelector {
    Key(TimerInfo),
    NamePrefix(String),
}

impl TimerSelector {
    fn matches(&self, key: &TimerInfo) -> bool {
        match self {
            TimerSelector::Key(selected) => selected == key,
            TimerSelector::NamePrefix(prefix) => key.name().starts_with(prefix.as_str()),
        }
    }
}

impl From<TimerInfo> for TimerSelector {
    fn from(key: TimerInfo) -> Self {
        TimerSelector::Key(key)
    }
}

/// Observable state of one timer. Unscheduled keys have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Pending(DateTime<Utc>),
    /// The handler is running; the next occurrence is already armed.
    Firing { next: DateTime<Utc> },
    Cancelled,
}

/// Receives due timers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FireHandler: Send + Sync + 'static {
    async fn fire(&self, key: TimerInfo);
}

#[derive(Debug)]
struct Entry {
    schedule: CronSchedule,
    fire_at: DateTime<Utc>,
    generation: u64,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<TimerInfo, Entry>,
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, TimerInfo)>>,
    in_flight: HashSet<TimerInfo>,
    /// Fire times found on disk at start-up, consumed by `Reschedule::Keep`.
    persisted: HashMap<TimerInfo, (String, DateTime<Utc>)>,
    generation: u64,
}

impl State {
    fn arm(&mut self, key: &TimerInfo, fire_at: DateTime<Utc>) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.fire_at = fire_at;
            entry.generation = generation;
            entry.cancelled = false;
        }
        self.queue.push(Reverse((fire_at, generation, key.clone())));
    }
}

struct Inner {
    state: Mutex<State>,
    wakeup: Notify,
    shutdown: AtomicBool,
    clock: Arc<dyn Clock>,
    table: FireTable,
}

impl Inner {
    async fn persist(&self, state: &State) {
        let pending = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.cancelled)
            .map(|(key, entry)| (key, entry.schedule.source(), entry.fire_at));
        if let Err(e) = self.table.save(pending).await {
            error!("Failed to persist fire times: {e}");
        }
    }

    async fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        while let Some(Reverse((at, generation, key))) = state.queue.peek() {
            let live = state
                .entries
                .get(key)
                .is_some_and(|entry| !entry.cancelled && entry.generation == *generation);
            if live {
                return Some(*at);
            }
            state.queue.pop();
        }
        None
    }

    /// Pops every due timer, re-arms it and hands it to `handler`.
    async fn fire_due(self: &Arc<Self>, handler: &Arc<dyn FireHandler>) {
        let now = self.clock.now();
        let mut due = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            loop {
                match state.queue.peek() {
                    Some(Reverse((at, ..))) if *at <= now => {}
                    _ => break,
                }
                let Some(Reverse((_, generation, key))) = state.queue.pop() else {
                    break;
                };
                let Some(entry) = state.entries.get(&key) else {
                    continue;
                };
                if entry.cancelled || entry.generation != generation {
                    continue;
                }

                match entry.schedule.next_after(now) {
                    Some(next) => state.arm(&key, next),
                    None => {
                        warn!(timer = %key, "Schedule has no further occurrence");
                        state.entries.remove(&key);
                    }
                }

                if state.in_flight.insert(key.clone()) {
                    due.push(key);
                } else {
                    debug!(timer = %key, "Timer already firing, skipping this occurrence");
                }
            }
            if !due.is_empty() {
                self.persist(state).await;
            }
        }

        for key in due {
            let inner = Arc::clone(self);
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                debug!(timer = %key, "Timer fired");
                let fired = key.clone();
                let result = tokio::spawn(async move { handler.fire(fired).await }).await;
                if let Err(e) = result {
                    error!(timer = %key, "Fire handler failed: {e}");
                }
                inner.state.lock().await.in_flight.remove(&key);
            });
        }
    }
}

/// Handle to the scheduling engine. Clones share the same timers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler, loading previously persisted fire times.
    pub async fn new(clock: Arc<dyn Clock>, table: FireTable) -> SchedulerResult<Self> {
        let persisted = table.load().await?;
        if !persisted.is_empty() {
            info!("Loaded {} persisted fire times", persisted.len());
        }

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    persisted,
                    ..State::default()
                }),
                wakeup: Notify::new(),
                shutdown: AtomicBool::new(false),
                clock,
                table,
            }),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Parses `expression` and checks that it fires at least once more.
    pub fn parse_cron(&self, expression: &str) -> SchedulerResult<CronSchedule> {
        let schedule = CronSchedule::parse(expression)
            .map_err(|e| SchedulerError::invalid_cron(expression, e))?;
        if schedule.next_after(self.now()).is_none() {
            return Err(SchedulerError::invalid_cron(
                expression,
                "schedule never fires",
            ));
        }
        Ok(schedule)
    }

    /// Arms `key` and returns its fire time, see [`Reschedule`].
    pub async fn start_timer(
        &self,
        key: TimerInfo,
        cron: &str,
        reschedule: Reschedule,
    ) -> SchedulerResult<DateTime<Utc>> {
        let schedule = self.parse_cron(cron)?;
        let now = self.now();
        let computed = schedule
            .next_after(now)
            .ok_or_else(|| SchedulerError::invalid_cron(cron, "schedule never fires"))?;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let persisted = state.persisted.remove(&key);
        let pending = state
            .entries
            .get(&key)
            .filter(|entry| !entry.cancelled)
            .map(|entry| entry.fire_at);

        let fire_at = match (reschedule, pending) {
            (Reschedule::Keep, Some(pending)) => {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.schedule = schedule;
                }
                self.inner.persist(state).await;
                debug!(timer = %key, %pending, "Keeping pending fire time");
                return Ok(pending);
            }
            (Reschedule::Keep, None) => persisted
                .filter(|(source, at)| source == schedule.source() && *at > now)
                .map(|(_, at)| at)
                .unwrap_or(computed),
            (Reschedule::Replace, _) => computed,
        };

        state.entries.insert(
            key.clone(),
            Entry {
                schedule,
                fire_at,
                generation: 0,
                cancelled: false,
            },
        );
        state.arm(&key, fire_at);
        self.inner.persist(state).await;
        drop(guard);

        self.inner.wakeup.notify_one();
        info!(timer = %key, %fire_at, "Timer armed");
        Ok(fire_at)
    }

    /// Fires `key` as soon as the dispatcher runs, then resumes its
    /// recurring schedule.
    pub async fn start_timer_now(&self, key: &TimerInfo) -> SchedulerResult<()> {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        if !state.entries.get(key).is_some_and(|entry| !entry.cancelled) {
            return Err(SchedulerError::UnknownTimer(key.clone()));
        }
        state.arm(key, now);
        drop(state);

        self.inner.wakeup.notify_one();
        info!(timer = %key, "Timer forced");
        Ok(())
    }

    /// Cancels every matching timer and returns how many were cancelled.
    ///
    /// A handler already running completes; only future ticks are dropped.
    pub async fn cancel_timers(&self, selector: impl Into<TimerSelector>) -> usize {
        let selector = selector.into();
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        state.persisted.retain(|key, _| !selector.matches(key));
        let mut cancelled = 0;
        for (key, entry) in state.entries.iter_mut() {
            if !entry.cancelled && selector.matches(key) {
                entry.cancelled = true;
                cancelled += 1;
                debug!(timer = %key, "Timer cancelled");
            }
        }
        if cancelled > 0 {
            self.inner.persist(state).await;
            drop(guard);
            self.inner.wakeup.notify_one();
        }
        cancelled
    }

    pub async fn state(&self, key: &TimerInfo) -> Option<TimerState> {
        let state = self.inner.state.lock().await;
        let entry = state.entries.get(key)?;
        Some(if entry.cancelled {
            TimerState::Cancelled
        } else if state.in_flight.contains(key) {
            TimerState::Firing {
                next: entry.fire_at,
            }
        } else {
            TimerState::Pending(entry.fire_at)
        })
    }

    /// Keys of all timers that are not cancelled.
    pub async fn pending(&self) -> Vec<TimerInfo> {
        let state = self.inner.state.lock().await;
        let mut keys: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.cancelled)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Spawns the dispatcher loop.
    pub fn start(&self, handler: Arc<dyn FireHandler>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        inner.shutdown.store(false, Ordering::Release);
        tokio::spawn(async move {
            info!("Scheduler started");
            while !inner.shutdown.load(Ordering::Acquire) {
                let next = inner.next_due().await;
                let notified = inner.wakeup.notified();
                match next {
                    Some(at) => {
                        let wait = (at - inner.clock.now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = notified => continue,
                        }
                    }
                    None => {
                        notified.await;
                        continue;
                    }
                }
                inner.fire_due(&handler).await;
            }
            info!("Scheduler stopped");
        })
    }

    /// Stops the dispatcher loop after its current iteration.
    pub fn shutdown(&self) {
        info!("Stopping scheduler");
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    const EVERY_MINUTE: &str = "0 * * * * *";

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
    }

    async fn scheduler() -> Scheduler {
        Scheduler::new(
            Arc::new(TokioClock::starting_at(origin())),
            FireTable::volatile(),
        )
        .await
        .unwrap()
    }

    struct Recorder(mpsc::UnboundedSender<TimerInfo>);

    #[async_trait]
    impl FireHandler for Recorder {
        async fn fire(&self, key: TimerInfo) {
            let _ = self.0.send(key);
        }
    }

    fn recorder() -> (Arc<dyn FireHandler>, mpsc::UnboundedReceiver<TimerInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    /// Next fire time, whether or not the handler has returned yet.
    fn armed_for(state: Option<TimerState>) -> Option<DateTime<Utc>> {
        match state? {
            TimerState::Pending(at) | TimerState::Firing { next: at } => Some(at),
            TimerState::Cancelled => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_time_is_strictly_after_now() {
        let scheduler = scheduler().await;
        let key = TimerInfo::trust_point("root");
        let fire_at = scheduler
            .start_timer(key.clone(), EVERY_MINUTE, Reschedule::Replace)
            .await
            .unwrap();
        assert!(fire_at > scheduler.now());
        assert_eq!(fire_at, Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap());
        assert_eq!(scheduler.state(&key).await, Some(TimerState::Pending(fire_at)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_cron_is_rejected() {
        let scheduler = scheduler().await;
        let key = TimerInfo::trust_point("root");
        let err = scheduler
            .start_timer(key.clone(), "every day", Reschedule::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCronExpression { .. }));
        assert_eq!(scheduler.state(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_leaves_pending_time_and_replace_moves_it() {
        let scheduler = scheduler().await;
        let key = TimerInfo::trust_point("root");
        let first = scheduler
            .start_timer(key.clone(), "0 0 0 * * *", Reschedule::Replace)
            .await
            .unwrap();

        let kept = scheduler
            .start_timer(key.clone(), "0 0 6 * * *", Reschedule::Keep)
            .await
            .unwrap();
        assert_eq!(kept, first);

        let replaced = scheduler
            .start_timer(key.clone(), "0 0 6 * * *", Reschedule::Replace)
            .await
            .unwrap();
        assert_ne!(replaced, first);
        assert_eq!(
            replaced,
            Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_timer_fires_and_rearms() {
        let scheduler = scheduler().await;
        let (handler, mut fired) = recorder();
        let _loop = scheduler.start(handler);

        let key = TimerInfo::trust_point("root");
        scheduler
            .start_timer(key.clone(), EVERY_MINUTE, Reschedule::Replace)
            .await
            .unwrap();

        assert_eq!(fired.recv().await, Some(key.clone()));
        assert_eq!(fired.recv().await, Some(key.clone()));
        assert_eq!(
            armed_for(scheduler.state(&key).await),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 3, 0).unwrap())
        );
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timer_now_fires_immediately() {
        let scheduler = scheduler().await;
        let (handler, mut fired) = recorder();
        let _loop = scheduler.start(handler);

        let key = TimerInfo::trust_point("root");
        let scheduled = scheduler
            .start_timer(key.clone(), "0 0 0 * * *", Reschedule::Replace)
            .await
            .unwrap();
        scheduler.start_timer_now(&key).await.unwrap();

        assert_eq!(fired.recv().await, Some(key.clone()));
        assert!(scheduler.now() < scheduled);
        assert_eq!(armed_for(scheduler.state(&key).await), Some(scheduled));

        let unknown = TimerInfo::trust_point("nobody");
        assert!(matches!(
            scheduler.start_timer_now(&unknown).await,
            Err(SchedulerError::UnknownTimer(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let scheduler = scheduler().await;
        let mut handler = MockFireHandler::new();
        handler.expect_fire().never();
        let _loop = scheduler.start(Arc::new(handler));

        let root = TimerInfo::trust_point("root-a");
        let other = TimerInfo::trust_point("root-b");
        for key in [&root, &other] {
            scheduler
                .start_timer(key.clone(), EVERY_MINUTE, Reschedule::Replace)
                .await
                .unwrap();
        }

        let cancelled = scheduler
            .cancel_timers(TimerSelector::NamePrefix("root-".into()))
            .await;
        assert_eq!(cancelled, 2);
        assert_eq!(scheduler.state(&root).await, Some(TimerState::Cancelled));
        assert!(scheduler.pending().await.is_empty());

        tokio::time::sleep(Duration::from_secs(180)).await;
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refire_while_firing_is_skipped() {
        struct Slow(mpsc::UnboundedSender<TimerInfo>);

        #[async_trait]
        impl FireHandler for Slow {
            async fn fire(&self, key: TimerInfo) {
                let _ = self.0.send(key);
                tokio::time::sleep(Duration::from_secs(150)).await;
            }
        }

        let scheduler = scheduler().await;
        let (tx, mut fired) = mpsc::unbounded_channel();
        let _loop = scheduler.start(Arc::new(Slow(tx)));

        let key = TimerInfo::trust_point("root");
        scheduler
            .start_timer(key.clone(), EVERY_MINUTE, Reschedule::Replace)
            .await
            .unwrap();

        // Fires at 12:01; the 12:02 and 12:03 ticks land while it still runs.
        assert_eq!(fired.recv().await, Some(key.clone()));
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(matches!(
            scheduler.state(&key).await,
            Some(TimerState::Firing { .. })
        ));
        assert!(fired.try_recv().is_err());

        // 12:04 is the first tick after the handler returned at 12:03:30.
        assert_eq!(fired.recv().await, Some(key.clone()));
        assert_eq!(
            scheduler.now(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 4, 0).unwrap()
        );
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_reuses_persisted_fire_time() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("timers.json");
        std::fs::write(
            &path,
            r#"[
                {"key":{"kind":"trust_point","name":"root"},"cron":"0 0 0 * * *",
                 "fire_at":"2024-03-05T00:00:00Z"},
                {"key":{"kind":"trust_point","name":"late"},"cron":"0 0 0 * * *",
                 "fire_at":"2024-02-01T00:00:00Z"}
            ]"#,
        )
        .unwrap();
        let file = crate::persistence::JsonFile::new(path);
        let clock = Arc::new(TokioClock::starting_at(origin()));
        let scheduler = Scheduler::new(clock, FireTable::on_disk(file.clone()))
            .await
            .unwrap();

        let agreed = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        let root = TimerInfo::trust_point("root");
        let rehydrated = scheduler
            .start_timer(root.clone(), "0 0 0 * * *", Reschedule::Keep)
            .await
            .unwrap();
        assert_eq!(rehydrated, agreed);

        // Past fire times are recomputed.
        let late = scheduler
            .start_timer(TimerInfo::trust_point("late"), "0 0 0 * * *", Reschedule::Keep)
            .await
            .unwrap();
        assert_eq!(late, Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());

        // The table now reflects the armed timers.
        let reloaded = FireTable::on_disk(file).load().await.unwrap();
        assert_eq!(reloaded.get(&root).map(|(_, at)| *at), Some(agreed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_ignores_persisted_time_of_other_expression() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = crate::persistence::JsonFile::new(dir.path().join("timers.json"));
        let clock = Arc::new(TokioClock::starting_at(origin()));
        let key = TimerInfo::trust_point("root");

        let first = Scheduler::new(clock.clone(), FireTable::on_disk(file.clone()))
            .await
            .unwrap();
        let agreed = first
            .start_timer(key.clone(), "0 0 0 * * *", Reschedule::Replace)
            .await
            .unwrap();

        let restarted = Scheduler::new(clock, FireTable::on_disk(file)).await.unwrap();
        let changed = restarted
            .start_timer(key, "0 0 6 * * *", Reschedule::Keep)
            .await
            .unwrap();
        assert_ne!(changed, agreed);
    }
}
