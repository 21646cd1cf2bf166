//! Background pre-warming of cold user caches.
//!
//! Jobs run at most `max_concurrency` at a time; the rest wait in FIFO order. Each job
//! walks a fixed sequence of steps and records progress after every one. The first
//! failing step marks the job failed; entries written by earlier steps stay cached.
//! Finished jobs remain inspectable for `retention` and are then dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::compression::CompressedStore;
use super::domain::{ProfileCache, TimelineCache};
use super::error::FetchError;
use super::keys::{FeedKey, Tab};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::prewarm";

pub const METRIC_PREWARM_QUEUE_LEN: &str = "feedcache_prewarm_queue_len";
pub const METRIC_PREWARM_JOBS: &str = "feedcache_prewarm_job_total";

const TRENDING_SCOPE: &str = "global";
const CANCELLED: &str = "cancelled";

/// Where warm data comes from.
#[async_trait]
pub trait PrewarmSource: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<Value, FetchError>;
    async fn recommendations(&self, user_id: &str) -> Result<Value, FetchError>;
    async fn timeline(&self, user_id: &str, tab: Tab) -> Result<Value, FetchError>;
    async fn trending(&self) -> Result<Value, FetchError>;
    async fn preferences(&self, user_id: &str) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct PrewarmConfig {
    pub max_concurrency: usize,
    /// Pause after a job before the next one is dequeued.
    pub dequeue_delay: Duration,
    /// How long finished jobs stay visible.
    pub retention: Duration,
}

impl Default for PrewarmConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            dequeue_delay: Duration::from_millis(100),
            retention: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmJob {
    pub id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
    /// 0 to 100.
    pub progress: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl PrewarmJob {
    fn new(user_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: JobStatus::Pending,
            progress: 0,
            enqueued_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrewarmStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrewarmError {
    #[error("prewarm job {0} not found")]
    UnknownJob(Uuid),
    #[error("prewarm job {0} already finished")]
    AlreadyFinished(Uuid),
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Profile,
    Recommendations,
    Timelines,
    Trending,
    Preferences,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::Profile => "profile",
            Step::Recommendations => "recommendations",
            Step::Timelines => "timelines",
            Step::Trending => "trending",
            Step::Preferences => "preferences",
        }
    }
}

/// Steps in execution order with the progress reached after each.
const STEPS: [(Step, u8); 5] = [
    (Step::Profile, 10),
    (Step::Recommendations, 25),
    (Step::Timelines, 60),
    (Step::Trending, 80),
    (Step::Preferences, 100),
];

#[derive(Default)]
struct Queue {
    waiting: VecDeque<Uuid>,
    running: usize,
}

struct Inner {
    source: Arc<dyn PrewarmSource>,
    profiles: ProfileCache,
    timelines: TimelineCache,
    store: Arc<CompressedStore>,
    config: PrewarmConfig,
    jobs: DashMap<Uuid, PrewarmJob>,
    queue: Mutex<Queue>,
}

#[derive(Clone)]
pub struct PrewarmScheduler {
    inner: Arc<Inner>,
}

impl PrewarmScheduler {
    pub fn new(
        source: Arc<dyn PrewarmSource>,
        profiles: ProfileCache,
        timelines: TimelineCache,
        store: Arc<CompressedStore>,
        config: PrewarmConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                profiles,
                timelines,
                store,
                config,
                jobs: DashMap::new(),
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    /// Queue a warm-up for `user_id`. A user with an active job gets that job's id back.
    pub fn enqueue(&self, user_id: &str) -> Uuid {
        let id = {
            let mut queue = mutex_lock(&self.inner.queue, SOURCE, "enqueue");
            let active = self.inner.jobs.iter().find_map(|job| {
                (job.user_id == user_id && !job.status.is_finished()).then_some(job.id)
            });
            if let Some(id) = active {
                debug!(target_module = SOURCE, user_id, job_id = %id, "Job already active");
                return id;
            }
            let job = PrewarmJob::new(user_id.to_string());
            let id = job.id;
            self.inner.jobs.insert(id, job);
            queue.waiting.push_back(id);
            gauge!(METRIC_PREWARM_QUEUE_LEN).set(queue.waiting.len() as f64);
            id
        };
        info!(target_module = SOURCE, user_id, job_id = %id, "Prewarm job enqueued");
        self.pump();
        id
    }

    /// Queue several users, e.g. a priority batch.
    pub fn enqueue_many<S: AsRef<str>>(&self, user_ids: &[S]) -> Vec<Uuid> {
        user_ids.iter().map(|id| self.enqueue(id.as_ref())).collect()
    }

    pub fn job(&self, id: Uuid) -> Option<PrewarmJob> {
        self.inner.jobs.get(&id).map(|job| job.clone())
    }

    /// All known jobs, oldest first.
    pub fn jobs(&self) -> Vec<PrewarmJob> {
        let mut jobs: Vec<PrewarmJob> = self.inner.jobs.iter().map(|job| job.clone()).collect();
        jobs.sort_by_key(|job| job.enqueued_at);
        jobs
    }

    /// Cancel a job. Pending jobs are dropped at once; a running job stops after its
    /// current step, whose requests are not aborted.
    pub fn cancel(&self, id: Uuid) -> Result<PrewarmJob, PrewarmError> {
        let mut queue = mutex_lock(&self.inner.queue, SOURCE, "cancel");
        let mut job = self
            .inner
            .jobs
            .get_mut(&id)
            .ok_or(PrewarmError::UnknownJob(id))?;
        let status = job.status;
        match status {
            JobStatus::Completed | JobStatus::Failed => Err(PrewarmError::AlreadyFinished(id)),
            JobStatus::Pending => {
                queue.waiting.retain(|queued| *queued != id);
                gauge!(METRIC_PREWARM_QUEUE_LEN).set(queue.waiting.len() as f64);
                mark_cancelled(&mut job);
                let cancelled = job.clone();
                drop(job);
                self.inner.jobs.remove(&id);
                info!(target_module = SOURCE, job_id = %id, "Pending prewarm job cancelled");
                Ok(cancelled)
            }
            JobStatus::Running => {
                mark_cancelled(&mut job);
                info!(target_module = SOURCE, job_id = %id, "Running prewarm job cancelled");
                Ok(job.clone())
            }
        }
    }

    pub fn stats(&self) -> PrewarmStats {
        let mut stats = PrewarmStats::default();
        for job in self.inner.jobs.iter() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Start queued jobs while slots are free.
    fn pump(&self) {
        let ready: Vec<Uuid> = {
            let mut queue = mutex_lock(&self.inner.queue, SOURCE, "pump");
            let mut ready = Vec::new();
            while queue.running < self.inner.config.max_concurrency {
                let Some(id) = queue.waiting.pop_front() else {
                    break;
                };
                queue.running += 1;
                ready.push(id);
            }
            gauge!(METRIC_PREWARM_QUEUE_LEN).set(queue.waiting.len() as f64);
            ready
        };

        for id in ready {
            let scheduler = self.clone();
            tokio::spawn(
                async move {
                    scheduler.run(id).await;
                    scheduler.finish(id).await;
                }
                .instrument(info_span!("prewarm_job", job_id = %id)),
            );
        }
    }

    async fn run(&self, id: Uuid) {
        let user_id = match self.inner.jobs.get_mut(&id) {
            Some(mut job) => {
                job.status = JobStatus::Running;
                job.started_at = Some(OffsetDateTime::now_utc());
                job.user_id.clone()
            }
            None => return,
        };
        debug!(target_module = SOURCE, user_id = %user_id, "Prewarm job started");

        for (step, progress) in STEPS {
            if self.is_cancelled(id) {
                return;
            }
            if let Err(err) = self.perform(step, &user_id).await {
                let message = format!("{} step failed: {err}", step.name());
                warn!(target_module = SOURCE, user_id = %user_id, step = step.name(), error = %err, "Prewarm job failed");
                if let Some(mut job) = self.inner.jobs.get_mut(&id)
                    && job.status == JobStatus::Running
                {
                    job.status = JobStatus::Failed;
                    job.error = Some(message);
                    job.completed_at = Some(OffsetDateTime::now_utc());
                }
                counter!(METRIC_PREWARM_JOBS, "outcome" => "failed").increment(1);
                return;
            }
            if let Some(mut job) = self.inner.jobs.get_mut(&id)
                && job.status == JobStatus::Running
            {
                job.progress = progress;
            }
        }

        if let Some(mut job) = self.inner.jobs.get_mut(&id)
            && job.status == JobStatus::Running
        {
            job.status = JobStatus::Completed;
            job.completed_at = Some(OffsetDateTime::now_utc());
            counter!(METRIC_PREWARM_JOBS, "outcome" => "completed").increment(1);
            info!(target_module = SOURCE, user_id = %user_id, "Prewarm job completed");
        }
    }

    async fn perform(&self, step: Step, user_id: &str) -> Result<(), FetchError> {
        let source = &self.inner.source;
        match step {
            Step::Profile => {
                let profile = source.profile(user_id).await?;
                self.inner.profiles.set_profile(user_id, profile).await?;
            }
            Step::Recommendations => {
                let recommendations = source.recommendations(user_id).await?;
                self.inner
                    .profiles
                    .set_recommendations(user_id, recommendations)
                    .await?;
            }
            Step::Timelines => {
                for tab in Tab::ALL {
                    let page = source.timeline(user_id, tab).await?;
                    self.inner.timelines.set_timeline(user_id, tab, 0, page).await?;
                }
            }
            Step::Trending => {
                let trending = source.trending().await?;
                let key = FeedKey::Trending(TRENDING_SCOPE.to_string());
                self.inner
                    .store
                    .set(&key.to_string(), &trending, key.ttl())
                    .await?;
            }
            Step::Preferences => {
                let preferences = source.preferences(user_id).await?;
                self.inner.profiles.set_preferences(user_id, &preferences).await?;
            }
        }
        Ok(())
    }

    fn is_cancelled(&self, id: Uuid) -> bool {
        self.inner
            .jobs
            .get(&id)
            .is_none_or(|job| job.status != JobStatus::Running)
    }

    /// Release the slot, schedule removal, and pull the next job after the delay.
    async fn finish(&self, id: Uuid) {
        mutex_lock(&self.inner.queue, SOURCE, "finish").running -= 1;

        let retention = self.inner.config.retention;
        let scheduler = self.clone();
        tokio::spawn(async move {
            sleep(retention).await;
            scheduler.inner.jobs.remove(&id);
        });

        sleep(self.inner.config.dequeue_delay).await;
        self.pump();
    }
}

fn mark_cancelled(job: &mut PrewarmJob) {
    job.status = JobStatus::Failed;
    job.error = Some(CANCELLED.to_string());
    job.completed_at = Some(OffsetDateTime::now_utc());
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::compression::CompressionConfig;
    use crate::cache::freshness::{FreshnessConfig, SwrCache};
    use crate::cache::resilience::{ResilienceConfig, ResilientExecutor};
    use crate::cache::store::{MemoryBackend, StoreAdapter};

    #[derive(Default)]
    struct FakeSource {
        active: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl PrewarmSource for FakeSource {
        async fn profile(&self, user_id: &str) -> Result<Value, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "id": user_id }))
        }

        async fn recommendations(&self, user_id: &str) -> Result<Value, FetchError> {
            if user_id == "broken" {
                return Err("recommendation service down".into());
            }
            Ok(json!(["u9"]))
        }

        async fn timeline(&self, _user_id: &str, tab: Tab) -> Result<Value, FetchError> {
            Ok(json!([tab.as_str()]))
        }

        async fn trending(&self) -> Result<Value, FetchError> {
            Ok(json!(["#rust"]))
        }

        async fn preferences(&self, _user_id: &str) -> Result<Value, FetchError> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "theme": "dark" }))
        }
    }

    struct Harness {
        scheduler: PrewarmScheduler,
        source: Arc<FakeSource>,
        profiles: ProfileCache,
        timelines: TimelineCache,
    }

    fn harness(max_concurrency: usize) -> Harness {
        let adapter = StoreAdapter::new(Arc::new(MemoryBackend::new()), Duration::from_secs(60));
        let store = Arc::new(CompressedStore::new(adapter, CompressionConfig::default()));
        let executor = Arc::new(ResilientExecutor::new(store.clone(), ResilienceConfig::default()));
        let swr = SwrCache::new(executor, FreshnessConfig::default());
        let profiles = ProfileCache::new(swr.clone());
        let timelines = TimelineCache::new(swr);
        let source = Arc::new(FakeSource::default());
        let scheduler = PrewarmScheduler::new(
            source.clone(),
            profiles.clone(),
            timelines.clone(),
            store,
            PrewarmConfig {
                max_concurrency,
                dequeue_delay: Duration::from_millis(100),
                retention: Duration::from_secs(60),
            },
        );
        Harness {
            scheduler,
            source,
            profiles,
            timelines,
        }
    }

    async fn wait_finished(scheduler: &PrewarmScheduler, id: Uuid) -> PrewarmJob {
        for _ in 0..1000 {
            if let Some(job) = scheduler.job(id)
                && job.status.is_finished()
            {
                return job;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test(start_paused = true)]
    async fn job_populates_every_cache() {
        let h = harness(3);
        let id = h.scheduler.enqueue("u1");

        let job = wait_finished(&h.scheduler, id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        assert_eq!(
            h.profiles.get_profiles::<Value>(&["u1".to_string()]).await,
            vec![Some(json!({ "id": "u1" }))]
        );
        assert_eq!(
            h.profiles.get_recommendations::<Value>("u1").await.unwrap(),
            Some(json!(["u9"]))
        );
        for tab in Tab::ALL {
            let page = h.timelines.cached_timeline::<Value>("u1", tab, 0).await.unwrap();
            assert_eq!(page, Some(json!([tab.as_str()])));
        }
        assert_eq!(
            h.profiles.preferences::<Value>("u1").await.unwrap(),
            Some(json!({ "theme": "dark" }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_step_keeps_earlier_work() {
        let h = harness(3);
        let id = h.scheduler.enqueue("broken");

        let job = wait_finished(&h.scheduler, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 10);
        let error = job.error.unwrap();
        assert!(error.starts_with("recommendations step failed"), "{error}");
        assert_eq!(
            h.profiles.get_profiles::<Value>(&["broken".to_string()]).await,
            vec![Some(json!({ "id": "broken" }))]
        );
        assert_eq!(h.scheduler.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_and_fifo() {
        let h = harness(2);
        let ids = h.scheduler.enqueue_many(&["a", "b", "c", "d", "e"]);
        assert_eq!(h.scheduler.stats().running + h.scheduler.stats().pending, 5);

        for id in &ids {
            wait_finished(&h.scheduler, *id).await;
        }
        assert_eq!(h.source.finished.load(Ordering::SeqCst), 5);
        assert_eq!(h.source.peak.load(Ordering::SeqCst), 2);

        let started: Vec<OffsetDateTime> = ids
            .iter()
            .map(|id| h.scheduler.job(*id).unwrap().started_at.unwrap())
            .collect();
        assert!(started.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn active_user_is_not_queued_twice() {
        let h = harness(1);
        let first = h.scheduler.enqueue("u1");
        let second = h.scheduler.enqueue("u1");
        assert_eq!(first, second);

        wait_finished(&h.scheduler, first).await;
        let third = h.scheduler.enqueue("u1");
        assert_ne!(first, third);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_job_removes_it() {
        let h = harness(1);
        let running = h.scheduler.enqueue("a");
        let pending = h.scheduler.enqueue("b");

        let cancelled = h.scheduler.cancel(pending).unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some(CANCELLED));
        assert!(h.scheduler.job(pending).is_none());
        assert_eq!(h.scheduler.cancel(pending).unwrap_err(), PrewarmError::UnknownJob(pending));

        wait_finished(&h.scheduler, running).await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.source.finished.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.scheduler.cancel(running).unwrap_err(),
            PrewarmError::AlreadyFinished(running)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn finished_jobs_expire_after_retention() {
        let h = harness(1);
        let id = h.scheduler.enqueue("u1");
        wait_finished(&h.scheduler, id).await;

        sleep(Duration::from_secs(61)).await;
        assert!(h.scheduler.job(id).is_none());
        assert!(h.scheduler.jobs().is_empty());
    }
}
