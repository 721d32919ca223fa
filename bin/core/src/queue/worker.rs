use std::{sync::Arc, time::Duration};

use store::Store;
use tokio::sync::Semaphore;

use super::{
  Job, QUEUE_KEY, dead_letter, jobs, promote_ready_delayed_jobs, publish_progress,
  requeue_with_backoff,
};

const POLL_TIMEOUT_SECONDS: f64 = 2.0;
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Dispatches jobs popped from the FIFO queue across up to `concurrency`
/// concurrent tasks, and promotes delayed jobs once their ready-time
/// arrives.
pub struct WorkerPool {
  store: Store,
  concurrency: usize,
}

impl WorkerPool {
  pub fn new(store: Store, concurrency: usize) -> Self {
    WorkerPool { store, concurrency }
  }

  pub fn spawn(self: Arc<Self>) {
    let scheduler = self.clone();
    tokio::spawn(async move { scheduler.run_scheduler().await });
    tokio::spawn(async move { self.run_dispatch().await });
  }

  async fn run_scheduler(&self) {
    let mut interval = tokio::time::interval(SCHEDULER_TICK);
    loop {
      interval.tick().await;
      if let Err(e) = promote_ready_delayed_jobs(&self.store).await {
        tracing::warn!(subsystem = "queue", error = %e, "failed to promote delayed jobs");
      }
    }
  }

  async fn run_dispatch(&self) {
    let semaphore = Arc::new(Semaphore::new(self.concurrency));
    loop {
      let payload = match self.store.brpop(QUEUE_KEY, POLL_TIMEOUT_SECONDS).await {
        Ok(Some(payload)) => payload,
        Ok(None) => continue,
        Err(e) => {
          tracing::warn!(subsystem = "queue", error = %e, "failed to poll job queue, backing off");
          tokio::time::sleep(Duration::from_secs(1)).await;
          continue;
        }
      };

      let job: Job = match serde_json::from_str(&payload) {
        Ok(job) => job,
        Err(e) => {
          tracing::warn!(subsystem = "queue", error = %e, "dropping unparseable job payload");
          continue;
        }
      };

      let Ok(permit) = semaphore.clone().acquire_owned().await else {
        break;
      };
      let store = self.store.clone();
      tokio::spawn(async move {
        dispatch_one(&store, job).await;
        drop(permit);
      });
    }
  }
}

async fn dispatch_one(store: &Store, job: Job) {
  let now = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0);

  if job.is_past_deadline(now) {
    publish_progress(store, &job.id, &job.channel, "abandoned", None).await;
    let _ = dead_letter(store, &job, "deadline exceeded").await;
    return;
  }

  publish_progress(store, &job.id, &job.channel, "running", None).await;

  match jobs::dispatch(store, &job).await {
    Ok(result) => {
      publish_progress(store, &job.id, &job.channel, "succeeded", Some(result)).await;
    }
    Err(e) => {
      let error = format!("{e:#}");
      if job.attempt >= job.max_retries {
        publish_progress(store, &job.id, &job.channel, "failed", Some(serde_json::json!({ "error": error }))).await;
        if let Err(e) = dead_letter(store, &job, &error).await {
          tracing::warn!(subsystem = "queue", error = %e, job_id = job.id, "failed to record dead letter");
        }
      } else {
        publish_progress(store, &job.id, &job.channel, "retrying", Some(serde_json::json!({ "error": error }))).await;
        if let Err(e) = requeue_with_backoff(store, job.clone()).await {
          tracing::warn!(subsystem = "queue", error = %e, job_id = job.id, "failed to requeue job for retry");
        }
      }
    }
  }
}
