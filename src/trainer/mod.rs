// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Background training of per-link travel time models. Jobs are scheduled
//! through the service registry, run on a dedicated worker pool decoupled
//! from event dispatch, and announce finished artifacts on the bus.

pub mod artifacts;
pub mod cache_key;
pub mod estimators;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::models::{ModelMetadata, TrainModelRequest, TrainingJob, TrainingJobStatus};
use crate::services::{ServiceError, ServiceHandler, ServiceRegistry};
use artifacts::ArtifactStore;
use cache_key::cache_key;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use estimators::EstimatorRegistry;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("no training data returned for '{link_ref}' (time: {time}, n: {n})")]
    NoTrainingData {
        link_ref: String,
        time: DateTime<Utc>,
        n: u64,
    },
    #[error("error getting training data: {0}")]
    Upstream(String),
    #[error("model fit failed: {0}")]
    Fit(String),
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("artifact metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Travel time samples as returned by the history service: per-sample
/// elapsed seconds and the observed link travel times.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainingSamples {
    time: Vec<f64>,
    travel_time: Vec<f64>,
}

impl TrainingSamples {
    /// Reconstructs a time-indexed series from the cumulative sum of the
    /// elapsed seconds.
    fn into_series(self) -> (Vec<DateTime<Utc>>, Vec<f64>) {
        let mut index = Vec::with_capacity(self.time.len());
        let mut values = Vec::with_capacity(self.time.len());
        let mut elapsed = 0.0_f64;
        for (delta, value) in self.time.iter().zip(self.travel_time.iter()) {
            elapsed += delta;
            if let Some(stamp) = DateTime::from_timestamp(elapsed as i64, 0) {
                index.push(stamp);
                values.push(*value);
            }
        }
        (index, values)
    }
}

pub struct Trainer {
    bus: Arc<EventBus>,
    services: Arc<ServiceRegistry>,
    artifacts: ArtifactStore,
    estimators: EstimatorRegistry,
    jobs: DashMap<Uuid, TrainingJob>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    config: AppConfig,
}

impl Trainer {
    pub fn new(
        bus: Arc<EventBus>,
        services: Arc<ServiceRegistry>,
        config: AppConfig,
    ) -> (Arc<Trainer>, mpsc::UnboundedReceiver<Uuid>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let trainer = Arc::new(Trainer {
            bus,
            services,
            artifacts: ArtifactStore::new(config.model_cache_path.clone()),
            estimators: EstimatorRegistry::with_defaults(),
            jobs: DashMap::new(),
            queue_tx,
            config,
        });
        (trainer, queue_rx)
    }

    pub async fn setup(
        bus: Arc<EventBus>,
        services: Arc<ServiceRegistry>,
        config: AppConfig,
    ) -> Arc<Trainer> {
        let (trainer, queue_rx) = Trainer::new(bus, services, config);
        trainer.attach();
        trainer.spawn_workers(queue_rx);
        trainer
    }

    /// Registers the scheduling and inspection services.
    pub fn attach(self: &Arc<Self>) {
        let trainer = self.clone();
        let handler: ServiceHandler = Arc::new(move |payload| {
            let trainer = trainer.clone();
            Box::pin(async move {
                let request: TrainModelRequest = serde_json::from_value(payload)
                    .map_err(|e| ServiceError::bad_payload("link_model_schedule_train", e))?;
                let job_id = trainer.schedule(request);
                Ok(json!({ "jobId": job_id }))
            })
        });
        self.services.register("link_model_schedule_train", handler);

        let trainer = self.clone();
        let handler: ServiceHandler = Arc::new(move |_payload| {
            let trainer = trainer.clone();
            Box::pin(async move {
                let mut jobs: Vec<TrainingJob> =
                    trainer.jobs.iter().map(|entry| entry.value().clone()).collect();
                jobs.sort_by_key(|job| job.created);
                serde_json::to_value(jobs).map_err(|e| ServiceError::handler("list_trainer_jobs", e))
            })
        });
        self.services.register("list_trainer_jobs", handler);
    }

    /// Starts the worker pool that drains the job queue. Training never
    /// blocks event dispatch.
    pub fn spawn_workers(self: &Arc<Self>, queue_rx: mpsc::UnboundedReceiver<Uuid>) {
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for _ in 0..self.config.trainer_workers.max(1) {
            let trainer = self.clone();
            let queue_rx = queue_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job_id = { queue_rx.lock().await.recv().await };
                    match job_id {
                        Some(job_id) => trainer.run_job(job_id).await,
                        None => break,
                    }
                }
            });
        }
    }

    /// Enqueues a training job and returns its id immediately.
    pub fn schedule(&self, request: TrainModelRequest) -> Uuid {
        let job_id = Uuid::new_v4();
        debug!(
            "Scheduling 'link model train' for link '{}' using model '{}'",
            request.link_ref, request.model
        );
        self.jobs.insert(
            job_id,
            TrainingJob {
                job_id,
                request,
                status: TrainingJobStatus::Queued,
                result: None,
                error: None,
                created: Utc::now(),
                finished: None,
            },
        );
        let _ = self.queue_tx.send(job_id);
        job_id
    }

    async fn run_job(&self, job_id: Uuid) {
        let request = match self.jobs.get_mut(&job_id) {
            Some(mut job) => {
                job.status = TrainingJobStatus::Running;
                job.request.clone()
            }
            None => return,
        };

        match self.train(&request).await {
            Ok(metadata) => {
                info!(
                    "Trained model '{}' for link '{}' (hash: {})",
                    request.model, request.link_ref, metadata.hash
                );
                if let Some(mut job) = self.jobs.get_mut(&job_id) {
                    job.status = TrainingJobStatus::Completed;
                    job.result = Some(metadata);
                    job.finished = Some(Utc::now());
                }
            }
            Err(e) => {
                warn!("Training job {} failed: {}", job_id, e);
                if let Some(mut job) = self.jobs.get_mut(&job_id) {
                    job.status = TrainingJobStatus::Failed;
                    job.error = Some(e.to_string());
                    job.finished = Some(Utc::now());
                }
            }
        }
    }

    async fn train(&self, request: &TrainModelRequest) -> Result<ModelMetadata, TrainerError> {
        let reference_time = request.time.unwrap_or_else(Utc::now);
        let parameters = request
            .parameters
            .clone()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        let hash = cache_key(&request.link_ref, &request.model, reference_time, &parameters);
        debug!(
            "Train link model for '{}' using model '{}' (hash: {})",
            request.link_ref, request.model, hash
        );

        // Content-addressing pays off here: an artifact trained from the
        // same logical request is reused instead of refit.
        if let Some(metadata) = self.artifacts.load_metadata(&hash) {
            info!(
                "Model '{}' for link '{}' already trained (hash: {}), reusing artifact",
                request.model, request.link_ref, hash
            );
            self.bus
                .publish("link_model_available", json!({ "metadata": metadata }));
            return Ok(metadata);
        }

        let n = parameters
            .get("n")
            .and_then(Value::as_u64)
            .unwrap_or(self.config.training_window_days);
        let response = self
            .services
            .call_with_timeout(
                "link_travel_time_n_preceding_normal_days",
                json!({ "linkRef": request.link_ref, "time": reference_time, "n": n }),
                self.config.rpc_timeout,
            )
            .await
            .map_err(|e| TrainerError::Upstream(e.to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(TrainerError::Upstream(error.to_string()));
        }
        let samples: TrainingSamples = serde_json::from_value(response)
            .map_err(|e| TrainerError::Upstream(format!("unreadable training data: {}", e)))?;
        if samples.time.is_empty() {
            return Err(TrainerError::NoTrainingData {
                link_ref: request.link_ref.clone(),
                time: reference_time,
                n,
            });
        }

        let (index, values) = samples.into_series();
        debug!("Loaded training data: {} samples", index.len());

        let mut estimator = self.estimators.create(&request.model)?;
        estimator.fit(&index, &values)?;

        let metadata = ModelMetadata {
            hash: hash.clone(),
            model: request.model.clone(),
            link_ref: request.link_ref.clone(),
            time: reference_time,
            trained: Utc::now(),
            resource_url: self.artifacts.model_path(&hash).display().to_string(),
        };
        self.artifacts.write(&hash, &estimator.to_bytes()?, &metadata)?;

        self.bus
            .publish("link_model_available", json!({ "metadata": metadata }));
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Subscription;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type EventLog = Arc<StdMutex<Vec<(String, Value)>>>;

    fn test_config(tag: &str) -> AppConfig {
        let base =
            std::env::temp_dir().join(format!("journeycast-trainer-{}-{}", tag, Uuid::new_v4()));
        AppConfig {
            snapshot_path: base.join("journeys.bin.zlib"),
            model_cache_path: base.join("models"),
            refresh_interval: Duration::from_secs(60),
            eviction_grace: Duration::from_secs(900),
            rpc_timeout: Duration::from_millis(250),
            dwell_baseline_seconds: 0.0,
            training_window_days: 21,
            trainer_workers: 1,
        }
    }

    async fn setup(
        tag: &str,
    ) -> (
        Arc<ServiceRegistry>,
        Arc<Trainer>,
        EventLog,
        Subscription,
    ) {
        let bus = EventBus::new();
        let services = ServiceRegistry::new(Duration::from_millis(250));
        let trainer = Trainer::setup(bus.clone(), services.clone(), test_config(tag)).await;

        let log: EventLog = Arc::new(StdMutex::new(Vec::new()));
        let collector = log.clone();
        let subscription = bus.subscribe(
            "link_model_available",
            Arc::new(move |event_type, payload| {
                let collector = collector.clone();
                Box::pin(async move {
                    collector.lock().unwrap().push((event_type, payload));
                })
            }),
        );

        (services, trainer, log, subscription)
    }

    fn register_training_data(services: &Arc<ServiceRegistry>, response: Value) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        services.register(
            "link_travel_time_n_preceding_normal_days",
            Arc::new(move |_payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = response.clone();
                Box::pin(async move { Ok(response) })
            }),
        );
        calls
    }

    fn sample_response() -> Value {
        // Half-hourly samples over a few weeks
        let count = 200;
        let time: Vec<f64> = vec![1800.0; count];
        let travel_time: Vec<f64> = (0..count).map(|i| 100.0 + (i % 10) as f64).collect();
        json!({ "time": time, "travelTime": travel_time })
    }

    async fn wait_for_terminal_status(trainer: &Arc<Trainer>, job_id: Uuid) -> TrainingJob {
        for _ in 0..200 {
            if let Some(job) = trainer.jobs.get(&job_id) {
                if job.status == TrainingJobStatus::Completed
                    || job.status == TrainingJobStatus::Failed
                {
                    return job.value().clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("training job {} never reached a terminal status", job_id);
    }

    fn schedule_payload(model: &str) -> Value {
        json!({
            "linkRef": "A-B",
            "model": model,
            "time": "2024-01-01T00:00:00Z",
            "parameters": { "n": 21 }
        })
    }

    #[tokio::test]
    async fn scheduled_job_trains_and_announces_artifact() {
        let (services, trainer, log, _sub) = setup("success").await;
        register_training_data(&services, sample_response());

        let result = services
            .call("link_model_schedule_train", schedule_payload("ha"))
            .await
            .unwrap();
        let job_id: Uuid = serde_json::from_value(result["jobId"].clone()).unwrap();

        let job = wait_for_terminal_status(&trainer, job_id).await;
        assert_eq!(job.status, TrainingJobStatus::Completed);

        let metadata = job.result.unwrap();
        let expected_hash = cache_key(
            "A-B",
            "ha",
            "2024-01-01T00:00:00Z".parse().unwrap(),
            &json!({ "n": 21 }),
        );
        assert_eq!(metadata.hash, expected_hash);
        assert!(trainer.artifacts.model_path(&metadata.hash).exists());
        assert!(trainer.artifacts.metadata_path(&metadata.hash).exists());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["metadata"]["hash"], json!(expected_hash));

        std::fs::remove_dir_all(trainer.config.model_cache_path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn identical_request_reuses_cached_artifact() {
        let (services, trainer, log, _sub) = setup("cache-hit").await;
        let data_calls = register_training_data(&services, sample_response());

        let first = services
            .call("link_model_schedule_train", schedule_payload("ha"))
            .await
            .unwrap();
        let first_id: Uuid = serde_json::from_value(first["jobId"].clone()).unwrap();
        let first_job = wait_for_terminal_status(&trainer, first_id).await;
        assert_eq!(first_job.status, TrainingJobStatus::Completed);
        assert_eq!(data_calls.load(Ordering::SeqCst), 1);

        let second = services
            .call("link_model_schedule_train", schedule_payload("ha"))
            .await
            .unwrap();
        let second_id: Uuid = serde_json::from_value(second["jobId"].clone()).unwrap();
        let second_job = wait_for_terminal_status(&trainer, second_id).await;
        assert_eq!(second_job.status, TrainingJobStatus::Completed);

        // Same content hash, no second fetch or fit
        assert_eq!(data_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            first_job.result.unwrap().hash,
            second_job.result.unwrap().hash
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().unwrap().len(), 2);

        std::fs::remove_dir_all(trainer.config.model_cache_path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn empty_training_data_fails_the_job() {
        let (services, trainer, log, _sub) = setup("no-data").await;
        register_training_data(&services, json!({ "time": [], "travelTime": [] }));

        let result = services
            .call("link_model_schedule_train", schedule_payload("ha"))
            .await
            .unwrap();
        let job_id: Uuid = serde_json::from_value(result["jobId"].clone()).unwrap();

        let job = wait_for_terminal_status(&trainer, job_id).await;
        assert_eq!(job.status, TrainingJobStatus::Failed);
        assert!(job.error.unwrap().contains("no training data"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_error_fails_the_job() {
        let (services, trainer, _log, _sub) = setup("upstream-error").await;
        register_training_data(&services, json!({ "error": "history store offline" }));

        let result = services
            .call("link_model_schedule_train", schedule_payload("ha"))
            .await
            .unwrap();
        let job_id: Uuid = serde_json::from_value(result["jobId"].clone()).unwrap();

        let job = wait_for_terminal_status(&trainer, job_id).await;
        assert_eq!(job.status, TrainingJobStatus::Failed);
        assert!(job.error.unwrap().contains("history store offline"));
    }

    #[tokio::test]
    async fn unknown_model_fails_the_job() {
        let (services, trainer, _log, _sub) = setup("unknown-model").await;
        register_training_data(&services, sample_response());

        let result = services
            .call("link_model_schedule_train", schedule_payload("gbm"))
            .await
            .unwrap();
        let job_id: Uuid = serde_json::from_value(result["jobId"].clone()).unwrap();

        let job = wait_for_terminal_status(&trainer, job_id).await;
        assert_eq!(job.status, TrainingJobStatus::Failed);
        assert!(job.error.unwrap().contains("unknown model"));
    }

    #[tokio::test]
    async fn list_trainer_jobs_returns_job_records() {
        let (services, trainer, _log, _sub) = setup("list-jobs").await;
        register_training_data(&services, sample_response());

        let result = services
            .call("link_model_schedule_train", schedule_payload("ha"))
            .await
            .unwrap();
        let job_id: Uuid = serde_json::from_value(result["jobId"].clone()).unwrap();
        wait_for_terminal_status(&trainer, job_id).await;

        let listed = services.call("list_trainer_jobs", Value::Null).await.unwrap();
        let jobs = listed.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["jobId"], json!(job_id));
        assert_eq!(jobs[0]["status"], json!("Completed"));
        assert_eq!(jobs[0]["request"]["linkRef"], json!("A-B"));

        std::fs::remove_dir_all(trainer.config.model_cache_path.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn training_samples_reconstruct_cumulative_index() {
        let samples = TrainingSamples {
            time: vec![60.0, 60.0, 120.0],
            travel_time: vec![100.0, 110.0, 120.0],
        };
        let (index, values) = samples.into_series();
        assert_eq!(values, vec![100.0, 110.0, 120.0]);
        assert_eq!(index[0].timestamp(), 60);
        assert_eq!(index[1].timestamp(), 120);
        assert_eq!(index[2].timestamp(), 240);
    }
}
