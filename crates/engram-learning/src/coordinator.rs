//! Pipeline coordinator
//!
//! Evaluates which extractors a newly written interaction (or a manual or
//! rerun trigger) schedules, and guarantees at-most-one in-flight run per
//! extractor scope. Overlapping triggers coalesce into a single pending
//! follow-up through the operation-state row; a run that exceeds its
//! timeout leaves a stale lock any later trigger may preempt.

use engram_core::llm::LlmAdapter;
use engram_core::*;
use engram_types::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregate::FeedbackAggregator;
use crate::feedback::FeedbackExtractor;
use crate::profile::ProfileExtractor;
use crate::skills::SkillSynthesizer;
use crate::success::SuccessEvaluator;
use crate::windows::WindowService;

/// Stale-lock age; a holder older than this is preemptable
pub const STALE_LOCK_SECONDS: i64 = 300;

/// Hard deadline for one extraction run
pub const RUN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub tenant_worker_pool_size: usize,
    pub llm_concurrency_limit: usize,
    pub stale_lock_seconds: i64,
    pub run_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tenant_worker_pool_size: 8,
            llm_concurrency_limit: 32,
            stale_lock_seconds: STALE_LOCK_SECONDS,
            run_timeout: RUN_TIMEOUT,
        }
    }
}

/// One schedulable unit of derivation work
#[derive(Debug, Clone)]
pub enum ExtractionJob {
    Profile {
        extractor_name: String,
        user_id: UserId,
        mode: WindowMode,
    },
    Feedback {
        feedback_name: String,
        agent_version: String,
        mode: WindowMode,
    },
    Aggregation {
        feedback_name: String,
        agent_version: String,
    },
    Success {
        evaluation_name: String,
        request_id: RequestId,
    },
    Skills {
        feedback_name: String,
        agent_version: String,
    },
}

impl ExtractionJob {
    /// The concurrency-control scope key of this job
    pub fn scope(&self) -> String {
        match self {
            ExtractionJob::Profile {
                extractor_name,
                user_id,
                ..
            } => format!("profile:{extractor_name}:{user_id}"),
            ExtractionJob::Feedback {
                feedback_name,
                agent_version,
                ..
            } => format!("feedback:{feedback_name}:{agent_version}"),
            ExtractionJob::Aggregation {
                feedback_name,
                agent_version,
            } => format!("aggregate:{feedback_name}:{agent_version}"),
            ExtractionJob::Success {
                evaluation_name,
                request_id,
            } => format!("success:{evaluation_name}:{request_id}"),
            ExtractionJob::Skills {
                feedback_name,
                agent_version,
            } => format!("skills:{feedback_name}:{agent_version}"),
        }
    }
}

/// LLM adapter decorator enforcing the global concurrency cap
struct GatedLlm {
    inner: Arc<dyn LlmAdapter>,
    gate: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl LlmAdapter for GatedLlm {
    async fn structured_generate(
        &self,
        model: &str,
        schema: &Value,
        prompt: &str,
    ) -> Result<Value> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| EngramError::Other("LLM gate closed".to_string()))?;
        self.inner.structured_generate(model, schema, prompt).await
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| EngramError::Other("LLM gate closed".to_string()))?;
        self.inner.embed(model, text).await
    }
}

struct CoordinatorInner {
    interactions: Arc<dyn InteractionRepository>,
    operation_states: Arc<dyn OperationStateRepository>,
    windows: Arc<WindowService>,
    profile_extractor: ProfileExtractor,
    feedback_extractor: FeedbackExtractor,
    aggregator: FeedbackAggregator,
    success_evaluator: SuccessEvaluator,
    skill_synthesizer: SkillSynthesizer,
    tenant_pools: Mutex<HashMap<OrgId, Arc<Semaphore>>>,
    settings: CoordinatorSettings,
}

/// Cheaply clonable handle to the coordinator; spawned workers carry one
#[derive(Clone)]
pub struct PipelineCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PipelineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        interactions: Arc<dyn InteractionRepository>,
        profiles: Arc<dyn ProfileRepository>,
        raw_feedbacks: Arc<dyn RawFeedbackRepository>,
        agg_feedbacks: Arc<dyn AggregatedFeedbackRepository>,
        skills: Arc<dyn SkillRepository>,
        success: Arc<dyn SuccessRepository>,
        operation_states: Arc<dyn OperationStateRepository>,
        llm: Arc<dyn LlmAdapter>,
        settings: CoordinatorSettings,
    ) -> Self {
        let llm: Arc<dyn LlmAdapter> = Arc::new(GatedLlm {
            inner: llm,
            gate: Arc::new(Semaphore::new(settings.llm_concurrency_limit)),
        });
        let windows = Arc::new(WindowService::new(Arc::clone(&interactions)));

        Self {
            inner: Arc::new(CoordinatorInner {
                interactions,
                operation_states,
                windows: Arc::clone(&windows),
                profile_extractor: ProfileExtractor::new(Arc::clone(&profiles), Arc::clone(&llm)),
                feedback_extractor: FeedbackExtractor::new(
                    Arc::clone(&raw_feedbacks),
                    Arc::clone(&llm),
                ),
                aggregator: FeedbackAggregator::new(
                    Arc::clone(&raw_feedbacks),
                    Arc::clone(&agg_feedbacks),
                    Arc::clone(&llm),
                ),
                success_evaluator: SuccessEvaluator::new(
                    Arc::clone(&windows),
                    success,
                    Arc::clone(&llm),
                ),
                skill_synthesizer: SkillSynthesizer::new(agg_feedbacks, skills, llm),
                tenant_pools: Mutex::new(HashMap::new()),
                settings,
            }),
        }
    }

    pub fn window_service(&self) -> &Arc<WindowService> {
        &self.inner.windows
    }

    fn tenant_pool(&self, org_id: &str) -> Arc<Semaphore> {
        let mut pools = self
            .inner
            .tenant_pools
            .lock()
            .expect("tenant pool mutex poisoned");
        Arc::clone(pools.entry(org_id.to_string()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.inner.settings.tenant_worker_pool_size))
        }))
    }

    fn source_enabled(enabled: &Option<Vec<String>>, source: &str) -> bool {
        match enabled {
            None => true,
            Some(sources) => sources.is_empty() || sources.iter().any(|s| s == source),
        }
    }

    /// Evaluate every configured extractor against a freshly written
    /// request and schedule the eligible ones
    pub async fn on_interaction_write(
        &self,
        org_id: &str,
        tenant: Arc<TenantConfig>,
        request: &Request,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for config in &tenant.profile_extractor_configs {
            if config.manual_trigger
                || !Self::source_enabled(&config.request_sources_enabled, &request.source)
            {
                continue;
            }
            let job = ExtractionJob::Profile {
                extractor_name: config.extractor_name.clone(),
                user_id: request.user_id.clone(),
                mode: WindowMode::Incremental,
            };
            handles.extend(
                self.schedule(org_id, Arc::clone(&tenant), &request.request_id, job)
                    .await,
            );
        }

        for config in &tenant.agent_feedback_configs {
            if !Self::source_enabled(&config.request_sources_enabled, &request.source) {
                continue;
            }
            let job = ExtractionJob::Feedback {
                feedback_name: config.feedback_name.clone(),
                agent_version: request.agent_version.clone(),
                mode: WindowMode::Incremental,
            };
            handles.extend(
                self.schedule(org_id, Arc::clone(&tenant), &request.request_id, job)
                    .await,
            );
        }

        for config in &tenant.agent_success_configs {
            if !SuccessEvaluator::sampled(config, &request.request_id) {
                continue;
            }
            let job = ExtractionJob::Success {
                evaluation_name: config.evaluation_name.clone(),
                request_id: request.request_id.clone(),
            };
            handles.extend(
                self.schedule(org_id, Arc::clone(&tenant), &request.request_id, job)
                    .await,
            );
        }

        handles
    }

    /// Acquire the job's scope and spawn its worker; a lost acquisition
    /// records the trigger as the scope's single pending follow-up
    pub fn schedule<'a>(
        &'a self,
        org_id: &'a str,
        tenant: Arc<TenantConfig>,
        request_id: &'a str,
        job: ExtractionJob,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<JoinHandle<()>>> + Send + 'a>>
    {
        Box::pin(self.schedule_inner(org_id, tenant, request_id, job))
    }

    async fn schedule_inner(
        &self,
        org_id: &str,
        tenant: Arc<TenantConfig>,
        request_id: &str,
        job: ExtractionJob,
    ) -> Option<JoinHandle<()>> {
        let scope = job.scope();
        let outcome = match self
            .inner
            .operation_states
            .try_acquire(
                org_id,
                &scope,
                request_id,
                self.inner.settings.stale_lock_seconds,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%scope, "failed to acquire scope: {err}");
                return None;
            }
        };

        match outcome {
            AcquireOutcome::Coalesced => {
                info!(%scope, "trigger coalesced into pending follow-up");
                None
            }
            AcquireOutcome::Acquired => {
                let coordinator = self.clone();
                let org = org_id.to_string();
                let mut current_request = request_id.to_string();
                Some(tokio::spawn(async move {
                    loop {
                        let Ok(_permit) =
                            coordinator.tenant_pool(&org).acquire_owned().await
                        else {
                            return;
                        };

                        let run = tokio::time::timeout(
                            coordinator.inner.settings.run_timeout,
                            coordinator.run_job(&org, &tenant, &current_request, &job),
                        )
                        .await;

                        match run {
                            Err(_) => {
                                // Leave the lock in place: its age makes it
                                // stale, so the next trigger preempts
                                warn!(scope = %job.scope(), "extraction run timed out");
                                return;
                            }
                            Ok(Err(err)) => {
                                error!(scope = %job.scope(), "extraction run failed: {err}");
                                if let Err(clear_err) = coordinator
                                    .inner
                                    .operation_states
                                    .clear(&org, &job.scope())
                                    .await
                                {
                                    error!("failed to clear operation state: {clear_err}");
                                }
                                return;
                            }
                            Ok(Ok(())) => {}
                        }

                        match coordinator
                            .inner
                            .operation_states
                            .finish(&org, &job.scope())
                            .await
                        {
                            Ok(Some(pending)) => {
                                info!(scope = %job.scope(), "re-entering with coalesced trigger");
                                current_request = pending;
                            }
                            Ok(None) => return,
                            Err(err) => {
                                error!(scope = %job.scope(), "failed to release scope: {err}");
                                return;
                            }
                        }
                    }
                }))
            }
        }
    }

    async fn run_job(
        &self,
        org_id: &str,
        tenant: &Arc<TenantConfig>,
        request_id: &str,
        job: &ExtractionJob,
    ) -> Result<()> {
        let inner = &self.inner;
        match job {
            ExtractionJob::Profile {
                extractor_name,
                user_id,
                mode,
            } => {
                let Some(config) = tenant
                    .profile_extractor_configs
                    .iter()
                    .find(|c| &c.extractor_name == extractor_name)
                else {
                    warn!(%extractor_name, "extractor no longer configured, skipping");
                    return Ok(());
                };
                let filter = InteractionFilter {
                    user_id: Some(user_id.clone()),
                    sources: config.request_sources_enabled.clone().unwrap_or_default(),
                    ..InteractionFilter::default()
                };
                let size = tenant.window_size(&config.window);
                let stride = tenant.window_stride(&config.window);

                match mode {
                    WindowMode::Incremental => {
                        if let Some(window) = inner
                            .windows
                            .incremental(org_id, &filter, size, stride)
                            .await?
                        {
                            inner
                                .profile_extractor
                                .run(org_id, &window, config, tenant)
                                .await?;
                        }
                    }
                    WindowMode::Rerun => {
                        for window in inner.windows.rerun(org_id, &filter, size).await? {
                            inner
                                .profile_extractor
                                .run(org_id, &window, config, tenant)
                                .await?;
                        }
                    }
                    WindowMode::Manual => {
                        if let Some(window) = inner.windows.manual(org_id, &filter, size).await? {
                            inner
                                .profile_extractor
                                .run(org_id, &window, config, tenant)
                                .await?;
                        }
                    }
                }
            }
            ExtractionJob::Feedback {
                feedback_name,
                agent_version,
                mode,
            } => {
                let Some(config) = tenant
                    .agent_feedback_configs
                    .iter()
                    .find(|c| &c.feedback_name == feedback_name)
                else {
                    warn!(%feedback_name, "feedback config no longer present, skipping");
                    return Ok(());
                };
                let filter = InteractionFilter {
                    agent_version: Some(agent_version.clone()),
                    sources: config.request_sources_enabled.clone().unwrap_or_default(),
                    ..InteractionFilter::default()
                };
                let size = tenant.window_size(&config.window);
                let stride = tenant.window_stride(&config.window);

                let windows: Vec<Window> = match mode {
                    WindowMode::Incremental => inner
                        .windows
                        .incremental(org_id, &filter, size, stride)
                        .await?
                        .into_iter()
                        .collect(),
                    WindowMode::Rerun => inner.windows.rerun(org_id, &filter, size).await?,
                    WindowMode::Manual => inner
                        .windows
                        .manual(org_id, &filter, size)
                        .await?
                        .into_iter()
                        .collect(),
                };

                let mut aggregation_due = false;
                for window in windows {
                    let outcome = inner
                        .feedback_extractor
                        .run(org_id, &window, config, tenant, agent_version)
                        .await?;
                    aggregation_due |= outcome.aggregation_due;
                }

                if aggregation_due {
                    // Enqueued as its own task under the aggregate scope so
                    // it never extends this feedback run's lock
                    let coordinator = self.clone();
                    let tenant = Arc::clone(tenant);
                    let org = org_id.to_string();
                    let trigger = request_id.to_string();
                    let job = ExtractionJob::Aggregation {
                        feedback_name: feedback_name.clone(),
                        agent_version: agent_version.clone(),
                    };
                    tokio::spawn(async move {
                        coordinator.schedule(&org, tenant, &trigger, job).await;
                    });
                }
            }
            ExtractionJob::Aggregation {
                feedback_name,
                agent_version,
            } => {
                let Some(config) = tenant
                    .agent_feedback_configs
                    .iter()
                    .find(|c| &c.feedback_name == feedback_name)
                else {
                    warn!(%feedback_name, "feedback config no longer present, skipping");
                    return Ok(());
                };
                inner
                    .aggregator
                    .run(
                        org_id,
                        agent_version,
                        feedback_name,
                        &config.feedback_aggregator_config,
                        tenant,
                    )
                    .await?;
            }
            ExtractionJob::Success {
                evaluation_name,
                request_id,
            } => {
                let Some(config) = tenant
                    .agent_success_configs
                    .iter()
                    .find(|c| &c.evaluation_name == evaluation_name)
                else {
                    warn!(%evaluation_name, "success config no longer present, skipping");
                    return Ok(());
                };
                let Some(request) = inner.interactions.get_request(org_id, request_id).await?
                else {
                    warn!(%request_id, "request vanished before evaluation");
                    return Ok(());
                };
                inner
                    .success_evaluator
                    .run(org_id, &request, config, tenant)
                    .await?;
            }
            ExtractionJob::Skills {
                feedback_name,
                agent_version,
            } => {
                inner
                    .skill_synthesizer
                    .run(org_id, agent_version, feedback_name, tenant)
                    .await?;
            }
        }
        Ok(())
    }
}
