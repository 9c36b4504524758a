//! Run orchestration state machine
//!
//! Drives the four stages in strict order and owns the only control
//! cycle in the system: `VERIFYING → HYPOTHESIZING`, bounded by the
//! iteration budget. The termination predicate is evaluated only
//! after Verification; a run-level deadline is checked at stage
//! boundaries, never mid-stage. Every run ends in exactly one result
//! document, whatever failed along the way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use sdk::errors::GeoError;
use sdk::state::RunState;

use crate::config::{AgentConfig, Config};
use crate::evidence::{build_checks, EvidenceWeights};
use crate::geo::{GeocodeClient, PoiClient};
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::{ChatModel, ModelRouter};
use crate::media::ImageFile;
use crate::retrieval::{GeoRetriever, RemoteGeoRetriever, RetrievalCache};
use crate::stages::retrieval::RetrievalOptions;
use crate::stages::verification::VerificationOptions;
use crate::stages::{HypothesisStage, PerceptionStage, RetrievalStage, VerificationStage};

/// Pipeline phases. The only cycle is Verifying → Hypothesizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Perceiving,
    Hypothesizing,
    Retrieving,
    Verifying,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Perceiving => "perceiving",
            Self::Hypothesizing => "hypothesizing",
            Self::Retrieving => "retrieving",
            Self::Verifying => "verifying",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Evaluate the termination predicate after Verification.
///
/// Returns (terminate, converged). Converged means the top fused
/// score met the threshold; termination without convergence means the
/// iteration budget is spent.
fn should_terminate(
    top_score: Option<f64>,
    threshold: f64,
    iteration: u32,
    max_iterations: u32,
) -> (bool, bool) {
    let converged = top_score.is_some_and(|score| score >= threshold);
    let budget_spent = iteration + 1 >= max_iterations;
    (converged || budget_spent, converged)
}

/// Collaborator health, surfaced by `doctor` and `/healthz`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub vision: Vec<(String, bool)>,
    pub llm: Vec<(String, bool)>,
    /// None when no retrieval endpoint is configured
    pub retriever: Option<bool>,
}

/// Sequences the four stages for one image and owns the iteration
/// loop. One orchestrator serves many runs; each run owns its own
/// `RunState` exclusively.
pub struct Orchestrator {
    perception: PerceptionStage,
    hypothesis: HypothesisStage,
    retrieval: RetrievalStage,
    verification: VerificationStage,
    vision: Arc<ModelRouter>,
    llm: Arc<ModelRouter>,
    retriever: Option<Arc<dyn GeoRetriever>>,
    agent: AgentConfig,
}

impl Orchestrator {
    /// Wire the full pipeline from configuration.
    pub fn from_config(config: &Config) -> Self {
        let vision = Arc::new(ModelRouter::single(
            Box::new(OpenAiProvider::from_vision_config(&config.vision)),
            config.vision.timeout_secs,
        ));

        let providers: Vec<Box<dyn ChatModel>> = vec![
            Box::new(OpenAiProvider::from_config(&config.llm.openai)),
            Box::new(AnthropicProvider::new(config.llm.anthropic.clone())),
            Box::new(OllamaProvider::new(
                &config.llm.ollama.base_url,
                &config.llm.ollama.model,
            )),
        ];
        let llm = Arc::new(ModelRouter::new(
            providers,
            &config.llm.default_provider,
            config.llm.timeout_secs,
        ));

        let geocoder = Arc::new(GeocodeClient::new(&config.geo));
        let poi = Arc::new(PoiClient::new(&config.geo));
        let retriever: Option<Arc<dyn GeoRetriever>> = if config.retrieval.endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(RemoteGeoRetriever::new(&config.retrieval)))
        };
        let cache = RetrievalCache::new(Duration::from_secs(config.retrieval.cache_ttl_secs));

        let weights = EvidenceWeights::from(&config.agent);
        let checks = build_checks(weights, config.agent.topology_check);

        Self::new(
            PerceptionStage::new(Arc::clone(&vision)),
            HypothesisStage::new(Arc::clone(&llm)),
            RetrievalStage::new(
                retriever.clone(),
                cache,
                geocoder,
                Arc::clone(&poi),
                RetrievalOptions {
                    top_k: config.retrieval.top_k,
                    multi_scale: config.retrieval.multi_scale,
                    dedup_radius_m: config.agent.dedup_radius_m,
                },
            ),
            VerificationStage::new(
                Arc::clone(&llm),
                poi,
                checks,
                VerificationOptions {
                    topology_check: config.agent.topology_check,
                    holistic_reasoning: config.agent.holistic_reasoning,
                    min_alternative_score: config.agent.min_alternative_score,
                    confidence_threshold: config.agent.confidence_threshold,
                },
            ),
            vision,
            llm,
            retriever,
            config.agent.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        perception: PerceptionStage,
        hypothesis: HypothesisStage,
        retrieval: RetrievalStage,
        verification: VerificationStage,
        vision: Arc<ModelRouter>,
        llm: Arc<ModelRouter>,
        retriever: Option<Arc<dyn GeoRetriever>>,
        agent: AgentConfig,
    ) -> Self {
        Self {
            perception,
            hypothesis,
            retrieval,
            verification,
            vision,
            llm,
            retriever,
            agent,
        }
    }

    /// Locate an image from disk. The only hard failure is an
    /// unreadable/corrupt input image, surfaced before Perception.
    pub async fn run(&self, path: &Path) -> Result<RunState, GeoError> {
        let image = ImageFile::load(path)?;
        self.run_image(image).await
    }

    /// Execute the state machine for a validated image.
    pub async fn run_image(&self, image: ImageFile) -> Result<RunState, GeoError> {
        let mut state = RunState::new(image.image_ref());
        let deadline = Instant::now() + Duration::from_secs(self.agent.run_timeout_secs);
        let run_id = state.run_id.clone();
        info!("Run {run_id}: starting");

        let mut phase = Phase::Perceiving;
        while phase != Phase::Done {
            // Run-level deadline, checked only at stage boundaries
            if Instant::now() >= deadline {
                warn!("Run {run_id}: deadline reached in phase {phase}");
                state.note_degraded("run deadline");
                self.verification.finalize(&mut state, false).await;
                break;
            }

            phase = match phase {
                Phase::Perceiving => {
                    self.perception.run(&image, &mut state).await?;
                    Phase::Hypothesizing
                }
                Phase::Hypothesizing => {
                    self.hypothesis.run(&mut state).await?;
                    Phase::Retrieving
                }
                Phase::Retrieving => match self.retrieval.run(&image, &mut state).await {
                    Ok(()) => Phase::Verifying,
                    Err(GeoError::NoCandidates) => {
                        warn!("Run {run_id}: no candidates, finishing with empty prediction");
                        self.verification.finalize_empty(&mut state);
                        Phase::Done
                    }
                    Err(other) => return Err(other),
                },
                Phase::Verifying => {
                    self.verification.run(&mut state).await?;
                    let top_score = state.candidates.first().map(|c| c.score());
                    let (terminate, converged) = should_terminate(
                        top_score,
                        self.agent.confidence_threshold,
                        state.iteration,
                        self.agent.max_iterations,
                    );
                    if terminate {
                        self.verification.finalize(&mut state, converged).await;
                        Phase::Done
                    } else {
                        info!(
                            "Run {run_id}: top score {:.2} below threshold, re-hypothesizing",
                            top_score.unwrap_or(0.0)
                        );
                        state.iteration += 1;
                        Phase::Hypothesizing
                    }
                }
                Phase::Done => Phase::Done,
            };
        }

        info!("Run {run_id}: finished");
        Ok(state)
    }

    /// Batch mode: each image is an independent run with its own
    /// state; runs execute concurrently up to the given limit.
    pub async fn run_batch(
        &self,
        paths: Vec<PathBuf>,
        concurrency: usize,
    ) -> Vec<(PathBuf, Result<RunState, GeoError>)> {
        stream::iter(paths)
            .map(|path| async move {
                let result = self.run(&path).await;
                (path, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// Probe all collaborators.
    pub async fn check_health(&self) -> HealthReport {
        let vision = self
            .vision
            .check_health()
            .await
            .into_iter()
            .map(|(name, healthy)| (name.to_string(), healthy))
            .collect();
        let llm = self
            .llm
            .check_health()
            .await
            .into_iter()
            .map(|(name, healthy)| (name.to_string(), healthy))
            .collect();
        let retriever = match &self.retriever {
            Some(retriever) => Some(retriever.check_health().await),
            None => None,
        };
        HealthReport {
            vision,
            llm,
            retriever,
        }
    }
}
