//! End-to-end pipeline tests with mock collaborators.
//!
//! The model collaborators are in-process mocks; the geo services are
//! wiremock HTTP servers speaking the Nominatim/Overpass wire formats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sdk::state::EvidenceResult;
use waypoint_engine::config::{AgentConfig, GeoConfig};
use waypoint_engine::evidence::{build_checks, EvidenceWeights};
use waypoint_engine::geo::{GeocodeClient, PoiClient};
use waypoint_engine::llm::{ChatModel, Message, ModelRouter};
use waypoint_engine::media::ImageFile;
use waypoint_engine::orchestrator::Orchestrator;
use waypoint_engine::retrieval::{
    GeoCell, GeoRetriever, RetrievalCache, RetrievalScale,
};
use waypoint_engine::stages::retrieval::RetrievalOptions;
use waypoint_engine::stages::verification::VerificationOptions;
use waypoint_engine::stages::{
    HypothesisStage, PerceptionStage, RetrievalStage, VerificationStage,
};

/// Chat/vision mock with a canned response and a call counter.
struct MockModel {
    response: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MockModel {
    fn ok(response: &str) -> (Box<dyn ChatModel>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Self {
                response: Some(response.to_string()),
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }

    fn failing() -> Box<dyn ChatModel> {
        Box::new(Self {
            response: None,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl ChatModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn generate(&self, _messages: &[Message]) -> waypoint_engine::llm::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Some(text) => Ok(text.clone()),
            None => Err(waypoint_engine::llm::LlmError::ProviderUnavailable(
                "mock outage".to_string(),
            )),
        }
    }
}

/// Embedding retriever mock returning fixed cells.
struct MockRetriever {
    cells: Vec<GeoCell>,
}

#[async_trait]
impl GeoRetriever for MockRetriever {
    fn name(&self) -> &str {
        "mock"
    }

    async fn retrieve(
        &self,
        _image: &ImageFile,
        top_k: usize,
        _scale: RetrievalScale,
    ) -> waypoint_engine::retrieval::Result<Vec<GeoCell>> {
        Ok(self.cells.iter().take(top_k).cloned().collect())
    }
}

const PERCEPTION_JSON: &str = r#"{
    "ocr": [{"text": "Eiffel Tower", "confidence": 0.9, "language": "en"}],
    "visual": [{"kind": "landmark", "value": "wrought-iron lattice tower", "confidence": 0.85}]
}"#;

const HYPOTHESIS_JSON: &str = r#"[
    {"region": "Paris, France", "rationale": "landmark name on signage",
     "supporting_clue_ids": [0, 1], "conflicting_clue_ids": [], "confidence": 0.85},
    {"region": "Las Vegas, Nevada, USA", "rationale": "replica possibility",
     "supporting_clue_ids": [1], "conflicting_clue_ids": [0], "confidence": 0.15}
]"#;

fn minimal_jpeg() -> ImageFile {
    ImageFile::from_bytes(vec![0xFF, 0xD8, 0xFF, 0xD9]).expect("valid jpeg")
}

async fn mock_geo_services() -> MockServer {
    let server = MockServer::start().await;

    // Forward geocoding: every hypothesis region resolves to Paris
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "lat": "48.8566",
                "lon": "2.3522",
                "display_name": "Paris, Île-de-France, France",
                "name": "Paris",
                "importance": 0.5
            }
        ])))
        .mount(&server)
        .await;

    // Reverse geocoding: the retrieved cell is the Eiffel Tower
    Mock::given(method("GET"))
        .and(path("/reverse"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "lat": "48.8584",
            "lon": "2.2945",
            "display_name": "Tour Eiffel, Avenue Gustave Eiffel, Paris, France",
            "name": "Tour Eiffel",
            "importance": 0.83
        })))
        .mount(&server)
        .await;

    // Overpass: Eiffel Tower node for both named search and nearby
    Mock::given(method("POST"))
        .and(path("/api/interpreter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "elements": [
                {
                    "type": "node",
                    "id": 1,
                    "lat": 48.8584,
                    "lon": 2.2945,
                    "tags": {"name": "Eiffel Tower", "tourism": "attraction"}
                }
            ]
        })))
        .mount(&server)
        .await;

    server
}

struct Harness {
    orchestrator: Orchestrator,
    hypothesis_calls: Arc<AtomicUsize>,
}

/// Assemble an orchestrator over mock models + mock geo services.
async fn harness(
    vision: Box<dyn ChatModel>,
    hypothesis_llm: (Box<dyn ChatModel>, Arc<AtomicUsize>),
    retriever: Option<Arc<dyn GeoRetriever>>,
    geo_server: &MockServer,
    agent: AgentConfig,
) -> Harness {
    let geo_config = GeoConfig {
        nominatim_url: geo_server.uri(),
        overpass_url: format!("{}/api/interpreter", geo_server.uri()),
        user_agent: "waypoint-tests".to_string(),
        timeout_secs: 5,
    };

    let vision_router = Arc::new(ModelRouter::single(vision, 5));
    let (hypothesis_model, hypothesis_calls) = hypothesis_llm;
    let llm = Arc::new(ModelRouter::single(hypothesis_model, 5));

    let geocoder = Arc::new(GeocodeClient::new(&geo_config));
    let poi = Arc::new(PoiClient::new(&geo_config));
    let cache = RetrievalCache::new(std::time::Duration::from_secs(60));
    let weights = EvidenceWeights::from(&agent);

    let orchestrator = Orchestrator::new(
        PerceptionStage::new(Arc::clone(&vision_router)),
        HypothesisStage::new(Arc::clone(&llm)),
        RetrievalStage::new(
            retriever.clone(),
            cache,
            geocoder,
            Arc::clone(&poi),
            RetrievalOptions {
                top_k: 5,
                multi_scale: false,
                dedup_radius_m: agent.dedup_radius_m,
            },
        ),
        VerificationStage::new(
            Arc::clone(&llm),
            poi,
            build_checks(weights, agent.topology_check),
            VerificationOptions {
                topology_check: agent.topology_check,
                holistic_reasoning: agent.holistic_reasoning,
                min_alternative_score: agent.min_alternative_score,
                confidence_threshold: agent.confidence_threshold,
            },
        ),
        vision_router,
        llm,
        retriever,
        agent,
    );

    Harness {
        orchestrator,
        hypothesis_calls,
    }
}

fn test_agent_config() -> AgentConfig {
    AgentConfig {
        holistic_reasoning: false,
        ..AgentConfig::default()
    }
}

// Scenario from the spec: a clean Eiffel Tower run must converge in
// one iteration with confidence >= 0.9.
#[tokio::test]
async fn test_eiffel_tower_run_converges() {
    let geo = mock_geo_services().await;
    let retriever: Arc<dyn GeoRetriever> = Arc::new(MockRetriever {
        cells: vec![GeoCell {
            lat: 48.8584,
            lon: 2.2945,
            score: 0.8,
        }],
    });

    let harness = harness(
        MockModel::ok(PERCEPTION_JSON).0,
        MockModel::ok(HYPOTHESIS_JSON),
        Some(retriever),
        &geo,
        test_agent_config(),
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("run succeeds");

    let prediction = state.prediction.as_ref().expect("exactly one prediction");
    assert!(prediction.converged);
    assert!(
        prediction.confidence >= 0.9,
        "confidence {}",
        prediction.confidence
    );
    assert!((prediction.lat - 48.8584).abs() < 0.01);
    assert!((prediction.lon - 2.2945).abs() < 0.01);
    assert_eq!(state.iteration, 0, "converged on the first iteration");
    assert_eq!(
        harness.hypothesis_calls.load(Ordering::SeqCst),
        1,
        "no second hypothesis call after convergence"
    );

    // Every supporting claim traces to a ledger entry
    assert!(!prediction.supporting_evidence.is_empty());
    for evidence in &prediction.supporting_evidence {
        assert_eq!(evidence.result, EvidenceResult::Support);
        assert!(state.evidence().contains(evidence));
    }
}

// Candidates from the retrieval and symbolic paths at nearly the same
// coordinates merge into one candidate with both provenance tags.
#[tokio::test]
async fn test_cross_path_candidates_merge() {
    let geo = mock_geo_services().await;
    let retriever: Arc<dyn GeoRetriever> = Arc::new(MockRetriever {
        cells: vec![GeoCell {
            lat: 48.8590, // ~200 m from the Overpass POI hit
            lon: 2.2950,
            score: 0.8,
        }],
    });

    let harness = harness(
        MockModel::ok(PERCEPTION_JSON).0,
        MockModel::ok(HYPOTHESIS_JSON),
        Some(retriever),
        &geo,
        test_agent_config(),
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("run succeeds");

    let tower = state
        .candidates
        .iter()
        .find(|c| (c.lat - 48.859).abs() < 0.01 && (c.lon - 2.295).abs() < 0.01)
        .expect("merged tower candidate");
    assert!(
        tower.sources.len() >= 2,
        "provenance union, got {:?}",
        tower.sources
    );
    assert_eq!(tower.raw_score, 0.8, "max raw score survives the merge");
}

// Perception collaborator fails entirely: the run degrades to a
// metadata-only clue set, still terminates, and caps confidence.
#[tokio::test]
async fn test_degraded_perception_still_produces_prediction() {
    let geo = mock_geo_services().await;

    let harness = harness(
        MockModel::failing(),
        MockModel::ok(HYPOTHESIS_JSON),
        None, // embedding path unavailable too
        &geo,
        test_agent_config(),
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("degraded run still succeeds");

    assert!(state.clues.is_degraded());
    assert!(state.degraded.iter().any(|d| d.contains("vision")));

    let prediction = state.prediction.as_ref().expect("prediction");
    assert!(
        prediction.confidence <= 0.6,
        "degraded ceiling, got {}",
        prediction.confidence
    );
    assert!(prediction.reasoning.contains("vision"));
}

// Every collaborator is down and retrieval yields nothing: the run
// must end with a zero-confidence prediction, not an error.
#[tokio::test]
async fn test_no_candidates_yields_zero_confidence() {
    let server = MockServer::start().await;
    // Geocoder returns empty result sets; Overpass errors
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interpreter"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let harness = harness(
        MockModel::failing(),
        (MockModel::failing(), Arc::new(AtomicUsize::new(0))),
        None,
        &server,
        test_agent_config(),
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("run produces a result document");

    let prediction = state.prediction.as_ref().expect("prediction");
    assert_eq!(prediction.confidence, 0.0);
    assert!(prediction.reasoning.contains("No location candidates"));
    assert!(!prediction.converged);
}

// Below-threshold scores loop back to Hypothesis exactly once with a
// budget of 2, and all iterations' hypotheses are retained for audit.
#[tokio::test]
async fn test_non_convergence_iterates_then_terminates() {
    let server = MockServer::start().await;
    // A weak geocode hit so the fused score stays below threshold
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "lat": "40.0",
                "lon": "-75.0",
                "display_name": "Somewhere, USA",
                "name": "Somewhere",
                "importance": 0.3
            }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/interpreter"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"elements": []})),
        )
        .mount(&server)
        .await;

    let weak_hypothesis = r#"[{"region": "Pennsylvania, USA", "rationale": "faint clue",
        "supporting_clue_ids": [0], "confidence": 0.4}]"#;

    let harness = harness(
        MockModel::ok(PERCEPTION_JSON).0,
        MockModel::ok(weak_hypothesis),
        None,
        &server,
        test_agent_config(),
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("run succeeds");

    assert_eq!(
        harness.hypothesis_calls.load(Ordering::SeqCst),
        2,
        "one re-hypothesis pass with max_iterations = 2"
    );
    assert_eq!(state.iteration, 1);
    assert!(state.hypotheses.iter().any(|h| h.iteration == 0));
    assert!(state.hypotheses.iter().any(|h| h.iteration == 1));

    let prediction = state.prediction.as_ref().expect("prediction");
    assert!(!prediction.converged);
    assert!(prediction.reasoning.contains("did not converge"));
    assert!(prediction.confidence <= 0.75, "capped at the threshold");
}

// A zero-second run deadline forces termination at the first stage
// boundary, still emitting a result document.
#[tokio::test]
async fn test_run_deadline_emits_incomplete_result() {
    let geo = mock_geo_services().await;

    let agent = AgentConfig {
        run_timeout_secs: 0,
        holistic_reasoning: false,
        ..AgentConfig::default()
    };
    let harness = harness(
        MockModel::ok(PERCEPTION_JSON).0,
        MockModel::ok(HYPOTHESIS_JSON),
        None,
        &geo,
        agent,
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("run still returns a document");

    let prediction = state.prediction.as_ref().expect("prediction");
    assert!(!prediction.converged);
    assert!(state.degraded.iter().any(|d| d.contains("deadline")));
}

// An unreadable input image is the one hard failure, surfaced before
// Perception.
#[tokio::test]
async fn test_corrupt_image_is_fatal() {
    let geo = mock_geo_services().await;
    let harness = harness(
        MockModel::ok(PERCEPTION_JSON).0,
        MockModel::ok(HYPOTHESIS_JSON),
        None,
        &geo,
        test_agent_config(),
    )
    .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let bad = dir.path().join("not-an-image.jpg");
    std::fs::write(&bad, b"plain text").expect("write");

    let result = harness.orchestrator.run(&bad).await;
    assert!(matches!(
        result,
        Err(sdk::errors::GeoError::InvalidImage(_))
    ));
}

// The whole result document round-trips through JSON unchanged.
#[tokio::test]
async fn test_result_document_round_trips() {
    let geo = mock_geo_services().await;
    let retriever: Arc<dyn GeoRetriever> = Arc::new(MockRetriever {
        cells: vec![GeoCell {
            lat: 48.8584,
            lon: 2.2945,
            score: 0.8,
        }],
    });
    let harness = harness(
        MockModel::ok(PERCEPTION_JSON).0,
        MockModel::ok(HYPOTHESIS_JSON),
        Some(retriever),
        &geo,
        test_agent_config(),
    )
    .await;

    let state = harness
        .orchestrator
        .run_image(minimal_jpeg())
        .await
        .expect("run succeeds");

    let json = serde_json::to_string(&state).expect("serialize");
    let parsed: sdk::state::RunState = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(state, parsed);
}
