//! Evidence fixtures shared by unit and integration tests.

use crate::evidence::*;

/// Evidence bundle with every required field present
pub fn complete_evidence() -> Evidence {
    complete_evidence_for("gpt-agent")
}

/// Complete evidence whose static identity is `model_id`
pub fn complete_evidence_for(model_id: &str) -> Evidence {
    Evidence::default()
        .with_static(StaticEvidence {
            model_id: Some(model_id.to_string()),
            model_version: Some("1.4.2".to_string()),
            code_digest: Some("ab".repeat(32)),
            configuration: [("temperature".to_string(), "0.2".to_string())]
                .into_iter()
                .collect(),
            dependencies: vec!["tokenizer".to_string(), "retriever".to_string()],
        })
        .with_behavioral(BehavioralEvidence {
            samples: vec![
                BehaviorSample {
                    probe_id: "probe-1".to_string(),
                    response_digest: "01".repeat(32),
                    latency_ms: 120,
                },
                BehaviorSample {
                    probe_id: "probe-2".to_string(),
                    response_digest: "02".repeat(32),
                    latency_ms: 95,
                },
            ],
            error_rate: Some(0.01),
        })
        .with_cognitive(CognitiveEvidence {
            reasoning_traces: vec!["trace-a".to_string(), "trace-b".to_string()],
            capability_scores: [("planning".to_string(), 0.8), ("math".to_string(), 0.9)]
                .into_iter()
                .collect(),
        })
        .with_compositional(CompositionalEvidence {
            components: vec![ComponentRef {
                name: "retriever".to_string(),
                digest: "cd".repeat(32),
            }],
            parent_agents: vec![],
            orchestration_pattern: Some("pipeline".to_string()),
        })
}
