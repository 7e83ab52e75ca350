//! Negotiator: bounded debate across disagreeing agents.
//!
//! When two or more reports diverge (confidence spread above the threshold,
//! or different values on a tracked field), the orchestrator hands them to
//! the negotiator:
//!
//! 1. Each participant opens with the position from its report.
//! 2. Up to `max_rounds` rounds: every participant sees the others'
//!    positions and replies with a stance (`maintain`, `refine`, `concede`,
//!    `challenge`), an updated position, and a confidence. Participants in
//!    a round run in parallel.
//! 3. After each round: consensus holds iff all positions agree on the
//!    tracked fields and mean confidence reaches the threshold.
//! 4. On consensus the agreed position is returned; on exhaustion the
//!    highest-confidence position wins and the dissenting positions are
//!    preserved verbatim.
//!
//! Every round streams as a `negotiation_round` event; the outcome streams
//! as `negotiation_result`.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::careerllm::agent::{AgentRegistry, AgentReport};
use crate::careerllm::config::NegotiationConfig;
use crate::careerllm::event::{EventSink, RoundPosition, TurnEvent};
use crate::careerllm::llm_provider::{LLMProvider, Message};
use crate::careerllm::parse;

/// A participant's stance in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stance {
    Maintain,
    Refine,
    Concede,
    Challenge,
}

impl Stance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Maintain => "maintain",
            Stance::Refine => "refine",
            Stance::Concede => "concede",
            Stance::Challenge => "challenge",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "maintain" => Some(Stance::Maintain),
            "refine" => Some(Stance::Refine),
            "concede" => Some(Stance::Concede),
            "challenge" => Some(Stance::Challenge),
            _ => None,
        }
    }
}

/// One participant's current position.
#[derive(Debug, Clone)]
pub struct Position {
    pub agent: String,
    pub stance: Stance,
    pub position: Value,
    pub confidence: f32,
    pub rationale: String,
}

/// The outcome of a negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    /// Whether the participants converged before the round budget ran out.
    pub consensus: bool,
    /// The agreed (or winning) position.
    pub position: Value,
    /// Confidence attached to the returned position.
    pub confidence: f32,
    /// Rounds actually executed.
    pub rounds: usize,
    /// Dissenting positions, verbatim, when no consensus was reached.
    pub dissents: Vec<Value>,
}

#[derive(Deserialize)]
struct RawPosition {
    stance: Option<String>,
    position: Option<Value>,
    confidence: Option<f32>,
    #[serde(default)]
    rationale: String,
}

/// Debate coordinator.
pub struct Negotiator {
    provider: Arc<dyn LLMProvider>,
    config: NegotiationConfig,
}

impl Negotiator {
    pub fn new(provider: Arc<dyn LLMProvider>, config: NegotiationConfig) -> Self {
        Self { provider, config }
    }

    /// Whether the given reports disagree enough to warrant a debate.
    pub fn divergent(&self, reports: &[AgentReport], registry: &AgentRegistry) -> bool {
        if !self.config.enabled || reports.len() < 2 {
            return false;
        }

        let mut low = f32::MAX;
        let mut high = f32::MIN;
        for report in reports {
            low = low.min(report.confidence);
            high = high.max(report.confidence);
        }
        if high - low > self.config.spread_threshold {
            return true;
        }

        for field in tracked_fields(reports, registry) {
            let values: Vec<&Value> = reports.iter().filter_map(|r| r.field(&field)).collect();
            if values.len() >= 2 && values.iter().any(|v| *v != values[0]) {
                return true;
            }
        }
        false
    }

    /// Debate the given reports to a consensus or a winning position.
    pub async fn run(
        &self,
        task: &str,
        reports: &[AgentReport],
        registry: &AgentRegistry,
        sink: &dyn EventSink,
    ) -> NegotiationOutcome {
        if reports.is_empty() {
            return NegotiationOutcome {
                consensus: false,
                position: Value::Null,
                confidence: 0.0,
                rounds: 0,
                dissents: Vec::new(),
            };
        }

        let fields: Vec<String> = tracked_fields(reports, registry).into_iter().collect();
        let mut positions: Vec<Position> = reports
            .iter()
            .map(|report| Position {
                agent: report.agent.clone(),
                stance: Stance::Maintain,
                position: report.content.clone(),
                confidence: report.confidence,
                rationale: report.rationale.clone(),
            })
            .collect();

        let mut rounds = 0;
        while rounds < self.config.max_rounds {
            rounds += 1;
            positions = self.run_round(task, &positions, &fields, rounds).await;

            sink.emit(TurnEvent::NegotiationRound {
                round: rounds,
                positions: positions
                    .iter()
                    .map(|p| RoundPosition {
                        agent: p.agent.clone(),
                        stance: p.stance.as_str().to_string(),
                        confidence: p.confidence,
                    })
                    .collect(),
            })
            .await;

            if self.converged(&positions, &fields) {
                let winner = highest_confidence(&positions);
                let outcome = NegotiationOutcome {
                    consensus: true,
                    position: winner.position.clone(),
                    confidence: mean_confidence(&positions),
                    rounds,
                    dissents: Vec::new(),
                };
                sink.emit(TurnEvent::NegotiationResult {
                    consensus: true,
                    position: outcome.position.clone(),
                    dissents: Vec::new(),
                })
                .await;
                return outcome;
            }
        }

        let winner = highest_confidence(&positions);
        let dissents: Vec<Value> = positions
            .iter()
            .filter(|p| p.agent != winner.agent && !agrees(p, winner, &fields))
            .map(|p| p.position.clone())
            .collect();
        let outcome = NegotiationOutcome {
            consensus: false,
            position: winner.position.clone(),
            confidence: winner.confidence,
            rounds,
            dissents: dissents.clone(),
        };
        sink.emit(TurnEvent::NegotiationResult {
            consensus: false,
            position: outcome.position.clone(),
            dissents,
        })
        .await;
        outcome
    }

    /// Run one debate round with every participant in parallel.
    async fn run_round(
        &self,
        task: &str,
        positions: &[Position],
        fields: &[String],
        round: usize,
    ) -> Vec<Position> {
        let mut handles = Vec::new();
        for current in positions {
            let provider = Arc::clone(&self.provider);
            let messages = self.build_messages(task, current, positions, fields, round);
            let previous = current.clone();
            handles.push(tokio::spawn(async move {
                let reply = match provider.complete_structured(&messages).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        log::warn!("negotiation call for {} failed: {}", previous.agent, err);
                        return previous;
                    }
                };
                match parse::parse_reply::<RawPosition>(&reply.text) {
                    Ok(raw) => Position {
                        stance: raw
                            .stance
                            .as_deref()
                            .and_then(Stance::parse)
                            .unwrap_or(Stance::Maintain),
                        position: raw.position.unwrap_or_else(|| previous.position.clone()),
                        confidence: raw
                            .confidence
                            .unwrap_or(previous.confidence)
                            .clamp(0.0, 1.0),
                        rationale: if raw.rationale.is_empty() {
                            previous.rationale.clone()
                        } else {
                            raw.rationale
                        },
                        agent: previous.agent,
                    },
                    Err(err) => {
                        log::warn!("unparseable position from {}: {}", previous.agent, err);
                        previous
                    }
                }
            }));
        }

        let mut next = Vec::with_capacity(positions.len());
        for (handle, original) in handles.into_iter().zip(positions.iter()) {
            match handle.await {
                Ok(position) => next.push(position),
                Err(err) => {
                    log::error!("negotiation task for {} panicked: {}", original.agent, err);
                    next.push(original.clone());
                }
            }
        }
        next
    }

    fn converged(&self, positions: &[Position], fields: &[String]) -> bool {
        let first = match positions.first() {
            Some(first) => first,
            None => return false,
        };
        let aligned = positions.iter().all(|p| agrees(p, first, fields));
        aligned && mean_confidence(positions) >= self.config.consensus_threshold
    }

    fn build_messages(
        &self,
        task: &str,
        current: &Position,
        positions: &[Position],
        fields: &[String],
        round: usize,
    ) -> Vec<Message> {
        let mut others = String::new();
        for p in positions.iter().filter(|p| p.agent != current.agent) {
            others.push_str(&format!(
                "- {} (confidence {:.2}): {}\n  rationale: {}\n",
                p.agent, p.confidence, p.position, p.rationale
            ));
        }

        let system = format!(
            "You are agent {} in round {} of a structured debate between \
             specialists who disagreed. Consider the other positions, then \
             reply with a single JSON object: {{\"stance\": one of \
             \"maintain\", \"refine\", \"concede\", \"challenge\", \
             \"position\": object, \"confidence\": number between 0 and 1, \
             \"rationale\": string}}. The fields under comparison are [{}]. \
             Concede when another position is clearly better supported.",
            current.agent,
            round,
            fields.join(", ")
        );
        let user = format!(
            "Task under discussion: {}\n\nYour current position (confidence {:.2}): {}\n\
             Your rationale: {}\n\nOther positions:\n{}",
            task, current.confidence, current.position, current.rationale, others
        );
        vec![Message::system(&system), Message::user(&user)]
    }
}

/// Union of the tracked fields of every involved agent, ordered.
fn tracked_fields(reports: &[AgentReport], registry: &AgentRegistry) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    for report in reports {
        if let Some(profile) = registry.get(&report.agent) {
            for field in &profile.tracked_fields {
                fields.insert(field.clone());
            }
        }
    }
    fields
}

/// Whether two positions agree on the tracked fields (or entirely, when no
/// fields are tracked).
fn agrees(a: &Position, b: &Position, fields: &[String]) -> bool {
    if fields.is_empty() {
        return a.position == b.position;
    }
    fields
        .iter()
        .all(|f| a.position.get(f) == b.position.get(f))
}

fn mean_confidence(positions: &[Position]) -> f32 {
    if positions.is_empty() {
        return 0.0;
    }
    positions.iter().map(|p| p.confidence).sum::<f32>() / positions.len() as f32
}

fn highest_confidence(positions: &[Position]) -> &Position {
    let mut best = &positions[0];
    for p in positions {
        if p.confidence > best.confidence {
            best = p;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::careerllm::event::CollectorSink;
    use crate::careerllm::providers::ScriptedProvider;
    use serde_json::json;

    fn report(agent: &str, confidence: f32, content: Value) -> AgentReport {
        AgentReport {
            agent: agent.to_string(),
            display_name: agent.to_string(),
            summary: "s".to_string(),
            content,
            confidence,
            rationale: "r".to_string(),
            usage: None,
        }
    }

    fn negotiator(provider: Arc<ScriptedProvider>) -> Negotiator {
        Negotiator::new(provider, NegotiationConfig::default())
    }

    #[test]
    fn test_divergence_on_confidence_spread() {
        let provider = Arc::new(ScriptedProvider::new());
        let n = negotiator(provider);
        let registry = AgentRegistry::default_catalog();
        let reports = vec![
            report("scout", 0.9, json!({})),
            report("match", 0.4, json!({})),
        ];
        assert!(n.divergent(&reports, &registry));

        let close = vec![
            report("scout", 0.8, json!({})),
            report("match", 0.75, json!({})),
        ];
        assert!(!n.divergent(&close, &registry));
    }

    #[test]
    fn test_divergence_on_tracked_fields() {
        let provider = Arc::new(ScriptedProvider::new());
        let n = negotiator(provider);
        let registry = AgentRegistry::default_catalog();
        let reports = vec![
            report("scout", 0.8, json!({ "top_job_id": "a" })),
            report("match", 0.8, json!({ "top_job_id": "b", "fit_score": 0.7 })),
        ];
        assert!(n.divergent(&reports, &registry));
    }

    #[test]
    fn test_single_report_never_diverges() {
        let provider = Arc::new(ScriptedProvider::new());
        let n = negotiator(provider);
        let registry = AgentRegistry::default_catalog();
        assert!(!n.divergent(&[report("scout", 0.1, json!({}))], &registry));
    }

    #[tokio::test]
    async fn test_consensus_in_first_round() {
        let provider = Arc::new(ScriptedProvider::new());
        // Both participants land on the same tracked value with high
        // confidence; order within the round does not matter.
        for _ in 0..2 {
            provider.push_structured(
                "{\"stance\": \"concede\", \"position\": {\"top_job_id\": \"a\"}, \
                 \"confidence\": 0.9, \"rationale\": \"agreed\"}",
            );
        }
        let registry = AgentRegistry::default_catalog();
        let sink = CollectorSink::new();
        let reports = vec![
            report("scout", 0.9, json!({ "top_job_id": "a" })),
            report("match", 0.4, json!({ "top_job_id": "b" })),
        ];

        let outcome = negotiator(provider)
            .run("pick the best role", &reports, &registry, &sink)
            .await;
        assert!(outcome.consensus);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.position["top_job_id"], "a");
        assert!(outcome.dissents.is_empty());
        assert_eq!(sink.kinds(), vec!["negotiation_round", "negotiation_result"]);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_dissent_verbatim() {
        let provider = Arc::new(ScriptedProvider::new());
        // Three rounds, two participants, nobody moves.
        for _ in 0..6 {
            provider.push_structured("not even json");
        }
        let registry = AgentRegistry::default_catalog();
        let sink = CollectorSink::new();
        let reports = vec![
            report("scout", 0.9, json!({ "top_job_id": "a" })),
            report("match", 0.6, json!({ "top_job_id": "b" })),
        ];

        let outcome = negotiator(provider)
            .run("pick the best role", &reports, &registry, &sink)
            .await;
        assert!(!outcome.consensus);
        assert_eq!(outcome.rounds, 3);
        assert_eq!(outcome.position["top_job_id"], "a");
        assert_eq!(outcome.dissents, vec![json!({ "top_job_id": "b" })]);
        let kinds = sink.kinds();
        assert_eq!(
            kinds,
            vec![
                "negotiation_round",
                "negotiation_round",
                "negotiation_round",
                "negotiation_result"
            ]
        );
    }

    #[tokio::test]
    async fn test_low_mean_confidence_blocks_consensus() {
        let provider = Arc::new(ScriptedProvider::new());
        // Positions align immediately but confidence stays low.
        for _ in 0..6 {
            provider.push_structured(
                "{\"stance\": \"maintain\", \"position\": {\"top_job_id\": \"a\"}, \
                 \"confidence\": 0.3, \"rationale\": \"unsure\"}",
            );
        }
        let registry = AgentRegistry::default_catalog();
        let sink = CollectorSink::new();
        let reports = vec![
            report("scout", 0.3, json!({ "top_job_id": "a" })),
            report("match", 0.3, json!({ "top_job_id": "a" })),
        ];

        let outcome = negotiator(provider)
            .run("pick the best role", &reports, &registry, &sink)
            .await;
        assert!(!outcome.consensus);
        assert_eq!(outcome.rounds, 3);
        // Aligned positions do not count as dissent.
        assert!(outcome.dissents.is_empty());
    }
}
