
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PolicyConfig;
use crate::ensemble::{ClaimInput, EnsembleScorer, EnsembleVerdict};
use crate::inference::InferenceClient;
use crate::store::{RetrievedChunk, VectorStoreCoordinator};
use crate::{EngineError, Result};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);
const DEFAULT_CONTEXT_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Retrieving,
    Scoring,
    Composing,
    Decided,
    Failed,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RequestPhase::Received => write!(f, "received"),
            RequestPhase::Retrieving => write!(f, "retrieving"),
            RequestPhase::Scoring => write!(f, "scoring"),
            RequestPhase::Composing => write!(f, "composing"),
            RequestPhase::Decided => write!(f, "decided"),
            RequestPhase::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub claim: ClaimInput,
    pub coverage_amount: Option<f64>,
    #[serde(default)]
    pub context_limit: Option<usize>,
    #[serde(default)]
    pub deadline_seconds: Option<u64>,
}

impl DecisionRequest {
    pub fn new(claim: ClaimInput) -> Self {
        Self {
            claim,
            coverage_amount: None,
            context_limit: None,
            deadline_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Approve,
    Reject,
    Review,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            VerdictKind::Approve => write!(f, "APPROVE"),
            VerdictKind::Reject => write!(f, "REJECT"),
            VerdictKind::Review => write!(f, "MANUAL_REVIEW"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleSource {
    Generated,
    RuleBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Premium {
    pub base_rate: f64,
    pub multiplier: f64,
    pub annual: f64,
    pub monthly: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Issue,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub checks: Vec<ComplianceCheck>,
    pub compliant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: VerdictKind,
    pub risk_score: f64,
    pub confidence: f64,
    pub premium: Option<Premium>,
    pub rationale: String,
    pub rationale_source: RationaleSource,
    pub compliance: ComplianceReport,
    pub recommendations: Vec<String>,
    pub ensemble: EnsembleVerdict,
    pub supporting_chunks: Vec<String>,
}

/// Composes retrieval context, the ensemble verdict and one generation
/// call into an underwriting decision.
///
/// Partial failures degrade: lost retrieval context or a failed generation
/// call still yields a decision. The request fails only when retrieval and
/// scoring are both unavailable.
pub struct DecisionEngine {
    coordinator: Arc<VectorStoreCoordinator>,
    client: InferenceClient,
    scorer: EnsembleScorer,
    policy: PolicyConfig,
}

impl DecisionEngine {
    pub fn new(
        coordinator: Arc<VectorStoreCoordinator>,
        client: InferenceClient,
        scorer: EnsembleScorer,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            coordinator,
            client,
            scorer,
            policy,
        }
    }

    pub async fn decide(&self, request: DecisionRequest) -> Result<Decision> {
        let started = Instant::now();
        let deadline = request
            .deadline_seconds
            .map_or(DEFAULT_DEADLINE, Duration::from_secs);
        let context_limit = request.context_limit.unwrap_or(DEFAULT_CONTEXT_LIMIT);

        debug!(phase = %RequestPhase::Received, "assessing claim");

        debug!(phase = %RequestPhase::Retrieving, "retrieving policy context");
        let context = match self
            .retrieve_context(&request.claim, context_limit, remaining(started, deadline))
            .await
        {
            Ok(chunks) => Some(chunks),
            Err(error) => {
                warn!("retrieval unavailable, continuing without context: {}", error);
                None
            }
        };

        debug!(phase = %RequestPhase::Scoring, "running ensemble signals");
        let verdict = self
            .scorer
            .score(&request.claim, remaining(started, deadline))
            .await;

        if context.is_none() && verdict.is_empty() {
            warn!(phase = %RequestPhase::Failed, "retrieval and scoring both unavailable");
            return Err(EngineError::DecisionFailed(
                "retrieval and scoring are both unavailable".to_string(),
            ));
        }

        let risk_score = risk_score(&request.claim, &verdict);
        let (kind, band_confidence) = self.classify(risk_score, &verdict);
        let confidence = band_confidence.min(verdict.confidence.max(0.5));

        let premium = if kind == VerdictKind::Reject {
            None
        } else {
            Some(premium(
                &self.policy,
                request.claim.policy_type.as_deref(),
                request.coverage_amount.unwrap_or(self.policy.default_coverage),
                risk_score,
            ))
        };

        let compliance = compliance(&request.claim);
        let recommendations = recommendations(&request.claim, &verdict, risk_score);

        debug!(phase = %RequestPhase::Composing, "composing rationale");
        let context_ref = context.as_deref().unwrap_or(&[]);
        let (rationale, rationale_source) = self
            .compose_rationale(&request.claim, kind, risk_score, &verdict, context_ref, remaining(started, deadline))
            .await;

        info!(
            phase = %RequestPhase::Decided,
            verdict = %kind,
            risk_score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "claim assessed"
        );

        Ok(Decision {
            verdict: kind,
            risk_score,
            confidence,
            premium,
            rationale,
            rationale_source,
            compliance,
            recommendations,
            ensemble: verdict,
            supporting_chunks: context_ref.iter().map(RetrievedChunk::chunk_id).collect(),
        })
    }

    async fn retrieve_context(
        &self,
        claim: &ClaimInput,
        limit: usize,
        deadline: Duration,
    ) -> Result<Vec<RetrievedChunk>> {
        let client = self.client.clone().with_timeout(deadline.max(Duration::from_millis(1)));
        let narrative = claim.narrative.clone();

        let embedding = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || client.embed(&narrative)),
        )
        .await
        .map_err(|_| {
            EngineError::Inference(crate::inference::InferenceError::new(
                crate::inference::InferenceErrorKind::Timeout,
                "embedding exceeded the request deadline",
            ))
        })?
        .map_err(|e| EngineError::Other(e.into()))??;

        self.coordinator.search(&embedding, limit).await
    }

    fn classify(&self, risk_score: f64, verdict: &EnsembleVerdict) -> (VerdictKind, f64) {
        if verdict.flagged {
            return (VerdictKind::Reject, 0.90);
        }
        if risk_score <= self.policy.auto_approve_threshold {
            (VerdictKind::Approve, 0.95)
        } else if risk_score >= self.policy.auto_reject_threshold {
            (VerdictKind::Reject, 0.90)
        } else if risk_score >= self.policy.review_min && risk_score <= self.policy.review_max {
            (VerdictKind::Review, 0.70)
        } else {
            (VerdictKind::Approve, 0.80)
        }
    }

    async fn compose_rationale(
        &self,
        claim: &ClaimInput,
        kind: VerdictKind,
        risk_score: f64,
        verdict: &EnsembleVerdict,
        context: &[RetrievedChunk],
        deadline: Duration,
    ) -> (String, RationaleSource) {
        let prompt = build_rationale_prompt(claim, kind, risk_score, verdict, context);
        let client = self.client.clone().with_timeout(deadline.max(Duration::from_millis(1)));

        let generated = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || client.generate(&prompt)),
        )
        .await;

        match generated {
            Ok(Ok(Ok(text))) if !text.trim().is_empty() => (text, RationaleSource::Generated),
            Ok(Ok(Err(error))) => {
                warn!("generation unavailable, using rule-based rationale: {}", error);
                (rule_based_rationale(kind, risk_score, verdict), RationaleSource::RuleBased)
            }
            Ok(Err(join_error)) => {
                warn!("generation task failed: {}", join_error);
                (rule_based_rationale(kind, risk_score, verdict), RationaleSource::RuleBased)
            }
            _ => {
                warn!("generation exceeded the request deadline");
                (rule_based_rationale(kind, risk_score, verdict), RationaleSource::RuleBased)
            }
        }
    }
}

/// Rule-based risk score on the 0-100 scale: applicant factors plus the
/// ensemble's fraud contribution.
pub fn risk_score(claim: &ClaimInput, verdict: &EnsembleVerdict) -> f64 {
    let mut score = 50.0;
    let applicant = &claim.applicant;

    let mut health_penalty = 0.0;
    if let Some(age) = applicant.age {
        if !(25..=55).contains(&age) {
            health_penalty += ((age as f64 - 40.0).abs() * 0.3).min(15.0);
        }
    }
    if let Some(occupation) = &applicant.occupation {
        if is_high_risk_occupation(occupation) {
            health_penalty += 10.0;
        }
    }
    if applicant.smoker == Some(true) {
        health_penalty *= 2.0;
    }
    score += health_penalty;

    if let Some(previous) = applicant.previous_claims {
        score += (previous as f64 * 5.0).min(20.0);
    }

    if let Some(credit) = applicant.credit_score {
        if credit < 600 {
            score += 15.0;
        } else if credit > 750 {
            score -= 5.0;
        }
    }

    if let Some(location) = &applicant.location {
        let lowered = location.to_lowercase();
        if ["coastal", "flood", "seismic", "wildfire"]
            .iter()
            .any(|keyword| lowered.contains(keyword))
        {
            score += 5.0;
        }
    }

    if verdict.combined_score > 0.5 {
        score += verdict.combined_score * 30.0;
    }

    score.clamp(0.0, 100.0)
}

fn is_high_risk_occupation(occupation: &str) -> bool {
    let lowered = occupation.to_lowercase();
    ["construction", "mining", "logging"]
        .iter()
        .any(|risky| lowered.contains(risky))
}

/// Premium from the configured per-policy-type base rates.
pub fn premium(
    policy: &PolicyConfig,
    policy_type: Option<&str>,
    coverage: f64,
    risk_score: f64,
) -> Premium {
    let base_rate = policy_type
        .and_then(|kind| policy.base_rates.get(&kind.to_lowercase()).copied())
        .unwrap_or(policy.fallback_base_rate);

    let multiplier = 1.0 + risk_score / 100.0;
    let annual = coverage / 100_000.0 * base_rate * multiplier;

    Premium {
        base_rate,
        multiplier,
        annual,
        monthly: annual / 12.0,
    }
}

/// Regulatory checks over the applicant profile. Checks that lack the data
/// they need are reported as skipped, never as passed.
pub fn compliance(claim: &ClaimInput) -> ComplianceReport {
    let applicant = &claim.applicant;
    let mut checks = Vec::new();

    match applicant.age {
        Some(age) if age < 18 => checks.push(ComplianceCheck {
            name: "minimum_age".to_string(),
            status: CheckStatus::Issue,
            detail: format!("applicant is {} years old, under the minimum of 18", age),
        }),
        Some(_) => checks.push(ComplianceCheck {
            name: "minimum_age".to_string(),
            status: CheckStatus::Passed,
            detail: "applicant meets the minimum age".to_string(),
        }),
        None => checks.push(ComplianceCheck {
            name: "minimum_age".to_string(),
            status: CheckStatus::Skipped,
            detail: "age not provided".to_string(),
        }),
    }

    let is_life = claim
        .policy_type
        .as_deref()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("life"));
    match (applicant.age, is_life) {
        (Some(age), true) if age > 80 => checks.push(ComplianceCheck {
            name: "life_age_limit".to_string(),
            status: CheckStatus::Warning,
            detail: format!("life policy for an {}-year-old requires senior underwriting", age),
        }),
        (Some(_), true) => checks.push(ComplianceCheck {
            name: "life_age_limit".to_string(),
            status: CheckStatus::Passed,
            detail: "applicant within life policy age limits".to_string(),
        }),
        (None, true) => checks.push(ComplianceCheck {
            name: "life_age_limit".to_string(),
            status: CheckStatus::Skipped,
            detail: "age not provided".to_string(),
        }),
        (_, false) => {}
    }

    let missing: Vec<&str> = [
        ("age", applicant.age.is_none()),
        ("occupation", applicant.occupation.is_none()),
        ("location", applicant.location.is_none()),
    ]
    .iter()
    .filter_map(|(field, absent)| absent.then_some(*field))
    .collect();

    if missing.is_empty() {
        checks.push(ComplianceCheck {
            name: "demographics".to_string(),
            status: CheckStatus::Passed,
            detail: "demographic profile complete".to_string(),
        });
    } else {
        checks.push(ComplianceCheck {
            name: "demographics".to_string(),
            status: CheckStatus::Warning,
            detail: format!("incomplete demographics: {}", missing.join(", ")),
        });
    }

    let compliant = !checks
        .iter()
        .any(|check| check.status == CheckStatus::Issue);

    ComplianceReport { checks, compliant }
}

/// Short actionable follow-ups derived from the profile and verdict.
pub fn recommendations(
    claim: &ClaimInput,
    verdict: &EnsembleVerdict,
    risk_score: f64,
) -> Vec<String> {
    let mut items = Vec::new();
    let applicant = &claim.applicant;

    if verdict.flagged {
        items.push("Route to the special investigations unit before any payout".to_string());
    }
    if applicant.smoker == Some(true) {
        items.push("Offer a smoking-cessation program discount at next renewal".to_string());
    }
    if applicant.credit_score.is_some_and(|credit| credit < 600) {
        items.push("Re-quote after six months of improved payment history".to_string());
    }
    if applicant.previous_claims.is_some_and(|claims| claims >= 2) {
        items.push("Recommend a loss-prevention consultation".to_string());
    }
    if risk_score > 60.0 && !verdict.flagged {
        items.push("Request supporting documentation before binding coverage".to_string());
    }

    items
}

fn build_rationale_prompt(
    claim: &ClaimInput,
    kind: VerdictKind,
    risk_score: f64,
    verdict: &EnsembleVerdict,
    context: &[RetrievedChunk],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are an insurance underwriting assistant. Write a concise rationale for the \
         decision below, citing the policy excerpts where relevant.\n\n",
    );
    prompt.push_str(&format!("Decision: {}\nRisk score: {:.1}\n", kind, risk_score));
    prompt.push_str(&format!(
        "Fraud ensemble: combined {:.2}, confidence {:.2}, flagged {}\n",
        verdict.combined_score, verdict.confidence, verdict.flagged
    ));

    for signal in &verdict.signals {
        prompt.push_str(&format!(
            "- {} ({:.2}): {}\n",
            signal.name, signal.score, signal.rationale
        ));
    }

    if !context.is_empty() {
        prompt.push_str("\nPolicy excerpts:\n");
        for chunk in context {
            prompt.push_str(&format!("[{}] {}\n", chunk.chunk_id(), chunk.content));
        }
    }

    prompt.push_str(&format!("\nClaim narrative:\n{}\n", claim.narrative));
    prompt
}

fn rule_based_rationale(kind: VerdictKind, risk_score: f64, verdict: &EnsembleVerdict) -> String {
    let mut rationale = format!(
        "Decision {} at risk score {:.1} (fraud ensemble {:.2}, confidence {:.2}).",
        kind, risk_score, verdict.combined_score, verdict.confidence
    );

    let notable: Vec<String> = verdict
        .signals
        .iter()
        .filter(|signal| signal.score > 0.0)
        .map(|signal| format!("{}: {}", signal.name, signal.rationale))
        .collect();

    if !notable.is_empty() {
        rationale.push_str(" Contributing signals: ");
        rationale.push_str(&notable.join("; "));
        rationale.push('.');
    }

    if !verdict.failed_signals.is_empty() {
        rationale.push_str(&format!(
            " Signals unavailable: {}.",
            verdict.failed_signals.join(", ")
        ));
    }

    rationale
}

fn remaining(started: Instant, deadline: Duration) -> Duration {
    deadline.saturating_sub(started.elapsed())
}
