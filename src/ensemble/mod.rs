
pub mod signals;

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EnsembleConfig;
use crate::ensemble::signals::{
    ClassifierSignal, OutlierSignal, PatternSignal, SentimentSignal, SignalProducer,
};
use crate::inference::InferenceClient;

/// Structured applicant data accompanying a claim. Every field is optional;
/// signals score what is present and compliance reports what is not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicantProfile {
    pub age: Option<u32>,
    pub occupation: Option<String>,
    pub smoker: Option<bool>,
    pub previous_claims: Option<u32>,
    pub credit_score: Option<u32>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimInput {
    pub narrative: String,
    pub claim_amount: Option<f64>,
    pub policy_type: Option<String>,
    #[serde(default)]
    pub applicant: ApplicantProfile,
}

/// One signal's contribution to the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalResult {
    pub name: String,
    pub score: f64,
    pub weight: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleVerdict {
    pub combined_score: f64,
    pub confidence: f64,
    pub flagged: bool,
    pub signals: Vec<SignalResult>,
    pub failed_signals: Vec<String>,
}

impl EnsembleVerdict {
    /// True when no signal produced a score at all.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// Weighted ensemble over independent fraud signals.
///
/// Signals run concurrently, each under its own timeout. A failed or
/// timed-out signal is excluded from both the numerator and the denominator
/// of the weighted mean rather than being defaulted to zero, and the
/// exclusion is reflected in the verdict's confidence.
pub struct EnsembleScorer {
    producers: Vec<Box<dyn SignalProducer>>,
    config: EnsembleConfig,
}

impl EnsembleScorer {
    pub fn new(config: EnsembleConfig, client: InferenceClient) -> crate::Result<Self> {
        let classify_model = client.classify_model().to_string();
        let sentiment_model = client.sentiment_model().to_string();

        let producers: Vec<Box<dyn SignalProducer>> = vec![
            Box::new(PatternSignal::new()?),
            Box::new(OutlierSignal),
            Box::new(ClassifierSignal::new(client.clone(), classify_model)),
            Box::new(SentimentSignal::new(client, sentiment_model)),
        ];

        Ok(Self { producers, config })
    }

    /// Construct with an explicit producer set.
    pub fn with_producers(config: EnsembleConfig, producers: Vec<Box<dyn SignalProducer>>) -> Self {
        Self { producers, config }
    }

    /// Score a claim. `deadline` bounds each signal individually; the
    /// configured per-signal timeout applies when it is tighter.
    pub async fn score(&self, input: &ClaimInput, deadline: Duration) -> EnsembleVerdict {
        let per_signal = deadline.min(Duration::from_secs(self.config.signal_timeout_seconds));

        let evaluations = join_all(self.producers.iter().map(|producer| {
            let name = producer.name();
            async move {
                let outcome = tokio::time::timeout(per_signal, producer.evaluate(input)).await;
                (name, outcome)
            }
        }))
        .await;

        let mut signals = Vec::new();
        let mut failed_signals = Vec::new();

        for (name, outcome) in evaluations {
            let Some(settings) = self.config.settings_for(name) else {
                warn!("signal '{}' has no configuration, skipping", name);
                failed_signals.push(name.to_string());
                continue;
            };

            match outcome {
                Ok(Ok(score)) => {
                    debug!("signal '{}' scored {:.3}", name, score.score);
                    signals.push(SignalResult {
                        name: name.to_string(),
                        score: score.score.clamp(0.0, 1.0),
                        weight: settings.weight,
                        rationale: score.rationale,
                    });
                }
                Ok(Err(error)) => {
                    warn!("signal '{}' failed: {}", name, error);
                    failed_signals.push(name.to_string());
                }
                Err(_) => {
                    warn!("signal '{}' timed out after {:?}", name, per_signal);
                    failed_signals.push(name.to_string());
                }
            }
        }

        signals.sort_by(|a, b| a.name.cmp(&b.name));
        failed_signals.sort();

        let combined_score = combine(&signals);
        let confidence = confidence(&signals, self.producers.len());
        let flagged = self.is_flagged(combined_score, &signals);

        EnsembleVerdict {
            combined_score,
            confidence,
            flagged,
            signals,
            failed_signals,
        }
    }

    fn is_flagged(&self, combined_score: f64, signals: &[SignalResult]) -> bool {
        if combined_score >= self.config.flag_threshold {
            return true;
        }
        signals.iter().any(|signal| {
            self.config
                .settings_for(&signal.name)
                .is_some_and(|settings| signal.score >= settings.hard_ceiling)
        })
    }
}

/// Weighted mean over the signals that produced a score.
fn combine(signals: &[SignalResult]) -> f64 {
    let total_weight: f64 = signals.iter().map(|s| s.weight).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    signals.iter().map(|s| s.weight * s.score).sum::<f64>() / total_weight
}

/// Agreement-based confidence, discounted by signal coverage. Fewer than
/// two contributing signals cannot express agreement and pin confidence at
/// 0.5.
fn confidence(signals: &[SignalResult], producer_count: usize) -> f64 {
    if signals.len() < 2 {
        return 0.5;
    }

    let n = signals.len() as f64;
    let mean = signals.iter().map(|s| s.score).sum::<f64>() / n;
    let variance = signals
        .iter()
        .map(|s| (s.score - mean).powi(2))
        .sum::<f64>()
        / n;

    let agreement = 1.0 - (variance * 2.0).min(0.5);
    let coverage = if producer_count == 0 {
        1.0
    } else {
        signals.len() as f64 / producer_count as f64
    };

    agreement * coverage
}
