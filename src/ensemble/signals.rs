use anyhow::Result;
use async_trait::async_trait;
use fancy_regex::Regex;
use tracing::debug;

use crate::ensemble::ClaimInput;
use crate::inference::InferenceClient;

#[derive(Debug, Clone, PartialEq)]
pub struct SignalScore {
    pub score: f64,
    pub rationale: String,
}

impl SignalScore {
    pub fn new(score: f64, rationale: impl Into<String>) -> Self {
        Self {
            score,
            rationale: rationale.into(),
        }
    }
}

/// A side-effect-free fraud signal. Producers run concurrently and must not
/// mutate shared state.
#[async_trait]
pub trait SignalProducer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, input: &ClaimInput) -> Result<SignalScore>;
}

/// Hard matches score above the pattern signal's configured ceiling so a
/// single match flags the claim regardless of the weighted mean.
const HARD_MATCH_SCORE: f64 = 0.85;

struct FraudPattern {
    regex: Regex,
    label: &'static str,
    contribution: f64,
    hard: bool,
}

/// Regex heuristics over the claim narrative.
pub struct PatternSignal {
    patterns: Vec<FraudPattern>,
    date_regex: Regex,
}

impl PatternSignal {
    pub fn new() -> crate::Result<Self> {
        let definitions: [(&str, &str, f64, bool); 6] = [
            (
                r"(?i)\b(fake|forged|counterfeit|fabricated)\b",
                "explicit forgery language",
                HARD_MATCH_SCORE,
                true,
            ),
            (
                r"(?i)\b(urgent|urgently|immediately|asap)\b[^.!?]*\bclaim",
                "urgency pressure around the claim",
                0.15,
                false,
            ),
            (
                r"(?i)\b(another|second|third|fourth)\s+claim\b",
                "repeated claims phrasing",
                0.1,
                false,
            ),
            (r"\$\d{4,}", "large cash amount quoted", 0.15, false),
            (
                r"(?i)\bpre-?existing\b",
                "pre-existing damage mentioned",
                0.1,
                false,
            ),
            (
                r"(?i)\bwitness(?:es)?\b[^.!?]*\b(unavailable|left|gone|moved|no longer)\b",
                "witnesses reported unavailable",
                0.1,
                false,
            ),
        ];

        let mut patterns = Vec::with_capacity(definitions.len());
        for (pattern, label, contribution, hard) in definitions {
            patterns.push(FraudPattern {
                regex: Regex::new(pattern)
                    .map_err(|e| crate::EngineError::Config(format!("bad pattern: {}", e)))?,
                label,
                contribution,
                hard,
            });
        }

        let date_regex = Regex::new(r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b")
            .map_err(|e| crate::EngineError::Config(format!("bad pattern: {}", e)))?;

        Ok(Self {
            patterns,
            date_regex,
        })
    }

    fn narrative_heuristics(narrative: &str, findings: &mut Vec<String>) -> f64 {
        let mut score = 0.0;

        let word_count = narrative.split_whitespace().count();
        if word_count > 0 && word_count < 20 {
            score += 0.1;
            findings.push(format!("unusually brief narrative ({} words)", word_count));
        }

        let exclamations = narrative.matches('!').count();
        if exclamations > 3 {
            score += 0.05;
            findings.push(format!("{} exclamation marks", exclamations));
        }

        score
    }
}

#[async_trait]
impl SignalProducer for PatternSignal {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn evaluate(&self, input: &ClaimInput) -> Result<SignalScore> {
        let narrative = &input.narrative;
        let mut findings = Vec::new();
        let mut score = 0.0_f64;
        let mut hard_hit = false;

        for pattern in &self.patterns {
            if pattern.regex.is_match(narrative)? {
                findings.push(pattern.label.to_string());
                if pattern.hard {
                    hard_hit = true;
                } else {
                    score += pattern.contribution;
                }
            }
        }

        score += Self::narrative_heuristics(narrative, &mut findings);

        let mut date_count = 0;
        for found in self.date_regex.find_iter(narrative) {
            found?;
            date_count += 1;
        }
        if date_count > 5 {
            score += 0.1;
            findings.push(format!("{} distinct dates cited", date_count));
        }

        if hard_hit {
            score = score.max(HARD_MATCH_SCORE);
        }

        let rationale = if findings.is_empty() {
            "no fraud phrasing detected".to_string()
        } else {
            findings.join("; ")
        };

        debug!("pattern signal: {:.3} ({})", score, rationale);
        Ok(SignalScore::new(score.min(1.0), rationale))
    }
}

/// Statistical outliers in the structured claim and applicant data.
pub struct OutlierSignal;

#[async_trait]
impl SignalProducer for OutlierSignal {
    fn name(&self) -> &'static str {
        "outlier"
    }

    async fn evaluate(&self, input: &ClaimInput) -> Result<SignalScore> {
        let mut findings = Vec::new();
        let mut score = 0.0_f64;

        if let Some(amount) = input.claim_amount {
            if amount > 100_000.0 {
                score += 0.3;
                findings.push(format!("claim amount ${:.0} far above typical", amount));
            } else if amount > 50_000.0 {
                score += 0.15;
                findings.push(format!("claim amount ${:.0} above typical", amount));
            }
        }

        if let Some(previous) = input.applicant.previous_claims {
            if previous >= 3 {
                score += 0.15;
                findings.push(format!("{} previous claims on file", previous));
            }
        }

        let words: Vec<&str> = input.narrative.split_whitespace().collect();
        if !words.is_empty() {
            let mean_len =
                words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / words.len() as f64;
            if mean_len > 10.0 {
                score += 0.1;
                findings.push("atypical vocabulary density".to_string());
            }
        }

        if let Some(age) = input.applicant.age {
            if !(18..=90).contains(&age) {
                score += 0.1;
                findings.push(format!("applicant age {} outside expected range", age));
            }
        }

        if let Some(credit) = input.applicant.credit_score {
            if credit < 500 {
                score += 0.1;
                findings.push(format!("credit score {} in distressed band", credit));
            }
        }

        let rationale = if findings.is_empty() {
            "no statistical outliers".to_string()
        } else {
            findings.join("; ")
        };

        Ok(SignalScore::new(score.min(1.0), rationale))
    }
}

/// Fraud classifier call against the inference gateway. The blocking HTTP
/// client runs on the blocking pool so a timed-out evaluation abandons the
/// call instead of stalling the scorer.
pub struct ClassifierSignal {
    client: InferenceClient,
    model: String,
}

impl ClassifierSignal {
    pub fn new(client: InferenceClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl SignalProducer for ClassifierSignal {
    fn name(&self) -> &'static str {
        "classifier"
    }

    async fn evaluate(&self, input: &ClaimInput) -> Result<SignalScore> {
        let client = self.client.clone();
        let model = self.model.clone();
        let narrative = input.narrative.clone();

        let classification =
            tokio::task::spawn_blocking(move || client.classify(&model, &narrative)).await??;

        let score = if classification.label.to_lowercase().contains("fraud") {
            classification.score
        } else {
            1.0 - classification.score
        };

        Ok(SignalScore::new(
            score,
            format!(
                "model labeled '{}' at {:.2}",
                classification.label, classification.score
            ),
        ))
    }
}

/// Extreme sentiment polarity reads as emotional manipulation and
/// contributes a small score; neutral narratives contribute nothing.
pub struct SentimentSignal {
    client: InferenceClient,
    model: String,
}

impl SentimentSignal {
    pub fn new(client: InferenceClient, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl SignalProducer for SentimentSignal {
    fn name(&self) -> &'static str {
        "sentiment"
    }

    async fn evaluate(&self, input: &ClaimInput) -> Result<SignalScore> {
        let client = self.client.clone();
        let model = self.model.clone();
        let narrative = input.narrative.clone();

        let classification =
            tokio::task::spawn_blocking(move || client.classify(&model, &narrative)).await??;

        let polarity = classification.score.clamp(0.0, 1.0);
        let score = if polarity > 0.75 {
            (polarity - 0.75) / 0.25 * 0.3
        } else {
            0.0
        };

        Ok(SignalScore::new(
            score,
            format!(
                "sentiment '{}' at polarity {:.2}",
                classification.label, polarity
            ),
        ))
    }
}
