//! Batched fact classification
//!
//! Surviving facts are classified in a single call against the existing
//! memories that were semantically close to any of them. The provider sees
//! numbered lists and answers with numbers, so a hallucinated id can never
//! reach the store.

use serde::Deserialize;

use crate::llm::{CompletionRequest, LlmClient, ParseOutcome};
use crate::memory::MemoryEntry;

pub(crate) const CLASSIFY_OPERATION: &str = "classify_facts";

const CLASSIFY_SYSTEM: &str = "You compare new facts about a user with facts already stored. \
For each new fact answer NEW (unrelated), EXTENDS (adds detail to a stored fact) or UPDATES \
(replaces a stored fact that is no longer true). Reply with a JSON array of objects \
{\"fact\": <new fact number>, \"action\": \"NEW\"|\"EXTENDS\"|\"UPDATES\", \"target\": <stored fact number or null>}.";

/// Verdict for one new fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    #[default]
    New,
    Extends,
    Updates,
}

#[derive(Debug, Clone, Deserialize)]
struct RawVerdict {
    fact: usize,
    #[serde(default)]
    action: Verdict,
    #[serde(default)]
    target: Option<usize>,
}

/// Classification of one fact, with the existing memory it points at
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    /// Index into the `existing` slice given to [`classify`]
    pub target: Option<usize>,
}

impl Classification {
    pub fn new_fact() -> Self {
        Self {
            verdict: Verdict::New,
            target: None,
        }
    }
}

fn build_prompt(facts: &[String], existing: &[MemoryEntry]) -> String {
    let mut prompt = String::from("Stored facts:\n");
    for (i, memory) in existing.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, memory.content));
    }
    prompt.push_str("\nNew facts:\n");
    for (i, fact) in facts.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, fact));
    }
    prompt
}

/// Map raw verdicts onto facts. Unknown fact numbers are ignored, a verdict
/// with a missing or out-of-range target degrades to NEW.
fn resolve(raw: Vec<RawVerdict>, fact_count: usize, existing_count: usize) -> Vec<Classification> {
    let mut out = vec![Classification::new_fact(); fact_count];
    for v in raw {
        let Some(slot) = v.fact.checked_sub(1).filter(|i| *i < fact_count) else {
            continue;
        };
        let target = v
            .target
            .and_then(|t| t.checked_sub(1))
            .filter(|t| *t < existing_count);
        out[slot] = match (v.action, target) {
            (Verdict::New, _) | (_, None) => Classification::new_fact(),
            (verdict, Some(t)) => Classification {
                verdict,
                target: Some(t),
            },
        };
    }
    out
}

/// Classify `facts` against `existing`. Never fails: provider errors and
/// unusable output classify everything as NEW.
pub async fn classify(
    llm: &LlmClient,
    user_id: &str,
    facts: &[String],
    existing: &[MemoryEntry],
) -> Vec<Classification> {
    if facts.is_empty() {
        return Vec::new();
    }
    if existing.is_empty() {
        return vec![Classification::new_fact(); facts.len()];
    }

    let request = CompletionRequest::new(CLASSIFY_OPERATION, CLASSIFY_SYSTEM, build_prompt(facts, existing))
        .with_max_tokens(1024);

    match llm.complete_json::<Vec<RawVerdict>>(user_id, request).await {
        Ok(ParseOutcome::Parsed(raw)) => resolve(raw, facts.len(), existing.len()),
        Ok(ParseOutcome::Empty) => vec![Classification::new_fact(); facts.len()],
        Ok(ParseOutcome::Malformed(_)) => {
            tracing::warn!(user_id, facts = facts.len(), "Unusable classifier output, storing facts as new");
            vec![Classification::new_fact(); facts.len()]
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Classifier call failed, storing facts as new");
            vec![Classification::new_fact(); facts.len()]
        }
    }
}
