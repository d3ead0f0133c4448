use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// ConsensusPolicy
// ---------------------------------------------------------------------------

/// Pluggable pairwise-agreement score for the multi-agent analyze phase.
///
/// The pipeline stops its analysis rounds early when every pair of drafts
/// scores at or above the configured threshold. The scoring function is a
/// seam: swap the implementation without touching the pipeline.
pub trait ConsensusPolicy: Send + Sync {
    /// Agreement between two drafts in `[0.0, 1.0]`.
    fn agreement(&self, a: &str, b: &str) -> f64;
}

/// Whether the drafts of one round agree: the minimum pairwise score must
/// reach the threshold. Fewer than two drafts trivially agree.
pub fn consensus_reached(policy: &dyn ConsensusPolicy, drafts: &[String], threshold: f64) -> bool {
    if drafts.len() < 2 {
        return true;
    }
    for (i, a) in drafts.iter().enumerate() {
        for b in drafts.iter().skip(i + 1) {
            if policy.agreement(a, b) < threshold {
                return false;
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// JaccardConsensus
// ---------------------------------------------------------------------------

/// Default policy: Jaccard similarity over lowercase word sets.
#[derive(Debug, Clone, Default)]
pub struct JaccardConsensus;

impl JaccardConsensus {
    fn words(text: &str) -> BTreeSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    }
}

impl ConsensusPolicy for JaccardConsensus {
    fn agreement(&self, a: &str, b: &str) -> f64 {
        let wa = Self::words(a);
        let wb = Self::words(b);
        if wa.is_empty() && wb.is_empty() {
            return 1.0;
        }
        let intersection = wa.intersection(&wb).count() as f64;
        let union = wa.union(&wb).count() as f64;
        intersection / union
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
