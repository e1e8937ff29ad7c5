//! Paper scoring: rate one candidate paper against the user's research idea.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};

use super::CompletionRequest;

const SYSTEM_PROMPT: &str = "You are a literature-review assistant. Compare the user's \
research abstract with a candidate paper's abstract. Respond with a single JSON object \
with keys: semanticSimilarity (number 0..1), problemOverlap, methodOverlap, domainOverlap, \
constraintOverlap (each one of \"none\", \"low\", \"medium\", \"high\"), c1Score (number \
0..10), c1Justification (string), c2Score (number 0..10), c2Justification (string), \
researchGaps (string array), userNovelty (string). Respond with JSON only, no prose.";

/// How strongly two papers overlap on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapLevel {
    None,
    Low,
    Medium,
    High,
}

/// Validated score for one candidate paper.
///
/// C1 rates the paper as a direct competitor, C2 as supporting work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperScore {
    pub semantic_similarity: f64,
    pub problem_overlap: OverlapLevel,
    pub method_overlap: OverlapLevel,
    pub domain_overlap: OverlapLevel,
    pub constraint_overlap: OverlapLevel,
    pub c1_score: f64,
    pub c1_justification: String,
    pub c2_score: f64,
    pub c2_justification: String,
    pub research_gaps: Vec<String>,
    pub user_novelty: String,
}

pub struct ScoringStage;

impl ScoringStage {
    pub fn build_request(
        user_abstract: &str,
        candidate_title: &str,
        candidate_abstract: &str,
    ) -> CompletionRequest {
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: format!(
                "User's research abstract:\n{}\n\nCandidate paper: {}\n\nCandidate abstract:\n{}",
                user_abstract, candidate_title, candidate_abstract,
            ),
        }
    }

    pub fn parse_output(content: &str) -> Result<PaperScore> {
        let score: PaperScore = serde_json::from_str(content).map_err(|e| {
            CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Paper scoring produced malformed output",
                format!("score parse error: {}", e),
            )
        })?;
        score.validate()?;
        Ok(score)
    }
}

impl PaperScore {
    /// Reject out-of-range scores instead of clamping them.
    pub fn validate(&self) -> Result<()> {
        let in_range = (0.0..=1.0).contains(&self.semantic_similarity)
            && (0.0..=10.0).contains(&self.c1_score)
            && (0.0..=10.0).contains(&self.c2_score);
        if !in_range {
            return Err(CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Paper scoring produced malformed output",
                format!(
                    "score out of range: similarity={} c1={} c2={}",
                    self.semantic_similarity, self.c1_score, self.c2_score
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_json() -> String {
        r#"{
            "semanticSimilarity": 0.74,
            "problemOverlap": "high",
            "methodOverlap": "medium",
            "domainOverlap": "high",
            "constraintOverlap": "low",
            "c1Score": 7.5,
            "c1Justification": "same problem, different method",
            "c2Score": 4.0,
            "c2Justification": "useful baseline",
            "researchGaps": ["no latency evaluation"],
            "userNovelty": "adds streaming updates"
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_valid_score() {
        let score = ScoringStage::parse_output(&valid_json()).unwrap();
        assert_eq!(score.problem_overlap, OverlapLevel::High);
        assert!((score.c1_score - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_out_of_range_score_is_rejected() {
        let content = valid_json().replace("\"c1Score\": 7.5", "\"c1Score\": 11.0");
        let err = ScoringStage::parse_output(&content).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StageExecutionError);
    }

    #[test]
    fn test_unknown_overlap_level_is_rejected() {
        let content = valid_json().replace("\"high\"", "\"extreme\"");
        let err = ScoringStage::parse_output(&content).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StageExecutionError);
    }
}
