//! Stage 1: decompose a research abstract into structured intent fields.

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::IntentFields;

use super::CompletionRequest;

const SYSTEM_PROMPT: &str = "You are a research analyst. Decompose the user's research \
abstract into structured fields. Respond with a single JSON object with keys: problem \
(string), methodologies (string array), applicationDomains (string array), constraints \
(string array), contributionTypes (string array), keywordsSeed (string array). \
Respond with JSON only, no prose.";

pub struct IntentStage;

impl IntentStage {
    pub fn build_request(abstract_text: &str) -> CompletionRequest {
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: format!("Research abstract:\n\n{}", abstract_text),
        }
    }

    /// Parse and validate the model output.
    pub fn parse_output(content: &str) -> Result<IntentFields> {
        let fields: IntentFields = serde_json::from_str(content).map_err(|e| {
            CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Intent decomposition produced malformed output",
                format!("intent parse error: {}", e),
            )
        })?;
        if fields.problem.trim().is_empty() {
            return Err(CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Intent decomposition produced malformed output",
                "intent output missing problem statement",
            ));
        }
        Ok(fields)
    }
}
