//! Stage 2: generate search-engine queries from intent fields.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::IntentFields;

use super::CompletionRequest;

const SYSTEM_PROMPT: &str = "You are a literature-search specialist. Given structured \
research intent fields, produce search queries. Respond with a single JSON object with \
keys: booleanQuery (string), expandedKeywords (string array), engineQueries (object with \
keys arxiv and semanticScholar, both strings). Respond with JSON only, no prose.";

/// Queries produced by stage 2 and persisted on the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub boolean_query: String,
    pub expanded_keywords: Vec<String>,
    pub engine_queries: EngineQueries,
}

/// Per-engine query strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineQueries {
    pub arxiv: String,
    pub semantic_scholar: String,
}

pub struct QueryStage;

impl QueryStage {
    pub fn build_request(fields: &IntentFields) -> CompletionRequest {
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: format!(
                "Problem: {}\nMethodologies: {}\nApplication domains: {}\nConstraints: {}\n\
                 Contribution types: {}\nSeed keywords: {}",
                fields.problem,
                fields.methodologies.join(", "),
                fields.application_domains.join(", "),
                fields.constraints.join(", "),
                fields.contribution_types.join(", "),
                fields.keywords_seed.join(", "),
            ),
        }
    }

    pub fn parse_output(content: &str) -> Result<QueryOutput> {
        let output: QueryOutput = serde_json::from_str(content).map_err(|e| {
            CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Query generation produced malformed output",
                format!("query parse error: {}", e),
            )
        })?;
        if output.boolean_query.trim().is_empty() {
            return Err(CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Query generation produced malformed output",
                "query output missing boolean query",
            ));
        }
        Ok(output)
    }
}
