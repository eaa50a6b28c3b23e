//! Fact extraction from caregiver conversations.

use std::sync::Arc;

use async_trait::async_trait;
use homecare_common::{
    CandidateFact, FactExtractor, HomecareError, MemoryCategory, Metadata, Priority, Result,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::{ChatMessage, LlmClient, LlmRequest};

pub(crate) const EXTRACTION_PROMPT: &str = r#"You are a medical memory extraction assistant for at-home care.
Extract patient information from the conversation into structured memories.

Guidelines:
- ALLERGIES and MEDICATIONS are CRITICAL priority
- Medical conditions are HIGH priority
- Preferences and observations are NORMAL priority
- Extract clear, factual statements only
- Include relevant metadata (dosage, frequency, dates)
- Avoid duplicates or vague statements
- If a statement corrects or replaces an earlier fact, set "supersedes": true in its metadata

Respond with a single JSON object of the form:
{"memories": [{"category": "medical_history|allergy|medication|preference|observation|appointment",
               "priority": "critical|high|normal",
               "content": "clear, concise fact (1-2000 characters)",
               "metadata": {}}]}
Return {"memories": []} when there is nothing worth remembering."#;

#[derive(Debug, Deserialize)]
struct ExtractionEnvelope {
    #[serde(default)]
    memories: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    category: String,
    #[serde(default)]
    priority: Option<String>,
    content: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

/// Extractor backed by a chat-completion model running in JSON mode.
pub struct LlmFactExtractor {
    client: Arc<dyn LlmClient>,
    temperature: f32,
    max_tokens: u32,
}

impl LlmFactExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            temperature: 0.0,
            max_tokens: 2000,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

/// Number utterances so the model can refer to them.
pub(crate) fn format_conversation(conversation: &[String]) -> String {
    conversation
        .iter()
        .enumerate()
        .map(|(i, msg)| format!("Message {}: {}", i + 1, msg))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a model reply into candidate facts.
///
/// Tolerates prose or code fences around the JSON object. Entries with an
/// unknown category or missing content are skipped; a reply with no JSON
/// object at all is an extraction failure.
pub(crate) fn parse_candidates(reply: &str) -> Result<Vec<CandidateFact>> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &reply[s..=e],
        _ => {
            return Err(HomecareError::Extraction(
                "Model reply contains no JSON object".to_string(),
            ))
        }
    };

    let envelope: ExtractionEnvelope = serde_json::from_str(json)
        .map_err(|e| HomecareError::Extraction(format!("Malformed extraction reply: {e}")))?;

    let mut candidates = Vec::with_capacity(envelope.memories.len());
    for (index, value) in envelope.memories.into_iter().enumerate() {
        let raw: RawFact = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(index, error = %e, "Skipping malformed extracted fact");
                continue;
            }
        };
        let category: MemoryCategory = match raw.category.parse() {
            Ok(c) => c,
            Err(e) => {
                warn!(index, error = %e, "Skipping extracted fact with unknown category");
                continue;
            }
        };

        let mut candidate = CandidateFact::new(category, raw.content);
        if let Some(priority) = raw.priority.and_then(|p| p.parse::<Priority>().ok()) {
            candidate = candidate.with_priority(priority);
        }
        if let Some(metadata) = raw.metadata {
            candidate.metadata = metadata;
        }
        candidates.push(candidate);
    }
    Ok(candidates)
}

#[async_trait]
impl FactExtractor for LlmFactExtractor {
    async fn extract(&self, patient_id: &str, conversation: &[String]) -> Result<Vec<CandidateFact>> {
        if conversation.is_empty() {
            return Ok(Vec::new());
        }

        let request = LlmRequest {
            system_prompt: Some(EXTRACTION_PROMPT.to_string()),
            messages: vec![ChatMessage::user(format_conversation(conversation))],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            json_mode: true,
        };

        let response = self.client.complete(request).await?;
        debug!(
            patient_id,
            model = %response.model,
            finish_reason = ?response.finish_reason,
            "Extraction reply received"
        );

        let candidates = parse_candidates(&response.content)?;
        info!(
            patient_id,
            utterances = conversation.len(),
            candidates = candidates.len(),
            "Extracted candidate facts"
        );
        Ok(candidates)
    }

    fn name(&self) -> &str {
        self.client.model_name()
    }
}

/// Offline extractor that classifies each utterance by keyword.
///
/// Used when no model is configured and in tests. Every non-blank utterance
/// becomes one candidate with its category's default priority.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordExtractor;

impl KeywordExtractor {
    pub fn classify(utterance: &str) -> MemoryCategory {
        let lower = utterance.to_lowercase();

        if lower.contains("allerg") || lower.contains("anaphyla") || lower.contains("reaction to")
        {
            return MemoryCategory::Allergy;
        }

        if mentions_dose(&lower)
            || lower.contains("medication")
            || lower.contains("dose")
            || lower.contains("dosage")
            || lower.contains("prescri")
            || lower.contains("tablet")
            || lower.contains("pill")
        {
            return MemoryCategory::Medication;
        }

        if lower.contains("appointment")
            || lower.contains("visit")
            || lower.contains("check-up")
            || lower.contains("scheduled")
        {
            return MemoryCategory::Appointment;
        }

        if lower.contains("diagnos")
            || lower.contains("history of")
            || lower.contains("condition")
            || lower.contains("surgery")
            || lower.contains("diabetes")
        {
            return MemoryCategory::MedicalHistory;
        }

        if lower.contains("prefer")
            || lower.contains("likes")
            || lower.contains("dislikes")
            || lower.contains("enjoys")
            || lower.contains("favorite")
        {
            return MemoryCategory::Preference;
        }

        MemoryCategory::Observation
    }
}

/// A quantity in milligrams or micrograms, as in "10mg", "2.5 mg" or "50mcg".
fn mentions_dose(lower: &str) -> bool {
    let mut after_number = false;
    for token in lower
        .split(|c: char| !(c.is_alphanumeric() || c == '.'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
    {
        let unit = token.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.');
        let has_number = unit.len() < token.len();
        if matches!(unit, "mg" | "mcg") && (has_number || after_number) {
            return true;
        }
        after_number = unit.is_empty();
    }
    false
}

#[async_trait]
impl FactExtractor for KeywordExtractor {
    async fn extract(&self, patient_id: &str, conversation: &[String]) -> Result<Vec<CandidateFact>> {
        let candidates: Vec<CandidateFact> = conversation
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| CandidateFact::new(Self::classify(u), u))
            .collect();
        debug!(patient_id, candidates = candidates.len(), "Keyword extraction");
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmResponse;
    use parking_lot::Mutex;

    struct CannedClient {
        reply: String,
        last_request: Mutex<Option<LlmRequest>>,
    }

    impl CannedClient {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
            *self.last_request.lock() = Some(request);
            Ok(LlmResponse {
                content: self.reply.clone(),
                model: "canned".to_string(),
                usage: None,
                finish_reason: Some("stop".to_string()),
            })
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    struct FailingClient;

    #[async_trait]
    impl LlmClient for FailingClient {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
            Err(HomecareError::Extraction("upstream 500".to_string()))
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn extracts_facts_from_model_reply() {
        let client = CannedClient::new(
            r#"{"memories": [
                {"category": "allergy", "priority": "critical",
                 "content": "Patient is allergic to penicillin", "metadata": {"severity": "high"}},
                {"category": "preference", "priority": "normal",
                 "content": "Patient prefers morning medication", "metadata": {}}
            ]}"#,
        );
        let extractor = LlmFactExtractor::new(client.clone());

        let conversation = vec![
            "Patient mentioned they are allergic to penicillin".to_string(),
            "They prefer taking medication in the morning".to_string(),
        ];
        let facts = extractor.extract("P1", &conversation).await.unwrap();

        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].category, MemoryCategory::Allergy);
        assert_eq!(facts[0].priority, Some(Priority::Critical));
        assert_eq!(facts[0].metadata["severity"], "high");
        assert_eq!(facts[1].category, MemoryCategory::Preference);

        let request = client.last_request.lock().clone().unwrap();
        assert!(request.json_mode);
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.max_tokens, Some(2000));
        assert!(request.messages[0].content.starts_with("Message 1: Patient mentioned"));
        assert!(request.messages[0].content.contains("\nMessage 2: They prefer"));
    }

    #[tokio::test]
    async fn empty_reply_yields_no_candidates() {
        let extractor = LlmFactExtractor::new(CannedClient::new(r#"{"memories": []}"#));
        let facts = extractor
            .extract("P1", &["Nothing much happened".to_string()])
            .await
            .unwrap();
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn empty_conversation_skips_model_call() {
        let client = CannedClient::new("not json");
        let extractor = LlmFactExtractor::new(client.clone());
        assert!(extractor.extract("P1", &[]).await.unwrap().is_empty());
        assert!(client.last_request.lock().is_none());
    }

    #[tokio::test]
    async fn client_failure_is_extraction_failure() {
        let extractor = LlmFactExtractor::new(Arc::new(FailingClient));
        let err = extractor
            .extract("P1", &["Takes aspirin".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, HomecareError::Extraction(_)));
    }

    #[test]
    fn parse_tolerates_code_fences() {
        let reply = "```json\n{\"memories\": [{\"category\": \"medication\", \"content\": \"Takes 10mg lisinopril\"}]}\n```";
        let facts = parse_candidates(reply).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, MemoryCategory::Medication);
        assert_eq!(facts[0].priority, None);
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let reply = r#"{"memories": [
            {"category": "surgery", "content": "Knee replacement"},
            {"category": "observation"},
            {"category": "observation", "priority": "urgent", "content": "Ate well today"}
        ]}"#;
        let facts = parse_candidates(reply).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "Ate well today");
        // unknown priority falls back to the category default
        assert_eq!(facts[0].priority, None);
    }

    #[test]
    fn parse_rejects_reply_without_json() {
        assert!(matches!(
            parse_candidates("I could not find anything."),
            Err(HomecareError::Extraction(_))
        ));
        assert!(matches!(
            parse_candidates("{\"memories\": ["),
            Err(HomecareError::Extraction(_))
        ));
    }

    #[test]
    fn keyword_classification() {
        assert_eq!(
            KeywordExtractor::classify("Allergic to penicillin"),
            MemoryCategory::Allergy
        );
        assert_eq!(
            KeywordExtractor::classify("Takes 10mg lisinopril daily"),
            MemoryCategory::Medication
        );
        assert_eq!(
            KeywordExtractor::classify("Takes 2.5 mg of warfarin"),
            MemoryCategory::Medication
        );
        assert_eq!(
            KeywordExtractor::classify("Had imaging done on her knee"),
            MemoryCategory::Observation
        );
        assert_eq!(
            KeywordExtractor::classify("Mentioned her grandson among other things"),
            MemoryCategory::Observation
        );
        assert_eq!(
            KeywordExtractor::classify("Cardiology appointment next Tuesday"),
            MemoryCategory::Appointment
        );
        assert_eq!(
            KeywordExtractor::classify("Diagnosed with type 2 diabetes"),
            MemoryCategory::MedicalHistory
        );
        assert_eq!(
            KeywordExtractor::classify("Prefers tea over coffee"),
            MemoryCategory::Preference
        );
        assert_eq!(
            KeywordExtractor::classify("Seemed tired this afternoon"),
            MemoryCategory::Observation
        );
    }

    #[tokio::test]
    async fn keyword_extractor_one_candidate_per_utterance() {
        let conversation = vec![
            "Allergic to latex".to_string(),
            "   ".to_string(),
            "Likes gardening".to_string(),
        ];
        let facts = KeywordExtractor.extract("P1", &conversation).await.unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].resolved_priority(), Priority::Critical);
        assert_eq!(facts[1].category, MemoryCategory::Preference);
    }
}
