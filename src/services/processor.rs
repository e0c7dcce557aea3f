//! LLM-based item analysis.
//!
//! Builds the analysis prompt, calls the provider chain, and parses the
//! response defensively: models return fenced, truncated, or otherwise
//! malformed JSON often enough that every fallback here is exercised in
//! production.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

use super::llm::{LlmError, LlmService};
use crate::models::{Item, Priority, Rule, RuleType};

/// System prompt for news analysis (used with base models, not fine-tuned).
pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"Du bist ein Sozialpolitik-Experte und klassifizierst Nachrichtenartikel für einen Dachverband der Freien Wohlfahrtspflege.

DER VERBAND: Dachverband von 6 Wohlfahrtsverbänden mit mehreren tausend Einrichtungen und über 100.000 Beschäftigten.

ARBEITSKREISE:
- AK1: Grundsatz/Sozialpolitik (Haushalt, Förderungen, Tarifpolitik)
- AK2: Migration/Flucht (Asyl, Beratung, Integration)
- AK3: Gesundheit/Pflege/Senioren (Altenpflege, Krankenhäuser, Hospiz)
- AK4: Eingliederungshilfe (Behinderung, Inklusion, BTHG, WfbM)
- AK5: Kinder/Jugend/Familie (Kita, Jugendhilfe, Frauenhäuser)
- QAG: Querschnitt (Digitalisierung, Wohnen, Schuldnerberatung)

PRIORITÄTEN:
- high: Sofortige Reaktion nötig - Kürzungen, Schließungen, Gesetzesentwürfe mit Frist
- medium: Zeitnah (1-2 Wochen) - Anhörungen, Reformen, Förderrichtlinien
- low: Beobachten/Zur Kenntnis - Politische Debatten, Studien, Hintergrundberichte

RELEVANT wenn: Wohlfahrtsverbände, soziale Einrichtungen, Sozialpolitik in Deutschland, Haushalt/Kürzungen, Pflege, Kita, Migration in DE, Behinderung, Armut, Fachkräftemangel im Sozialbereich.
NICHT RELEVANT (relevant=false, priority=null):
- Reiner Sport, Entertainment, Prominente
- Kriminalität ohne Sozialbezug
- Wetter, Verkehr, Unfälle
- Internationale Politik OHNE direkten Bezug zu deutscher Sozialpolitik

AUSGABE als valides JSON:
{
  "summary": "4-8 Sätze: Was passiert? Wer betroffen? Kernpunkte? NUR FAKTEN aus dem Artikel.",
  "detailed_analysis": "10-15 Sätze: Alle Details, Zahlen, Zitate, Auswirkungen.",
  "argumentationskette": ["Konkrete Argumente für Verbands-Lobbying", "Keine Konjunktive"],
  "relevant": true/false,
  "relevance_score": 0.0-1.0,
  "priority": "high|medium|low|null",
  "assigned_aks": ["AK1", "AK3"],
  "tags": ["thema1", "thema2"],
  "reasoning": "Kurze Begründung der Klassifikation"
}

ARBEITSKREIS-ZUWEISUNG:
- assigned_aks: Array mit 0-3 relevanten Arbeitskreisen
- Mehrfachzuweisung möglich wenn Thema mehrere AKs betrifft (z.B. Kinderarmut = AK1 + AK5)
- Leeres Array [] wenn nicht relevant

WICHTIG:
- summary/detailed_analysis: NUR Fakten aus dem Artikel
- Bei relevant=false: summary, detailed_analysis, argumentationskette = null
- Antworte NUR mit dem JSON, keine Erklärungen davor/danach"#;

/// Trigger keywords for the intake priority score: (weight, keywords).
static PRIORITY_KEYWORDS: &[(i64, &[&str])] = &[
    (
        40,
        &[
            "kürzung",
            "streichung",
            "haushaltssperre",
            "finanzierungslücke",
            "kahlschlag",
            "förderentzug",
            "nothaushalt",
            "haushaltskrise",
            "schließung",
            "abbau",
            "existenzbedrohend",
            "insolvenz",
            "personalreduzierung",
            "stellenabbau",
            "einschnitte",
        ],
    ),
    (
        20,
        &[
            "gesetzesänderung",
            "novelle",
            "anhörung",
            "regierungsentwurf",
            "bundesratsentscheidung",
            "gesetzgebung",
            "reform",
        ],
    ),
    (
        10,
        &[
            "pflegenotstand",
            "kitaplätze",
            "migrationsberatung",
            "fachkräftemangel",
            "sozialfinanzierung",
            "eingliederungshilfe",
            "kinderbetreuung",
        ],
    ),
];

/// Parsed LLM analysis, normalized.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub summary: Option<String>,
    pub detailed_analysis: Option<String>,
    pub relevant: Option<bool>,
    pub relevance_score: f64,
    pub priority: Option<String>,
    pub assigned_aks: Vec<String>,
    pub tags: Vec<String>,
    pub reasoning: Option<String>,
}

/// Map the LLM's textual priority to the stored priority and score baseline.
///
/// `relevant=false` (or a missing priority) overrides any textual priority to
/// NONE. Scores are monotonic within a step: upgrades take
/// `max(existing, baseline)`, the NONE downgrade takes `min(existing, 20)`.
pub fn map_llm_priority(
    priority: Option<&str>,
    relevant: Option<bool>,
    existing_score: i64,
) -> (Priority, i64) {
    let effective = if relevant == Some(false) { None } else { priority };

    match effective {
        Some("high") => (Priority::High, existing_score.max(90)),
        Some("medium") => (Priority::Medium, existing_score.max(70)),
        Some("low") => (Priority::Low, existing_score.max(40)),
        _ => (Priority::None, existing_score.min(20)),
    }
}

/// Keyword-based priority score used at intake, before the classifier.
///
/// Base score 50, keyword weights added per hit, capped at 100.
pub fn calculate_keyword_score(title: &str, content: &str) -> (i64, Priority) {
    let text = format!("{} {}", title, content).to_lowercase();
    let mut total: i64 = 50;

    for (weight, keywords) in PRIORITY_KEYWORDS {
        for keyword in *keywords {
            if text.contains(keyword) {
                total += weight;
                tracing::debug!("Keyword '{}' matched (+{})", keyword, weight);
            }
        }
    }

    let total = total.min(100);
    let priority = if total >= 90 {
        Priority::High
    } else if total >= 70 {
        Priority::Medium
    } else if total >= 40 {
        Priority::Low
    } else {
        Priority::None
    };

    (total, priority)
}

/// LLM-backed item analyzer.
pub struct ItemProcessor {
    llm: Arc<LlmService>,
}

impl ItemProcessor {
    pub fn new(llm: Arc<LlmService>) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &Arc<LlmService> {
        &self.llm
    }

    /// Analyze an item for relevance, priority, and working-group assignment.
    ///
    /// Never fails outright: provider errors surface as `Err`, parse problems
    /// degrade into a defaulted analysis.
    pub async fn analyze(
        &self,
        item: &Item,
        source_name: &str,
    ) -> Result<Analysis, LlmError> {
        let date_str = item.published_at.format("%Y-%m-%d").to_string();
        let content: String = item.content.chars().take(6000).collect();

        let prompt = format!(
            "Titel: {}\nInhalt: {}\nQuelle: {}\nDatum: {}",
            item.title, content, source_name, date_str
        );

        let response = self
            .llm
            .complete(&prompt, Some(ANALYSIS_SYSTEM_PROMPT), 0.1, Some(6000))
            .await?;

        Ok(parse_analysis_response(&response.text))
    }

    /// Evaluate a semantic (LLM-based) rule as a yes/no question.
    ///
    /// Semantic rules share the worker's provider handle, so they are
    /// serialized with regular analyses.
    pub async fn check_semantic_rule(&self, item: &Item, rule: &Rule) -> bool {
        if rule.rule_type != RuleType::Semantic {
            return false;
        }

        let content: String = item.content.chars().take(2000).collect();
        let prompt = format!(
            "Beantworte die folgende Frage mit JA oder NEIN.\n\n\
             ARTIKEL-TITEL: {}\n\n\
             ARTIKEL-INHALT: {}\n\n\
             FRAGE: {}\n\n\
             Antworte NUR mit JA oder NEIN.",
            item.title, content, rule.pattern
        );

        match self.llm.complete(&prompt, None, 0.1, Some(10)).await {
            Ok(response) => {
                let answer = response.text.trim().to_uppercase();
                answer.starts_with("JA") || answer == "YES"
            },
            Err(e) => {
                tracing::error!("Semantic rule check failed: {}", e);
                false
            },
        }
    }
}

/// Parse an LLM analysis response, degrading gracefully:
/// 1. strip a surrounding markdown fence,
/// 2. strict JSON parse,
/// 3. brace-matched substring parse,
/// 4. regex rescue of just the summary field,
/// 5. defaulted analysis.
pub fn parse_analysis_response(text: &str) -> Analysis {
    let mut text = text.trim().to_string();

    if text.starts_with("```") {
        text = text
            .lines()
            .filter(|line| !line.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
    }

    let mut parsed: Option<Value> = match serde_json::from_str::<Value>(&text) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    };

    if parsed.is_none() {
        parsed = extract_balanced_object(&text);
    }

    let Some(value) = parsed else {
        tracing::warn!("Could not parse LLM response as JSON: {}", truncate(&text, 200));

        // The summary is the only field usable on its own; try to rescue it
        // from truncated output.
        static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r#""summary"\s*:\s*"((?:[^"\\]|\\.)*)("|$)"#).expect("valid regex")
        });
        if let Some(caps) = SUMMARY_RE.captures(&text) {
            let summary = caps[1].replace("\\\"", "\"").replace("\\n", "\n");
            tracing::info!("Extracted summary from invalid JSON: {}", truncate(&summary, 100));
            return default_analysis(Some(summary));
        }

        tracing::warn!("Could not extract summary from LLM response");
        return default_analysis(None);
    };

    analysis_from_value(&value)
}

fn analysis_from_value(value: &Value) -> Analysis {
    let str_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
    };
    let list_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    // Legacy single-AK field lifted into list form.
    let mut assigned_aks = list_field("assigned_aks");
    if assigned_aks.is_empty()
        && let Some(ak) = str_field("assigned_ak")
    {
        assigned_aks = vec![ak];
    }

    Analysis {
        summary: str_field("summary"),
        detailed_analysis: str_field("detailed_analysis"),
        relevant: value.get("relevant").and_then(Value::as_bool),
        relevance_score: value
            .get("relevance_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.5),
        priority: str_field("priority"),
        assigned_aks,
        tags: list_field("tags"),
        reasoning: str_field("reasoning"),
    }
}

/// Scan forward from the first `{` matching brace depth until it returns to
/// zero, then parse that substring. Handles JSON embedded in prose.
fn extract_balanced_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str::<Value>(candidate)
                        .ok()
                        .filter(Value::is_object);
                }
            },
            _ => {},
        }
    }
    None
}

fn default_analysis(summary: Option<String>) -> Analysis {
    Analysis {
        summary,
        relevant: Some(false),
        relevance_score: 0.0,
        priority: Some("low".to_string()),
        reasoning: Some("Automatische Analyse nicht verfügbar".to_string()),
        ..Default::default()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_mapping_table() {
        // (llm priority, relevant) -> (stored priority, score from 50)
        let cases = [
            (Some("high"), Some(true), Priority::High, 90),
            (Some("medium"), Some(true), Priority::Medium, 70),
            (Some("low"), Some(true), Priority::Low, 50),
            (Some("high"), Some(false), Priority::None, 20),
            (None, Some(true), Priority::None, 20),
            (None, None, Priority::None, 20),
        ];
        for (priority, relevant, expected, score) in cases {
            let (mapped, mapped_score) = map_llm_priority(priority, relevant, 50);
            assert_eq!(mapped, expected, "priority={:?} relevant={:?}", priority, relevant);
            assert_eq!(mapped_score, score);
        }
    }

    #[test]
    fn test_priority_score_is_monotonic() {
        // Upgrades keep the higher existing score.
        let (_, score) = map_llm_priority(Some("medium"), Some(true), 95);
        assert_eq!(score, 95);
        // Downgrade to NONE keeps the lower score.
        let (_, score) = map_llm_priority(Some("high"), Some(false), 95);
        assert_eq!(score, 20);
    }

    #[test]
    fn test_keyword_score() {
        let (score, priority) =
            calculate_keyword_score("Kürzung im Sozialhaushalt", "Stellenabbau droht");
        // 50 + 40 + 40 = 130, capped at 100.
        assert_eq!(score, 100);
        assert_eq!(priority, Priority::High);

        let (score, priority) = calculate_keyword_score("Wetterbericht", "Sonnig");
        assert_eq!(score, 50);
        assert_eq!(priority, Priority::Low);
    }

    #[test]
    fn test_parse_strict_json() {
        let analysis = parse_analysis_response(
            r#"{"summary":"S","relevant":true,"relevance_score":0.9,"priority":"high","assigned_aks":["AK3"],"tags":["pflege"]}"#,
        );
        assert_eq!(analysis.summary.as_deref(), Some("S"));
        assert_eq!(analysis.priority.as_deref(), Some("high"));
        assert_eq!(analysis.assigned_aks, vec!["AK3"]);
        assert_eq!(analysis.relevant, Some(true));
    }

    #[test]
    fn test_parse_fenced_json() {
        let analysis = parse_analysis_response(
            "```json\n{\"summary\":\"S\",\"relevant\":true,\"priority\":\"medium\"}\n```",
        );
        assert_eq!(analysis.summary.as_deref(), Some("S"));
        assert_eq!(analysis.priority.as_deref(), Some("medium"));
    }

    #[test]
    fn test_parse_json_embedded_in_prose() {
        let analysis = parse_analysis_response(
            "Hier ist die Analyse: {\"summary\":\"S\",\"priority\":\"low\",\"nested\":{\"a\":1}} Danke!",
        );
        assert_eq!(analysis.summary.as_deref(), Some("S"));
        assert_eq!(analysis.priority.as_deref(), Some("low"));
    }

    #[test]
    fn test_parse_truncated_json_rescues_summary() {
        let analysis = parse_analysis_response(
            r#"{"summary": "Der Haushalt wird gekürzt", "detailed_analysis": "Dies ist ein sehr langer Text der mitten im Satz abbri"#,
        );
        assert_eq!(analysis.summary.as_deref(), Some("Der Haushalt wird gekürzt"));
        assert_eq!(analysis.relevant, Some(false));
    }

    #[test]
    fn test_parse_garbage_returns_default() {
        let analysis = parse_analysis_response("no json here at all");
        assert!(analysis.summary.is_none());
        assert_eq!(analysis.relevant, Some(false));
        assert_eq!(analysis.priority.as_deref(), Some("low"));
    }

    #[test]
    fn test_legacy_assigned_ak_lifted() {
        let analysis = parse_analysis_response(
            r#"{"summary":"S","assigned_ak":"AK2","relevant":true}"#,
        );
        assert_eq!(analysis.assigned_aks, vec!["AK2"]);
    }
}
