//! Prompt templates and parsing of model output.
//!
//! Models wrap JSON in prose or code fences, so parsing scans for the
//! outermost `{...}` (or `[...]`) span instead of expecting clean output.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

pub const ENTITY_EXTRACTION: &str = r#"-Goal-
Given a text document, identify all entities in the text and all relationships among the identified entities.

-Steps-
1. Identify every entity. For each entity, extract:
- name: name of the entity, capitalized as in the text
- type: one of [PERSON, ORGANIZATION, LOCATION, EVENT, CONCEPT, TECHNOLOGY, PRODUCT, OTHER]
- description: one sentence on the entity's attributes and activities
2. Among the entities from step 1, identify every pair (source, target) that is clearly related. For each pair, extract:
- source: name of the source entity
- target: name of the target entity
- relation: an UPPER_SNAKE_CASE verb phrase, e.g. LOCATED_IN, BUILT_FOR, WORKS_AT
- description: why the two entities are related
3. Answer with a single JSON object and nothing else:
{"entities":[{"name":"","type":"","description":""}],"relationships":[{"source":"","target":"","relation":"","description":""}]}

-Text-
{input_text}
"#;

pub const QUERY_ENTITIES: &str = r#"-Role-
You extract the entity names a search query is about.

-Instructions-
List the specific named entities and key concepts in the query, capitalized as they would appear in a document.
Answer with a JSON array of strings and nothing else, e.g. ["Paris", "France"].

-Query-
{query}
"#;

pub const RAG_ANSWER: &str = r#"-Role-
You are a helpful assistant answering questions from the provided context.

-Instructions-
Answer the question using only the numbered context entries below. If the context does not contain the answer, say you do not know.

-Context-
{context}

-Question-
{query}
"#;

/// Returned by `Query` when retrieval yields nothing.
pub const NO_RELEVANT_INFORMATION: &str = "No relevant information found.";

/// Substitute `{name}` placeholders in one left-to-right pass, so inserted
/// values are never scanned for placeholders themselves.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let placeholder = values.iter().find(|(name, _)| {
            tail[1..].starts_with(name) && tail[1 + name.len()..].starts_with('}')
        });
        match placeholder {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 2..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn entity_extraction_prompt(text: &str) -> String {
    fill(ENTITY_EXTRACTION, &[("input_text", text)])
}

pub fn query_entities_prompt(query: &str) -> String {
    fill(QUERY_ENTITIES, &[("query", query)])
}

pub fn rag_answer_prompt(context: &str, query: &str) -> String {
    fill(RAG_ANSWER, &[("context", context), ("query", query)])
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default, rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

/// Slice between the first `open` and the last `close`, inclusive.
fn span(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| &raw[start..=end])
}

/// Decode the JSON value embedded in `raw`, trying the object span first and
/// the array span second.
pub fn parse_embedded_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let mut last_error = None;
    for candidate in [span(raw, '{', '}'), span(raw, '[', ']')]
        .into_iter()
        .flatten()
    {
        match serde_json::from_str(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }
    Err(RagError::Parse(match last_error {
        Some(e) => format!("no decodable JSON in model output: {e}"),
        None => "no JSON found in model output".to_string(),
    }))
}

/// Parse an entity/relationship extraction answer.
///
/// A bare array is accepted as an entity list.
pub fn parse_extraction(raw: &str) -> Result<Extraction> {
    if let Some(object) = span(raw, '{', '}') {
        if let Ok(extraction) = serde_json::from_str::<Extraction>(object) {
            return Ok(extraction);
        }
    }
    if let Some(array) = span(raw, '[', ']') {
        if let Ok(entities) = serde_json::from_str::<Vec<ExtractedEntity>>(array) {
            return Ok(Extraction {
                entities,
                relationships: Vec::new(),
            });
        }
    }
    Err(RagError::Parse(
        "extraction output is not an entities/relationships object".to_string(),
    ))
}

/// Parse the query-entity answer into trimmed, de-duplicated names.
///
/// Accepts `["a", "b"]` or an object holding such an array under
/// `entities` or `keywords`.
pub fn parse_query_entities(raw: &str) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Answer {
        List(Vec<String>),
        Keyed {
            #[serde(alias = "keywords")]
            entities: Vec<String>,
        },
    }

    let names = match span(raw, '[', ']').map(serde_json::from_str::<Vec<String>>) {
        Some(Ok(list)) => list,
        _ => match parse_embedded_json::<Answer>(raw)? {
            Answer::List(list) => list,
            Answer::Keyed { entities } => entities,
        },
    };

    let mut seen = std::collections::HashSet::new();
    Ok(names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.to_lowercase()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_embed_inputs() {
        let p = entity_extraction_prompt("RxDB is a database.");
        assert!(p.contains("RxDB is a database."));
        assert!(!p.contains("{input_text}"));

        let p = rag_answer_prompt("[1] ctx", "why?");
        assert!(p.contains("[1] ctx") && p.contains("why?"));
    }

    #[test]
    fn test_placeholders_inside_values_stay_literal() {
        let p = rag_answer_prompt("[1] a template mentioning {query}", "what is {context}?");
        assert!(p.contains("[1] a template mentioning {query}\n"));
        assert!(p.contains("what is {context}?"));
        assert_eq!(p.matches("what is").count(), 1);

        // JSON braces in the extraction template survive untouched.
        assert_eq!(
            fill(r#"{"a": {x}} {y"#, &[("x", "1")]),
            r#"{"a": 1} {y"#
        );
    }

    #[test]
    fn test_parse_extraction_tolerates_surrounding_text() {
        let raw = r#"Sure! Here is the result:
```json
{"entities":[{"name":"RxDB","type":"TECHNOLOGY","description":"A database"}],
 "relationships":[{"source":"RxDB","target":"JavaScript","relation":"BUILT_FOR"}]}
```
Hope that helps."#;
        let parsed = parse_extraction(raw).unwrap();
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].entity_type, "TECHNOLOGY");
        assert_eq!(parsed.relationships[0].relation, "BUILT_FOR");
        assert_eq!(parsed.relationships[0].description, "");
    }

    #[test]
    fn test_parse_extraction_accepts_bare_entity_array() {
        let parsed = parse_extraction(r#"[{"name":"Paris"}]"#).unwrap();
        assert_eq!(parsed.entities[0].name, "Paris");
        assert!(parsed.relationships.is_empty());
    }

    #[test]
    fn test_parse_extraction_rejects_garbage() {
        assert!(matches!(
            parse_extraction("I could not find anything"),
            Err(RagError::Parse(_))
        ));
        assert!(parse_extraction("{not json}").is_err());
    }

    #[test]
    fn test_parse_query_entities_variants() {
        assert_eq!(
            parse_query_entities(r#"Entities: ["France", " Paris ", "france"]"#).unwrap(),
            vec!["France", "Paris"]
        );
        assert_eq!(
            parse_query_entities(r#"{"keywords": ["Berlin"]}"#).unwrap(),
            vec!["Berlin"]
        );
        assert!(parse_query_entities("nothing useful").is_err());
    }
}
