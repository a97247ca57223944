//! Built-in document analysis tools.

use std::path::Path;

use serde_json::{Value, json};

use crate::model::ToolSpec;
use crate::tools::{RegistryError, Tool, ToolError, ToolRegistry};

const LOWER_ORDER: &[&str] = &["remember", "understand"];
const HIGHER_ORDER: &[&str] = &["apply", "analyze", "evaluate", "create"];
const TOP_TOPICS: usize = 5;

/// A registry holding every built-in tool.
pub fn registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(AnalyzeStatistics)?;
    registry.register(ReadDocument)?;
    registry.register(CompareDocuments)?;
    Ok(registry)
}

/// Frequency statistics over tagged questions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeStatistics;

impl Tool for AnalyzeStatistics {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "analyze_statistics".into(),
            description: "Compute topic and Bloom's taxonomy frequency statistics for a list of \
                          tagged questions."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "topic": {"type": "string"},
                                "bloom_level": {"type": "string"}
                            }
                        }
                    }
                },
                "required": ["questions"]
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "total_questions": {"type": "integer"},
                    "topic_distribution": {"type": "object"},
                    "bloom_distribution": {"type": "object"},
                    "top_topics": {"type": "array"},
                    "cognitive_complexity": {"type": "object"}
                }
            }),
        }
    }

    fn call(&self, input: Value) -> Result<Value, ToolError> {
        let questions = input["questions"]
            .as_array()
            .ok_or_else(|| ToolError::InvalidInput("'questions' must be an array".into()))?;

        let mut topics = Tally::default();
        let mut blooms = Tally::default();
        for question in questions {
            let field = |key: &str| question.get(key).and_then(Value::as_str).unwrap_or("Unknown");
            topics.add(field("topic"));
            blooms.add(field("bloom_level"));
        }

        let level_sum = |levels: &[&str]| -> usize {
            blooms
                .counts
                .iter()
                .filter(|(level, _)| levels.contains(&level.to_lowercase().as_str()))
                .map(|(_, count)| count)
                .sum()
        };

        Ok(json!({
            "total_questions": questions.len(),
            "topic_distribution": topics.to_map(),
            "bloom_distribution": blooms.to_map(),
            "top_topics": topics
                .most_common(TOP_TOPICS)
                .into_iter()
                .map(|(topic, count)| json!([topic, count]))
                .collect::<Vec<_>>(),
            "cognitive_complexity": {
                "lower_order": level_sum(LOWER_ORDER),
                "higher_order": level_sum(HIGHER_ORDER),
            },
        }))
    }
}

/// Counts in first-seen order.
#[derive(Debug, Default)]
struct Tally {
    counts: Vec<(String, usize)>,
}

impl Tally {
    fn add(&mut self, key: &str) {
        match self.counts.iter_mut().find(|(k, _)| k == key) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((key.to_string(), 1)),
        }
    }

    fn to_map(&self) -> serde_json::Map<String, Value> {
        self.counts
            .iter()
            .map(|(k, c)| (k.clone(), json!(c)))
            .collect()
    }

    /// Highest counts first; ties keep first-seen order.
    fn most_common(&self, n: usize) -> Vec<(String, usize)> {
        let mut sorted = self.counts.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted.truncate(n);
        sorted
    }
}

/// Extracted text of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentText {
    pub filename: String,
    pub content: String,
    pub page_count: usize,
}

/// Read a document as text. PDFs go through `pdf-extract`; anything else is read as UTF-8.
pub fn extract_text(path: &Path) -> Result<DocumentText, ToolError> {
    if !path.exists() {
        return Err(ToolError::Execution(format!(
            "file not found: {}",
            path.display()
        )));
    }
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    let raw = if is_pdf {
        let bytes = std::fs::read(path).map_err(|e| ToolError::Execution(e.to_string()))?;
        pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| ToolError::Execution(format!("failed to read PDF: {e}")))?
    } else {
        std::fs::read_to_string(path).map_err(|e| ToolError::Execution(e.to_string()))?
    };

    // pdf-extract separates pages with form feeds.
    let pages: Vec<&str> = raw.split('\x0C').filter(|p| !p.trim().is_empty()).collect();
    let content = pages
        .iter()
        .enumerate()
        .map(|(i, text)| format!("--- Page {} ---\n{}", i + 1, text.trim()))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(DocumentText {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        content,
        page_count: pages.len(),
    })
}

/// Extract the text content of a document.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadDocument;

impl Tool for ReadDocument {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_document".into(),
            description: "Extract the text content of a PDF or plain-text document.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path to the document"}
                },
                "required": ["path"]
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string"},
                    "content": {"type": "string"},
                    "page_count": {"type": "integer"},
                    "file_path": {"type": "string"}
                }
            }),
        }
    }

    fn call(&self, input: Value) -> Result<Value, ToolError> {
        let path = input["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("'path' must be a string".into()))?;
        let doc = extract_text(Path::new(path))?;
        Ok(json!({
            "filename": doc.filename,
            "content": doc.content,
            "page_count": doc.page_count,
            "file_path": path,
        }))
    }
}

/// Size summary across several documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareDocuments;

impl Tool for CompareDocuments {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "compare_documents".into(),
            description: "Summarize several documents side by side to spot trends across them."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "paths": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["paths"]
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "total_documents": {"type": "integer"},
                    "documents": {"type": "array"},
                    "skipped": {"type": "array"}
                }
            }),
        }
    }

    fn call(&self, input: Value) -> Result<Value, ToolError> {
        let paths: Vec<&str> = input["paths"]
            .as_array()
            .ok_or_else(|| ToolError::InvalidInput("'paths' must be an array".into()))?
            .iter()
            .filter_map(Value::as_str)
            .collect();
        if paths.is_empty() {
            return Err(ToolError::InvalidInput("no documents provided".into()));
        }

        let mut documents = Vec::new();
        let mut skipped = Vec::new();
        for path in paths {
            match extract_text(Path::new(path)) {
                Ok(doc) => documents.push(json!({
                    "file": doc.filename,
                    "page_count": doc.page_count,
                    "content_length": doc.content.chars().count(),
                })),
                Err(e) => {
                    tracing::debug!(path, error = %e, "skipping document");
                    skipped.push(json!({"path": path, "error": e.to_string()}));
                }
            }
        }

        Ok(json!({
            "total_documents": documents.len(),
            "documents": documents,
            "skipped": skipped,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_pass_registration() {
        let registry = registry().unwrap();
        assert_eq!(
            registry.names(),
            vec!["analyze_statistics", "read_document", "compare_documents"]
        );
    }

    #[test]
    fn statistics_over_tagged_questions() {
        let input = json!({"questions": [
            {"topic": "Quantum Mechanics", "bloom_level": "Analyze"},
            {"topic": "Quantum Mechanics", "bloom_level": "Apply"},
            {"topic": "Electromagnetism", "bloom_level": "Understand"},
            {"topic": "Thermodynamics", "bloom_level": "Remember"},
            {"bloom_level": "create"}
        ]});
        let stats = AnalyzeStatistics.call(input).unwrap();

        assert_eq!(stats["total_questions"], 5);
        assert_eq!(stats["topic_distribution"]["Quantum Mechanics"], 2);
        assert_eq!(stats["topic_distribution"]["Unknown"], 1);
        assert_eq!(stats["top_topics"][0], json!(["Quantum Mechanics", 2]));
        assert_eq!(stats["top_topics"][1], json!(["Electromagnetism", 1]));
        assert_eq!(stats["cognitive_complexity"]["lower_order"], 2);
        assert_eq!(stats["cognitive_complexity"]["higher_order"], 3);
    }

    #[test]
    fn statistics_reject_non_array() {
        let err = AnalyzeStatistics.call(json!({"questions": "x"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[test]
    fn read_plain_text_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exam.txt");
        std::fs::write(&path, "Q1. Define entropy.\x0CQ2. State Ohm's law.").unwrap();

        let out = ReadDocument
            .call(json!({"path": path.to_str().unwrap()}))
            .unwrap();
        assert_eq!(out["filename"], "exam.txt");
        assert_eq!(out["page_count"], 2);
        assert!(out["content"].as_str().unwrap().contains("--- Page 2 ---"));
    }

    #[test]
    fn missing_document_is_execution_error() {
        let err = ReadDocument
            .call(json!({"path": "/definitely/not/here.pdf"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }

    #[test]
    fn compare_skips_unreadable_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let out = CompareDocuments
            .call(json!({"paths": [path.to_str().unwrap(), "/missing.txt"]}))
            .unwrap();
        assert_eq!(out["total_documents"], 1);
        assert_eq!(out["documents"][0]["file"], "a.txt");
        assert_eq!(out["skipped"][0]["path"], "/missing.txt");

        assert!(CompareDocuments.call(json!({"paths": []})).is_err());
    }
}
