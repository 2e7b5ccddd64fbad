//! Language-model collaborator used by the query pipeline.
//!
//! The answerer performs three jobs: label the topic of a message, pick the
//! documents worth searching, and write the final grounded answer.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{error::Result, openai::OpenAiClient, text_util};

pub const DEFAULT_ANSWER_MODEL: &str = "gemini-2.5-flash";

/// Topic label used when a message has nothing to classify.
pub const GENERAL_TOPIC: &str = "general";

/// Reply when retrieval produced no context at all.
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find anything relevant in the uploaded documents.";

const CLASSIFY_PROMPT: &str = "Classify the user's message into a short \
topic label of one to three words. Reply with the label only, without \
punctuation.";

const ROUTE_PROMPT: &str = "You decide which uploaded documents may contain \
the answer to a question. Reply with a JSON object of the form \
{\"relevant_files\": [\"name\", ...]} using only names from the provided \
list. Use an empty list when no document applies.";

const ANSWER_PROMPT: &str = "You are a professional AI assistant. Answer the \
question using only the context below. If the context does not contain the \
answer, say so.";

/// Outcome of asking the model which documents are relevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Names the model chose. May be empty, and may contain names that are
    /// not in the candidate list.
    Selected(Vec<String>),
    /// The reply could not be read as a file list; carries the raw text.
    Unparseable(String),
}

#[async_trait]
pub trait Answerer: Send + Sync {
    fn model_name(&self) -> &str;

    /// Short topic label for `text`.
    async fn classify(&self, text: &str) -> Result<String>;

    /// Choose which of `filenames` are worth searching for `query`.
    async fn route(&self, query: &str, filenames: &[String]) -> Result<Routing>;

    /// Write an answer to `query` grounded in `chunks`.
    async fn synthesize(&self, query: &str, chunks: &[String]) -> Result<String>;
}

#[derive(Deserialize)]
struct RoutingReply {
    relevant_files: Vec<String>,
}

/// Read a routing reply, tolerating markdown code fences and a bare array.
pub fn parse_routing(raw: &str) -> Routing {
    let body = strip_code_fence(raw);

    if let Ok(reply) = serde_json::from_str::<RoutingReply>(body) {
        return Routing::Selected(reply.relevant_files);
    }
    if let Ok(names) = serde_json::from_str::<Vec<String>>(body) {
        return Routing::Selected(names);
    }
    Routing::Unparseable(raw.to_string())
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().trim_end_matches("```").trim()
}

/// Canonical form of a topic label: lowercase words separated by single
/// spaces, without surrounding quotes or punctuation.
pub fn normalize_topic(raw: &str) -> String {
    let words: Vec<String> = text_util::words(raw).collect();
    if words.is_empty() {
        GENERAL_TOPIC.to_string()
    } else {
        words.join(" ")
    }
}

/// Answerer backed by an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct ChatAnswerer {
    client: OpenAiClient,
    model: String,
}

impl ChatAnswerer {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Answerer for ChatAnswerer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, text: &str) -> Result<String> {
        let reply = self
            .client
            .chat(&self.model, CLASSIFY_PROMPT, text, false)
            .await?;
        Ok(normalize_topic(&reply))
    }

    async fn route(&self, query: &str, filenames: &[String]) -> Result<Routing> {
        let listing = filenames
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!("Question: {query}\n\nDocuments:\n{listing}");

        let reply = self
            .client
            .chat(&self.model, ROUTE_PROMPT, &user, true)
            .await?;
        Ok(parse_routing(&reply))
    }

    async fn synthesize(&self, query: &str, chunks: &[String]) -> Result<String> {
        let context = chunks.join("\n\n");
        let system = format!("{ANSWER_PROMPT}\n<context>\n{context}\n</context>");
        let user = format!("Question: {query}");

        let reply = self.client.chat(&self.model, &system, &user, false).await?;
        Ok(reply.trim().to_string())
    }
}

/// Offline answerer that quotes the retrieved text instead of generating.
///
/// Topics are the leading keywords of the message; routing keeps files whose
/// names share a keyword with the question, or every file when none do.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveAnswerer;

const MAX_EXCERPTS: usize = 3;
const MAX_EXCERPT_CHARS: usize = 300;

#[async_trait]
impl Answerer for ExtractiveAnswerer {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn classify(&self, text: &str) -> Result<String> {
        let keywords: Vec<String> =
            text_util::keywords(text).into_iter().take(2).collect();
        Ok(normalize_topic(&keywords.join(" ")))
    }

    async fn route(&self, query: &str, filenames: &[String]) -> Result<Routing> {
        let wanted: BTreeSet<String> =
            text_util::keywords(query).into_iter().collect();

        let matching: Vec<String> = filenames
            .iter()
            .filter(|name| {
                text_util::words(name).any(|word| wanted.contains(&word))
            })
            .cloned()
            .collect();

        if matching.is_empty() {
            Ok(Routing::Selected(filenames.to_vec()))
        } else {
            Ok(Routing::Selected(matching))
        }
    }

    async fn synthesize(&self, query: &str, chunks: &[String]) -> Result<String> {
        if chunks.is_empty() {
            return Ok(NO_CONTEXT_ANSWER.to_string());
        }

        let wanted: BTreeSet<String> =
            text_util::keywords(query).into_iter().collect();
        let mut excerpts: Vec<String> = Vec::new();

        for chunk in chunks {
            for sentence in sentences(chunk) {
                let hits =
                    text_util::words(sentence).any(|w| wanted.contains(&w));
                let excerpt = text_util::truncate_chars(
                    &text_util::collapse_whitespace(sentence),
                    MAX_EXCERPT_CHARS,
                );
                if hits && !excerpts.contains(&excerpt) {
                    excerpts.push(excerpt);
                }
                if excerpts.len() == MAX_EXCERPTS {
                    break;
                }
            }
            if excerpts.len() == MAX_EXCERPTS {
                break;
            }
        }

        if excerpts.is_empty() {
            excerpts.push(text_util::truncate_chars(
                &text_util::collapse_whitespace(&chunks[0]),
                MAX_EXCERPT_CHARS,
            ));
        }

        let body = excerpts
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!("From the uploaded documents:\n{body}"))
    }
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
