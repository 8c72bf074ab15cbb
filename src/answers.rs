//! Helpers around LLM intermediate answers and document evaluations.
//!
//! Answers may wrap their reasoning in `<think>` tags and their final word in
//! `<answer>` tags. An answer of `IRRELEVANT` marks a document that did not
//! help with the question.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::types::Document;

/// Score given to a document whose evaluation is not a number: keep it.
const FALLBACK_SCORE: i64 = 5;

const IRRELEVANT: &str = "IRRELEVANT";

static IRRELEVANT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bIRRELEVANT\b").expect("Invalid regex"));
static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("Invalid regex"));
static ANSWER_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<answer>(.*?)</answer>").expect("Invalid regex"));

#[derive(Error, Debug)]
pub enum AnswerError {
    #[error("No document corresponding to the query")]
    NoDocuments,

    #[error("No document remained after filtering with the query")]
    AllFiltered,

    #[error("Got {documents} documents but {evaluations} evaluations")]
    LengthMismatch { documents: usize, evaluations: usize },

    #[error("The eval LLM returned an output that can't be parsed as expected: '{0}'")]
    EmptyEvaluation(String),

    #[error("Cannot collate {count} intermediate answer(s), at least 2 are needed")]
    TooFewAnswers { count: usize },
}

/// An LLM output split into reasoning and final answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThinkingAnswer {
    pub thinking: String,
    pub answer: String,
}

/// Splits `<think>` reasoning from the `<answer>`.
///
/// Without answer tags the whole output, minus any think block, is the answer.
pub fn parse_thinking_answer(text: &str) -> ThinkingAnswer {
    let thinking = THINK_BLOCK
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    let answer = match ANSWER_BLOCK.captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => THINK_BLOCK.replace_all(text, "").trim().to_string(),
    };

    ThinkingAnswer { thinking, answer }
}

/// Whether an intermediate answer is worth combining.
pub fn check_intermediate_answer(answer: &str) -> bool {
    if answer.contains("<answer>IRRELEVANT</answer>") {
        return false;
    }
    let short = answer.chars().count() < IRRELEVANT.len() * 2;
    !short || !IRRELEVANT_WORD.is_match(answer)
}

/// Normalizes an evaluation output to the integer it answered.
///
/// Anything that is not an integer counts as the fallback score, so the
/// document is kept.
pub fn parse_eval_output(output: &str) -> Result<String, AnswerError> {
    if output.trim().is_empty() {
        return Err(AnswerError::EmptyEvaluation(output.to_string()));
    }
    Ok(eval_score(output).to_string())
}

fn eval_score(output: &str) -> i64 {
    let answer = parse_thinking_answer(output).answer;
    answer.trim().parse().unwrap_or_else(|e| {
        warn!(
            target: "ragshard::index",
            "Document was not evaluated with a number: '{e}' for answer '{answer}'. Keeping the document anyway."
        );
        FALLBACK_SCORE
    })
}

/// Keeps the documents whose evaluations do not sum to zero.
pub fn refilter_docs<S: AsRef<str>>(
    docs: Vec<Document>,
    evaluations: &[Vec<S>],
) -> Result<Vec<Document>, AnswerError> {
    if docs.is_empty() {
        return Err(AnswerError::NoDocuments);
    }
    if docs.len() != evaluations.len() {
        return Err(AnswerError::LengthMismatch {
            documents: docs.len(),
            evaluations: evaluations.len(),
        });
    }

    let kept: Vec<Document> = docs
        .into_iter()
        .zip(evaluations)
        .filter(|(_, evals)| evals.iter().map(|e| eval_score(e.as_ref())).sum::<i64>() != 0)
        .map(|(doc, _)| doc)
        .collect();

    if kept.is_empty() {
        return Err(AnswerError::AllFiltered);
    }
    Ok(kept)
}

/// Renders the relevant intermediate answers as one numbered block.
pub fn collate_intermediate_answers<S: AsRef<str>>(answers: &[S]) -> Result<String, AnswerError> {
    let relevant: Vec<&str> = answers
        .iter()
        .map(|a| a.as_ref())
        .filter(|a| check_intermediate_answer(a))
        .collect();
    if relevant.len() < 2 {
        return Err(AnswerError::TooFewAnswers {
            count: relevant.len(),
        });
    }

    let mut out = String::from("Intermediate answers:\n");
    for (i, answer) in relevant.iter().enumerate() {
        out.push_str(&format!(
            "<source_id>\n{}\n</source_id>\n<ia>\n{answer}\n</ia>\n",
            i + 1
        ));
    }
    Ok(out)
}
