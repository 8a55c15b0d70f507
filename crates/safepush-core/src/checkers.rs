//! Output checkers for user test cases.
//!
//! A checker sees either the output of a succeeded prediction or the error
//! of a failed one, and fails with `TestCaseFailed` when the expectation is
//! not met.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{HarnessError, Result};
use crate::media::is_url;
use crate::oracle::OutputEquivalenceOracle;
use crate::value::truncate;

/// What a test case expects of its prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    ExactString(String),
    MatchUrl(String),
    MatchPrompt(String),
    ErrorContains(String),
}

#[async_trait]
pub trait OutputChecker: Send + Sync {
    async fn check(&self, output: Option<&Value>, error: Option<&str>) -> Result<()>;
}

/// Checker for `expectation`; no expectation means "must not fail".
pub fn checker_for(
    expectation: Option<&Expectation>,
    oracle: &OutputEquivalenceOracle,
) -> Box<dyn OutputChecker> {
    match expectation {
        None => Box::new(NoChecker),
        Some(Expectation::ExactString(s)) => Box::new(ExactStringChecker {
            expected: s.clone(),
        }),
        Some(Expectation::MatchUrl(url)) => Box::new(MatchUrlChecker {
            url: url.clone(),
            oracle: oracle.clone(),
        }),
        Some(Expectation::MatchPrompt(prompt)) => Box::new(PromptChecker {
            prompt: prompt.clone(),
            oracle: oracle.clone(),
        }),
        Some(Expectation::ErrorContains(s)) => Box::new(ErrorContainsChecker {
            substring: s.clone(),
        }),
    }
}

fn failed(msg: impl Into<String>) -> HarnessError {
    HarnessError::TestCaseFailed(msg.into())
}

fn check_no_error(error: Option<&str>) -> Result<()> {
    match error {
        Some(e) => Err(failed(format!("Prediction raised unexpected error: {e}"))),
        None => Ok(()),
    }
}

fn render(output: Option<&Value>) -> String {
    match output {
        Some(Value::String(s)) => truncate(s, 200),
        Some(v) => truncate(v, 200),
        None => "no output".to_string(),
    }
}

/// The prediction must succeed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoChecker;

#[async_trait]
impl OutputChecker for NoChecker {
    async fn check(&self, _output: Option<&Value>, error: Option<&str>) -> Result<()> {
        check_no_error(error)
    }
}

#[derive(Debug, Clone)]
pub struct ExactStringChecker {
    pub expected: String,
}

#[async_trait]
impl OutputChecker for ExactStringChecker {
    async fn check(&self, output: Option<&Value>, error: Option<&str>) -> Result<()> {
        check_no_error(error)?;
        match output.and_then(Value::as_str) {
            Some(s) if s == self.expected => Ok(()),
            Some(_) => Err(failed(format!(
                "Expected '{}', got '{}'",
                self.expected,
                render(output)
            ))),
            None => Err(failed(format!("Expected string, got {}", render(output)))),
        }
    }
}

/// The output (a URL, or a one-element list holding one) must be
/// media-equivalent to a reference URL, compared deterministically.
#[derive(Clone)]
pub struct MatchUrlChecker {
    pub url: String,
    oracle: OutputEquivalenceOracle,
}

impl MatchUrlChecker {
    pub fn new(url: impl Into<String>, oracle: OutputEquivalenceOracle) -> Self {
        Self {
            url: url.into(),
            oracle,
        }
    }
}

fn output_url(output: Option<&Value>) -> Option<&str> {
    match output? {
        Value::String(s) if is_url(s) => Some(s.as_str()),
        Value::Array(items) if items.len() == 1 => items[0].as_str().filter(|s| is_url(s)),
        _ => None,
    }
}

#[async_trait]
impl OutputChecker for MatchUrlChecker {
    async fn check(&self, output: Option<&Value>, error: Option<&str>) -> Result<()> {
        check_no_error(error)?;
        let Some(actual) = output_url(output) else {
            return Err(failed(format!("Expected URL, got '{}'", render(output))));
        };
        let verdict = self.oracle.urls_match(&self.url, actual, true).await?;
        if !verdict.matches {
            return Err(failed(format!(
                "File at URL {} does not match file at URL {actual}. {}",
                self.url, verdict.reason
            )));
        }
        info!("File at URL {} matched file at URL {actual}", self.url);
        Ok(())
    }
}

/// The output must match a natural-language description.
#[derive(Clone)]
pub struct PromptChecker {
    pub prompt: String,
    oracle: OutputEquivalenceOracle,
}

impl PromptChecker {
    pub fn new(prompt: impl Into<String>, oracle: OutputEquivalenceOracle) -> Self {
        Self {
            prompt: prompt.into(),
            oracle,
        }
    }
}

#[async_trait]
impl OutputChecker for PromptChecker {
    async fn check(&self, output: Option<&Value>, error: Option<&str>) -> Result<()> {
        check_no_error(error)?;
        let output = output.cloned().unwrap_or(Value::Null);
        match self.oracle.output_matches_prompt(&output, &self.prompt).await {
            Ok(verdict) if verdict.matches => Ok(()),
            Ok(verdict) => Err(failed(verdict.reason)),
            Err(HarnessError::Judgment(e)) => Err(failed(format!("AI error: {e}"))),
            Err(e) => Err(e),
        }
    }
}

/// The prediction must fail with an error containing a substring.
#[derive(Debug, Clone)]
pub struct ErrorContainsChecker {
    pub substring: String,
}

#[async_trait]
impl OutputChecker for ErrorContainsChecker {
    async fn check(&self, _output: Option<&Value>, error: Option<&str>) -> Result<()> {
        match error {
            None => Err(failed("Expected error, prediction succeeded")),
            Some(e) if e.contains(&self.substring) => Ok(()),
            Some(e) => Err(failed(format!(
                "Expected error to contain {}, got {e}",
                self.substring
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{solid_png, MemoryMediaFetcher, ScriptedJudge};
    use crate::judge::{Judge, JudgmentError};
    use serde_json::json;
    use std::sync::Arc;

    fn oracle(judge: ScriptedJudge, fetcher: MemoryMediaFetcher) -> OutputEquivalenceOracle {
        OutputEquivalenceOracle::new(Judge::new(Arc::new(judge)), Arc::new(fetcher))
    }

    fn message(err: HarnessError) -> String {
        match err {
            HarnessError::TestCaseFailed(msg) => msg,
            other => panic!("expected TestCaseFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_checker_rejects_errors() {
        assert!(NoChecker.check(Some(&json!(1)), None).await.is_ok());
        let err = NoChecker.check(None, Some("CUDA OOM")).await.unwrap_err();
        assert_eq!(message(err), "Prediction raised unexpected error: CUDA OOM");
    }

    #[tokio::test]
    async fn exact_string() {
        let c = ExactStringChecker {
            expected: "hello".into(),
        };
        assert!(c.check(Some(&json!("hello")), None).await.is_ok());
        let err = c.check(Some(&json!("bye")), None).await.unwrap_err();
        assert_eq!(message(err), "Expected 'hello', got 'bye'");
        let err = c.check(Some(&json!(3)), None).await.unwrap_err();
        assert_eq!(message(err), "Expected string, got 3");
    }

    #[tokio::test]
    async fn match_url_accepts_single_element_list() {
        let png = solid_png(2, 2, [9, 9, 9]);
        let fetcher = MemoryMediaFetcher::new()
            .with_file("https://ref/a.png", png.clone())
            .with_file("https://out/b.png", png);
        let c = MatchUrlChecker::new("https://ref/a.png", oracle(ScriptedJudge::new(), fetcher));
        assert!(c.check(Some(&json!(["https://out/b.png"])), None).await.is_ok());

        let err = c.check(Some(&json!("not a url")), None).await.unwrap_err();
        assert_eq!(message(err), "Expected URL, got 'not a url'");
    }

    #[tokio::test]
    async fn match_url_reports_reason() {
        let c = MatchUrlChecker::new(
            "https://ref/a.png",
            oracle(ScriptedJudge::new(), MemoryMediaFetcher::new()),
        );
        let err = c.check(Some(&json!("https://out/b.jpg")), None).await.unwrap_err();
        assert!(message(err).ends_with("URL extensions don't match"));
    }

    #[tokio::test]
    async fn prompt_checker_wraps_judgment_errors() {
        let judge = ScriptedJudge::new();
        for _ in 0..3 {
            judge.push_boolean(Err(JudgmentError::Service("down".into())));
        }
        let c = PromptChecker::new("a cat", oracle(judge, MemoryMediaFetcher::new()));
        let err = c.check(Some(&json!("a cat")), None).await.unwrap_err();
        assert!(message(err).starts_with("AI error:"));
    }

    #[tokio::test]
    async fn error_contains() {
        let c = ErrorContainsChecker {
            substring: "OOM".into(),
        };
        assert!(c.check(None, Some("CUDA OOM")).await.is_ok());
        let err = c.check(Some(&json!("fine")), None).await.unwrap_err();
        assert_eq!(message(err), "Expected error, prediction succeeded");
        let err = c.check(None, Some("segfault")).await.unwrap_err();
        assert_eq!(message(err), "Expected error to contain OOM, got segfault");
    }
}
