//! Output-equivalence oracle.
//!
//! Closed-form rules first, dispatched over [`OutputValue`]; the judgment
//! capability is only asked when no exact rule applies (non-deterministic
//! strings and images, prompt matching). A "no match" is a verdict, never an
//! error; errors are reserved for failed downloads, undecodable media and
//! exhausted judgment retries.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};
use crate::judge::{Attachment, Judge};
use crate::media::{download_many, extensions_match, is_url, DownloadedFile, MediaFetcher, MediaKind};
use crate::value::OutputValue;

/// Absolute tolerance for float outputs.
pub const FLOAT_TOLERANCE: f64 = 0.1;

/// Mean per-pixel RGB distance above which deterministic images differ.
pub const IMAGE_DISTANCE_EPSILON: f64 = 8.0;

/// Votes cast by prompt matching when the first answer is negative.
const PROMPT_MATCH_VOTES: usize = 3;

/// Whether two outputs are equivalent, and why not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceVerdict {
    pub matches: bool,
    /// Empty when matched.
    pub reason: String,
}

impl EquivalenceVerdict {
    pub fn matched() -> Self {
        Self {
            matches: true,
            reason: String::new(),
        }
    }

    pub fn mismatch(reason: impl Into<String>) -> Self {
        Self {
            matches: false,
            reason: reason.into(),
        }
    }

    fn nested(self, prefix: impl std::fmt::Display) -> Self {
        if self.matches {
            self
        } else {
            Self::mismatch(format!("{prefix}: {}", self.reason))
        }
    }
}

#[derive(Clone)]
pub struct OutputEquivalenceOracle {
    judge: Judge,
    fetcher: Arc<dyn MediaFetcher>,
}

impl OutputEquivalenceOracle {
    pub fn new(judge: Judge, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { judge, fetcher }
    }

    /// Compare a candidate output against the reference output.
    pub async fn compare(
        &self,
        candidate: &Value,
        reference: &Value,
        deterministic: bool,
    ) -> Result<EquivalenceVerdict> {
        let candidate = OutputValue::from(candidate);
        let reference = OutputValue::from(reference);
        self.compare_values(&candidate, &reference, deterministic).await
    }

    fn compare_values<'a>(
        &'a self,
        candidate: &'a OutputValue,
        reference: &'a OutputValue,
        deterministic: bool,
    ) -> BoxFuture<'a, Result<EquivalenceVerdict>> {
        async move {
            if candidate.shape() != reference.shape() {
                return Ok(EquivalenceVerdict::mismatch("The types of the outputs don't match"));
            }

            let verdict = match (candidate, reference) {
                (OutputValue::String(c), OutputValue::String(r)) => {
                    match (is_url(c), is_url(r)) {
                        (true, true) => self.urls_match(c, r, deterministic).await?,
                        (false, false) => self.strings_match(c, r, deterministic).await?,
                        _ => EquivalenceVerdict::mismatch("Only one output is a URL"),
                    }
                }
                (OutputValue::Bool(c), OutputValue::Bool(r)) => {
                    exact(c == r, "Booleans aren't identical")
                }
                (OutputValue::Integer(c), OutputValue::Integer(r)) => {
                    exact(c == r, "Integers aren't identical")
                }
                (OutputValue::Float(c), OutputValue::Float(r)) => {
                    exact((c - r).abs() < FLOAT_TOLERANCE, "Floats aren't identical")
                }
                (OutputValue::Mapping(c), OutputValue::Mapping(r)) => {
                    if !c.keys().eq(r.keys()) {
                        return Ok(EquivalenceVerdict::mismatch("Dict keys don't match"));
                    }
                    for (key, r_value) in r {
                        let verdict = self.compare_values(&c[key], r_value, deterministic).await?;
                        if !verdict.matches {
                            return Ok(verdict.nested(format_args!("In {key}")));
                        }
                    }
                    EquivalenceVerdict::matched()
                }
                (OutputValue::Sequence(c), OutputValue::Sequence(r)) => {
                    if c.len() != r.len() {
                        return Ok(EquivalenceVerdict::mismatch("List lengths don't match"));
                    }
                    for (i, (c_item, r_item)) in c.iter().zip(r).enumerate() {
                        let verdict = self.compare_values(c_item, r_item, deterministic).await?;
                        if !verdict.matches {
                            return Ok(verdict.nested(format_args!("At index {i}")));
                        }
                    }
                    EquivalenceVerdict::matched()
                }
                _ => {
                    warn!(shape = reference.shape(), "unknown output shape, treating as a match");
                    EquivalenceVerdict::matched()
                }
            };
            Ok(verdict)
        }
        .boxed()
    }

    async fn strings_match(&self, s1: &str, s2: &str, deterministic: bool) -> Result<EquivalenceVerdict> {
        if deterministic {
            return Ok(exact(s1 == s2, "Strings aren't the same"));
        }
        let prompt = format!(
            "Have these two strings been generated by the same generative AI model inputs/prompt?\n\n\
             String 1: '{s1}'\nString 2: '{s2}'"
        );
        let same = self.judge.boolean(&prompt, &[]).await?;
        Ok(exact(same, "Strings aren't similar"))
    }

    /// Media equivalence of two URLs, dispatched on the suffix class.
    pub async fn urls_match(&self, url1: &str, url2: &str, deterministic: bool) -> Result<EquivalenceVerdict> {
        if !extensions_match(url1, url2) {
            return Ok(EquivalenceVerdict::mismatch("URL extensions don't match"));
        }
        match MediaKind::of_url(url1) {
            MediaKind::Image => self.images_match(url1, url2, deterministic).await,
            MediaKind::Audio | MediaKind::Video => {
                // Not compared: always a match.
                warn!(url = url1, "audio and video outputs are not compared, treating as a match");
                Ok(EquivalenceVerdict::matched())
            }
            MediaKind::Unknown => {
                warn!(url = url1, "unknown URL format, treating as a match");
                Ok(EquivalenceVerdict::matched())
            }
        }
    }

    async fn images_match(&self, url1: &str, url2: &str, deterministic: bool) -> Result<EquivalenceVerdict> {
        let file1 = self.fetcher.download(url1).await?;
        let file2 = self.fetcher.download(url2).await?;
        let img1 = decode_image(&file1)?;
        let img2 = decode_image(&file2)?;

        if img1.dimensions() != img2.dimensions() {
            return Ok(EquivalenceVerdict::mismatch("Image sizes don't match"));
        }

        if deterministic {
            let distance = mean_pixel_distance(&img1, &img2);
            debug!(distance, "mean pixel distance");
            return Ok(exact(distance <= IMAGE_DISTANCE_EPSILON, "Images are not identical"));
        }

        let attachments = [file1.attachment()?, file2.attachment()?];
        let same = self
            .judge
            .boolean(
                "These two images have been generated by or modified by an AI model. \
                 Is it highly likely that those two predictions of the model had the same inputs?",
                &attachments,
            )
            .await?;
        Ok(exact(same, "Images are not similar"))
    }

    /// Whether `output` matches a natural-language description.
    ///
    /// A negative first answer triggers two more; the output matches when
    /// at least two of the three agree it does.
    pub async fn output_matches_prompt(&self, output: &Value, description: &str) -> Result<EquivalenceVerdict> {
        let urls = embedded_urls(output);
        let files = download_many(self.fetcher.as_ref(), &urls).await?;
        let attachments = files
            .iter()
            .map(DownloadedFile::attachment)
            .collect::<Result<Vec<Attachment>>>()?;

        let mut prompt = String::from(
            "You are part of an automatic evaluation that compares media (text, audio, image, video, etc.) \
             to descriptions. I want to know if the description matches the output.\n\n",
        );
        if urls.is_empty() {
            prompt.push_str(&format!(
                "Do these outputs match the following description?\n\nOutput: {output}\n\n\
                 Description to evaluate: {description}"
            ));
        } else {
            prompt.push_str(&format!(
                "Do these file(s) and the attached content of the file(s) match the description? \
                 Pay close attention to the file metadata below, especially if the description mentions \
                 file type. Do not infer the file type from the content, but from the metadata.\n\n\
                 Description to evaluate: {description}\n\nFile metadata:"
            ));
            for (url, attachment) in urls.iter().zip(&attachments) {
                prompt.push_str(&format!("\n* {url}: media type {}", attachment.media_type));
            }
        }

        if self.judge.boolean(&prompt, &attachments).await? {
            return Ok(EquivalenceVerdict::matched());
        }
        let mut yes = 0;
        for _ in 1..PROMPT_MATCH_VOTES {
            if self.judge.boolean(&prompt, &attachments).await? {
                yes += 1;
            }
            if yes * 2 > PROMPT_MATCH_VOTES {
                return Ok(EquivalenceVerdict::matched());
            }
        }
        Ok(EquivalenceVerdict::mismatch(
            "AI determined that the output does not match the description",
        ))
    }
}

fn exact(matches: bool, reason: &str) -> EquivalenceVerdict {
    if matches {
        EquivalenceVerdict::matched()
    } else {
        EquivalenceVerdict::mismatch(reason)
    }
}

/// URLs of a bare URL string, or of a non-empty list/mapping whose every
/// value is a URL.
pub fn embedded_urls(output: &Value) -> Vec<String> {
    fn all_urls<'a>(mut items: impl Iterator<Item = &'a Value>) -> Option<Vec<String>> {
        let mut urls = Vec::new();
        items.try_for_each(|v| match v.as_str() {
            Some(s) if is_url(s) => {
                urls.push(s.to_string());
                Some(())
            }
            _ => None,
        })?;
        Some(urls)
    }
    match output {
        Value::String(s) if is_url(s) => vec![s.clone()],
        Value::Array(items) => all_urls(items.iter()).unwrap_or_default(),
        Value::Object(map) => all_urls(map.values()).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn decode_image(file: &DownloadedFile) -> Result<image::RgbImage> {
    let bytes = file.read_bytes()?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| HarnessError::Media(format!("failed to decode image {}: {e}", file.url())))?;
    Ok(img.to_rgb8())
}

/// Mean Euclidean RGB distance over all pixels. Images must share dimensions.
fn mean_pixel_distance(a: &image::RgbImage, b: &image::RgbImage) -> f64 {
    let pixels = u64::from(a.width()) * u64::from(a.height());
    if pixels == 0 {
        return 0.0;
    }
    let total: f64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(p1, p2)| {
            p1.0.iter()
                .zip(p2.0.iter())
                .map(|(c1, c2)| (f64::from(*c1) - f64::from(*c2)).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .sum();
    total / pixels as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{solid_png, MemoryMediaFetcher, ScriptedJudge};
    use serde_json::json;

    fn oracle(judge: Arc<ScriptedJudge>, fetcher: MemoryMediaFetcher) -> OutputEquivalenceOracle {
        OutputEquivalenceOracle::new(Judge::new(judge), Arc::new(fetcher))
    }

    fn exact_oracle() -> OutputEquivalenceOracle {
        oracle(Arc::new(ScriptedJudge::new()), MemoryMediaFetcher::new())
    }

    #[tokio::test]
    async fn primitives_are_reflexive() {
        let o = exact_oracle();
        for v in [json!("text"), json!(true), json!(7), json!(1.5)] {
            assert!(o.compare(&v, &v, true).await.unwrap().matches, "{v}");
        }
    }

    #[tokio::test]
    async fn booleans_do_not_alias_integers() {
        let o = exact_oracle();
        let v = o.compare(&json!(true), &json!(1), true).await.unwrap();
        assert_eq!(v.reason, "The types of the outputs don't match");
        let v = o.compare(&json!(1), &json!(1.0), false).await.unwrap();
        assert!(!v.matches);
    }

    #[tokio::test]
    async fn floats_within_tolerance() {
        let o = exact_oracle();
        assert!(o.compare(&json!(1.0), &json!(1.05), true).await.unwrap().matches);
        let v = o.compare(&json!(1.0), &json!(1.2), true).await.unwrap();
        assert_eq!(v.reason, "Floats aren't identical");
    }

    #[tokio::test]
    async fn mapping_reports_first_differing_key() {
        let o = exact_oracle();
        let v = o
            .compare(&json!({"a": 1, "b": 2, "c": 3}), &json!({"a": 1, "b": 5, "c": 9}), true)
            .await
            .unwrap();
        assert_eq!(v.reason, "In b: Integers aren't identical");

        let v = o.compare(&json!({"a": 1}), &json!({"b": 1}), true).await.unwrap();
        assert_eq!(v.reason, "Dict keys don't match");
    }

    #[tokio::test]
    async fn sequence_reports_first_differing_index() {
        let o = exact_oracle();
        let v = o
            .compare(&json!(["x", "y", "z"]), &json!(["x", "q", "r"]), true)
            .await
            .unwrap();
        assert_eq!(v.reason, "At index 1: Strings aren't the same");

        let v = o.compare(&json!([1]), &json!([1, 2]), true).await.unwrap();
        assert_eq!(v.reason, "List lengths don't match");
    }

    #[tokio::test]
    async fn non_deterministic_strings_ask_once() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_boolean(Ok(false));
        let o = oracle(judge.clone(), MemoryMediaFetcher::new());
        let v = o.compare(&json!("a cat"), &json!("a dog"), false).await.unwrap();
        assert_eq!(v.reason, "Strings aren't similar");
        assert_eq!(judge.boolean_prompts().len(), 1);
    }

    #[tokio::test]
    async fn one_url_is_a_mismatch() {
        let o = exact_oracle();
        let v = o
            .compare(&json!("https://x/a.png"), &json!("hello"), true)
            .await
            .unwrap();
        assert_eq!(v.reason, "Only one output is a URL");
    }

    #[tokio::test]
    async fn null_outputs_match_with_warning() {
        let o = exact_oracle();
        assert!(o.compare(&json!(null), &json!(null), true).await.unwrap().matches);
    }

    #[tokio::test]
    async fn audio_is_not_compared() {
        let o = exact_oracle();
        let v = o
            .compare(&json!("https://x/a.wav"), &json!("https://y/b.wav"), true)
            .await
            .unwrap();
        assert!(v.matches);
        let v = o
            .compare(&json!("https://x/a.wav"), &json!("https://y/b.mp3"), true)
            .await
            .unwrap();
        assert_eq!(v.reason, "URL extensions don't match");
    }

    #[tokio::test]
    async fn deterministic_images_use_pixel_distance() {
        let fetcher = MemoryMediaFetcher::new()
            .with_file("https://x/a.png", solid_png(4, 4, [100, 100, 100]))
            .with_file("https://x/b.png", solid_png(4, 4, [102, 101, 100]))
            .with_file("https://x/c.png", solid_png(4, 4, [200, 100, 100]))
            .with_file("https://x/d.png", solid_png(8, 4, [100, 100, 100]));
        let o = oracle(Arc::new(ScriptedJudge::new()), fetcher);

        let near = o.compare(&json!("https://x/a.png"), &json!("https://x/b.png"), true).await.unwrap();
        assert!(near.matches);
        let far = o.compare(&json!("https://x/a.png"), &json!("https://x/c.png"), true).await.unwrap();
        assert_eq!(far.reason, "Images are not identical");
        let sized = o.compare(&json!("https://x/a.png"), &json!("https://x/d.png"), true).await.unwrap();
        assert_eq!(sized.reason, "Image sizes don't match");
    }

    #[tokio::test]
    async fn fuzzy_images_attach_both_files() {
        let fetcher = MemoryMediaFetcher::new()
            .with_file("https://x/a.png", solid_png(2, 2, [0, 0, 0]))
            .with_file("https://x/b.png", solid_png(2, 2, [255, 255, 255]));
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_boolean(Ok(true));
        let o = oracle(judge.clone(), fetcher);
        let v = o.compare(&json!("https://x/a.png"), &json!("https://x/b.png"), false).await.unwrap();
        assert!(v.matches);
        assert_eq!(judge.attachments()[0].len(), 2);
    }

    #[tokio::test]
    async fn prompt_match_majority_of_three() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_boolean(Ok(false));
        judge.push_boolean(Ok(true));
        judge.push_boolean(Ok(true));
        let o = oracle(judge.clone(), MemoryMediaFetcher::new());
        assert!(o.output_matches_prompt(&json!("a red cat"), "a cat").await.unwrap().matches);
        assert_eq!(judge.boolean_prompts().len(), 3);

        let judge = Arc::new(ScriptedJudge::new());
        judge.push_boolean(Ok(false));
        judge.push_boolean(Ok(true));
        judge.push_boolean(Ok(false));
        let o = oracle(judge.clone(), MemoryMediaFetcher::new());
        let v = o.output_matches_prompt(&json!("a red cat"), "a dog").await.unwrap();
        assert!(!v.matches);
    }

    #[tokio::test]
    async fn prompt_match_short_circuits_on_first_yes() {
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_boolean(Ok(true));
        let o = oracle(judge.clone(), MemoryMediaFetcher::new());
        assert!(o.output_matches_prompt(&json!("x"), "x").await.unwrap().matches);
        assert_eq!(judge.boolean_prompts().len(), 1);
    }

    #[tokio::test]
    async fn prompt_match_states_media_types() {
        let fetcher = MemoryMediaFetcher::new().with_file("https://x/out.jpg", solid_png(2, 2, [1, 1, 1]));
        let judge = Arc::new(ScriptedJudge::new());
        judge.push_boolean(Ok(true));
        let o = oracle(judge.clone(), fetcher);
        o.output_matches_prompt(&json!(["https://x/out.jpg"]), "a jpeg image")
            .await
            .unwrap();
        // Sniffed from the content, not the suffix.
        assert!(judge.boolean_prompts()[0].contains("media type image/png"));
    }

    #[test]
    fn embedded_urls_require_every_value() {
        assert_eq!(embedded_urls(&json!("https://x/a.png")), vec!["https://x/a.png"]);
        assert_eq!(
            embedded_urls(&json!({"a": "https://x/a.png", "b": "https://x/b.png"})).len(),
            2
        );
        assert!(embedded_urls(&json!(["https://x/a.png", "text"])).is_empty());
        assert!(embedded_urls(&json!("text")).is_empty());
    }
}
