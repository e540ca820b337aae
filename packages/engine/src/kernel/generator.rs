//! Draft metadata generation against the text-completion service.
//!
//! Wraps the transport client with everything the phases need: prompt
//! assembly from the job's hints, a bounded retry loop, a language guard
//! with a single rewrite pass, and hard length truncation of the accepted
//! output.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use generator_client::GeneratorClient;
pub use generator_client::GeneratorError;

use crate::common::backoff::{backoff_delay, with_timeout};
use crate::kernel::classify::{classify, classify_unparsable_body, Classification};
use crate::kernel::jobs::JobType;
use crate::kernel::telemetry::CallObserver;

const REQUIRED_KEYWORDS_MAX: usize = 10;
const BANNED_WORDS_MAX: usize = 30;
/// Product/article bodies are clipped before prompting to keep the request
/// under the model's context limit.
const PAYLOAD_MAX_CHARS: usize = 4000;

/// Hard caps applied to accepted output, by character count.
#[derive(Debug, Clone, Copy)]
pub struct FieldLimits {
    pub title_max: usize,
    pub description_max: usize,
    pub alt_max: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            title_max: 60,
            description_max: 160,
            alt_max: 125,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
    pub limits: FieldLimits,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            limits: FieldLimits::default(),
        }
    }
}

/// Transport seam: one JSON-constrained completion call.
#[async_trait]
pub trait TextCompleter: Send + Sync {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<String, GeneratorError>;
}

#[async_trait]
impl TextCompleter for GeneratorClient {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<String, GeneratorError> {
        GeneratorClient::complete_json(self, system, user).await
    }
}

/// Brand/tone hints carried opaquely on the job. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationHints {
    pub brand_name: Option<String>,
    pub tone: Option<String>,
    pub brand_voice: Option<String>,
    pub target_keyword: Option<String>,
    pub required_keywords: Vec<String>,
    pub banned_words: Vec<String>,
    pub capitalization: Option<String>,
    pub emoji_policy: Option<String>,
}

impl GenerationHints {
    /// Lenient parse from the job's stored JSON; anything unreadable
    /// becomes empty hints.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// What the item points at, loaded from the store API.
#[derive(Debug, Clone)]
pub enum TargetPayload {
    Product {
        title: String,
        description: String,
    },
    Article {
        title: String,
        body: String,
    },
    Image {
        product_title: String,
        image_url: Option<String>,
        current_alt: Option<String>,
    },
}

/// Accepted generator output, already truncated to the field limits.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedFields {
    Seo { title: String, description: String },
    Alt { text: String },
}

/// Terminal generation failure with a user-presentable condition.
#[derive(Debug, Error)]
#[error("{user_message}")]
pub struct GenerateError {
    pub user_message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeoJson {
    seo_title: String,
    seo_description: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AltJson {
    alt_text: String,
}

/// Retry loop states for one generation call.
enum CallState {
    Calling { attempt: u32 },
    Sleeping { attempt: u32, wait: Duration, reason: String },
    Done(String),
    Failed(String),
}

pub struct Generator {
    completer: Arc<dyn TextCompleter>,
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(completer: Arc<dyn TextCompleter>, config: GeneratorConfig) -> Self {
        Self { completer, config }
    }

    pub fn limits(&self) -> FieldLimits {
        self.config.limits
    }

    /// Generate draft metadata for one target.
    pub async fn generate(
        &self,
        job_type: JobType,
        lang: &str,
        hints: &GenerationHints,
        payload: &TargetPayload,
        observer: &dyn CallObserver,
    ) -> Result<GeneratedFields, GenerateError> {
        let system = system_prompt(job_type);
        let user = user_prompt(job_type, lang, hints, payload, self.config.limits);

        let raw = self.call_with_retry(&system, &user, observer).await?;
        let fields = parse_fields(job_type, &raw).ok_or_else(|| GenerateError {
            user_message: "service returned a malformed response".into(),
        })?;

        let fields = if is_language_mismatch(lang, &field_texts(&fields)) {
            tracing::info!(lang, "language mismatch detected, requesting rewrite");
            match self.rewrite(job_type, lang, &fields, observer).await {
                Some(rewritten) => rewritten,
                // A failed rewrite keeps the original output; a second
                // mismatch is accepted as-is.
                None => fields,
            }
        } else {
            fields
        };

        Ok(truncate_fields(fields, self.config.limits))
    }

    /// One rewrite pass asking for the same JSON strictly in `lang`.
    async fn rewrite(
        &self,
        job_type: JobType,
        lang: &str,
        fields: &GeneratedFields,
        observer: &dyn CallObserver,
    ) -> Option<GeneratedFields> {
        let system = system_prompt(job_type);
        let user = rewrite_prompt(job_type, lang, fields);
        let raw = self.call_with_retry(&system, &user, observer).await.ok()?;
        parse_fields(job_type, &raw)
    }

    /// Bounded retry around one completion call, expressed as an explicit
    /// state machine: Calling → (Sleeping → Calling)* → Done | Failed.
    async fn call_with_retry(
        &self,
        system: &str,
        user: &str,
        observer: &dyn CallObserver,
    ) -> Result<String, GenerateError> {
        let mut state = CallState::Calling { attempt: 1 };
        loop {
            state = match state {
                CallState::Calling { attempt } => {
                    observer.on_attempt(attempt).await;
                    let outcome = with_timeout(
                        self.completer.complete_json(system, user),
                        self.config.timeout,
                        "generator",
                    )
                    .await;

                    match outcome {
                        // A syntactically broken body counts as one
                        // transient failure and shares the attempt budget.
                        Ok(Ok(raw)) => {
                            if serde_json::from_str::<serde_json::Value>(&raw).is_ok() {
                                CallState::Done(raw)
                            } else {
                                self.next_state(attempt, classify_unparsable_body())
                            }
                        }
                        Ok(Err(err)) => self.next_state(
                            attempt,
                            classify(
                                err.status(),
                                &err.to_string(),
                                error_name(&err),
                                err.retry_after_secs(),
                            ),
                        ),
                        Err(timeout) => self.next_state(
                            attempt,
                            classify(None, &timeout.to_string(), "CallTimeout", None),
                        ),
                    }
                }
                CallState::Sleeping { attempt, wait, reason } => {
                    observer.on_retry(wait, &reason).await;
                    tokio::time::sleep(wait).await;
                    CallState::Calling { attempt: attempt + 1 }
                }
                CallState::Done(raw) => return Ok(raw),
                CallState::Failed(user_message) => return Err(GenerateError { user_message }),
            };
        }
    }

    fn next_state(&self, attempt: u32, classification: Classification) -> CallState {
        if classification.is_transient && attempt < self.config.max_attempts {
            let wait = backoff_delay(attempt, self.config.backoff_base)
                .max(classification.retry_after.unwrap_or_default());
            CallState::Sleeping {
                attempt,
                wait,
                reason: classification.user_message,
            }
        } else {
            CallState::Failed(classification.user_message)
        }
    }
}

fn error_name(err: &GeneratorError) -> &'static str {
    match err {
        GeneratorError::Config(_) => "Config",
        GeneratorError::Network(_) => "Network",
        GeneratorError::Timeout(_) => "Timeout",
        GeneratorError::Api { .. } => "Api",
        GeneratorError::Parse(_) => "Parse",
    }
}

/// Parse the closed JSON object for the job type. Returns None when the
/// body is not JSON or the required keys are missing.
fn parse_fields(job_type: JobType, raw: &str) -> Option<GeneratedFields> {
    match job_type {
        JobType::ProductSeo | JobType::BlogSeo => serde_json::from_str::<SeoJson>(raw)
            .ok()
            .map(|f| GeneratedFields::Seo {
                title: f.seo_title,
                description: f.seo_description,
            }),
        JobType::ImageAlt => serde_json::from_str::<AltJson>(raw)
            .ok()
            .map(|f| GeneratedFields::Alt { text: f.alt_text }),
    }
}

fn field_texts(fields: &GeneratedFields) -> Vec<&str> {
    match fields {
        GeneratedFields::Seo { title, description } => vec![title, description],
        GeneratedFields::Alt { text } => vec![text],
    }
}

/// Truncate accepted fields to their configured maximums by character count.
fn truncate_fields(fields: GeneratedFields, limits: FieldLimits) -> GeneratedFields {
    match fields {
        GeneratedFields::Seo { title, description } => GeneratedFields::Seo {
            title: take_chars(&title, limits.title_max),
            description: take_chars(&description, limits.description_max),
        },
        GeneratedFields::Alt { text } => GeneratedFields::Alt {
            text: take_chars(&text, limits.alt_max),
        },
    }
}

fn take_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Language guard
// ---------------------------------------------------------------------------

const TURKISH_CHARS: &str = "çğıöşüÇĞİÖŞÜ";
const ENGLISH_TOKENS: &[&str] = &[
    "the", "and", "with", "for", "your", "our", "this", "from", "that", "shop",
];
const TURKISH_TOKENS: &[&str] = &[
    "ve", "için", "bir", "ile", "bu", "en", "da", "de", "daha", "olan",
];

/// Cheap heuristic for output in the wrong language. Only `tr` and `en`
/// have rules; anything else is conservatively accepted.
pub fn is_language_mismatch(lang: &str, texts: &[&str]) -> bool {
    let joined = texts.join(" ");
    match lang {
        "tr" => {
            let has_turkish_char = joined.chars().any(|c| TURKISH_CHARS.contains(c));
            if has_turkish_char {
                return false;
            }
            let lowered = joined.to_lowercase();
            let tokens: Vec<&str> = lowered
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .collect();
            let english = tokens.iter().filter(|t| ENGLISH_TOKENS.contains(t)).count();
            let turkish = tokens.iter().filter(|t| TURKISH_TOKENS.contains(t)).count();
            english >= 3 && turkish == 0
        }
        "en" => joined.chars().any(|c| TURKISH_CHARS.contains(c)),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn system_prompt(job_type: JobType) -> String {
    let role = match job_type {
        JobType::ProductSeo => "You write concise SEO titles and meta descriptions for online store products.",
        JobType::BlogSeo => "You write concise SEO titles and meta descriptions for blog articles.",
        JobType::ImageAlt => "You write descriptive, accessible alt text for product images.",
    };
    format!(
        "{role} You always respond with ONLY a valid JSON object and nothing else. \
         No markdown fences, no commentary."
    )
}

fn user_prompt(
    job_type: JobType,
    lang: &str,
    hints: &GenerationHints,
    payload: &TargetPayload,
    limits: FieldLimits,
) -> String {
    let mut prompt = String::new();

    match job_type {
        JobType::ProductSeo | JobType::BlogSeo => {
            let _ = writeln!(
                prompt,
                "Return ONLY valid JSON with keys \"seoTitle\" (max {} characters) and \
                 \"seoDescription\" (max {} characters).",
                limits.title_max, limits.description_max
            );
        }
        JobType::ImageAlt => {
            let _ = writeln!(
                prompt,
                "Return ONLY valid JSON with the key \"altText\" (max {} characters).",
                limits.alt_max
            );
        }
    }
    let _ = writeln!(
        prompt,
        "Write every output value strictly in the language \"{lang}\". Do not mix languages."
    );

    if let Some(brand) = &hints.brand_name {
        let _ = writeln!(prompt, "Brand: {brand}");
    }
    if let Some(tone) = &hints.tone {
        let _ = writeln!(prompt, "Tone: {tone}");
    }
    if let Some(voice) = &hints.brand_voice {
        let _ = writeln!(prompt, "Brand voice: {voice}");
    }
    if let Some(keyword) = &hints.target_keyword {
        let _ = writeln!(prompt, "Target keyword: {keyword}");
    }
    if !hints.required_keywords.is_empty() {
        let keywords: Vec<_> = hints
            .required_keywords
            .iter()
            .take(REQUIRED_KEYWORDS_MAX)
            .cloned()
            .collect();
        let _ = writeln!(prompt, "Required keywords: {}", keywords.join(", "));
    }
    if !hints.banned_words.is_empty() {
        let banned: Vec<_> = hints
            .banned_words
            .iter()
            .take(BANNED_WORDS_MAX)
            .cloned()
            .collect();
        let _ = writeln!(prompt, "Never use these words: {}", banned.join(", "));
    }
    if let Some(capitalization) = &hints.capitalization {
        let _ = writeln!(prompt, "Capitalization style: {capitalization}");
    }
    if let Some(emoji) = &hints.emoji_policy {
        let _ = writeln!(prompt, "Emoji policy: {emoji}");
    }

    match payload {
        TargetPayload::Product { title, description } => {
            let _ = writeln!(prompt, "\nProduct title: {title}");
            let _ = writeln!(prompt, "Product description:\n{}", take_chars(description, PAYLOAD_MAX_CHARS));
        }
        TargetPayload::Article { title, body } => {
            let _ = writeln!(prompt, "\nArticle title: {title}");
            let _ = writeln!(prompt, "Article body:\n{}", take_chars(body, PAYLOAD_MAX_CHARS));
        }
        TargetPayload::Image {
            product_title,
            image_url,
            current_alt,
        } => {
            let _ = writeln!(prompt, "\nProduct: {product_title}");
            if let Some(url) = image_url {
                let _ = writeln!(prompt, "Image file: {url}");
            }
            if let Some(alt) = current_alt {
                let _ = writeln!(prompt, "Current alt text: {alt}");
            }
        }
    }

    prompt
}

fn rewrite_prompt(job_type: JobType, lang: &str, fields: &GeneratedFields) -> String {
    let json = match fields {
        GeneratedFields::Seo { title, description } => serde_json::json!({
            "seoTitle": title,
            "seoDescription": description,
        }),
        GeneratedFields::Alt { text } => serde_json::json!({ "altText": text }),
    };
    let keys = match job_type {
        JobType::ProductSeo | JobType::BlogSeo => "\"seoTitle\" and \"seoDescription\"",
        JobType::ImageAlt => "\"altText\"",
    };
    format!(
        "The following JSON values are not written in \"{lang}\". Rewrite every value \
         strictly into \"{lang}\", preserving the meaning. Return ONLY valid JSON with \
         the same keys ({keys}).\n\n{json}"
    )
}
