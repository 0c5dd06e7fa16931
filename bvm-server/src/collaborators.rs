//! External collaborator seams for the job runner
//!
//! The scraper, answer providers, brand matcher, run store and credits ledger
//! are consumed through these traits only; the runner never sees their
//! internals. In-memory adapters back tests and the default demo wiring.

use async_trait::async_trait;
use bvm_common::api::RunRecord;
use bvm_common::events::Sentiment;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// What the scraper learned about the target site
#[derive(Debug, Clone)]
pub struct ScrapedSite {
    /// Brand name identified for the target
    pub brand: String,
    pub description: String,
    /// Topic keywords, used for competitor discovery and prompt generation
    pub keywords: Vec<String>,
}

/// Scrapes the target site (internals out of scope)
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, target: &str) -> anyhow::Result<ScrapedSite>;
}

/// One answer from a provider, with token accounting
#[derive(Debug, Clone)]
pub struct ProviderAnswer {
    pub text: String,
    pub tokens: u64,
}

/// An independent AI answer provider (client internals out of scope)
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn ask(&self, prompt: &str, use_web_search: bool) -> anyhow::Result<ProviderAnswer>;
}

/// Brand-mention verdict returned by the matcher black box
#[derive(Debug, Clone)]
pub struct BrandMention {
    pub mentioned: bool,
    /// Byte offset of the first mention in the answer text
    pub first_index: Option<usize>,
    pub sentiment: Sentiment,
    pub confidence: f64,
}

/// Textual brand-mention matcher (consumed as a black box)
pub trait BrandMatcher: Send + Sync {
    fn find_mention(&self, brand: &str, text: &str) -> BrandMention;
}

/// Durable store for completed/failed run records
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, record: &RunRecord) -> anyhow::Result<()>;
    async fn load_run(&self, run_id: Uuid) -> anyhow::Result<Option<RunRecord>>;
}

/// Usage/credits ledger; the core only triggers debits and re-reads balances
#[async_trait]
pub trait CreditsLedger: Send + Sync {
    async fn debit(&self, actor: &str, reason: &str, amount: i64) -> anyhow::Result<()>;
    async fn balance(&self, actor: &str) -> anyhow::Result<i64>;
}

// ============================================================================
// Default adapters
// ============================================================================

/// Scraper backed by a plain HTTP GET of the target's front page
///
/// Brand is taken from the `<title>` element, keywords from the meta keywords
/// tag when present. Good enough for the demo wiring; production deployments
/// plug in a real crawler behind the same trait.
pub struct HttpScraper {
    client: reqwest::Client,
}

impl HttpScraper {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bvm-server/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, target: &str) -> anyhow::Result<ScrapedSite> {
        let url = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("https://{}", target)
        };
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let brand = extract_tag(&body, "<title>", "</title>")
            .map(|t| t.split(['|', '-']).next().unwrap_or(&t).trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| target.to_string());
        let keywords = extract_meta_keywords(&body);
        let description = extract_meta_content(&body, "description").unwrap_or_default();

        debug!(target, brand = %brand, keyword_count = keywords.len(), "Scrape finished");
        Ok(ScrapedSite {
            brand,
            description,
            keywords,
        })
    }
}

fn extract_tag(html: &str, open: &str, close: &str) -> Option<String> {
    let start = html.find(open)? + open.len();
    let end = html[start..].find(close)? + start;
    Some(html[start..end].trim().to_string())
}

fn extract_meta_content(html: &str, name: &str) -> Option<String> {
    let marker = format!("name=\"{}\"", name);
    let pos = html.find(&marker)?;
    let tail = &html[pos..];
    let content = tail.find("content=\"")? + "content=\"".len();
    let end = tail[content..].find('"')? + content;
    Some(tail[content..end].trim().to_string())
}

fn extract_meta_keywords(html: &str) -> Vec<String> {
    extract_meta_content(html, "keywords")
        .map(|raw| {
            raw.split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Deterministic provider answering from a fixed script
///
/// Used by tests and the out-of-the-box demo wiring; real provider clients
/// implement [`AnswerProvider`] elsewhere.
pub struct CannedProvider {
    name: String,
    /// Brands woven into every answer, in this order
    brands: Vec<String>,
    /// When set, every ask fails with this message
    failure: Option<String>,
}

impl CannedProvider {
    pub fn new(name: impl Into<String>, brands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            brands,
            failure: None,
        }
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brands: Vec::new(),
            failure: Some(message.into()),
        }
    }
}

#[async_trait]
impl AnswerProvider for CannedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ask(&self, prompt: &str, _use_web_search: bool) -> anyhow::Result<ProviderAnswer> {
        if let Some(message) = &self.failure {
            anyhow::bail!("{}", message.clone());
        }
        let mut text = format!("For \"{}\", commonly recommended options are: ", prompt);
        for (i, brand) in self.brands.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            text.push_str(brand);
        }
        text.push('.');
        let tokens = (text.len() / 4) as u64;
        Ok(ProviderAnswer { text, tokens })
    }
}

/// Case-insensitive matcher over generated brand-name variations
///
/// Variations: the name as-is, lowercased, spaces collapsed, and hyphenated.
/// Sentiment is judged from a small word list in a window around the first
/// mention; confidence reflects which variation hit.
pub struct KeywordMatcher;

const POSITIVE_WORDS: &[&str] = &["best", "excellent", "recommended", "leading", "great", "top"];
const NEGATIVE_WORDS: &[&str] = &["avoid", "worst", "poor", "outdated", "buggy", "expensive"];

impl KeywordMatcher {
    fn variations(brand: &str) -> Vec<(String, f64)> {
        let lower = brand.to_lowercase();
        let mut variations = vec![(lower.clone(), 1.0)];
        if lower.contains(' ') {
            variations.push((lower.replace(' ', ""), 0.8));
            variations.push((lower.replace(' ', "-"), 0.8));
        }
        variations
    }
}

impl BrandMatcher for KeywordMatcher {
    fn find_mention(&self, brand: &str, text: &str) -> BrandMention {
        let haystack = text.to_lowercase();
        let mut hit: Option<(usize, f64)> = None;
        for (variation, confidence) in Self::variations(brand) {
            if let Some(index) = haystack.find(&variation) {
                match hit {
                    Some((best, _)) if best <= index => {}
                    _ => hit = Some((index, confidence)),
                }
            }
        }

        let Some((index, confidence)) = hit else {
            return BrandMention {
                mentioned: false,
                first_index: None,
                sentiment: Sentiment::Neutral,
                confidence: 1.0,
            };
        };

        // Judge sentiment from the sentence-ish window around the mention,
        // snapping both bounds outward to char boundaries
        let mut window_start = index.saturating_sub(80);
        while !haystack.is_char_boundary(window_start) {
            window_start -= 1;
        }
        let mut window_end = (index + 80).min(haystack.len());
        while !haystack.is_char_boundary(window_end) {
            window_end += 1;
        }
        let window = &haystack[window_start..window_end];
        let positive = POSITIVE_WORDS.iter().any(|w| window.contains(w));
        let negative = NEGATIVE_WORDS.iter().any(|w| window.contains(w));
        let sentiment = match (positive, negative) {
            (true, false) => Sentiment::Positive,
            (false, true) => Sentiment::Negative,
            _ => Sentiment::Neutral,
        };

        BrandMention {
            mentioned: true,
            first_index: Some(index),
            sentiment,
            confidence,
        }
    }
}

/// In-memory run store
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        self.runs
            .write()
            .await
            .insert(record.run_id, record.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> anyhow::Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }
}

/// One debit recorded by the in-memory ledger
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub actor: String,
    pub reason: String,
    pub amount: i64,
    pub at: DateTime<Utc>,
}

/// In-memory credits ledger with a configurable starting balance
pub struct InMemoryLedger {
    starting_balance: i64,
    balances: RwLock<HashMap<String, i64>>,
    entries: RwLock<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new(starting_balance: i64) -> Arc<Self> {
        Arc::new(Self {
            starting_balance,
            balances: RwLock::new(HashMap::new()),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// All recorded debits, for inspection in tests
    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl CreditsLedger for InMemoryLedger {
    async fn debit(&self, actor: &str, reason: &str, amount: i64) -> anyhow::Result<()> {
        let mut balances = self.balances.write().await;
        let balance = balances
            .entry(actor.to_string())
            .or_insert(self.starting_balance);
        *balance -= amount;
        self.entries.write().await.push(LedgerEntry {
            actor: actor.to_string(),
            reason: reason.to_string(),
            amount,
            at: Utc::now(),
        });
        debug!(actor, reason, amount, balance = *balance, "Credits debited");
        Ok(())
    }

    async fn balance(&self, actor: &str) -> anyhow::Result<i64> {
        Ok(self
            .balances
            .read()
            .await
            .get(actor)
            .copied()
            .unwrap_or(self.starting_balance))
    }
}
