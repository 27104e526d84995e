//! Source adapter contracts + extraction and normalization for each source.
//!
//! Adapters know how to fetch one source and turn its raw payload into
//! validated records. They hold no storage state and never see prior
//! snapshots; reconciliation happens downstream in the sync pipeline.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use hsw_core::{
    hub_allocation_id, slugify, AllocationStatus, AllocationUpsert, DeliveryBatchUpsert,
    DeliveryStatus,
};
use hsw_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hsw-adapters";

/// Hub selection rounds with their announcement dates.
const ROUND_ANNOUNCEMENTS: [(u8, &str); 2] = [(1, "2025-04-09"), (2, "2025-08-26")];

/// Fragments matching any of these are navigation/boilerplate, not recipients.
const FRAGMENT_DENYLIST: [&str; 3] = ["round", "commitment", "published"];

/// Tokens that mark a fragment as naming a corporate entity.
const COMPANY_TOKENS: [&str; 8] = [
    "Inc", "LLC", "Corp", "Ltd", "Company", "Nuclear", "Power", "Energy",
];

/// Generic allocation that investor-news delivery batches hang off.
const NEWS_PROGRAM_ALLOCATION_ID: &str = "centrus-haleu-program";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural failure of a whole payload. Individual dirty records never
/// raise this; they are silently excluded by the normalizers instead.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed {kind} payload ({detail}): {excerpt:?}")]
    Structural {
        kind: &'static str,
        detail: String,
        excerpt: String,
    },
}

impl ParseError {
    fn structural(kind: &'static str, detail: impl Into<String>, payload: &str) -> Self {
        Self::Structural {
            kind,
            detail: detail.into(),
            excerpt: excerpt(payload),
        }
    }
}

fn excerpt(payload: &str) -> String {
    let trimmed = payload.trim();
    let cut = trimmed
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..cut].to_string()
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// One normalized batch out of a single source snapshot. Most sources fill
/// only one side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBatch {
    pub allocations: Vec<AllocationUpsert>,
    pub deliveries: Vec<DeliveryBatchUpsert>,
}

impl ParsedBatch {
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty() && self.deliveries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IngestContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub workspace_root: PathBuf,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    /// Actor string stamped on change events produced from this source.
    fn actor(&self) -> &'static str;
    fn kind(&self) -> &'static str;
    fn display_url(&self) -> String;
    fn snapshot_ext(&self) -> &'static str;

    async fn fetch(&self, http: &HttpFetcher, ctx: &IngestContext) -> Result<String, AdapterError>;

    fn parse(&self, raw: &str) -> Result<ParsedBatch, ParseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    Fetch,
    Fixture,
    Manual,
}

/// One entry of the `sources.yaml` registry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: IngestMode,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn adapter_for_source(spec: &SourceSpec) -> Option<Box<dyn SourceAdapter>> {
    match spec.source_id.as_str() {
        "doe-allocations" => Some(Box::new(FixtureFeedAdapter {
            path: spec
                .path
                .clone()
                .unwrap_or_else(|| "fixtures/doe-allocations.csv".to_string()),
        })),
        "doe-hub" => Some(Box::new(HubPageAdapter {
            url: spec.url.clone().unwrap_or_else(|| {
                "https://www.energy.gov/ne/us-department-energy-haleu-allocation-process"
                    .to_string()
            }),
        })),
        "centrus-news" => Some(Box::new(InvestorNewsAdapter {
            url: spec
                .url
                .clone()
                .unwrap_or_else(|| "https://investors.centrusenergy.com/news-releases".to_string()),
        })),
        "doe-press" => Some(Box::new(PressDocumentAdapter {
            path: spec
                .path
                .clone()
                .unwrap_or_else(|| "manual/doe-press/allocation-process.txt".to_string()),
        })),
        _ => None,
    }
}

async fn read_workspace_file(ctx: &IngestContext, rel: &str) -> Result<String, AdapterError> {
    let path = ctx.workspace_root.join(rel);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| AdapterError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Fixture feed of structured allocation rows, standing in for a future
/// machine-readable upstream feed.
#[derive(Debug, Clone)]
struct FixtureFeedAdapter {
    path: String,
}

#[async_trait]
impl SourceAdapter for FixtureFeedAdapter {
    fn source_id(&self) -> &'static str {
        "doe-allocations"
    }

    fn actor(&self) -> &'static str {
        "ingest/doe-allocations"
    }

    fn kind(&self) -> &'static str {
        "regulator"
    }

    fn display_url(&self) -> String {
        self.path.clone()
    }

    fn snapshot_ext(&self) -> &'static str {
        "csv"
    }

    async fn fetch(&self, _http: &HttpFetcher, ctx: &IngestContext) -> Result<String, AdapterError> {
        read_workspace_file(ctx, &self.path).await
    }

    fn parse(&self, raw: &str) -> Result<ParsedBatch, ParseError> {
        Ok(ParsedBatch {
            allocations: parse_allocations_csv(raw)?,
            deliveries: Vec::new(),
        })
    }
}

/// Live hub page listing conditional selections per allocation round.
#[derive(Debug, Clone)]
struct HubPageAdapter {
    url: String,
}

#[async_trait]
impl SourceAdapter for HubPageAdapter {
    fn source_id(&self) -> &'static str {
        "doe-hub"
    }

    fn actor(&self) -> &'static str {
        "cron/doe-hub"
    }

    fn kind(&self) -> &'static str {
        "regulator"
    }

    fn display_url(&self) -> String {
        self.url.clone()
    }

    fn snapshot_ext(&self) -> &'static str {
        "html"
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &IngestContext) -> Result<String, AdapterError> {
        let fetched = http
            .fetch_text(ctx.run_id, self.source_id(), &self.url)
            .await?;
        info!(
            source_id = self.source_id(),
            url = %fetched.final_url,
            size = fetched.body.len(),
            "hub page fetched"
        );
        Ok(fetched.body)
    }

    fn parse(&self, raw: &str) -> Result<ParsedBatch, ParseError> {
        report_new_press_releases(raw, &known_press_releases());
        let selections = extract_hub_selections(raw)?;
        Ok(ParsedBatch {
            allocations: normalize_hub_selections(&selections),
            deliveries: Vec::new(),
        })
    }
}

/// Investor news page mined for delivery announcements.
#[derive(Debug, Clone)]
struct InvestorNewsAdapter {
    url: String,
}

#[async_trait]
impl SourceAdapter for InvestorNewsAdapter {
    fn source_id(&self) -> &'static str {
        "centrus-news"
    }

    fn actor(&self) -> &'static str {
        "ingest/centrus-news"
    }

    fn kind(&self) -> &'static str {
        "vendor"
    }

    fn display_url(&self) -> String {
        self.url.clone()
    }

    fn snapshot_ext(&self) -> &'static str {
        "html"
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &IngestContext) -> Result<String, AdapterError> {
        let fetched = http
            .fetch_text(ctx.run_id, self.source_id(), &self.url)
            .await?;
        Ok(fetched.body)
    }

    fn parse(&self, raw: &str) -> Result<ParsedBatch, ParseError> {
        let items = extract_news_items(raw)?;
        Ok(ParsedBatch {
            allocations: Vec::new(),
            deliveries: normalize_news_items(&items),
        })
    }
}

/// Pre-extracted text of the allocation process document. Text extraction
/// from the PDF itself is an upstream concern; this adapter consumes the
/// plain-text result dropped into the manual directory.
#[derive(Debug, Clone)]
struct PressDocumentAdapter {
    path: String,
}

#[async_trait]
impl SourceAdapter for PressDocumentAdapter {
    fn source_id(&self) -> &'static str {
        "doe-press"
    }

    fn actor(&self) -> &'static str {
        "ingest/doe-press"
    }

    fn kind(&self) -> &'static str {
        "press"
    }

    fn display_url(&self) -> String {
        self.path.clone()
    }

    fn snapshot_ext(&self) -> &'static str {
        "txt"
    }

    async fn fetch(&self, _http: &HttpFetcher, ctx: &IngestContext) -> Result<String, AdapterError> {
        read_workspace_file(ctx, &self.path).await
    }

    fn parse(&self, raw: &str) -> Result<ParsedBatch, ParseError> {
        Ok(parse_press_text(raw))
    }
}

// ---------------------------------------------------------------------------
// Delimited feed normalization
// ---------------------------------------------------------------------------

/// Parse the delimited allocation feed. Columns are mapped by header name;
/// a row is accepted only when identifier, recipient, a positive quantity,
/// and a known status are all present. Everything else is dropped without
/// raising — upstream data is dirty and that is tolerated here.
pub fn parse_allocations_csv(raw: &str) -> Result<Vec<AllocationUpsert>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| ParseError::structural("csv", err.to_string(), raw))?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h == name);

    let (Some(id_col), Some(recipient_col), Some(kg_col), Some(status_col)) = (
        column("id"),
        column("allocated_to"),
        column("kg"),
        column("status"),
    ) else {
        return Err(ParseError::structural(
            "csv",
            "missing required headers id/allocated_to/kg/status",
            raw,
        ));
    };
    let date_col = column("allocation_date");
    let window_start_col = column("delivery_window_start");
    let window_end_col = column("delivery_window_end");
    let notes_col = column("notes");
    let source_doc_col = column("source_doc_id");

    let mut out = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else { continue };
        let field = |col: Option<usize>| {
            col.and_then(|idx| record.get(idx))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let Some(id) = field(Some(id_col)) else { continue };
        let Some(recipient) = field(Some(recipient_col)) else { continue };
        let kg = field(Some(kg_col))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        if kg <= 0.0 {
            continue;
        }
        let Some(status) = field(Some(status_col)).and_then(|v| v.parse::<AllocationStatus>().ok())
        else {
            continue;
        };

        out.push(AllocationUpsert {
            id: id.to_string(),
            allocated_to: recipient.to_string(),
            kg,
            status,
            allocation_date: field(date_col).and_then(parse_epoch_seconds),
            delivery_window_start: field(window_start_col).and_then(parse_epoch_seconds),
            delivery_window_end: field(window_end_col).and_then(parse_epoch_seconds),
            notes: field(notes_col).map(str::to_string),
            source_doc_id: field(source_doc_col).map(str::to_string),
        });
    }
    Ok(out)
}

fn parse_epoch_seconds(value: &str) -> Option<DateTime<Utc>> {
    let secs = value.parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

// ---------------------------------------------------------------------------
// Hub page extraction + normalization
// ---------------------------------------------------------------------------

/// One candidate list-item fragment under a round heading.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSelection {
    pub round: u8,
    pub announced_on: NaiveDate,
    pub text: String,
}

fn selector(expr: &'static str) -> Result<Selector, ParseError> {
    Selector::parse(expr)
        .map_err(|err| ParseError::structural("html", format!("selector {expr}: {err}"), expr))
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

/// Walk headings and list items in document order, attributing each list
/// item to the most recent round-selection heading.
pub fn extract_hub_selections(html: &str) -> Result<Vec<HubSelection>, ParseError> {
    let document = Html::parse_document(html);
    let walk = selector("h2, h3, h4, h5, h6, li")?;

    let mut current: Option<(u8, NaiveDate)> = None;
    let mut selections = Vec::new();

    for el in document.select(&walk) {
        let name = el.value().name();
        let text = collapse_whitespace(&element_text(&el));
        if name.starts_with('h') {
            current = round_for_heading(&text);
            continue;
        }
        if let Some((round, announced_on)) = current {
            if !text.is_empty() {
                selections.push(HubSelection {
                    round,
                    announced_on,
                    text,
                });
            }
        }
    }
    Ok(selections)
}

fn round_for_heading(text: &str) -> Option<(u8, NaiveDate)> {
    if !text.contains("Selection") {
        return None;
    }
    ROUND_ANNOUNCEMENTS.iter().find_map(|(round, date)| {
        if text.contains(&format!("Round {round}")) {
            let announced_on = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
            Some((*round, announced_on))
        } else {
            None
        }
    })
}

/// Heuristic filter deciding whether a fragment names an eligible recipient,
/// and if so, building the canonical allocation record for it. Borderline
/// fragments are rejected by exclusion, never by error.
pub fn normalize_hub_selections(selections: &[HubSelection]) -> Vec<AllocationUpsert> {
    let mut out = Vec::new();
    for sel in selections {
        let text = collapse_whitespace(&sel.text);
        if text.len() <= 3 || text.len() >= 100 {
            continue;
        }
        let lower = text.to_ascii_lowercase();
        if FRAGMENT_DENYLIST.iter().any(|word| lower.contains(word)) {
            continue;
        }
        let (recipient, quantity) = split_recipient_and_quantity(&text);
        if recipient.is_empty() || !looks_like_company(&recipient) {
            continue;
        }
        let Some(kg) = quantity else { continue };

        out.push(AllocationUpsert {
            id: hub_allocation_id(sel.round, &recipient),
            allocated_to: recipient,
            kg,
            status: AllocationStatus::Conditional,
            allocation_date: sel.announced_on.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            delivery_window_start: None,
            delivery_window_end: None,
            notes: Some(format!(
                "DOE Round {} conditional selection (parsed from hub page)",
                sel.round
            )),
            source_doc_id: Some("doe-hub".to_string()),
        });
    }
    out
}

fn looks_like_company(name: &str) -> bool {
    COMPANY_TOKENS.iter().any(|token| name.contains(token))
        || name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Separate a trailing parenthesized quantity from the recipient name:
/// `X-energy, LLC (1,200 kg)` -> (`X-energy, LLC`, Some(1200.0)). When no
/// parenthesized amount exists the whole text is scanned instead.
fn split_recipient_and_quantity(text: &str) -> (String, Option<f64>) {
    if let Some(open) = text.rfind('(') {
        if let Some(close_rel) = text[open..].find(')') {
            let inner = &text[open + 1..open + close_rel];
            if let Some(kg) = scan_quantity_kg(inner) {
                let recipient = collapse_whitespace(&text[..open]);
                return (recipient.trim_matches([',', ';']).trim().to_string(), Some(kg));
            }
        }
    }
    (text.trim().to_string(), scan_quantity_kg(text))
}

// ---------------------------------------------------------------------------
// Press release detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PressReleaseLink {
    pub url: String,
    pub date_text: String,
    pub normalized_date: String,
}

/// Announcement dates we have already processed.
pub fn known_press_releases() -> HashSet<String> {
    ["april-9-2025", "august-26-2025"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Find press-release anchors in the announcements section and normalize
/// their publication dates for comparison.
pub fn detect_press_releases(html: &str) -> Vec<PressReleaseLink> {
    let Ok(anchors) = selector("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut found = Vec::new();

    for anchor in document.select(&anchors) {
        let text = collapse_whitespace(&element_text(&anchor));
        let lower = text.to_ascii_lowercase();
        if !lower.contains("press release") {
            continue;
        }
        let Some(published_idx) = lower.find("published") else {
            continue;
        };
        let date_text = text[published_idx + "published".len()..]
            .trim()
            .trim_end_matches('.')
            .to_string();
        if date_text.is_empty() {
            continue;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("https://www.energy.gov{href}")
        };
        let normalized_date = date_text
            .to_ascii_lowercase()
            .replace(',', "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        found.push(PressReleaseLink {
            url,
            date_text,
            normalized_date,
        });
    }
    found
}

/// Log any press release we have not seen before; these are the trigger for
/// manually onboarding a new allocation round.
pub fn report_new_press_releases(html: &str, known: &HashSet<String>) -> Vec<PressReleaseLink> {
    let found = detect_press_releases(html);
    let fresh: Vec<PressReleaseLink> = found
        .iter()
        .filter(|link| !known.contains(&link.normalized_date))
        .cloned()
        .collect();
    for link in &fresh {
        warn!(url = %link.url, published = %link.date_text, "new press release detected");
    }
    info!(
        total = found.len(),
        new = fresh.len(),
        "press release check completed"
    );
    fresh
}

// ---------------------------------------------------------------------------
// Investor news extraction + normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NewsItem {
    pub title: String,
    pub body: String,
    pub published_on: Option<NaiveDate>,
}

pub fn extract_news_items(html: &str) -> Result<Vec<NewsItem>, ParseError> {
    let containers = selector(".news-item, .press-release, article, .release-item")?;
    let titles = selector("h1, h2, h3, h4, .title, .headline")?;
    let dates = selector(".date, .published, time")?;

    let document = Html::parse_document(html);
    let mut items = Vec::new();
    for container in document.select(&containers) {
        let title = container
            .select(&titles)
            .next()
            .map(|el| collapse_whitespace(&element_text(&el)))
            .unwrap_or_default();
        let published_on = container
            .select(&dates)
            .next()
            .map(|el| collapse_whitespace(&element_text(&el)))
            .and_then(|text| parse_flexible_date(&text));
        let body = collapse_whitespace(&element_text(&container));
        if title.is_empty() && body.is_empty() {
            continue;
        }
        items.push(NewsItem {
            title,
            body,
            published_on,
        });
    }
    Ok(items)
}

fn news_is_relevant(content: &str) -> bool {
    content.contains("haleu")
        || content.contains("low-enriched uranium")
        || content.contains("phase iii")
        || (content.contains("production") && content.contains("uranium"))
}

/// Turn relevant news items into delivery batch records. Items without a
/// parseable positive quantity are excluded; ids never derive from the wall
/// clock so repeated parses of one page collide to the same batch.
pub fn normalize_news_items(items: &[NewsItem]) -> Vec<DeliveryBatchUpsert> {
    let mut out = Vec::new();
    for item in items {
        let content = format!("{} {}", item.title, item.body).to_ascii_lowercase();
        if !news_is_relevant(&content) {
            continue;
        }
        let Some(kg) = scan_quantity_kg(&content) else {
            continue;
        };

        let published_at = item
            .published_on
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
        let (status, shipped_at, received_at) = if content.contains("delivered") {
            (DeliveryStatus::Received, None, published_at)
        } else if content.contains("shipped") {
            (DeliveryStatus::Shipped, published_at, None)
        } else {
            (DeliveryStatus::Planned, None, None)
        };

        let date_part = item
            .published_on
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "undated".to_string());
        let mut title_slug = slugify(&item.title);
        title_slug.truncate(50);

        out.push(DeliveryBatchUpsert {
            id: format!("centrus-{date_part}-{}", title_slug.trim_matches('-')),
            allocation_id: NEWS_PROGRAM_ALLOCATION_ID.to_string(),
            kg,
            status,
            shipped_at,
            received_at,
            notes: Some(format!("{} (from investor news)", item.title)),
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Press document text normalization
// ---------------------------------------------------------------------------

/// Mine pre-extracted document text for cumulative enrichment milestones
/// (`N MT by <date>`) and for recipients named with a corporate suffix near
/// an allocation verb.
pub fn parse_press_text(text: &str) -> ParsedBatch {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut deliveries = Vec::new();
    let mut allocations = Vec::new();
    let mut seen_ids = HashSet::new();

    for (i, token) in tokens.iter().enumerate() {
        // Milestone shape: "8 MT by December 31, 2025".
        if let Some(mt) = parse_amount(token) {
            if tokens
                .get(i + 1)
                .is_some_and(|t| t.trim_matches([',', ';', '.']).eq_ignore_ascii_case("mt"))
                && tokens.get(i + 2).is_some_and(|t| t.eq_ignore_ascii_case("by"))
            {
                if let Some(due) = parse_date_tokens(&tokens[i + 3..]) {
                    let id = format!("doe-milestone-{}", due.format("%Y-%m-%d"));
                    if seen_ids.insert(id.clone()) {
                        deliveries.push(DeliveryBatchUpsert {
                            id,
                            allocation_id: "doe-enrichment-program".to_string(),
                            kg: mt * 1000.0,
                            status: DeliveryStatus::Planned,
                            shipped_at: None,
                            received_at: None,
                            notes: Some(format!(
                                "Cumulative enrichment milestone due {} (from allocation process document)",
                                due.format("%B %d, %Y")
                            )),
                        });
                    }
                }
            }
        }

        // Recipient shape: "... allocated to Ultra Safe Nuclear Corp ...".
        let cleaned = token.trim_matches([',', ';', '.', ')']);
        if COMPANY_TOKENS[..5].contains(&cleaned) {
            let start = company_name_start(&tokens, i);
            if !preceded_by_allocation_verb(&tokens, start) {
                continue;
            }
            let name = tokens[start..=i]
                .join(" ")
                .trim_matches([',', ';', '.'])
                .to_string();
            let window_start = start.saturating_sub(8);
            let window_end = (i + 8).min(tokens.len());
            let Some(kg) = scan_quantity_kg(&tokens[window_start..window_end].join(" ")) else {
                continue;
            };
            let id = format!("doe-pdf-{}", slugify(&name));
            if seen_ids.insert(id.clone()) {
                allocations.push(AllocationUpsert {
                    id,
                    allocated_to: name,
                    kg,
                    status: AllocationStatus::Conditional,
                    allocation_date: None,
                    delivery_window_start: None,
                    delivery_window_end: None,
                    notes: Some("Named in the allocation process document".to_string()),
                    source_doc_id: Some("doe-press".to_string()),
                });
            }
        }
    }

    ParsedBatch {
        allocations,
        deliveries,
    }
}

fn company_name_start(tokens: &[&str], suffix_idx: usize) -> usize {
    let mut start = suffix_idx;
    while start > 0 {
        let raw = tokens[start - 1];
        // A sentence boundary always ends the name.
        if raw.ends_with('.') || raw.ends_with(';') {
            break;
        }
        let prev = raw.trim_matches([',', '(']);
        let keeps_name = prev.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            || prev == "&"
            || prev.eq_ignore_ascii_case("of");
        if !keeps_name || suffix_idx - (start - 1) > 5 {
            break;
        }
        start -= 1;
    }
    start
}

fn preceded_by_allocation_verb(tokens: &[&str], name_start: usize) -> bool {
    let window_start = name_start.saturating_sub(4);
    tokens[window_start..name_start].iter().any(|t| {
        let lower = t.to_ascii_lowercase();
        lower.starts_with("allocat") || lower.starts_with("award") || lower.starts_with("select")
    })
}

// ---------------------------------------------------------------------------
// Shared text helpers
// ---------------------------------------------------------------------------

pub fn collapse_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_amount(token: &str) -> Option<f64> {
    let cleaned: String = token
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() || cleaned.len() != token.replace(',', "").len() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// Scan free text for a quantity with a mass unit. Metric tons convert to
/// kilograms; the first match wins.
pub fn scan_quantity_kg(text: &str) -> Option<f64> {
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .collect();

    for (i, token) in tokens.iter().enumerate() {
        // Joined form: "900kg".
        let lower = token.trim_matches([',', ';', '.']).to_ascii_lowercase();
        if let Some(prefix) = lower.strip_suffix("kg") {
            if let Some(value) = parse_amount(prefix) {
                return Some(value);
            }
        }

        // Separated form: "900 kg" / "2.5 MT".
        let Some(value) = parse_amount(token) else {
            continue;
        };
        let Some(unit) = tokens.get(i + 1) else {
            continue;
        };
        match unit.trim_matches([',', ';', '.']).to_ascii_lowercase().as_str() {
            "kg" | "kgs" | "kilograms" => return Some(value),
            "mt" | "tonnes" => return Some(value * 1000.0),
            _ => {}
        }
    }
    None
}

fn parse_flexible_date(text: &str) -> Option<NaiveDate> {
    let cleaned = collapse_whitespace(text);
    let cleaned = cleaned.trim_matches(['.', ',']);
    const FORMATS: [&str; 5] = ["%B %d, %Y", "%b %d, %Y", "%B %d %Y", "%Y-%m-%d", "%m/%d/%Y"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
}

/// Join date tokens following "by" until one carries the year, then parse.
fn parse_date_tokens(tokens: &[&str]) -> Option<NaiveDate> {
    let mut collected = Vec::new();
    for token in tokens.iter().take(4) {
        let trimmed = token.trim_matches([';', ':']);
        collected.push(trimmed.trim_end_matches('.'));
        let digits: String = trimmed
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if digits.len() == 4 {
            return parse_flexible_date(&collected.join(" "));
        }
    }
    None
}
