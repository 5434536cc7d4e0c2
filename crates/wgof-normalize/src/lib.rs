//! Free-text normalizers: salary, cost of living, location, employer and dates.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wgof-normalize";

/// Index value of the reference location (Lincoln, NE).
pub const BASELINE_COST_INDEX: f64 = 100.0;

const DATE_FORMATS: [&str; 4] = ["%m/%d/%Y", "%Y-%m-%d", "%B %d, %Y", "%b %d, %Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayFrequency {
    Year,
    Month,
    Week,
    Hour,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitPhrases {
    pub year: Vec<String>,
    pub month: Vec<String>,
    pub week: Vec<String>,
    pub hour: Vec<String>,
}

impl Default for UnitPhrases {
    fn default() -> Self {
        Self {
            year: strings(&["per year", "/year", "/yr", "annually", "per annum"]),
            month: strings(&["per month", "/month", "/mo", "monthly"]),
            week: strings(&["per week", "/week", "/wk", "weekly"]),
            hour: strings(&["per hour", "/hour", "/hr", "hourly"]),
        }
    }
}

/// Values in `[min, max)` with no stated unit are assumed to be monthly
/// stipends and multiplied by 12.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonthlyBand {
    pub enabled: bool,
    pub min: f64,
    pub max: f64,
}

impl Default for MonthlyBand {
    fn default() -> Self {
        Self {
            enabled: true,
            min: 800.0,
            max: 8000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub version: u32,
    pub defeat_phrases: Vec<String>,
    pub strip_prefixes: Vec<String>,
    pub unit_phrases: UnitPhrases,
    pub hours_per_year: f64,
    pub monthly_band: MonthlyBand,
    pub remote_phrase: String,
    pub remote_sentinel: String,
    pub big_ten_fragments: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            version: 1,
            defeat_phrases: strings(&["commensurate", "negotiable", "none"]),
            strip_prefixes: strings(&["starting at"]),
            unit_phrases: UnitPhrases::default(),
            hours_per_year: 2080.0,
            monthly_band: MonthlyBand::default(),
            remote_phrase: "remote work allowed".to_string(),
            remote_sentinel: "Remote".to_string(),
            big_ten_fragments: strings(&[
                "university of illinois",
                "indiana university",
                "university of iowa",
                "university of maryland",
                "university of michigan",
                "michigan state university",
                "university of minnesota",
                "university of nebraska",
                "northwestern university",
                "ohio state university",
                "penn state university",
                "purdue university",
                "rutgers university",
                "university of wisconsin",
            ]),
        }
    }
}

impl NormalizerConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing normalizer rules")
    }
}

/// Outcome of parsing one salary string, kept whole so the heuristic's effect
/// can be traced back to the raw text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SalaryParse {
    /// Range midpoint or first amount, before any multiplier.
    pub base: f64,
    pub frequency: Option<PayFrequency>,
    pub multiplier: f64,
    pub monthly_reclassified: bool,
    pub annualized: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostOfLivingTable {
    baseline: f64,
    entries: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct CostOfLivingFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default = "default_baseline")]
    baseline: f64,
    #[serde(default)]
    entries: Vec<CostOfLivingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CostOfLivingEntry {
    state: String,
    index: f64,
}

fn default_baseline() -> f64 {
    BASELINE_COST_INDEX
}

impl Default for CostOfLivingTable {
    fn default() -> Self {
        Self {
            baseline: BASELINE_COST_INDEX,
            entries: HashMap::new(),
        }
    }
}

impl CostOfLivingTable {
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut table = Self::default();
        for (state, index) in entries {
            table.insert(state.as_ref(), index)?;
        }
        Ok(table)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: CostOfLivingFile =
            serde_yaml::from_str(text).context("parsing cost-of-living table")?;
        if !(file.baseline.is_finite() && file.baseline > 0.0) {
            bail!("cost-of-living baseline must be positive, got {}", file.baseline);
        }
        let mut table = Self {
            baseline: file.baseline,
            entries: HashMap::new(),
        };
        for entry in file.entries {
            table.insert(&entry.state, entry.index)?;
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn insert(&mut self, state: &str, index: f64) -> Result<()> {
        if !(index.is_finite() && index > 0.0) {
            bail!("cost-of-living index for {state:?} must be positive, got {index}");
        }
        self.entries.insert(state_key(state), index);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_for(&self, state: &str) -> Option<f64> {
        self.entries.get(&state_key(state)).copied()
    }

    /// `salary * (baseline / index)`, rounded to cents.
    pub fn adjust(&self, salary: Option<f64>, index: Option<f64>) -> Option<f64> {
        let salary = salary?;
        let index = index?;
        Some(((salary * (self.baseline / index)) * 100.0).round() / 100.0)
    }
}

fn state_key(state: &str) -> String {
    state.trim().to_lowercase()
}

/// Config-driven text normalizer. Immutable once built; safe to share.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    config: NormalizerConfig,
    cost_of_living: CostOfLivingTable,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(NormalizerConfig::default(), CostOfLivingTable::default())
    }
}

impl TextNormalizer {
    pub fn new(config: NormalizerConfig, cost_of_living: CostOfLivingTable) -> Self {
        Self {
            config,
            cost_of_living,
        }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn cost_of_living(&self) -> &CostOfLivingTable {
        &self.cost_of_living
    }

    /// Parse a free-text salary. `None` for blank text, a defeat phrase, or
    /// text without any amount.
    pub fn parse_salary(&self, text: &str) -> Option<SalaryParse> {
        let mut lower = text.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        if self
            .config
            .defeat_phrases
            .iter()
            .any(|phrase| lower.contains(phrase.as_str()))
        {
            return None;
        }
        for prefix in &self.config.strip_prefixes {
            if let Some(rest) = lower.strip_prefix(prefix.as_str()) {
                lower = rest.trim_start().to_string();
            }
        }

        let amounts = extract_amounts(&lower);
        let first = *amounts.first()?;
        let base = if has_word(&lower, "to") && amounts.len() >= 2 {
            (amounts[0] + amounts[1]) / 2.0
        } else {
            first
        };

        let frequency = self.detect_frequency(&lower);
        let multiplier = match frequency {
            Some(PayFrequency::Year) | None => 1.0,
            Some(PayFrequency::Month) => 12.0,
            Some(PayFrequency::Week) => 52.0,
            Some(PayFrequency::Hour) => self.config.hours_per_year,
        };
        let mut annualized = base * multiplier;

        let band = self.config.monthly_band;
        let monthly_reclassified =
            band.enabled && frequency.is_none() && annualized >= band.min && annualized < band.max;
        if monthly_reclassified {
            annualized *= 12.0;
            tracing::debug!(raw = text, annualized, "treating unlabeled salary as monthly");
        }

        Some(SalaryParse {
            base,
            frequency,
            multiplier,
            monthly_reclassified,
            annualized,
        })
    }

    pub fn annualize_salary(&self, text: &str) -> Option<f64> {
        self.parse_salary(text).map(|parsed| parsed.annualized)
    }

    fn detect_frequency(&self, lower: &str) -> Option<PayFrequency> {
        let phrases = &self.config.unit_phrases;
        [
            (PayFrequency::Year, &phrases.year),
            (PayFrequency::Month, &phrases.month),
            (PayFrequency::Week, &phrases.week),
            (PayFrequency::Hour, &phrases.hour),
        ]
        .into_iter()
        .find(|(_, list)| list.iter().any(|p| lower.contains(p.as_str())))
        .map(|(frequency, _)| frequency)
    }

    /// State or region token of a free-text location.
    pub fn extract_state(&self, location: &str) -> Option<String> {
        let loc = location.trim();
        if loc
            .to_lowercase()
            .contains(&self.config.remote_phrase.to_lowercase())
        {
            return Some(self.config.remote_sentinel.clone());
        }
        if let Some((_, inner)) = trailing_parenthetical(loc) {
            return last_comma_component(inner);
        }
        if loc.contains(',') {
            return last_comma_component(loc);
        }
        None
    }

    /// `None` when the employer is not a university at all.
    pub fn big_ten(&self, employer_name: &str) -> Option<bool> {
        let lower = employer_name.to_lowercase();
        if !lower.contains("university") {
            return None;
        }
        Some(
            self.config
                .big_ten_fragments
                .iter()
                .any(|fragment| lower.contains(&fragment.to_lowercase())),
        )
    }

    pub fn cost_index_for(&self, state: Option<&str>) -> Option<f64> {
        self.cost_of_living.index_for(state?)
    }

    pub fn adjust_salary(&self, annualized: Option<f64>, index: Option<f64>) -> Option<f64> {
        self.cost_of_living.adjust(annualized, index)
    }
}

/// Split `"Name (Type)"` into its parts.
pub fn parse_employer(employer: &str) -> (String, Option<String>) {
    let employer = employer.trim();
    match trailing_parenthetical(employer) {
        Some((name, kind)) => (name.trim().to_string(), text_or_none(kind)),
        None => (employer.to_string(), None),
    }
}

pub fn parse_posting_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

/// `("Auburn University ", "Alabama")` for `"Auburn University (Alabama)"`.
fn trailing_parenthetical(text: &str) -> Option<(&str, &str)> {
    let body = text.trim_end().strip_suffix(')')?;
    let open = body.rfind('(')?;
    let inner = &body[open + 1..];
    if inner.trim().is_empty() {
        return None;
    }
    Some((&body[..open], inner))
}

fn last_comma_component(text: &str) -> Option<String> {
    text.rsplit(',').next().and_then(text_or_none)
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn has_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

/// Amounts in reading order: `$25,000` is one token, `2.5` keeps its
/// fraction, and a trailing `k` scales by 1000.
fn extract_amounts(text: &str) -> Vec<f64> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;

    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        let next_is_digit = chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
        if ch == ',' && !current.is_empty() && !seen_dot && next_is_digit {
            continue;
        }
        if ch == '.' && !current.is_empty() && !seen_dot && next_is_digit {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            let thousands = matches!(ch, 'k' | 'K')
                && !chars.get(i + 1).is_some_and(|c| c.is_alphanumeric());
            push_amount(&mut out, &current, thousands);
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        push_amount(&mut out, &current, false);
    }
    out
}

fn push_amount(out: &mut Vec<f64>, token: &str, thousands: bool) {
    if let Ok(value) = token.parse::<f64>() {
        out.push(if thousands { value * 1000.0 } else { value });
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
