//! Merge orchestration: rule loading, annotation, reconciliation and persistence.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;
use wgof_classify::{ClassifierConfig, DisciplineClassifier, DisciplineConfig, GraduateClassifier};
use wgof_core::{MergeStats, Posting, ReviewPriority};
use wgof_normalize::{parse_employer, parse_posting_date, CostOfLivingTable, NormalizerConfig, TextNormalizer};
use wgof_storage::{
    load_document, read_metadata, write_json_atomic, HistoricalStore, LoadedDocument, StoreDocument,
    StoreMetadata,
};

pub const CRATE_NAME: &str = "wgof-sync";

pub const DEFAULT_COMPLETENESS_MARGIN: f64 = 0.10;
pub const REVIEW_QUEUE_FILE: &str = "positions_for_review.json";

pub const CLASSIFIER_RULES: &str = "classifier.yaml";
pub const DISCIPLINE_RULES: &str = "disciplines.yaml";
pub const NORMALIZER_RULES: &str = "normalizers.yaml";
pub const COST_OF_LIVING_RULES: &str = "cost_of_living.yaml";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub completeness_margin: f64,
    pub include_verified: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("WGOF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            rules_dir: std::env::var("WGOF_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules")),
            completeness_margin: std::env::var("WGOF_COMPLETENESS_MARGIN")
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|m| m.is_finite() && *m >= 0.0)
                .unwrap_or(DEFAULT_COMPLETENESS_MARGIN),
            include_verified: std::env::var("WGOF_INCLUDE_VERIFIED")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
        }
    }

    pub fn new(data_dir: impl Into<PathBuf>, rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            rules_dir: rules_dir.into(),
            completeness_margin: DEFAULT_COMPLETENESS_MARGIN,
            include_verified: true,
        }
    }
}

/// Every rule file, already parsed. Missing files fall back to the built-in
/// defaults; malformed ones are errors.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub classifier: ClassifierConfig,
    pub disciplines: DisciplineConfig,
    pub normalizers: NormalizerConfig,
    pub cost_of_living: CostOfLivingTable,
}

impl RuleSet {
    pub fn load(rules_dir: &Path) -> Result<Self> {
        let cost_path = rules_dir.join(COST_OF_LIVING_RULES);
        let cost_of_living = match read_optional(&cost_path)? {
            Some(text) => CostOfLivingTable::from_yaml_str(&text)
                .with_context(|| format!("loading {}", cost_path.display()))?,
            None => CostOfLivingTable::default(),
        };
        Ok(Self {
            classifier: load_rule_file(&rules_dir.join(CLASSIFIER_RULES))?,
            disciplines: load_rule_file(&rules_dir.join(DISCIPLINE_RULES))?,
            normalizers: load_rule_file(&rules_dir.join(NORMALIZER_RULES))?,
            cost_of_living,
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "rule file not found; using built-in defaults");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

fn load_rule_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match read_optional(path)? {
        Some(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        None => Ok(T::default()),
    }
}

/// Recomputes every derived field of a posting from its current text.
pub trait Annotator: Send + Sync {
    fn annotate(&self, posting: &mut Posting);
}

pub struct RuleAnnotator {
    normalizer: TextNormalizer,
    classifier: GraduateClassifier,
    disciplines: DisciplineClassifier,
}

impl RuleAnnotator {
    pub fn new(rules: RuleSet) -> Result<Self> {
        Ok(Self {
            normalizer: TextNormalizer::new(rules.normalizers, rules.cost_of_living),
            classifier: GraduateClassifier::new(rules.classifier).context("building graduate classifier")?,
            disciplines: DisciplineClassifier::new(rules.disciplines),
        })
    }

    pub fn from_rules_dir(rules_dir: &Path) -> Result<Self> {
        Self::new(RuleSet::load(rules_dir)?)
    }
}

impl Annotator for RuleAnnotator {
    fn annotate(&self, posting: &mut Posting) {
        let hash = posting.identity_hash();
        posting.completeness_score = Some(posting.completeness_score());

        let salary = self.normalizer.parse_salary(&posting.salary_text);
        if salary.is_none() && !posting.salary_text.trim().is_empty() {
            debug!(%hash, raw = %posting.salary_text, "salary not parsed");
        }
        posting.salary_numeric = salary.map(|s| s.base);
        posting.salary_annualized = salary.map(|s| s.annualized);
        posting.salary_monthly_reclassified = salary.is_some_and(|s| s.monthly_reclassified);

        posting.location_state = self.normalizer.extract_state(&posting.location);
        posting.cost_of_living_index = self.normalizer.cost_index_for(posting.location_state.as_deref());
        posting.salary_adjusted = self
            .normalizer
            .adjust_salary(posting.salary_annualized, posting.cost_of_living_index);

        let (name, kind) = parse_employer(&posting.organization);
        posting.big_ten = self.normalizer.big_ten(&name);
        posting.employer_name = if name.is_empty() { None } else { Some(name) };
        posting.employer_type = kind;

        posting.published_on = parse_posting_date(&posting.published_date);

        let classification = self.classifier.classify_posting(posting);
        posting.is_graduate = Some(classification.is_graduate);
        posting.grad_confidence = Some(classification.confidence);
        posting.grad_reasons = classification.reasons;
        posting.review_priority = Some(classification.review_priority);

        let discipline = self.disciplines.classify(&posting.title, &posting.description);
        posting.discipline = Some(discipline.name);
        posting.discipline_category = Some(discipline.category);
        posting.identity_hash = Some(hash);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergePolicy {
    pub completeness_margin: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            completeness_margin: DEFAULT_COMPLETENESS_MARGIN,
        }
    }
}

impl MergePolicy {
    /// Incoming wins on a completeness gain beyond the margin, or on strictly
    /// more populated structured fields.
    pub fn incoming_wins(
        &self,
        stored_score: f64,
        incoming_score: f64,
        stored_structured: usize,
        incoming_structured: usize,
    ) -> bool {
        incoming_score - stored_score > self.completeness_margin || incoming_structured > stored_structured
    }

    pub fn prefers_incoming(&self, stored: &Posting, incoming: &Posting) -> bool {
        self.incoming_wins(
            stored.completeness_score(),
            incoming.completeness_score(),
            stored.structured_field_count(),
            incoming.structured_field_count(),
        )
    }
}

/// Incoming records that survived validation.
#[derive(Debug, Clone, Default)]
pub struct IncomingBatch {
    pub postings: Vec<Posting>,
    pub skipped: usize,
}

impl IncomingBatch {
    pub fn from_document(document: LoadedDocument) -> Self {
        let mut batch = Self::default();
        for (index, record) in document.records.into_iter().enumerate() {
            match Posting::from_json(record).and_then(|posting| posting.validate().map(|()| posting)) {
                Ok(posting) => batch.postings.push(posting),
                Err(err) => {
                    warn!(index, error = %err, "skipping incoming record");
                    batch.skipped += 1;
                }
            }
        }
        batch
    }

    pub fn load(path: &Path) -> Result<Self> {
        let document = load_document(path)
            .with_context(|| format!("loading incoming batch {}", path.display()))?
            .with_context(|| format!("incoming batch {} does not exist", path.display()))?;
        Ok(Self::from_document(document))
    }
}

/// The historical mapping plus the files it came from.
#[derive(Debug, Clone, Default)]
pub struct HistoricalSet {
    pub positions: BTreeMap<String, Posting>,
    pub sources: Vec<String>,
}

impl HistoricalSet {
    /// Canonical records first; verified records only fill hashes the
    /// canonical store lacks. An unreadable record aborts the load.
    pub fn load(store: &HistoricalStore, include_verified: bool) -> Result<Self> {
        let mut set = Self::default();
        let canonical_path = store.canonical_path();
        if let Some(document) = store
            .load_canonical()
            .with_context(|| format!("loading {}", canonical_path.display()))?
        {
            for (index, record) in document.records.into_iter().enumerate() {
                let posting = Posting::from_json(record)
                    .with_context(|| format!("record {index} of {}", canonical_path.display()))?;
                if posting.validate().is_err() {
                    warn!(index, "historical record has a blank title; keeping it");
                }
                let hash = posting.identity_hash();
                if set.positions.insert(hash.clone(), posting).is_some() {
                    warn!(%hash, "duplicate identity in historical store; keeping the later record");
                }
            }
            set.sources.push(canonical_path.display().to_string());
        }

        if include_verified {
            let verified_path = store.verified_path();
            if let Some(document) = store
                .load_verified()
                .with_context(|| format!("loading {}", verified_path.display()))?
            {
                let mut filled = 0usize;
                for (index, record) in document.records.into_iter().enumerate() {
                    let posting = Posting::from_json(record)
                        .with_context(|| format!("record {index} of {}", verified_path.display()))?;
                    if let Entry::Vacant(slot) = set.positions.entry(posting.identity_hash()) {
                        slot.insert(posting);
                        filled += 1;
                    }
                }
                info!(filled, path = %verified_path.display(), "verified positions merged");
                set.sources.push(verified_path.display().to_string());
            }
        }
        Ok(set)
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub positions: BTreeMap<String, Posting>,
    pub stats: MergeStats,
    /// Incoming records replaced by a later record with the same identity.
    pub collapsed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    policy: MergePolicy,
}

impl MergeEngine {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Fold `incoming` into `historical`. Nothing is ever removed; every
    /// historical key is present in the result.
    pub fn reconcile(
        &self,
        historical: BTreeMap<String, Posting>,
        incoming: Vec<Posting>,
        now: DateTime<Utc>,
    ) -> Reconciled {
        let mut positions = historical;
        let mut stats = MergeStats {
            historical_preserved: positions.len(),
            preserved: positions.len(),
            ..MergeStats::default()
        };

        let mut batch = BTreeMap::new();
        let mut collapsed = 0usize;
        for posting in incoming {
            if batch.insert(posting.identity_hash(), posting).is_some() {
                collapsed += 1;
            }
        }
        if collapsed > 0 {
            info!(collapsed, "collapsed duplicate identities within incoming batch");
        }

        for (hash, mut incoming) in batch {
            match positions.entry(hash) {
                Entry::Vacant(slot) => {
                    debug!(hash = %slot.key(), "new posting");
                    incoming.first_seen = Some(now);
                    incoming.last_updated = Some(now);
                    slot.insert(incoming);
                    stats.new_added += 1;
                }
                Entry::Occupied(mut slot) => {
                    stats.preserved = stats.preserved.saturating_sub(1);
                    stats.updated += 1;
                    if self.policy.prefers_incoming(slot.get(), &incoming) {
                        debug!(hash = %slot.key(), "incoming record is more complete");
                        let stored = slot.get_mut();
                        stored.overwrite_from(incoming);
                        stored.data_enhanced = true;
                        stored.enhanced_at = Some(now);
                        stats.enhanced += 1;
                    }
                    slot.get_mut().last_updated = Some(now);
                }
            }
        }

        Reconciled {
            positions,
            stats,
            collapsed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub run_id: Uuid,
    pub merge_timestamp: DateTime<Utc>,
    pub dry_run: bool,
    pub total_positions: usize,
    pub stats: MergeStats,
    pub collapsed_duplicates: usize,
    pub data_sources: Vec<String>,
    pub backup_dir: Option<PathBuf>,
    pub canonical_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
}

impl MergeSummary {
    pub fn render_markdown(&self) -> String {
        let stats = &self.stats;
        let mode = if self.dry_run { "dry run (nothing written)" } else { "applied" };
        let mut lines = vec![
            "# WGOF Merge Summary".to_string(),
            String::new(),
            format!("- run id: `{}`", self.run_id),
            format!("- merged at: {}", self.merge_timestamp.to_rfc3339()),
            format!("- mode: {mode}"),
            format!("- total positions: {}", self.total_positions),
            format!("- historical preserved: {}", stats.historical_preserved),
            format!("- new added: {}", stats.new_added),
            format!("- updated: {}", stats.updated),
            format!("- enhanced: {}", stats.enhanced),
            format!("- preserved: {}", stats.preserved),
            format!("- skipped: {}", stats.skipped),
        ];
        if self.collapsed_duplicates > 0 {
            lines.push(format!("- collapsed duplicates: {}", self.collapsed_duplicates));
        }
        if let Some(path) = &self.canonical_path {
            lines.push(format!("- store: `{}`", path.display()));
        }
        if !self.dry_run {
            match &self.archive_path {
                Some(path) => lines.push(format!("- archive: `{}`", path.display())),
                None => lines.push("- archive: not written".to_string()),
            }
        }
        if let Some(dir) = &self.backup_dir {
            lines.push(format!("- backup: `{}`", dir.display()));
        }
        lines.join("\n")
    }
}

struct Prepared {
    positions: BTreeMap<String, Posting>,
    stats: MergeStats,
    collapsed: usize,
    sources: Vec<String>,
}

/// One merge of an incoming batch into the historical store.
pub struct MergeRun {
    config: SyncConfig,
    store: HistoricalStore,
    engine: MergeEngine,
    annotator: Box<dyn Annotator>,
}

impl MergeRun {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let annotator = RuleAnnotator::from_rules_dir(&config.rules_dir)?;
        Ok(Self {
            store: HistoricalStore::new(config.data_dir.clone()),
            engine: MergeEngine::new(MergePolicy {
                completeness_margin: config.completeness_margin,
            }),
            annotator: Box::new(annotator),
            config,
        })
    }

    pub fn with_annotator(mut self, annotator: Box<dyn Annotator>) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn store(&self) -> &HistoricalStore {
        &self.store
    }

    pub fn annotator(&self) -> &dyn Annotator {
        self.annotator.as_ref()
    }

    pub fn run(&self, incoming: &Path) -> Result<MergeSummary> {
        self.run_at(incoming, Utc::now())
    }

    /// Load, reconcile and annotate without touching the data directory.
    pub fn plan(&self, incoming: &Path) -> Result<MergeSummary> {
        self.plan_at(incoming, Utc::now())
    }

    pub fn run_at(&self, incoming: &Path, now: DateTime<Utc>) -> Result<MergeSummary> {
        self.execute(incoming, now, false)
    }

    pub fn plan_at(&self, incoming: &Path, now: DateTime<Utc>) -> Result<MergeSummary> {
        self.execute(incoming, now, true)
    }

    fn execute(&self, incoming: &Path, now: DateTime<Utc>, dry_run: bool) -> Result<MergeSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("merge_run", %run_id, dry_run);
        let _guard = span.enter();
        info!(
            incoming = %incoming.display(),
            data_dir = %self.store.root().display(),
            "starting merge"
        );

        let backup_dir = if dry_run {
            None
        } else {
            self.store
                .backup(now)
                .context("backing up historical store; merge aborted")?
                .map(|report| report.dir)
        };

        let prepared = self.prepare(incoming, now)?;
        let mut summary = MergeSummary {
            run_id,
            merge_timestamp: now,
            dry_run,
            total_positions: prepared.positions.len(),
            stats: prepared.stats,
            collapsed_duplicates: prepared.collapsed,
            data_sources: prepared.sources.clone(),
            backup_dir,
            canonical_path: None,
            archive_path: None,
        };
        if dry_run {
            info!(total = summary.total_positions, "dry run complete; nothing written");
            return Ok(summary);
        }

        let document = StoreDocument {
            metadata: StoreMetadata {
                merge_timestamp: now,
                total_positions: prepared.positions.len(),
                merge_stats: prepared.stats,
                data_sources: prepared.sources,
                run_id: Some(run_id),
            },
            positions: prepared.positions.into_values().collect(),
        };
        let canonical = self
            .store
            .stage_canonical(&document)
            .context("staging historical store; merge aborted")?
            .commit()
            .context("replacing historical store; merge aborted")?;
        info!(path = %canonical.display(), total = document.positions.len(), "historical store replaced");
        summary.canonical_path = Some(canonical);

        summary.archive_path = match self.store.write_archive(&document, now) {
            Ok(path) => {
                info!(path = %path.display(), "archive written");
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, "archive copy failed; historical store is already committed");
                None
            }
        };
        Ok(summary)
    }

    fn prepare(&self, incoming: &Path, now: DateTime<Utc>) -> Result<Prepared> {
        let historical = HistoricalSet::load(&self.store, self.config.include_verified)?;
        let batch = IncomingBatch::load(incoming)?;
        info!(
            historical = historical.positions.len(),
            incoming = batch.postings.len(),
            skipped = batch.skipped,
            "inputs loaded"
        );

        let mut reconciled = self.engine.reconcile(historical.positions, batch.postings, now);
        reconciled.stats.skipped = batch.skipped;
        for posting in reconciled.positions.values_mut() {
            self.annotator.annotate(posting);
        }

        let mut sources = historical.sources;
        sources.push(incoming.display().to_string());
        Ok(Prepared {
            positions: reconciled.positions,
            stats: reconciled.stats,
            collapsed: reconciled.collapsed,
            sources,
        })
    }
}

pub fn merge_from_env(incoming: &Path, dry_run: bool) -> Result<MergeSummary> {
    let run = MergeRun::new(SyncConfig::from_env())?;
    if dry_run {
        run.plan(incoming)
    } else {
        run.run(incoming)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassificationCounts {
    pub total: usize,
    pub graduate: usize,
    pub non_graduate: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

impl ClassificationCounts {
    pub fn tally<'a>(postings: impl IntoIterator<Item = &'a Posting>) -> Self {
        let mut counts = Self::default();
        for posting in postings {
            counts.total += 1;
            if posting.is_graduate == Some(true) {
                counts.graduate += 1;
            } else {
                counts.non_graduate += 1;
            }
            if let Some(priority) = posting.review_priority {
                *counts.by_priority.entry(priority.as_str().to_string()).or_default() += 1;
            }
            if let Some(category) = &posting.discipline_category {
                *counts.by_category.entry(category.clone()).or_default() += 1;
            }
        }
        counts
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("total: {}", self.total),
            format!("graduate: {}", self.graduate),
            format!("non-graduate: {}", self.non_graduate),
        ];
        lines.extend(self.by_priority.iter().map(|(k, v)| format!("priority {k}: {v}")));
        lines.extend(self.by_category.iter().map(|(k, v)| format!("discipline {k}: {v}")));
        lines
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedBatch {
    pub postings: Vec<Posting>,
    pub skipped: usize,
    pub counts: ClassificationCounts,
}

/// Annotate a batch without merging it anywhere.
pub fn classify_batch(annotator: &dyn Annotator, input: &Path) -> Result<ClassifiedBatch> {
    let batch = IncomingBatch::load(input)?;
    let mut postings = batch.postings;
    for posting in &mut postings {
        annotator.annotate(posting);
    }
    let counts = ClassificationCounts::tally(&postings);
    Ok(ClassifiedBatch {
        postings,
        skipped: batch.skipped,
        counts,
    })
}

/// High-priority first, then confidence closest to the 0.5 midpoint.
pub fn review_queue(positions: impl IntoIterator<Item = Posting>) -> Vec<Posting> {
    let mut queue: Vec<Posting> = positions
        .into_iter()
        .filter(|p| matches!(p.review_priority, Some(ReviewPriority::High | ReviewPriority::Medium)))
        .collect();
    queue.sort_by(|a, b| {
        b.review_priority
            .cmp(&a.review_priority)
            .then_with(|| midpoint_distance(a).total_cmp(&midpoint_distance(b)))
            .then_with(|| a.identity_hash.cmp(&b.identity_hash))
    });
    queue
}

fn midpoint_distance(posting: &Posting) -> f64 {
    posting.grad_confidence.map_or(1.0, |c| (c - 0.5).abs())
}

/// Re-annotate the canonical store and write its review queue.
pub fn write_review_queue(
    store: &HistoricalStore,
    annotator: &dyn Annotator,
    output: Option<&Path>,
) -> Result<(PathBuf, usize)> {
    let mut historical = HistoricalSet::load(store, false)?;
    for posting in historical.positions.values_mut() {
        annotator.annotate(posting);
    }
    let queue = review_queue(historical.positions.into_values());
    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| store.root().join(REVIEW_QUEUE_FILE));
    write_json_atomic(&path, &queue).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), queued = queue.len(), "review queue written");
    Ok((path, queue.len()))
}

/// Markdown listing of the most recent archived merges, newest first.
pub fn report_markdown(store: &HistoricalStore, runs: usize) -> Result<String> {
    let mut archives = store
        .list_archives()
        .with_context(|| format!("listing archives under {}", store.archive_dir().display()))?;
    archives.reverse();

    let mut lines = vec!["# WGOF Merge Report".to_string(), String::new()];
    if archives.is_empty() {
        lines.push(format!("No archived merges under `{}`.", store.archive_dir().display()));
    }
    for path in archives.into_iter().take(runs.max(1)) {
        let metadata = read_metadata(&path).with_context(|| format!("reading {}", path.display()))?;
        let stats = metadata.merge_stats;
        let run_id = metadata
            .run_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        lines.push(format!("## Merge {}", metadata.merge_timestamp.to_rfc3339()));
        lines.push(format!("- run id: `{run_id}`"));
        lines.push(format!("- total positions: {}", metadata.total_positions));
        lines.push(format!(
            "- added {} / updated {} / enhanced {} / preserved {} / skipped {}",
            stats.new_added, stats.updated, stats.enhanced, stats.preserved, stats.skipped
        ));
        lines.push(format!("- archive: `{}`", path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, hour, 0, 0).single().expect("ts")
    }

    fn sparse() -> Posting {
        Posting::new("M.S. Assistantship - Elk Ecology", "University of Nebraska-Lincoln", "Lincoln, Nebraska")
    }

    fn annotator() -> RuleAnnotator {
        RuleAnnotator::new(RuleSet::default()).expect("default rules")
    }

    fn keyed(postings: Vec<Posting>) -> BTreeMap<String, Posting> {
        postings.into_iter().map(|p| (p.identity_hash(), p)).collect()
    }

    #[test]
    fn policy_uses_margin_and_structured_fields() {
        let policy = MergePolicy::default();
        assert!(policy.incoming_wins(0.3, 0.5, 2, 2));
        assert!(!policy.incoming_wins(0.3, 0.32, 2, 2));
        assert!(policy.incoming_wins(0.3, 0.32, 2, 3));
        assert!(!policy.incoming_wins(0.5, 0.3, 2, 2));

        let strict = MergePolicy { completeness_margin: 0.5 };
        assert!(!strict.incoming_wins(0.3, 0.5, 1, 1));
    }

    #[test]
    fn new_postings_get_first_seen() {
        let engine = MergeEngine::default();
        let result = engine.reconcile(BTreeMap::new(), vec![sparse()], at(9));
        assert_eq!(result.stats.new_added, 1);
        assert_eq!(result.stats.historical_preserved, 0);
        let posting = result.positions.values().next().expect("inserted");
        assert_eq!(posting.first_seen, Some(at(9)));
        assert!(!posting.data_enhanced);
    }

    #[test]
    fn more_complete_incoming_enhances_but_keeps_first_seen() {
        let mut stored = sparse();
        stored.first_seen = Some(at(1));
        stored.extra.insert("scrape_source".into(), json!("legacy"));

        let mut incoming = sparse();
        incoming.salary_text = "$1,800".into();
        incoming.application_deadline = "08/01/2025".into();
        incoming.description = "Elk movement research".into();
        incoming.url = "https://example.org/elk".into();

        let hash = stored.identity_hash();
        let result = MergeEngine::default().reconcile(keyed(vec![stored]), vec![incoming], at(9));
        let merged = &result.positions[&hash];
        assert!(merged.data_enhanced);
        assert_eq!(merged.enhanced_at, Some(at(9)));
        assert_eq!(merged.last_updated, Some(at(9)));
        assert_eq!(merged.first_seen, Some(at(1)));
        assert_eq!(merged.salary_text, "$1,800");
        assert_eq!(merged.extra.get("scrape_source"), Some(&json!("legacy")));
        assert_eq!(
            result.stats,
            MergeStats {
                historical_preserved: 1,
                new_added: 0,
                updated: 1,
                enhanced: 1,
                preserved: 0,
                skipped: 0,
            }
        );
    }

    #[test]
    fn less_complete_incoming_only_refreshes_last_updated() {
        let mut stored = sparse();
        stored.salary_text = "$24,000 per year".into();
        stored.description = "Full description".into();
        stored.first_seen = Some(at(1));

        let mut incoming = sparse();
        incoming.description = "Changed description".into();

        let hash = stored.identity_hash();
        let untouched = Posting::new("Fisheries Technician", "USGS (Federal)", "Logan, Utah");
        let result = MergeEngine::default().reconcile(keyed(vec![stored, untouched]), vec![incoming], at(9));
        let merged = &result.positions[&hash];
        assert!(!merged.data_enhanced);
        assert_eq!(merged.description, "Full description");
        assert_eq!(merged.last_updated, Some(at(9)));
        assert_eq!(result.stats.updated, 1);
        assert_eq!(result.stats.enhanced, 0);
        assert_eq!(result.stats.preserved, 1);
        assert_eq!(result.positions.len(), 2);
    }

    #[test]
    fn later_duplicate_in_batch_wins() {
        let mut first = sparse();
        first.url = "https://example.org/first".into();
        let mut second = sparse();
        second.title = "M.S. Assistantship \u{2013} Elk Ecology".into();
        second.url = "https://example.org/second".into();

        let result = MergeEngine::default().reconcile(BTreeMap::new(), vec![first, second], at(9));
        assert_eq!(result.collapsed, 1);
        assert_eq!(result.positions.len(), 1);
        assert_eq!(
            result.positions.values().next().expect("one").url,
            "https://example.org/second"
        );
    }

    #[test]
    fn incoming_batch_skips_unusable_records() {
        let batch = IncomingBatch::from_document(LoadedDocument {
            records: vec![
                json!({"title": "PhD Assistantship", "organization": "Auburn University"}),
                json!({"title": "   ", "organization": "Somewhere"}),
                json!("not a record"),
            ],
            metadata: None,
        });
        assert_eq!(batch.postings.len(), 1);
        assert_eq!(batch.skipped, 2);
    }

    #[test]
    fn historical_load_keeps_blank_titles_and_fills_from_verified() {
        let dir = tempdir().expect("tempdir");
        let store = HistoricalStore::new(dir.path());
        fs::write(
            store.canonical_path(),
            json!({"positions": [
                {"title": "", "organization": "Ghost", "location": "Nowhere"},
                {"title": "PhD Assistantship", "organization": "Auburn University", "location": "Auburn, Alabama", "url": "canonical"}
            ]})
            .to_string(),
        )
        .expect("canonical");
        fs::write(
            store.verified_path(),
            json!([
                {"title": "PhD Assistantship", "organization": "Auburn University", "location": "Auburn, Alabama", "url": "verified"},
                {"title": "MS Assistantship", "organization": "Utah State University", "location": "Logan, Utah"}
            ])
            .to_string(),
        )
        .expect("verified");

        let set = HistoricalSet::load(&store, true).expect("load");
        assert_eq!(set.positions.len(), 3);
        assert_eq!(set.sources.len(), 2);
        let auburn = wgof_core::identity_hash("PhD Assistantship", "Auburn University", "Auburn, Alabama");
        assert_eq!(set.positions[&auburn].url, "canonical");

        let without_verified = HistoricalSet::load(&store, false).expect("load");
        assert_eq!(without_verified.positions.len(), 2);
    }

    #[test]
    fn unreadable_historical_record_aborts() {
        let dir = tempdir().expect("tempdir");
        let store = HistoricalStore::new(dir.path());
        fs::write(store.canonical_path(), r#"[{"title": "Ok"}, 42]"#).expect("canonical");
        assert!(HistoricalSet::load(&store, true).is_err());
    }

    #[test]
    fn annotator_fills_derived_fields() {
        let table = CostOfLivingTable::from_entries([("Nebraska", 100.0), ("Alabama", 80.0)]).expect("table");
        let rules = RuleSet {
            cost_of_living: table,
            ..RuleSet::default()
        };
        let annotator = RuleAnnotator::new(rules).expect("rules");

        let mut posting = Posting::new(
            "Graduate Research Assistantship \u{2013} Bat Ecology",
            "Auburn University (State)",
            "Auburn University (Alabama)",
        );
        posting.salary_text = "$1,800".into();
        posting.published_date = "06/20/2025".into();
        posting.description = "Investigate bat roosting behaviour in longleaf pine forests as part of \
                               a thesis research project with field and lab components."
            .into();
        annotator.annotate(&mut posting);

        assert_eq!(posting.identity_hash, Some(posting.identity_hash()));
        assert_eq!(posting.salary_numeric, Some(1800.0));
        assert_eq!(posting.salary_annualized, Some(21600.0));
        assert!(posting.salary_monthly_reclassified);
        assert_eq!(posting.location_state.as_deref(), Some("Alabama"));
        assert_eq!(posting.cost_of_living_index, Some(80.0));
        assert_eq!(posting.salary_adjusted, Some(27000.0));
        assert_eq!(posting.employer_name.as_deref(), Some("Auburn University"));
        assert_eq!(posting.employer_type.as_deref(), Some("State"));
        assert_eq!(posting.big_ten, Some(false));
        assert_eq!(posting.published_on, chrono::NaiveDate::from_ymd_opt(2025, 6, 20));
        assert_eq!(posting.is_graduate, Some(true));
        assert_eq!(posting.discipline.as_deref(), Some("Ecology"));
        assert_eq!(
            posting.discipline_category.as_deref(),
            Some("Habitat and Environmental Science")
        );
        assert!(posting.completeness_score.is_some_and(|s| s > 0.0));
    }

    #[test]
    fn missing_rules_fall_back_and_malformed_rules_fail() {
        let dir = tempdir().expect("tempdir");
        let rules = RuleSet::load(&dir.path().join("absent")).expect("defaults");
        assert_eq!(rules.classifier, ClassifierConfig::default());
        assert!(rules.cost_of_living.is_empty());

        fs::write(dir.path().join(CLASSIFIER_RULES), "version: [not a number").expect("write");
        assert!(RuleSet::load(dir.path()).is_err());

        fs::write(dir.path().join(CLASSIFIER_RULES), "version: 1\ngraduate_threshold: 0.7\n").expect("write");
        fs::write(
            dir.path().join(COST_OF_LIVING_RULES),
            "version: 1\nentries:\n  - state: Montana\n    index: 92.0\n",
        )
        .expect("write");
        let rules = RuleSet::load(dir.path()).expect("overrides");
        assert_eq!(rules.classifier.graduate_threshold, 0.7);
        assert_eq!(rules.cost_of_living.index_for("montana"), Some(92.0));
    }

    #[test]
    fn review_queue_orders_high_first_then_closest_to_midpoint() {
        let mk = |title: &str, priority: ReviewPriority, confidence: f64| {
            let mut p = Posting::new(title, "Org", "Somewhere, Utah");
            p.review_priority = Some(priority);
            p.grad_confidence = Some(confidence);
            p
        };
        let queue = review_queue(vec![
            mk("medium", ReviewPriority::Medium, 0.8),
            mk("low", ReviewPriority::Low, 0.95),
            mk("high-edge", ReviewPriority::High, 0.4),
            mk("high-centre", ReviewPriority::High, 0.52),
        ]);
        let titles: Vec<&str> = queue.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["high-centre", "high-edge", "medium"]);
    }

    #[test]
    fn report_without_archives() {
        let dir = tempdir().expect("tempdir");
        let report = report_markdown(&HistoricalStore::new(dir.path()), 5).expect("report");
        assert!(report.starts_with("# WGOF Merge Report"));
        assert!(report.contains("No archived merges"));
    }

    #[test]
    fn classification_counts_tally() {
        let annotator = annotator();
        let mut grad = sparse();
        grad.description = "Thesis research on elk movement and habitat selection across the Sandhills.".into();
        let mut pro = Posting::new("Program Manager", "The Nature Conservancy (Private)", "Remote work allowed");
        pro.description = "Lead a team. 10 years of experience and a salary range of $70,000 to $80,000.".into();
        for p in [&mut grad, &mut pro] {
            annotator.annotate(p);
        }
        let counts = ClassificationCounts::tally([&grad, &pro]);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.graduate, 1);
        assert_eq!(counts.non_graduate, 1);
        assert_eq!(counts.by_category.values().sum::<usize>(), 2);
    }
}
