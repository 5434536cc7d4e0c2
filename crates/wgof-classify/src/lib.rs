//! Rule-based graduate-position scoring and discipline bucketing.

use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use wgof_core::{Posting, ReviewPriority};

pub const CRATE_NAME: &str = "wgof-classify";

pub const OTHER_DISCIPLINE: &str = "Other";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub graduate_match: f64,
    pub non_graduate_match: f64,
    pub title_assistantship: f64,
    pub title_graduate: f64,
    pub title_degree: f64,
    pub salary_too_high: f64,
    pub salary_too_low: f64,
    pub salary_in_range: f64,
    pub short_description: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            graduate_match: 0.3,
            non_graduate_match: 0.4,
            title_assistantship: 0.2,
            title_graduate: 0.15,
            title_degree: 0.1,
            salary_too_high: 0.3,
            salary_too_low: 0.1,
            salary_in_range: 0.1,
            short_description: 0.1,
        }
    }
}

/// Confidence band edges. `[ambiguous_min, ambiguous_max]` is high priority;
/// below `ambiguous_min` or above `confident_above` is low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewBand {
    pub ambiguous_min: f64,
    pub ambiguous_max: f64,
    pub confident_above: f64,
}

impl Default for ReviewBand {
    fn default() -> Self {
        Self {
            ambiguous_min: 0.4,
            ambiguous_max: 0.6,
            confident_above: 0.9,
        }
    }
}

impl ReviewBand {
    pub fn priority(&self, confidence: f64) -> ReviewPriority {
        if confidence < self.ambiguous_min || confidence > self.confident_above {
            ReviewPriority::Low
        } else if confidence <= self.ambiguous_max {
            ReviewPriority::High
        } else {
            ReviewPriority::Medium
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub version: u32,
    pub graduate_patterns: Vec<String>,
    pub non_graduate_patterns: Vec<String>,
    pub degree_title_pattern: String,
    pub weights: ScoreWeights,
    pub salary_floor: f64,
    pub salary_ceiling: f64,
    pub short_description_chars: usize,
    pub graduate_threshold: f64,
    pub review: ReviewBand,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            version: 1,
            graduate_patterns: strings(&[
                r"\b(ms|m\.s\.?|master'?s?)\s+(student|position|assistantship|opportunity)",
                r"\b(phd|ph\.d\.?|doctoral)\s+(student|position|assistantship|opportunity)",
                r"\bgraduate\s+(research\s+)?(assistantship|position)",
                r"\bresearch\s+assistantship",
                r"\bgrad\s+(student|position)",
                r"\bthesis\s+(research|project|opportunity)",
                r"\bdissertation\s+(research|project)",
                r"\bgraduate\s+student\s+(position|opportunity)",
                r"\bgraduate\s+fellowship",
                r"\bteaching\s+assistantship",
            ]),
            non_graduate_patterns: strings(&[
                r"\b\d+\+?\s+years?\s+(of\s+)?experience",
                r"\bprofessional\s+experience",
                r"\bcareer\s+opportunity",
                r"\bfull-?time\s+(permanent|employee)",
                r"\bbenefits?\s+package",
                r"\bsalary\s+range",
                r"\b(manager|director|coordinator|supervisor)\b",
                r"\b(postdoc|post-?doctoral)",
                r"\bfaculty\s+position",
                r"\binstructor\s+position",
                r"\bprofessor\s+position",
                r"\btechnician\s+position",
                r"\bspecialist\s+position",
                r"\banalyst\s+position",
            ]),
            degree_title_pattern: r"\b(ms|m\.s|masters?|master's|phd|ph\.d|doctoral|doctorate)\b".to_string(),
            weights: ScoreWeights::default(),
            salary_floor: 8000.0,
            salary_ceiling: 60000.0,
            short_description_chars: 50,
            graduate_threshold: 0.6,
            review: ReviewBand::default(),
        }
    }
}

impl ClassifierConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing classifier rules")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub is_graduate: bool,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub review_priority: ReviewPriority,
}

/// Additive rule scorer for graduate-vs-professional postings.
#[derive(Debug, Clone)]
pub struct GraduateClassifier {
    config: ClassifierConfig,
    graduate: Vec<Regex>,
    non_graduate: Vec<Regex>,
    degree_title: Regex,
}

impl GraduateClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        let graduate = compile_all(&config.graduate_patterns)?;
        let non_graduate = compile_all(&config.non_graduate_patterns)?;
        let degree_title = compile(&config.degree_title_pattern)?;
        Ok(Self {
            config,
            graduate,
            non_graduate,
            degree_title,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn classify_posting(&self, posting: &Posting) -> Classification {
        self.classify(&posting.title, &posting.description, posting.salary_adjusted)
    }

    pub fn classify(&self, title: &str, description: &str, salary_adjusted: Option<f64>) -> Classification {
        let weights = &self.config.weights;
        let combined = format!("{title} {description}");
        let title_lower = title.to_lowercase();
        let mut score = 0.5;
        let mut reasons = Vec::new();

        let graduate_hits = self.graduate.iter().filter(|re| re.is_match(&combined)).count();
        if graduate_hits > 0 {
            score += weights.graduate_match * graduate_hits as f64;
            reasons.push(format!("Strong graduate indicators: {graduate_hits}"));
        }

        let non_graduate_hits = self.non_graduate.iter().filter(|re| re.is_match(&combined)).count();
        if non_graduate_hits > 0 {
            score -= weights.non_graduate_match * non_graduate_hits as f64;
            reasons.push(format!("Strong non-graduate indicators: {non_graduate_hits}"));
        }

        if title_lower.contains("assistantship") {
            score += weights.title_assistantship;
            reasons.push("Title contains 'assistantship'".to_string());
        }
        if title_lower.contains("graduate") {
            score += weights.title_graduate;
            reasons.push("Title contains 'graduate'".to_string());
        }
        if self.degree_title.is_match(title) {
            score += weights.title_degree;
            reasons.push("Title mentions degree level".to_string());
        }

        if let Some(salary) = salary_adjusted {
            if salary > self.config.salary_ceiling {
                score -= weights.salary_too_high;
                reasons.push("Salary too high for graduate assistantship".to_string());
            } else if salary > 0.0 && salary < self.config.salary_floor {
                score -= weights.salary_too_low;
                reasons.push("Salary suspiciously low".to_string());
            } else if salary >= self.config.salary_floor {
                score += weights.salary_in_range;
                reasons.push("Salary in reasonable range".to_string());
            }
        }

        if description.trim().chars().count() < self.config.short_description_chars {
            score -= weights.short_description;
            reasons.push("Very short description".to_string());
        }

        let confidence = score.clamp(0.0, 1.0);
        Classification {
            is_graduate: score > self.config.graduate_threshold,
            confidence,
            reasons,
            review_priority: self.config.review.priority(confidence),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisciplineBucket {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRule {
    pub category: String,
    #[serde(default)]
    pub from: Vec<String>,
}

/// Buckets are tried in list order; the first with a keyword hit wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisciplineConfig {
    pub version: u32,
    pub buckets: Vec<DisciplineBucket>,
    pub consolidation: Vec<ConsolidationRule>,
}

impl Default for DisciplineConfig {
    fn default() -> Self {
        let bucket = |name: &str, keywords: &[&str]| DisciplineBucket {
            name: name.to_string(),
            keywords: strings(keywords),
        };
        let rule = |category: &str, from: &[&str]| ConsolidationRule {
            category: category.to_string(),
            from: strings(from),
        };
        Self {
            version: 1,
            buckets: vec![
                bucket(
                    "Wildlife Management",
                    &["wildlife", "deer", "elk", "bear", "ungulate", "mammal", "carnivore"],
                ),
                bucket(
                    "Fisheries",
                    &["fish", "aquatic", "stream", "river", "salmon", "trout", "fisheries"],
                ),
                bucket(
                    "Ecology",
                    &["ecology", "ecosystem", "community", "population", "biodiversity"],
                ),
                bucket(
                    "Conservation",
                    &["conservation", "restoration", "habitat", "preserve", "protected"],
                ),
                bucket(
                    "Environmental Science",
                    &["environment", "pollution", "contamination", "climate"],
                ),
                bucket("Forestry", &["forest", "tree", "timber", "silviculture", "woodland"]),
                bucket("Marine Science", &["marine", "ocean", "coastal", "reef", "sea"]),
                bucket("Ornithology", &["bird", "avian", "waterfowl", "raptor", "migration"]),
                bucket("Botany", &["plant", "vegetation", "flora", "botanical"]),
                bucket(
                    "Human Dimensions",
                    &["human", "social", "stakeholder", "community", "outreach"],
                ),
            ],
            consolidation: vec![
                rule(
                    "Fisheries Management and Conservation",
                    &[
                        "Fisheries Management and Conservation",
                        "Fisheries Science",
                        "Fisheries",
                        "Marine Science",
                    ],
                ),
                rule(
                    "Wildlife Management and Conservation",
                    &[
                        "Wildlife Management and Conservation",
                        "Wildlife Ecology",
                        "Conservation Biology",
                        "Wildlife Management",
                        "Conservation",
                        "Ornithology",
                    ],
                ),
                rule("Human Dimensions", &["Human Dimensions"]),
                rule(
                    "Habitat and Environmental Science",
                    &[
                        "Habitat and Environmental Science",
                        "Environmental Science",
                        "Quantitative Ecology",
                        "Ecosystem Ecology",
                        "Ecotoxicology",
                        "Fire Ecology",
                        "Climate Science",
                        "Ecology",
                        "Forestry",
                        "Botany",
                    ],
                ),
                rule(OTHER_DISCIPLINE, &["Other", "Genetics/Genomics", "Non-Graduate"]),
            ],
        }
    }
}

impl DisciplineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing discipline rules")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discipline {
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct DisciplineClassifier {
    buckets: Vec<DisciplineBucket>,
    consolidation: HashMap<String, String>,
}

impl DisciplineClassifier {
    pub fn new(config: DisciplineConfig) -> Self {
        let buckets = config
            .buckets
            .into_iter()
            .map(|bucket| DisciplineBucket {
                name: bucket.name,
                keywords: bucket.keywords.iter().map(|k| k.trim().to_lowercase()).collect(),
            })
            .collect();
        let mut consolidation = HashMap::new();
        for rule in config.consolidation {
            for raw in rule.from {
                consolidation.insert(raw.trim().to_lowercase(), rule.category.clone());
            }
        }
        Self { buckets, consolidation }
    }

    /// First bucket with a keyword at a word start in `title + description`.
    pub fn bucket(&self, title: &str, description: &str) -> String {
        let text = format!("{title} {description}").to_lowercase();
        self.buckets
            .iter()
            .find(|bucket| {
                bucket
                    .keywords
                    .iter()
                    .any(|keyword| !keyword.is_empty() && starts_word(&text, keyword))
            })
            .map(|bucket| bucket.name.clone())
            .unwrap_or_else(|| OTHER_DISCIPLINE.to_string())
    }

    pub fn consolidate(&self, discipline: &str) -> String {
        self.consolidation
            .get(&discipline.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| OTHER_DISCIPLINE.to_string())
    }

    pub fn classify(&self, title: &str, description: &str) -> Discipline {
        let name = self.bucket(title, description);
        let category = self.consolidate(&name);
        Discipline { name, category }
    }
}

fn starts_word(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(at, _)| {
        text[..at]
            .chars()
            .next_back()
            .map_or(true, |prev| !prev.is_alphanumeric())
    })
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("compiling pattern {pattern:?}"))
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile(p)).collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
