//! The evidence ledger itself: aggregation, conflict detection, prompt
//! rendering, report sections, and serialization.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ConfidenceLevel, ConstantEntry, EntityLink, FactConflict, FactEntry};
use crate::core::Chunk;

/// Negation markers that suggest conflicting facts.
static NEGATION_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(never|always|cannot|must not|does not|is not|are not|no longer|impossible|forbidden|prohibited)\b",
    )
    .unwrap_or_else(|_| unreachable!())
});

/// Numeric tokens for conflict detection.
static NUMERIC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+(?:\.\d+)?)\b").unwrap_or_else(|_| unreachable!()));

/// Hard cap on facts rendered into a prompt (~30 tokens per fact ≈ 15k).
pub const MAX_FACTS_LIMIT: usize = 500;

// Tiered formatting thresholds by fact count
const FACTS_TIER_VERBOSE: usize = 20;
const FACTS_TIER_COMPACT: usize = 50;
const FACTS_TIER_INDEXED: usize = 100;

fn normalize_entity_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

#[derive(Serialize, Deserialize)]
struct LedgerData {
    constants: HashMap<String, ConstantEntry>,
    facts: HashMap<String, FactEntry>,
    conflicts: Vec<FactConflict>,
}

/// Unified evidence ledger combining constants and facts.
#[derive(Debug, Clone, Default)]
pub struct EvidenceLedger {
    /// Constants keyed by `"{file_path}:{name}"`.
    constants: HashMap<String, ConstantEntry>,
    /// Facts keyed by fact id.
    facts: HashMap<String, FactEntry>,
    /// Normalized entity name → facts referencing it.
    entity_index: HashMap<String, EntityLink>,
    /// Detected conflicts.
    conflicts: Vec<FactConflict>,
}

impl EvidenceLedger {
    /// Number of constants.
    #[must_use]
    pub fn constants_count(&self) -> usize {
        self.constants.len()
    }

    /// Number of facts.
    #[must_use]
    pub fn facts_count(&self) -> usize {
        self.facts.len()
    }

    /// Total evidence count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.constants.len() + self.facts.len()
    }

    /// Whether the ledger holds no evidence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty() && self.facts.is_empty()
    }

    /// Recorded conflicts.
    #[must_use]
    pub fn conflicts(&self) -> &[FactConflict] {
        &self.conflicts
    }

    /// Builds a ledger from chunk metadata constants.
    #[must_use]
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Self {
        let mut ledger = Self::default();
        for chunk in chunks {
            for constant in &chunk.metadata.constants {
                if constant.name.is_empty() {
                    continue;
                }
                ledger.add_constant(ConstantEntry {
                    name: constant.name.clone(),
                    file_path: chunk.file_path.clone(),
                    value: constant.value.clone(),
                    type_name: constant.type_name.clone(),
                });
            }
        }
        ledger
    }

    /// Adds a constant, deduping by `(file, name)`.
    pub fn add_constant(&mut self, entry: ConstantEntry) {
        self.constants.entry(entry.key()).or_insert(entry);
    }

    /// Adds a fact and updates the entity index.
    pub fn add_fact(&mut self, fact: FactEntry) {
        for entity in &fact.entities {
            let normalized = normalize_entity_name(entity);
            if normalized.is_empty() {
                continue;
            }
            let link = self
                .entity_index
                .entry(normalized)
                .or_insert_with(|| EntityLink {
                    entity_name: entity.clone(),
                    fact_ids: Vec::new(),
                });
            if !link.fact_ids.contains(&fact.fact_id) {
                link.fact_ids.push(fact.fact_id.clone());
            }
        }
        self.facts.insert(fact.fact_id.clone(), fact);
    }

    /// Records a detected conflict.
    pub fn add_conflict(&mut self, conflict: FactConflict) {
        self.conflicts.push(conflict);
    }

    /// Merges another ledger into a new one.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = Self::default();
        merged.constants.extend(self.constants.clone());
        merged.constants.extend(other.constants.clone());
        for fact in self.facts.values().chain(other.facts.values()) {
            merged.add_fact(fact.clone());
        }
        merged.conflicts = self
            .conflicts
            .iter()
            .chain(other.conflicts.iter())
            .cloned()
            .collect();
        merged
    }

    /// Rebuilds constants from a new chunk set while preserving facts
    /// (expensive LLM extractions) and conflicts.
    #[must_use]
    pub fn replace_constants_from_chunks<'a>(
        &self,
        chunks: impl IntoIterator<Item = &'a Chunk>,
    ) -> Self {
        let mut fresh = Self::from_chunks(chunks);
        for fact in self.facts.values() {
            fresh.add_fact(fact.clone());
        }
        fresh.conflicts = self.conflicts.clone();
        fresh
    }

    // =====================================================================
    // Queries
    // =====================================================================

    /// Facts from the given files.
    #[must_use]
    pub fn facts_for_files(&self, file_paths: &[&str]) -> Vec<&FactEntry> {
        self.facts
            .values()
            .filter(|f| file_paths.contains(&f.file_path.as_str()))
            .collect()
    }

    /// Facts referencing an entity (case-insensitive).
    #[must_use]
    pub fn facts_for_entity(&self, entity: &str) -> Vec<&FactEntry> {
        let Some(link) = self.entity_index.get(&normalize_entity_name(entity)) else {
            return Vec::new();
        };
        link.fact_ids
            .iter()
            .filter_map(|id| self.facts.get(id))
            .collect()
    }

    /// Facts from the given files plus facts reachable via entity links.
    #[must_use]
    pub fn related_facts(&self, file_paths: &[&str]) -> Vec<&FactEntry> {
        let direct = self.facts_for_files(file_paths);

        let mut related_ids: Vec<&str> = direct.iter().map(|f| f.fact_id.as_str()).collect();
        for fact in &direct {
            for entity in &fact.entities {
                for linked in self.facts_for_entity(entity) {
                    if !related_ids.contains(&linked.fact_id.as_str()) {
                        related_ids.push(&linked.fact_id);
                    }
                }
            }
        }

        related_ids
            .into_iter()
            .filter_map(|id| self.facts.get(id))
            .collect()
    }

    // =====================================================================
    // Conflict detection
    // =====================================================================

    /// Heuristic conflict detection over facts sharing an entity: flag when
    /// exactly one of a pair contains a negation marker, or when both carry
    /// numeric tokens and the sets are disjoint-by-inequality.
    #[must_use]
    pub fn detect_conflicts(&self) -> Vec<FactConflict> {
        let mut conflicts = Vec::new();

        let mut entities: Vec<&String> = self.entity_index.keys().collect();
        entities.sort();

        for entity in entities {
            let link = &self.entity_index[entity];
            if link.fact_ids.len() < 2 {
                continue;
            }
            let facts: Vec<&FactEntry> = link
                .fact_ids
                .iter()
                .filter_map(|id| self.facts.get(id))
                .collect();

            for (i, fact_a) in facts.iter().enumerate() {
                for fact_b in &facts[i + 1..] {
                    if let Some(conflict) = check_conflict(fact_a, fact_b, &link.entity_name) {
                        conflicts.push(conflict);
                    }
                }
            }
        }

        conflicts
    }

    // =====================================================================
    // Prompt rendering
    // =====================================================================

    fn constants_by_file(&self) -> Vec<(&str, Vec<&ConstantEntry>)> {
        let mut by_file: HashMap<&str, Vec<&ConstantEntry>> = HashMap::new();
        for entry in self.constants.values() {
            by_file.entry(&entry.file_path).or_default().push(entry);
        }
        let mut sorted: Vec<(&str, Vec<&ConstantEntry>)> = by_file.into_iter().collect();
        sorted.sort_by_key(|(path, _)| *path);
        for (_, entries) in &mut sorted {
            entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
        sorted
    }

    /// Renders the constants block for a prompt, capped at `max_entries`.
    #[must_use]
    pub fn constants_prompt_context(&self, max_entries: usize) -> String {
        if self.constants.is_empty() {
            return String::new();
        }

        let mut lines = vec!["## Global Constants".to_string()];
        let mut count = 0;
        for (path, entries) in self.constants_by_file() {
            if count >= max_entries {
                break;
            }
            let mut file_lines = Vec::new();
            for entry in entries {
                if count >= max_entries {
                    break;
                }
                let mut line = format!("  - {}", entry.name);
                if let Some(value) = &entry.value {
                    let _ = write!(line, " = {value}");
                }
                if let Some(type_name) = &entry.type_name {
                    let _ = write!(line, " ({type_name})");
                }
                file_lines.push(line);
                count += 1;
            }
            if !file_lines.is_empty() {
                lines.push(format!("\n**{path}**:"));
                lines.extend(file_lines);
            }
        }

        if count < self.constants.len() {
            lines.push(format!(
                "\n... and {} more constants",
                self.constants.len() - count
            ));
        }

        lines.join("\n")
    }

    fn sorted_facts(facts: Vec<&FactEntry>) -> Vec<&FactEntry> {
        let mut sorted = facts;
        sorted.sort_by(|a, b| {
            a.confidence
                .cmp(&b.confidence)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.fact_id.cmp(&b.fact_id))
        });
        sorted
    }

    /// Renders facts at the compression tier matching the fact count:
    /// verbose ≤ 20, compact ≤ 50, compact with a file index ≤ 100, summary
    /// by category beyond. Truncation keeps the highest-confidence facts and
    /// never exceeds [`MAX_FACTS_LIMIT`].
    #[must_use]
    pub fn format_facts_tiered(&self, facts: Vec<&FactEntry>) -> String {
        if facts.is_empty() {
            return String::new();
        }

        let mut sorted = Self::sorted_facts(facts);
        let truncated = sorted.len() > MAX_FACTS_LIMIT;
        sorted.truncate(MAX_FACTS_LIMIT);

        let mut body = if sorted.len() <= FACTS_TIER_VERBOSE {
            format_facts_verbose(&sorted)
        } else if sorted.len() <= FACTS_TIER_COMPACT {
            format_facts_compact(&sorted)
        } else if sorted.len() <= FACTS_TIER_INDEXED {
            format_facts_indexed(&sorted)
        } else {
            format_facts_summary(&sorted)
        };

        if truncated {
            let _ = write!(
                body,
                "\n\n... truncated to {MAX_FACTS_LIMIT} facts (15k token limit)"
            );
        }
        body
    }

    /// Prompt context for a cluster's map-phase synthesis: facts from the
    /// cluster's files plus entity-linked relatives.
    #[must_use]
    pub fn facts_map_prompt_context(&self, cluster_files: &[&str]) -> String {
        let related = self.related_facts(cluster_files);
        if related.is_empty() {
            return String::new();
        }
        format!(
            "## Verified Facts (from this cluster and related files)\n{}\n\n\
             Treat these facts as verified context; cite their sources when you rely on them.",
            self.format_facts_tiered(related)
        )
    }

    /// Prompt context for the reduce phase: all facts plus a short conflict
    /// digest.
    #[must_use]
    pub fn facts_reduce_prompt_context(&self) -> String {
        if self.facts.is_empty() {
            return String::new();
        }

        let mut context = format!(
            "## Verified Facts\n{}",
            self.format_facts_tiered(self.facts.values().collect())
        );

        if !self.conflicts.is_empty() {
            let mut lines = vec!["\n### Potential Conflicts (require verification)".to_string()];
            for conflict in self.conflicts.iter().take(5) {
                let mut reason = conflict.reason.clone();
                if reason.chars().count() > 50 {
                    crate::core::text::truncate_chars(&mut reason, 50);
                    reason.push_str("...");
                }
                lines.push(format!(
                    "- [{}] vs [{}]: {reason}",
                    &conflict.fact_id_a[..conflict.fact_id_a.len().min(6)],
                    &conflict.fact_id_b[..conflict.fact_id_b.len().min(6)],
                ));
            }
            if self.conflicts.len() > 5 {
                lines.push(format!("... and {} more conflicts", self.conflicts.len() - 5));
            }
            context.push('\n');
            context.push_str(&lines.join("\n"));
        }

        context
    }

    // =====================================================================
    // Report generation
    // =====================================================================

    /// The `## Evidence` markdown section for the final report, or empty
    /// when the ledger holds nothing.
    #[must_use]
    pub fn report_suffix(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut sections = vec!["\n## Evidence".to_string()];

        if !self.constants.is_empty() {
            let mut lines = vec!["### Constants Referenced".to_string()];
            for (path, entries) in self.constants_by_file() {
                lines.push(format!("\n**{path}**:"));
                for entry in entries {
                    let mut line = format!("  - {}", entry.name);
                    if let Some(value) = &entry.value {
                        let _ = write!(line, " = {value}");
                    }
                    if let Some(type_name) = &entry.type_name {
                        let _ = write!(line, " ({type_name})");
                    }
                    lines.push(line);
                }
            }
            sections.push(lines.join("\n"));
        }

        if !self.facts.is_empty() {
            let mut lines = vec!["### Verified Facts".to_string()];
            for confidence in [
                ConfidenceLevel::Definite,
                ConfidenceLevel::Likely,
                ConfidenceLevel::Inferred,
                ConfidenceLevel::Uncertain,
            ] {
                let mut facts: Vec<&FactEntry> = self
                    .facts
                    .values()
                    .filter(|f| f.confidence == confidence)
                    .collect();
                if facts.is_empty() {
                    continue;
                }
                facts.sort_by(|a, b| {
                    a.category
                        .cmp(&b.category)
                        .then_with(|| a.file_path.cmp(&b.file_path))
                        .then_with(|| a.fact_id.cmp(&b.fact_id))
                });
                let mut title = confidence.label().to_string();
                if let Some(first) = title.get_mut(..1) {
                    first.make_ascii_uppercase();
                }
                lines.push(format!("\n#### {title} Facts"));
                for fact in facts {
                    lines.push(format!(
                        "- [F-{}] {} ({}:{})",
                        fact.fact_id, fact.statement, fact.file_path, fact.start_line
                    ));
                }
            }
            sections.push(lines.join("\n"));
        }

        sections.join("\n\n")
    }

    /// Inserts the evidence section into a report, before `## Sources` when
    /// present, appended otherwise.
    #[must_use]
    pub fn insert_into_report(&self, answer: &str) -> String {
        let suffix = self.report_suffix();
        if suffix.is_empty() {
            return answer.to_string();
        }
        if answer.contains("## Sources") {
            answer.replacen("## Sources", &format!("{suffix}\n\n## Sources"), 1)
        } else {
            format!("{answer}\n{suffix}")
        }
    }

    // =====================================================================
    // Serialization
    // =====================================================================

    /// Serializes to a plain JSON value for progress/transport.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(LedgerData {
            constants: self.constants.clone(),
            facts: self.facts.clone(),
            conflicts: self.conflicts.clone(),
        })
        .unwrap_or(serde_json::Value::Null)
    }

    /// Deserializes from the form [`EvidenceLedger::to_value`] produced,
    /// rebuilding the entity index.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error on malformed input.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let data: LedgerData = serde_json::from_value(value)?;
        let mut ledger = Self {
            constants: data.constants,
            ..Self::default()
        };
        for fact in data.facts.into_values() {
            ledger.add_fact(fact);
        }
        ledger.conflicts = data.conflicts;
        Ok(ledger)
    }
}

fn check_conflict(
    fact_a: &FactEntry,
    fact_b: &FactEntry,
    entity_name: &str,
) -> Option<FactConflict> {
    let a_negated = NEGATION_PATTERNS.is_match(&fact_a.statement);
    let b_negated = NEGATION_PATTERNS.is_match(&fact_b.statement);

    if a_negated != b_negated {
        return Some(FactConflict {
            fact_id_a: fact_a.fact_id.clone(),
            fact_id_b: fact_b.fact_id.clone(),
            reason: format!("Potential negation conflict for entity '{entity_name}'"),
        });
    }

    let a_nums: Vec<&str> = NUMERIC_PATTERN
        .find_iter(&fact_a.statement)
        .map(|m| m.as_str())
        .collect();
    let b_nums: Vec<&str> = NUMERIC_PATTERN
        .find_iter(&fact_b.statement)
        .map(|m| m.as_str())
        .collect();

    if !a_nums.is_empty() && !b_nums.is_empty() {
        let mut a_sorted = a_nums.clone();
        let mut b_sorted = b_nums.clone();
        a_sorted.sort_unstable();
        a_sorted.dedup();
        b_sorted.sort_unstable();
        b_sorted.dedup();
        if a_sorted != b_sorted {
            return Some(FactConflict {
                fact_id_a: fact_a.fact_id.clone(),
                fact_id_b: fact_b.fact_id.clone(),
                reason: format!(
                    "Different numeric values for entity '{entity_name}': \
                     {a_sorted:?} vs {b_sorted:?}"
                ),
            });
        }
    }

    None
}

fn format_facts_verbose(facts: &[&FactEntry]) -> String {
    let mut lines = Vec::with_capacity(facts.len());
    for fact in facts {
        let entities = if fact.entities.is_empty() {
            String::new()
        } else {
            format!("; entities: {}", fact.entities.join(", "))
        };
        lines.push(format!(
            "- [{}] {}\n  source: {}:{}-{} (category: {}{entities})",
            fact.confidence.tag(),
            fact.statement,
            fact.file_path,
            fact.start_line,
            fact.end_line,
            fact.category,
        ));
    }
    lines.join("\n")
}

fn format_facts_compact(facts: &[&FactEntry]) -> String {
    let mut lines = Vec::with_capacity(facts.len());
    for fact in facts {
        lines.push(format!(
            "- [{}] {} ({}:{}-{})",
            fact.confidence.tag(),
            fact.statement,
            file_name(&fact.file_path),
            fact.start_line,
            fact.end_line,
        ));
    }
    lines.join("\n")
}

fn format_facts_indexed(facts: &[&FactEntry]) -> String {
    let mut file_order: Vec<&str> = Vec::new();
    for fact in facts {
        if !file_order.contains(&fact.file_path.as_str()) {
            file_order.push(&fact.file_path);
        }
    }
    let index: HashMap<&str, usize> = file_order
        .iter()
        .enumerate()
        .map(|(i, path)| (*path, i + 1))
        .collect();

    let mut lines = vec![String::from("Files:")];
    for (i, path) in file_order.iter().enumerate() {
        lines.push(format!("  [F{}] {path}", i + 1));
    }
    lines.push(String::new());
    for fact in facts {
        let file_idx = index.get(fact.file_path.as_str()).copied().unwrap_or(0);
        lines.push(format!(
            "- [{}] {} (F{file_idx}:{}-{})",
            fact.confidence.tag(),
            fact.statement,
            fact.start_line,
            fact.end_line,
        ));
    }
    lines.join("\n")
}

fn format_facts_summary(facts: &[&FactEntry]) -> String {
    let mut by_category: HashMap<&str, [usize; 4]> = HashMap::new();
    for fact in facts {
        let counts = by_category.entry(&fact.category).or_default();
        let slot = match fact.confidence {
            ConfidenceLevel::Definite => 0,
            ConfidenceLevel::Likely => 1,
            ConfidenceLevel::Inferred => 2,
            ConfidenceLevel::Uncertain => 3,
        };
        counts[slot] += 1;
    }

    let mut categories: Vec<(&str, [usize; 4])> = by_category.into_iter().collect();
    categories.sort_by_key(|(category, _)| *category);

    let mut lines = vec![format!("{} facts by category:", facts.len())];
    for (category, [definite, likely, inferred, uncertain]) in categories {
        let total = definite + likely + inferred + uncertain;
        lines.push(format!(
            "- {category}: {total} facts \
             ({definite} definite, {likely} likely, {inferred} inferred, {uncertain} uncertain)"
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConstantMeta;

    fn fact(statement: &str, file: &str, start: u32, entities: &[&str]) -> FactEntry {
        FactEntry {
            fact_id: FactEntry::generate_id(statement, file, start, start + 5),
            statement: statement.to_string(),
            file_path: file.to_string(),
            start_line: start,
            end_line: start + 5,
            category: "behavior".to_string(),
            confidence: ConfidenceLevel::Definite,
            entities: entities.iter().map(|e| (*e).to_string()).collect(),
            cluster_id: 0,
        }
    }

    fn chunk_with_constant(name: &str, value: &str) -> Chunk {
        let mut chunk = Chunk::new(1, 1, "src/cfg.rs", 1, 10, "code");
        chunk.metadata.constants.push(ConstantMeta {
            name: name.to_string(),
            value: Some(value.to_string()),
            type_name: None,
        });
        chunk
    }

    #[test]
    fn test_from_chunks_extracts_constants() {
        let chunks = vec![
            chunk_with_constant("MAX_RETRIES", "3"),
            chunk_with_constant("MAX_RETRIES", "3"), // duplicate
        ];
        let ledger = EvidenceLedger::from_chunks(&chunks);
        assert_eq!(ledger.constants_count(), 1);
    }

    #[test]
    fn test_add_fact_updates_entity_index() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("uses backoff", "src/retry.rs", 10, &["RetryPolicy"]));
        ledger.add_fact(fact("caps attempts", "src/retry.rs", 20, &["retrypolicy"]));

        let linked = ledger.facts_for_entity("RETRYPOLICY");
        assert_eq!(linked.len(), 2);
    }

    #[test]
    fn test_facts_dedupe_by_id() {
        let mut ledger = EvidenceLedger::default();
        let f = fact("same statement", "src/a.rs", 1, &["X"]);
        ledger.add_fact(f.clone());
        ledger.add_fact(f);
        assert_eq!(ledger.facts_count(), 1);
        // Entity index not duplicated either
        assert_eq!(ledger.facts_for_entity("X").len(), 1);
    }

    #[test]
    fn test_negation_conflict_detected() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("Session always expires", "src/a.rs", 1, &["Session"]));
        ledger.add_fact(fact("Session persists to disk", "src/b.rs", 1, &["Session"]));
        let conflicts = ledger.detect_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].reason.contains("negation"));
    }

    #[test]
    fn test_numeric_conflict_detected() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("Pool size is 5 workers", "src/a.rs", 1, &["Pool"]));
        ledger.add_fact(fact("Pool size is 8 workers", "src/b.rs", 1, &["Pool"]));
        let conflicts = ledger.detect_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].reason.contains("numeric"));
    }

    #[test]
    fn test_agreeing_facts_no_conflict() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("Pool size is 5 workers", "src/a.rs", 1, &["Pool"]));
        ledger.add_fact(fact("Pool spawns 5 workers at boot", "src/b.rs", 1, &["Pool"]));
        assert!(ledger.detect_conflicts().is_empty());
    }

    #[test]
    fn test_conflicts_share_entity() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("A never retries", "src/a.rs", 1, &["Alpha"]));
        ledger.add_fact(fact("B retries forever", "src/b.rs", 1, &["Beta"]));
        // Different entities: no pairing, no conflict
        assert!(ledger.detect_conflicts().is_empty());
    }

    #[test]
    fn test_constants_prompt_context_caps() {
        let mut ledger = EvidenceLedger::default();
        for i in 0..10 {
            ledger.add_constant(ConstantEntry {
                name: format!("CONST_{i}"),
                file_path: "src/cfg.rs".to_string(),
                value: Some(i.to_string()),
                type_name: None,
            });
        }
        let context = ledger.constants_prompt_context(3);
        assert!(context.contains("## Global Constants"));
        assert!(context.contains("... and 7 more constants"));
    }

    #[test]
    fn test_tiered_verbose_under_20() {
        let mut ledger = EvidenceLedger::default();
        for i in 0..5 {
            ledger.add_fact(fact(&format!("fact number {i}"), "src/a.rs", i * 10 + 1, &[]));
        }
        let rendered = ledger.format_facts_tiered(ledger.facts.values().collect());
        assert!(rendered.contains("source: src/a.rs:"));
    }

    #[test]
    fn test_tiered_compact_under_50() {
        let mut ledger = EvidenceLedger::default();
        for i in 0..30 {
            ledger.add_fact(fact(&format!("fact number {i}"), "src/a.rs", i * 10 + 1, &[]));
        }
        let rendered = ledger.format_facts_tiered(ledger.facts.values().collect());
        // Compact format shows the file name only, no "source:" lines
        assert!(!rendered.contains("source:"));
        assert!(rendered.contains("(a.rs:"));
    }

    #[test]
    fn test_tiered_indexed_under_100() {
        let mut ledger = EvidenceLedger::default();
        for i in 0..60 {
            ledger.add_fact(fact(&format!("fact number {i}"), "src/a.rs", i * 10 + 1, &[]));
        }
        let rendered = ledger.format_facts_tiered(ledger.facts.values().collect());
        assert!(rendered.starts_with("Files:"));
        assert!(rendered.contains("[F1] src/a.rs"));
        assert!(rendered.contains("(F1:"));
    }

    #[test]
    fn test_tiered_summary_beyond_100() {
        let mut ledger = EvidenceLedger::default();
        for i in 0..150 {
            ledger.add_fact(fact(&format!("fact number {i}"), "src/a.rs", i * 10 + 1, &[]));
        }
        let rendered = ledger.format_facts_tiered(ledger.facts.values().collect());
        assert!(rendered.contains("facts by category:"));
        assert!(rendered.contains("- behavior: 150 facts"));
    }

    #[test]
    fn test_facts_cap_500() {
        let mut ledger = EvidenceLedger::default();
        for i in 0..600u32 {
            ledger.add_fact(fact(&format!("fact {i}"), "src/a.rs", i + 1, &[]));
        }
        let rendered = ledger.format_facts_tiered(ledger.facts.values().collect());
        assert!(rendered.contains("truncated to 500 facts"));
    }

    #[test]
    fn test_truncation_keeps_definite_facts() {
        let mut ledger = EvidenceLedger::default();
        let mut uncertain = fact("uncertain claim", "src/a.rs", 1, &[]);
        uncertain.confidence = ConfidenceLevel::Uncertain;
        ledger.add_fact(uncertain);
        for i in 0..MAX_FACTS_LIMIT as u32 {
            ledger.add_fact(fact(&format!("definite {i}"), "src/a.rs", i + 10, &[]));
        }
        let rendered = ledger.format_facts_tiered(ledger.facts.values().collect());
        // The single uncertain fact sorts last and falls off
        assert!(!rendered.contains("uncertain claim"));
    }

    #[test]
    fn test_report_suffix_sections() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_constant(ConstantEntry {
            name: "TIMEOUT".to_string(),
            file_path: "src/cfg.rs".to_string(),
            value: Some("30".to_string()),
            type_name: Some("u64".to_string()),
        });
        ledger.add_fact(fact("uses a timeout", "src/cfg.rs", 5, &["Timeout"]));

        let suffix = ledger.report_suffix();
        assert!(suffix.contains("## Evidence"));
        assert!(suffix.contains("### Constants Referenced"));
        assert!(suffix.contains("TIMEOUT = 30 (u64)"));
        assert!(suffix.contains("#### Definite Facts"));
    }

    #[test]
    fn test_insert_into_report_before_sources() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("a fact", "src/a.rs", 1, &[]));
        let report = "Answer body.\n\n## Sources\n[1] src/a.rs";
        let inserted = ledger.insert_into_report(report);
        let evidence_pos = inserted
            .find("## Evidence")
            .unwrap_or_else(|| unreachable!());
        let sources_pos = inserted.find("## Sources").unwrap_or_else(|| unreachable!());
        assert!(evidence_pos < sources_pos);
    }

    #[test]
    fn test_insert_into_report_no_sources_section() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_fact(fact("a fact", "src/a.rs", 1, &[]));
        let inserted = ledger.insert_into_report("Answer body.");
        assert!(inserted.ends_with(ledger.report_suffix().as_str()));
    }

    #[test]
    fn test_value_round_trip_identity() {
        let mut ledger = EvidenceLedger::default();
        ledger.add_constant(ConstantEntry {
            name: "K".to_string(),
            file_path: "src/a.rs".to_string(),
            value: None,
            type_name: None,
        });
        ledger.add_fact(fact("claim one", "src/a.rs", 1, &["Alpha", "Beta"]));
        ledger.add_fact(fact("claim two", "src/b.rs", 9, &["Alpha"]));
        ledger.add_conflict(FactConflict {
            fact_id_a: "aaa".to_string(),
            fact_id_b: "bbb".to_string(),
            reason: "test".to_string(),
        });

        let value = ledger.to_value();
        let restored = EvidenceLedger::from_value(value.clone()).unwrap_or_else(|_| unreachable!());
        assert_eq!(restored.to_value(), value);
        // Entity index was rebuilt correctly
        assert_eq!(restored.facts_for_entity("alpha").len(), 2);
    }

    #[test]
    fn test_merge_combines_all() {
        let mut a = EvidenceLedger::default();
        a.add_fact(fact("from a", "src/a.rs", 1, &["X"]));
        let mut b = EvidenceLedger::default();
        b.add_fact(fact("from b", "src/b.rs", 1, &["X"]));
        let merged = a.merge(&b);
        assert_eq!(merged.facts_count(), 2);
        assert_eq!(merged.facts_for_entity("x").len(), 2);
    }

    #[test]
    fn test_replace_constants_preserves_facts() {
        let mut ledger = EvidenceLedger::from_chunks(&[chunk_with_constant("OLD", "1")]);
        ledger.add_fact(fact("kept fact", "src/a.rs", 1, &[]));
        let replaced =
            ledger.replace_constants_from_chunks(&[chunk_with_constant("NEW", "2")]);
        assert_eq!(replaced.constants_count(), 1);
        assert!(replaced.constants.contains_key("src/cfg.rs:NEW"));
        assert_eq!(replaced.facts_count(), 1);
    }
}
