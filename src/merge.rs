use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::info;

use crate::identity::{IdentityRules, KeyIndex};
use crate::record::{Dataset, Record};

/// Records sharing one identity. Positions index the merged input sequence
/// (baseline rows first, then new records).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: String,
    pub kept: usize,
    pub dropped: Vec<usize>,
    /// Kept name first, then the dropped ones in order.
    pub names: Vec<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub baseline_len: usize,
    pub new_len: usize,
    pub groups: Vec<DuplicateGroup>,
    /// Every dropped position, ascending.
    pub dropped: Vec<usize>,
}

impl MergeReport {
    pub fn duplicates_removed(&self) -> usize {
        self.dropped.len()
    }

    /// Dropped positions that belonged to the baseline (it held duplicates).
    pub fn baseline_dropped(&self) -> usize {
        self.dropped.iter().filter(|&&p| p < self.baseline_len).count()
    }

    pub fn render(&self) -> String {
        if self.groups.is_empty() {
            return "No duplicates found.".to_string();
        }
        let mut out = String::new();
        for g in &self.groups {
            let mut indices = vec![g.kept];
            indices.extend(&g.dropped);
            let names: Vec<&str> = g.names.iter().map(|n| n.as_deref().unwrap_or("-")).collect();
            let _ = writeln!(out, "Indices: {:?}, Names: {:?}, Key: {}", indices, names, g.key);
        }
        let _ = write!(
            out,
            "Removed {} duplicate rows: {:?}",
            self.duplicates_removed(),
            self.dropped
        );
        out
    }
}

pub struct MergeOutcome {
    pub dataset: Dataset,
    pub report: MergeReport,
}

/// Baseline rows followed by `new` records, keeping the first record of
/// every identity and dropping later collisions. Baseline rows therefore
/// always win over newly scraped ones.
pub fn merge(baseline: Dataset, new: Vec<Record>, rules: &IdentityRules, name_field: &str) -> MergeOutcome {
    let schema = Arc::clone(baseline.schema());
    let baseline_len = baseline.len();
    let new_len = new.len();

    let mut index = KeyIndex::new(rules.clone());
    let mut kept: Vec<Record> = Vec::with_capacity(baseline_len + new_len);
    // Position in the input sequence of each kept record
    let mut kept_pos: Vec<usize> = Vec::with_capacity(baseline_len + new_len);
    let mut groups: Vec<DuplicateGroup> = Vec::new();
    let mut group_of: HashMap<usize, usize> = HashMap::new();
    let mut dropped = Vec::new();

    for (pos, record) in baseline.into_records().into_iter().chain(new).enumerate() {
        match index.admit(&record, kept.len()) {
            Ok(()) => {
                kept_pos.push(pos);
                kept.push(record);
            }
            Err(hit) => {
                dropped.push(pos);
                let slot = hit.pos;
                let first = &kept[slot];
                let gi = *group_of.entry(slot).or_insert_with(|| {
                    groups.push(DuplicateGroup {
                        key: hit.key.to_string(),
                        kept: kept_pos[slot],
                        dropped: Vec::new(),
                        names: vec![first.get(name_field).map(str::to_string)],
                    });
                    groups.len() - 1
                });
                groups[gi].dropped.push(pos);
                groups[gi].names.push(record.get(name_field).map(str::to_string));
            }
        }
    }

    if !dropped.is_empty() {
        info!(
            "Merge dropped {} duplicates across {} identities",
            dropped.len(),
            groups.len()
        );
    }

    MergeOutcome {
        dataset: Dataset::with_records(schema, kept),
        report: MergeReport {
            baseline_len,
            new_len,
            groups,
            dropped,
        },
    }
}
