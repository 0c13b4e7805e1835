use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::record::Record;

/// How identity fields are combined into a comparable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DedupStrategy {
    /// All identity fields must match position by position.
    Tuple,
    /// Identity fields share one namespace; any shared value is a collision.
    FirstMatch,
}

impl fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupStrategy::Tuple => f.write_str("tuple"),
            DedupStrategy::FirstMatch => f.write_str("first-match"),
        }
    }
}

/// Strategy plus the ordered identity fields it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRules {
    pub strategy: DedupStrategy,
    pub fields: Vec<String>,
}

impl IdentityRules {
    pub fn new<I, S>(strategy: DedupStrategy, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IdentityRules {
            strategy,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Normalized identity values in field order, absent ones included.
    fn components(&self, record: &Record) -> Vec<Option<String>> {
        self.fields
            .iter()
            .map(|f| normalize(record.get(f)))
            .collect()
    }
}

const NAN_LIKE: &[&str] = &["nan", "none", "null", "n/a", "na", "nat"];

/// Canonical form of one raw identity value, or `None` when absent.
///
/// Accepts integers, integer-valued floats (`"2101234567.0"`, `"2.1e9"`) and
/// numeric strings with phone formatting (`"+30 (210) 123-4567"`,
/// `"210.3612345"`). Anything else normalizes to absent.
pub fn normalize(raw: Option<&str>) -> Option<String> {
    let s = raw?.trim();
    if s.is_empty() || NAN_LIKE.iter().any(|n| s.eq_ignore_ascii_case(n)) {
        return None;
    }

    if is_float_form(s) {
        if let Ok(v) = s.parse::<f64>() {
            return integral(v);
        }
    }

    let body = s.strip_prefix('+').unwrap_or(s);
    let digits: String = body
        .chars()
        .filter(|c| !(c.is_whitespace() || matches!(c, '-' | '(' | ')' | '.' | '/')))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let trimmed = digits.trim_start_matches('0');
    Some(if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() })
}

/// Exponent notation or a `.0` decimal artifact. Any other dot is a separator.
fn is_float_form(s: &str) -> bool {
    if s.contains(['e', 'E']) {
        return true;
    }
    match s.split_once('.') {
        Some((int, frac)) => {
            !int.is_empty() && !frac.is_empty() && !frac.contains('.') && frac.bytes().all(|b| b == b'0')
        }
        None => false,
    }
}

fn integral(v: f64) -> Option<String> {
    // 2^53: beyond this f64 no longer holds every integer exactly
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if !v.is_finite() || v.fract() != 0.0 || v < 0.0 || v > MAX_EXACT {
        return None;
    }
    Some(format!("{}", v as u64))
}

/// Comparable identity of a record under one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Tuple(Vec<Option<String>>),
    FirstMatch(Option<String>),
}

impl IdentityKey {
    /// All-absent keys never collide with anything.
    pub fn is_absent(&self) -> bool {
        match self {
            IdentityKey::Tuple(parts) => parts.iter().all(Option::is_none),
            IdentityKey::FirstMatch(v) => v.is_none(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Tuple(parts) => {
                let shown: Vec<&str> = parts.iter().map(|p| p.as_deref().unwrap_or("-")).collect();
                write!(f, "({})", shown.join(", "))
            }
            IdentityKey::FirstMatch(v) => f.write_str(v.as_deref().unwrap_or("-")),
        }
    }
}

pub fn compute_key(record: &Record, rules: &IdentityRules) -> IdentityKey {
    let parts = rules.components(record);
    match rules.strategy {
        DedupStrategy::Tuple => IdentityKey::Tuple(parts),
        DedupStrategy::FirstMatch => IdentityKey::FirstMatch(parts.into_iter().flatten().next()),
    }
}

/// An earlier record a candidate collides with, and the identity they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub pos: usize,
    /// Under first-match this is the shared value, not the candidate's first one.
    pub key: IdentityKey,
}

/// Collision lookup over a growing sequence of records. Each key or value
/// remembers the position of the first record that registered it.
#[derive(Debug, Clone)]
pub struct KeyIndex {
    rules: IdentityRules,
    tuples: HashMap<Vec<Option<String>>, usize>,
    values: HashMap<String, usize>,
}

impl KeyIndex {
    pub fn new(rules: IdentityRules) -> Self {
        KeyIndex {
            rules,
            tuples: HashMap::new(),
            values: HashMap::new(),
        }
    }

    /// Index `records`, positions counted from zero. Later collisions keep
    /// the earlier position.
    pub fn build<'a, I>(rules: IdentityRules, records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut index = KeyIndex::new(rules);
        for (pos, record) in records.into_iter().enumerate() {
            index.insert(record, pos);
        }
        index
    }

    /// Earliest indexed record `record` collides with.
    pub fn collision(&self, record: &Record) -> Option<Collision> {
        let parts = self.rules.components(record);
        match self.rules.strategy {
            DedupStrategy::Tuple => {
                if parts.iter().all(Option::is_none) {
                    return None;
                }
                let pos = self.tuples.get(&parts).copied()?;
                Some(Collision {
                    pos,
                    key: IdentityKey::Tuple(parts),
                })
            }
            DedupStrategy::FirstMatch => parts
                .into_iter()
                .flatten()
                .filter_map(|v| self.values.get(&v).map(|&pos| (pos, v)))
                .min_by_key(|(pos, _)| *pos)
                .map(|(pos, v)| Collision {
                    pos,
                    key: IdentityKey::FirstMatch(Some(v)),
                }),
        }
    }

    /// Position of the earliest indexed record `record` collides with.
    pub fn find(&self, record: &Record) -> Option<usize> {
        self.collision(record).map(|c| c.pos)
    }

    pub fn insert(&mut self, record: &Record, pos: usize) {
        let parts = self.rules.components(record);
        match self.rules.strategy {
            DedupStrategy::Tuple => {
                if parts.iter().any(Option::is_some) {
                    self.tuples.entry(parts).or_insert(pos);
                }
            }
            DedupStrategy::FirstMatch => {
                for v in parts.into_iter().flatten() {
                    self.values.entry(v).or_insert(pos);
                }
            }
        }
    }

    /// Insert unless it collides; on collision return what it collided with.
    pub fn admit(&mut self, record: &Record, pos: usize) -> Result<(), Collision> {
        match self.collision(record) {
            Some(hit) => Err(hit),
            None => {
                self.insert(record, pos);
                Ok(())
            }
        }
    }
}
