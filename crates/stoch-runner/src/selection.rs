use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Selection exactly as written in the run config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionSpec {
    Id(u64),
    Text(String),
    Items(Vec<SelectionItem>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectionItem {
    Id(u64),
    Text(String),
}

/// Resolved form of a selection. Parsed once from [`SelectionSpec`] and
/// expanded against a [`Universe`] by [`expand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    List(Vec<u64>),
    Range(u64, u64),
    Union(Vec<Selection>),
}

/// The set of ids a selection may draw from.
#[derive(Debug, Clone)]
pub enum Universe {
    /// ids `1..=n`
    Count(u64),
    /// ids of a source table, in table order
    Ids(Vec<u64>),
}

impl Universe {
    fn contains(&self, id: u64) -> bool {
        match self {
            Universe::Count(n) => id >= 1 && id <= *n,
            Universe::Ids(ids) => ids.contains(&id),
        }
    }

    /// Ids of the universe inside `lo..=hi`, ascending. Cost follows the
    /// universe, not the width of the range.
    fn between(&self, lo: u64, hi: u64) -> Vec<u64> {
        match self {
            Universe::Count(n) => (lo.max(1)..=hi.min(*n)).collect(),
            Universe::Ids(ids) => {
                let mut matched: Vec<u64> =
                    ids.iter().copied().filter(|id| (lo..=hi).contains(id)).collect();
                matched.sort_unstable();
                matched.dedup();
                matched
            }
        }
    }

    fn all(&self) -> Vec<u64> {
        match self {
            Universe::Count(n) => (1..=*n).collect(),
            Universe::Ids(ids) => ids.clone(),
        }
    }
}

impl Selection {
    pub fn parse(spec: &SelectionSpec) -> EngineResult<Selection> {
        match spec {
            SelectionSpec::Id(id) => Ok(Selection::List(vec![*id])),
            SelectionSpec::Text(text) => parse_text(text),
            SelectionSpec::Items(items) => {
                if let [SelectionItem::Text(text)] = items.as_slice() {
                    if is_all(text) {
                        return Ok(Selection::All);
                    }
                }
                let mut parts = Vec::new();
                let mut ids = Vec::new();
                for item in items {
                    match item {
                        SelectionItem::Id(id) => ids.push(*id),
                        SelectionItem::Text(text) => {
                            if !ids.is_empty() {
                                parts.push(Selection::List(std::mem::take(&mut ids)));
                            }
                            parts.push(parse_text(text)?);
                        }
                    }
                }
                if parts.is_empty() {
                    return Ok(Selection::List(ids));
                }
                if !ids.is_empty() {
                    parts.push(Selection::List(ids));
                }
                Ok(Selection::Union(parts))
            }
        }
    }
}

fn is_all(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("all")
}

fn parse_text(text: &str) -> EngineResult<Selection> {
    if is_all(text) {
        return Ok(Selection::All);
    }
    let trimmed = text.trim();
    if let Ok(id) = trimmed.parse::<u64>() {
        return Ok(Selection::List(vec![id]));
    }
    let (lo, hi) = parse_range(trimmed)?;
    Ok(Selection::Range(lo, hi))
}

/// Parses an inclusive `a:b` (or `a-b`) range.
pub fn parse_range(spec: &str) -> EngineResult<(u64, u64)> {
    let invalid = |reason: &str| EngineError::InvalidRange {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };
    let (lo, hi) = spec
        .split_once(':')
        .or_else(|| spec.split_once('-'))
        .ok_or_else(|| invalid("expected 'start:end' or 'start-end'"))?;
    let lo = lo
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid("bounds must be non-negative integers"))?;
    let hi = hi
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid("bounds must be non-negative integers"))?;
    if lo > hi {
        return Err(invalid(&format!("start {} > end {}", lo, hi)));
    }
    Ok((lo, hi))
}

/// Expands `selection` into an ordered, duplicate-free id list.
///
/// `what` names the entity ("scenario", "policy") in error messages.
pub fn expand(selection: &Selection, universe: &Universe, what: &str) -> EngineResult<Vec<u64>> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    expand_into(selection, universe, what, &mut out, &mut seen)?;
    if out.is_empty() {
        return Err(EngineError::EmptySelection {
            what: format!("no {} ids selected", what),
        });
    }
    Ok(out)
}

fn expand_into(
    selection: &Selection,
    universe: &Universe,
    what: &str,
    out: &mut Vec<u64>,
    seen: &mut BTreeSet<u64>,
) -> EngineResult<()> {
    match selection {
        Selection::All => {
            for id in universe.all() {
                if seen.insert(id) {
                    out.push(id);
                }
            }
        }
        Selection::List(ids) => {
            for id in ids {
                if !universe.contains(*id) {
                    return Err(EngineError::UnknownId {
                        what: what.to_string(),
                        id: *id,
                    });
                }
                if seen.insert(*id) {
                    out.push(*id);
                }
            }
        }
        Selection::Range(lo, hi) => {
            if lo > hi {
                return Err(EngineError::InvalidRange {
                    spec: format!("{}:{}", lo, hi),
                    reason: format!("start {} > end {}", lo, hi),
                });
            }
            let matched = universe.between(*lo, *hi);
            if matched.is_empty() {
                return Err(EngineError::EmptySelection {
                    what: format!("range {}:{} matches no {} ids", lo, hi, what),
                });
            }
            for id in matched {
                if seen.insert(id) {
                    out.push(id);
                }
            }
        }
        Selection::Union(parts) => {
            for part in parts {
                expand_into(part, universe, what, out, seen)?;
            }
        }
    }
    Ok(())
}
