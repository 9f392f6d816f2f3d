//! Sequence expressions such as `514-590, 595, 602 - 607`.

use crate::model::TargetSelector;
use std::collections::HashSet;

/// Ranges wider than this are ignored.
pub const MAX_RANGE_LEN: i64 = 1_000_000;

/// Expand `expr` into sequence numbers, in the order written.
///
/// Whitespace around commas and dashes is allowed, reversed ranges are
/// swapped and anything unparseable is skipped.
pub fn parse(expr: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.find('-') {
            Some(dash) if dash > 0 => {
                let (start, end) = (part[..dash].trim(), part[dash + 1..].trim());
                let (Ok(mut start), Ok(mut end)) = (start.parse::<i64>(), end.parse::<i64>())
                else {
                    continue;
                };
                if end < start {
                    std::mem::swap(&mut start, &mut end);
                }
                let len = end.saturating_sub(start).saturating_add(1);
                if len > 0 && len <= MAX_RANGE_LEN {
                    out.extend(start..=end);
                }
            }
            _ => {
                if let Ok(single) = part.parse::<i64>() {
                    out.push(single);
                }
            }
        }
    }
    out
}

/// Selectors for `expr`, de-duplicated, all scoped to `session_id`.
pub fn selectors(expr: &str, session_id: Option<&str>) -> Vec<TargetSelector> {
    let mut seen = HashSet::new();
    parse(expr)
        .into_iter()
        .filter(|seq| seen.insert(*seq))
        .map(|sequence_number| TargetSelector {
            sequence_number,
            session_id: session_id.map(ToString::to_string),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_ranges_and_singles() {
        assert_eq!(
            parse("514-517,595, 602 - 604"),
            vec![514, 515, 516, 517, 595, 602, 603, 604]
        );
    }

    #[test]
    fn reversed_range_is_swapped() {
        assert_eq!(parse("7-5"), vec![5, 6, 7]);
    }

    #[test]
    fn garbage_is_ignored() {
        assert_eq!(parse("abc, 3, 4-x, ,5"), vec![3, 5]);
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn huge_range_is_ignored() {
        assert!(parse("1-2000000").is_empty());
        assert_eq!(parse("1-1000000").len(), 1_000_000);
    }

    #[test]
    fn selectors_dedupe_and_carry_session() {
        let selectors = selectors("3,1-3", Some("abc"));
        let seqs: Vec<_> = selectors.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![3, 1, 2]);
        assert!(selectors.iter().all(|s| s.session_id.as_deref() == Some("abc")));
    }
}
