//! Error deduplication: at most one actionable report per repository.

use std::collections::HashMap;

use crate::domain::ErrorReport;

/// Collapse a batch of reports to the most recent report per repository key.
///
/// Reports without a repository key are dropped. Among reports for the same
/// key, the one with the greatest `timestamp` wins; on a tie the earliest in
/// input order is kept. Output order follows each winner's first key
/// appearance in the input.
pub fn group_by_repository(reports: Vec<ErrorReport>) -> Vec<ErrorReport> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, ErrorReport> = HashMap::new();

    for report in reports {
        let Some(key) = report.key().map(str::to_string) else {
            continue;
        };
        match latest.get(&key) {
            Some(existing) if existing.timestamp >= report.timestamp => {}
            Some(_) => {
                latest.insert(key, report);
            }
            None => {
                order.push(key.clone());
                latest.insert(key, report);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashSet;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn report(repo: &str, ts: i64) -> ErrorReport {
        ErrorReport::new(Platform::CiActions, repo, "build", format!("failure at {ts}"))
            .with_timestamp(at(ts))
    }

    #[test]
    fn keeps_most_recent_per_repo() {
        let out = group_by_repository(vec![report("a/b", 1), report("a/b", 5), report("c/d", 2)]);
        assert_eq!(out.len(), 2);
        let ab = out.iter().find(|r| r.key() == Some("a/b")).unwrap();
        let cd = out.iter().find(|r| r.key() == Some("c/d")).unwrap();
        assert_eq!(ab.timestamp, at(5));
        assert_eq!(cd.timestamp, at(2));
    }

    #[test]
    fn later_input_with_older_timestamp_loses() {
        let out = group_by_repository(vec![report("a/b", 9), report("a/b", 3)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, at(9));
    }

    #[test]
    fn unkeyed_reports_are_dropped() {
        let mut unkeyed = report("z/z", 100);
        unkeyed.repo_key = None;
        let mut blank = report("z/z", 100);
        blank.repo_key = Some(String::new());

        let out = group_by_repository(vec![unkeyed, blank, report("a/b", 1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key(), Some("a/b"));
    }

    #[test]
    fn at_most_one_report_per_key() {
        let input: Vec<_> = (0..50)
            .map(|i| report(&format!("org/repo-{}", i % 7), (i * 13 % 17) as i64))
            .collect();
        let out = group_by_repository(input);
        let keys: HashSet<_> = out.iter().filter_map(|r| r.key()).collect();
        assert_eq!(keys.len(), out.len());
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(group_by_repository(Vec::new()).is_empty());
    }
}
