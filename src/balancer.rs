// src/balancer.rs
//! # Article Balancer
//!
//! Cuts a match list down to a quota without letting the largest group (by
//! language, country or keyword) swallow it.
//!
//! - `groups × min ≤ quota`: every group first gets `min` (or its whole size if
//!   smaller), the rest is shared proportionally to group size.
//! - otherwise: proportional shares with a floor of one per group.
//! - rounding is then reconciled one unit at a time until the total is
//!   exactly the quota; no group ever gets more than it has.
//!
//! Within a group the most recently published items win. The output is sorted
//! newest first.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::MatchRecord;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Language,
    Country,
    Keyword,
    None,
}

impl FromStr for GroupBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "language" | "lang" => Ok(Self::Language),
            "country" => Ok(Self::Country),
            "keyword" => Ok(Self::Keyword),
            "none" | "" => Ok(Self::None),
            other => Err(anyhow::anyhow!("unknown balancing strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub strategy: GroupBy,
    pub quota: usize,
    pub min_per_group: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            strategy: GroupBy::Language,
            quota: 200,
            min_per_group: 2,
        }
    }
}

fn group_key(m: &MatchRecord, by: GroupBy) -> String {
    match by {
        GroupBy::Language => m.language.clone(),
        GroupBy::Country => m.article.country.clone(),
        GroupBy::Keyword => m.matches.first().map(|k| k.keyword.clone()).unwrap_or_default(),
        GroupBy::None => String::new(),
    }
}

/// Per-group allocation for natural group `sizes`. Sums to `min(quota, Σsizes)`
/// and never exceeds a group's size.
pub fn allocate(sizes: &[usize], quota: usize, min_per_group: usize) -> Vec<usize> {
    let total: usize = sizes.iter().sum();
    if quota >= total {
        return sizes.to_vec();
    }
    if quota == 0 {
        return vec![0; sizes.len()];
    }
    let groups = sizes.iter().filter(|&&n| n > 0).count();

    let (mut alloc, floor): (Vec<usize>, Vec<usize>) = if groups * min_per_group <= quota {
        let mut alloc: Vec<usize> = sizes.iter().map(|&n| n.min(min_per_group)).collect();
        let floor = alloc.clone();
        let remaining = quota - alloc.iter().sum::<usize>();
        for (a, &n) in alloc.iter_mut().zip(sizes) {
            let share = remaining * n / total;
            *a += share.min(n - *a);
        }
        (alloc, floor)
    } else {
        let alloc = sizes
            .iter()
            .map(|&n| {
                if n == 0 {
                    return 0;
                }
                let share = (quota as f64 * n as f64 / total as f64).round() as usize;
                share.max(1).min(n)
            })
            .collect();
        (alloc, sizes.iter().map(|&n| n.min(1)).collect())
    };

    let mut sum: usize = alloc.iter().sum();
    while sum < quota {
        // Largest group that still has items left.
        let Some(i) = (0..sizes.len())
            .filter(|&i| alloc[i] < sizes[i])
            .max_by(|&a, &b| sizes[a].cmp(&sizes[b]).then(b.cmp(&a)))
        else {
            break;
        };
        alloc[i] += 1;
        sum += 1;
    }
    while sum > quota {
        // Largest allocation above its floor; when all sit on their floor,
        // the smallest groups give way.
        let above = (0..sizes.len())
            .filter(|&i| alloc[i] > floor[i])
            .max_by(|&a, &b| alloc[a].cmp(&alloc[b]).then(b.cmp(&a)));
        let i = match above {
            Some(i) => i,
            None => match (0..sizes.len())
                .filter(|&i| alloc[i] > 0)
                .min_by(|&a, &b| sizes[a].cmp(&sizes[b]).then(b.cmp(&a)))
            {
                Some(i) => i,
                None => break,
            },
        };
        alloc[i] -= 1;
        sum -= 1;
    }
    alloc
}

/// Subset of `matches` of size `min(quota, len)`.
pub fn balance(matches: Vec<MatchRecord>, cfg: &BalanceConfig) -> Vec<MatchRecord> {
    if cfg.strategy == GroupBy::None {
        let mut matches = matches;
        matches.truncate(cfg.quota);
        return matches;
    }
    if cfg.quota >= matches.len() {
        return matches;
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<MatchRecord>> = HashMap::new();
    for m in matches {
        let key = group_key(&m, cfg.strategy);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(m);
    }

    let sizes: Vec<usize> = order.iter().map(|k| groups[k].len()).collect();
    let alloc = allocate(&sizes, cfg.quota, cfg.min_per_group);

    let mut out = Vec::with_capacity(cfg.quota);
    for (key, take) in order.iter().zip(alloc.iter().copied()) {
        let Some(mut items) = groups.remove(key) else {
            continue;
        };
        // Newest first; undated items sort last.
        items.sort_by(|a, b| b.article.published_at.cmp(&a.article.published_at));
        tracing::debug!(target: "balancer", group = %key, natural = items.len(), allocated = take, "group allocation");
        out.extend(items.into_iter().take(take));
    }
    out.sort_by(|a, b| b.article.published_at.cmp(&a.article.published_at));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FetchedArticle, KeywordMatch};
    use chrono::{Duration, TimeZone, Utc};

    fn record(i: usize, lang: &str) -> MatchRecord {
        MatchRecord {
            article: FetchedArticle {
                title: format!("t{i}"),
                summary: String::new(),
                content: None,
                link: format!("https://x.test/{lang}/{i}"),
                published_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i as i64)),
                source_id: 1,
                source_name: "x".into(),
                country: "US".into(),
                image_url: None,
            },
            language: lang.into(),
            matches: vec![KeywordMatch {
                keyword: "k".into(),
                hits: vec![],
            }],
        }
    }

    #[test]
    fn eighty_fifteen_five() {
        assert_eq!(allocate(&[80, 15, 5], 20, 2), vec![14, 4, 2]);
    }

    #[test]
    fn proportional_mode_with_floor_one() {
        // 5 groups × min 3 > quota 4
        let a = allocate(&[50, 20, 10, 1, 1], 4, 3);
        assert_eq!(a.iter().sum::<usize>(), 4);
        assert!(a.iter().zip([50, 20, 10, 1, 1]).all(|(x, n)| *x <= n));
    }

    #[test]
    fn more_groups_than_quota() {
        let a = allocate(&[10, 9, 8, 1, 1], 3, 1);
        assert_eq!(a.iter().sum::<usize>(), 3);
    }

    #[test]
    fn small_group_gives_whole_size() {
        // group of 1 cannot receive the minimum of 3
        let a = allocate(&[30, 1, 10], 12, 3);
        assert_eq!(a.iter().sum::<usize>(), 12);
        assert_eq!(a[1], 1);
        assert!(a[2] >= 3);
    }

    #[test]
    fn quota_law_over_many_shapes() {
        let shapes: &[&[usize]] = &[&[1], &[3, 3, 3], &[100, 1], &[7, 0, 7], &[2, 2, 2, 2, 2, 2, 2], &[40, 30, 20, 10]];
        for sizes in shapes {
            let total: usize = sizes.iter().sum();
            for quota in 0..=total {
                for min in 0..4 {
                    let a = allocate(sizes, quota, min);
                    assert_eq!(a.iter().sum::<usize>(), quota, "{sizes:?} q={quota} min={min}");
                    assert!(a.iter().zip(sizes.iter()).all(|(x, n)| x <= n));
                    let groups = sizes.iter().filter(|&&n| n > 0).count();
                    if groups * min <= quota {
                        assert!(a.iter().zip(sizes.iter()).all(|(x, n)| *x >= min.min(*n)));
                    }
                }
            }
        }
    }

    #[test]
    fn balance_picks_newest_per_group() {
        let mut m: Vec<MatchRecord> = (0..80).map(|i| record(i, "en")).collect();
        m.extend((0..15).map(|i| record(i, "ar")));
        m.extend((0..5).map(|i| record(i, "fr")));
        let out = balance(
            m,
            &BalanceConfig {
                strategy: GroupBy::Language,
                quota: 20,
                min_per_group: 2,
            },
        );
        assert_eq!(out.len(), 20);
        let count = |l: &str| out.iter().filter(|r| r.language == l).count();
        assert_eq!((count("en"), count("ar"), count("fr")), (14, 4, 2));
        // newest en item is t79
        assert!(out.iter().any(|r| r.article.title == "t79" && r.language == "en"));
        assert!(!out.iter().any(|r| r.article.title == "t0" && r.language == "en"));
        assert!(out
            .windows(2)
            .all(|w| w[0].article.published_at >= w[1].article.published_at));
    }

    #[test]
    fn none_strategy_takes_prefix() {
        let m: Vec<MatchRecord> = (0..10).map(|i| record(i, "en")).collect();
        let out = balance(
            m,
            &BalanceConfig {
                strategy: GroupBy::None,
                quota: 3,
                min_per_group: 2,
            },
        );
        let titles: Vec<_> = out.iter().map(|r| r.article.title.as_str()).collect();
        assert_eq!(titles, vec!["t0", "t1", "t2"]);
    }

    #[test]
    fn under_quota_is_unchanged() {
        let m: Vec<MatchRecord> = (0..5).map(|i| record(i, "en")).collect();
        let out = balance(m.clone(), &BalanceConfig::default());
        assert_eq!(out, m);
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!("Country".parse::<GroupBy>().unwrap(), GroupBy::Country);
        assert!("planet".parse::<GroupBy>().is_err());
    }
}
