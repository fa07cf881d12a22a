use std::cmp::Ordering;

use crate::query::params::{GroupResult, QueryParams, QueryResults, ResultMap};

fn merge_maps(into: &mut ResultMap, from: ResultMap) {
    for (key, result) in from {
        match into.get_mut(&key) {
            Some(existing) => existing.combine(&result),
            None => {
                into.insert(key, result);
            }
        }
    }
}

/// Fold one partial result into another. Group maps merge key by key,
/// rollups merge directly and retained rows are appended.
pub fn combine(into: &mut QueryResults, from: QueryResults) {
    into.cumulative.combine(&from.cumulative);
    merge_maps(&mut into.results, from.results);

    for (bucket, grouped) in from.time_results {
        merge_maps(into.time_results.entry(bucket).or_default(), grouped);
    }
    for (bucket, rollup) in from.time_cumulative {
        match into.time_cumulative.get_mut(&bucket) {
            Some(existing) => existing.combine(&rollup),
            None => {
                into.time_cumulative.insert(bucket, rollup);
            }
        }
    }

    into.matched.extend(from.matched);
}

/// Merge a batch of partial results in one pass.
pub fn combine_all(parts: impl IntoIterator<Item = QueryResults>) -> QueryResults {
    parts
        .into_iter()
        .fold(QueryResults::new(), |mut acc, part| {
            combine(&mut acc, part);
            acc
        })
}

fn sort_value(result: &GroupResult, order_by: Option<&str>) -> f64 {
    match order_by {
        Some(name) => result.hist(name).map_or(f64::MIN, |h| h.mean()),
        None => result.count as f64,
    }
}

/// Order groups descending by count, or by the mean of `order_by`, and
/// keep the top `limit`. Ties break on the group key.
pub fn sort_results(results: &mut QueryResults, params: &QueryParams) {
    let order_by = params.order_by.as_deref();
    let mut sorted: Vec<GroupResult> = results.results.values().cloned().collect();
    sorted.sort_by(|a, b| {
        sort_value(b, order_by)
            .partial_cmp(&sort_value(a, order_by))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.group_key.cmp(&b.group_key))
    });
    sorted.truncate(params.limit);
    results.sorted = sorted;

    if params.samples {
        results.matched.truncate(params.limit);
    }
}
