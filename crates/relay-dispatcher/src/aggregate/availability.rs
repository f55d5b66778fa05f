use super::Aggregator;
use relay_core::{JobResult, Obfuscator, QueryResult};

/// Sums the node counts and obfuscates the total once.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityAggregator;

impl Aggregator for AvailabilityAggregator {
    fn process(
        &self,
        _collection_id: &str,
        results: &[Option<String>],
        obfuscator: &Obfuscator,
    ) -> QueryResult {
        let total: i64 = results
            .iter()
            .filter_map(|raw| raw.as_deref().and_then(JobResult::parse))
            .map(|r| r.query_result.count)
            .fold(0, i64::saturating_add);

        QueryResult {
            count: obfuscator.apply(total),
            ..Default::default()
        }
    }
}
