use super::{distribution_result, distribution_rows, Aggregator};
use indexmap::IndexMap;
use relay_core::{
    distribution::{DistributionRow, GENERIC_FILE_NAME},
    Obfuscator, QueryResult,
};

const DESCRIPTION: &str = "Code distribution";

/// Merges code distribution files by code.
///
/// Counts are summed across nodes and each merged row is obfuscated on its own. The statistics
/// columns of the first node reporting a code are kept as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericDistributionAggregator;

impl Aggregator for GenericDistributionAggregator {
    fn process(
        &self,
        collection_id: &str,
        results: &[Option<String>],
        obfuscator: &Obfuscator,
    ) -> QueryResult {
        let mut merged: IndexMap<String, DistributionRow> = IndexMap::new();

        for raw in results {
            for row in distribution_rows(raw.as_deref(), GENERIC_FILE_NAME) {
                match merged.get_mut(&row.code) {
                    Some(existing) => existing.count = existing.count.saturating_add(row.count),
                    None => {
                        merged.insert(row.code.clone(), row);
                    }
                }
            }
        }

        let rows: Vec<DistributionRow> = merged
            .into_values()
            .map(|mut row| {
                row.biobank = collection_id.to_string();
                row.count = obfuscator.apply(row.count);
                row
            })
            .collect();

        distribution_result(GENERIC_FILE_NAME, DESCRIPTION, &rows)
    }
}
