use super::{distribution_result, distribution_rows, Aggregator};
use indexmap::IndexMap;
use relay_core::{
    distribution::{format_alternatives, parse_alternatives, DistributionRow, DEMOGRAPHICS_FILE_NAME},
    Obfuscator, QueryResult,
};

const DESCRIPTION: &str = "Demographics distribution";

pub const CODE_SEX: &str = "SEX";
pub const CODE_GENOMICS: &str = "GENOMICS";
/// Dropped from every input: no privacy-safe way to merge age quantiles exists yet.
pub const CODE_AGE: &str = "AGE";

/// Key layout of a code's `ALTERNATIVES` sub-distribution.
struct KeySchema {
    /// Emitted first, in this order, even when zero.
    known: &'static [&'static str],
    /// Whether keys outside `known` are kept.
    open: bool,
}

const OPEN: KeySchema = KeySchema {
    known: &[],
    open: true,
};

fn schema_for(code: &str) -> KeySchema {
    match code {
        CODE_SEX => KeySchema {
            known: &["Female", "Male"],
            open: false,
        },
        CODE_GENOMICS => KeySchema {
            known: &["No"],
            open: true,
        },
        _ => OPEN,
    }
}

struct MergedRow {
    row: DistributionRow,
    keys: IndexMap<String, i64>,
}

impl MergedRow {
    fn new(code: &str, template: DistributionRow) -> Self {
        let keys = schema_for(code)
            .known
            .iter()
            .map(|k| (k.to_string(), 0))
            .collect();
        Self {
            row: template,
            keys,
        }
    }

    fn absorb(&mut self, code: &str, count: i64, alternatives: &str) {
        self.row.count = self.row.count.saturating_add(count);

        let schema = schema_for(code);
        for (key, value) in parse_alternatives(alternatives) {
            let allowed = schema.open || schema.known.contains(&key.as_str());
            if !allowed {
                continue;
            }
            let slot = self.keys.entry(key).or_insert(0);
            *slot = slot.saturating_add(value);
        }
    }

    fn finish(mut self, collection_id: &str, obfuscator: &Obfuscator) -> DistributionRow {
        self.row.biobank = collection_id.to_string();
        if self.keys.is_empty() {
            self.row.count = obfuscator.apply(self.row.count);
            self.row.alternatives = String::new();
            return self.row;
        }

        let pairs: Vec<(String, i64)> = self
            .keys
            .into_iter()
            .map(|(key, value)| (key, obfuscator.apply(value)))
            .collect();
        self.row.count = pairs.iter().map(|(_, v)| *v).fold(0, i64::saturating_add);
        self.row.alternatives = format_alternatives(&pairs);
        self.row
    }
}

/// Merges demographics files by code, aggregating each code's key/value sub-distribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemographicsDistributionAggregator;

impl Aggregator for DemographicsDistributionAggregator {
    fn process(
        &self,
        collection_id: &str,
        results: &[Option<String>],
        obfuscator: &Obfuscator,
    ) -> QueryResult {
        let mut merged: IndexMap<String, MergedRow> = IndexMap::new();

        for raw in results {
            for row in distribution_rows(raw.as_deref(), DEMOGRAPHICS_FILE_NAME) {
                // Codes are matched case-insensitively across nodes.
                let code = row.code.to_ascii_uppercase();
                if code == CODE_AGE {
                    continue;
                }
                let count = row.count;
                let alternatives = row.alternatives.clone();

                let entry = merged.entry(code.clone()).or_insert_with(|| {
                    MergedRow::new(
                        &code,
                        DistributionRow {
                            code: code.clone(),
                            count: 0,
                            alternatives: String::new(),
                            ..row
                        },
                    )
                });
                entry.absorb(&code, count, &alternatives);
            }
        }

        // Consumers expect the genomics row to be present even without contributions.
        merged.entry(CODE_GENOMICS.to_string()).or_insert_with(|| {
            MergedRow::new(
                CODE_GENOMICS,
                DistributionRow {
                    code: CODE_GENOMICS.to_string(),
                    description: "Genomic data available".to_string(),
                    ..Default::default()
                },
            )
        });

        let rows: Vec<DistributionRow> = merged
            .into_values()
            .map(|m| m.finish(collection_id, obfuscator))
            .collect();

        distribution_result(DEMOGRAPHICS_FILE_NAME, DESCRIPTION, &rows)
    }
}
