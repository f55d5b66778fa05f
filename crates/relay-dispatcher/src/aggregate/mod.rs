//! Per-task-type aggregation of subtask results.
//!
//! Each strategy folds the raw results reported by the targeted nodes into one obfuscated answer.
//! Missing or unparseable results count as "this node contributed nothing".

use relay_core::{
    distribution::DistributionRow, JobResult, Obfuscator, QueryResult, ResultFile, TaskType,
};
use std::{collections::HashMap, sync::Arc};

mod availability;
mod demographics;
mod generic;

pub use availability::AvailabilityAggregator;
pub use demographics::DemographicsDistributionAggregator;
pub use generic::GenericDistributionAggregator;

pub trait Aggregator: Send + Sync {
    fn process(
        &self,
        collection_id: &str,
        results: &[Option<String>],
        obfuscator: &Obfuscator,
    ) -> QueryResult;
}

/// Strategy map keyed by task type. Unknown types resolve to `None`.
#[derive(Clone, Default)]
pub struct AggregatorRegistry {
    strategies: HashMap<TaskType, Arc<dyn Aggregator>>,
}

impl std::fmt::Debug for AggregatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.strategies.keys().map(TaskType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("AggregatorRegistry")
            .field("types", &types)
            .finish()
    }
}

impl AggregatorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self::empty()
            .register(TaskType::Availability, AvailabilityAggregator)
            .register(TaskType::GenericDistribution, GenericDistributionAggregator)
            .register(
                TaskType::DemographicsDistribution,
                DemographicsDistributionAggregator,
            )
    }

    pub fn register(mut self, task_type: TaskType, aggregator: impl Aggregator + 'static) -> Self {
        self.strategies.insert(task_type, Arc::new(aggregator));
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<&dyn Aggregator> {
        self.strategies.get(&task_type).map(|a| a.as_ref())
    }
}

/// Rows of the distribution file carried by one raw subtask result.
///
/// Prefers the file called `file_name`, falling back to the first attached file.
pub(crate) fn distribution_rows(raw: Option<&str>, file_name: &str) -> Vec<DistributionRow> {
    let Some(result) = raw.and_then(JobResult::parse) else {
        return Vec::new();
    };
    let files = &result.query_result.files;
    let Some(file) = files
        .iter()
        .find(|f| f.file_name == file_name)
        .or_else(|| files.first())
    else {
        return Vec::new();
    };

    file.rows().unwrap_or_else(|err| {
        tracing::debug!(
            event = "relay.aggregate.file.unparseable",
            file = %file.file_name,
            error = %err,
            "skipping unparseable distribution file"
        );
        Vec::new()
    })
}

pub(crate) fn distribution_result(
    file_name: &str,
    description: &str,
    rows: &[DistributionRow],
) -> QueryResult {
    if rows.is_empty() {
        return QueryResult::default();
    }
    match ResultFile::distribution(file_name, description, rows) {
        Ok(file) => QueryResult {
            count: rows.len() as i64,
            dataset_count: 1,
            files: vec![file],
        },
        Err(err) => {
            tracing::error!(
                event = "relay.aggregate.file.encode_error",
                file = %file_name,
                error = %err,
                "failed to encode aggregated distribution file"
            );
            QueryResult::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use relay_core::{
        distribution::{DistributionRow, GENERIC_FILE_NAME},
        JobResult, QueryResult, ResultFile,
    };

    pub fn count_result(count: i64) -> Option<String> {
        let result = JobResult::ok(
            "sub",
            "node",
            QueryResult {
                count,
                ..Default::default()
            },
        );
        serde_json::to_string(&result).ok()
    }

    pub fn file_result(file_name: &str, rows: &[DistributionRow]) -> Option<String> {
        let result = JobResult::ok(
            "sub",
            "node",
            QueryResult {
                count: rows.len() as i64,
                dataset_count: 1,
                files: vec![ResultFile::distribution(file_name, "test", rows).ok()?],
            },
        );
        serde_json::to_string(&result).ok()
    }

    pub fn generic_result(rows: &[(&str, i64)]) -> Option<String> {
        let rows: Vec<DistributionRow> = rows
            .iter()
            .map(|(code, count)| DistributionRow {
                code: code.to_string(),
                count: *count,
                description: format!("{code} description"),
                ..Default::default()
            })
            .collect();
        file_result(GENERIC_FILE_NAME, &rows)
    }

    pub fn decode(result: &QueryResult) -> Vec<DistributionRow> {
        result
            .files
            .first()
            .map(|f| f.rows().expect("decode aggregated file"))
            .unwrap_or_default()
    }
}
