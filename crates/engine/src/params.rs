//! Runtime-tunable engine parameters.

use serde::Deserialize;

use crate::error::{EngineResult, QueryError};

/// Knobs recognized by the planner, the cache and the lazy scan machinery.
/// Field names use the external kebab-case keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeParameters {
    /// DP join enumeration is used while the estimated number of connected
    /// subgraphs stays at or below this budget; greedy planning otherwise.
    pub query_planning_budget: u64,
    pub cache_max_num_entries: usize,
    /// Total cache size in bytes.
    pub cache_max_size: usize,
    /// Largest single cacheable result in bytes.
    pub cache_max_size_single_entry: usize,
    /// Queue capacity (in blocks) of streaming scans and lazy producers.
    pub lazy_index_scan_queue_size: usize,
    pub lazy_index_scan_num_threads: usize,
    /// A `Sort` whose estimated input exceeds this factor times the memory
    /// cap is considered prohibitive during planning.
    pub sort_estimate_cancellation_factor: f64,
    /// Include timing metadata in the engine's own JSON export format.
    pub sparql_results_json_with_time: bool,
}

impl Default for RuntimeParameters {
    fn default() -> RuntimeParameters {
        RuntimeParameters {
            query_planning_budget: 1500,
            cache_max_num_entries: 1000,
            cache_max_size: 1 << 30,
            cache_max_size_single_entry: 1 << 28,
            lazy_index_scan_queue_size: 20,
            lazy_index_scan_num_threads: 10,
            sort_estimate_cancellation_factor: 3.0,
            sparql_results_json_with_time: false,
        }
    }
}

impl RuntimeParameters {
    /// Set one parameter from its external key and string value; the
    /// frontend wires `?key=value` pairs through here.
    pub fn set_from_str(&mut self, key: &str, value: &str) -> EngineResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> EngineResult<T> {
            value.parse().map_err(|_| {
                QueryError::UnsupportedFeature(format!(
                    "Invalid value {value:?} for runtime parameter {key:?}"
                ))
            })
        }
        match key {
            "query-planning-budget" => self.query_planning_budget = parse(key, value)?,
            "cache-max-num-entries" => self.cache_max_num_entries = parse(key, value)?,
            "cache-max-size" => self.cache_max_size = parse(key, value)?,
            "cache-max-size-single-entry" => {
                self.cache_max_size_single_entry = parse(key, value)?
            }
            "lazy-index-scan-queue-size" => {
                self.lazy_index_scan_queue_size = parse(key, value)?
            }
            "lazy-index-scan-num-threads" => {
                self.lazy_index_scan_num_threads = parse(key, value)?
            }
            "sort-estimate-cancellation-factor" => {
                self.sort_estimate_cancellation_factor = parse(key, value)?
            }
            "sparql-results-json-with-time" => {
                self.sparql_results_json_with_time = parse(key, value)?
            }
            _ => {
                return Err(QueryError::UnsupportedFeature(format!(
                    "Unknown runtime parameter {key:?}"
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let mut params = RuntimeParameters::default();
        assert_eq!(params.query_planning_budget, 1500);
        params.set_from_str("query-planning-budget", "7").unwrap();
        assert_eq!(params.query_planning_budget, 7);
        params
            .set_from_str("sparql-results-json-with-time", "true")
            .unwrap();
        assert!(params.sparql_results_json_with_time);
        assert!(params.set_from_str("no-such-key", "1").is_err());
        assert!(params.set_from_str("cache-max-size", "abc").is_err());
    }

    #[test]
    fn deserializes_from_json() {
        let params: RuntimeParameters =
            serde_json::from_str(r#"{"query-planning-budget": 42}"#).unwrap();
        assert_eq!(params.query_planning_budget, 42);
        assert_eq!(params.cache_max_num_entries, 1000);
    }
}
