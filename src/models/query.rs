use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub type Row = Map<String, Value>;

/// Canonical tabular result shared by every engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub data: Vec<Row>,
    pub row_count: usize,
    /// Execution round-trip in milliseconds
    pub duration: u64,
}

impl QueryResult {
    /// Build a result whose rows all carry exactly `columns` as keys.
    ///
    /// Missing keys are filled with `null`; keys outside `columns` are dropped.
    pub fn new(columns: Vec<String>, rows: Vec<Row>, duration: u64) -> Self {
        let data: Vec<Row> = rows
            .into_iter()
            .map(|mut row| {
                let mut shaped = Map::with_capacity(columns.len());
                for column in &columns {
                    shaped.insert(column.clone(), row.remove(column).unwrap_or(Value::Null));
                }
                shaped
            })
            .collect();

        Self {
            row_count: data.len(),
            columns,
            data,
            duration,
        }
    }

    pub fn empty(columns: Vec<String>, duration: u64) -> Self {
        Self::new(columns, Vec::new(), duration)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Disambiguate duplicate column labels: `a`, `a` becomes `a`, `a_2`
pub fn unique_column_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let names: Vec<String> = names.into_iter().map(Into::into).collect();
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut unique = Vec::with_capacity(names.len());

    for name in names {
        let mut candidate = name.clone();
        let mut suffix = 2;
        while taken.contains(&candidate) {
            candidate = format!("{}_{}", name, suffix);
            suffix += 1;
        }
        taken.insert(candidate.clone());
        unique.push(candidate);
    }

    unique
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(alias = "sql")]
    pub query: String,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

/// Gateway output: the result plus whether it came from the cache
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub result: QueryResult,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    pub data: Vec<Row>,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub duration: u64,
    pub cached: bool,
}

impl From<QueryOutcome> for QueryResponse {
    fn from(outcome: QueryOutcome) -> Self {
        Self {
            success: true,
            data: outcome.result.data,
            columns: outcome.result.columns,
            row_count: outcome.result.row_count,
            duration: outcome.result.duration,
            cached: outcome.cached,
        }
    }
}
