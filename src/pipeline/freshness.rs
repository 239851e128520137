use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::FreshnessRecord;
use super::schema::SchemaIntrospector;
use crate::db::{ColumnInfo, QueryExecutor};
use crate::error::DataStoreError;

/// Upper bound on business date columns checked per table.
const MAX_BUSINESS_CANDIDATES: usize = 8;

const TEMPORAL_TYPES: &[&str] = &[
    "date",
    "datetime",
    "datetime2",
    "smalldatetime",
    "datetimeoffset",
    "timestamp",
];

/// Temporal by type, or by a `_DT` / `_DATE` / `DATE` naming convention.
pub fn is_date_candidate(column: &ColumnInfo) -> bool {
    let ty = column.data_type.to_lowercase();
    let name = column.name.to_uppercase();
    TEMPORAL_TYPES.contains(&ty.as_str())
        || ty.starts_with("timestamp")
        || name.ends_with("_DT")
        || name.ends_with("_DATE")
        || name.contains("DATE")
}

fn is_audit(name: &str, audit_columns: &[String]) -> bool {
    audit_columns.iter().any(|a| a.eq_ignore_ascii_case(name))
}

/// Date-like columns with business dates first and audit columns last.
pub fn date_columns(columns: &[ColumnInfo], audit_columns: &[String]) -> Vec<String> {
    let mut found: Vec<String> = columns
        .iter()
        .filter(|c| is_date_candidate(c))
        .map(|c| c.name.clone())
        .collect();
    // stable sort keeps catalog order inside each group
    found.sort_by_key(|name| is_audit(name, audit_columns));
    found
}

/// Whole days between the date part of `max_value` and `today`.
pub fn lag_days(max_value: &str, today: NaiveDate) -> Option<i64> {
    let date_part = max_value.get(..10)?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    Some((today - date).num_days())
}

/// Keep only tables lagging more than `threshold_days`.
pub fn stale_only(
    records: BTreeMap<String, FreshnessRecord>,
    threshold_days: i64,
) -> BTreeMap<String, FreshnessRecord> {
    records
        .into_iter()
        .filter(|(_, r)| r.lag_days.is_some_and(|lag| lag > threshold_days))
        .collect()
}

pub struct FreshnessAnalyzer {
    schema: Arc<SchemaIntrospector>,
    executor: Arc<dyn QueryExecutor>,
    audit_columns: Vec<String>,
}

impl FreshnessAnalyzer {
    pub fn new(
        schema: Arc<SchemaIntrospector>,
        executor: Arc<dyn QueryExecutor>,
        audit_columns: Vec<String>,
    ) -> Self {
        Self {
            schema,
            executor,
            audit_columns,
        }
    }

    pub fn audit_columns(&self) -> &[String] {
        &self.audit_columns
    }

    /// Freshness for each table that has any date-like column.
    pub async fn analyze(
        &self,
        tables: &[String],
        today: NaiveDate,
    ) -> Result<BTreeMap<String, FreshnessRecord>, DataStoreError> {
        let mut out = BTreeMap::new();
        for table in tables {
            let columns = self.schema.columns(table).await?;
            if let Some(record) = self.table_freshness(table, &columns, today).await {
                out.insert(table.clone(), record);
            }
        }
        Ok(out)
    }

    async fn table_freshness(
        &self,
        table: &str,
        columns: &[ColumnInfo],
        today: NaiveDate,
    ) -> Option<FreshnessRecord> {
        let candidates = date_columns(columns, &self.audit_columns);
        if candidates.is_empty() {
            return None;
        }

        // audit columns in configured preference order
        for audit in &self.audit_columns {
            let Some(column) = candidates.iter().find(|c| c.eq_ignore_ascii_case(audit)) else {
                continue;
            };
            if let Some(max) = self.max_of(table, column).await {
                return Some(self.record(table, column, Some(max), today));
            }
        }

        // otherwise the business date that reaches furthest
        let mut best: Option<(NaiveDate, String, String)> = None;
        for column in candidates
            .iter()
            .filter(|c| !is_audit(c, &self.audit_columns))
            .take(MAX_BUSINESS_CANDIDATES)
        {
            let Some(max) = self.max_of(table, column).await else {
                continue;
            };
            let Some(date) = max.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(d, _, _)| date > *d) {
                best = Some((date, column.clone(), max));
            }
        }

        match best {
            Some((_, column, max)) => Some(self.record(table, &column, Some(max), today)),
            None => Some(self.record(table, &candidates[0], None, today)),
        }
    }

    async fn max_of(&self, table: &str, column: &str) -> Option<String> {
        match self.executor.max_value(table, column).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not read MAX({}) from {}: {}", column, table, e);
                None
            }
        }
    }

    fn record(&self, table: &str, column: &str, max: Option<String>, today: NaiveDate) -> FreshnessRecord {
        let lag = max.as_deref().and_then(|m| lag_days(m, today));
        debug!("Freshness {}.{}: max={:?} lag={:?}", table, column, max, lag);
        FreshnessRecord {
            table: table.to_string(),
            chosen_column: column.to_string(),
            max_value: max,
            lag_days: lag,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::ExecutionResult;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Executor with canned MAX values and scripted query results.
    #[derive(Default)]
    pub struct FakeExecutor {
        pub max_values: HashMap<(String, String), String>,
        pub results: Mutex<Vec<Result<ExecutionResult, String>>>,
        pub executed: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        pub fn with_max(mut self, table: &str, column: &str, value: &str) -> Self {
            self.max_values
                .insert((table.to_lowercase(), column.to_lowercase()), value.to_string());
            self
        }

        pub fn push_result(&self, result: Result<ExecutionResult, String>) {
            self.results.lock().unwrap().push(result);
        }

        pub fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for FakeExecutor {
        async fn execute(&self, sql: &str) -> Result<ExecutionResult, DataStoreError> {
            self.executed.lock().unwrap().push(sql.to_string());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                return Ok(ExecutionResult::default());
            }
            results.remove(0).map_err(DataStoreError::Encoding)
        }

        async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>, DataStoreError> {
            Ok(self
                .max_values
                .get(&(table.to_lowercase(), column.to_lowercase()))
                .cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeExecutor;
    use super::*;
    use crate::pipeline::schema::testing::StaticCatalog;

    fn col(name: &str, ty: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: ty.to_string(),
        }
    }

    fn audit() -> Vec<String> {
        vec!["LAST_UPDATED_TS".to_string(), "INSERTED_ON".to_string()]
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 20).unwrap()
    }

    #[test]
    fn detects_date_columns_and_orders_audit_last() {
        let columns = vec![
            col("LAST_UPDATED_TS", "TIMESTAMP"),
            col("ACCT_ID", "INTEGER"),
            col("OPEN_DT", "VARCHAR"),
            col("MATURITY_DATE", "DATE"),
            col("UPDATEDATE", "VARCHAR"),
            col("created", "datetime2"),
        ];
        assert_eq!(
            date_columns(&columns, &audit()),
            vec!["OPEN_DT", "MATURITY_DATE", "UPDATEDATE", "created", "LAST_UPDATED_TS"]
        );
    }

    #[test]
    fn lag_from_date_prefix() {
        assert_eq!(lag_days("2025-03-15 08:00:00", today()), Some(5));
        assert_eq!(lag_days("2025-03-20", today()), Some(0));
        assert_eq!(lag_days("not a date", today()), None);
    }

    fn analyzer(catalog: StaticCatalog, executor: FakeExecutor) -> FreshnessAnalyzer {
        FreshnessAnalyzer::new(
            Arc::new(SchemaIntrospector::new(Arc::new(catalog))),
            Arc::new(executor),
            audit(),
        )
    }

    #[tokio::test]
    async fn audit_column_wins_when_populated() {
        let catalog = StaticCatalog::new(&[(
            "accounts",
            &[("OPEN_DT", "DATE"), ("LAST_UPDATED_TS", "TIMESTAMP")],
        )]);
        let exec = FakeExecutor::default()
            .with_max("accounts", "OPEN_DT", "2025-03-19")
            .with_max("accounts", "LAST_UPDATED_TS", "2025-03-10 23:59:59");
        let records = analyzer(catalog, exec)
            .analyze(&["accounts".to_string()], today())
            .await
            .unwrap();
        let rec = &records["accounts"];
        assert_eq!(rec.chosen_column, "LAST_UPDATED_TS");
        assert_eq!(rec.lag_days, Some(10));
    }

    #[tokio::test]
    async fn falls_back_to_latest_business_date() {
        let catalog = StaticCatalog::new(&[(
            "loans",
            &[("DISBURSED_DT", "DATE"), ("MATURITY_DT", "DATE"), ("INSERTED_ON", "DATE")],
        )]);
        let exec = FakeExecutor::default()
            .with_max("loans", "DISBURSED_DT", "2025-03-01")
            .with_max("loans", "MATURITY_DT", "2030-01-01");
        let records = analyzer(catalog, exec)
            .analyze(&["loans".to_string()], today())
            .await
            .unwrap();
        assert_eq!(records["loans"].chosen_column, "MATURITY_DT");
        assert!(records["loans"].lag_days.unwrap() < 0);
    }

    #[tokio::test]
    async fn stale_filter_uses_strict_threshold() {
        let catalog = StaticCatalog::new(&[
            ("a", &[("A_DT", "DATE")]),
            ("b", &[("B_DT", "DATE")]),
            ("c", &[("ID", "INTEGER")]),
        ]);
        let exec = FakeExecutor::default()
            .with_max("a", "A_DT", "2025-03-17")
            .with_max("b", "B_DT", "2025-03-16");
        let tables: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let records = analyzer(catalog, exec).analyze(&tables, today()).await.unwrap();
        assert_eq!(records.len(), 2);

        let stale = stale_only(records, 3);
        assert_eq!(stale.keys().collect::<Vec<_>>(), vec!["b"]);
    }
}
