//! Decision record and trace persistence.
//!
//! The unique index on `idempotency_key` is the serialization point for
//! racing decisions: the losing writer reads back and returns the winner.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use ade_core::decision::{DecisionFilters, DecisionRecord, DecisionResult, DecisionTrace};
use ade_core::policy::PolicyType;

use super::{from_ms, new_row_id, to_ms, Database, StorageError};

/// Outcome of a decision insert.
#[derive(Debug)]
pub enum DecisionInsert {
    /// This writer won; the record is now stored.
    Inserted,
    /// Another record with the same idempotency key already exists.
    Duplicate(DecisionRecord),
}

/// Store for `decision_records` and `decision_traces`.
#[derive(Clone)]
pub struct DecisionStore {
    db: Database,
}

impl DecisionStore {
    /// Creates the store.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists a decision record, serializing on `idempotency_key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert(&self, record: &DecisionRecord) -> Result<DecisionInsert, StorageError> {
        let record = record.clone();
        self.db
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO decision_records
                     (id, decision_id, idempotency_key, service_id, policy_id,
                      policy_version, snapshot_id, decision_type, decision_result,
                      actions, confidence_score, simulation_run_id, dry_run,
                      executed_at_ms, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             ?13, ?14, ?15)",
                    params![
                        new_row_id(),
                        record.decision_id,
                        record.idempotency_key,
                        record.service_id,
                        record.policy_id,
                        record.policy_version,
                        record.snapshot_id,
                        record.decision_type.as_str(),
                        record.decision_result.as_str(),
                        serde_json::to_string(&record.actions)?,
                        record.confidence_score,
                        record.simulation_run_id,
                        record.dry_run,
                        to_ms(record.executed_at),
                        to_ms(Utc::now()),
                    ],
                )?;

                if inserted > 0 {
                    return Ok(DecisionInsert::Inserted);
                }

                // Lost the race (or a retry): hand back the winning record.
                let winner = conn
                    .query_row(
                        &format!("{SELECT_RECORD} WHERE idempotency_key = ?1"),
                        params![record.idempotency_key],
                        row_to_record,
                    )
                    .optional()?
                    .transpose()?
                    .ok_or(StorageError::NotFound {
                        entity: "decision",
                        id: record.idempotency_key.clone(),
                    })?;
                Ok(DecisionInsert::Duplicate(winner))
            })
            .await
    }

    /// Persists a decision trace.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn insert_trace(&self, trace: &DecisionTrace) -> Result<(), StorageError> {
        let trace = trace.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO decision_traces
                     (id, trace_id, decision_id, policy_id, policy_version,
                      trace_data, rules_evaluated, rules_matched, features_used,
                      execution_time_ms, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        new_row_id(),
                        trace.trace_id,
                        trace.decision_id,
                        trace.policy_id,
                        trace.policy_version,
                        serde_json::to_string(&trace.trace_data)?,
                        serde_json::to_string(&trace.rules_evaluated)?,
                        serde_json::to_string(&trace.rules_matched)?,
                        serde_json::to_string(&trace.features_used)?,
                        trace.execution_time_ms,
                        to_ms(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetches a decision by business ID.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn get(&self, decision_id: &str) -> Result<DecisionRecord, StorageError> {
        let decision_id = decision_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("{SELECT_RECORD} WHERE decision_id = ?1"),
                    params![decision_id],
                    row_to_record,
                )
                .optional()?
                .transpose()?
                .ok_or(StorageError::NotFound {
                    entity: "decision",
                    id: decision_id,
                })
            })
            .await
    }

    /// Fetches the trace belonging to a decision.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no row matches.
    pub async fn get_trace(&self, decision_id: &str) -> Result<DecisionTrace, StorageError> {
        let decision_id = decision_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT trace_id, decision_id, policy_id, policy_version,
                            trace_data, rules_evaluated, rules_matched,
                            features_used, execution_time_ms
                     FROM decision_traces WHERE decision_id = ?1",
                    params![decision_id],
                    row_to_trace,
                )
                .optional()?
                .transpose()?
                .ok_or(StorageError::NotFound {
                    entity: "decision trace",
                    id: decision_id,
                })
            })
            .await
    }

    /// Lists decisions matching the filters, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on database failure.
    pub async fn list_by_filters(
        &self,
        filters: &DecisionFilters,
    ) -> Result<Vec<DecisionRecord>, StorageError> {
        let filters = filters.clone();
        self.db
            .call(move |conn| {
                let mut clauses: Vec<&str> = Vec::new();
                let mut values: Vec<Value> = Vec::new();

                if let Some(service_id) = &filters.service_id {
                    clauses.push("service_id = ?");
                    values.push(Value::Text(service_id.clone()));
                }
                if let Some(policy_id) = &filters.policy_id {
                    clauses.push("policy_id = ?");
                    values.push(Value::Text(policy_id.clone()));
                }
                if let Some(result) = filters.decision_result {
                    clauses.push("decision_result = ?");
                    values.push(Value::Text(result.as_str().to_string()));
                }
                if let Some(from) = filters.from {
                    clauses.push("executed_at_ms >= ?");
                    values.push(Value::Integer(to_ms(from)));
                }
                if let Some(to) = filters.to {
                    clauses.push("executed_at_ms <= ?");
                    values.push(Value::Integer(to_ms(to)));
                }

                let where_clause = if clauses.is_empty() {
                    String::new()
                } else {
                    format!(" WHERE {}", clauses.join(" AND "))
                };
                values.push(Value::Integer(i64::from(filters.limit)));

                let sql = format!(
                    "{SELECT_RECORD}{where_clause}
                     ORDER BY executed_at_ms DESC
                     LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), row_to_record)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row??);
                }
                Ok(records)
            })
            .await
    }
}

const SELECT_RECORD: &str = "SELECT decision_id, idempotency_key, service_id, policy_id,
        policy_version, snapshot_id, decision_type, decision_result, actions,
        confidence_score, simulation_run_id, dry_run, executed_at_ms
 FROM decision_records";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Result<DecisionRecord, StorageError>> {
    let decision_type_raw: String = row.get(6)?;
    let decision_result_raw: String = row.get(7)?;
    let actions_raw: String = row.get(8)?;

    Ok((|| {
        let decision_type =
            PolicyType::from_str(&decision_type_raw).map_err(|e| StorageError::Corrupt {
                entity: "decision",
                reason: e.to_string(),
            })?;
        let decision_result =
            DecisionResult::from_str(&decision_result_raw).map_err(|e| StorageError::Corrupt {
                entity: "decision",
                reason: e.to_string(),
            })?;
        Ok(DecisionRecord {
            decision_id: row.get(0)?,
            idempotency_key: row.get(1)?,
            service_id: row.get(2)?,
            policy_id: row.get(3)?,
            policy_version: row.get(4)?,
            snapshot_id: row.get(5)?,
            decision_type,
            decision_result,
            actions: serde_json::from_str(&actions_raw)?,
            confidence_score: row.get(9)?,
            simulation_run_id: row.get(10)?,
            dry_run: row.get(11)?,
            executed_at: from_ms(row.get(12)?),
        })
    })())
}

fn row_to_trace(row: &Row<'_>) -> rusqlite::Result<Result<DecisionTrace, StorageError>> {
    let trace_data: String = row.get(4)?;
    let rules_evaluated: String = row.get(5)?;
    let rules_matched: String = row.get(6)?;
    let features_used: String = row.get(7)?;

    Ok((|| {
        Ok(DecisionTrace {
            trace_id: row.get(0)?,
            decision_id: row.get(1)?,
            policy_id: row.get(2)?,
            policy_version: row.get(3)?,
            trace_data: serde_json::from_str(&trace_data)?,
            rules_evaluated: serde_json::from_str(&rules_evaluated)?,
            rules_matched: serde_json::from_str(&rules_matched)?,
            features_used: serde_json::from_str(&features_used)?,
            execution_time_ms: row.get(8)?,
        })
    })())
}
