// 📜 Audit Trail - every run, verdict and merge decision is an event
//
// One fixed `events` table in SQLite. Events are append-only and grouped by
// run id so a run can be replayed against its policy fingerprint.

use crate::classifier::{PolicySnapshot, VerdictBasis};
use crate::merger::ProvenanceEntry;
use crate::verdict::Verdicts;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl AuditEvent {
    pub fn new(
        run_id: &str,
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Fresh run identifier
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn open_audit_store(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open audit store {}", path.display()))?;
    setup_audit_store(&conn)?;
    Ok(conn)
}

pub fn setup_audit_store(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id)",
        [],
    )?;

    Ok(())
}

pub fn insert_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, run_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_id,
            event.run_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

// ============================================================================
// RUN / VERDICT / PROVENANCE EVENTS
// ============================================================================

pub fn record_run_started(
    conn: &Connection,
    run_id: &str,
    command: &str,
    policy: &PolicySnapshot,
) -> Result<()> {
    let event = AuditEvent::new(
        run_id,
        "run_started",
        "run",
        run_id,
        json!({
            "command": command,
            "significance_threshold": policy.significance_threshold,
            "policy": policy.summary,
            "policy_fingerprint": policy.fingerprint,
            "version": crate::VERSION,
        }),
        "cli",
    );
    insert_event(conn, &event)
}

/// `run_started` for a merge: the policies are the ones recorded in the verdict
/// table being merged, one entry per distinct fingerprint
pub fn record_merge_started(conn: &Connection, run_id: &str, verdicts: &Verdicts) -> Result<()> {
    let mut policies: BTreeMap<&str, &PolicySnapshot> = BTreeMap::new();
    for verdict in verdicts.values() {
        policies.entry(verdict.policy.fingerprint.as_str()).or_insert(&verdict.policy);
    }

    let policies: Vec<serde_json::Value> = policies
        .values()
        .map(|policy| {
            json!({
                "significance_threshold": policy.significance_threshold,
                "policy": policy.summary,
                "policy_fingerprint": policy.fingerprint,
            })
        })
        .collect();

    let event = AuditEvent::new(
        run_id,
        "run_started",
        "run",
        run_id,
        json!({
            "command": "merge",
            "verdicts": verdicts.len(),
            "policies": policies,
            "version": crate::VERSION,
        }),
        "cli",
    );
    insert_event(conn, &event)
}

pub fn record_run_finished(conn: &Connection, run_id: &str, summary: serde_json::Value) -> Result<()> {
    let event = AuditEvent::new(run_id, "run_finished", "run", run_id, summary, "cli");
    insert_event(conn, &event)
}

/// One `verdict_recorded` event per building, in a single transaction
pub fn record_verdicts(conn: &Connection, run_id: &str, verdicts: &Verdicts) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;

    for verdict in verdicts.values() {
        let basis = match &verdict.basis {
            VerdictBasis::Statistics { statistics, tests } => json!({
                "statistics": statistics,
                "tests": tests,
            }),
            VerdictBasis::Incomparable(reason) => json!({ "incomparable": reason }),
        };

        let event = AuditEvent::new(
            run_id,
            "verdict_recorded",
            "building",
            verdict.building_id.as_str(),
            json!({
                "status": verdict.status(),
                "changed": verdict.changed,
                "basis": basis,
                "policy_fingerprint": verdict.policy.fingerprint,
            }),
            "classifier",
        );
        insert_event(&tx, &event)?;
    }

    tx.commit()?;
    Ok(verdicts.len())
}

/// One `merge_decision` event per provenance entry, in a single transaction
pub fn record_provenance(conn: &Connection, run_id: &str, provenance: &[ProvenanceEntry]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;

    for entry in provenance {
        let event = AuditEvent::new(
            run_id,
            "merge_decision",
            "building",
            entry.building_id.as_str(),
            json!({
                "provenance": entry.tag.as_str(),
                "source_epoch": entry.source_epoch,
                "verdict": entry.verdict,
                "issue": entry.issue,
            }),
            "merger",
        );
        insert_event(&tx, &event)?;
    }

    tx.commit()?;
    Ok(provenance.len())
}

// ============================================================================
// QUERIES
// ============================================================================

/// Events for one building across all runs, oldest first
pub fn get_events_for_building(conn: &Connection, building_id: &str) -> Result<Vec<AuditEvent>> {
    query_events(
        conn,
        "WHERE entity_type = 'building' AND entity_id = ?1 ORDER BY id ASC",
        building_id,
    )
}

pub fn get_events_for_run(conn: &Connection, run_id: &str) -> Result<Vec<AuditEvent>> {
    query_events(conn, "WHERE run_id = ?1 ORDER BY id ASC", run_id)
}

fn query_events(conn: &Connection, filter: &str, key: &str) -> Result<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT event_id, run_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events {}",
        filter
    ))?;

    let events = stmt
        .query_map(params![key], |row| {
            let timestamp_str: String = row.get(2)?;
            let data_json: String = row.get(6)?;

            Ok(AuditEvent {
                event_id: row.get(0)?,
                run_id: row.get(1)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
                    .with_timezone(&Utc),
                event_type: row.get(3)?,
                entity_type: row.get(4)?,
                entity_id: row.get(5)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
                actor: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================
