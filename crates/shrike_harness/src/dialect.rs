//! Per-DBMS error classification.
//!
//! Given the vendor error code and SQLSTATE a driver reported, decide
//! whether the worker should retry the same transaction, give up on it
//! and move to a different one, or treat the run as broken. The decision
//! table distinguishes *contention* (deadlocks, serialization failures —
//! retry), *harness-induced conditions* (statement cancelled, empty
//! result set — retry a different transaction), and *environmental
//! failure* (out of memory, internal errors — fatal).

use shrike_common::types::DatabaseType;

/// What the worker should do with a classified database error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Contention; re-attempt the same transaction.
    Retry,
    /// Expected interference (cancellation, no results); discard this
    /// transaction and move on.
    RetryDifferent,
    /// Environmental failure; propagate and wrap the run.
    Fatal,
    /// Not in the table. Callers log it and conservatively retry so that
    /// driver quirks do not stall a benchmark.
    UnknownRetry,
}

/// Which DBMS families a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbClass {
    Any,
    /// MySQL and MariaDB share a wire protocol and error space.
    MysqlFamily,
    /// Postgres and CockroachDB share SQLSTATE semantics for
    /// serialization failures.
    PgFamily,
    Postgres,
    Sqlserver,
    Oracle,
    Db2,
}

impl DbClass {
    fn matches(self, db: DatabaseType) -> bool {
        match self {
            DbClass::Any => true,
            DbClass::MysqlFamily => matches!(db, DatabaseType::Mysql | DatabaseType::Mariadb),
            DbClass::PgFamily => matches!(db, DatabaseType::Postgres | DatabaseType::Cockroachdb),
            DbClass::Postgres => db == DatabaseType::Postgres,
            DbClass::Sqlserver => db == DatabaseType::Sqlserver,
            DbClass::Oracle => db == DatabaseType::Oracle,
            DbClass::Db2 => db == DatabaseType::Db2,
        }
    }
}

struct Rule {
    db: DbClass,
    code: i32,
    sql_state: &'static str,
    action: ErrorAction,
}

/// First match wins.
const RULES: &[Rule] = &[
    // MySQL / MariaDB
    Rule {
        db: DbClass::MysqlFamily,
        code: 1213,
        sql_state: "40001",
        action: ErrorAction::Retry, // deadlock
    },
    Rule {
        db: DbClass::MysqlFamily,
        code: 1205,
        sql_state: "41000",
        action: ErrorAction::Retry, // lock wait timeout
    },
    // SQL Server
    Rule {
        db: DbClass::Sqlserver,
        code: 1205,
        sql_state: "40001",
        action: ErrorAction::Retry, // deadlock victim
    },
    // Postgres / CockroachDB
    Rule {
        db: DbClass::PgFamily,
        code: 0,
        sql_state: "40001",
        action: ErrorAction::Retry, // serialization failure
    },
    Rule {
        db: DbClass::Postgres,
        code: 0,
        sql_state: "53200",
        action: ErrorAction::Fatal, // out of memory
    },
    Rule {
        db: DbClass::Postgres,
        code: 0,
        sql_state: "XX000",
        action: ErrorAction::Fatal, // internal error
    },
    // Oracle
    Rule {
        db: DbClass::Oracle,
        code: 8177,
        sql_state: "72000",
        action: ErrorAction::Retry, // ORA-08177 can't serialize access
    },
    // DB2
    Rule {
        db: DbClass::Db2,
        code: -911,
        sql_state: "40001",
        action: ErrorAction::Retry, // deadlock or timeout rollback
    },
    // Statement cancelled. The driver cancels in-flight statements when it
    // advances the run state, so this is expected on every backend; DB2
    // additionally reports it as -952.
    Rule {
        db: DbClass::Any,
        code: 0,
        sql_state: "57014",
        action: ErrorAction::RetryDifferent,
    },
    Rule {
        db: DbClass::Any,
        code: -952,
        sql_state: "57014",
        action: ErrorAction::RetryDifferent,
    },
    // No rows returned. Unusual but harmless; pick a different transaction.
    Rule {
        db: DbClass::Any,
        code: 0,
        sql_state: "02000",
        action: ErrorAction::RetryDifferent,
    },
];

/// Classify a database error. Pure; callers decide what to log.
///
/// A missing SQLSTATE classifies as [`ErrorAction::UnknownRetry`]: some
/// drivers drop the state on transient failures and stalling the run over
/// them helps nobody.
pub fn classify(db: DatabaseType, code: i32, sql_state: Option<&str>) -> ErrorAction {
    let Some(state) = sql_state else {
        return ErrorAction::UnknownRetry;
    };
    for rule in RULES {
        if rule.db.matches(db) && rule.code == code && rule.sql_state == state {
            return rule.action;
        }
    }
    ErrorAction::UnknownRetry
}
