//! Credit ledger - durable per-identity balances in SQLite
//!
//! Every balance mutation is a single SQL statement, so concurrent callers
//! on the same identity never lose an update. Storage failures are logged
//! and degrade to a safe default (`0.0` / `false`) instead of propagating.

use crate::config::Config;
use crate::error::Result;
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    country_code TEXT NOT NULL,
    area_code TEXT NOT NULL,
    local_number TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
    balance_minutes REAL NOT NULL DEFAULT 0 CHECK (balance_minutes >= 0),
    total_messages_sent INTEGER NOT NULL DEFAULT 0,
    total_active_conversations INTEGER NOT NULL DEFAULT 0,
    activated_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    PRIMARY KEY (country_code, area_code, local_number)
);
"#;

/// Account status as stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "active" {
            AccountStatus::Active
        } else {
            AccountStatus::Inactive
        }
    }
}

/// One metered phone-number account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub identity: Identity,
    pub status: AccountStatus,
    pub balance_minutes: f64,
    pub total_messages_sent: i64,
    pub total_active_conversations: i64,
    pub activated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// SQLite-backed credit ledger
pub struct CreditLedger {
    conn: Mutex<Connection>,
    starter_balance_minutes: f64,
}

impl CreditLedger {
    /// Open (or create) the ledger database from config
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.ledger_db.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.ledger_db)?;
        Self::with_connection(conn, config.starter_balance_minutes)
    }

    /// Open a ledger at an explicit path
    pub fn open_path(path: &Path, starter_balance_minutes: f64) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, starter_balance_minutes)
    }

    /// Private in-memory ledger (tests, simulations)
    pub fn in_memory(starter_balance_minutes: f64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, starter_balance_minutes)
    }

    fn with_connection(conn: Connection, starter_balance_minutes: f64) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            starter_balance_minutes,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        // A panicking holder cannot leave a statement half-applied
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }

    /// Balance in minutes; `0.0` when the identity has no record or storage fails
    pub fn get_balance(&self, identity: &Identity) -> f64 {
        let result = self.with_conn(|conn| {
            conn.query_row(
                "SELECT balance_minutes FROM accounts
                 WHERE country_code = ?1 AND area_code = ?2 AND local_number = ?3",
                params![identity.country_code, identity.area_code, identity.local_number],
                |row| row.get::<_, f64>(0),
            )
            .optional()
        });

        match result {
            Ok(balance) => balance.unwrap_or(0.0),
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to read balance");
                0.0
            }
        }
    }

    /// Subtract `minutes`, floored at zero, and count one sent message.
    /// A missing record is a no-op. Returns false only on storage failure.
    pub fn debit(&self, identity: &Identity, minutes: f64) -> bool {
        if !valid_amount(minutes) {
            warn!(identity = %identity, minutes, "Rejecting invalid debit amount");
            return false;
        }

        let result = self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts
                 SET balance_minutes = MAX(0, balance_minutes - ?4),
                     total_messages_sent = total_messages_sent + 1
                 WHERE country_code = ?1 AND area_code = ?2 AND local_number = ?3",
                params![identity.country_code, identity.area_code, identity.local_number, minutes],
            )
        });

        match result {
            Ok(rows) => {
                debug!(identity = %identity, minutes, rows, "Debited");
                true
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to debit balance");
                false
            }
        }
    }

    /// Add `minutes`; creates an active record holding exactly `minutes` when absent.
    /// Existing records keep their status.
    pub fn credit(&self, identity: &Identity, minutes: f64) -> bool {
        if !valid_amount(minutes) {
            warn!(identity = %identity, minutes, "Rejecting invalid credit amount");
            return false;
        }

        let now = Utc::now().to_rfc3339();
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (country_code, area_code, local_number, status,
                                       balance_minutes, activated_at, last_seen_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)
                 ON CONFLICT (country_code, area_code, local_number)
                 DO UPDATE SET balance_minutes = balance_minutes + excluded.balance_minutes",
                params![identity.country_code, identity.area_code, identity.local_number, minutes, now],
            )
        });

        match result {
            Ok(_) => {
                info!(identity = %identity, minutes, "Credited");
                true
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to credit balance");
                false
            }
        }
    }

    /// Adjust the active-conversation counter, floored at zero
    pub fn set_active_conversation_delta(&self, identity: &Identity, delta: i64) -> bool {
        let result = self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts
                 SET total_active_conversations = MAX(0, total_active_conversations + ?4)
                 WHERE country_code = ?1 AND area_code = ?2 AND local_number = ?3",
                params![identity.country_code, identity.area_code, identity.local_number, delta],
            )
        });

        match result {
            Ok(_) => true,
            Err(e) => {
                error!(identity = %identity, delta, error = %e, "Failed to update active conversations");
                false
            }
        }
    }

    /// Record a successful connection: insert active with the starter balance
    /// when absent, otherwise mark active and refresh `last_seen_at`.
    pub fn touch(&self, identity: &Identity) -> bool {
        let now = Utc::now().to_rfc3339();
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (country_code, area_code, local_number, status,
                                       balance_minutes, activated_at, last_seen_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)
                 ON CONFLICT (country_code, area_code, local_number)
                 DO UPDATE SET status = 'active', last_seen_at = excluded.last_seen_at",
                params![
                    identity.country_code,
                    identity.area_code,
                    identity.local_number,
                    self.starter_balance_minutes,
                    now
                ],
            )
        });

        match result {
            Ok(_) => true,
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to record account");
                false
            }
        }
    }

    /// Change an account's status; false when absent or on storage failure
    pub fn set_status(&self, identity: &Identity, status: AccountStatus) -> bool {
        let result = self.with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET status = ?4
                 WHERE country_code = ?1 AND area_code = ?2 AND local_number = ?3",
                params![identity.country_code, identity.area_code, identity.local_number, status.as_str()],
            )
        });

        match result {
            Ok(rows) => rows > 0,
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to update status");
                false
            }
        }
    }

    /// Full account record
    pub fn account(&self, identity: &Identity) -> Result<Option<Account>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT country_code, area_code, local_number, status, balance_minutes,
                        total_messages_sent, total_active_conversations, activated_at, last_seen_at
                 FROM accounts
                 WHERE country_code = ?1 AND area_code = ?2 AND local_number = ?3",
                params![identity.country_code, identity.area_code, identity.local_number],
                row_to_account,
            )
            .optional()
        })
    }

    /// All accounts, ordered by identity
    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT country_code, area_code, local_number, status, balance_minutes,
                        total_messages_sent, total_active_conversations, activated_at, last_seen_at
                 FROM accounts
                 ORDER BY country_code, area_code, local_number",
            )?;
            let rows = stmt.query_map([], row_to_account)?;
            rows.collect()
        })
    }

    /// Identities that are active with a positive balance, in random order.
    /// Empty on storage failure.
    pub fn funded_accounts(&self) -> Vec<Identity> {
        let result = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT country_code, area_code, local_number
                 FROM accounts
                 WHERE status = 'active' AND balance_minutes > 0
                 ORDER BY RANDOM()",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Identity {
                    country_code: row.get(0)?,
                    area_code: row.get(1)?,
                    local_number: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        });

        match result {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list funded accounts");
                Vec::new()
            }
        }
    }

    /// Active with a positive balance; false on storage failure
    pub fn is_funded(&self, identity: &Identity) -> bool {
        let result = self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM accounts
                 WHERE country_code = ?1 AND area_code = ?2 AND local_number = ?3
                   AND status = 'active' AND balance_minutes > 0",
                params![identity.country_code, identity.area_code, identity.local_number],
                |_| Ok(()),
            )
            .optional()
        });

        match result {
            Ok(found) => found.is_some(),
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to check funding");
                false
            }
        }
    }

    /// Cheap round trip to the storage engine
    pub fn is_healthy(&self) -> bool {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .is_ok()
    }
}

fn valid_amount(minutes: f64) -> bool {
    minutes.is_finite() && minutes >= 0.0
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let status: String = row.get(3)?;
    let activated_at: String = row.get(7)?;
    let last_seen_at: String = row.get(8)?;

    Ok(Account {
        identity: Identity {
            country_code: row.get(0)?,
            area_code: row.get(1)?,
            local_number: row.get(2)?,
        },
        status: AccountStatus::from_db(&status),
        balance_minutes: row.get(4)?,
        total_messages_sent: row.get(5)?,
        total_active_conversations: row.get(6)?,
        activated_at: parse_timestamp(&activated_at),
        last_seen_at: parse_timestamp(&last_seen_at),
    })
}
