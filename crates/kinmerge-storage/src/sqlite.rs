//! SQLite implementation of [`MergeStore`].
//!
//! [`SqliteStore`] keeps each aggregate as a JSON TEXT column next to the
//! handful of columns needed for lookups and version checks. Every write runs
//! in one transaction, so a request and its history entry land together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use uuid::Uuid;

use kinmerge_core::{FamilyCode, NodeRef, TreeSnapshot};

use crate::error::StorageError;
use crate::hash::hash_snapshot;
use crate::link::{LinkStatus, TreeLinkRequest};
use crate::merge::{HistoryEntry, MergeRequest};
use crate::traits::MergeStore;
use crate::types::{HistoryDraft, MergeRequestId, TreeLinkRequestId, UserRecord};

/// SQLite-backed implementation of [`MergeStore`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore { conn })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore { conn })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Writes `request` over the stored row if the stored version is still
    /// `expected_version`, then appends its history entry.
    fn commit_in(
        tx: &Transaction<'_>,
        request: &MergeRequest,
        expected_version: u64,
        entry: HistoryDraft,
    ) -> Result<HistoryEntry, StorageError> {
        let state_json = serde_json::to_string(request)?;
        let updated = tx.execute(
            "UPDATE merge_requests SET version = ?1, state_json = ?2
             WHERE id = ?3 AND version = ?4",
            params![
                request.version as i64,
                state_json,
                request.id.0,
                expected_version as i64
            ],
        )?;
        if updated == 0 {
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT version FROM merge_requests WHERE id = ?1",
                    params![request.id.0],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match actual {
                Some(actual) => StorageError::VersionConflict {
                    expected: expected_version,
                    actual: actual as u64,
                },
                None => StorageError::MergeRequestNotFound(request.id.0),
            });
        }
        Self::append_history(tx, request, entry)
    }

    fn append_history(
        tx: &Transaction<'_>,
        request: &MergeRequest,
        entry: HistoryDraft,
    ) -> Result<HistoryEntry, StorageError> {
        let entry = HistoryEntry::from_draft(entry, request);
        tx.execute(
            "INSERT INTO merge_history
                (merge_request_id, version, entry_id, timestamp, actor, description,
                 changes_json, snapshot_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.merge_request.0,
                entry.version as i64,
                entry.entry_id.to_string(),
                entry.timestamp.to_rfc3339(),
                entry.actor,
                entry.description,
                serde_json::to_string(&entry.changes)?,
                serde_json::to_string(&entry.snapshot)?,
            ],
        )?;
        Ok(entry)
    }

    fn write_tree(
        tx: &Transaction<'_>,
        family: &FamilyCode,
        tree: &TreeSnapshot,
    ) -> Result<(), StorageError> {
        tx.execute(
            "INSERT INTO family_trees (family_code, tree_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(family_code) DO UPDATE
             SET tree_json = excluded.tree_json, updated_at = excluded.updated_at",
            params![
                family.as_str(),
                serde_json::to_string(tree)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn read_tree(conn: &Connection, family: &FamilyCode) -> Result<TreeSnapshot, StorageError> {
        let json: Option<String> = conn
            .query_row(
                "SELECT tree_json FROM family_trees WHERE family_code = ?1",
                params![family.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or_else(|| StorageError::FamilyNotFound(family.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn assert_merge_request_exists(&self, id: MergeRequestId) -> Result<(), StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM merge_requests WHERE id = ?1)",
            params![id.0],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StorageError::MergeRequestNotFound(id.0));
        }
        Ok(())
    }
}

type HistoryRow = (i64, i64, String, String, String, String, String, String);

const HISTORY_COLUMNS: &str = "merge_request_id, version, entry_id, timestamp, actor, \
                               description, changes_json, snapshot_json";

fn read_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_history(row: HistoryRow) -> Result<HistoryEntry, StorageError> {
    let (merge_request, version, entry_id, timestamp, actor, description, changes, snapshot) = row;
    let entry_id = Uuid::parse_str(&entry_id).map_err(|e| StorageError::IntegrityError {
        reason: format!("bad history entry id '{}': {}", entry_id, e),
    })?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| StorageError::IntegrityError {
            reason: format!("bad history timestamp '{}': {}", timestamp, e),
        })?
        .with_timezone(&Utc);
    Ok(HistoryEntry {
        entry_id,
        merge_request: MergeRequestId(merge_request),
        version: version as u64,
        timestamp,
        actor,
        description,
        changes: serde_json::from_str(&changes)?,
        snapshot: serde_json::from_str(&snapshot)?,
    })
}

impl MergeStore for SqliteStore {
    // -----------------------------------------------------------------------
    // Family trees
    // -----------------------------------------------------------------------

    fn save_tree(&mut self, family: &FamilyCode, tree: &TreeSnapshot) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        Self::write_tree(&tx, family, tree)?;
        tx.commit()?;
        Ok(())
    }

    fn load_tree(&self, family: &FamilyCode) -> Result<TreeSnapshot, StorageError> {
        Self::read_tree(&self.conn, family)
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    fn register_user(&mut self, user: &UserRecord) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        // A number belongs to one user; the newest registration wins.
        tx.execute(
            "DELETE FROM users WHERE phone_digits = ?1 AND user_id != ?2",
            params![user.phone_digits, user.user_id],
        )?;
        tx.execute(
            "INSERT INTO users (user_id, name, phone_digits, family_code)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE
             SET name = excluded.name,
                 phone_digits = excluded.phone_digits,
                 family_code = excluded.family_code",
            params![
                user.user_id,
                user.name,
                user.phone_digits,
                user.family_code.as_ref().map(|c| c.as_str())
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn find_by_phone(&self, phone_digits: &str) -> Result<Option<UserRecord>, StorageError> {
        let user = self
            .conn
            .query_row(
                "SELECT user_id, name, phone_digits, family_code FROM users
                 WHERE phone_digits = ?1",
                params![phone_digits],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        phone_digits: row.get(2)?,
                        family_code: row.get::<_, Option<String>>(3)?.map(FamilyCode::new),
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    // -----------------------------------------------------------------------
    // Merge requests
    // -----------------------------------------------------------------------

    fn create_merge_request(
        &mut self,
        mut request: MergeRequest,
        entry: HistoryDraft,
    ) -> Result<MergeRequest, StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO merge_requests
                (primary_family_code, secondary_family_code, version, state_json)
             VALUES (?1, ?2, ?3, '{}')",
            params![
                request.primary_family_code.as_str(),
                request.secondary_family_code.as_str(),
                request.version as i64
            ],
        )?;
        request.id = MergeRequestId(tx.last_insert_rowid());
        tx.execute(
            "UPDATE merge_requests SET state_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&request)?, request.id.0],
        )?;
        Self::append_history(&tx, &request, entry)?;
        tx.commit()?;
        Ok(request)
    }

    fn load_merge_request(&self, id: MergeRequestId) -> Result<MergeRequest, StorageError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT state_json FROM merge_requests WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or(StorageError::MergeRequestNotFound(id.0))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn commit_merge_request(
        &mut self,
        request: &MergeRequest,
        expected_version: u64,
        entry: HistoryDraft,
    ) -> Result<HistoryEntry, StorageError> {
        let tx = self.conn.transaction()?;
        let entry = Self::commit_in(&tx, request, expected_version, entry)?;
        tx.commit()?;
        Ok(entry)
    }

    fn commit_merge_execution(
        &mut self,
        request: &MergeRequest,
        expected_version: u64,
        base_tree_hash: &str,
        entry: HistoryDraft,
        merged_tree: &TreeSnapshot,
    ) -> Result<HistoryEntry, StorageError> {
        // Immediate: the tree read and the tree write must see the same state.
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = Self::read_tree(&tx, &request.primary_family_code)?;
        if hash_snapshot(&current)? != base_tree_hash {
            return Err(StorageError::TreeChanged {
                family: request.primary_family_code.to_string(),
            });
        }
        let entry = Self::commit_in(&tx, request, expected_version, entry)?;
        Self::write_tree(&tx, &request.primary_family_code, merged_tree)?;
        tx.commit()?;
        Ok(entry)
    }

    fn list_history(&self, id: MergeRequestId) -> Result<Vec<HistoryEntry>, StorageError> {
        self.assert_merge_request_exists(id)?;
        let sql = format!(
            "SELECT {} FROM merge_history WHERE merge_request_id = ?1 ORDER BY version",
            HISTORY_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![id.0], read_history_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(decode_history(row?)?);
        }
        Ok(entries)
    }

    fn history_entry(
        &self,
        id: MergeRequestId,
        version: u64,
    ) -> Result<HistoryEntry, StorageError> {
        self.assert_merge_request_exists(id)?;
        let sql = format!(
            "SELECT {} FROM merge_history WHERE merge_request_id = ?1 AND version = ?2",
            HISTORY_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id.0, version as i64], read_history_row)
            .optional()?;
        match row {
            Some(row) => decode_history(row),
            None => Err(StorageError::HistoryEntryNotFound {
                merge_request: id.0,
                version,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Tree-link requests
    // -----------------------------------------------------------------------

    fn insert_link(&mut self, mut request: TreeLinkRequest) -> Result<TreeLinkRequest, StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO tree_link_requests
                (sender_family, sender_person, receiver_family, receiver_person,
                 status, version, request_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}')",
            params![
                request.sender.family_code.as_str(),
                request.sender.person.0,
                request.receiver.family_code.as_str(),
                request.receiver.person.0,
                request.status.as_str(),
                request.version as i64
            ],
        )?;
        request.id = TreeLinkRequestId(tx.last_insert_rowid());
        tx.execute(
            "UPDATE tree_link_requests SET request_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&request)?, request.id.0],
        )?;
        tx.commit()?;
        Ok(request)
    }

    fn load_link(&self, id: TreeLinkRequestId) -> Result<TreeLinkRequest, StorageError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT request_json FROM tree_link_requests WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or(StorageError::LinkRequestNotFound(id.0))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn update_link(
        &mut self,
        request: &TreeLinkRequest,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE tree_link_requests SET status = ?1, version = ?2, request_json = ?3
             WHERE id = ?4 AND version = ?5",
            params![
                request.status.as_str(),
                request.version as i64,
                serde_json::to_string(request)?,
                request.id.0,
                expected_version as i64
            ],
        )?;
        if updated == 0 {
            let actual: Option<i64> = tx
                .query_row(
                    "SELECT version FROM tree_link_requests WHERE id = ?1",
                    params![request.id.0],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match actual {
                Some(actual) => StorageError::VersionConflict {
                    expected: expected_version,
                    actual: actual as u64,
                },
                None => StorageError::LinkRequestNotFound(request.id.0),
            });
        }
        tx.commit()?;
        Ok(())
    }

    fn find_pending_link(
        &self,
        a: &NodeRef,
        b: &NodeRef,
    ) -> Result<Option<TreeLinkRequest>, StorageError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT request_json FROM tree_link_requests
                 WHERE status = ?5 AND (
                    (sender_family = ?1 AND sender_person = ?2
                     AND receiver_family = ?3 AND receiver_person = ?4)
                    OR
                    (sender_family = ?3 AND sender_person = ?4
                     AND receiver_family = ?1 AND receiver_person = ?2))
                 ORDER BY id LIMIT 1",
                params![
                    a.family_code.as_str(),
                    a.person.0,
                    b.family_code.as_str(),
                    b.person.0,
                    LinkStatus::Pending.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn list_executed_links(
        &self,
        family: &FamilyCode,
    ) -> Result<Vec<TreeLinkRequest>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT request_json FROM tree_link_requests
             WHERE status = ?1 AND (sender_family = ?2 OR receiver_family = ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![LinkStatus::Executed.as_str(), family.as_str()],
            |row| row.get::<_, String>(0),
        )?;
        let mut links = Vec::new();
        for json in rows {
            links.push(serde_json::from_str(&json?)?);
        }
        Ok(links)
    }
}
