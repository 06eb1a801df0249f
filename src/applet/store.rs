//! SQLite-backed storage for applets and their areas.
//!
//! The engine reads these records to build execution units and writes back
//! run-state transitions; the authoring layer owns everything else. Deleting
//! an applet cascades to its areas.

use super::{Applet, Area, AuthoringState, Role, RunState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Applet and area storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE applets (
///     id TEXT PRIMARY KEY,
///     account_id TEXT NOT NULL,
///     name TEXT NOT NULL,
///     description TEXT NOT NULL,
///     state TEXT NOT NULL,              -- partial | complete | error
///     run_state TEXT NOT NULL,          -- stopped | running
///     active INTEGER NOT NULL,
///     created_at TEXT NOT NULL          -- ISO 8601 timestamp
/// );
/// CREATE TABLE areas (
///     id TEXT PRIMARY KEY,
///     applet_id TEXT NOT NULL REFERENCES applets(id) ON DELETE CASCADE,
///     credential_id TEXT,
///     role TEXT NOT NULL,               -- action | reaction
///     provider TEXT NOT NULL,
///     name TEXT NOT NULL,
///     config TEXT NOT NULL,             -- opaque JSON blob
///     created_at TEXT NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - SQLite itself is thread-safe with serialized mode
pub struct AppletStore {
    conn: Mutex<Connection>,
}

impl AppletStore {
    /// Creates or opens an applet store at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open applet database")?;

        // Cascade deletes rely on foreign keys being enforced
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS applets (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                state TEXT NOT NULL,
                run_state TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create applets table")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS areas (
                id TEXT PRIMARY KEY,
                applet_id TEXT NOT NULL REFERENCES applets(id) ON DELETE CASCADE,
                credential_id TEXT,
                role TEXT NOT NULL,
                provider TEXT NOT NULL,
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create areas table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_areas_applet_role ON areas(applet_id, role)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new applet record.
    pub fn create_applet(&self, applet: &Applet) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO applets (id, account_id, name, description, state, run_state, active, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    applet.id.to_string(),
                    applet.account_id.to_string(),
                    applet.name,
                    applet.description,
                    applet.state.as_str(),
                    applet.run_state.as_str(),
                    applet.active,
                    applet.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert applet")?;
        Ok(())
    }

    /// Retrieves one applet by id.
    pub fn get_applet(&self, id: Uuid) -> Result<Option<Applet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, name, description, state, run_state, active, created_at
                 FROM applets WHERE id = ?1",
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![id.to_string()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(parse_applet(row)?)),
            None => Ok(None),
        }
    }

    /// Lists all applets whose authoring state is `Complete`, in creation
    /// order. Used by the registry at startup to resume execution units.
    pub fn list_complete(&self) -> Result<Vec<Applet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, name, description, state, run_state, active, created_at
                 FROM applets WHERE state = 'complete' ORDER BY created_at",
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt.query([]).context("Failed to execute query")?;
        let mut applets = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            applets.push(parse_applet(row)?);
        }
        Ok(applets)
    }

    /// Persists a run-state transition. The running unit calls this with
    /// `Stopped` on every exit, fatal or requested.
    pub fn set_run_state(&self, id: Uuid, run_state: RunState) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE applets SET run_state = ?1 WHERE id = ?2",
                params![run_state.as_str(), id.to_string()],
            )
            .context("Failed to update run state")?;
        Ok(())
    }

    /// Persists the soft-pause flag.
    pub fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE applets SET active = ?1 WHERE id = ?2",
                params![active, id.to_string()],
            )
            .context("Failed to update active flag")?;
        Ok(())
    }

    /// Persists an authoring-state transition.
    pub fn set_state(&self, id: Uuid, state: AuthoringState) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE applets SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id.to_string()],
            )
            .context("Failed to update authoring state")?;
        Ok(())
    }

    /// Deletes an applet; its areas go with it.
    pub fn delete_applet(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM applets WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete applet")?;
        Ok(rows > 0)
    }

    /// Inserts a new area record.
    pub fn create_area(&self, area: &Area) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO areas (id, applet_id, credential_id, role, provider, name, config, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    area.id.to_string(),
                    area.applet_id.to_string(),
                    area.credential_id.map(|c| c.to_string()),
                    area.role.as_str(),
                    area.provider,
                    area.name,
                    area.config,
                    area.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert area")?;
        Ok(())
    }

    /// The applet's single action area, if one has been assigned.
    pub fn action_area(&self, applet_id: Uuid) -> Result<Option<Area>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, applet_id, credential_id, role, provider, name, config, created_at
                 FROM areas WHERE applet_id = ?1 AND role = 'action' LIMIT 1",
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![applet_id.to_string()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(parse_area(row)?)),
            None => Ok(None),
        }
    }

    /// The applet's reaction areas, in attachment (creation) order. The
    /// execution unit invokes receivers in exactly this order.
    pub fn reaction_areas(&self, applet_id: Uuid) -> Result<Vec<Area>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, applet_id, credential_id, role, provider, name, config, created_at
                 FROM areas WHERE applet_id = ?1 AND role = 'reaction' ORDER BY created_at, id",
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![applet_id.to_string()])
            .context("Failed to execute query")?;

        let mut areas = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            areas.push(parse_area(row)?);
        }
        Ok(areas)
    }

    /// Replaces an area's configuration blob. This is the authoring-side half
    /// of the reconfigure path; a running unit picks the change up through
    /// `Registry::reconfigure`.
    pub fn update_area_config(&self, area_id: Uuid, config: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE areas SET config = ?1 WHERE id = ?2",
                params![config, area_id.to_string()],
            )
            .context("Failed to update area config")?;
        Ok(())
    }
}

fn parse_applet(row: &Row<'_>) -> Result<Applet> {
    let id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let state: String = row.get(4)?;
    let run_state: String = row.get(5)?;
    let created_at: String = row.get(7)?;

    Ok(Applet {
        id: Uuid::parse_str(&id).context("Invalid applet id")?,
        account_id: Uuid::parse_str(&account_id).context("Invalid account id")?,
        name: row.get(2)?,
        description: row.get(3)?,
        state: AuthoringState::parse(&state)
            .ok_or_else(|| anyhow!("Invalid authoring state: {}", state))?,
        run_state: RunState::parse(&run_state)
            .ok_or_else(|| anyhow!("Invalid run state: {}", run_state))?,
        active: row.get(6)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_area(row: &Row<'_>) -> Result<Area> {
    let id: String = row.get(0)?;
    let applet_id: String = row.get(1)?;
    let credential_id: Option<String> = row.get(2)?;
    let role: String = row.get(3)?;
    let created_at: String = row.get(7)?;

    Ok(Area {
        id: Uuid::parse_str(&id).context("Invalid area id")?,
        applet_id: Uuid::parse_str(&applet_id).context("Invalid applet id")?,
        credential_id: credential_id
            .map(|c| Uuid::parse_str(&c).context("Invalid credential id"))
            .transpose()?,
        role: Role::parse(&role).ok_or_else(|| anyhow!("Invalid area role: {}", role))?,
        provider: row.get(4)?,
        name: row.get(5)?,
        config: row.get(6)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .context("Failed to parse timestamp")?
        .with_timezone(&Utc))
}
