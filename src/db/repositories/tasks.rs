use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, parse_datetime, parse_optional_datetime, parse_sync_status, to_u32,
        to_u8,
    },
    models::{Project, SyncStatus, Task, TaskFields, UpsertOutcome},
};

const PROJECT_COLUMNS: &str = "id, remote_id, name, sync_status, updated_at";
const TASK_COLUMNS: &str = "id, remote_id, project_id, title, estimate_minutes, priority, status,
     due_date, sort_order, sync_status, updated_at";

fn row_to_project(row: &Row) -> Result<Project> {
    let sync_status: String = row.get("sync_status")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Project {
        id: row.get("id")?,
        remote_id: row.get("remote_id")?,
        name: row.get("name")?,
        sync_status: parse_sync_status(&sync_status)?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn row_to_task(row: &Row) -> Result<Task> {
    let estimate: Option<i64> = row.get("estimate_minutes")?;
    let due_date: Option<String> = row.get("due_date")?;
    let sync_status: String = row.get("sync_status")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Task {
        id: row.get("id")?,
        remote_id: row.get("remote_id")?,
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        estimate_minutes: estimate
            .map(|value| to_u32(value, "estimate_minutes"))
            .transpose()?,
        priority: to_u8(row.get("priority")?, "priority")?,
        status: to_u8(row.get("status")?, "status")?,
        due_date: parse_optional_datetime(due_date, "due_date")?,
        sort_order: row.get("sort_order")?,
        sync_status: parse_sync_status(&sync_status)?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn validate_fields(fields: &TaskFields) -> Result<()> {
    if fields.title.trim().is_empty() {
        bail!("task title must not be empty");
    }
    if fields.priority > 3 {
        bail!("task priority must be between 0 and 3");
    }
    if fields.status > 2 {
        bail!("task status must be between 0 and 2");
    }
    Ok(())
}

/// Conditional ack shared by projects and tasks: the row is `synced` only if
/// it is still at the version that was uploaded.
fn mark_row_synced(
    conn: &Connection,
    table: &str,
    id: &str,
    remote_id: &str,
    uploaded_version: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {table}
             SET remote_id = ?1,
                 sync_status = CASE WHEN updated_at = ?2 THEN 'synced' ELSE 'pendingUpdate' END
             WHERE id = ?3"
        ),
        params![remote_id, format_datetime(&uploaded_version), id],
    )
    .with_context(|| format!("failed to mark {table} row synced"))?;
    Ok(())
}

/// Last-write-wins gate for pulled rows.
fn local_wins(status: SyncStatus, local_updated: DateTime<Utc>, remote_updated: DateTime<Utc>) -> bool {
    status != SyncStatus::Synced && local_updated > remote_updated
}

impl Database {
    pub async fn create_project(&self, name: &str) -> Result<Project> {
        let name = name.trim().to_string();
        if name.is_empty() {
            bail!("project name must not be empty");
        }
        let project = Project {
            id: Uuid::new_v4().to_string(),
            remote_id: None,
            name,
            sync_status: SyncStatus::Local,
            updated_at: Utc::now(),
        };
        let record = project.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, remote_id, name, sync_status, updated_at)
                 VALUES (?1, NULL, ?2, ?3, ?4)",
                params![
                    record.id,
                    record.name,
                    record.sync_status.as_str(),
                    format_datetime(&record.updated_at)
                ],
            )
            .context("failed to insert project")?;
            Ok(())
        })
        .await?;
        Ok(project)
    }

    pub async fn rename_project(&self, id: &str, name: &str) -> Result<()> {
        let id = id.to_string();
        let name = name.trim().to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE projects
                 SET name = ?1,
                     updated_at = ?2,
                     sync_status = CASE WHEN sync_status IN ('synced', 'pendingUpdate') THEN 'pendingUpdate' ELSE sync_status END
                 WHERE id = ?3",
                params![name, format_datetime(&Utc::now()), id],
            )?;
            if changed == 0 {
                bail!("project {id} not found");
            }
            Ok(())
        })
        .await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.execute(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"))?;
            let mut rows = stmt.query([])?;
            let mut projects = Vec::new();
            while let Some(row) = rows.next()? {
                projects.push(row_to_project(row)?);
            }
            Ok(projects)
        })
        .await
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let id = id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                |row| Ok(row_to_project(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    pub async fn find_project_by_remote_id(&self, remote_id: &str) -> Result<Option<Project>> {
        let remote_id = remote_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE remote_id = ?1"),
                params![remote_id],
                |row| Ok(row_to_project(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    pub async fn list_projects_needing_sync(&self) -> Result<Vec<Project>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects WHERE sync_status <> 'synced' ORDER BY updated_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut projects = Vec::new();
            while let Some(row) = rows.next()? {
                projects.push(row_to_project(row)?);
            }
            Ok(projects)
        })
        .await
    }

    pub async fn mark_project_synced(
        &self,
        id: &str,
        remote_id: &str,
        uploaded_version: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let remote_id = remote_id.to_string();
        self.execute(move |conn| mark_row_synced(conn, "projects", &id, &remote_id, uploaded_version))
            .await
    }

    pub async fn upsert_remote_project(
        &self,
        remote_id: &str,
        name: &str,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let remote_id = remote_id.to_string();
        let name = name.to_string();
        self.execute(move |conn| {
            let existing = conn
                .query_row(
                    &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE remote_id = ?1"),
                    params![remote_id],
                    |row| Ok(row_to_project(row)),
                )
                .optional()?
                .transpose()?;

            match existing {
                Some(local) if local_wins(local.sync_status, local.updated_at, remote_updated_at) => {
                    Ok(UpsertOutcome::KeptLocal)
                }
                Some(local) => {
                    conn.execute(
                        "UPDATE projects SET name = ?1, sync_status = 'synced', updated_at = ?2 WHERE id = ?3",
                        params![name, format_datetime(&remote_updated_at), local.id],
                    )?;
                    Ok(UpsertOutcome::Overwritten)
                }
                None => {
                    conn.execute(
                        "INSERT INTO projects (id, remote_id, name, sync_status, updated_at)
                         VALUES (?1, ?2, ?3, 'synced', ?4)",
                        params![
                            Uuid::new_v4().to_string(),
                            remote_id,
                            name,
                            format_datetime(&remote_updated_at)
                        ],
                    )?;
                    Ok(UpsertOutcome::Inserted)
                }
            }
        })
        .await
    }

    pub async fn create_task(&self, fields: TaskFields) -> Result<Task> {
        validate_fields(&fields)?;
        let task = Task {
            id: Uuid::new_v4().to_string(),
            remote_id: None,
            project_id: fields.project_id,
            title: fields.title.trim().to_string(),
            estimate_minutes: fields.estimate_minutes,
            priority: fields.priority,
            status: fields.status,
            due_date: fields.due_date,
            sort_order: fields.sort_order,
            sync_status: SyncStatus::Local,
            updated_at: Utc::now(),
        };
        let record = task.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, remote_id, project_id, title, estimate_minutes, priority, status,
                                    due_date, sort_order, sync_status, updated_at)
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.project_id,
                    record.title,
                    record.estimate_minutes,
                    record.priority,
                    record.status,
                    record.due_date.as_ref().map(format_datetime),
                    record.sort_order,
                    record.sync_status.as_str(),
                    format_datetime(&record.updated_at),
                ],
            )
            .context("failed to insert task")?;
            Ok(())
        })
        .await?;
        Ok(task)
    }

    pub async fn update_task(&self, id: &str, fields: TaskFields) -> Result<()> {
        validate_fields(&fields)?;
        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET project_id = ?1, title = ?2, estimate_minutes = ?3, priority = ?4, status = ?5,
                     due_date = ?6, sort_order = ?7, updated_at = ?8,
                     sync_status = CASE WHEN sync_status IN ('synced', 'pendingUpdate') THEN 'pendingUpdate' ELSE sync_status END
                 WHERE id = ?9",
                params![
                    fields.project_id,
                    fields.title.trim(),
                    fields.estimate_minutes,
                    fields.priority,
                    fields.status,
                    fields.due_date.as_ref().map(format_datetime),
                    fields.sort_order,
                    format_datetime(&Utc::now()),
                    id,
                ],
            )?;
            if changed == 0 {
                bail!("task {id} not found");
            }
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                |row| Ok(row_to_task(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY sort_order, updated_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(row_to_task(row)?);
            }
            Ok(tasks)
        })
        .await
    }

    pub async fn list_tasks_needing_sync(&self) -> Result<Vec<Task>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE sync_status <> 'synced' ORDER BY updated_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(row_to_task(row)?);
            }
            Ok(tasks)
        })
        .await
    }

    pub async fn mark_task_synced(
        &self,
        id: &str,
        remote_id: &str,
        uploaded_version: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let remote_id = remote_id.to_string();
        self.execute(move |conn| mark_row_synced(conn, "tasks", &id, &remote_id, uploaded_version))
            .await
    }

    /// Apply a pulled task. `fields.project_id` must already be the local
    /// project id (or `None`).
    pub async fn upsert_remote_task(
        &self,
        remote_id: &str,
        fields: TaskFields,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let remote_id = remote_id.to_string();
        self.execute(move |conn| {
            let existing = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE remote_id = ?1"),
                    params![remote_id],
                    |row| Ok(row_to_task(row)),
                )
                .optional()?
                .transpose()?;

            let due_date = fields.due_date.as_ref().map(format_datetime);
            let updated_at = format_datetime(&remote_updated_at);

            match existing {
                Some(local) if local_wins(local.sync_status, local.updated_at, remote_updated_at) => {
                    Ok(UpsertOutcome::KeptLocal)
                }
                Some(local) => {
                    conn.execute(
                        "UPDATE tasks
                         SET project_id = ?1, title = ?2, estimate_minutes = ?3, priority = ?4, status = ?5,
                             due_date = ?6, sort_order = ?7, sync_status = 'synced', updated_at = ?8
                         WHERE id = ?9",
                        params![
                            fields.project_id,
                            fields.title,
                            fields.estimate_minutes,
                            fields.priority,
                            fields.status,
                            due_date,
                            fields.sort_order,
                            updated_at,
                            local.id,
                        ],
                    )?;
                    Ok(UpsertOutcome::Overwritten)
                }
                None => {
                    conn.execute(
                        "INSERT INTO tasks (id, remote_id, project_id, title, estimate_minutes, priority, status,
                                            due_date, sort_order, sync_status, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'synced', ?10)",
                        params![
                            Uuid::new_v4().to_string(),
                            remote_id,
                            fields.project_id,
                            fields.title,
                            fields.estimate_minutes,
                            fields.priority,
                            fields.status,
                            due_date,
                            fields.sort_order,
                            updated_at,
                        ],
                    )?;
                    Ok(UpsertOutcome::Inserted)
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    fn fields(title: &str) -> TaskFields {
        TaskFields {
            title: title.into(),
            priority: 1,
            ..TaskFields::default()
        }
    }

    #[tokio::test]
    async fn remote_upsert_is_last_write_wins() {
        let (_dir, db) = temp_db();
        let now = Utc::now();

        let outcome = db
            .upsert_remote_task("r1", fields("from server"), now)
            .await
            .expect("insert");
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let newer = now + chrono::Duration::minutes(5);
        let outcome = db
            .upsert_remote_task("r1", fields("server edit"), newer)
            .await
            .expect("overwrite");
        assert_eq!(outcome, UpsertOutcome::Overwritten);

        let task = db.list_tasks().await.expect("list").remove(0);
        assert_eq!(task.title, "server edit");
        assert_eq!(task.sync_status, SyncStatus::Synced);

        db.update_task(&task.id, fields("local edit"))
            .await
            .expect("local edit");
        let outcome = db
            .upsert_remote_task("r1", fields("stale server copy"), now - chrono::Duration::minutes(1))
            .await
            .expect("upsert");
        assert_eq!(outcome, UpsertOutcome::KeptLocal);

        let task = db.get_task(&task.id).await.expect("get").expect("row");
        assert_eq!(task.title, "local edit");
        assert_eq!(task.sync_status, SyncStatus::PendingUpdate);
    }

    #[tokio::test]
    async fn task_validation_rejects_out_of_range_values() {
        let (_dir, db) = temp_db();
        let mut bad = fields("x");
        bad.priority = 9;
        assert!(db.create_task(bad).await.is_err());
        assert!(db.create_task(fields("   ")).await.is_err());
    }

    #[tokio::test]
    async fn projects_sync_round() {
        let (_dir, db) = temp_db();
        let project = db.create_project("Thesis").await.expect("create");
        assert_eq!(db.list_projects_needing_sync().await.expect("list").len(), 1);

        db.mark_project_synced(&project.id, "p-remote", project.updated_at)
            .await
            .expect("mark");
        assert!(db.list_projects_needing_sync().await.expect("list").is_empty());
        let found = db
            .find_project_by_remote_id("p-remote")
            .await
            .expect("find")
            .expect("row");
        assert_eq!(found.id, project.id);
    }
}
