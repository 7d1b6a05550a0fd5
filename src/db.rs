use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Opens (and creates if missing) the SQLite database behind `url`.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                let _ = sqlx::query("PRAGMA cache_size=-65536;").execute(&mut *conn).await; // ~64MB page cache
                let _ = sqlx::query("PRAGMA temp_store=MEMORY;").execute(&mut *conn).await;
                Ok(())
            })
        })
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    // Pragmas for better durability/performance
    if let Err(e) = sqlx::query("PRAGMA journal_mode=WAL;").execute(pool).await {
        tracing::warn!("Failed to set WAL journal mode: {}", e);
    }
    if let Err(e) = sqlx::query("PRAGMA synchronous=NORMAL;").execute(pool).await {
        tracing::warn!("Failed to set synchronous mode: {}", e);
    }
    // Foreign keys are critical - fail if this doesn't work
    sqlx::query("PRAGMA foreign_keys=ON;").execute(pool).await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    let now = chrono::Utc::now();
    for &(slug, name) in crate::content::DEFAULT_PAGES {
        sqlx::query(
            "INSERT OR IGNORE INTO cms_content (id, name, slug, published, creation_date, last_modified_date)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(name)
        .bind(slug)
        .bind(now)
        .execute(pool)
        .await?;
    }

    for idx_sql in INDEXES {
        if let Err(e) = sqlx::query(idx_sql).execute(pool).await {
            tracing::warn!("Failed to create index: {} - Error: {}", idx_sql, e);
        }
    }

    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id BLOB PRIMARY KEY,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        username TEXT NOT NULL,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        password_hash TEXT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        is_superuser INTEGER NOT NULL DEFAULT 0,
        can_create_projects INTEGER NOT NULL DEFAULT 0,
        can_hard_delete_datasets INTEGER NOT NULL DEFAULT 0,
        is_global_metadata_template_admin INTEGER NOT NULL DEFAULT 0,
        date_joined TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS auth_tokens (
        token_hash TEXT PRIMARY KEY,
        user_id BLOB NOT NULL,
        kind TEXT NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        public INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS metadata_fields (
        id BLOB PRIMARY KEY,
        key TEXT NOT NULL UNIQUE,
        field_type TEXT NOT NULL,
        read_only INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS projects (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '{}',
        metadata_template_id BLOB NULL,
        is_deletable INTEGER NOT NULL DEFAULT 1,
        members_count INTEGER NOT NULL DEFAULT 0,
        metadata_templates_count INTEGER NOT NULL DEFAULT 0,
        locked INTEGER NOT NULL DEFAULT 0,
        locked_by BLOB NULL,
        locked_at TEXT NULL,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE SET NULL,
        FOREIGN KEY(last_modified_by) REFERENCES users(id) ON DELETE SET NULL,
        FOREIGN KEY(locked_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS project_memberships (
        id BLOB PRIMARY KEY,
        project_id BLOB NOT NULL,
        member_id BLOB NOT NULL,
        is_project_admin INTEGER NOT NULL DEFAULT 0,
        can_create_folders INTEGER NOT NULL DEFAULT 0,
        is_metadata_template_admin INTEGER NOT NULL DEFAULT 0,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        UNIQUE(project_id, member_id),
        FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE,
        FOREIGN KEY(member_id) REFERENCES users(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS folders (
        id BLOB PRIMARY KEY,
        project_id BLOB NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '{}',
        metadata_template_id BLOB NULL,
        members_count INTEGER NOT NULL DEFAULT 0,
        datasets_count INTEGER NOT NULL DEFAULT 0,
        metadata_templates_count INTEGER NOT NULL DEFAULT 0,
        locked INTEGER NOT NULL DEFAULT 0,
        locked_by BLOB NULL,
        locked_at TEXT NULL,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(project_id) REFERENCES projects(id) ON DELETE CASCADE,
        FOREIGN KEY(locked_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS folder_permissions (
        id BLOB PRIMARY KEY,
        folder_id BLOB NOT NULL,
        project_membership_id BLOB NOT NULL,
        is_folder_admin INTEGER NOT NULL DEFAULT 0,
        is_metadata_template_admin INTEGER NOT NULL DEFAULT 0,
        can_edit INTEGER NOT NULL DEFAULT 0,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        UNIQUE(folder_id, project_membership_id),
        FOREIGN KEY(folder_id) REFERENCES folders(id) ON DELETE CASCADE,
        FOREIGN KEY(project_membership_id) REFERENCES project_memberships(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS metadata_templates (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        assigned_to_content_type TEXT NULL,
        assigned_to_object_id BLOB NULL,
        locked INTEGER NOT NULL DEFAULT 0,
        locked_by BLOB NULL,
        locked_at TEXT NULL,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(locked_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS metadata_template_fields (
        id BLOB PRIMARY KEY,
        metadata_template_id BLOB NOT NULL,
        field_id BLOB NULL,
        custom_key TEXT NULL,
        field_type TEXT NOT NULL,
        value TEXT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        mandatory INTEGER NOT NULL DEFAULT 0,
        creation_date TEXT NOT NULL,
        FOREIGN KEY(metadata_template_id) REFERENCES metadata_templates(id) ON DELETE CASCADE,
        FOREIGN KEY(field_id) REFERENCES metadata_fields(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS metadata (
        id BLOB PRIMARY KEY,
        field_id BLOB NULL,
        custom_key TEXT NULL,
        field_type TEXT NOT NULL,
        read_only INTEGER NOT NULL DEFAULT 0,
        value TEXT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        metadata_template_field_id BLOB NULL,
        assigned_to_content_type TEXT NOT NULL,
        assigned_to_object_id BLOB NOT NULL,
        creation_date TEXT NOT NULL,
        FOREIGN KEY(field_id) REFERENCES metadata_fields(id) ON DELETE CASCADE,
        FOREIGN KEY(metadata_template_field_id) REFERENCES metadata_template_fields(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS uploads_datasets (
        id BLOB PRIMARY KEY,
        name TEXT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        folder_id BLOB NULL,
        publication_date TEXT NULL,
        expiry_date TEXT NULL,
        locked INTEGER NOT NULL DEFAULT 0,
        locked_by BLOB NULL,
        locked_at TEXT NULL,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(folder_id) REFERENCES folders(id) ON DELETE RESTRICT,
        FOREIGN KEY(locked_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS uploads_version_files (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        stored_path TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        uploaded_using_tus INTEGER NOT NULL DEFAULT 0,
        publication_date TEXT NULL,
        storage_relocating TEXT NOT NULL DEFAULT 'NONE',
        created_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS uploads_versions (
        id BLOB PRIMARY KEY,
        name TEXT NULL,
        dataset_id BLOB NOT NULL,
        version_file_id BLOB NULL,
        publication_date TEXT NULL,
        metadata_is_complete INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(dataset_id) REFERENCES uploads_datasets(id) ON DELETE CASCADE,
        FOREIGN KEY(version_file_id) REFERENCES uploads_version_files(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS file_parsers (
        id BLOB PRIMARY KEY,
        version_file_id BLOB NOT NULL,
        type TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT NULL,
        creation_date TEXT NOT NULL,
        UNIQUE(version_file_id, type),
        FOREIGN KEY(version_file_id) REFERENCES uploads_version_files(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS mail_outbox (
        id BLOB PRIMARY KEY,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT NULL,
        next_attempt_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        sent_at TEXT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cms_content (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        published INTEGER NOT NULL DEFAULT 0,
        text_de TEXT NULL,
        text_en TEXT NULL,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE SET NULL,
        FOREIGN KEY(last_modified_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TRIGGER IF NOT EXISTS cms_content_no_delete BEFORE DELETE ON cms_content
        BEGIN SELECT RAISE(ABORT, 'content pages cannot be deleted'); END"#,
    r#"CREATE TABLE IF NOT EXISTS faq_categories (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        sort_order INTEGER NOT NULL DEFAULT 0,
        published INTEGER NOT NULL DEFAULT 0,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE SET NULL,
        FOREIGN KEY(last_modified_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS faqs (
        id BLOB PRIMARY KEY,
        question TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        answer TEXT NULL,
        category_id BLOB NULL,
        sort_order INTEGER NOT NULL DEFAULT 0,
        published INTEGER NOT NULL DEFAULT 0,
        created_by BLOB NULL,
        last_modified_by BLOB NULL,
        creation_date TEXT NOT NULL,
        last_modified_date TEXT NOT NULL,
        UNIQUE(question, category_id),
        FOREIGN KEY(category_id) REFERENCES faq_categories(id) ON DELETE CASCADE,
        FOREIGN KEY(created_by) REFERENCES users(id) ON DELETE SET NULL,
        FOREIGN KEY(last_modified_by) REFERENCES users(id) ON DELETE SET NULL
    )"#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_memberships_member ON project_memberships(member_id)",
    "CREATE INDEX IF NOT EXISTS idx_folders_project ON folders(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_folder_permissions_membership ON folder_permissions(project_membership_id)",
    "CREATE INDEX IF NOT EXISTS idx_template_fields_template ON metadata_template_fields(metadata_template_id)",
    "CREATE INDEX IF NOT EXISTS idx_templates_assigned ON metadata_templates(assigned_to_content_type, assigned_to_object_id)",
    "CREATE INDEX IF NOT EXISTS idx_metadata_assigned ON metadata(assigned_to_content_type, assigned_to_object_id)",
    "CREATE INDEX IF NOT EXISTS idx_datasets_folder ON uploads_datasets(folder_id)",
    "CREATE INDEX IF NOT EXISTS idx_datasets_drafts ON uploads_datasets(created_by, publication_date)",
    "CREATE INDEX IF NOT EXISTS idx_datasets_expiry ON uploads_datasets(expiry_date)",
    "CREATE INDEX IF NOT EXISTS idx_versions_dataset ON uploads_versions(dataset_id, creation_date)",
    "CREATE INDEX IF NOT EXISTS idx_versions_status ON uploads_versions(status)",
    "CREATE INDEX IF NOT EXISTS idx_version_files_status ON uploads_version_files(status)",
    "CREATE INDEX IF NOT EXISTS idx_version_files_relocating ON uploads_version_files(storage_relocating)",
    "CREATE INDEX IF NOT EXISTS idx_file_parsers_status ON file_parsers(status)",
    "CREATE INDEX IF NOT EXISTS idx_mail_outbox_due ON mail_outbox(status, next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_faqs_category ON faqs(category_id, sort_order)",
];
