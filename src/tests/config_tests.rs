#[cfg(test)]
mod tests {
    use crate::config::{self, AppConfig};
    use std::env;
    use std::fs;
    use tempfile::NamedTempFile;

    fn write_temp_config(content: &str) -> NamedTempFile {
        let temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        fs::write(temp_file.path(), content).unwrap();
        temp_file
    }

    fn layered(snippet: &str) -> AppConfig {
        config::from_toml_layers(&[snippet]).unwrap()
    }

    fn validation_error(snippet: &str) -> String {
        config::validate(&layered(snippet)).unwrap_err().to_string()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.url, "sqlite://data/fdm.db");
        assert_eq!(config.storage.root.to_str(), Some("data/storage"));
        assert_eq!(config.locks.max_lock_minutes, 20);
        assert_eq!(config.uploads.draft_lifetime_days, 30);
        assert_eq!(config.mail.transport, "log");
        assert!(config.workers.enabled);
        assert!(config::validate(&config).is_ok());
    }

    #[test]
    fn test_layers_override_defaults() {
        let config = layered(
            r#"
[server]
port = 9000

[mail]
transport = "http"
endpoint = "https://mail.example.org/send"
"#,
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.mail.endpoint.as_deref(), Some("https://mail.example.org/send"));
        assert_eq!(config.mail.max_retries, 3);
        assert!(config::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(validation_error("[server]\nport = 0\n").contains("invalid server.port"));
        assert!(validation_error("[locks]\nmax_lock_minutes = 0\n").contains("locks.max_lock_minutes must be > 0"));
        assert!(validation_error("[uploads]\nmax_upload_bytes = 0\n").contains("uploads.max_upload_bytes must be > 0"));
        assert!(validation_error("[workers]\ninterval_ms = 0\n").contains("workers.interval_ms must be > 0"));
        assert!(validation_error("[workers]\nmail_batch_size = 0\n").contains("batch sizes"));
        assert!(validation_error("[mail]\ntransport = \"pigeon\"\n").contains("unknown mail.transport"));
        assert!(validation_error("[mail]\ntransport = \"http\"\n").contains("mail.endpoint is required"));
        assert!(validation_error("[auth]\ntoken_ttl_days = -1\n").contains("auth.token_ttl_days"));
    }

    #[test]
    fn test_config_from_file_and_env() {
        let temp_file = write_temp_config(
            r#"
[server]
port = 7000

[storage]
root = "/srv/fdm"
"#,
        );
        let config_path = temp_file.path().with_extension("");
        env::set_var("FDM_CONFIG", config_path.to_str().unwrap());
        env::set_var("FDM__SERVER__PORT", "8888");
        env::set_var("FDM__DATABASE__MAX_CONNECTIONS", "3");

        let config = config::load().unwrap();

        // Environment variables override the file
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.storage.root.to_str(), Some("/srv/fdm"));
        assert_eq!(config.database.max_connections, 3);

        env::remove_var("FDM_CONFIG");
        env::remove_var("FDM__SERVER__PORT");
        env::remove_var("FDM__DATABASE__MAX_CONNECTIONS");
    }

    #[test]
    fn test_ensure_sqlite_parent_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("subdir/test.db");
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        assert!(!db_path.parent().unwrap().exists());

        config::ensure_sqlite_parent_dir(&db_url).unwrap();

        assert!(db_path.parent().unwrap().exists());
    }

    #[test]
    fn test_ensure_sqlite_parent_dir_non_sqlite() {
        // Non-SQLite URL should not create directories
        let result = config::ensure_sqlite_parent_dir("postgres://localhost/db");
        assert!(result.is_ok());
    }
}
