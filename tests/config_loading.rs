use std::io::Write;

use chatflow_core::config::AppConfig;
use chatflow_core::error::ChatflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps_per_advance = 50
fallback_message = "Back soon."
conversation_window = 10
processed_event_window = 32
default_timeout_secs = 4

[storage]
path = "/var/lib/chatflow/test.db"

[llm]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
base_url = "http://localhost:11434/v1"
max_tokens = 256
temperature = 0.7

[llm.retry]
max_retries = 3
initial_backoff_ms = 100

[http]
user_agent = "chatflow-test"
connect_timeout_secs = 2

[lanes]
buffer = 8
idle_secs = 30

[simulation]
max_steps = 40

[hooks]
on_run_start = ["echo start"]
on_handoff = ["notify-desk"]

[log]
level = 1
log_dir = "/tmp/chatflow-logs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps_per_advance, 50);
    assert_eq!(config.engine.fallback_message, "Back soon.");
    assert_eq!(config.engine.conversation_window, 10);
    assert_eq!(config.engine.processed_event_window, 32);
    assert_eq!(config.engine.default_timeout_secs, 4);
    assert_eq!(
        config.storage_path(),
        std::path::PathBuf::from("/var/lib/chatflow/test.db")
    );

    let llm = config.llm.as_ref().expect("llm section");
    assert_eq!(llm.model_id, "gpt-4o-mini");
    assert_eq!(llm.api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(llm.max_tokens, 256);
    let retry = llm.retry.as_ref().expect("retry section");
    assert_eq!(retry.max_retries, 3);
    assert_eq!(retry.initial_backoff_ms, 100);
    assert_eq!(retry.max_backoff_ms, 8000);

    assert_eq!(config.http.user_agent, "chatflow-test");
    assert_eq!(config.lanes.buffer, 8);
    assert_eq!(config.lanes.idle_secs, 30);
    assert_eq!(config.simulation.max_steps, 40);

    let hooks = config.hooks.as_ref().expect("hooks section");
    assert_eq!(hooks.on_run_start, vec!["echo start"]);
    assert!(hooks.on_run_complete.is_empty());
    assert_eq!(hooks.on_handoff, vec!["notify-desk"]);

    let log = config.log.as_ref().expect("log section");
    assert!(log.enabled);
    assert_eq!(log.level, 1);
    assert_eq!(config.log_dir(), std::path::PathBuf::from("/tmp/chatflow-logs"));
}

#[test]
fn test_env_vars_expanded_in_config() {
    std::env::set_var("CHATFLOW_IT_API_KEY", "sk-from-env");
    let toml_content = r#"
[llm]
model_id = "gpt-4o-mini"
api_key = "${CHATFLOW_IT_API_KEY}"
"#;
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(toml_content.as_bytes()).unwrap();

    let config = AppConfig::load(tmp.path()).unwrap();
    assert_eq!(config.llm.unwrap().api_key.as_deref(), Some("sk-from-env"));
    std::env::remove_var("CHATFLOW_IT_API_KEY");
}

#[test]
fn test_empty_file_is_valid() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let config = AppConfig::load(tmp.path()).unwrap();
    assert_eq!(config.engine.max_steps_per_advance, 100);
    assert_eq!(config.engine.default_timeout_secs, 10);
    assert!(config.llm.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/chatflow.toml")).unwrap_err();
    assert!(matches!(err, ChatflowError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"[engine\nmax_steps_per_advance = ").unwrap();
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, ChatflowError::Config(_)));
}
