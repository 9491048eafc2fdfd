use tracing::{debug, warn};

use crate::config::HooksConfig;
use crate::state::ExecutionState;

/// Run lifecycle points that trigger hook commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    RunStart,
    RunComplete,
    RunError,
    Handoff,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "run_start",
            Self::RunComplete => "run_complete",
            Self::RunError => "run_error",
            Self::Handoff => "handoff",
        }
    }

    fn commands<'a>(&self, hooks: &'a HooksConfig) -> &'a [String] {
        match self {
            Self::RunStart => &hooks.on_run_start,
            Self::RunComplete => &hooks.on_run_complete,
            Self::RunError => &hooks.on_run_error,
            Self::Handoff => &hooks.on_handoff,
        }
    }
}

/// `CHATFLOW_*` environment passed to hook commands.
pub fn hook_env(point: HookPoint, state: &ExecutionState, detail: Option<&str>) -> Vec<(String, String)> {
    let mut env = vec![
        ("CHATFLOW_HOOK".to_string(), point.as_str().to_string()),
        ("CHATFLOW_FLOW_ID".to_string(), state.flow_id.0.clone()),
        ("CHATFLOW_FLOW_VERSION".to_string(), state.flow_version.to_string()),
        ("CHATFLOW_CONTACT_ID".to_string(), state.contact_id.0.clone()),
        ("CHATFLOW_CHANNEL_ID".to_string(), state.channel_id.clone()),
        ("CHATFLOW_NODE_ID".to_string(), state.current_node_id.clone()),
        ("CHATFLOW_STATUS".to_string(), state.status.as_str().to_string()),
    ];
    if let Some(detail) = detail {
        env.push(("CHATFLOW_DETAIL".to_string(), detail.to_string()));
    }
    env
}

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(String, String)]) {
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => debug!(hook = %cmd, "Hook finished"),
        }
    }
}

/// Spawn the commands configured for `point` in the background.
pub fn fire(hooks: Option<&HooksConfig>, point: HookPoint, state: &ExecutionState, detail: Option<&str>) {
    let Some(hooks) = hooks else { return };
    let commands = point.commands(hooks).to_vec();
    if commands.is_empty() {
        return;
    }
    let env = hook_env(point, state, detail);
    tokio::spawn(async move {
        run_hooks(&commands, &env).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContactId, FlowId};

    fn state() -> ExecutionState {
        ExecutionState::new(
            FlowId::from_str("welcome"),
            3,
            ContactId::from_str("c9"),
            "web",
            "start",
        )
    }

    #[test]
    fn test_hook_env_contents() {
        let env = hook_env(HookPoint::Handoff, &state(), Some("queue:sales"));
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("CHATFLOW_HOOK"), Some("handoff"));
        assert_eq!(get("CHATFLOW_FLOW_VERSION"), Some("3"));
        assert_eq!(get("CHATFLOW_CONTACT_ID"), Some("c9"));
        assert_eq!(get("CHATFLOW_DETAIL"), Some("queue:sales"));
    }

    #[tokio::test]
    async fn test_run_hooks_writes_env() {
        let dir = std::env::temp_dir().join(format!("chatflow-hook-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("out.txt");
        let cmd = format!("printf '%s' \"$CHATFLOW_FLOW_ID\" > {}", out.display());
        let env = hook_env(HookPoint::RunStart, &state(), None);
        run_hooks(&[cmd], &env).await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "welcome");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failing_hook_is_absorbed() {
        run_hooks(&["exit 3".to_string()], &[]).await;
    }
}
