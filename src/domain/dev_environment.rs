use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevEnvironment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub docker_image: String,
    pub cpu_limit: f64,
    pub memory_limit: u64,
    pub env_vars: Value,
}

impl DevEnvironment {
    pub const CLAUDE_CODE: &'static str = "claude-code";
    /// The one recognized non-claude-code type; any other value (including
    /// empty or unrecognized strings) falls back to the Claude Code tail.
    pub const GENERIC: &'static str = "generic";

    /// `true` for the Claude Code assistant, for the empty/default type, and
    /// for any unrecognized type string — only the explicit `"generic"` type
    /// opts out of the Claude Code tail, per the container command builder's
    /// "claude-code (or unknown/default)" rule.
    pub fn uses_claude_code(&self) -> bool {
        self.kind != Self::GENERIC
    }

    /// Parse `env_vars` into a validated string→string mapping. Keys must be
    /// non-empty and must not contain `=`; invalid entries are dropped rather
    /// than failing the whole environment (the source JSON is operator-owned
    /// configuration, not untrusted input that must be rejected outright).
    pub fn parsed_env_vars(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Some(map) = self.env_vars.as_object() {
            for (k, v) in map {
                if k.is_empty() || k.contains('=') {
                    continue;
                }
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => continue,
                    other => other.to_string(),
                };
                out.insert(k.clone(), value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(kind: &str, vars: serde_json::Value) -> DevEnvironment {
        DevEnvironment {
            id: "env-1".into(),
            kind: kind.into(),
            docker_image: "ghcr.io/example/claude:latest".into(),
            cpu_limit: 0.0,
            memory_limit: 0,
            env_vars: vars,
        }
    }

    #[test]
    fn unknown_type_defaults_to_claude_code() {
        let e = env("something-else", serde_json::json!({}));
        assert!(e.uses_claude_code());
    }

    #[test]
    fn empty_type_defaults_to_claude_code() {
        let e = env("", serde_json::json!({}));
        assert!(e.uses_claude_code());
    }

    #[test]
    fn generic_type_opts_out_of_claude_code() {
        let e = env(DevEnvironment::GENERIC, serde_json::json!({}));
        assert!(!e.uses_claude_code());
    }

    #[test]
    fn invalid_env_keys_are_dropped() {
        let e = env(
            DevEnvironment::CLAUDE_CODE,
            serde_json::json!({"API_KEY": "sk-xyz", "BAD=KEY": "x", "": "y"}),
        );
        let vars = e.parsed_env_vars();
        assert_eq!(vars.get("API_KEY"), Some(&"sk-xyz".to_string()));
        assert_eq!(vars.len(), 1);
    }
}
