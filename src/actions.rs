//! The declarative action tree.
//!
//! Actions describe what should happen inside a container. They are
//! immutable, arbitrarily nested, and carry no runtime state; the
//! transformer materializes them into executable steps bound to a
//! sandbox. Tree depth and fan-out are unbounded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An environment variable for a run action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Per-process resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLimits {
    /// Open file descriptor cap, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nofile: Option<u64>,
}

/// One node of the action tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Execute a process inside the sandbox.
    Run {
        path: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<EnvVar>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<String>,
        #[serde(default)]
        resource_limits: ProcessLimits,
        #[serde(default)]
        privileged: bool,
        /// Overrides the container's log source name for this process.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_source: Option<String>,
    },

    /// Fetch an artifact through the cached downloader and stream it into
    /// the sandbox.
    Download {
        from_url: String,
        to_path: String,
        #[serde(default)]
        cache_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        /// When set, progress lines mention this name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_name: Option<String>,
    },

    /// Stream a sandbox path out and upload its first archive entry.
    Upload {
        from_path: String,
        to_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_name: Option<String>,
    },

    /// Wrap an inner action with user-facing progress messages.
    EmitProgress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_msg: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success_msg: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_msg: Option<String>,
        inner: Box<Action>,
    },

    /// Run the inner action and succeed regardless of its outcome.
    Try { inner: Box<Action> },

    /// Fail the inner action if it has not finished within the deadline.
    Timeout {
        #[serde(with = "duration_secs")]
        deadline: Duration,
        inner: Box<Action>,
    },

    /// Run children concurrently; wait for all; fail with the first
    /// observed error.
    Parallel { children: Vec<Action> },

    /// Run children in order; the first error short-circuits.
    Serial { children: Vec<Action> },

    /// Run children concurrently; the first to exit cancels the rest.
    Codependent { children: Vec<Action> },

    /// Two-phase readiness/liveness monitor gating the `Running` state.
    Monitor {
        readiness: Box<Action>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        liveness: Option<Box<Action>>,
        /// Seconds the readiness phase may take; zero means no limit.
        #[serde(default)]
        start_timeout_secs: u64,
    },
}

impl Action {
    /// Convenience constructor for the most common leaf.
    pub fn run(path: impl Into<String>, args: Vec<String>) -> Self {
        Action::Run {
            path: path.into(),
            args,
            env: Vec::new(),
            dir: None,
            resource_limits: ProcessLimits::default(),
            privileged: false,
            log_source: None,
        }
    }

    pub fn serial(children: Vec<Action>) -> Self {
        Action::Serial { children }
    }

    pub fn parallel(children: Vec<Action>) -> Self {
        Action::Parallel { children }
    }

    pub fn try_action(inner: Action) -> Self {
        Action::Try {
            inner: Box::new(inner),
        }
    }

    pub fn with_timeout(self, deadline: Duration) -> Self {
        Action::Timeout {
            deadline,
            inner: Box::new(self),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_round_trip_as_tagged_json() {
        let action = Action::serial(vec![
            Action::Download {
                from_url: "https://blobs.example.com/droplet.tgz".to_string(),
                to_path: "/home/vcap".to_string(),
                cache_key: "droplet".to_string(),
                checksum: None,
                artifact_name: Some("droplet".to_string()),
            },
            Action::run("/tmp/lifecycle/launcher", vec!["app".to_string()]),
        ]);

        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains(r#""type":"serial""#));
        assert!(json.contains(r#""type":"download""#));

        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn monitor_action_defaults() {
        let json = r#"{"type":"monitor","readiness":{"type":"run","path":"/bin/true"}}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        match action {
            Action::Monitor {
                liveness,
                start_timeout_secs,
                ..
            } => {
                assert!(liveness.is_none());
                assert_eq!(start_timeout_secs, 0);
            }
            other => panic!("expected monitor, got {other:?}"),
        }
    }
}
