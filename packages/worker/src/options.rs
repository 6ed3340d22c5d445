//! Worker configuration.
//!
//! Options are plain data so they can be loaded from JSON:
//!
//! ```json
//! {
//!   "runtime_executable": "deno",
//!   "permissions": { "allow_read": ["/tmp"], "allow_net": false },
//!   "reload": true
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A capability that can be off, fully on, or limited to a list of targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Grant {
    Flag(bool),
    List(Vec<String>),
}

impl Grant {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Grant::Flag(false))
    }

    /// Render as `--name` or `--name=a,b`; `None` when not granted.
    pub fn to_flag(&self, name: &str) -> Option<String> {
        match self {
            Grant::Flag(false) => None,
            Grant::Flag(true) => Some(format!("--{}", name)),
            Grant::List(items) => Some(format!("--{}={}", name, items.join(","))),
        }
    }
}

impl Default for Grant {
    fn default() -> Self {
        Grant::Flag(false)
    }
}

impl From<bool> for Grant {
    fn from(granted: bool) -> Self {
        Grant::Flag(granted)
    }
}

impl<S: Into<String>> FromIterator<S> for Grant {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Grant::List(iter.into_iter().map(Into::into).collect())
    }
}

/// Sandbox permissions passed to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub allow_all: bool,
    /// The worker's own loopback address is always allowed in addition.
    pub allow_net: Grant,
    pub allow_read: Grant,
    pub allow_write: Grant,
    pub allow_env: Grant,
    pub allow_run: Grant,
    pub allow_hrtime: bool,
    pub deny_net: Grant,
    pub deny_read: Grant,
    pub deny_write: Grant,
    pub deny_env: Grant,
    pub deny_run: Grant,
}

/// Everything needed to spawn and supervise a runtime process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub runtime_executable: String,
    pub bootstrap_script: String,
    /// Address the worker's listener binds to.
    pub host: IpAddr,
    pub reload: Grant,
    pub unstable: bool,
    pub v8_flags: Vec<String>,
    pub import_map: Option<String>,
    pub lock_file: Option<String>,
    pub cached_only: bool,
    pub no_check: bool,
    pub unsafely_ignore_certificate_errors: Grant,
    pub location: Option<String>,
    pub extra_flags: Vec<String>,
    pub permissions: Permissions,
    /// Forward the runtime's stdout to `tracing` instead of exposing it.
    pub log_stdout: bool,
    /// Forward the runtime's stderr to `tracing` instead of exposing it.
    pub log_stderr: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            runtime_executable: "deno".to_string(),
            bootstrap_script: "bootstrap.ts".to_string(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            reload: Grant::default(),
            unstable: false,
            v8_flags: Vec::new(),
            import_map: None,
            lock_file: None,
            cached_only: false,
            no_check: false,
            unsafely_ignore_certificate_errors: Grant::default(),
            location: None,
            extra_flags: Vec::new(),
            permissions: Permissions::default(),
            log_stdout: true,
            log_stderr: true,
        }
    }
}

impl WorkerOptions {
    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_runtime_executable(mut self, program: impl Into<String>) -> Self {
        self.runtime_executable = program.into();
        self
    }

    pub fn with_bootstrap_script(mut self, path: impl Into<String>) -> Self {
        self.bootstrap_script = path.into();
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;

    #[test]
    fn defaults() {
        let options = WorkerOptions::default();
        assert_eq!(options.runtime_executable, "deno");
        assert_eq!(options.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(options.log_stdout);
        assert!(options.log_stderr);
        assert!(!options.permissions.allow_net.is_granted());
    }

    #[test]
    fn grant_forms() {
        assert_eq!(Grant::Flag(false).to_flag("allow-read"), None);
        assert_eq!(
            Grant::Flag(true).to_flag("allow-read"),
            Some("--allow-read".to_string())
        );
        let list: Grant = ["/tmp", "/var"].into_iter().collect();
        assert_eq!(
            list.to_flag("allow-read"),
            Some("--allow-read=/tmp,/var".to_string())
        );
    }

    #[test]
    fn parse_partial_json() {
        let options = WorkerOptions::from_json_str(
            r#"{
                "runtime_executable": "/opt/deno",
                "reload": ["https://deno.land/std"],
                "log_stdout": false,
                "permissions": { "allow_read": true, "deny_env": ["HOME"] }
            }"#,
        )
        .unwrap();

        assert_eq!(options.runtime_executable, "/opt/deno");
        assert_eq!(options.bootstrap_script, "bootstrap.ts");
        assert_eq!(
            options.reload,
            Grant::List(vec!["https://deno.land/std".into()])
        );
        assert!(!options.log_stdout);
        assert!(options.log_stderr);
        assert_eq!(options.permissions.allow_read, Grant::Flag(true));
        assert_eq!(options.permissions.deny_env, Grant::List(vec!["HOME".into()]));
        assert_eq!(options.permissions.allow_write, Grant::Flag(false));
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = WorkerOptions::from_json_str(r#"{"reload": 5}"#).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }
}
