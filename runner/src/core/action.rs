//! Closed action vocabulary and structural validation of untrusted descriptors.
//!
//! Descriptors arrive as loose JSON objects from a decision provider. [`validate`]
//! turns one into a typed [`Action`] or explains which field is wrong. It never
//! touches the filesystem or consults policy; those checks belong to the sandbox.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Every action kind the runner understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ListFiles,
    ReadFileHead,
    RunCommand,
    RunScript,
    ExtractArchive,
    InstallPackages,
    Stop,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ListFiles => "list_files",
            ActionKind::ReadFileHead => "read_file_head",
            ActionKind::RunCommand => "run_command",
            ActionKind::RunScript => "run_script",
            ActionKind::ExtractArchive => "extract_archive",
            ActionKind::InstallPackages => "install_packages",
            ActionKind::Stop => "stop",
        }
    }

    /// Parse a kind name. Accepts `-` or `_` separators in any case, plus the
    /// legacy `run_cmd` / `run_python` spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "list_files" => Some(ActionKind::ListFiles),
            "read_file_head" => Some(ActionKind::ReadFileHead),
            "run_command" | "run_cmd" => Some(ActionKind::RunCommand),
            "run_script" | "run_python" => Some(ActionKind::RunScript),
            "extract_archive" => Some(ActionKind::ExtractArchive),
            "install_packages" => Some(ActionKind::InstallPackages),
            "stop" => Some(ActionKind::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process options shared by the command-running kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Wall-clock limit; `None` means the policy default.
    pub timeout_secs: Option<u64>,
    /// Working directory relative to the scratch area.
    pub working_dir: Option<String>,
    /// Variables layered over the inherited environment.
    pub extra_env: BTreeMap<String, String>,
}

/// A structurally valid action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ListFiles,
    ReadFileHead {
        target: String,
    },
    RunCommand {
        command: Vec<String>,
        target: Option<String>,
        options: ExecOptions,
    },
    RunScript {
        script_body: String,
        target: Option<String>,
        options: ExecOptions,
    },
    ExtractArchive {
        target: String,
        timeout_secs: Option<u64>,
    },
    InstallPackages {
        packages: Vec<String>,
        timeout_secs: Option<u64>,
    },
    Stop {
        flag: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ListFiles => ActionKind::ListFiles,
            Action::ReadFileHead { .. } => ActionKind::ReadFileHead,
            Action::RunCommand { .. } => ActionKind::RunCommand,
            Action::RunScript { .. } => ActionKind::RunScript,
            Action::ExtractArchive { .. } => ActionKind::ExtractArchive,
            Action::InstallPackages { .. } => ActionKind::InstallPackages,
            Action::Stop { .. } => ActionKind::Stop,
        }
    }

    /// Key recorded in the per-kind done-set once this action has been attempted.
    ///
    /// Command kinds prefer an explicit `target` label and fall back to the
    /// command text itself.
    pub fn dedup_target(&self) -> Option<String> {
        match self {
            Action::ListFiles => Some(".".to_string()),
            Action::ReadFileHead { target } | Action::ExtractArchive { target, .. } => {
                Some(target.clone())
            }
            Action::RunCommand {
                command, target, ..
            } => Some(target.clone().unwrap_or_else(|| command.join(" "))),
            Action::RunScript {
                script_body,
                target,
                ..
            } => Some(target.clone().unwrap_or_else(|| script_body.clone())),
            Action::InstallPackages { packages, .. } => {
                let mut sorted = packages.clone();
                sorted.sort();
                Some(sorted.join(" "))
            }
            Action::Stop { .. } => None,
        }
    }

    /// Render back into the descriptor shape accepted by [`validate`].
    pub fn to_descriptor(&self) -> Value {
        match self {
            Action::ListFiles => json!({ "kind": ActionKind::ListFiles }),
            Action::ReadFileHead { target } => {
                json!({ "kind": ActionKind::ReadFileHead, "target": target })
            }
            Action::RunCommand {
                command,
                target,
                options,
            } => {
                let mut value = json!({ "kind": ActionKind::RunCommand, "command": command });
                insert_exec_fields(&mut value, target.as_deref(), options);
                value
            }
            Action::RunScript {
                script_body,
                target,
                options,
            } => {
                let mut value =
                    json!({ "kind": ActionKind::RunScript, "script_body": script_body });
                insert_exec_fields(&mut value, target.as_deref(), options);
                value
            }
            Action::ExtractArchive {
                target,
                timeout_secs,
            } => json!({
                "kind": ActionKind::ExtractArchive,
                "target": target,
                "timeout_seconds": timeout_secs,
            }),
            Action::InstallPackages {
                packages,
                timeout_secs,
            } => json!({
                "kind": ActionKind::InstallPackages,
                "packages": packages,
                "timeout_seconds": timeout_secs,
            }),
            Action::Stop { flag } => json!({ "kind": ActionKind::Stop, "flag": flag }),
        }
    }
}

fn insert_exec_fields(value: &mut Value, target: Option<&str>, options: &ExecOptions) {
    let Some(map) = value.as_object_mut() else {
        return;
    };
    if let Some(target) = target {
        map.insert("target".to_string(), json!(target));
    }
    if let Some(timeout) = options.timeout_secs {
        map.insert("timeout_seconds".to_string(), json!(timeout));
    }
    if let Some(dir) = &options.working_dir {
        map.insert("working_dir".to_string(), json!(dir));
    }
    if !options.extra_env.is_empty() {
        map.insert("extra_env".to_string(), json!(options.extra_env));
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ListFiles => write!(f, "list_files"),
            Action::ReadFileHead { target } => write!(f, "read_file_head {target}"),
            Action::RunCommand { command, .. } => write!(f, "run_command {}", command.join(" ")),
            Action::RunScript { script_body, .. } => {
                let first_line = script_body.lines().next().unwrap_or_default();
                write!(f, "run_script {first_line}")
            }
            Action::ExtractArchive { target, .. } => write!(f, "extract_archive {target}"),
            Action::InstallPackages { packages, .. } => {
                write!(f, "install_packages {}", packages.join(" "))
            }
            Action::Stop { flag: Some(flag) } => write!(f, "stop {flag}"),
            Action::Stop { flag: None } => write!(f, "stop"),
        }
    }
}

/// Structural problems with a descriptor. Both variants end the session.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("unknown action kind: {kind}")]
    UnknownActionKind { kind: String },
    #[error("{kind} requires `{field}` ({expected})")]
    MissingField {
        kind: String,
        field: String,
        expected: String,
    },
}

impl ValidationError {
    fn missing(kind: &str, field: &str, expected: &str) -> Self {
        ValidationError::MissingField {
            kind: kind.to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Validate an untrusted descriptor. Unknown keys are ignored.
pub fn validate(raw: &Value) -> Result<Action, ValidationError> {
    let Some(map) = raw.as_object() else {
        return Err(ValidationError::missing(
            "action",
            "kind",
            "descriptor must be an object with a kind",
        ));
    };
    let kind_value = map.get("kind").or_else(|| map.get("type"));
    let kind_name = match kind_value {
        Some(Value::String(name)) => name.as_str(),
        _ => {
            return Err(ValidationError::missing(
                "action",
                "kind",
                "string naming an action kind",
            ));
        }
    };
    let kind = ActionKind::parse(kind_name).ok_or_else(|| ValidationError::UnknownActionKind {
        kind: kind_name.to_string(),
    })?;
    let fields = Fields {
        kind: kind.as_str(),
        map,
    };

    let action = match kind {
        ActionKind::ListFiles => Action::ListFiles,
        ActionKind::ReadFileHead => Action::ReadFileHead {
            target: fields.required_string("target")?,
        },
        ActionKind::RunCommand => Action::RunCommand {
            command: fields.required_list("command")?,
            target: fields.optional_string("target")?,
            options: fields.exec_options()?,
        },
        ActionKind::RunScript => Action::RunScript {
            script_body: fields.script_body()?,
            target: fields.optional_string("target")?,
            options: fields.exec_options()?,
        },
        ActionKind::ExtractArchive => Action::ExtractArchive {
            target: fields.required_string("target")?,
            timeout_secs: fields.timeout()?,
        },
        ActionKind::InstallPackages => Action::InstallPackages {
            packages: fields.required_list("packages")?,
            timeout_secs: fields.timeout()?,
        },
        ActionKind::Stop => Action::Stop {
            flag: fields.optional_string("flag")?,
        },
    };
    Ok(action)
}

struct Fields<'a> {
    kind: &'static str,
    map: &'a Map<String, Value>,
}

impl Fields<'_> {
    /// Absent and `null` are treated the same.
    fn get(&self, field: &str) -> Option<&Value> {
        self.map.get(field).filter(|value| !value.is_null())
    }

    fn required_string(&self, field: &str) -> Result<String, ValidationError> {
        match self.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            _ => Err(ValidationError::missing(
                self.kind,
                field,
                "non-empty string",
            )),
        }
    }

    fn optional_string(&self, field: &str) -> Result<Option<String>, ValidationError> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ValidationError::missing(self.kind, field, "string")),
        }
    }

    fn required_list(&self, field: &str) -> Result<Vec<String>, ValidationError> {
        let expected = "non-empty array of strings";
        let Some(Value::Array(items)) = self.get(field) else {
            return Err(ValidationError::missing(self.kind, field, expected));
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) => out.push(s.clone()),
                _ => return Err(ValidationError::missing(self.kind, field, expected)),
            }
        }
        if out.first().is_none_or(|first| first.trim().is_empty()) {
            return Err(ValidationError::missing(self.kind, field, expected));
        }
        Ok(out)
    }

    fn script_body(&self) -> Result<String, ValidationError> {
        // `code` is what older descriptors call the body.
        match self.get("script_body").or_else(|| self.get("code")) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            _ => Err(ValidationError::missing(
                self.kind,
                "script_body",
                "non-empty string",
            )),
        }
    }

    fn timeout(&self) -> Result<Option<u64>, ValidationError> {
        match self.get("timeout_seconds") {
            None => Ok(None),
            Some(value) => match value.as_u64() {
                Some(secs) if secs > 0 => Ok(Some(secs)),
                _ => Err(ValidationError::missing(
                    self.kind,
                    "timeout_seconds",
                    "positive integer",
                )),
            },
        }
    }

    fn exec_options(&self) -> Result<ExecOptions, ValidationError> {
        let mut extra_env = BTreeMap::new();
        match self.get("extra_env") {
            None => {}
            Some(Value::Object(vars)) => {
                for (key, value) in vars {
                    let Value::String(value) = value else {
                        return Err(ValidationError::missing(
                            self.kind,
                            "extra_env",
                            "object of string values",
                        ));
                    };
                    extra_env.insert(key.clone(), value.clone());
                }
            }
            Some(_) => {
                return Err(ValidationError::missing(
                    self.kind,
                    "extra_env",
                    "object of string values",
                ));
            }
        }
        Ok(ExecOptions {
            timeout_secs: self.timeout()?,
            working_dir: self.optional_string("working_dir")?,
            extra_env,
        })
    }
}
