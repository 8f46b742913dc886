//! Built-in heuristic provider for common file-forensics puzzles.
//!
//! Order of play: list the files, follow up on base64-looking text, extract
//! archives and sweep what came out, read text-like files, run `strings` on
//! everything else, then give up. Each `(kind, target)` is proposed once. A
//! binary whose `strings` run gets refused is read directly instead.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::debug;

use crate::agents::{Decision, DecisionProvider};
use crate::core::action::{Action, ActionKind, ExecOptions};
use crate::core::archive::ArchiveFormat;
use crate::core::state::{AgentState, FileEntry, StepOutcome};

/// Extensions read directly rather than run through `strings`.
pub const TEXT_EXTENSIONS: [&str; 22] = [
    "txt", "md", "csv", "json", "xml", "html", "htm", "log", "ini", "cfg", "conf", "yaml", "yml",
    "py", "js", "sh", "c", "b64", "pem", "hex", "asc", "eml",
];

/// At most this many tokens are decoded per follow-up.
const MAX_BASE64_TOKENS: usize = 3;

static BASE64_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9+/]{16,}={0,2}").expect("base64 pattern should compile")
});

const SWEEP_SCRIPT: &str = r#"import os
for base, _, names in sorted(os.walk("extracted")):
    for name in sorted(names):
        path = os.path.join(base, name)
        try:
            with open(path, "rb") as fh:
                data = fh.read(200000)
        except OSError as exc:
            print(path, exc)
            continue
        print("==>", path)
        print(data.decode("utf-8", "replace"))
"#;

/// Deterministic provider that needs no external process.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleProvider;

impl DecisionProvider for RuleProvider {
    fn propose(&self, state: &AgentState) -> Result<Decision> {
        let decision = next_decision(state);
        debug!(objective = ?decision.objective, stop = decision.stop, "rule decision");
        Ok(decision)
    }
}

fn next_decision(state: &AgentState) -> Decision {
    if !state.is_done(ActionKind::ListFiles, ".") {
        return Decision::act(&Action::ListFiles, "survey the challenge directory")
            .with_objective("inventory");
    }

    if let Some(decision) = base64_follow_up(state) {
        return decision;
    }

    if let Some(entry) = pending(state, ActionKind::ExtractArchive, |e| {
        ArchiveFormat::is_archive(&e.path)
    }) {
        let action = Action::ExtractArchive {
            target: entry.path.clone(),
            timeout_secs: None,
        };
        return Decision::act(&action, format!("unpack {}", entry.path)).with_objective("archives");
    }

    let extractions = state.done_count(ActionKind::ExtractArchive);
    if extractions > 0 {
        let key = format!("sweep:extracted#{extractions}");
        if !state.is_done(ActionKind::RunScript, &key) {
            let action = Action::RunScript {
                script_body: SWEEP_SCRIPT.to_string(),
                target: Some(key),
                options: ExecOptions::default(),
            };
            return Decision::act(&action, "read everything the archives produced")
                .with_objective("archives");
        }
    }

    if let Some(entry) = pending(state, ActionKind::ReadFileHead, is_text_like) {
        let action = Action::ReadFileHead {
            target: entry.path.clone(),
        };
        return Decision::act(&action, format!("read {}", entry.path)).with_objective("text files");
    }

    // The absolute path can trip the network gate (`ssh_host_key.bin`), so fall
    // back to reading the head of any file whose `strings` run was refused.
    if let Some(entry) = pending(state, ActionKind::ReadFileHead, |e| {
        strings_refused(state, &e.path)
    }) {
        let action = Action::ReadFileHead {
            target: entry.path.clone(),
        };
        return Decision::act(
            &action,
            format!("strings was refused, read {} directly", entry.path),
        )
        .with_objective("binary files");
    }

    if let Some(entry) = pending(state, ActionKind::RunCommand, |e| {
        !is_text_like(e) && !ArchiveFormat::is_archive(&e.path)
    }) {
        let absolute = state.challenge_root.join(&entry.path);
        let action = Action::RunCommand {
            command: vec![
                "strings".to_string(),
                "-n".to_string(),
                "6".to_string(),
                absolute.display().to_string(),
            ],
            target: Some(entry.path.clone()),
            options: ExecOptions::default(),
        };
        return Decision::act(&action, format!("printable strings of {}", entry.path))
            .with_objective("binary files");
    }

    Decision::stop(None, "no untried heuristics left").with_objective("give up")
}

/// First inventory entry matching `filter` not yet attempted as `kind`.
fn pending(
    state: &AgentState,
    kind: ActionKind,
    filter: impl Fn(&FileEntry) -> bool,
) -> Option<&FileEntry> {
    state
        .file_inventory
        .iter()
        .find(|entry| filter(entry) && !state.is_done(kind, &entry.path))
}

fn strings_refused(state: &AgentState, path: &str) -> bool {
    state.step_log.iter().any(|record| {
        record.kind == Some(ActionKind::RunCommand)
            && record.target.as_deref() == Some(path)
            && record.blocked().is_some()
    })
}

fn is_text_like(entry: &FileEntry) -> bool {
    TEXT_EXTENSIONS.contains(&entry.extension.as_str())
}

/// Decode base64-looking tokens from the last textual read, once per token set.
fn base64_follow_up(state: &AgentState) -> Option<Decision> {
    let last = state.last_step()?;
    let textual = match (last.kind, last.target.as_deref()) {
        (Some(ActionKind::ReadFileHead), _) => true,
        (Some(ActionKind::RunScript), Some(target)) => {
            target.starts_with("sweep:") || target.starts_with("base64:")
        }
        _ => false,
    };
    if !textual || !matches!(last.outcome, StepOutcome::Executed { succeeded: true, .. }) {
        return None;
    }
    let stdout = &state.last_execution_summary.as_ref()?.stdout;

    let mut tokens: Vec<&str> = Vec::new();
    for found in BASE64_RE.find_iter(stdout) {
        let token = found.as_str();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
        if tokens.len() == MAX_BASE64_TOKENS {
            break;
        }
    }
    if tokens.is_empty() {
        return None;
    }
    let key = format!("base64:{}", tokens.join(","));
    if state.is_done(ActionKind::RunScript, &key) {
        return None;
    }

    let action = Action::RunScript {
        script_body: decode_script(&tokens),
        target: Some(key),
        options: ExecOptions::default(),
    };
    Some(
        Decision::act(&action, format!("decode {} base64-looking token(s)", tokens.len()))
            .with_objective("encodings"),
    )
}

fn decode_script(tokens: &[&str]) -> String {
    let quoted = tokens
        .iter()
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"import base64, binascii
for s in [{quoted}]:
    try:
        print(base64.b64decode(s + "=" * (-len(s) % 4)).decode("utf-8", "replace"))
    except (binascii.Error, ValueError) as exc:
        print("not base64:", s, exc)
"#
    )
}
