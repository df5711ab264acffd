//! PowerShell runner for CIM queries and PnP cmdlets

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, warn};

use dg_error::{DevGuardError, Result};

const POWERSHELL: &str = "powershell.exe";

/// Run `script` and return its stdout. The child is killed when `timeout`
/// expires.
pub fn run(label: &str, script: &str, timeout: Duration) -> Result<String> {
    let mut child = Command::new(POWERSHELL)
        .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command", script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DevGuardError::command(label, format!("spawn {POWERSHELL}: {e}")))?;

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        return Err(DevGuardError::command(label, "stdio not captured"));
    };

    let stderr_reader = std::thread::spawn(move || {
        let mut err = String::new();
        let _ = stderr.read_to_string(&mut err);
        err
    });
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut out = String::new();
        let _ = tx.send(stdout.read_to_string(&mut out).map(|_| out));
    });

    let out = match rx.recv_timeout(timeout) {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            let _ = child.kill();
            return Err(DevGuardError::command(label, format!("read output: {e}")));
        }
        Err(_) => {
            warn!(command = label, timeout_ms = timeout.as_millis() as u64, "PowerShell timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(DevGuardError::Timeout(label.to_string()));
        }
    };

    let status = child
        .wait()
        .map_err(|e| DevGuardError::command(label, format!("wait: {e}")))?;
    if !status.success() {
        let err = stderr_reader.join().unwrap_or_default();
        return Err(DevGuardError::command(label, format!("{status}: {}", err.trim())));
    }

    debug!(command = label, bytes = out.len(), "PowerShell finished");
    Ok(out)
}

/// Run `script` (which must end in `ConvertTo-Json`) and parse the result
pub fn run_json<T: DeserializeOwned>(label: &str, script: &str, timeout: Duration) -> Result<T> {
    let out = run(label, script, timeout)?;
    let trimmed = out.trim();
    let json = if trimmed.is_empty() { "null" } else { trimmed };
    Ok(serde_json::from_str(json)?)
}

/// Single-quoted PowerShell literal
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `ConvertTo-Json` emits a bare object for one element and nothing (or
/// `null`) for none. Accept all three shapes as a list.
pub fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Doc {
        #[serde(default, deserialize_with = "one_or_many")]
        items: Vec<u32>,
    }

    #[test]
    fn collapsed_arrays_accepted() {
        let many: Doc = serde_json::from_str(r#"{"items":[1,2]}"#).unwrap();
        let one: Doc = serde_json::from_str(r#"{"items":3}"#).unwrap();
        let none: Doc = serde_json::from_str(r#"{"items":null}"#).unwrap();
        let missing: Doc = serde_json::from_str("{}").unwrap();
        assert_eq!(many.items, vec![1, 2]);
        assert_eq!(one.items, vec![3]);
        assert!(none.items.is_empty());
        assert!(missing.items.is_empty());
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(quote(r"USB\VID_1&PID_2\it's"), r"'USB\VID_1&PID_2\it''s'");
    }
}
