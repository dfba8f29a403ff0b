//! Sandbox Executor (§4.2): runs an LLM-generated `solver(input_grid)`
//! function in an isolated child process with a hard timeout.
//!
//! Grounded on `examples/original_source/src/sandbox.py`
//! (`_SANDBOX_DRIVER`, `run_untrusted_code`, `_preexec_new_pgrp`) for the
//! exact protocol and driver source; adapted to the teacher's
//! `tokio::process` + temp-file idiom (`src/repl.rs`), generalized from
//! single-process `child.kill()` to process-group `killpg` since untrusted
//! code may itself fork.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, AsyncReadExt};
use tokio::process::Command;
use tracing::warn;

use crate::task::Grid;

/// The driver program executed inside the sandbox subprocess. Compiled in
/// as a string constant per §9 ("do not embed a language runtime; execute
/// a standalone child program whose driver source is compiled in").
const SANDBOX_DRIVER: &str = r#"
import json
import sys
import traceback
import math
import itertools
from collections import Counter, deque, defaultdict
from typing import List, Optional, Tuple, Any, Dict, Set
import copy

try:
    import numpy as np
except ImportError:
    np = None

try:
    import scipy
    import scipy.ndimage
except ImportError:
    scipy = None

def convert_to_numpy(obj):
    if np is None:
        return obj
    if isinstance(obj, list):
        return np.array(obj)
    return obj

def sanitize_output(obj):
    if isinstance(obj, list):
        return [sanitize_output(x) for x in obj]
    if isinstance(obj, tuple):
        return tuple(sanitize_output(x) for x in obj)
    if isinstance(obj, dict):
        return {k: sanitize_output(v) for k, v in obj.items()}
    if np and isinstance(obj, (np.integer, int)):
        return int(obj)
    if np and isinstance(obj, (np.floating, float)):
        return float(obj)
    if np and isinstance(obj, np.ndarray):
        return sanitize_output(obj.tolist())
    return obj

def main():
    try:
        input_data = sys.stdin.read()
        if not input_data:
            raise ValueError("No input received on stdin")

        payload = json.loads(input_data)
        code = payload["code"]
        inp_raw = payload["input"]
        inp = convert_to_numpy(inp_raw)

        local_scope = {
            "np": np,
            "scipy": scipy,
            "Counter": Counter,
            "deque": deque,
            "defaultdict": defaultdict,
            "List": List,
            "Optional": Optional,
            "Tuple": Tuple,
            "Any": Any,
            "Dict": Dict,
            "Set": Set,
            "copy": copy.copy,
            "deepcopy": copy.deepcopy,
            "gcd": math.gcd,
            "math": math,
            "itertools": itertools,
            "Grid": List[List[int]],
        }

        exec(code, local_scope)

        if "solver" not in local_scope:
            raise RuntimeError("No 'solver' function defined in code.")

        solver = local_scope["solver"]
        if not callable(solver):
            raise RuntimeError("'solver' is not callable.")

        raw_out = solver(inp)
        out = sanitize_output(raw_out)
        json.dump({"ok": True, "output": out}, sys.stdout)

    except Exception as e:
        json.dump(
            {
                "ok": False,
                "error": f"{type(e).__name__}: {str(e)}",
                "traceback": traceback.format_exc(),
            },
            sys.stdout,
        )
        print(f"Sandbox Error: {e}", file=sys.stderr)
        traceback.print_exc(file=sys.stderr)

if __name__ == "__main__":
    main()
"#;

#[derive(Serialize)]
struct SandboxPayload<'a> {
    code: &'a str,
    input: &'a Grid,
}

#[derive(Deserialize)]
struct SandboxOk {
    output: Value,
}

#[derive(Deserialize)]
struct SandboxErr {
    error: String,
    #[serde(default)]
    traceback: String,
}

/// Outcome of one sandbox run (§4.2).
#[derive(Debug, Clone)]
pub enum SandboxOutcome {
    Success { output: Value },
    Timeout,
    Crash { message: String },
}

/// Converts `output` into a rectangular grid if it is shaped like one.
/// Anything else (ragged, empty, non-integer cells) is treated as a
/// verification failure one layer up, not a sandbox error.
pub fn output_as_grid(output: &Value) -> Option<Grid> {
    let rows = output.as_array()?;
    if rows.is_empty() {
        return None;
    }
    let mut grid = Vec::with_capacity(rows.len());
    let mut width = None;
    for row in rows {
        let cells = row.as_array()?;
        if let Some(w) = width {
            if cells.len() != w {
                return None;
            }
        } else {
            width = Some(cells.len());
        }
        let mut out_row = Vec::with_capacity(cells.len());
        for cell in cells {
            out_row.push(cell.as_u64()?.try_into().ok()?);
        }
        grid.push(out_row);
    }
    Some(grid)
}

/// Runs `code`'s `solver(input)` in an isolated child process group with a
/// hard timeout (§4.2). Cleanup (process-group kill, temp file removal) is
/// guaranteed on every exit path.
pub async fn run_untrusted_code(code: &str, input: &Grid, timeout: Duration) -> SandboxOutcome {
    let driver_file = match tempfile::Builder::new().suffix(".py").tempfile() {
        Ok(f) => f,
        Err(e) => {
            return SandboxOutcome::Crash {
                message: format!("failed to create driver temp file: {e}"),
            }
        }
    };
    if let Err(e) = std::fs::write(driver_file.path(), SANDBOX_DRIVER) {
        return SandboxOutcome::Crash {
            message: format!("failed to write driver temp file: {e}"),
        };
    }
    let driver_path = driver_file.path().to_path_buf();

    let payload = match serde_json::to_string(&SandboxPayload { code, input }) {
        Ok(p) => p,
        Err(e) => {
            return SandboxOutcome::Crash {
                message: format!("failed to serialize sandbox payload: {e}"),
            }
        }
    };

    let mut cmd = Command::new("python3");
    cmd.arg("-u")
        .arg(&driver_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // SAFETY: setsid() is async-signal-safe and this closure runs only in
    // the forked child before exec, per tokio::process::Command::pre_exec.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return SandboxOutcome::Crash {
                message: format!("failed to spawn sandbox process: {e}"),
            }
        }
    };
    let pid = child.id();

    let mut stdin = child.stdin.take().expect("piped stdin");
    let write_result = stdin.write_all(payload.as_bytes()).await;
    drop(stdin);
    if let Err(e) = write_result {
        warn!("failed writing sandbox payload to stdin: {e}");
    }

    let run = async {
        let status = child.wait().await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr).await;
        }
        Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    let outcome = match tokio::time::timeout(timeout, run).await {
        Ok(Ok((status, stdout, stderr))) => {
            if !status.success() {
                SandboxOutcome::Crash {
                    message: format!(
                        "subprocess crashed (exit {:?}): {}",
                        status.code(),
                        String::from_utf8_lossy(&stderr)
                    ),
                }
            } else if stdout.is_empty() {
                SandboxOutcome::Crash {
                    message: "empty output from subprocess".to_string(),
                }
            } else if let Ok(ok) = serde_json::from_slice::<SandboxOk>(&stdout) {
                SandboxOutcome::Success { output: ok.output }
            } else if let Ok(err) = serde_json::from_slice::<SandboxErr>(&stdout) {
                SandboxOutcome::Crash {
                    message: format!("{}: {}", err.error, err.traceback),
                }
            } else {
                SandboxOutcome::Crash {
                    message: format!(
                        "invalid JSON from subprocess: {}",
                        String::from_utf8_lossy(&stdout)
                    ),
                }
            }
        }
        Ok(Err(e)) => SandboxOutcome::Crash {
            message: format!("sandbox I/O error: {e}"),
        },
        Err(_) => {
            if let Some(pid) = pid {
                // SAFETY: killpg with a process-group id obtained from the
                // child we spawned with setsid(); a negative pid targets
                // the whole group.
                unsafe {
                    libc::killpg(pid as i32, libc::SIGKILL);
                }
            }
            let _ = child.kill().await;
            SandboxOutcome::Timeout
        }
    };

    let _ = std::fs::remove_file(&driver_path);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_as_grid_rejects_ragged_rows() {
        let value: Value = serde_json::from_str("[[1,2],[3]]").unwrap();
        assert!(output_as_grid(&value).is_none());
    }

    #[test]
    fn output_as_grid_accepts_rectangular_ints() {
        let value: Value = serde_json::from_str("[[1,2],[3,4]]").unwrap();
        assert_eq!(output_as_grid(&value).unwrap(), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn output_as_grid_rejects_empty() {
        let value: Value = serde_json::from_str("[]").unwrap();
        assert!(output_as_grid(&value).is_none());
    }

    #[tokio::test]
    async fn sandbox_timeout_kills_infinite_loop() {
        if which_python3_missing() {
            return;
        }
        let code = "def solver(g):\n    while True:\n        pass\n";
        let outcome = run_untrusted_code(code, &vec![vec![0]], Duration::from_millis(300)).await;
        assert!(matches!(outcome, SandboxOutcome::Timeout));
    }

    #[tokio::test]
    async fn sandbox_runs_identity_solver() {
        if which_python3_missing() {
            return;
        }
        let code = "def solver(g):\n    return g\n";
        let outcome = run_untrusted_code(code, &vec![vec![1, 2]], Duration::from_secs(5)).await;
        match outcome {
            SandboxOutcome::Success { output } => {
                assert_eq!(output_as_grid(&output).unwrap(), vec![vec![1, 2]]);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    fn which_python3_missing() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_err()
    }
}
