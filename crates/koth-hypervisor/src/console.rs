//! Console-exec protocol: run a command inside a container without SSH.
//!
//! The command is wrapped in a base64-encoded shell script that frames
//! its output with sentinel markers, piped through the hypervisor's
//! console proxy. The driver handles the terminal handshake, the login
//! dialogue, keep-alive frames, and parses stdout/stderr/exit code back
//! out of the raw console stream.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use tracing::{debug, trace};

use crate::client::ConsoleChannel;
use crate::error::{HvResult, HypervisorError};

const BEGIN_MARKER: &str = "__KOTH_BEGIN__";
const SPLIT_MARKER: &str = "__KOTH_SPLIT__";
const DONE_MARKER: &str = "__KOTH_DONE__";
const RC_MARKER: &str = "__KOTH_RC=";

/// Keep-alive cadence expected by the console proxy.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Timeouts applied to console commands.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleTimeouts {
    /// Budget for handshake + login.
    pub connect: Duration,
    /// Budget for the command itself.
    pub command: Duration,
}

impl Default for ConsoleTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(300),
        }
    }
}

/// Output of one in-guest command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Drive a full exec over an open console channel.
pub async fn run_console_command(
    channel: &mut dyn ConsoleChannel,
    term_user: &str,
    term_ticket: &str,
    login_user: &str,
    login_password: &str,
    command: &str,
) -> HvResult<ExecOutput> {
    run_console_command_with_timeouts(
        channel,
        term_user,
        term_ticket,
        login_user,
        login_password,
        command,
        ConsoleTimeouts::default(),
    )
    .await
}

/// Like [`run_console_command`] with explicit timeouts.
pub async fn run_console_command_with_timeouts(
    channel: &mut dyn ConsoleChannel,
    term_user: &str,
    term_ticket: &str,
    login_user: &str,
    login_password: &str,
    command: &str,
    timeouts: ConsoleTimeouts,
) -> HvResult<ExecOutput> {
    perform_handshake(channel, term_user, term_ticket, timeouts.connect).await?;
    ensure_console_login(channel, login_user, login_password, timeouts.connect).await?;
    execute_and_collect(channel, command, timeouts.command).await
}

/// Terminal handshake: `user:ticket`, expect `OK`, then a resize frame.
async fn perform_handshake(
    channel: &mut dyn ConsoleChannel,
    term_user: &str,
    term_ticket: &str,
    timeout: Duration,
) -> HvResult<()> {
    if term_user.is_empty() || term_ticket.is_empty() {
        return Err(HypervisorError::Console(
            "missing terminal user or ticket for handshake".to_string(),
        ));
    }

    channel
        .send(format!("{term_user}:{term_ticket}\n").as_bytes())
        .await?;

    let ack = recv_with_deadline(channel, Instant::now() + timeout).await?;
    let ack = String::from_utf8_lossy(&ack);
    if ack.trim() != "OK" {
        return Err(HypervisorError::Console(format!(
            "terminal handshake not acknowledged: {}",
            ack.trim()
        )));
    }

    // The console protocol expects an early resize frame.
    channel.send(b"1:32:120:").await?;
    Ok(())
}

/// Answer `login:` / `password:` prompts until a shell prompt appears.
async fn ensure_console_login(
    channel: &mut dyn ConsoleChannel,
    user: &str,
    password: &str,
    timeout: Duration,
) -> HvResult<()> {
    if user.is_empty() {
        return Err(HypervisorError::Console(
            "container login user is required".to_string(),
        ));
    }

    // Nudge the console to show a prompt.
    let _ = send_input(channel, "\n").await;

    let deadline = Instant::now() + timeout;
    let mut buffer = String::new();

    loop {
        let msg = recv_with_deadline(channel, deadline).await?;
        buffer.push_str(&strip_ansi(&String::from_utf8_lossy(&msg)));

        let lower = buffer.to_lowercase();
        if lower.contains("login incorrect") || lower.contains("authentication failure") {
            return Err(HypervisorError::ConsoleLogin(user.to_string()));
        }

        if lower.contains("login:") {
            buffer.clear();
            send_input(channel, &format!("{user}\n")).await?;
            continue;
        }

        if lower.contains("password:") {
            buffer.clear();
            send_input(channel, &format!("{password}\n")).await?;
            continue;
        }

        if has_shell_prompt(&buffer) {
            trace!("console login reached a shell prompt");
            return Ok(());
        }
    }
}

/// Send the wrapped command, read until the done marker, parse.
async fn execute_and_collect(
    channel: &mut dyn ConsoleChannel,
    command: &str,
    timeout: Duration,
) -> HvResult<ExecOutput> {
    let wrapped = wrap_command(command);
    send_input(channel, &wrapped).await?;

    let deadline = Instant::now() + timeout;
    let mut output = String::new();

    loop {
        let msg = recv_with_deadline(channel, deadline).await?;
        output.push_str(&String::from_utf8_lossy(&msg));

        if output.contains(DONE_MARKER) {
            break;
        }
    }

    parse_command_output(&output)
}

/// Receive one frame, sending keep-alives while the guest is quiet.
async fn recv_with_deadline(
    channel: &mut dyn ConsoleChannel,
    deadline: Instant,
) -> HvResult<Vec<u8>> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(HypervisorError::ConsoleTimeout);
        }

        let wait = KEEP_ALIVE_INTERVAL.min(deadline - now);
        let attempt = tokio::time::timeout(wait, channel.recv()).await;
        match attempt {
            Ok(result) => return result,
            Err(_) => {
                debug!("console quiet; sending keep-alive");
                channel.send(b"2").await?;
            }
        }
    }
}

/// Frame terminal input as the console proxy expects: `0:<len>:<data>`.
async fn send_input(channel: &mut dyn ConsoleChannel, data: &str) -> HvResult<()> {
    let mut frame = format!("0:{}:", data.len()).into_bytes();
    frame.extend_from_slice(data.as_bytes());
    channel.send(&frame).await
}

/// Wrap a command in the sentinel-framed runner script.
///
/// The command and the runner are both base64-encoded so neither shell
/// quoting nor terminal echo can corrupt them.
pub fn wrap_command(command: &str) -> String {
    let cmd_b64 = BASE64.encode(command.as_bytes());

    let runner = format!(
        "#!/bin/sh\n\
         cmd_b64='{cmd_b64}'\n\
         cmd=$(echo \"$cmd_b64\" | base64 -d)\n\
         printf '{BEGIN_MARKER}\\n'\n\
         {{ eval \"$cmd\"; }} 1>/tmp/koth_out 2>/tmp/koth_err\n\
         rc=$?\n\
         printf '{RC_MARKER}%s__\\n' \"$rc\"\n\
         cat /tmp/koth_out\n\
         printf '{SPLIT_MARKER}\\n'\n\
         cat /tmp/koth_err\n\
         printf '{DONE_MARKER}\\n'\n\
         rm -f /tmp/koth_out /tmp/koth_err\n"
    );
    let runner_b64 = BASE64.encode(runner.as_bytes());

    format!("wrap_b64='{runner_b64}'; printf '%s' \"$wrap_b64\" | base64 -d | sh\n")
}

/// Parse a raw console capture back into stdout/stderr/exit code.
pub fn parse_command_output(raw: &str) -> HvResult<ExecOutput> {
    let cleaned = strip_ansi(raw).replace('\r', "");

    let begin_idx = cleaned.rfind(BEGIN_MARKER);
    let done_idx = cleaned.rfind(DONE_MARKER);

    // No markers at all: return everything as stdout with rc 0. The
    // guest may lack base64; the caller sees the raw transcript.
    let (begin_idx, done_idx) = match (begin_idx, done_idx) {
        (None, None) => {
            return Ok(ExecOutput {
                stdout: cleaned.trim().to_string(),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        (None, Some(done)) => (0, done),
        (Some(begin), Some(done)) if done > begin => (begin + BEGIN_MARKER.len(), done),
        _ => return Err(HypervisorError::MarkersMissing),
    };

    let mut segment = &cleaned[begin_idx..done_idx];
    let mut exit_code: i32 = -1;

    if let Some(rc_idx) = segment.find(RC_MARKER) {
        let mut rc_section = &segment[rc_idx + RC_MARKER.len()..];
        if let Some(end) = rc_section.find("__") {
            if let Ok(parsed) = rc_section[..end].trim().parse::<i32>() {
                exit_code = parsed;
            }
            rc_section = &rc_section[end + 2..];
        }
        segment = match rc_section.find('\n') {
            Some(nl) => &rc_section[nl + 1..],
            None => rc_section,
        };
    }

    let output = match segment.find(SPLIT_MARKER) {
        Some(split_idx) => {
            let stdout = segment[..split_idx].strip_prefix('\n').unwrap_or(&segment[..split_idx]);
            let stderr_raw = &segment[split_idx + SPLIT_MARKER.len()..];
            let stderr = stderr_raw.strip_prefix('\n').unwrap_or(stderr_raw);
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code: if exit_code == -1 { 0 } else { exit_code },
            }
        }
        // Exit code but no split marker: treat the payload as stdout.
        None => ExecOutput {
            stdout: segment.strip_prefix('\n').unwrap_or(segment).to_string(),
            stderr: String::new(),
            exit_code: if exit_code == -1 { 0 } else { exit_code },
        },
    };

    Ok(output)
}

/// Strip ANSI escapes, OSC title sequences and control characters.
pub fn strip_ansi(s: &str) -> String {
    static CSI: OnceLock<Regex> = OnceLock::new();
    static OSC: OnceLock<Regex> = OnceLock::new();
    static MODE: OnceLock<Regex> = OnceLock::new();
    static CTRL: OnceLock<Regex> = OnceLock::new();

    let csi = CSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex"));
    let osc = OSC.get_or_init(|| Regex::new(r"\x1b\]0;[^\x07]*\x07").expect("static regex"));
    let mode = MODE.get_or_init(|| Regex::new(r"\x1b\[[>=][0-9;]*").expect("static regex"));
    let ctrl = CTRL.get_or_init(|| Regex::new(r"[\x00-\x09\x0b-\x1f\x7f]").expect("static regex"));

    let s = csi.replace_all(s, "");
    let s = osc.replace_all(&s, "");
    let s = mode.replace_all(&s, "");
    ctrl.replace_all(&s, "").into_owned()
}

/// Whether the last non-empty line looks like a shell prompt.
pub fn has_shell_prompt(s: &str) -> bool {
    strip_ansi(s)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .is_some_and(|line| line.ends_with('#') || line.ends_with('$'))
}
