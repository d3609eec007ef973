use chrono::{DateTime, Local, Utc};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

use crate::models::{Snapshot, Status};

const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CLEAR: &str = "\x1b[H\x1b[J";

const LABEL_WIDTH: usize = 20;
const STATUS_WIDTH: usize = 10;

/// Redraw the dashboard whenever a new snapshot is published. Exits when
/// the engine side of the channel is dropped.
pub async fn run(mut snapshots: watch::Receiver<Arc<Snapshot>>) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        let frame = render(&snapshot);
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(frame.as_bytes());
        let _ = stdout.flush();
    }
}

fn render(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    out.push_str(CLEAR);
    out.push_str(&format!(
        "{BOLD}multiping{RESET} - {}\n\n",
        snapshot.generated_at.with_timezone(&Local).format("%c")
    ));
    for host in &snapshot.hosts {
        out.push_str(&format!(
            "{BOLD}{:<width$}{RESET} ({})\n",
            host.description,
            host.addr,
            width = LABEL_WIDTH
        ));
        for test in &host.tests {
            let status = match test.status {
                Some(Status::Down) => format!("{BOLD}{RED}DOWN{RESET}"),
                Some(_) => format!("{:.1}ms", test.latency_ms.unwrap_or(0.0)),
                None => "...".to_string(),
            };
            out.push_str(&format!(
                "    {:<width$} {}   {}  {}\n",
                test.label,
                pad_left(&status, STATUS_WIDTH),
                history_strip(&test.history),
                last_seen(test.status, test.last_up),
                width = LABEL_WIDTH
            ));
        }
        out.push('\n');
    }
    out
}

/// History strip, oldest on the left: green `.` up, yellow `o` slow, red
/// `X` down, blank for cycles not yet observed.
fn history_strip(history: &[Option<Status>]) -> String {
    history
        .iter()
        .map(|slot| match slot {
            Some(Status::Up) => format!("{GREEN}.{RESET}"),
            Some(Status::Slow) => format!("{BOLD}{YELLOW}o{RESET}"),
            Some(Status::Down) => format!("{RED}X{RESET}"),
            None => " ".to_string(),
        })
        .collect()
}

fn last_seen(status: Option<Status>, last_up: Option<DateTime<Utc>>) -> String {
    match (status, last_up) {
        (Some(Status::Down), Some(seen)) => {
            format!("Last seen: {}", seen.with_timezone(&Local).format("%c"))
        }
        (Some(Status::Down), None) => "Last seen: never".to_string(),
        _ => String::new(),
    }
}

/// Right-align within `width`, counting visible characters only so colored
/// and plain statuses line up.
fn pad_left(s: &str, width: usize) -> String {
    let visible = visible_len(s);
    if visible >= width {
        s.to_string()
    } else {
        format!("{}{s}", " ".repeat(width - visible))
    }
}

/// Length of a string with ANSI CSI escape sequences stripped.
fn visible_len(s: &str) -> usize {
    let mut len = 0;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip "[" and parameter bytes up to the final byte (@ to ~).
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) && c != '[' {
                    break;
                }
            }
        } else {
            len += 1;
        }
    }
    len
}
