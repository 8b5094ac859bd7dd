//! Task backtraces, read from `/proc/self/task`.
//!
//! Only the capturing thread can walk its own user-space stack without
//! stopping the process. For every other task the report lists what the
//! kernel exposes: the name, the scheduler state, the wait channel and,
//! where permissions allow, the kernel stack.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskInfo {
    pub(crate) tid: u32,
    pub(crate) name: String,
    pub(crate) state: char,
    pub(crate) wchan: Option<String>,
    pub(crate) kernel_stack: Option<String>,
}

/// Parses the state letter out of `/proc/<pid>/task/<tid>/stat`. The name
/// field may contain spaces and parentheses, so look after the last ')'.
pub(crate) fn parse_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

fn read_trimmed(path: &Path) -> Option<String> {
    let s = fs::read_to_string(path).ok()?;
    let s = s.trim();
    if s.is_empty() || s == "0" {
        None
    } else {
        Some(s.to_string())
    }
}

fn read_task(dir: &Path, tid: u32) -> TaskInfo {
    let name = read_trimmed(&dir.join("comm")).unwrap_or_else(|| "?".to_string());
    let state = fs::read_to_string(dir.join("stat"))
        .ok()
        .and_then(|stat| parse_stat_state(&stat))
        .unwrap_or('?');
    TaskInfo {
        tid,
        name,
        state,
        wchan: read_trimmed(&dir.join("wchan")),
        kernel_stack: read_trimmed(&dir.join("stack")),
    }
}

fn list_tasks(task_dir: &Path) -> Result<Vec<TaskInfo>> {
    let entries = fs::read_dir(task_dir).map_err(CaptureError::io(task_dir))?;
    let mut tasks: Vec<TaskInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let tid = entry.file_name().to_str()?.parse().ok()?;
            Some(read_task(&entry.path(), tid))
        })
        .collect();
    tasks.sort_by_key(|t| t.tid);
    Ok(tasks)
}

fn current_tid() -> Option<u32> {
    let link = fs::read_link("/proc/thread-self").ok()?;
    link.file_name()?.to_str()?.parse().ok()
}

pub(crate) fn render_report(
    pid: u32,
    captured_at: u64,
    tasks: &[TaskInfo],
    current: Option<(u32, &str)>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task backtraces of process {pid} at {captured_at} (unix seconds)");
    let _ = writeln!(out, "{} tasks", tasks.len());
    for task in tasks {
        let _ = writeln!(out);
        let _ = write!(out, "Task {} \"{}\" state {}", task.tid, task.name, task.state);
        if let Some(wchan) = &task.wchan {
            let _ = write!(out, ", waiting in {wchan}");
        }
        let _ = writeln!(out);
        match current {
            Some((tid, backtrace)) if tid == task.tid => {
                let _ = writeln!(out, "  (capturing task)");
                for line in backtrace.lines() {
                    let _ = writeln!(out, "  {line}");
                }
            }
            _ => {
                if let Some(stack) = &task.kernel_stack {
                    for line in stack.lines() {
                        let _ = writeln!(out, "  {line}");
                    }
                }
            }
        }
    }
    out
}

/// Writes the backtrace report for every task of this process to `path`.
pub fn write_task_backtraces(path: &Path) -> Result<()> {
    let tasks = list_tasks(Path::new("/proc/self/task"))?;
    let backtrace = format!("{:?}", backtrace::Backtrace::new());
    let current = current_tid().map(|tid| (tid, backtrace.as_str()));
    let captured_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let report = render_report(std::process::id(), captured_at, &tasks, current);
    log::debug!("Captured backtraces of {} tasks", tasks.len());
    fs::write(path, report).map_err(CaptureError::io(path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stat_state_with_odd_names() {
        assert_eq!(parse_stat_state("1234 (tokio-runtime-w) S 1 2 3"), Some('S'));
        assert_eq!(parse_stat_state("99 (a) b) (c) R 1"), Some('R'));
        assert_eq!(parse_stat_state("garbage"), None);
    }

    #[test]
    fn report_marks_the_capturing_task() {
        let tasks = vec![
            TaskInfo {
                tid: 10,
                name: "main".into(),
                state: 'S',
                wchan: Some("futex_wait_queue".into()),
                kernel_stack: None,
            },
            TaskInfo {
                tid: 11,
                name: "worker".into(),
                state: 'R',
                wchan: None,
                kernel_stack: None,
            },
        ];
        let report = render_report(10, 0, &tasks, Some((11, "frame one\nframe two")));
        assert!(report.contains("2 tasks"));
        assert!(report.contains("Task 10 \"main\" state S, waiting in futex_wait_queue"));
        assert!(report.contains("(capturing task)\n  frame one\n  frame two"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn writes_a_report_for_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.txt");
        write_task_backtraces(&path).unwrap();
        let report = std::fs::read_to_string(&path).unwrap();
        assert!(report.starts_with(&format!(
            "Task backtraces of process {}",
            std::process::id()
        )));
        assert!(report.contains("(capturing task)"));
    }
}
