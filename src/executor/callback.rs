//! Console output for a playbook run.

use colored::*;
use serde_yaml::Value;

use crate::executor::PlayRecap;
use crate::playbook::TaskResult;

const BANNER_WIDTH: usize = 79;

fn banner(title: &str) -> String {
    let stars = BANNER_WIDTH.saturating_sub(title.len() + 1).max(3);
    format!("{} {}", title, "*".repeat(stars))
}

pub fn play_banner(name: &str) {
    println!("\n{}", banner(&format!("PLAY [{}]", name)).bold());
}

pub fn task_banner(name: &str) {
    println!("\n{}", banner(&format!("TASK [{}]", name)).bold());
}

pub fn handler_banner(name: &str) {
    println!("\n{}", banner(&format!("RUNNING HANDLER [{}]", name)).bold());
}

pub fn no_hosts(pattern: &str) {
    println!("{}", format!("skipping: no hosts matched '{}'", pattern).cyan());
}

/// One line per host, plus one per loop item.
pub fn host_result(module: &str, result: &TaskResult, verbosity: u8) {
    for item in &result.item_results {
        println!("{}", status_line(item, describe_item(item.item.as_ref())));
    }
    println!("{}", status_line(result, String::new()));

    if result.is_fatal() || result.ignored {
        if !result.msg.is_empty() {
            println!("  {}", result.msg.red());
        }
    } else if module == "debug" {
        if let Some(data) = debug_output(result) {
            println!("{}", data);
        }
    }

    if verbosity > 0 && !result.skipped {
        if !result.stdout.trim().is_empty() {
            println!("{}", format!("  stdout: {}", result.stdout.trim_end()).dimmed());
        }
        if !result.stderr.trim().is_empty() {
            println!("{}", format!("  stderr: {}", result.stderr.trim_end()).dimmed());
        }
    }
}

fn describe_item(item: Option<&Value>) -> String {
    match item {
        Some(Value::String(s)) => format!(" => (item={})", s),
        Some(other) => format!(
            " => (item={})",
            serde_json::to_string(other).unwrap_or_else(|_| "?".to_string())
        ),
        None => String::new(),
    }
}

fn status_line(result: &TaskResult, suffix: String) -> String {
    let host = format!("[{}]", result.host);
    if result.is_fatal() {
        format!("{}: {}{}", "failed".red().bold(), host, suffix)
    } else if result.ignored {
        format!("{}: {}{} {}", "failed".red(), host, suffix, "...ignoring".cyan())
    } else if result.skipped {
        format!("{}: {}{}", "skipping".cyan(), host, suffix)
    } else if result.changed {
        format!("{}: {}{}", "changed".yellow(), host, suffix)
    } else {
        format!("{}: {}{}", "ok".green(), host, suffix)
    }
}

/// The data a `debug` task printed, as indented JSON.
fn debug_output(result: &TaskResult) -> Option<String> {
    if result.data.is_empty() {
        return None;
    }
    serde_json::to_string_pretty(&result.data)
        .ok()
        .map(|json| json.lines().map(|l| format!("  {}", l)).collect::<Vec<_>>().join("\n"))
}

pub fn recap(recap: &PlayRecap) {
    println!("\n{}", banner("PLAY RECAP").bold());
    for (host, stats) in &recap.hosts {
        let host = if stats.failed > 0 {
            host.red().to_string()
        } else if stats.changed > 0 {
            host.yellow().to_string()
        } else {
            host.green().to_string()
        };
        println!(
            "{:<30} : {}={:<4} {}={:<4} {}={:<4} {}={:<4} {}={:<4}",
            host,
            "ok".green(),
            stats.ok,
            "changed".yellow(),
            stats.changed,
            "failed".red(),
            stats.failed,
            "skipped".cyan(),
            stats.skipped,
            "ignored".dimmed(),
            stats.ignored,
        );
    }
    println!("{}", "----------".dimmed());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_width() {
        colored::control::set_override(false);
        let line = banner("TASK [x]");
        assert!(line.starts_with("TASK [x] ***"));
        assert_eq!(line.len(), BANNER_WIDTH);

        let long = banner(&"y".repeat(100));
        assert!(long.ends_with(" ***"));
    }

    #[test]
    fn test_status_lines() {
        colored::control::set_override(false);
        let mut result = TaskResult::new("localhost");
        assert_eq!(status_line(&result, String::new()), "ok: [localhost]");
        result.changed = true;
        assert_eq!(status_line(&result, String::new()), "changed: [localhost]");
        let item = Value::String("a".into());
        assert_eq!(
            status_line(&TaskResult::failure("localhost", "x"), describe_item(Some(&item))),
            "failed: [localhost] => (item=a)"
        );
    }

    #[test]
    fn test_debug_output_indents_json() {
        let mut result = TaskResult::new("localhost");
        assert!(debug_output(&result).is_none());
        result.data.insert(Value::String("msg".into()), Value::String("hi".into()));
        let out = debug_output(&result).unwrap();
        assert!(out.contains("  \"msg\": \"hi\""));
    }
}
