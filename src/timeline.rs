//! Scripted host input for headless runs.
//!
//! One event per line:
//!
//! ```text
//! at 0.5 key down space
//! at 1 click "Cat Sprite"
//! at 1.25 mouse -40 30
//! at 2 key up space
//! at 4 stop
//! ```

use crate::bus::normalize_key;
use crate::project::ProjectDoc;
use crate::world::EntityId;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineAction {
    KeyDown(String),
    KeyUp(String),
    Click(EntityId),
    /// Stage coordinates reported on the next mouse request.
    Mouse { x: f64, y: f64 },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub at: Duration,
    pub action: TimelineAction,
    pub line: usize,
}

pub fn load_timeline(path: &Path, project: &ProjectDoc) -> Result<Vec<TimelineEvent>> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read timeline '{}'.", path.display()))?;
    parse_timeline(&source, project)
        .with_context(|| format!("Invalid timeline '{}'.", path.display()))
}

/// Parses a timeline, resolving sprite names against `project`. Events come
/// back ordered by time; lines with equal times keep file order.
pub fn parse_timeline(source: &str, project: &ProjectDoc) -> Result<Vec<TimelineEvent>> {
    let at_re = Regex::new(r"^\s*at\s+(?P<secs>[0-9]+(?:\.[0-9]+)?)\s+(?P<rest>.+?)\s*$")?;
    let key_re = Regex::new(r"^key\s+(?P<dir>down|up)\s+(?P<key>.+)$")?;
    let click_re = Regex::new(r#"^click\s+(?P<name>"[^"]+"|\S+)$"#)?;
    let mouse_re = Regex::new(r"^mouse\s+(?P<x>-?[0-9]+(?:\.[0-9]+)?)\s+(?P<y>-?[0-9]+(?:\.[0-9]+)?)$")?;

    let mut events = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line);
        if line.trim().is_empty() {
            continue;
        }
        let Some(caps) = at_re.captures(line) else {
            bail!(
                "Expected 'at <seconds> <action>' at line {}, found '{}'.",
                line_no,
                line.trim()
            );
        };
        let secs: f64 = caps["secs"]
            .parse()
            .with_context(|| format!("Invalid time at line {}.", line_no))?;
        let at = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Time {} is out of range at line {}.", secs, line_no))?;
        let rest = &caps["rest"];
        let action = if let Some(caps) = key_re.captures(rest) {
            let key = normalize_key(caps["key"].trim());
            if &caps["dir"] == "down" {
                TimelineAction::KeyDown(key)
            } else {
                TimelineAction::KeyUp(key)
            }
        } else if let Some(caps) = click_re.captures(rest) {
            let name = unquote(&caps["name"]);
            match project.entity_index(&name) {
                Some(index) => TimelineAction::Click(EntityId(index)),
                None => bail!("Unknown sprite '{}' at line {}.", name, line_no),
            }
        } else if let Some(caps) = mouse_re.captures(rest) {
            TimelineAction::Mouse {
                x: caps["x"].parse().with_context(|| format!("Invalid x at line {}.", line_no))?,
                y: caps["y"].parse().with_context(|| format!("Invalid y at line {}.", line_no))?,
            }
        } else if rest == "stop" {
            TimelineAction::Stop
        } else {
            bail!("Unknown timeline action '{}' at line {}.", rest, line_no);
        };
        events.push(TimelineEvent {
            at,
            action,
            line: line_no,
        });
    }
    events.sort_by_key(|e| (e.at, e.line));
    Ok(events)
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::EntityDoc;

    fn project() -> ProjectDoc {
        ProjectDoc {
            entities: vec![
                EntityDoc::background("Stage"),
                EntityDoc::sprite("Cat Sprite"),
            ],
        }
    }

    #[test]
    fn parses_all_actions_in_time_order() {
        let source = r#"
# warm up
at 2 key up space
at 0.5 key down Space   # trailing comment
at 1 click "Cat Sprite"
at 1 mouse -40 30.5
at 3 stop
"#;
        let events = parse_timeline(source, &project()).unwrap();
        let actions = events.iter().map(|e| e.action.clone()).collect::<Vec<_>>();
        assert_eq!(
            actions,
            vec![
                TimelineAction::KeyDown("space".into()),
                TimelineAction::Click(EntityId(1)),
                TimelineAction::Mouse { x: -40.0, y: 30.5 },
                TimelineAction::KeyUp("space".into()),
                TimelineAction::Stop,
            ]
        );
        assert_eq!(events[0].at, Duration::from_millis(500));
    }

    #[test]
    fn unknown_sprite_reports_the_line() {
        let err = parse_timeline("at 1 click Dog", &project()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let err = parse_timeline("\nclick Cat", &project()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(parse_timeline("at 1 jump", &project()).is_err());
    }

    #[test]
    fn times_beyond_duration_range_are_rejected() {
        let source = "at 1 stop\nat 100000000000000000000000 stop";
        let err = parse_timeline(source, &project()).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
        let huge = format!("at {} stop", "9".repeat(400));
        assert!(parse_timeline(&huge, &project()).is_err());
    }
}
