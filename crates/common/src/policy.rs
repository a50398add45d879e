use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Treatment of symbolic links during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymlinkPolicy {
    /// Record the link target without following it.
    Store,
    /// Descend into the target as if it were a regular entry.
    Follow,
    /// Skip the link entirely.
    Ignore,
}

impl Default for SymlinkPolicy {
    fn default() -> Self {
        SymlinkPolicy::Store
    }
}

/// Treatment of hardlinked files during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardlinkPolicy {
    /// Back up every path, duplicating content records.
    All,
    /// Back up only the first path seen per inode.
    First,
    /// Skip any path whose inode has more than one link.
    None,
}

impl Default for HardlinkPolicy {
    fn default() -> Self {
        HardlinkPolicy::All
    }
}

/// Filesystem snapshot acquisition policy. Acquisition itself is an external
/// collaborator; the engine only records and honors the requested mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    Off,
    Auto,
    Required,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::Off
    }
}

/// Windows USN change-journal policy; the journal reader is external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsnPolicy {
    Off,
    Auto,
    Required,
}

impl Default for UsnPolicy {
    fn default() -> Self {
        UsnPolicy::Off
    }
}

/// Attribute-based exclusions applied by the pre-filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFilter {
    pub skip_hidden: bool,
    pub skip_system: bool,
    pub skip_temporary: bool,
}

impl AttributeFilter {
    /// Dotfile convention stands in for the hidden attribute on unix.
    pub fn excludes_name(&self, name: &str) -> bool {
        self.skip_hidden && name.starts_with('.')
    }
}

/// A single include or exclude rule matched against full source paths.
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub include: bool,
    pattern: glob::Pattern,
}

impl FilterRule {
    pub fn include(pattern: &str) -> Result<Self> {
        Self::new(true, pattern)
    }

    pub fn exclude(pattern: &str) -> Result<Self> {
        Self::new(false, pattern)
    }

    fn new(include: bool, pattern: &str) -> Result<Self> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|err| Error::user(format!("invalid filter pattern {pattern:?}: {err}")))?;
        Ok(Self { include, pattern })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches(path)
    }
}

/// First-match-wins evaluation; paths matching no rule are included.
pub fn path_is_included(rules: &[FilterRule], path: &str) -> bool {
    for rule in rules {
        if rule.matches(path) {
            return rule.include;
        }
    }
    true
}

/// One frame of a retention policy: within `window` back from now, keep one
/// version per `interval`. A `None` window means unlimited; a zero interval
/// keeps every version in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionFrame {
    pub window: Option<Duration>,
    pub interval: Duration,
}

/// Thinning schedule parsed from the `7D:1D,4W:1W,12M:1M,U:6M` notation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub frames: Vec<RetentionFrame>,
}

impl RetentionPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        let mut frames = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (window, interval) = part
                .split_once(':')
                .ok_or_else(|| Error::user(format!("retention frame {part:?} is missing ':'")))?;
            let window = if window.eq_ignore_ascii_case("U") {
                None
            } else {
                Some(parse_duration(window)?)
            };
            let interval = if interval.eq_ignore_ascii_case("U") {
                Duration::ZERO
            } else {
                parse_duration(interval)?
            };
            frames.push(RetentionFrame { window, interval });
        }
        if frames.is_empty() {
            return Err(Error::user(format!("empty retention policy {s:?}")));
        }
        // Narrowest window first so each version is judged by the tightest
        // applicable frame.
        frames.sort_by_key(|frame| frame.window.unwrap_or(Duration::MAX));
        Ok(Self { frames })
    }

    /// Given fileset timestamps sorted descending, return those to drop.
    ///
    /// The newest version is always kept. A version inside a frame's window
    /// is kept only when at least `interval` separates it from the previous
    /// kept version; versions older than every window are dropped.
    pub fn versions_to_delete(&self, now: i64, timestamps: &[i64]) -> Vec<i64> {
        let mut doomed = Vec::new();
        let mut last_kept: Option<i64> = None;

        for (index, &ts) in timestamps.iter().enumerate() {
            if index == 0 {
                last_kept = Some(ts);
                continue;
            }
            let age = Duration::from_secs((now - ts).max(0) as u64);
            let frame = self
                .frames
                .iter()
                .find(|frame| frame.window.map(|w| age <= w).unwrap_or(true));
            match frame {
                None => doomed.push(ts),
                Some(frame) => {
                    let keep = match last_kept {
                        None => true,
                        Some(prev) => {
                            let gap = Duration::from_secs((prev - ts).max(0) as u64);
                            frame.interval.is_zero() || gap >= frame.interval
                        }
                    };
                    if keep {
                        last_kept = Some(ts);
                    } else {
                        doomed.push(ts);
                    }
                }
            }
        }
        doomed
    }
}

/// Parse `30s`, `10m`, `2h`, `7D`, `4W`, `12M`, `1Y` into a duration.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.len().saturating_sub(1);
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| Error::user(format!("unparsable duration {s:?}")))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "D" | "d" => value * 86_400,
        "W" | "w" => value * 7 * 86_400,
        "M" => value * 30 * 86_400,
        "Y" | "y" => value * 365 * 86_400,
        _ => return Err(Error::user(format!("unknown duration unit in {s:?}"))),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7D").unwrap(), Duration::from_secs(7 * 86_400));
        assert!(parse_duration("7q").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_retention_policy_parse() {
        let policy = RetentionPolicy::parse("4W:1W,7D:1D,U:6M").unwrap();
        assert_eq!(policy.frames.len(), 3);
        // Sorted narrowest first.
        assert_eq!(policy.frames[0].window, Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(policy.frames[2].window, None);
    }

    #[test]
    fn test_retention_keeps_newest_and_thins() {
        let policy = RetentionPolicy::parse("10D:2D").unwrap();
        let day = 86_400i64;
        let now = 100 * day;
        // Daily versions over the last five days, newest first.
        let timestamps: Vec<i64> = (0..5).map(|i| now - i * day).collect();
        let doomed = policy.versions_to_delete(now, &timestamps);
        // Newest kept, then every second day.
        assert_eq!(doomed, vec![now - day, now - 3 * day]);
    }

    #[test]
    fn test_retention_drops_outside_all_windows() {
        let policy = RetentionPolicy::parse("1D:U").unwrap();
        let now = 10 * 86_400i64;
        let doomed = policy.versions_to_delete(now, &[now, now - 5 * 86_400]);
        assert_eq!(doomed, vec![now - 5 * 86_400]);
    }

    #[test]
    fn test_filter_rules_first_match_wins() {
        let rules = vec![
            FilterRule::include("*/keep/*").unwrap(),
            FilterRule::exclude("*.tmp").unwrap(),
        ];
        assert!(path_is_included(&rules, "/src/keep/a.tmp"));
        assert!(!path_is_included(&rules, "/src/b.tmp"));
        assert!(path_is_included(&rules, "/src/c.rs"));
    }
}
