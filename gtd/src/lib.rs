//! Getting-Things-Done workflow layer over plain-text org outlines.
//! The `document` module is the only place that knows the text layout; every
//! workflow command edits files through it, so a file stays well-formed after
//! each mutation.

pub mod core {
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf, str::FromStr};

    /* ------------------------------ Status ------------------------------ */

    /// Workflow stage keyword carried by a heading (`* NEXT Call Bob`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Status {
        Todo,
        Next,
        Waiting,
        Someday,
        Done,
        Cancelled,
    }

    impl Status {
        pub const ALL: [Status; 6] = [
            Status::Todo,
            Status::Next,
            Status::Waiting,
            Status::Someday,
            Status::Done,
            Status::Cancelled,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                Status::Todo => "TODO",
                Status::Next => "NEXT",
                Status::Waiting => "WAITING",
                Status::Someday => "SOMEDAY",
                Status::Done => "DONE",
                Status::Cancelled => "CANCELLED",
            }
        }

        /// Exact keyword match as written in a heading. Anything else is "no status".
        pub fn parse(word: &str) -> Option<Self> {
            Self::ALL.into_iter().find(|status| status.as_str() == word)
        }

        /// Completed or cancelled.
        pub fn is_done(self) -> bool {
            matches!(self, Status::Done | Status::Cancelled)
        }

        pub fn is_actionable(self) -> bool {
            matches!(self, Status::Todo | Status::Next | Status::Waiting)
        }
    }

    impl fmt::Display for Status {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for Status {
        type Err = GtdError;

        /// Case-insensitive, for command-line input.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let upper = s.trim().to_ascii_uppercase();
            match upper.as_str() {
                "CANCELED" => Ok(Status::Cancelled),
                other => Status::parse(other).ok_or_else(|| GtdError::UnknownStatus(s.to_string())),
            }
        }
    }

    /* ------------------------------- Tags ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Tag added to headings converted into projects.
    pub const PROJECT_TAG: &str = "PROJECT";

    /// Property names the workflow reads and writes. Adapter ids are opaque values.
    pub mod props {
        pub const STATUS: &str = "STATUS";
        pub const TASK_ID: &str = "TASK_ID";
        pub const CREATED: &str = "CREATED";
        pub const CLOSED: &str = "CLOSED";
        pub const ARCHIVE_TIME: &str = "ARCHIVE_TIME";
        pub const ARCHIVE_FILE: &str = "ARCHIVE_FILE";
        pub const NOTE_ID: &str = "NOTE_ID";
        pub const CALENDAR_EVENT_ID: &str = "CALENDAR_EVENT_ID";
        pub const REMINDER_ID: &str = "REMINDER_ID";
    }

    /* ------------------------------ Errors ------------------------------ */

    /// Field of a task a mutation can write; used to report which write failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Field {
        Status,
        Property,
        Scheduled,
        Deadline,
        IdentifierLink,
        Note,
        Tag,
    }

    impl fmt::Display for Field {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Field::Status => "status",
                Field::Property => "property",
                Field::Scheduled => "SCHEDULED",
                Field::Deadline => "DEADLINE",
                Field::IdentifierLink => "identifier link",
                Field::Note => "note",
                Field::Tag => "tag",
            };
            f.write_str(name)
        }
    }

    /// Domain failures. Line numbers are 1-based, as shown to the user.
    #[derive(Debug, thiserror::Error)]
    pub enum GtdError {
        #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
        InvalidDate(String),
        #[error("invalid time {0:?} (expected HH:MM, 24-hour)")]
        InvalidTime(String),
        #[error("unknown status keyword {0:?}")]
        UnknownStatus(String),
        #[error("title must not be empty")]
        EmptyTitle,
        #[error("note text must not be empty")]
        EmptyNote,
        #[error("no heading found at or above line {line}")]
        HeadingNotFound { line: usize },
        #[error("no heading matches {0:?}")]
        NoMatch(String),
        #[error("property drawer opened at line {line} has no :END: line")]
        UnterminatedDrawer { line: usize },
        #[error("{field} not written: {source}")]
        FieldFailed {
            field: Field,
            #[source]
            source: Box<GtdError>,
        },
        #[error("{} already exists", .0.display())]
        TargetExists(PathBuf),
        #[error("note linking is disabled (set notes_dir in the configuration)")]
        NotesDisabled,
    }

    impl GtdError {
        /// Attribute this error to `field`, keeping an existing attribution.
        pub fn in_field(self, field: Field) -> Self {
            match self {
                GtdError::FieldFailed { .. } => self,
                other => GtdError::FieldFailed {
                    field,
                    source: Box::new(other),
                },
            }
        }
    }

    /// Lowercase ASCII slug for file names: `Plan Q3 offsite!` -> `plan-q3-offsite`.
    pub fn slugify(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut pending_dash = false;
        for ch in text.chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_dash && !out.is_empty() {
                    out.push('-');
                }
                pending_dash = false;
                out.push(ch.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
            if out.len() >= 48 {
                break;
            }
        }
        out.trim_end_matches('-').to_string()
    }

}

pub mod config {
    //! Static configuration, constructed once at startup and passed by reference.
    //!
    //! Read from `.gtd/config.toml` (nearest ancestor of the working directory)
    //! unless an explicit path is given.

    use crate::core::Status;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const CONFIG_DIR: &str = ".gtd";
    pub const CONFIG_FILE: &str = "config.toml";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// Directory tree holding the outline files.
        pub root_dir: PathBuf,
        /// Inbox file name, relative to `root_dir`.
        pub inbox_file: String,
        /// Directory of project files, relative to `root_dir`.
        pub projects_dir: String,
        /// Directory of area files, relative to `root_dir`.
        pub areas_dir: String,
        /// Archive file name, relative to `root_dir`.
        pub archive_file: String,
        /// Where linked notes are written; note linking is off when unset.
        pub notes_dir: Option<PathBuf>,
        /// Days past a date before it counts as overdue.
        pub grace_days: i64,
        /// Status assigned by clarify when none is given.
        pub default_status: Status,
        pub sync: SyncConfig,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                root_dir: PathBuf::from("."),
                inbox_file: "inbox.org".into(),
                projects_dir: "projects".into(),
                areas_dir: "areas".into(),
                archive_file: "archive.org".into(),
                notes_dir: None,
                grace_days: 0,
                default_status: Status::Next,
                sync: SyncConfig::default(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SyncConfig {
        pub calendar: AdapterConfig,
        pub reminders: AdapterConfig,
    }

    /// One external store: which calendar / reminder list, and how long to wait on it.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AdapterConfig {
        pub enabled: bool,
        /// Calendar name or reminder list name.
        pub target: String,
        pub timeout_secs: u64,
    }

    impl Default for AdapterConfig {
        fn default() -> Self {
            Self {
                enabled: false,
                target: "GTD".into(),
                timeout_secs: 20,
            }
        }
    }

    impl Config {
        pub fn from_toml(text: &str) -> Result<Self> {
            toml::from_str(text).context("parsing configuration")
        }

        /// Load from `explicit`, else the nearest `.gtd/config.toml`, else defaults.
        pub fn load(explicit: Option<&Path>) -> Result<Self> {
            let path = match explicit {
                Some(path) => Some(path.to_path_buf()),
                None => {
                    let cwd = std::env::current_dir().context("reading working directory")?;
                    Self::find_config_path(&cwd)
                }
            };
            let Some(path) = path else {
                debug!("no configuration file found; using defaults");
                return Ok(Self::default());
            };
            let text =
                fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            let mut config =
                Self::from_toml(&text).with_context(|| format!("in {:?}", path))?;
            if config.root_dir.is_relative() {
                // Relative roots are anchored where `.gtd/` lives, not at the cwd.
                let parent = path.parent().unwrap_or(Path::new("."));
                let base = if parent.file_name().is_some_and(|name| name == CONFIG_DIR) {
                    parent.parent().unwrap_or(parent)
                } else {
                    parent
                };
                config.root_dir = base.join(&config.root_dir);
            }
            debug!(path = %path.display(), root = %config.root_dir.display(), "loaded configuration");
            Ok(config)
        }

        /// Walk up from `start` looking for `.gtd/config.toml`.
        pub fn find_config_path(start: &Path) -> Option<PathBuf> {
            let mut dir = start;
            loop {
                let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILE);
                if candidate.is_file() {
                    return Some(candidate);
                }
                dir = dir.parent()?;
            }
        }

        pub fn with_root(mut self, root: PathBuf) -> Self {
            self.root_dir = root;
            self
        }

        pub fn inbox_path(&self) -> PathBuf {
            self.root_dir.join(&self.inbox_file)
        }

        pub fn archive_path(&self) -> PathBuf {
            self.root_dir.join(&self.archive_file)
        }

        pub fn projects_path(&self) -> PathBuf {
            self.root_dir.join(&self.projects_dir)
        }

        pub fn areas_path(&self) -> PathBuf {
            self.root_dir.join(&self.areas_dir)
        }
    }

}

pub mod timestamp {
    //! Date stamps in the one grammar the outline files use:
    //! `<YYYY-MM-DD Wkd>` or `<YYYY-MM-DD Wkd HH:MM>`, plus `[...]` for inactive stamps.
    //!
    //! Day arithmetic works on proleptic Gregorian day numbers only, never on
    //! wall-clock instants, so daylight-saving shifts cannot move a date.

    use crate::core::GtdError;
    use chrono::{Datelike, Local, NaiveDate, NaiveTime, Timelike, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_till, take_while_m_n, take_while1},
        character::complete::{char, space1},
        combinator::{all_consuming, map_res, opt, recognize},
        sequence::preceded,
    };
    use serde::{Deserialize, Serialize};
    use std::fmt;

    type PResult<'a, T> = IResult<&'a str, T>;

    /// A calendar date with an optional clock time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Timestamp {
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        /// `<...>` when true, `[...]` otherwise.
        pub active: bool,
    }

    impl Timestamp {
        pub fn on(date: NaiveDate) -> Self {
            Self {
                date,
                time: None,
                active: true,
            }
        }

        pub fn at(mut self, time: NaiveTime) -> Self {
            self.time = Some(time);
            self
        }

        pub fn inactive(mut self) -> Self {
            self.active = false;
            self
        }

        /// Parse user input: `YYYY-MM-DD` or `YYYY-MM-DD HH:MM`.
        pub fn parse_input(text: &str) -> Result<Self, GtdError> {
            let text = text.trim();
            let (date_part, time_part) = match text.split_once(char::is_whitespace) {
                Some((date, time)) => (date, Some(time.trim())),
                None => (text, None),
            };
            let date =
                parse_date(date_part).ok_or_else(|| GtdError::InvalidDate(date_part.to_string()))?;
            let time = match time_part {
                Some(time) => {
                    Some(parse_time(time).ok_or_else(|| GtdError::InvalidTime(time.to_string()))?)
                }
                None => None,
            };
            Ok(Self {
                date,
                time,
                active: true,
            })
        }

        /// Parse a rendered stamp (`<2025-01-05 Sun>`, `[2025-01-05 Sun 09:30]`).
        /// The weekday token is not checked here; see [`is_valid_org_timestamp`].
        pub fn parse(raw: &str) -> Option<Self> {
            let (_, parsed) = all_consuming(stamp)(raw.trim()).ok()?;
            parsed.resolve()
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            write!(
                f,
                "{open}{} {}",
                self.date.format("%Y-%m-%d"),
                weekday_of(self.date)
            )?;
            if let Some(time) = self.time {
                write!(f, " {}", time.format("%H:%M"))?;
            }
            write!(f, "{close}")
        }
    }

    /* ------------------------------ Parsing ------------------------------ */

    /// Strict `YYYY-MM-DD`; `None` for malformed text or dates that do not exist.
    pub fn parse_date(text: &str) -> Option<NaiveDate> {
        let (_, (year, month, day)) = all_consuming(date_fields)(text).ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    /// Strict `HH:MM`, 24-hour.
    pub fn parse_time(text: &str) -> Option<NaiveTime> {
        if text.len() != 5 {
            return None;
        }
        let (_, (hour, minute)) = all_consuming(time_fields)(text).ok()?;
        NaiveTime::from_hms_opt(hour, minute, 0)
    }

    pub fn weekday_of(date: NaiveDate) -> &'static str {
        match date.weekday() {
            Weekday::Mon => "Mon",
            Weekday::Tue => "Tue",
            Weekday::Wed => "Wed",
            Weekday::Thu => "Thu",
            Weekday::Fri => "Fri",
            Weekday::Sat => "Sat",
            Weekday::Sun => "Sun",
        }
    }

    /// Render `date` (and `time`) as an active stamp.
    pub fn format_timestamp(date: &str, time: Option<&str>) -> Result<String, GtdError> {
        let date = parse_date(date).ok_or_else(|| GtdError::InvalidDate(date.to_string()))?;
        let mut stamp = Timestamp::on(date);
        if let Some(time) = time {
            stamp = stamp.at(parse_time(time).ok_or_else(|| GtdError::InvalidTime(time.to_string()))?);
        }
        Ok(stamp.to_string())
    }

    /// Date of the first active stamp anywhere in `text`. `None` when there is no
    /// stamp or its date portion is not a real date.
    pub fn parse_timestamp(text: &str) -> Option<NaiveDate> {
        let (year, month, day) = first_stamp(text, true)?.ymd;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    /// Like [`parse_timestamp`] but keeps the time of day.
    pub fn find_timestamp(text: &str) -> Option<Timestamp> {
        first_stamp(text, true)?.resolve()
    }

    /// True when `text` is exactly one rendered active stamp whose weekday token
    /// matches its date.
    pub fn is_valid_org_timestamp(text: &str) -> bool {
        let Ok((_, raw)) = all_consuming(stamp)(text.trim()) else {
            return false;
        };
        if !raw.active || !raw.tail.trim().is_empty() {
            return false;
        }
        let Some(resolved) = raw.resolve() else {
            return false;
        };
        raw.weekday
            .is_some_and(|token| token.eq_ignore_ascii_case(weekday_of(resolved.date)))
    }

    /// Recognize one stamp at the start of `i` and return its raw text.
    pub(crate) fn stamp_text(i: &str) -> PResult<'_, &str> {
        recognize(stamp)(i)
    }

    struct RawStamp<'a> {
        active: bool,
        ymd: (i32, u32, u32),
        weekday: Option<&'a str>,
        hm: Option<(u32, u32)>,
        /// Repeaters, ranges and anything else before the closing bracket.
        tail: &'a str,
    }

    impl RawStamp<'_> {
        fn resolve(&self) -> Option<Timestamp> {
            let (year, month, day) = self.ymd;
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            let time = match self.hm {
                Some((hour, minute)) => Some(NaiveTime::from_hms_opt(hour, minute, 0)?),
                None => None,
            };
            Some(Timestamp {
                date,
                time,
                active: self.active,
            })
        }
    }

    fn first_stamp(text: &str, active_only: bool) -> Option<RawStamp<'_>> {
        text.char_indices()
            .filter(|(_, c)| *c == '<' || (!active_only && *c == '['))
            .find_map(|(idx, _)| stamp(&text[idx..]).ok().map(|(_, raw)| raw))
    }

    fn stamp(i: &str) -> PResult<'_, RawStamp<'_>> {
        let (i, open) = alt((char('<'), char('[')))(i)?;
        let (i, ymd) = date_fields(i)?;
        let (i, weekday) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        let (i, hm) = opt(preceded(space1, time_fields))(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, tail) =
            take_till(|c: char| c == close || c == '\n' || c == '<' || c == '[')(i)?;
        let (i, _) = char(close)(i)?;
        Ok((
            i,
            RawStamp {
                active: open == '<',
                ymd,
                weekday,
                hm,
                tail,
            },
        ))
    }

    fn digits<'a>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(min, max, |c: char| c.is_ascii_digit())
    }

    fn date_fields(i: &str) -> PResult<'_, (i32, u32, u32)> {
        let (i, year) = map_res(digits(4, 4), |s: &str| s.parse::<i32>())(i)?;
        let (i, _) = char('-')(i)?;
        let (i, month) = map_res(digits(2, 2), |s: &str| s.parse::<u32>())(i)?;
        let (i, _) = char('-')(i)?;
        let (i, day) = map_res(digits(2, 2), |s: &str| s.parse::<u32>())(i)?;
        Ok((i, (year, month, day)))
    }

    fn time_fields(i: &str) -> PResult<'_, (u32, u32)> {
        let (i, hour) = map_res(digits(1, 2), |s: &str| s.parse::<u32>())(i)?;
        let (i, _) = char(':')(i)?;
        let (i, minute) = map_res(digits(2, 2), |s: &str| s.parse::<u32>())(i)?;
        Ok((i, (hour, minute)))
    }

    /* ---------------------------- Day arithmetic ---------------------------- */

    /// Signed day count, positive when `b` is after `a`.
    pub fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
        i64::from(b.num_days_from_ce()) - i64::from(a.num_days_from_ce())
    }

    pub fn is_overdue(date: NaiveDate, grace_days: i64, today: NaiveDate) -> bool {
        days_between(date, today) > grace_days
    }

    /// The local calendar date; the only clock read used for date classification.
    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    /// `[YYYY-MM-DD Wkd HH:MM]` for the current local minute.
    pub fn inactive_now() -> String {
        let now = Local::now().naive_local();
        let mut stamp = Timestamp::on(now.date()).inactive();
        if let Some(time) = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0) {
            stamp = stamp.at(time);
        }
        stamp.to_string()
    }

    /// How pressing a task's dates are, most urgent first.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Urgency {
        OverdueDeadline,
        DeadlineToday,
        DeadlineThisWeek,
        OverdueScheduled,
        ScheduledToday,
        None,
    }

    impl Urgency {
        pub fn classify(
            scheduled: Option<NaiveDate>,
            deadline: Option<NaiveDate>,
            today: NaiveDate,
            grace_days: i64,
        ) -> Self {
            if let Some(deadline) = deadline {
                if is_overdue(deadline, grace_days, today) {
                    return Urgency::OverdueDeadline;
                }
                let days_left = days_between(today, deadline);
                if days_left <= 0 {
                    return Urgency::DeadlineToday;
                }
                if days_left <= 7 {
                    return Urgency::DeadlineThisWeek;
                }
            }
            if let Some(scheduled) = scheduled {
                if is_overdue(scheduled, grace_days, today) {
                    return Urgency::OverdueScheduled;
                }
                if days_between(today, scheduled) <= 0 {
                    return Urgency::ScheduledToday;
                }
            }
            Urgency::None
        }

        /// Adjustment applied to a status rank; lower sorts first.
        pub fn delta(self) -> i32 {
            match self {
                Urgency::OverdueDeadline => -25,
                Urgency::DeadlineToday => -20,
                Urgency::DeadlineThisWeek => -15,
                Urgency::OverdueScheduled => -10,
                Urgency::ScheduledToday => -5,
                Urgency::None => 0,
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                Urgency::OverdueDeadline => "overdue",
                Urgency::DeadlineToday => "due today",
                Urgency::DeadlineThisWeek => "due soon",
                Urgency::OverdueScheduled => "late",
                Urgency::ScheduledToday => "today",
                Urgency::None => "",
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::Duration;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        #[test]
        fn parse_date_respects_calendar() {
            assert_eq!(parse_date("2024-02-29"), Some(ymd(2024, 2, 29)));
            assert_eq!(parse_date("2023-02-29"), None);
            assert_eq!(parse_date("1900-02-29"), None);
            assert_eq!(parse_date("2000-02-29"), Some(ymd(2000, 2, 29)));
            assert_eq!(parse_date("2025-13-01"), None);
            assert_eq!(parse_date("2025-04-31"), None);
            assert_eq!(parse_date("2025-4-03"), None);
            assert_eq!(parse_date("2025-04-03 "), None);
            assert_eq!(parse_date("tomorrow"), None);
            assert_eq!(parse_date(""), None);
        }

        #[test]
        fn parse_time_is_strict() {
            assert!(parse_time("09:30").is_some());
            assert!(parse_time("23:59").is_some());
            assert!(parse_time("24:00").is_none());
            assert!(parse_time("12:60").is_none());
            assert!(parse_time("9:30").is_none());
            assert!(parse_time("0930").is_none());
        }

        #[test]
        fn formats_with_weekday_and_time() {
            assert_eq!(
                format_timestamp("2025-01-01", None).expect("date"),
                "<2025-01-01 Wed>"
            );
            assert_eq!(
                format_timestamp("2025-01-05", Some("14:05")).expect("date+time"),
                "<2025-01-05 Sun 14:05>"
            );
            assert!(matches!(
                format_timestamp("2025-02-30", None),
                Err(GtdError::InvalidDate(_))
            ));
            assert!(matches!(
                format_timestamp("2025-02-03", Some("7pm")),
                Err(GtdError::InvalidTime(_))
            ));
        }

        #[test]
        fn render_then_parse_round_trips_and_validates() {
            let start = ymd(2023, 12, 20);
            for offset in 0..800 {
                let date = start + Duration::days(offset);
                let text = date.format("%Y-%m-%d").to_string();
                let rendered = format_timestamp(&text, None).expect("render");
                assert_eq!(parse_timestamp(&rendered), Some(date), "{rendered}");
                assert!(is_valid_org_timestamp(&rendered), "{rendered}");
                assert!(rendered.contains(weekday_of(date)));
            }
        }

        #[test]
        fn parse_timestamp_scans_surrounding_text() {
            assert_eq!(
                parse_timestamp("SCHEDULED: <2025-03-04 Tue 10:00> and more"),
                Some(ymd(2025, 3, 4))
            );
            assert_eq!(parse_timestamp("due <2025-03-04>"), Some(ymd(2025, 3, 4)));
            assert_eq!(parse_timestamp("<<target>> then <2025-03-04 Tue>"), Some(ymd(2025, 3, 4)));
            assert_eq!(parse_timestamp("no date here"), None);
            assert_eq!(parse_timestamp("<2025-02-30 Sun>"), None);
            assert_eq!(parse_timestamp("[2025-03-04 Tue]"), None);

            let with_time = find_timestamp("x <2025-03-04 Tue 10:15 +1w>").expect("stamp");
            assert_eq!(with_time.time, NaiveTime::from_hms_opt(10, 15, 0));
        }

        #[test]
        fn validation_checks_weekday_token() {
            assert!(is_valid_org_timestamp("<2025-01-01 Wed>"));
            assert!(is_valid_org_timestamp("<2025-01-01 Wed 08:00>"));
            assert!(!is_valid_org_timestamp("<2025-01-01 Thu>"));
            assert!(!is_valid_org_timestamp("<2025-01-01>"));
            assert!(!is_valid_org_timestamp("[2025-01-01 Wed]"));
            assert!(!is_valid_org_timestamp("<2025-01-01 Wed> trailing"));
        }

        #[test]
        fn inactive_stamps_parse_directly() {
            let stamp = Timestamp::parse("[2025-06-01 Sun 07:45]").expect("inactive");
            assert!(!stamp.active);
            assert_eq!(stamp.to_string(), "[2025-06-01 Sun 07:45]");
        }

        #[test]
        fn parse_input_accepts_optional_time() {
            let stamp = Timestamp::parse_input(" 2025-01-05 09:00 ").expect("input");
            assert_eq!(stamp.to_string(), "<2025-01-05 Sun 09:00>");
            assert!(matches!(
                Timestamp::parse_input("2025-01-05 9am"),
                Err(GtdError::InvalidTime(_))
            ));
        }

        #[test]
        fn days_between_is_antisymmetric() {
            let a = ymd(2024, 3, 9);
            let b = ymd(2024, 3, 12);
            assert_eq!(days_between(a, a), 0);
            assert_eq!(days_between(a, b), 3);
            assert_eq!(days_between(b, a), -3);
            let leap_span = days_between(ymd(2024, 2, 28), ymd(2024, 3, 1));
            assert_eq!(leap_span, 2);
        }

        #[test]
        fn overdue_honours_grace() {
            let today = ymd(2025, 5, 10);
            assert!(is_overdue(ymd(2025, 5, 9), 0, today));
            assert!(!is_overdue(ymd(2025, 5, 10), 0, today));
            assert!(!is_overdue(ymd(2025, 5, 8), 2, today));
            assert!(is_overdue(ymd(2025, 5, 7), 2, today));
        }

        #[test]
        fn urgency_prefers_deadlines() {
            let today = ymd(2025, 5, 10);
            let classify = |s, d| Urgency::classify(s, d, today, 0);
            assert_eq!(classify(None, Some(ymd(2025, 5, 1))), Urgency::OverdueDeadline);
            assert_eq!(classify(Some(ymd(2025, 5, 1)), Some(today)), Urgency::DeadlineToday);
            assert_eq!(classify(None, Some(ymd(2025, 5, 15))), Urgency::DeadlineThisWeek);
            assert_eq!(classify(Some(ymd(2025, 5, 9)), Some(ymd(2025, 6, 1))), Urgency::OverdueScheduled);
            assert_eq!(classify(Some(today), None), Urgency::ScheduledToday);
            assert_eq!(classify(Some(ymd(2025, 5, 11)), None), Urgency::None);
            assert!(Urgency::OverdueDeadline < Urgency::ScheduledToday);
        }
    }
}

pub mod parser {
    //! Line classifier and unparser for the outline subset the workflow uses.
    //!
    //! Every component reads the text layout through these functions:
    //! - a heading is `<stars> [<STATUS> ]<title>[ :tag:tag:]`,
    //! - drawers are `:NAME:` ... `:END:` with `:KEY: value` entries,
    //! - planning lines hold `SCHEDULED:` / `DEADLINE:` / `CLOSED:` stamps,
    //! - task links are `[[task:<id>][...]]`, note links `[[id:<uuid>][...]]`.
    //!
    //! Rewrites operate on the raw line so spacing and unrelated text survive.

    use crate::core::{Status, Tag};
    use crate::timestamp::{self, Timestamp};
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_while1},
        character::complete::{char, space0},
        combinator::{all_consuming, map, rest},
        sequence::{delimited, preceded, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T>;

    /* ------------------------------ Headings ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HeadingLine {
        pub level: usize,
        pub status: Option<Status>,
        /// Title with status keyword and tag block removed.
        pub title: String,
        /// Tags in order of appearance, without duplicates.
        pub tags: Vec<Tag>,
    }

    impl HeadingLine {
        /// Line breaks in `title` collapse to spaces so it stays one line.
        pub fn new(level: usize, status: Option<Status>, title: &str) -> Self {
            Self {
                level: level.max(1),
                status,
                title: title.replace(['\n', '\r'], " ").trim().to_string(),
                tags: Vec::new(),
            }
        }

        pub fn render(&self) -> String {
            let mut buf = "*".repeat(self.level);
            buf.push(' ');
            if let Some(status) = self.status {
                buf.push_str(status.as_str());
                if !self.title.is_empty() || !self.tags.is_empty() {
                    buf.push(' ');
                }
            }
            buf.push_str(&self.title);
            if !self.tags.is_empty() {
                if !self.title.is_empty() {
                    buf.push(' ');
                }
                buf.push(':');
                for tag in &self.tags {
                    buf.push_str(&tag.0);
                    buf.push(':');
                }
            }
            buf
        }
    }

    /// Stars followed by a space.
    pub fn is_heading(line: &str) -> bool {
        let stars = count_stars(line);
        stars > 0 && line[stars..].starts_with(' ')
    }

    fn count_stars(line: &str) -> usize {
        line.bytes().take_while(|b| *b == b'*').count()
    }

    pub fn heading_line(line: &str) -> Option<HeadingLine> {
        heading(line).ok().map(|(_, h)| h)
    }

    fn heading(i: &str) -> PResult<'_, HeadingLine> {
        let (i, stars) = take_while1(|c: char| c == '*')(i)?;
        let (i, _) = char(' ')(i)?;
        let (i, body) = rest(i)?;
        let (status, remainder) = split_status(body.trim());
        let (title, tags) = split_tags(remainder);
        Ok((
            i,
            HeadingLine {
                level: stars.len(),
                status,
                title: title.to_string(),
                tags,
            },
        ))
    }

    /// Leading keyword, if it is one of the recognized statuses.
    fn split_status(body: &str) -> (Option<Status>, &str) {
        let (word, after) = match body.split_once(char::is_whitespace) {
            Some((word, after)) => (word, after.trim_start()),
            None => (body, ""),
        };
        match Status::parse(word) {
            Some(status) => (Some(status), after),
            None => (None, body),
        }
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '@' || c == '#' || c == '%'
    }

    /// Trailing `:a:b:` block, if well-formed.
    fn split_tags(text: &str) -> (&str, Vec<Tag>) {
        let text = text.trim_end();
        let (head, last) = match text.rsplit_once(char::is_whitespace) {
            Some((head, last)) => (head, last),
            None => ("", text),
        };
        if last.len() > 2 && last.starts_with(':') && last.ends_with(':') {
            let inner = &last[1..last.len() - 1];
            if inner
                .split(':')
                .all(|part| !part.is_empty() && part.chars().all(is_tag_char))
            {
                let mut tags: Vec<Tag> = Vec::new();
                for part in inner.split(':') {
                    let tag = Tag::from(part);
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                return (head.trim_end(), tags);
            }
        }
        (text, Vec::new())
    }

    /// Replace, insert or (with `None`) drop the status keyword of a heading line.
    /// Title text and tag spacing are kept as written. `None` if `line` is not a heading.
    pub fn rewrite_status(line: &str, status: Option<Status>) -> Option<String> {
        if !is_heading(line) {
            return None;
        }
        let stars = count_stars(line);
        let body = line[stars + 1..].trim_start();
        let (_, remainder) = split_status(body);
        let mut out = line[..stars].to_string();
        out.push(' ');
        if let Some(status) = status {
            out.push_str(status.as_str());
            if !remainder.is_empty() {
                out.push(' ');
            }
        }
        out.push_str(remainder);
        Some(out)
    }

    /// Add `tag` to a heading's tag block, creating the block if needed.
    pub fn add_tag(line: &str, tag: &str) -> Option<String> {
        let parsed = heading_line(line)?;
        if parsed.tags.iter().any(|t| t.0 == tag) {
            return Some(line.to_string());
        }
        let trimmed = line.trim_end();
        if parsed.tags.is_empty() {
            Some(format!("{trimmed} :{tag}:"))
        } else {
            Some(format!("{trimmed}{tag}:"))
        }
    }

    /// Replace the star prefix so the heading sits at `level`.
    pub fn relevel(line: &str, level: usize) -> Option<String> {
        if !is_heading(line) {
            return None;
        }
        let stars = count_stars(line);
        Some(format!("{}{}", "*".repeat(level.max(1)), &line[stars..]))
    }

    /* ------------------------------ Planning ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKind {
        pub fn keyword(self) -> &'static str {
            match self {
                PlanningKind::Scheduled => "SCHEDULED",
                PlanningKind::Deadline => "DEADLINE",
                PlanningKind::Closed => "CLOSED",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlanningEntry {
        pub kind: PlanningKind,
        /// Stamp exactly as written, so untouched entries re-render unchanged.
        pub raw: String,
    }

    impl PlanningEntry {
        pub fn timestamp(&self) -> Option<Timestamp> {
            Timestamp::parse(&self.raw)
        }
    }

    /// One planning line: indentation plus one or more `KEYWORD: <stamp>` entries.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Planning {
        pub indent: String,
        pub entries: Vec<PlanningEntry>,
    }

    impl Planning {
        pub fn get(&self, kind: PlanningKind) -> Option<&PlanningEntry> {
            self.entries.iter().find(|entry| entry.kind == kind)
        }

        pub fn date(&self, kind: PlanningKind) -> Option<NaiveDate> {
            self.get(kind)
                .and_then(PlanningEntry::timestamp)
                .map(|stamp| stamp.date)
        }

        pub fn has(&self, kind: PlanningKind) -> bool {
            self.get(kind).is_some()
        }

        /// Overwrite the first entry of `kind`, dropping any repeats, or append one.
        pub fn set(&mut self, kind: PlanningKind, stamp: &Timestamp) {
            let raw = stamp.to_string();
            match self.entries.iter().position(|entry| entry.kind == kind) {
                Some(pos) => {
                    self.entries[pos].raw = raw;
                    let mut seen = false;
                    self.entries.retain(|entry| {
                        if entry.kind != kind {
                            return true;
                        }
                        let keep = !seen;
                        seen = true;
                        keep
                    });
                }
                None => self.entries.push(PlanningEntry { kind, raw }),
            }
        }

        /// Drop every entry of `kind`; true if anything was removed.
        pub fn remove(&mut self, kind: PlanningKind) -> bool {
            let before = self.entries.len();
            self.entries.retain(|entry| entry.kind != kind);
            before != self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        /// Merge another line's entries; the first entry of each kind wins.
        pub fn absorb(&mut self, other: Planning) {
            for entry in other.entries {
                if !self.has(entry.kind) {
                    self.entries.push(entry);
                }
            }
        }

        pub fn render(&self) -> String {
            let parts: Vec<String> = self
                .entries
                .iter()
                .map(|entry| format!("{}: {}", entry.kind.keyword(), entry.raw))
                .collect();
            format!("{}{}", self.indent, parts.join(" "))
        }
    }

    pub fn planning_line(line: &str) -> Option<Planning> {
        all_consuming(planning)(line).ok().map(|(_, p)| p)
    }

    fn planning(i: &str) -> PResult<'_, Planning> {
        let (mut i, indent) = space0(i)?;
        let mut entries = Vec::new();
        loop {
            let (r, kind) = alt((
                map(tag("SCHEDULED:"), |_| PlanningKind::Scheduled),
                map(tag("DEADLINE:"), |_| PlanningKind::Deadline),
                map(tag("CLOSED:"), |_| PlanningKind::Closed),
            ))(i)?;
            let (r, raw) = preceded(space0, timestamp::stamp_text)(r)?;
            let (r, _) = space0(r)?;
            entries.push(PlanningEntry {
                kind,
                raw: raw.to_string(),
            });
            i = r;
            if i.is_empty() {
                break;
            }
        }
        Ok((
            i,
            Planning {
                indent: indent.to_string(),
                entries,
            },
        ))
    }

    /* ------------------------------ Drawers ------------------------------ */

    /// `:KEY: value` (value may be empty). Keys keep their case as written.
    pub fn property(line: &str) -> Option<(String, String)> {
        property_entry(line)
            .ok()
            .map(|(_, (key, value))| (key.to_string(), value.trim().to_string()))
    }

    fn property_entry(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, (_, key, _)) = tuple((
            space0,
            delimited(
                char(':'),
                take_till1(|c: char| c == ':' || c.is_whitespace()),
                char(':'),
            ),
            space0,
        ))(i)?;
        let (i, value) = rest(i)?;
        Ok((i, (key, value)))
    }

    fn drawer_start(i: &str) -> PResult<'_, &str> {
        terminated(
            preceded(
                space0,
                delimited(
                    char(':'),
                    take_while1(|c: char| c.is_ascii_uppercase() || c == '_' || c == '-'),
                    char(':'),
                ),
            ),
            space0,
        )(i)
    }

    pub fn is_drawer_end(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(":END:")
    }

    pub fn is_properties_start(line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(":PROPERTIES:")
    }

    pub fn render_property(key: &str, value: &str) -> String {
        let value = value.replace(['\n', '\r'], " ");
        let value = value.trim();
        if value.is_empty() {
            format!(":{key}:")
        } else {
            format!(":{key}: {value}")
        }
    }

    /* -------------------------------- Links -------------------------------- */

    pub fn task_link(id: &str) -> String {
        format!("[[task:{id}][{id}]]")
    }

    pub fn references_task(line: &str, id: &str) -> bool {
        line.contains(&format!("[[task:{id}]"))
    }

    /// A line holding nothing but a task link.
    pub fn is_task_link_line(line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.starts_with("[[task:") && trimmed.ends_with("]]")
    }

    pub fn note_link(id: &str) -> String {
        format!("[[id:{id}][Notes]]")
    }

    /// Target of the first `[[id:...]]` link in `line`.
    pub fn note_link_target(line: &str) -> Option<String> {
        let start = line.find("[[id:")?;
        let (_, target) = preceded(
            tag::<_, _, nom::error::Error<&str>>("[[id:"),
            take_till1(|c: char| c == ']'),
        )(&line[start..])
        .ok()?;
        Some(target.to_string())
    }

    /* ---------------------------- Classification ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Line {
        Heading(HeadingLine),
        DrawerStart(String),
        DrawerEnd,
        Property { key: String, value: String },
        Planning(Planning),
        TaskLink,
        Blank,
        Text,
    }

    /// Classify one line in isolation. A bare `:NAME:` is reported as a drawer
    /// start; inside a drawer the document model reads it as an empty property.
    pub fn classify(line: &str) -> Line {
        if line.trim().is_empty() {
            return Line::Blank;
        }
        if let Some(heading) = heading_line(line) {
            return Line::Heading(heading);
        }
        if is_drawer_end(line) {
            return Line::DrawerEnd;
        }
        if let Ok((_, name)) = all_consuming(drawer_start)(line) {
            return Line::DrawerStart(name.to_string());
        }
        if let Some(planning) = planning_line(line) {
            return Line::Planning(planning);
        }
        if let Some((key, value)) = property(line) {
            return Line::Property { key, value };
        }
        if is_task_link_line(line) {
            return Line::TaskLink;
        }
        Line::Text
    }

    /// Body text that would be misread as structure gets a leading comma.
    pub fn escape_body_line(line: &str) -> String {
        match classify(line) {
            Line::Heading(_)
            | Line::DrawerStart(_)
            | Line::DrawerEnd
            | Line::Planning(_)
            | Line::Property { .. } => format!(",{line}"),
            _ => line.to_string(),
        }
    }

}

pub mod document {
    //! In-memory outline file: an ordered vector of lines plus the edits the
    //! workflow needs. Every mutation goes through [`EntryMut`], which recomputes
    //! subtree, section and drawer bounds from the heading index on each call, so
    //! no step trusts a boundary computed before a structural edit.
    //!
    //! Nothing here touches the disk except [`Document::load`] and [`Document::save`].

    use crate::core::{Field, GtdError, Status, props};
    use crate::parser::{self, HeadingLine, Planning, PlanningKind};
    use crate::timestamp::Timestamp;
    use anyhow::{Context, Result};
    use indexmap::IndexMap;
    use std::{
        fs,
        ops::Range,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    /* ------------------------------ Document ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Document {
        pub path: PathBuf,
        lines: Vec<String>,
        trailing_newline: bool,
        /// Terminator of the first line break in the source, reused on render.
        newline: &'static str,
    }

    impl Document {
        /// Split `text` into lines. The trailing newline and the line
        /// terminator (`\n` or `\r\n`) are remembered and restored on render.
        pub fn parse(path: impl Into<PathBuf>, text: &str) -> Self {
            let crlf = text
                .find('\n')
                .is_some_and(|at| text[..at].ends_with('\r'));
            Self {
                path: path.into(),
                lines: text.lines().map(str::to_string).collect(),
                trailing_newline: text.is_empty() || text.ends_with('\n'),
                newline: if crlf { "\r\n" } else { "\n" },
            }
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Ok(Self::parse(path, &text))
        }

        /// Load `path`, or start an empty document there if the file does not exist yet.
        pub fn load_or_empty(path: &Path) -> Result<Self> {
            if path.exists() {
                Self::load(path)
            } else {
                debug!(path = %path.display(), "starting new file");
                Ok(Self::parse(path, ""))
            }
        }

        pub fn lines(&self) -> &[String] {
            &self.lines
        }

        pub fn line(&self, idx: usize) -> Option<&str> {
            self.lines.get(idx).map(String::as_str)
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }

        pub fn to_text(&self) -> String {
            let mut out = self.lines.join(self.newline);
            if self.trailing_newline && !self.lines.is_empty() {
                out.push_str(self.newline);
            }
            out
        }

        /// Replace the file's contents with the current line sequence.
        pub fn save(&self) -> Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {:?}", parent))?;
            }
            fs::write(&self.path, self.to_text())
                .with_context(|| format!("writing {:?}", self.path))?;
            debug!(path = %self.path.display(), lines = self.lines.len(), "saved");
            Ok(())
        }

        /* ------------------------------ Headings ------------------------------ */

        pub fn headings(&self) -> impl Iterator<Item = (usize, HeadingLine)> + '_ {
            self.lines
                .iter()
                .enumerate()
                .filter_map(|(idx, line)| parser::heading_line(line).map(|h| (idx, h)))
        }

        pub fn heading(&self, h: usize) -> Option<HeadingLine> {
            self.lines.get(h).and_then(|line| parser::heading_line(line))
        }

        /// Nearest heading at or above the 0-based `line` (clamped to the last line).
        pub fn heading_at_or_above(&self, line: usize) -> Option<usize> {
            let last = self.lines.len().checked_sub(1)?;
            (0..=line.min(last))
                .rev()
                .find(|&idx| parser::is_heading(&self.lines[idx]))
        }

        pub fn find_heading(&self, pred: impl Fn(&HeadingLine) -> bool) -> Option<usize> {
            self.headings().find(|(_, h)| pred(h)).map(|(idx, _)| idx)
        }

        pub fn find_by_property(&self, key: &str, value: &str) -> Option<usize> {
            self.headings()
                .map(|(idx, _)| idx)
                .find(|&idx| self.property(idx, key).as_deref() == Some(value))
        }

        fn level_at(&self, h: usize) -> usize {
            self.lines
                .get(h)
                .map(|line| line.bytes().take_while(|b| *b == b'*').count())
                .unwrap_or(0)
        }

        /// The heading plus every following line up to the next heading of equal or lower level.
        pub fn subtree_range(&self, h: usize) -> Range<usize> {
            let level = self.level_at(h);
            let end = (h + 1..self.lines.len())
                .find(|&idx| {
                    parser::is_heading(&self.lines[idx]) && self.level_at(idx) <= level
                })
                .unwrap_or(self.lines.len());
            h..end
        }

        /// The heading plus its own body: up to the next heading of any level.
        pub fn section_range(&self, h: usize) -> Range<usize> {
            let end = (h + 1..self.lines.len())
                .find(|&idx| parser::is_heading(&self.lines[idx]))
                .unwrap_or(self.lines.len());
            h..end
        }

        /// The `:PROPERTIES:` .. `:END:` lines of heading `h`, markers included.
        /// The drawer must follow the heading, with only blank and planning lines between.
        pub fn drawer_range(&self, h: usize) -> Result<Option<Range<usize>>, GtdError> {
            let section = self.section_range(h);
            let mut idx = h + 1;
            while idx < section.end {
                let line = &self.lines[idx];
                if line.trim().is_empty() || parser::planning_line(line).is_some() {
                    idx += 1;
                } else {
                    break;
                }
            }
            if idx >= section.end || !parser::is_properties_start(&self.lines[idx]) {
                return Ok(None);
            }
            match (idx + 1..section.end).find(|&j| parser::is_drawer_end(&self.lines[j])) {
                Some(end) => Ok(Some(idx..end + 1)),
                None => Err(GtdError::UnterminatedDrawer { line: idx + 1 }),
            }
        }

        /// Drawer entries in file order; on repeated keys (any case) the first one wins.
        pub fn properties(&self, h: usize) -> Result<IndexMap<String, String>, GtdError> {
            let mut out = IndexMap::new();
            let Some(drawer) = self.drawer_range(h)? else {
                return Ok(out);
            };
            for line in &self.lines[drawer.start + 1..drawer.end - 1] {
                if let Some((key, value)) = parser::property(line) {
                    if !out.keys().any(|k: &String| k.eq_ignore_ascii_case(&key)) {
                        out.insert(key, value);
                    }
                }
            }
            Ok(out)
        }

        /// Case-insensitive lookup. A malformed drawer reads as no properties.
        pub fn property(&self, h: usize, key: &str) -> Option<String> {
            let drawer = self.drawer_range(h).ok().flatten()?;
            self.lines[drawer.start + 1..drawer.end - 1]
                .iter()
                .filter_map(|line| parser::property(line))
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, value)| value)
        }

        /// All planning entries in the heading's own section, merged.
        pub fn planning(&self, h: usize) -> Planning {
            let mut merged = Planning::default();
            for idx in self.section_range(h).skip(1) {
                if let Some(planning) = parser::planning_line(&self.lines[idx]) {
                    merged.absorb(planning);
                }
            }
            merged
        }

        /// Linked note: the `NOTE_ID` property, else the first `[[id:...]]` in the section.
        pub fn note_link(&self, h: usize) -> Option<String> {
            self.property(h, props::NOTE_ID).or_else(|| {
                self.lines[self.section_range(h)]
                    .iter()
                    .find_map(|line| parser::note_link_target(line))
            })
        }

        /* ------------------------------ Locating ------------------------------ */

        /// Heading at or above 0-based `line`, promoting the line into a heading
        /// when there is none and `promotion` allows it.
        pub fn locate(&mut self, line: usize, promotion: Promotion<'_>) -> Result<usize, GtdError> {
            if let Some(h) = self.heading_at_or_above(line) {
                return Ok(h);
            }
            let Promotion::Allowed { title, status } = promotion else {
                return Err(GtdError::HeadingNotFound { line: line + 1 });
            };
            let at = line.min(self.lines.len());
            let text = self.lines.get(at).map(|l| l.trim().to_string()).unwrap_or_default();
            if !text.is_empty() {
                self.lines[at] = HeadingLine::new(1, Some(status), &text).render();
                debug!(line = at + 1, "promoted text line to heading");
                return Ok(at);
            }
            let title = title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or(GtdError::EmptyTitle)?;
            let heading = HeadingLine::new(1, Some(status), title).render();
            if at < self.lines.len() {
                self.lines[at] = heading;
                self.lines.insert(at + 1, String::new());
            } else {
                self.lines.push(heading);
                self.lines.push(String::new());
            }
            debug!(line = at + 1, "created heading on blank line");
            Ok(at)
        }

        /// Mutable view of the heading at `h`.
        pub fn entry(&mut self, h: usize) -> Result<EntryMut<'_>, GtdError> {
            if !self.lines.get(h).is_some_and(|line| parser::is_heading(line)) {
                return Err(GtdError::HeadingNotFound { line: h + 1 });
            }
            Ok(EntryMut {
                doc: self,
                heading: h,
            })
        }

        /// Run every field operation of `edit` on heading `h`, in order.
        /// Stops at the first failing field; earlier fields stay applied in memory.
        pub fn apply(&mut self, h: usize, edit: &Edit) -> Result<(), GtdError> {
            let mut entry = self.entry(h)?;
            entry.ensure_drawer()?;
            if let Some(status) = edit.status {
                entry
                    .set_status(status)
                    .map_err(|e| e.in_field(Field::Status))?;
            }
            for (key, value) in &edit.properties {
                entry
                    .set_property(key, value)
                    .map_err(|e| e.in_field(Field::Property))?;
            }
            let scheduled = DateEdit::parse(Field::Scheduled, edit.scheduled.as_deref())?;
            entry
                .set_scheduled(&scheduled)
                .map_err(|e| e.in_field(Field::Scheduled))?;
            let deadline = DateEdit::parse(Field::Deadline, edit.deadline.as_deref())?;
            entry
                .set_deadline(&deadline)
                .map_err(|e| e.in_field(Field::Deadline))?;
            if let Some(id) = &edit.identifier_link {
                entry
                    .ensure_identifier_link(id)
                    .map_err(|e| e.in_field(Field::IdentifierLink))?;
            }
            if let Some(note) = &edit.note {
                entry.append_note(note).map_err(|e| e.in_field(Field::Note))?;
            }
            Ok(())
        }

        /* ------------------------------ Structure ------------------------------ */

        /// Remove the subtree at `h` and return its lines.
        pub fn take_subtree(&mut self, h: usize) -> Vec<String> {
            let range = self.subtree_range(h);
            self.lines.drain(range).collect()
        }

        /// Insert a moved subtree at `at`, shifting every heading in it so the
        /// first one sits at `level`. Returns the index of the first inserted line.
        pub fn insert_subtree(&mut self, at: usize, lines: Vec<String>, level: usize) -> usize {
            let at = at.min(self.lines.len());
            let top = lines
                .iter()
                .find_map(|line| parser::heading_line(line))
                .map(|h| h.level)
                .unwrap_or(level);
            let shifted: Vec<String> = lines
                .into_iter()
                .map(|line| {
                    match parser::heading_line(&line) {
                        Some(h) => {
                            let new_level = (h.level + level).saturating_sub(top).max(1);
                            parser::relevel(&line, new_level).unwrap_or(line)
                        }
                        None => line,
                    }
                })
                .collect();
            self.lines.splice(at..at, shifted);
            at
        }

        /// Append lines at the end of the file. Returns the index of the first one.
        pub fn append_lines(&mut self, lines: Vec<String>) -> usize {
            let at = self.lines.len();
            self.lines.extend(lines);
            self.trailing_newline = true;
            at
        }

        pub fn append_heading(&mut self, heading: &HeadingLine) -> usize {
            self.append_lines(vec![heading.render()])
        }
    }

    /* ------------------------------ Locating ------------------------------ */

    /// What [`Document::locate`] may do when no heading exists at or above the line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Promotion<'a> {
        Forbidden,
        /// Turn the line into a level-1 heading; a blank line needs `title`.
        Allowed {
            title: Option<&'a str>,
            status: Status,
        },
    }

    /* ------------------------------ Field edits ------------------------------ */

    /// Requested change to SCHEDULED or DEADLINE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum DateEdit {
        #[default]
        Keep,
        /// The `-` sentinel.
        Remove,
        Set(Timestamp),
    }

    impl DateEdit {
        /// `None` keeps, `-` removes, anything else must be `YYYY-MM-DD[ HH:MM]`.
        pub fn parse(field: Field, input: Option<&str>) -> Result<Self, GtdError> {
            match input.map(str::trim) {
                None => Ok(DateEdit::Keep),
                Some("-") => Ok(DateEdit::Remove),
                Some(text) => Timestamp::parse_input(text)
                    .map(DateEdit::Set)
                    .map_err(|e| e.in_field(field)),
            }
        }
    }

    /// A bundle of field operations applied by [`Document::apply`].
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Edit {
        pub status: Option<Status>,
        pub properties: Vec<(String, String)>,
        /// Raw input, validated when the field is reached.
        pub scheduled: Option<String>,
        pub deadline: Option<String>,
        pub identifier_link: Option<String>,
        pub note: Option<String>,
    }

    impl Edit {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn status(mut self, status: Status) -> Self {
            self.status = Some(status);
            self
        }

        pub fn property(mut self, key: &str, value: &str) -> Self {
            self.properties.push((key.to_string(), value.to_string()));
            self
        }

        pub fn scheduled(mut self, input: Option<&str>) -> Self {
            self.scheduled = input.map(str::to_string);
            self
        }

        pub fn deadline(mut self, input: Option<&str>) -> Self {
            self.deadline = input.map(str::to_string);
            self
        }

        pub fn identifier_link(mut self, id: &str) -> Self {
            self.identifier_link = Some(id.to_string());
            self
        }

        pub fn note(mut self, text: &str) -> Self {
            self.note = Some(text.to_string());
            self
        }
    }

    /* ------------------------------ EntryMut ------------------------------ */

    /// One heading of a document, open for editing.
    pub struct EntryMut<'d> {
        doc: &'d mut Document,
        heading: usize,
    }

    impl EntryMut<'_> {
        pub fn index(&self) -> usize {
            self.heading
        }

        pub fn heading(&self) -> Option<HeadingLine> {
            self.doc.heading(self.heading)
        }

        /// Existing drawer range, or a fresh empty drawer right after the heading.
        pub fn ensure_drawer(&mut self) -> Result<Range<usize>, GtdError> {
            if let Some(drawer) = self.doc.drawer_range(self.heading)? {
                return Ok(drawer);
            }
            let at = self.heading + 1;
            self.doc
                .lines
                .splice(at..at, [":PROPERTIES:".to_string(), ":END:".to_string()]);
            Ok(at..at + 2)
        }

        /// First line after the drawer (or heading) and any planning lines that follow it.
        fn metadata_end(&self) -> Result<usize, GtdError> {
            let section = self.doc.section_range(self.heading);
            let mut idx = match self.doc.drawer_range(self.heading)? {
                Some(drawer) => drawer.end,
                None => self.heading + 1,
            };
            while idx < section.end && parser::planning_line(&self.doc.lines[idx]).is_some() {
                idx += 1;
            }
            Ok(idx)
        }

        /// Where body text starts: after metadata and identifier link lines.
        fn body_anchor(&self) -> Result<usize, GtdError> {
            let section = self.doc.section_range(self.heading);
            let mut idx = self.metadata_end()?;
            while idx < section.end && parser::is_task_link_line(&self.doc.lines[idx]) {
                idx += 1;
            }
            Ok(idx)
        }

        pub fn set_property(&mut self, key: &str, value: &str) -> Result<(), GtdError> {
            let drawer = self.ensure_drawer()?;
            for idx in drawer.start + 1..drawer.end - 1 {
                if let Some((existing, _)) = parser::property(&self.doc.lines[idx]) {
                    if existing.eq_ignore_ascii_case(key) {
                        self.doc.lines[idx] = parser::render_property(&existing, value);
                        return Ok(());
                    }
                }
            }
            self.doc
                .lines
                .insert(drawer.end - 1, parser::render_property(key, value));
            Ok(())
        }

        /// Drop every entry for `key`. The drawer itself stays.
        pub fn remove_property(&mut self, key: &str) -> Result<bool, GtdError> {
            let Some(drawer) = self.doc.drawer_range(self.heading)? else {
                return Ok(false);
            };
            let hits: Vec<usize> = (drawer.start + 1..drawer.end - 1)
                .filter(|&idx| {
                    parser::property(&self.doc.lines[idx])
                        .is_some_and(|(k, _)| k.eq_ignore_ascii_case(key))
                })
                .collect();
            for idx in hits.iter().rev() {
                self.doc.lines.remove(*idx);
            }
            Ok(!hits.is_empty())
        }

        /// Keyword in the heading line and `STATUS` in the drawer, kept in agreement.
        pub fn set_status(&mut self, status: Status) -> Result<(), GtdError> {
            self.set_property(props::STATUS, status.as_str())?;
            let rewritten = parser::rewrite_status(&self.doc.lines[self.heading], Some(status))
                .ok_or(GtdError::HeadingNotFound {
                    line: self.heading + 1,
                })?;
            self.doc.lines[self.heading] = rewritten;
            Ok(())
        }

        pub fn set_scheduled(&mut self, edit: &DateEdit) -> Result<(), GtdError> {
            self.set_date(PlanningKind::Scheduled, edit)
        }

        pub fn set_deadline(&mut self, edit: &DateEdit) -> Result<(), GtdError> {
            self.set_date(PlanningKind::Deadline, edit)
        }

        /// Upsert or remove one planning keyword within the heading's own section.
        /// The first existing entry is overwritten and later repeats are dropped;
        /// a planning line left with no entries is deleted.
        pub fn set_date(&mut self, kind: PlanningKind, edit: &DateEdit) -> Result<(), GtdError> {
            let stamp = match edit {
                DateEdit::Keep => return Ok(()),
                DateEdit::Remove => None,
                DateEdit::Set(stamp) => Some(stamp),
            };
            let section = self.doc.section_range(self.heading);
            let hits: Vec<(usize, Planning)> = section
                .skip(1)
                .filter_map(|idx| {
                    parser::planning_line(&self.doc.lines[idx])
                        .filter(|p| p.has(kind))
                        .map(|p| (idx, p))
                })
                .collect();

            let found = !hits.is_empty();
            let mut emptied = Vec::new();
            for (n, (idx, mut planning)) in hits.into_iter().enumerate() {
                match stamp {
                    Some(stamp) if n == 0 => planning.set(kind, stamp),
                    _ => {
                        planning.remove(kind);
                    }
                }
                if planning.is_empty() {
                    emptied.push(idx);
                } else {
                    self.doc.lines[idx] = planning.render();
                }
            }
            for idx in emptied.into_iter().rev() {
                self.doc.lines.remove(idx);
            }

            if let (false, Some(stamp)) = (found, stamp) {
                let at = self.metadata_end()?;
                let mut planning = Planning::default();
                planning.set(kind, stamp);
                self.doc.lines.insert(at, planning.render());
            }
            Ok(())
        }

        /// Insert `[[task:<id>][<id>]]` unless the subtree already references `id`.
        /// Returns whether a line was added.
        pub fn ensure_identifier_link(&mut self, id: &str) -> Result<bool, GtdError> {
            let subtree = self.doc.subtree_range(self.heading);
            if self.doc.lines[subtree]
                .iter()
                .any(|line| parser::references_task(line, id))
            {
                return Ok(false);
            }
            let at = self.metadata_end()?;
            self.doc.lines.insert(at, parser::task_link(id));
            Ok(true)
        }

        /// Insert `text` ahead of the existing body, followed by a blank separator.
        pub fn append_note(&mut self, text: &str) -> Result<(), GtdError> {
            let text = text.trim();
            if text.is_empty() {
                return Err(GtdError::EmptyNote);
            }
            let at = self.body_anchor()?;
            let mut block: Vec<String> = text.lines().map(parser::escape_body_line).collect();
            block.push(String::new());
            self.doc.lines.splice(at..at, block);
            Ok(())
        }

        pub fn add_tag(&mut self, tag: &str) -> Result<(), GtdError> {
            let tagged = parser::add_tag(&self.doc.lines[self.heading], tag).ok_or(
                GtdError::HeadingNotFound {
                    line: self.heading + 1,
                },
            )?;
            self.doc.lines[self.heading] = tagged;
            Ok(())
        }
    }

}

pub mod ident {
    //! Task identifiers: 14-digit `YYYYMMDDHHMMSS` tokens taken from the local clock.

    use crate::core::props;
    use crate::document::Document;
    use crate::scanner;
    use anyhow::Result;
    use chrono::{Duration, Local, NaiveDateTime, Timelike};
    use serde::Serialize;
    use std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        sync::Mutex,
    };
    use tracing::{debug, warn};

    const FORMAT: &str = "%Y%m%d%H%M%S";

    /// Hands out sortable ids, never the same one twice from one generator.
    #[derive(Debug, Default)]
    pub struct IdGenerator {
        last: Mutex<Option<NaiveDateTime>>,
    }

    impl IdGenerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn next_id(&self) -> String {
            self.next_at(Local::now().naive_local())
        }

        /// Id for `moment`, bumped one second past the last issued id if the clock
        /// has not moved on (or went backwards).
        pub fn next_at(&self, moment: NaiveDateTime) -> String {
            let moment = moment.with_nanosecond(0).unwrap_or(moment);
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let issued = match *last {
                Some(prev) if moment <= prev => prev + Duration::seconds(1),
                _ => moment,
            };
            *last = Some(issued);
            issued.format(FORMAT).to_string()
        }
    }

    pub fn is_task_id(text: &str) -> bool {
        text.len() == 14 && text.bytes().all(|b| b.is_ascii_digit())
    }

    /// One heading declaring a given `TASK_ID`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct IdOccurrence {
        pub path: PathBuf,
        /// 1-based.
        pub line: usize,
        pub title: String,
    }

    /// Every `TASK_ID` value declared by more than one heading under `root`,
    /// archived files included. Report only; nothing is changed.
    pub fn find_all_duplicates(root: &Path) -> Result<BTreeMap<String, Vec<IdOccurrence>>> {
        let mut seen: BTreeMap<String, Vec<IdOccurrence>> = BTreeMap::new();
        for path in scanner::collect_org_files(root)? {
            let doc = match Document::load(&path) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), "skipping unreadable file: {err:#}");
                    continue;
                }
            };
            for (idx, heading) in doc.headings() {
                if let Some(id) = doc.property(idx, props::TASK_ID) {
                    seen.entry(id).or_default().push(IdOccurrence {
                        path: path.clone(),
                        line: idx + 1,
                        title: heading.title,
                    });
                }
            }
        }
        seen.retain(|_, hits| hits.len() > 1);
        debug!(groups = seen.len(), "duplicate id scan finished");
        Ok(seen)
    }

}

pub mod scanner {
    //! Read-only walk over the outline tree, producing one [`TaskRecord`] per heading.

    use crate::config::Config;
    use crate::core::{PROJECT_TAG, Status, Tag, props};
    use crate::document::Document;
    use crate::parser::PlanningKind;
    use crate::timestamp::Urgency;
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::{
        collections::HashSet,
        fs,
        path::{Component, Path, PathBuf},
    };
    use tracing::{debug, warn};

    /* ------------------------------ Containers ------------------------------ */

    /// Where a file sits in the tree. A display and sort hint only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Container {
        Inbox,
        Project,
        Area,
        Archive,
        Other,
    }

    impl Container {
        /// Classify a path relative to the root directory.
        pub fn classify(rel: &Path, cfg: &Config) -> Self {
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if is_archived_path(rel) || name.eq_ignore_ascii_case(&cfg.archive_file) {
                return Container::Archive;
            }
            if rel == Path::new(&cfg.inbox_file) {
                return Container::Inbox;
            }
            if rel.starts_with(&cfg.projects_dir) {
                return Container::Project;
            }
            if rel.starts_with(&cfg.areas_dir) {
                return Container::Area;
            }
            Container::Other
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Container::Inbox => "inbox",
                Container::Project => "project",
                Container::Area => "area",
                Container::Archive => "archive",
                Container::Other => "other",
            }
        }
    }

    /// Any path component mentioning "archive" or "deleted", in any case.
    pub fn is_archived_path(rel: &Path) -> bool {
        rel.components().any(|part| match part {
            Component::Normal(name) => {
                let name = name.to_string_lossy().to_lowercase();
                name.contains("archive") || name.contains("deleted")
            }
            _ => false,
        })
    }

    /* ------------------------------ Records ------------------------------ */

    /// Snapshot of one heading. Stale as soon as its file is edited.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TaskRecord {
        pub path: PathBuf,
        pub file_name: String,
        /// 1-based heading line.
        pub line: usize,
        /// 1-based last line of the subtree.
        pub end_line: usize,
        pub level: usize,
        pub status: Option<Status>,
        pub title: String,
        pub tags: Vec<Tag>,
        pub task_id: Option<String>,
        pub calendar_event_id: Option<String>,
        pub reminder_id: Option<String>,
        pub note_link: Option<String>,
        pub scheduled: Option<NaiveDate>,
        pub deadline: Option<NaiveDate>,
        pub container: Container,
        pub properties: IndexMap<String, String>,
    }

    impl TaskRecord {
        pub fn is_project(&self) -> bool {
            self.tags.iter().any(|t| t.0 == PROJECT_TAG)
        }

        pub fn urgency(&self, today: NaiveDate, grace_days: i64) -> Urgency {
            Urgency::classify(self.scheduled, self.deadline, today, grace_days)
        }

        /// Find this record's heading again in a freshly loaded document:
        /// by `TASK_ID`, else at the recorded line if the title still matches,
        /// else the only heading with the same title. Repeated titles never match.
        pub fn locate_in(&self, doc: &Document) -> Option<usize> {
            if let Some(id) = &self.task_id {
                if let Some(idx) = doc.find_by_property(props::TASK_ID, id) {
                    return Some(idx);
                }
            }
            if let Some(idx) = self.line.checked_sub(1) {
                if doc.heading(idx).is_some_and(|h| h.title == self.title) {
                    return Some(idx);
                }
            }
            let mut same = doc
                .headings()
                .filter(|(_, h)| h.title == self.title)
                .map(|(idx, _)| idx);
            match (same.next(), same.next()) {
                (Some(idx), None) => Some(idx),
                _ => None,
            }
        }
    }

    /// Records for every heading of `doc`, in file order.
    pub fn records(doc: &Document, container: Container) -> Vec<TaskRecord> {
        let file_name = doc
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        doc.headings()
            .map(|(idx, heading)| {
                let properties = doc.properties(idx).unwrap_or_else(|err| {
                    warn!(path = %doc.path.display(), "{err}");
                    IndexMap::new()
                });
                let lookup = |key: &str| {
                    properties
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(key))
                        .map(|(_, v)| v.clone())
                        .filter(|v| !v.is_empty())
                };
                let planning = doc.planning(idx);
                TaskRecord {
                    path: doc.path.clone(),
                    file_name: file_name.clone(),
                    line: idx + 1,
                    end_line: doc.subtree_range(idx).end,
                    level: heading.level,
                    status: heading.status,
                    task_id: lookup(props::TASK_ID),
                    calendar_event_id: lookup(props::CALENDAR_EVENT_ID),
                    reminder_id: lookup(props::REMINDER_ID),
                    note_link: doc.note_link(idx),
                    scheduled: planning.date(PlanningKind::Scheduled),
                    deadline: planning.date(PlanningKind::Deadline),
                    title: heading.title,
                    tags: heading.tags,
                    container,
                    properties,
                }
            })
            .collect()
    }

    /* ------------------------------ Scanning ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScanFilter {
        /// Skip files under an archive/deleted naming convention.
        pub exclude_archived: bool,
        /// Skip DONE and CANCELLED headings.
        pub exclude_closed: bool,
        /// Skip headings with no status, except in the inbox.
        pub tasks_only: bool,
    }

    impl ScanFilter {
        pub fn all() -> Self {
            Self::default()
        }

        /// What the pickers show. Both exclusions apply together.
        pub fn actionable() -> Self {
            Self {
                exclude_archived: true,
                exclude_closed: true,
                tasks_only: true,
            }
        }

        pub fn keeps(&self, record: &TaskRecord) -> bool {
            if self.exclude_closed && record.status.is_some_and(Status::is_done) {
                return false;
            }
            if self.tasks_only && record.status.is_none() && record.container != Container::Inbox {
                return false;
            }
            true
        }
    }

    /// Every heading under `root` passing `filter`. A missing root is empty;
    /// unreadable files are reported and skipped.
    pub fn scan(root: &Path, cfg: &Config, filter: ScanFilter) -> Result<Vec<TaskRecord>> {
        if !root.exists() {
            warn!(root = %root.display(), "root directory does not exist");
            return Ok(Vec::new());
        }
        let root = fs::canonicalize(root).with_context(|| format!("resolving path {:?}", root))?;
        let mut out = Vec::new();
        for path in collect_org_files(&root)? {
            let rel = path.strip_prefix(&root).unwrap_or(&path);
            let container = Container::classify(rel, cfg);
            if filter.exclude_archived && container == Container::Archive {
                debug!(path = %path.display(), "skipping archived file");
                continue;
            }
            let doc = match Document::load(&path) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(path = %path.display(), "treating unreadable file as empty: {err:#}");
                    continue;
                }
            };
            out.extend(
                records(&doc, container)
                    .into_iter()
                    .filter(|record| filter.keeps(record)),
            );
        }
        debug!(records = out.len(), "scan finished");
        Ok(out)
    }

    /// All `.org` files under `root`, sorted. Symlinks and dot-directories are skipped.
    pub fn collect_org_files(root: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if !root.exists() {
            return Ok(out);
        }
        let mut visited = HashSet::new();
        visit_dir(root, &mut out, &mut visited)?;
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        if !visited.insert(canonical.clone()) {
            return Ok(());
        }

        let metadata = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if metadata.is_dir() {
            debug!(dir = %canonical.display(), "visiting directory");
            let entries =
                fs::read_dir(&canonical).with_context(|| format!("listing {:?}", canonical))?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_symlink() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                visit_dir(&entry.path(), out, visited)?;
            }
        } else if metadata.is_file() && canonical.extension().is_some_and(|ext| ext == "org") {
            out.push(canonical);
        }
        Ok(())
    }

    /* ------------------------------ Ordering ------------------------------ */

    /// Base rank from status; lower sorts first.
    pub fn status_rank(status: Option<Status>, container: Container) -> i32 {
        match status {
            Some(Status::Next) => 10,
            Some(Status::Todo) => 20,
            Some(Status::Waiting) => 30,
            None if container == Container::Inbox => 40,
            None => 50,
            Some(Status::Someday) => 60,
            Some(Status::Done) | Some(Status::Cancelled) => 90,
        }
    }

    pub fn priority(record: &TaskRecord, today: NaiveDate, grace_days: i64) -> i32 {
        status_rank(record.status, record.container) + record.urgency(today, grace_days).delta()
    }

    /// Priority, then file name, then title.
    pub fn sort_actionable(records: &mut [TaskRecord], today: NaiveDate, grace_days: i64) {
        records.sort_by(|a, b| {
            priority(a, today, grace_days)
                .cmp(&priority(b, today, grace_days))
                .then_with(|| a.file_name.cmp(&b.file_name))
                .then_with(|| a.title.cmp(&b.title))
        });
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        fn write(root: &Path, rel: &str, text: &str) {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("mkdir");
            }
            fs::write(path, text).expect("write");
        }

        #[test]
        fn container_classification() {
            let cfg = Config::default();
            let cases = [
                ("inbox.org", Container::Inbox),
                ("projects/house.org", Container::Project),
                ("areas/health.org", Container::Area),
                ("archive.org", Container::Archive),
                ("Archive.org", Container::Archive),
                ("projects/deleted/old.org", Container::Archive),
                ("someday.org", Container::Other),
                ("projects/x/inbox.org", Container::Project),
                ("notes/inbox.org", Container::Other),
            ];
            for (rel, expected) in cases {
                assert_eq!(Container::classify(Path::new(rel), &cfg), expected, "{rel}");
            }
        }

        #[test]
        fn actionable_scan_hides_done_and_archived() {
            let dir = tempfile::tempdir().expect("tempdir");
            write(dir.path(), "tasks.org", "* DONE Old task\n");
            write(dir.path(), "Archive.org", "* NEXT Should be hidden\n");
            let cfg = Config::default();

            let actionable = scan(dir.path(), &cfg, ScanFilter::actionable()).expect("scan");
            assert!(actionable.is_empty());

            let all = scan(dir.path(), &cfg, ScanFilter::all()).expect("scan");
            assert_eq!(all.len(), 2);
        }

        #[test]
        fn records_carry_dates_ids_and_bounds() {
            let dir = tempfile::tempdir().expect("tempdir");
            write(
                dir.path(),
                "projects/house.org",
                "#+title: House\n* NEXT Fix sink :home:\n:PROPERTIES:\n:TASK_ID: 20250101120000\n:REMINDER_ID: x-apple://1\n:END:\nSCHEDULED: <2025-01-05 Sun> DEADLINE: <2025-01-09 Thu>\n[[id:abc][Notes]]\n** Buy washer\n* Notes heading\n",
            );
            let records = scan(dir.path(), &Config::default(), ScanFilter::all()).expect("scan");
            assert_eq!(records.len(), 3);
            let sink = &records[0];
            assert_eq!(sink.line, 2);
            assert_eq!(sink.end_line, 9);
            assert_eq!(sink.file_name, "house.org");
            assert_eq!(sink.container, Container::Project);
            assert_eq!(sink.task_id.as_deref(), Some("20250101120000"));
            assert_eq!(sink.reminder_id.as_deref(), Some("x-apple://1"));
            assert_eq!(sink.calendar_event_id, None);
            assert_eq!(sink.note_link.as_deref(), Some("abc"));
            assert_eq!(sink.scheduled, Some(ymd(2025, 1, 5)));
            assert_eq!(sink.deadline, Some(ymd(2025, 1, 9)));
            assert_eq!(sink.tags, vec![Tag::from("home")]);
            assert_eq!(records[1].level, 2);
            assert_eq!(records[1].scheduled, None);

            let tasks = scan(dir.path(), &Config::default(), ScanFilter::actionable()).expect("scan");
            assert_eq!(tasks.len(), 1);
        }

        #[test]
        fn inbox_items_without_status_are_tasks() {
            let dir = tempfile::tempdir().expect("tempdir");
            write(dir.path(), "inbox.org", "* Call plumber\n");
            write(dir.path(), "reference.org", "* Plumber numbers\n");
            let tasks = scan(dir.path(), &Config::default(), ScanFilter::actionable()).expect("scan");
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].container, Container::Inbox);
        }

        #[test]
        fn missing_root_and_hidden_dirs() {
            let dir = tempfile::tempdir().expect("tempdir");
            let none = scan(&dir.path().join("absent"), &Config::default(), ScanFilter::all())
                .expect("scan");
            assert!(none.is_empty());

            write(dir.path(), ".git/x.org", "* Hidden\n");
            write(dir.path(), "a/b/c.org", "* Visible\n");
            write(dir.path(), "notes.txt", "* Not org\n");
            let files = collect_org_files(dir.path()).expect("collect");
            assert_eq!(files.len(), 1);
            assert!(files[0].ends_with("a/b/c.org"));
        }

        #[test]
        fn actionable_order() {
            let today = ymd(2025, 1, 10);
            let dir = tempfile::tempdir().expect("tempdir");
            write(
                dir.path(),
                "b.org",
                "* SOMEDAY Learn cello\n* TODO Overdue bill\nDEADLINE: <2025-01-08 Wed>\n* NEXT Plain next\n* WAITING Parts\n",
            );
            write(dir.path(), "a.org", "* NEXT Plain next\n* TODO Today\nSCHEDULED: <2025-01-10 Fri>\n");
            write(dir.path(), "inbox.org", "* Unsorted idea\n");
            let mut tasks = scan(dir.path(), &Config::default(), ScanFilter::actionable()).expect("scan");
            sort_actionable(&mut tasks, today, 0);
            let order: Vec<(&str, &str)> = tasks
                .iter()
                .map(|t| (t.file_name.as_str(), t.title.as_str()))
                .collect();
            assert_eq!(
                order,
                vec![
                    ("b.org", "Overdue bill"),
                    ("a.org", "Plain next"),
                    ("b.org", "Plain next"),
                    ("a.org", "Today"),
                    ("b.org", "Parts"),
                    ("inbox.org", "Unsorted idea"),
                    ("b.org", "Learn cello"),
                ]
            );
        }

        #[test]
        fn locate_prefers_task_id() {
            let doc = Document::parse(
                "x.org",
                "* Moved\n* Same\n:PROPERTIES:\n:TASK_ID: 1\n:END:\n",
            );
            let mut rec = records(&doc, Container::Other).remove(1);
            rec.line = 1;
            assert_eq!(rec.locate_in(&doc), Some(1));
            rec.task_id = None;
            assert_eq!(rec.locate_in(&doc), Some(1));
            rec.title = "Moved".into();
            assert_eq!(rec.locate_in(&doc), Some(0));
        }

        #[test]
        fn locate_refuses_ambiguous_titles() {
            let doc = Document::parse("x.org", "* Intro
* Call mom
* Call mom
");
            let mut rec = records(&doc, Container::Other).remove(2);
            assert_eq!(rec.locate_in(&doc), Some(2));
            rec.line = 1;
            assert_eq!(rec.locate_in(&doc), None);
        }
    }
}

pub mod notes {
    //! Optional note files linked to tasks. Resolved once at startup from the
    //! configuration; [`NoNotes`] stands in when no notes directory is set.

    use crate::config::Config;
    use crate::core::slugify;
    use crate::document::Document;
    use crate::parser;
    use anyhow::{Context, Result};
    use std::path::PathBuf;
    use tracing::info;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NoteRef {
        /// Value of the note file's `:ID:` property.
        pub id: String,
        pub path: PathBuf,
    }

    pub trait NoteLinker {
        /// Create (or reuse) the note for a task. `None` when notes are disabled.
        fn create_note(&self, task_id: &str, title: &str) -> Result<Option<NoteRef>>;
    }

    pub struct NoNotes;

    impl NoteLinker for NoNotes {
        fn create_note(&self, _task_id: &str, _title: &str) -> Result<Option<NoteRef>> {
            Ok(None)
        }
    }

    /// Writes `<dir>/<task-id>-<slug>.org` with a file-level `:ID:` drawer.
    pub struct FileNoteLinker {
        dir: PathBuf,
    }

    impl FileNoteLinker {
        pub fn new(dir: PathBuf) -> Self {
            Self { dir }
        }

        fn note_path(&self, task_id: &str, title: &str) -> PathBuf {
            let slug = slugify(title);
            let name = if slug.is_empty() {
                format!("{task_id}.org")
            } else {
                format!("{task_id}-{slug}.org")
            };
            self.dir.join(name)
        }
    }

    impl NoteLinker for FileNoteLinker {
        fn create_note(&self, task_id: &str, title: &str) -> Result<Option<NoteRef>> {
            let path = self.note_path(task_id, title);
            if path.exists() {
                let doc = Document::load(&path)?;
                let existing = doc
                    .lines()
                    .iter()
                    .take_while(|line| !parser::is_heading(line))
                    .filter_map(|line| parser::property(line))
                    .find(|(key, _)| key.eq_ignore_ascii_case("ID"))
                    .map(|(_, value)| value);
                if let Some(id) = existing {
                    return Ok(Some(NoteRef { id, path }));
                }
                anyhow::bail!("{:?} exists but has no :ID: property", path);
            }

            let id = Uuid::new_v4().to_string();
            let mut doc = Document::parse(&path, "");
            doc.append_lines(vec![
                ":PROPERTIES:".into(),
                parser::render_property("ID", &id),
                parser::render_property(crate::core::props::TASK_ID, task_id),
                ":END:".into(),
                format!("#+title: {}", title.trim()),
                String::new(),
                parser::task_link(task_id),
            ]);
            doc.save()
                .with_context(|| format!("creating note for task {task_id}"))?;
            info!(path = %path.display(), "created note");
            Ok(Some(NoteRef { id, path }))
        }
    }

    pub fn linker_for(cfg: &Config) -> Box<dyn NoteLinker> {
        match &cfg.notes_dir {
            Some(dir) if dir.is_absolute() => Box::new(FileNoteLinker::new(dir.clone())),
            Some(dir) => Box::new(FileNoteLinker::new(cfg.root_dir.join(dir))),
            None => Box::new(NoNotes),
        }
    }

}

pub mod workflow {
    //! User-facing commands. Each one loads the files it touches, edits them in
    //! memory through the document model, and saves only after every step succeeded.
    //! Line arguments are 0-based here; the CLI converts.

    use crate::config::Config;
    use crate::core::{GtdError, PROJECT_TAG, Status, props, slugify};
    use crate::document::{Document, Edit, Promotion};
    use crate::ident::IdGenerator;
    use crate::notes::NoteLinker;
    use crate::parser::{self, HeadingLine};
    use crate::timestamp;
    use anyhow::{Result, bail};
    use serde::Serialize;
    use std::path::{Path, PathBuf};
    use tracing::info;

    /// What a command did, for the CLI to print.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Outcome {
        pub path: PathBuf,
        /// 1-based line of the affected heading.
        pub line: usize,
        pub task_id: Option<String>,
        pub message: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ClarifyArgs {
        /// Falls back to the configured default status.
        pub status: Option<Status>,
        pub scheduled: Option<String>,
        pub deadline: Option<String>,
        /// Title for a heading created on a blank line.
        pub title: Option<String>,
    }

    pub struct Workflow<'a> {
        cfg: &'a Config,
        ids: &'a IdGenerator,
        notes: &'a dyn NoteLinker,
    }

    impl<'a> Workflow<'a> {
        pub fn new(cfg: &'a Config, ids: &'a IdGenerator, notes: &'a dyn NoteLinker) -> Self {
            Self { cfg, ids, notes }
        }

        /// Append `* <title>` to the inbox with a `CREATED` stamp.
        pub fn capture(&self, title: &str, note: Option<&str>) -> Result<Outcome> {
            let title = title.trim();
            if title.is_empty() {
                return Err(GtdError::EmptyTitle.into());
            }
            let mut doc = Document::load_or_empty(&self.cfg.inbox_path())?;
            let h = doc.append_heading(&HeadingLine::new(1, None, title));
            let mut edit = Edit::new().property(props::CREATED, &timestamp::inactive_now());
            if let Some(note) = note {
                edit = edit.note(note);
            }
            doc.apply(h, &edit)?;
            doc.save()?;
            info!(path = %doc.path.display(), title, "captured");
            Ok(self.outcome(&doc, h, None, format!("Captured {title:?}")))
        }

        /// Turn an inbox item into a task: status, id, dates, id link.
        pub fn clarify(&self, path: &Path, line: usize, args: &ClarifyArgs) -> Result<Outcome> {
            let mut doc = Document::load(path)?;
            let status = args.status.unwrap_or(self.cfg.default_status);
            let h = doc.locate(
                line,
                Promotion::Allowed {
                    title: args.title.as_deref(),
                    status,
                },
            )?;
            let task_id = self.existing_or_new_id(&doc, h);
            let edit = Edit::new()
                .status(status)
                .property(props::TASK_ID, &task_id)
                .scheduled(args.scheduled.as_deref())
                .deadline(args.deadline.as_deref())
                .identifier_link(&task_id);
            doc.apply(h, &edit)?;
            doc.save()?;
            info!(path = %path.display(), line = h + 1, task_id = %task_id, "clarified");
            Ok(self.outcome(&doc, h, Some(task_id), format!("Clarified as {status}")))
        }

        /// Change the status; closing stamps `CLOSED`, reopening clears it.
        pub fn set_status(&self, path: &Path, line: usize, status: Status) -> Result<Outcome> {
            let mut doc = Document::load(path)?;
            let h = doc.locate(line, Promotion::Forbidden)?;
            let mut entry = doc.entry(h)?;
            entry.set_status(status)?;
            if status.is_done() {
                entry.set_property(props::CLOSED, &timestamp::inactive_now())?;
            } else {
                entry.remove_property(props::CLOSED)?;
            }
            doc.save()?;
            Ok(self.outcome(&doc, h, None, format!("Marked {status}")))
        }

        /// `None` keeps a date, `-` removes it.
        pub fn schedule(
            &self,
            path: &Path,
            line: usize,
            scheduled: Option<&str>,
            deadline: Option<&str>,
        ) -> Result<Outcome> {
            let mut doc = Document::load(path)?;
            let h = doc.locate(line, Promotion::Forbidden)?;
            doc.apply(h, &Edit::new().scheduled(scheduled).deadline(deadline))?;
            doc.save()?;
            Ok(self.outcome(&doc, h, None, "Dates updated".into()))
        }

        pub fn add_note(&self, path: &Path, line: usize, text: &str) -> Result<Outcome> {
            let mut doc = Document::load(path)?;
            let h = doc.locate(line, Promotion::Forbidden)?;
            doc.apply(h, &Edit::new().note(text))?;
            doc.save()?;
            Ok(self.outcome(&doc, h, None, "Note added".into()))
        }

        /// Move a subtree to the end of `target`, or beneath the heading titled `under`.
        /// The target is written before the source.
        pub fn refile(
            &self,
            path: &Path,
            line: usize,
            target: &Path,
            under: Option<&str>,
        ) -> Result<Outcome> {
            let mut source = Document::load(path)?;
            let h = source.locate(line, Promotion::Forbidden)?;
            let moved = source.take_subtree(h);

            if same_file(path, target) {
                let at = place(&mut source, moved, under)?;
                source.save()?;
                return Ok(self.outcome(&source, at, None, "Refiled within file".into()));
            }

            let mut dest = Document::load_or_empty(target)?;
            let at = place(&mut dest, moved, under)?;
            dest.save()?;
            source.save()?;
            info!(from = %path.display(), to = %target.display(), "refiled");
            Ok(self.outcome(&dest, at, None, format!("Refiled to {}", target.display())))
        }

        /// Move a subtree to the archive file, stamped with when and where from.
        pub fn archive(&self, path: &Path, line: usize) -> Result<Outcome> {
            let archive_path = self.cfg.archive_path();
            if same_file(path, &archive_path) {
                bail!("{:?} is the archive file", path);
            }
            let mut source = Document::load(path)?;
            let h = source.locate(line, Promotion::Forbidden)?;
            let mut entry = source.entry(h)?;
            entry.set_property(props::ARCHIVE_TIME, &timestamp::inactive_now())?;
            entry.set_property(props::ARCHIVE_FILE, &path.display().to_string())?;
            let moved = source.take_subtree(h);

            let mut archive = Document::load_or_empty(&archive_path)?;
            let at = archive.len();
            archive.insert_subtree(at, moved, 1);
            archive.save()?;
            source.save()?;
            info!(from = %path.display(), "archived");
            Ok(self.outcome(&archive, at, None, "Archived".into()))
        }

        /// Move a subtree into its own project file as a `PROJECT`-tagged top heading.
        pub fn convert_to_project(&self, path: &Path, line: usize) -> Result<Outcome> {
            let mut source = Document::load(path)?;
            let h = source.locate(line, Promotion::Forbidden)?;
            let heading = source
                .heading(h)
                .ok_or(GtdError::HeadingNotFound { line: h + 1 })?;
            let slug = slugify(&heading.title);
            if slug.is_empty() {
                return Err(GtdError::EmptyTitle.into());
            }
            let target = self.cfg.projects_path().join(format!("{slug}.org"));
            if target.exists() {
                return Err(GtdError::TargetExists(target).into());
            }

            let task_id = self.existing_or_new_id(&source, h);
            let mut entry = source.entry(h)?;
            entry.set_property(props::TASK_ID, &task_id)?;
            entry.add_tag(PROJECT_TAG)?;
            let moved = source.take_subtree(h);

            let mut project = Document::parse(&target, "");
            project.append_lines(vec![format!("#+title: {}", heading.title), String::new()]);
            let at = project.len();
            project.insert_subtree(at, moved, 1);
            project.save()?;
            source.save()?;
            info!(project = %target.display(), "converted to project");
            Ok(self.outcome(&project, at, Some(task_id), "Converted to project".into()))
        }

        /// Create a note for the task and record `NOTE_ID` plus an `[[id:...]]` link.
        pub fn link_note(&self, path: &Path, line: usize) -> Result<Outcome> {
            let mut doc = Document::load(path)?;
            let h = doc.locate(line, Promotion::Forbidden)?;
            let heading = doc
                .heading(h)
                .ok_or(GtdError::HeadingNotFound { line: h + 1 })?;
            let task_id = self.existing_or_new_id(&doc, h);
            let Some(note) = self.notes.create_note(&task_id, &heading.title)? else {
                return Err(GtdError::NotesDisabled.into());
            };
            let already_linked = doc.note_link(h).as_deref() == Some(note.id.as_str());
            let mut edit = Edit::new()
                .property(props::TASK_ID, &task_id)
                .property(props::NOTE_ID, &note.id)
                .identifier_link(&task_id);
            if !already_linked {
                edit = edit.note(&parser::note_link(&note.id));
            }
            doc.apply(h, &edit)?;
            doc.save()?;
            Ok(self.outcome(
                &doc,
                h,
                Some(task_id),
                format!("Linked note {}", note.path.display()),
            ))
        }

        fn existing_or_new_id(&self, doc: &Document, h: usize) -> String {
            doc.property(h, props::TASK_ID)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| self.ids.next_id())
        }

        fn outcome(&self, doc: &Document, h: usize, task_id: Option<String>, message: String) -> Outcome {
            Outcome {
                path: doc.path.clone(),
                line: h + 1,
                task_id,
                message,
            }
        }
    }

    /// Insert moved lines at the end of `doc`, or as the last child of `under`.
    fn place(doc: &mut Document, moved: Vec<String>, under: Option<&str>) -> Result<usize> {
        match under {
            Some(title) => {
                let wanted = title.trim();
                let parent = doc
                    .find_heading(|h| h.title.eq_ignore_ascii_case(wanted))
                    .ok_or_else(|| GtdError::NoMatch(wanted.to_string()))?;
                let level = doc.heading(parent).map(|h| h.level).unwrap_or(1) + 1;
                let at = doc.subtree_range(parent).end;
                Ok(doc.insert_subtree(at, moved, level))
            }
            None => {
                let at = doc.len();
                Ok(doc.insert_subtree(at, moved, 1))
            }
        }
    }

    fn same_file(a: &Path, b: &Path) -> bool {
        match (a.canonicalize(), b.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::ident::is_task_id;
        use crate::notes::{FileNoteLinker, NoNotes};
        use std::fs;

        struct Fixture {
            dir: tempfile::TempDir,
            cfg: Config,
            ids: IdGenerator,
        }

        impl Fixture {
            fn new() -> Self {
                let dir = tempfile::tempdir().expect("tempdir");
                let cfg = Config::default().with_root(dir.path().to_path_buf());
                Self {
                    dir,
                    cfg,
                    ids: IdGenerator::new(),
                }
            }

            fn file(&self, rel: &str, text: &str) -> PathBuf {
                let path = self.dir.path().join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).expect("mkdir");
                }
                fs::write(&path, text).expect("write");
                path
            }
        }

        fn read(path: &Path) -> String {
            fs::read_to_string(path).expect("read")
        }

        fn gtd_error(err: &anyhow::Error) -> &GtdError {
            err.downcast_ref::<GtdError>().expect("domain error")
        }

        #[test]
        fn capture_appends_to_inbox() {
            let fx = Fixture::new();
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.capture("Buy milk", None).expect("capture");
            let out = wf.capture("Call Bob", Some("about the offsite")).expect("capture");
            assert_eq!(out.line, 5);
            let doc = Document::load(&fx.cfg.inbox_path()).expect("inbox");
            let titles: Vec<String> = doc.headings().map(|(_, h)| h.title).collect();
            assert_eq!(titles, ["Buy milk", "Call Bob"]);
            assert!(doc.property(0, props::CREATED).is_some());
            assert!(read(&fx.cfg.inbox_path()).contains(":END:\nabout the offsite\n\n"));
            assert!(wf.capture("  ", None).is_err());
        }

        #[test]
        fn capture_keeps_multiline_title_in_one_heading() {
            let fx = Fixture::new();
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.capture("Buy milk\n* DONE Injected", None).expect("capture");
            let doc = Document::load(&fx.cfg.inbox_path()).expect("inbox");
            assert_eq!(doc.headings().count(), 1);
            assert_eq!(doc.line(0), Some("* Buy milk * DONE Injected"));
            assert!(doc.property(0, props::CREATED).is_some());
        }

        #[test]
        fn clarify_buy_milk() {
            let fx = Fixture::new();
            let path = fx.file("inbox.org", "* TODO Buy milk\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            let args = ClarifyArgs {
                status: Some(Status::Next),
                ..ClarifyArgs::default()
            };
            let out = wf.clarify(&path, 0, &args).expect("clarify");
            let id = out.task_id.expect("id");
            assert!(is_task_id(&id));

            let doc = Document::load(&path).expect("load");
            assert_eq!(doc.line(0), Some("* NEXT Buy milk"));
            assert_eq!(doc.property(0, props::STATUS).as_deref(), Some("NEXT"));
            assert_eq!(doc.property(0, props::TASK_ID).as_deref(), Some(id.as_str()));
            let links = doc
                .lines()
                .iter()
                .filter(|l| parser::references_task(l, &id))
                .count();
            assert_eq!(links, 1);

            // a second pass keeps the id and does not add another link
            wf.clarify(&path, 0, &ClarifyArgs::default()).expect("again");
            let doc = Document::load(&path).expect("load");
            assert_eq!(doc.property(0, props::TASK_ID).as_deref(), Some(id.as_str()));
            assert_eq!(doc.line(0), Some("* NEXT Buy milk"));
            assert_eq!(read(&path).matches("[[task:").count(), 1);
        }

        #[test]
        fn clarify_promotes_blank_line() {
            let fx = Fixture::new();
            let path = fx.file("inbox.org", "\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            let args = ClarifyArgs {
                status: Some(Status::Todo),
                title: Some("Test task".into()),
                scheduled: Some("2025-01-05".into()),
                ..ClarifyArgs::default()
            };
            wf.clarify(&path, 0, &args).expect("clarify");
            let doc = Document::load(&path).expect("load");
            assert_eq!(doc.line(0), Some("* TODO Test task"));
            assert_eq!(doc.lines().last().map(String::as_str), Some(""));
            assert!(read(&path).contains("SCHEDULED: <2025-01-05 Sun>\n"));
        }

        #[test]
        fn clarify_with_bad_date_writes_nothing() {
            let fx = Fixture::new();
            let original = "* TODO Buy milk\n";
            let path = fx.file("inbox.org", original);
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            let args = ClarifyArgs {
                deadline: Some("2025-02-29".into()),
                ..ClarifyArgs::default()
            };
            let err = wf.clarify(&path, 0, &args).expect_err("invalid date");
            assert!(matches!(
                gtd_error(&err),
                GtdError::FieldFailed {
                    field: crate::core::Field::Deadline,
                    ..
                }
            ));
            assert_eq!(read(&path), original);
        }

        #[test]
        fn status_changes_stamp_closed() {
            let fx = Fixture::new();
            let path = fx.file("a.org", "* NEXT Ship it\nbody\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.set_status(&path, 1, Status::Done).expect("done");
            let doc = Document::load(&path).expect("load");
            assert_eq!(doc.heading(0).and_then(|h| h.status), Some(Status::Done));
            assert!(doc.property(0, props::CLOSED).is_some());

            wf.set_status(&path, 0, Status::Next).expect("reopen");
            let doc = Document::load(&path).expect("load");
            assert_eq!(doc.property(0, props::CLOSED), None);
            assert_eq!(doc.property(0, props::STATUS).as_deref(), Some("NEXT"));

            let loose = fx.file("loose.org", "no heading here\n");
            let err = wf.set_status(&loose, 0, Status::Done).expect_err("no heading");
            assert!(matches!(gtd_error(&err), GtdError::HeadingNotFound { line: 1 }));
        }

        #[test]
        fn schedule_sets_and_clears() {
            let fx = Fixture::new();
            let path = fx.file("a.org", "* TODO Pay rent\nDEADLINE: <2025-01-31 Fri>\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.schedule(&path, 0, Some("2025-01-28"), None).expect("schedule");
            let text = read(&path);
            assert!(text.contains("DEADLINE: <2025-01-31 Fri>\n"));
            assert!(text.contains("SCHEDULED: <2025-01-28 Tue>\n"));

            wf.schedule(&path, 0, Some("-"), Some("-")).expect("clear");
            let text = read(&path);
            assert!(!text.contains("SCHEDULED"));
            assert!(!text.contains("DEADLINE"));
        }

        #[test]
        fn note_lands_under_heading() {
            let fx = Fixture::new();
            let path = fx.file("a.org", "* TODO Call Bob\nold\n* Other\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.add_note(&path, 1, "left voicemail").expect("note");
            assert_eq!(
                read(&path),
                "* TODO Call Bob\n:PROPERTIES:\n:END:\nleft voicemail\n\nold\n* Other\n"
            );
        }

        #[test]
        fn refile_under_heading_relevels() {
            let fx = Fixture::new();
            let src = fx.file("inbox.org", "* Fix sink\nnotes\n** Buy washer\n* Keep me\n");
            let dst = fx.file("projects/house.org", "* House\n** Paint\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            let out = wf.refile(&src, 1, &dst, Some("house")).expect("refile");
            assert_eq!(out.line, 3);
            assert_eq!(read(&src), "* Keep me\n");
            assert_eq!(
                read(&dst),
                "* House\n** Paint\n** Fix sink\nnotes\n*** Buy washer\n"
            );

            let err = wf.refile(&dst, 0, &src, Some("Nowhere")).expect_err("no parent");
            assert!(matches!(gtd_error(&err), GtdError::NoMatch(_)));
            assert_eq!(read(&src), "* Keep me\n");
        }

        #[test]
        fn refile_within_one_file() {
            let fx = Fixture::new();
            let path = fx.file("a.org", "* Loose\n* Parent\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.refile(&path, 0, &path, Some("Parent")).expect("refile");
            assert_eq!(read(&path), "* Parent\n** Loose\n");
        }

        #[test]
        fn archive_moves_subtree_with_stamps() {
            let fx = Fixture::new();
            let src = fx.file("projects/p.org", "* Project\n** DONE Old step\ndetail\n** NEXT Live step\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            wf.archive(&src, 2).expect("archive");
            assert_eq!(read(&src), "* Project\n** NEXT Live step\n");
            let archive = Document::load(&fx.cfg.archive_path()).expect("archive");
            assert_eq!(archive.line(0), Some("* DONE Old step"));
            assert!(archive.property(0, props::ARCHIVE_TIME).is_some());
            assert!(
                archive
                    .property(0, props::ARCHIVE_FILE)
                    .is_some_and(|f| f.ends_with("p.org"))
            );
            assert_eq!(archive.lines().last().map(String::as_str), Some("detail"));

            let err = wf.archive(&fx.cfg.archive_path(), 0).expect_err("self");
            assert!(err.to_string().contains("archive file"));
        }

        #[test]
        fn convert_to_project_creates_file_once() {
            let fx = Fixture::new();
            let src = fx.file("inbox.org", "* NEXT Plan Q3 offsite\n** Book venue\n* Other\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            let out = wf.convert_to_project(&src, 0).expect("convert");
            let target = fx.cfg.projects_path().join("plan-q3-offsite.org");
            assert_eq!(out.path, target);
            assert_eq!(out.line, 3);
            assert_eq!(read(&src), "* Other\n");
            let project = Document::load(&target).expect("project");
            assert_eq!(project.line(0), Some("#+title: Plan Q3 offsite"));
            let h = project.heading(2).expect("heading");
            assert_eq!(h.title, "Plan Q3 offsite");
            assert!(h.tags.iter().any(|t| t.0 == PROJECT_TAG));
            assert!(project.property(2, props::TASK_ID).is_some_and(|id| is_task_id(&id)));
            assert!(project.find_heading(|h| h.title == "Book venue" && h.level == 2).is_some());

            let again = fx.file("inbox.org", "* Plan Q3 offsite\n");
            let err = wf.convert_to_project(&again, 0).expect_err("exists");
            assert!(matches!(gtd_error(&err), GtdError::TargetExists(_)));
            assert_eq!(read(&again), "* Plan Q3 offsite\n");
        }

        #[test]
        fn link_note_requires_linker() {
            let fx = Fixture::new();
            let path = fx.file("a.org", "* NEXT Write report\n");
            let wf = Workflow::new(&fx.cfg, &fx.ids, &NoNotes);
            let err = wf.link_note(&path, 0).expect_err("disabled");
            assert!(matches!(gtd_error(&err), GtdError::NotesDisabled));
            assert_eq!(read(&path), "* NEXT Write report\n");

            let linker = FileNoteLinker::new(fx.dir.path().join("notes"));
            let wf = Workflow::new(&fx.cfg, &fx.ids, &linker);
            wf.link_note(&path, 0).expect("link");
            wf.link_note(&path, 0).expect("relink");
            let doc = Document::load(&path).expect("load");
            let note_id = doc.property(0, props::NOTE_ID).expect("note id");
            assert_eq!(doc.note_link(0).as_deref(), Some(note_id.as_str()));
            assert_eq!(read(&path).matches("[[id:").count(), 1);
        }
    }
}

pub mod sync {
    //! Mirroring tasks into an external calendar or reminder list.
    //!
    //! The core only stores the external id as an opaque property
    //! (`CALENDAR_EVENT_ID` / `REMINDER_ID`). Adapters sit behind [`SyncAdapter`];
    //! [`OsaScriptAdapter`] drives the macOS apps through `osascript`, and
    //! [`InMemoryAdapter`] is a deterministic stand-in for tests and dry runs.

    use crate::config::{AdapterConfig, Config};
    use crate::core::{GtdError, Status, props};
    use crate::document::{DateEdit, Document};
    use crate::parser::HeadingLine;
    use crate::scanner::{self, ScanFilter, TaskRecord};
    use crate::timestamp::{self, Timestamp};
    use anyhow::{Context, Result, bail};
    use chrono::{Datelike, NaiveDate};
    use serde::Serialize;
    use std::{
        cell::{Cell, RefCell},
        collections::{BTreeMap, HashMap},
        fmt,
        io::Read,
        path::Path,
        process::{Command, Stdio},
        thread,
        time::Duration,
    };
    use tracing::{debug, info, warn};
    use wait_timeout::ChildExt;

    /* ------------------------------ Contract ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum AdapterKind {
        Calendar,
        Reminders,
    }

    impl AdapterKind {
        /// Property holding this adapter's external id.
        pub fn property_key(self) -> &'static str {
            match self {
                AdapterKind::Calendar => props::CALENDAR_EVENT_ID,
                AdapterKind::Reminders => props::REMINDER_ID,
            }
        }

        pub fn settings(self, cfg: &Config) -> &AdapterConfig {
            match self {
                AdapterKind::Calendar => &cfg.sync.calendar,
                AdapterKind::Reminders => &cfg.sync.reminders,
            }
        }

        /// External id already stored on a record.
        pub fn linked_id(self, record: &TaskRecord) -> Option<&str> {
            match self {
                AdapterKind::Calendar => record.calendar_event_id.as_deref(),
                AdapterKind::Reminders => record.reminder_id.as_deref(),
            }
        }
    }

    impl fmt::Display for AdapterKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                AdapterKind::Calendar => "calendar",
                AdapterKind::Reminders => "reminders",
            })
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum AdapterError {
        #[error("automation call timed out after {0:?}")]
        Timeout(Duration),
        #[error("automation call failed: {0}")]
        Failed(String),
        #[error("could not start automation: {0}")]
        Spawn(#[from] std::io::Error),
        #[error("no external item with id {0:?}")]
        NotFound(String),
        #[error("unexpected automation output: {0:?}")]
        Malformed(String),
    }

    /// What an adapter is asked to create or update.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ItemDraft {
        pub title: String,
        pub status: Option<Status>,
        pub scheduled: Option<NaiveDate>,
        pub deadline: Option<NaiveDate>,
        /// Where the task lives, for the item's description field.
        pub notes: String,
    }

    impl ItemDraft {
        pub fn from_record(record: &TaskRecord) -> Self {
            let mut notes = format!("{}:{}", record.path.display(), record.line);
            if let Some(id) = &record.task_id {
                notes.push_str(&format!("\nTASK_ID: {id}"));
            }
            Self {
                title: record.title.clone(),
                status: record.status,
                scheduled: record.scheduled,
                deadline: record.deadline,
                notes,
            }
        }

        /// Events sit on the scheduled day; reminders are due on the deadline.
        pub fn date_for(&self, kind: AdapterKind) -> Option<NaiveDate> {
            match kind {
                AdapterKind::Calendar => self.scheduled.or(self.deadline),
                AdapterKind::Reminders => self.deadline.or(self.scheduled),
            }
        }

        pub fn completed(&self) -> bool {
            self.status.is_some_and(Status::is_done)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ExternalItem {
        pub id: String,
        pub title: String,
        pub date: Option<NaiveDate>,
        pub completed: bool,
    }

    pub trait SyncAdapter {
        fn kind(&self) -> AdapterKind;
        /// Returns the new item's external id.
        fn create(&self, item: &ItemDraft) -> Result<String, AdapterError>;
        fn update(&self, id: &str, item: &ItemDraft) -> Result<(), AdapterError>;
        fn delete(&self, id: &str) -> Result<(), AdapterError>;
        fn list(&self) -> Result<Vec<ExternalItem>, AdapterError>;
    }

    /// The configured adapter for `kind`; fails if that adapter is disabled.
    pub fn adapter_for(kind: AdapterKind, cfg: &Config) -> Result<Box<dyn SyncAdapter>> {
        let settings = kind.settings(cfg);
        if !settings.enabled {
            bail!("{kind} sync is disabled (set sync.{kind}.enabled = true)");
        }
        Ok(Box::new(OsaScriptAdapter::new(kind, settings)))
    }

    /* ------------------------------ osascript ------------------------------ */

    /// Runs generated AppleScript through `osascript -e`, killing it after `timeout`.
    pub struct OsaScriptAdapter {
        kind: AdapterKind,
        target: String,
        timeout: Duration,
        command: Vec<String>,
    }

    impl OsaScriptAdapter {
        pub fn new(kind: AdapterKind, settings: &AdapterConfig) -> Self {
            Self {
                kind,
                target: settings.target.clone(),
                timeout: Duration::from_secs(settings.timeout_secs),
                command: vec!["osascript".into()],
            }
        }

        /// Replace the interpreter command; the script is appended as `-e <script>`.
        pub fn with_command(mut self, command: Vec<String>) -> Self {
            self.command = command;
            self
        }

        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        fn run(&self, script: &str) -> Result<String, AdapterError> {
            let Some((program, args)) = self.command.split_first() else {
                return Err(AdapterError::Failed("no automation command configured".into()));
            };
            debug!(kind = %self.kind, "running automation script");
            let mut child = Command::new(program)
                .args(args)
                .arg("-e")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            let stdout = child.stdout.take().map(drain);
            let stderr = child.stderr.take().map(drain);

            let Some(status) = child.wait_timeout(self.timeout)? else {
                warn!(kind = %self.kind, "automation call hung; killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(AdapterError::Timeout(self.timeout));
            };

            let out = stdout.map(collect).unwrap_or_default();
            let err = stderr.map(collect).unwrap_or_default();
            if status.success() {
                Ok(out)
            } else {
                Err(AdapterError::Failed(err.trim().to_string()))
            }
        }

        fn run_on(&self, id: &str, script: &str) -> Result<String, AdapterError> {
            self.run(script).map_err(|err| match err {
                AdapterError::Failed(msg) if msg.contains("-1728") => {
                    AdapterError::NotFound(id.to_string())
                }
                other => other,
            })
        }
    }

    fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let mut buf = Vec::new();
            // a read error keeps whatever arrived before it
            pipe.read_to_end(&mut buf).ok();
            String::from_utf8_lossy(&buf).into_owned()
        })
    }

    fn collect(handle: thread::JoinHandle<String>) -> String {
        handle.join().unwrap_or_default()
    }

    impl SyncAdapter for OsaScriptAdapter {
        fn kind(&self) -> AdapterKind {
            self.kind
        }

        fn create(&self, item: &ItemDraft) -> Result<String, AdapterError> {
            let id = self.run(&create_script(self.kind, &self.target, item))?;
            let id = id.trim();
            if id.is_empty() {
                return Err(AdapterError::Malformed(id.to_string()));
            }
            Ok(id.to_string())
        }

        fn update(&self, id: &str, item: &ItemDraft) -> Result<(), AdapterError> {
            self.run_on(id, &update_script(self.kind, &self.target, id, item))
                .map(|_| ())
        }

        fn delete(&self, id: &str) -> Result<(), AdapterError> {
            self.run_on(id, &delete_script(self.kind, &self.target, id))
                .map(|_| ())
        }

        fn list(&self) -> Result<Vec<ExternalItem>, AdapterError> {
            parse_listing(&self.run(&list_script(self.kind, &self.target))?)
        }
    }

    /* ------------------------------ AppleScript ------------------------------ */

    /// A quoted AppleScript string literal.
    pub fn applescript_string(text: &str) -> String {
        let mut out = String::with_capacity(text.len() + 2);
        out.push('"');
        for ch in text.chars() {
            match ch {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                other => out.push(other),
            }
        }
        out.push('"');
        out
    }

    /// Builds `var` field by field so the result does not depend on the system locale.
    fn date_snippet(var: &str, date: NaiveDate) -> String {
        format!(
            "set {var} to current date\nset day of {var} to 1\nset year of {var} to {}\nset month of {var} to {}\nset day of {var} to {}\nset time of {var} to 0\n",
            date.year(),
            date.month(),
            date.day()
        )
    }

    const YMD_HANDLER: &str = "on ymd(d)\nreturn ((year of d) as string) & \"-\" & text -2 thru -1 of (\"0\" & ((month of d) as integer)) & \"-\" & text -2 thru -1 of (\"0\" & (day of d))\nend ymd\n";

    fn container(kind: AdapterKind, target: &str) -> (String, &'static str) {
        match kind {
            AdapterKind::Calendar => (
                format!("tell application \"Calendar\"\ntell calendar {}\n", applescript_string(target)),
                "event",
            ),
            AdapterKind::Reminders => (
                format!("tell application \"Reminders\"\ntell list {}\n", applescript_string(target)),
                "reminder",
            ),
        }
    }

    fn item_fields(kind: AdapterKind, var: &str, item: &ItemDraft) -> String {
        let mut out = String::new();
        let title = applescript_string(&item.title);
        let notes = applescript_string(&item.notes);
        match kind {
            AdapterKind::Calendar => {
                out.push_str(&format!("set summary of {var} to {title}\n"));
                out.push_str(&format!("set description of {var} to {notes}\n"));
                if let Some(date) = item.date_for(kind) {
                    out.push_str(&date_snippet("d", date));
                    out.push_str(&format!("set start date of {var} to d\n"));
                    out.push_str(&format!("set end date of {var} to d + (1 * days)\n"));
                    out.push_str(&format!("set allday event of {var} to true\n"));
                }
            }
            AdapterKind::Reminders => {
                out.push_str(&format!("set name of {var} to {title}\n"));
                out.push_str(&format!("set body of {var} to {notes}\n"));
                if let Some(date) = item.date_for(kind) {
                    out.push_str(&date_snippet("d", date));
                    out.push_str(&format!("set due date of {var} to d\n"));
                }
                out.push_str(&format!("set completed of {var} to {}\n", item.completed()));
            }
        }
        out
    }

    pub fn create_script(kind: AdapterKind, target: &str, item: &ItemDraft) -> String {
        let (open, noun) = container(kind, target);
        let (id_prop, make) = match kind {
            AdapterKind::Calendar => {
                let date = item.date_for(kind).unwrap_or_else(timestamp::today);
                let mut setup = date_snippet("d", date);
                setup.push_str(
                    "set x to make new event at end of events with properties {start date:d, end date:d + (1 * days)}\n",
                );
                ("uid", setup)
            }
            AdapterKind::Reminders => (
                "id",
                format!("set x to make new {noun} with properties {{name:{}}}\n", applescript_string(&item.title)),
            ),
        };
        format!(
            "{open}{make}{}return {id_prop} of x\nend tell\nend tell\n",
            item_fields(kind, "x", item)
        )
    }

    pub fn update_script(kind: AdapterKind, target: &str, id: &str, item: &ItemDraft) -> String {
        let (open, noun) = container(kind, target);
        let id_prop = if kind == AdapterKind::Calendar { "uid" } else { "id" };
        format!(
            "{open}set x to first {noun} whose {id_prop} is {}\n{}end tell\nend tell\n",
            applescript_string(id),
            item_fields(kind, "x", item)
        )
    }

    pub fn delete_script(kind: AdapterKind, target: &str, id: &str) -> String {
        let (open, noun) = container(kind, target);
        let id_prop = if kind == AdapterKind::Calendar { "uid" } else { "id" };
        format!(
            "{open}delete (first {noun} whose {id_prop} is {})\nend tell\nend tell\n",
            applescript_string(id)
        )
    }

    /// One line per item: `id<TAB>title<TAB>YYYY-MM-DD or empty<TAB>true|false`.
    pub fn list_script(kind: AdapterKind, target: &str) -> String {
        let (open, _) = container(kind, target);
        let body = match kind {
            AdapterKind::Calendar => {
                "repeat with x in events\nset out to out & (uid of x) & tab & (summary of x) & tab & my ymd(start date of x) & tab & \"false\" & linefeed\nend repeat\n"
            }
            AdapterKind::Reminders => {
                "repeat with x in reminders\nset due to \"\"\nif due date of x is not missing value then set due to my ymd(due date of x)\nset out to out & (id of x) & tab & (name of x) & tab & due & tab & ((completed of x) as string) & linefeed\nend repeat\n"
            }
        };
        format!("{YMD_HANDLER}set out to \"\"\n{open}{body}end tell\nend tell\nreturn out\n")
    }

    pub fn parse_listing(text: &str) -> Result<Vec<ExternalItem>, AdapterError> {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                let [id, title, date, completed] = fields[..] else {
                    return Err(AdapterError::Malformed(line.to_string()));
                };
                let date = match date.trim() {
                    "" => None,
                    text => Some(
                        timestamp::parse_date(text)
                            .ok_or_else(|| AdapterError::Malformed(line.to_string()))?,
                    ),
                };
                Ok(ExternalItem {
                    id: id.trim().to_string(),
                    title: title.trim().to_string(),
                    date,
                    completed: completed.trim() == "true",
                })
            })
            .collect()
    }

    /* ------------------------------ In memory ------------------------------ */

    /// Keeps items in a map. Ids are `mem-1`, `mem-2`, ...
    pub struct InMemoryAdapter {
        kind: AdapterKind,
        items: RefCell<BTreeMap<String, ExternalItem>>,
        next: Cell<u32>,
        failing_on: Option<String>,
    }

    impl InMemoryAdapter {
        pub fn new(kind: AdapterKind) -> Self {
            Self {
                kind,
                items: RefCell::new(BTreeMap::new()),
                next: Cell::new(1),
                failing_on: None,
            }
        }

        /// Refuse to create or update items with this title.
        pub fn failing_on(mut self, title: &str) -> Self {
            self.failing_on = Some(title.to_string());
            self
        }

        pub fn insert(&self, item: ExternalItem) {
            self.items.borrow_mut().insert(item.id.clone(), item);
        }

        pub fn items(&self) -> Vec<ExternalItem> {
            self.items.borrow().values().cloned().collect()
        }

        fn check(&self, item: &ItemDraft) -> Result<(), AdapterError> {
            if self.failing_on.as_deref() == Some(item.title.as_str()) {
                return Err(AdapterError::Failed(format!("refused {:?}", item.title)));
            }
            Ok(())
        }

        fn to_item(&self, id: String, draft: &ItemDraft) -> ExternalItem {
            ExternalItem {
                id,
                title: draft.title.clone(),
                date: draft.date_for(self.kind),
                completed: draft.completed(),
            }
        }
    }

    impl SyncAdapter for InMemoryAdapter {
        fn kind(&self) -> AdapterKind {
            self.kind
        }

        fn create(&self, item: &ItemDraft) -> Result<String, AdapterError> {
            self.check(item)?;
            let n = self.next.get();
            self.next.set(n + 1);
            let id = format!("mem-{n}");
            self.insert(self.to_item(id.clone(), item));
            Ok(id)
        }

        fn update(&self, id: &str, item: &ItemDraft) -> Result<(), AdapterError> {
            self.check(item)?;
            let mut items = self.items.borrow_mut();
            let slot = items
                .get_mut(id)
                .ok_or_else(|| AdapterError::NotFound(id.to_string()))?;
            *slot = self.to_item(id.to_string(), item);
            Ok(())
        }

        fn delete(&self, id: &str) -> Result<(), AdapterError> {
            self.items
                .borrow_mut()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| AdapterError::NotFound(id.to_string()))
        }

        fn list(&self) -> Result<Vec<ExternalItem>, AdapterError> {
            Ok(self.items())
        }
    }

    /* ------------------------------ Batches ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SyncFailure {
        pub title: String,
        pub reason: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct SyncReport {
        pub created: usize,
        pub updated: usize,
        pub completed: usize,
        pub removed: usize,
        pub imported: usize,
        pub failures: Vec<SyncFailure>,
    }

    impl SyncReport {
        fn fail(&mut self, title: &str, reason: impl fmt::Display) {
            warn!(title, "sync item failed: {reason}");
            self.failures.push(SyncFailure {
                title: title.to_string(),
                reason: reason.to_string(),
            });
        }

        pub fn succeeded(&self) -> usize {
            self.created + self.updated + self.completed + self.removed + self.imported
        }
    }

    impl fmt::Display for SyncReport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{} created, {} updated, {} completed, {} removed, {} imported, {} failed",
                self.created,
                self.updated,
                self.completed,
                self.removed,
                self.imported,
                self.failures.len()
            )
        }
    }

    /* ---------------------------- Write-back ---------------------------- */

    /// A local edit owed after a successful adapter call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum LocalEdit {
        Link(String),
        Unlink,
        Close,
    }

    #[derive(Debug, Clone, Copy)]
    enum Tally {
        Created,
        Removed,
        Completed,
    }

    impl SyncReport {
        fn tally(&mut self, tally: Tally) {
            match tally {
                Tally::Created => self.created += 1,
                Tally::Removed => self.removed += 1,
                Tally::Completed => self.completed += 1,
            }
        }
    }

    struct Pending<'r> {
        record: &'r TaskRecord,
        edit: LocalEdit,
        tally: Tally,
    }

    /// Apply queued edits file by file. Each file is loaded once and edited
    /// bottom-up, so indices taken from the scan stay valid while drawers grow.
    fn write_back(pending: Vec<Pending<'_>>, key: &str, report: &mut SyncReport) {
        let mut by_file: BTreeMap<&Path, Vec<Pending<'_>>> = BTreeMap::new();
        for item in pending {
            by_file.entry(item.record.path.as_path()).or_default().push(item);
        }
        for (path, mut edits) in by_file {
            let mut doc = match Document::load(path) {
                Ok(doc) => doc,
                Err(err) => {
                    for item in &edits {
                        report.fail(&item.record.title, format!("{err:#}"));
                    }
                    continue;
                }
            };
            edits.sort_by(|a, b| b.record.line.cmp(&a.record.line));
            let mut applied = Vec::new();
            for item in edits {
                match apply_local(&mut doc, &item, key) {
                    Ok(()) => applied.push(item),
                    Err(err) => report.fail(&item.record.title, format!("{err:#}")),
                }
            }
            if applied.is_empty() {
                continue;
            }
            match doc.save() {
                Ok(()) => applied.iter().for_each(|item| report.tally(item.tally)),
                Err(err) => {
                    for item in &applied {
                        report.fail(&item.record.title, format!("{err:#}"));
                    }
                }
            }
        }
    }

    fn apply_local(doc: &mut Document, item: &Pending<'_>, key: &str) -> Result<()> {
        let record = item.record;
        let h = record
            .locate_in(doc)
            .ok_or_else(|| GtdError::NoMatch(record.title.clone()))?;
        let mut entry = doc.entry(h)?;
        match &item.edit {
            LocalEdit::Link(id) => entry.set_property(key, id)?,
            LocalEdit::Unlink => {
                entry.remove_property(key)?;
            }
            LocalEdit::Close => {
                entry.set_status(Status::Done)?;
                entry.set_property(props::CLOSED, &timestamp::inactive_now())?;
            }
        }
        Ok(())
    }

    /// Push local tasks to the adapter. Open tasks are created or updated and
    /// their ids written back; closed reminders are marked complete; calendar
    /// events whose task lost its date are deleted. Item failures are collected.
    pub fn export(cfg: &Config, adapter: &dyn SyncAdapter) -> Result<SyncReport> {
        let kind = adapter.kind();
        let key = kind.property_key();
        let open = ScanFilter::actionable();
        let mut report = SyncReport::default();
        let records = scanner::scan(&cfg.root_dir, cfg, ScanFilter::all())?;
        let mut pending = Vec::new();

        for record in &records {
            let draft = ItemDraft::from_record(record);
            let linked = kind.linked_id(record);
            let is_open = record.container != scanner::Container::Archive && open.keeps(record);

            if !is_open {
                if let (Some(id), AdapterKind::Reminders, true) = (linked, kind, draft.completed()) {
                    match adapter.update(id, &draft) {
                        Ok(()) => report.completed += 1,
                        Err(AdapterError::NotFound(_)) => {}
                        Err(err) => report.fail(&record.title, err),
                    }
                }
                continue;
            }

            if kind == AdapterKind::Calendar && draft.date_for(kind).is_none() {
                if let Some(id) = linked {
                    match adapter.delete(id) {
                        Ok(()) | Err(AdapterError::NotFound(_)) => pending.push(Pending {
                            record,
                            edit: LocalEdit::Unlink,
                            tally: Tally::Removed,
                        }),
                        Err(err) => report.fail(&record.title, err),
                    }
                }
                continue;
            }

            if let Some(id) = linked {
                match adapter.update(id, &draft) {
                    Ok(()) => {
                        report.updated += 1;
                        continue;
                    }
                    Err(AdapterError::NotFound(_)) => debug!(id, "linked item is gone; recreating"),
                    Err(err) => {
                        report.fail(&record.title, err);
                        continue;
                    }
                }
            }
            match adapter.create(&draft) {
                Ok(id) => pending.push(Pending {
                    record,
                    edit: LocalEdit::Link(id),
                    tally: Tally::Created,
                }),
                Err(err) => report.fail(&record.title, err),
            }
        }
        write_back(pending, key, &mut report);
        info!(%kind, "export finished: {report}");
        Ok(report)
    }

    /// Pull external items in. Unlinked open items become inbox headings carrying
    /// the external id; completed reminders close their linked local task.
    pub fn import(cfg: &Config, adapter: &dyn SyncAdapter) -> Result<SyncReport> {
        let kind = adapter.kind();
        let key = kind.property_key();
        let items = adapter
            .list()
            .with_context(|| format!("listing {kind} items"))?;
        let records = scanner::scan(&cfg.root_dir, cfg, ScanFilter::all())?;
        let linked: HashMap<&str, &TaskRecord> = records
            .iter()
            .filter_map(|r| kind.linked_id(r).map(|id| (id, r)))
            .collect();
        let mut report = SyncReport::default();

        let mut pending = Vec::new();
        let mut fresh = Vec::new();
        for item in &items {
            match linked.get(item.id.as_str()) {
                Some(&record) => {
                    let open = !record.status.is_some_and(Status::is_done);
                    if kind == AdapterKind::Reminders && item.completed && open {
                        pending.push(Pending {
                            record,
                            edit: LocalEdit::Close,
                            tally: Tally::Completed,
                        });
                    }
                }
                None if !item.completed => fresh.push(item),
                None => {}
            }
        }
        write_back(pending, key, &mut report);

        if !fresh.is_empty() {
            let mut inbox = Document::load_or_empty(&cfg.inbox_path())?;
            for item in fresh {
                let title = item.title.trim();
                if title.is_empty() {
                    report.fail(&item.id, GtdError::EmptyTitle);
                    continue;
                }
                let h = inbox.append_heading(&HeadingLine::new(1, None, title));
                let mut entry = inbox.entry(h)?;
                entry.set_property(props::CREATED, &timestamp::inactive_now())?;
                entry.set_property(key, &item.id)?;
                if let Some(date) = item.date {
                    entry.set_scheduled(&DateEdit::Set(Timestamp::on(date)))?;
                }
                report.imported += 1;
            }
            inbox.save()?;
        }
        info!(%kind, "import finished: {report}");
        Ok(report)
    }

}
