use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gtd::config::Config;
use gtd::core::Status;
use gtd::ident::{self, IdGenerator};
use gtd::notes;
use gtd::scanner::{self, ScanFilter, TaskRecord};
use gtd::sync::{self, AdapterKind, SyncReport};
use gtd::timestamp::{self, Urgency};
use gtd::workflow::{ClarifyArgs, Outcome, Workflow};
use tracing::{Level, subscriber::set_global_default};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "gtd",
    about = "Getting-Things-Done workflow over org outline files",
    version
)]
struct Cli {
    /// Configuration file. Defaults to the nearest .gtd/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the outline files; overrides the configured root.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Append a new item to the inbox.
    Capture(CaptureArgs),

    /// Give an item a status, an id and optional dates.
    Clarify(ClarifyCmd),

    /// Change the status of a task.
    Status(StatusArgs),

    /// Set or clear SCHEDULED / DEADLINE ("-" clears).
    Schedule(ScheduleArgs),

    /// Add a note under a task.
    Note(NoteArgs),

    /// Move a task subtree to another file.
    Refile(RefileArgs),

    /// Move a task subtree to the archive file.
    Archive(Target),

    /// Turn a task into its own project file.
    Project(Target),

    /// Create a linked note file for a task.
    LinkNote(Target),

    /// List tasks, most pressing first.
    List(ListArgs),

    /// Report task ids used by more than one heading.
    Duplicates(DuplicatesArgs),

    /// Push tasks to the calendar or reminder list.
    Export(SyncArgs),

    /// Pull items from the calendar or reminder list into the inbox.
    Import(SyncArgs),
}

#[derive(Debug, Args)]
struct Target {
    /// Outline file containing the task.
    file: PathBuf,
    /// 1-based line inside the task (its heading or any line below it).
    #[arg(default_value_t = 1)]
    line: usize,
}

#[derive(Debug, Args)]
struct CaptureArgs {
    /// Title words.
    #[arg(required = true)]
    title: Vec<String>,
    /// Body text placed under the new heading.
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct ClarifyCmd {
    #[command(flatten)]
    target: Target,
    /// Status to assign (defaults to the configured default status).
    #[arg(long)]
    status: Option<Status>,
    /// SCHEDULED date, YYYY-MM-DD[ HH:MM].
    #[arg(long)]
    scheduled: Option<String>,
    /// DEADLINE date, YYYY-MM-DD[ HH:MM].
    #[arg(long)]
    deadline: Option<String>,
    /// Title for a new heading when the line is blank.
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// TODO, NEXT, WAITING, SOMEDAY, DONE or CANCELLED.
    status: Status,
    #[command(flatten)]
    target: Target,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    #[command(flatten)]
    target: Target,
    #[arg(long)]
    scheduled: Option<String>,
    #[arg(long)]
    deadline: Option<String>,
}

#[derive(Debug, Args)]
struct NoteArgs {
    #[command(flatten)]
    target: Target,
    /// Note text.
    #[arg(short = 'm', long)]
    text: String,
}

#[derive(Debug, Args)]
struct RefileArgs {
    #[command(flatten)]
    target: Target,
    /// Destination file.
    #[arg(long)]
    to: PathBuf,
    /// Title of the heading to file beneath.
    #[arg(long)]
    under: Option<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Include archived files and closed or status-less headings.
    #[arg(long)]
    all: bool,
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct DuplicatesArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(value_enum)]
    adapter: AdapterChoice,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AdapterChoice {
    Calendar,
    Reminders,
}

impl From<AdapterChoice> for AdapterKind {
    fn from(choice: AdapterChoice) -> Self {
        match choice {
            AdapterChoice::Calendar => AdapterKind::Calendar,
            AdapterChoice::Reminders => AdapterKind::Reminders,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = load_config(cli.config.as_deref(), cli.root)?;
    let ids = IdGenerator::new();
    let notes = notes::linker_for(&cfg);
    let wf = Workflow::new(&cfg, &ids, notes.as_ref());
    match cli.command {
        Commands::Capture(args) => handle_capture(args, &wf),
        Commands::Clarify(args) => handle_clarify(args, &wf),
        Commands::Status(args) => {
            let line = to_index(args.target.line)?;
            report(wf.set_status(&args.target.file, line, args.status)?)
        }
        Commands::Schedule(args) => handle_schedule(args, &wf),
        Commands::Note(args) => {
            let line = to_index(args.target.line)?;
            report(wf.add_note(&args.target.file, line, &args.text)?)
        }
        Commands::Refile(args) => handle_refile(args, &wf),
        Commands::Archive(t) => report(wf.archive(&t.file, to_index(t.line)?)?),
        Commands::Project(t) => report(wf.convert_to_project(&t.file, to_index(t.line)?)?),
        Commands::LinkNote(t) => report(wf.link_note(&t.file, to_index(t.line)?)?),
        Commands::List(args) => handle_list(args, &cfg),
        Commands::Duplicates(args) => handle_duplicates(args, &cfg),
        Commands::Export(args) => handle_sync(args, &cfg, sync::export),
        Commands::Import(args) => handle_sync(args, &cfg, sync::import),
    }
}

fn init_tracing(verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    let _ = set_global_default(subscriber);
}

fn load_config(explicit: Option<&Path>, root: Option<PathBuf>) -> Result<Config> {
    let cfg = Config::load(explicit)?;
    Ok(match root {
        Some(root) => cfg.with_root(root),
        None => cfg,
    })
}

/// 1-based CLI line to 0-based index.
fn to_index(line: usize) -> Result<usize> {
    match line.checked_sub(1) {
        Some(idx) => Ok(idx),
        None => bail!("line numbers start at 1"),
    }
}

fn report(outcome: Outcome) -> Result<()> {
    match &outcome.task_id {
        Some(id) => println!(
            "{}:{}: {} [{}]",
            outcome.path.display(),
            outcome.line,
            outcome.message,
            id
        ),
        None => println!("{}:{}: {}", outcome.path.display(), outcome.line, outcome.message),
    }
    Ok(())
}

fn handle_capture(args: CaptureArgs, wf: &Workflow<'_>) -> Result<()> {
    let CaptureArgs { title, note } = args;
    report(wf.capture(&title.join(" "), note.as_deref())?)
}

fn handle_clarify(args: ClarifyCmd, wf: &Workflow<'_>) -> Result<()> {
    let ClarifyCmd {
        target,
        status,
        scheduled,
        deadline,
        title,
    } = args;
    let clarify = ClarifyArgs {
        status,
        scheduled,
        deadline,
        title,
    };
    report(wf.clarify(&target.file, to_index(target.line)?, &clarify)?)
}

fn handle_schedule(args: ScheduleArgs, wf: &Workflow<'_>) -> Result<()> {
    let ScheduleArgs {
        target,
        scheduled,
        deadline,
    } = args;
    if scheduled.is_none() && deadline.is_none() {
        bail!("nothing to do: pass --scheduled and/or --deadline");
    }
    report(wf.schedule(
        &target.file,
        to_index(target.line)?,
        scheduled.as_deref(),
        deadline.as_deref(),
    )?)
}

fn handle_refile(args: RefileArgs, wf: &Workflow<'_>) -> Result<()> {
    let RefileArgs { target, to, under } = args;
    report(wf.refile(&target.file, to_index(target.line)?, &to, under.as_deref())?)
}

fn handle_list(args: ListArgs, cfg: &Config) -> Result<()> {
    let ListArgs { all, json } = args;
    let filter = if all {
        ScanFilter::all()
    } else {
        ScanFilter::actionable()
    };
    let today = timestamp::today();
    let mut records = scanner::scan(&cfg.root_dir, cfg, filter)?;
    scanner::sort_actionable(&mut records, today, cfg.grace_days);

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            #[serde(flatten)]
            record: &'a TaskRecord,
            urgency: Urgency,
            priority: i32,
        }

        let payload: Vec<JsonOutput<'_>> = records
            .iter()
            .map(|record| JsonOutput {
                record,
                urgency: record.urgency(today, cfg.grace_days),
                priority: scanner::priority(record, today, cfg.grace_days),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for record in &records {
            println!("{}", list_line(record, today, cfg.grace_days));
        }
    }
    Ok(())
}

fn list_line(record: &TaskRecord, today: chrono::NaiveDate, grace_days: i64) -> String {
    let status = record.status.map(Status::as_str).unwrap_or("-");
    let mut line = format!(
        "{:<9} {} ({}:{})",
        status, record.title, record.file_name, record.line
    );
    let urgency = record.urgency(today, grace_days);
    if urgency != Urgency::None {
        line.push_str(&format!(" [{}]", urgency.label()));
    }
    line
}

fn handle_duplicates(args: DuplicatesArgs, cfg: &Config) -> Result<()> {
    let dups = ident::find_all_duplicates(&cfg.root_dir)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&dups)?);
        return Ok(());
    }
    if dups.is_empty() {
        println!("No duplicate task ids.");
        return Ok(());
    }
    for (id, hits) in &dups {
        println!("{id} ({} headings)", hits.len());
        for hit in hits {
            println!("  {}:{}: {}", hit.path.display(), hit.line, hit.title);
        }
    }
    Ok(())
}

fn handle_sync(
    args: SyncArgs,
    cfg: &Config,
    run: fn(&Config, &dyn sync::SyncAdapter) -> Result<SyncReport>,
) -> Result<()> {
    let kind = AdapterKind::from(args.adapter);
    let adapter = sync::adapter_for(kind, cfg)?;
    let report = run(cfg, adapter.as_ref())?;
    println!("{kind}: {report}");
    for failure in &report.failures {
        eprintln!("  failed: {}: {}", failure.title, failure.reason);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use clap::CommandFactory;
    use gtd::scanner::Container;
    use indexmap::IndexMap;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_clarify_with_flags() {
        let cli = Cli::try_parse_from([
            "gtd",
            "--root",
            "/tmp/org",
            "clarify",
            "inbox.org",
            "3",
            "--status",
            "next",
            "--scheduled",
            "2025-01-05",
        ])
        .expect("parse");
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/org")));
        let Commands::Clarify(args) = cli.command else {
            panic!("expected clarify");
        };
        assert_eq!(args.target.line, 3);
        assert_eq!(args.status, Some(Status::Next));
        assert_eq!(args.scheduled.as_deref(), Some("2025-01-05"));
    }

    #[test]
    fn parses_status_and_defaults_line() {
        let cli = Cli::try_parse_from(["gtd", "status", "DONE", "a.org"]).expect("parse");
        let Commands::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert_eq!(args.status, Status::Done);
        assert_eq!(args.target.line, 1);
        assert!(Cli::try_parse_from(["gtd", "status", "FINISHED", "a.org"]).is_err());
    }

    #[test]
    fn parses_sync_and_capture() {
        let cli = Cli::try_parse_from(["gtd", "export", "reminders", "--verbose"]).expect("parse");
        assert!(cli.verbose);
        let Commands::Export(args) = cli.command else {
            panic!("expected export");
        };
        assert_eq!(AdapterKind::from(args.adapter), AdapterKind::Reminders);

        let cli = Cli::try_parse_from(["gtd", "capture", "Buy", "milk"]).expect("parse");
        let Commands::Capture(args) = cli.command else {
            panic!("expected capture");
        };
        assert_eq!(args.title.join(" "), "Buy milk");
        assert!(Cli::try_parse_from(["gtd", "capture"]).is_err());
    }

    #[test]
    fn lines_are_one_based() {
        assert_eq!(to_index(1).expect("first"), 0);
        assert_eq!(to_index(12).expect("twelfth"), 11);
        assert!(to_index(0).is_err());
    }

    #[test]
    fn root_flag_overrides_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        std::fs::write(&cfg_path, "root_dir = \"org\"\n").expect("write");
        let cfg = load_config(Some(cfg_path.as_path()), None).expect("load");
        assert_eq!(cfg.root_dir, dir.path().join("org"));
        let cfg = load_config(Some(cfg_path.as_path()), Some(PathBuf::from("/elsewhere"))).expect("load");
        assert_eq!(cfg.root_dir, PathBuf::from("/elsewhere"));
    }

    #[test]
    fn list_line_shows_urgency() {
        let record = TaskRecord {
            path: PathBuf::from("/org/a.org"),
            file_name: "a.org".into(),
            line: 4,
            end_line: 6,
            level: 1,
            status: Some(Status::Next),
            title: "Pay rent".into(),
            tags: Vec::new(),
            task_id: None,
            calendar_event_id: None,
            reminder_id: None,
            note_link: None,
            scheduled: None,
            deadline: NaiveDate::from_ymd_opt(2025, 1, 31),
            container: Container::Other,
            properties: IndexMap::new(),
        };
        let today = NaiveDate::from_ymd_opt(2025, 1, 31).expect("date");
        assert_eq!(
            list_line(&record, today, 0),
            "NEXT      Pay rent (a.org:4) [due today]"
        );
    }
}
