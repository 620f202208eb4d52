//! dblint CLI Entry Point
//!
//! This is the main binary entry point for the dblint CLI.
//! It provides two subcommands:
//! - `checks` - List every check with its property key and default state
//! - `run` - Run SQL against a SQLite database through the guarded layer and
//!   report the violations it raised
//!
//! All output to stdout is JSON-only. Logs go to stderr (`DBLINT_LOG` filter).

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use dblint::classify::split_statements;
use dblint::driver::sqlite::SqliteConnection;
use dblint::output::{value_to_json, CheckInfo, StatementOutcome, ViolationRecord};
use dblint::{
    Action, Check, ErrorEnvelope, ErrorInfo, FailMethod, GuardedConnection, GuardedDataSource,
    LintError, Metadata, Policy, SqliteDataSource, SuccessEnvelope,
};

const ENGINE: &str = "sqlite";

/// dblint - Runtime contract checks for database client handles
#[derive(Parser)]
#[command(name = "dblint")]
#[command(about = "Run SQL through guarded database handles and report usage-contract violations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every check, its property key and whether it is enabled by default
    Checks,

    /// Run SQL against a SQLite database through guarded handles
    Run {
        /// Path to the SQLite database file (created if missing)
        #[arg(long)]
        database: PathBuf,

        /// SQL statement to run (repeatable, runs in order)
        #[arg(long, conflicts_with = "script")]
        sql: Vec<String>,

        /// File with semicolon-separated SQL statements
        #[arg(long)]
        script: Option<PathBuf>,

        /// Enable a check (repeatable)
        #[arg(long)]
        enable: Vec<String>,

        /// Disable a check (repeatable)
        #[arg(long)]
        disable: Vec<String>,

        /// What to do on a violation: no_operation, raise_error, panic, exit
        #[arg(long)]
        fail_method: Option<String>,

        /// Append violation records to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

/// Options of the `run` command
struct RunArgs {
    database: PathBuf,
    sql: Vec<String>,
    script: Option<PathBuf>,
    enable: Vec<String>,
    disable: Vec<String>,
    fail_method: Option<String>,
    log_file: Option<PathBuf>,
}

#[derive(serde::Serialize)]
struct RunReport {
    statements: Vec<StatementOutcome>,
    violations: Vec<ViolationRecord>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let succeeded = match cli.command {
        Commands::Checks => {
            let checks: Vec<CheckInfo> = Check::ALL.into_iter().map(CheckInfo::from).collect();
            print_json(&SuccessEnvelope::new("", "checks", checks, Metadata::new(0)));
            true
        }
        Commands::Run { database, sql, script, enable, disable, fail_method, log_file } => {
            let args = RunArgs { database, sql, script, enable, disable, fail_method, log_file };
            let start = Instant::now();
            match run(&args) {
                Ok(report) => {
                    let rows = report.statements.iter().map(|s| s.rows.len()).sum();
                    let meta = Metadata::new(elapsed_ms(start))
                        .with_rows(rows)
                        .with_violations(report.violations.len());
                    print_json(&SuccessEnvelope::new(ENGINE, "run", report, meta));
                    true
                }
                Err(err) => {
                    print_json(&error_envelope("run", &err));
                    false
                }
            }
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
}

/// Install the stderr log subscriber (`DBLINT_LOG`, default `dblint=warn`)
fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("DBLINT_LOG").unwrap_or_else(|_| EnvFilter::new("dblint=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(args: &RunArgs) -> anyhow::Result<RunReport> {
    let statements = match &args.script {
        Some(path) => {
            let script = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            split_statements(&script)
        }
        None => args.sql.clone(),
    };
    if statements.is_empty() {
        return Err(LintError::invalid_input("Provide --sql or a non-empty --script").into());
    }

    let violations = Arc::new(Mutex::new(Vec::new()));
    let policy = build_policy(args, Arc::clone(&violations))?;
    let source = GuardedDataSource::new(SqliteDataSource::open(&args.database)?, policy);

    let conn = source.get_connection()?;
    let outcomes = statements
        .iter()
        .map(|sql| run_statement(&conn, sql))
        .collect::<dblint::Result<Vec<_>>>();
    let closed = conn.close();
    let outcomes = outcomes?;
    closed?;

    let violations = std::mem::take(&mut *violations.lock());
    Ok(RunReport { statements: outcomes, violations })
}

fn build_policy(args: &RunArgs, sink: Arc<Mutex<Vec<ViolationRecord>>>) -> dblint::Result<Policy> {
    let mut builder = Policy::defaults().apply_lookup(|name| std::env::var(name).ok())?;
    for name in &args.enable {
        builder = builder.add_check(name.parse()?);
    }
    for name in &args.disable {
        builder = builder.remove_check(name.parse()?);
    }

    if let Some(method) = &args.fail_method {
        builder = builder.fail_method(method.parse::<FailMethod>()?);
    }
    if let Some(path) = &args.log_file {
        builder = builder.log_file(path);
    }

    // Collect ahead of the preset so a terminating one still sees the record
    let collect = Action::callback(move |violation| sink.lock().push(ViolationRecord::from(violation)));
    Ok(builder.observe(collect).build())
}

fn run_statement(conn: &GuardedConnection<SqliteConnection>, sql: &str) -> dblint::Result<StatementOutcome> {
    let stmt = conn.create_statement()?;
    let mut outcome = StatementOutcome { sql: sql.to_string(), ..StatementOutcome::default() };

    let executed = stmt.execute(sql).and_then(|has_rows| {
        if !has_rows {
            outcome.rows_affected = stmt.get_update_count()?;
            return Ok(());
        }
        let Some(rs) = stmt.get_result_set()? else {
            return Ok(());
        };
        let count = rs.column_count()?;
        outcome.columns = (1..=count).map(|i| rs.column_label(i)).collect::<dblint::Result<_>>()?;
        while rs.next()? {
            let row = (1..=count)
                .map(|i| rs.get(i).map(|value| value_to_json(&value)))
                .collect::<dblint::Result<_>>()?;
            outcome.rows.push(row);
        }
        rs.close()
    });
    let closed = stmt.close();
    executed?;
    closed?;

    Ok(outcome)
}

fn error_envelope(command: &str, err: &anyhow::Error) -> ErrorEnvelope {
    match err.downcast_ref::<LintError>() {
        Some(lint) => ErrorEnvelope::from_error(ENGINE, command, lint),
        None => ErrorEnvelope::new(ENGINE, command, ErrorInfo::new("IO_ERROR", format!("{err:#}"))),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to serialize output"),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
