//! Line-oriented command console for a session.
//!
//! Understands the editor's `db` commands plus a few file and presence
//! commands. Parsing is separate from execution so both can be tested.

use std::fmt;

use serde_json::Value;

use crate::error::SyncError;
use crate::kv::KvValue;
use crate::session::{Session, EXPORT_TABLE};
use crate::storage::{QueryResult, SqlValue};

/// Rows shown per SQL result set.
const MAX_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Info,
    Log,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLine {
    pub kind: LineKind,
    pub text: String,
}

impl TerminalLine {
    pub fn info(text: impl Into<String>) -> Self {
        Self { kind: LineKind::Info, text: text.into() }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self { kind: LineKind::Log, text: text.into() }
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self { kind: LineKind::Warn, text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { kind: LineKind::Error, text: text.into() }
    }
}

impl fmt::Display for TerminalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbCommand {
    Set { key: String, value: KvValue },
    Get(String),
    Delete(String),
    List,
    Push { key: String, value: KvValue },
    Increment { key: String, amount: f64 },
    Clear { confirmed: bool },
    Sql(String),
    /// Copy the key-value store into the `nosql_export` table
    Export,
    /// Copy two columns of a SQL table into the key-value store
    Import {
        table: String,
        key_column: String,
        value_column: String,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Db(DbCommand),
    Files,
    Open(String),
    New(String),
    Remove(String),
    Rename { from: String, to: String },
    Cat(String),
    Who,
    Share,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Usage { usage: &'static str, example: &'static str },
    UnknownDb(String),
    Unknown(String),
}

impl ParseError {
    pub fn to_lines(&self) -> Vec<TerminalLine> {
        match self {
            ParseError::Usage { usage, example } => vec![
                TerminalLine::error(format!("Usage: {usage}")),
                TerminalLine::log(format!("Example: {example}")),
            ],
            ParseError::UnknownDb(sub) => vec![
                TerminalLine::error(format!("Unknown database command: {sub}")),
                TerminalLine::info(
                    "Available commands: set, get, delete, list, push, increment, clear, sql, help",
                ),
            ],
            ParseError::Unknown(cmd) => vec![
                TerminalLine::error(format!("Unknown command: {cmd}")),
                TerminalLine::info("Type 'help' for available commands"),
            ],
        }
    }
}

fn usage(usage: &'static str, example: &'static str) -> ParseError {
    ParseError::Usage { usage, example }
}

/// Interpret a typed value: things that look like JSON, booleans or numbers
/// are parsed, everything else stays a string.
pub fn infer_value(raw: &str) -> KvValue {
    let looks_structured = raw.starts_with('{')
        || raw.starts_with('[')
        || raw == "true"
        || raw == "false"
        || raw.trim().parse::<f64>().is_ok();
    if looks_structured {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            if let Some(value) = KvValue::from_json(value) {
                return value;
            }
        }
    }
    KvValue::String(raw.to_string())
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(input: &str) -> Result<Option<Command>, ParseError> {
    let words: Vec<&str> = input.split_whitespace().collect();
    let Some((&head, args)) = words.split_first() else {
        return Ok(None);
    };
    // Everything after the first `n` words, spacing collapsed.
    let rest = |n: usize| args[n.min(args.len())..].join(" ");

    let command = match head {
        "db" => Command::Db(parse_db(args, rest)?),
        "files" | "ls" => Command::Files,
        "open" => Command::Open(arg(args, 0, usage("open <file>", "open index.html"))?),
        "new" | "touch" => Command::New(arg(args, 0, usage("new <file>", "new app.py"))?),
        "rm" => Command::Remove(arg(args, 0, usage("rm <file>", "rm notes.txt"))?),
        "mv" => {
            let err = || usage("mv <from> <to>", "mv app.js main.js");
            Command::Rename {
                from: arg(args, 0, err())?,
                to: arg(args, 1, err())?,
            }
        }
        "cat" => Command::Cat(arg(args, 0, usage("cat <file>", "cat index.html"))?),
        "who" | "users" => Command::Who,
        "share" => Command::Share,
        "help" => Command::Help,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn arg(args: &[&str], index: usize, err: ParseError) -> Result<String, ParseError> {
    args.get(index).map(|s| s.to_string()).ok_or(err)
}

fn parse_db(args: &[&str], rest: impl Fn(usize) -> String) -> Result<DbCommand, ParseError> {
    let Some(&sub) = args.first() else {
        return Ok(DbCommand::Help);
    };
    let command = match sub {
        "set" => {
            if args.len() < 3 {
                return Err(usage("db set <key> <value>", "db set username \"John Doe\""));
            }
            DbCommand::Set {
                key: args[1].to_string(),
                value: infer_value(&rest(2)),
            }
        }
        "get" => DbCommand::Get(arg(args, 1, usage("db get <key>", "db get username"))?),
        "delete" | "del" => {
            DbCommand::Delete(arg(args, 1, usage("db delete <key>", "db delete username"))?)
        }
        "list" | "ls" => DbCommand::List,
        "push" => {
            if args.len() < 3 {
                return Err(usage("db push <array_key> <value>", "db push todos \"Buy milk\""));
            }
            DbCommand::Push {
                key: args[1].to_string(),
                value: infer_value(&rest(2)),
            }
        }
        "inc" | "increment" => {
            let err = || usage("db increment <key> [amount]", "db increment counter 5");
            let key = arg(args, 1, err())?;
            let amount = match args.get(2) {
                Some(raw) => raw.parse::<f64>().map_err(|_| err())?,
                None => 1.0,
            };
            DbCommand::Increment { key, amount }
        }
        "clear" => DbCommand::Clear {
            confirmed: matches!(args.get(1), Some(&"--yes") | Some(&"-y")),
        },
        "sql" => {
            let sql = rest(1);
            if sql.is_empty() {
                return Err(usage("db sql <statement>", "db sql SELECT * FROM kv_store"));
            }
            DbCommand::Sql(sql)
        }
        "export" => DbCommand::Export,
        "import" => {
            if args.len() < 4 {
                return Err(usage(
                    "db import <table> <key_column> <value_column>",
                    "db import products name price",
                ));
            }
            DbCommand::Import {
                table: args[1].to_string(),
                key_column: args[2].to_string(),
                value_column: args[3].to_string(),
            }
        }
        "help" => DbCommand::Help,
        other => return Err(ParseError::UnknownDb(other.to_string())),
    };
    Ok(command)
}

/// Parse and run one input line against `session`.
pub async fn run(session: &Session, input: &str) -> Vec<TerminalLine> {
    match parse(input) {
        Ok(Some(command)) => execute(session, command).await,
        Ok(None) => Vec::new(),
        Err(e) => e.to_lines(),
    }
}

pub async fn execute(session: &Session, command: Command) -> Vec<TerminalLine> {
    match command {
        Command::Db(DbCommand::Sql(sql)) => run_sql(session, &sql).await,
        Command::Db(db) => run_db(session, db)
            .await
            .unwrap_or_else(|e| vec![TerminalLine::error(format!("Database error: {e}"))]),
        other => run_general(session, other)
            .await
            .unwrap_or_else(|e| vec![TerminalLine::error(e.to_string())]),
    }
}

async fn run_db(session: &Session, command: DbCommand) -> Result<Vec<TerminalLine>, SyncError> {
    let kv = session.kv();
    let lines = match command {
        DbCommand::Set { key, value } => {
            let value = kv.set(&key, value).await?;
            vec![TerminalLine::info(format!("✓ Set {key} = {}", value.to_json()))]
        }
        DbCommand::Get(key) => match kv.get(&key).await? {
            Some(value) => vec![TerminalLine::log(format!("{key} = {}", value.to_json()))],
            None => vec![TerminalLine::warn(format!("Key \"{key}\" not found"))],
        },
        DbCommand::Delete(key) => {
            kv.delete(&key).await?;
            vec![TerminalLine::info(format!("✓ Deleted key \"{key}\""))]
        }
        DbCommand::List => {
            let entries = kv.list().await;
            if entries.is_empty() {
                vec![TerminalLine::log("NoSQL Database is empty")]
            } else {
                let mut lines = vec![TerminalLine::info(format!(
                    "NoSQL Database contains {} item{}:",
                    entries.len(),
                    if entries.len() == 1 { "" } else { "s" }
                ))];
                lines.extend(entries.iter().map(|(key, entry)| {
                    TerminalLine::log(format!(
                        "  {key} ({}) = {} [{}]",
                        entry.value.type_tag(),
                        entry.value.to_json(),
                        format_timestamp(entry.timestamp)
                    ))
                }));
                lines
            }
        }
        DbCommand::Push { key, value } => {
            let shown = value.to_json();
            kv.push(&key, value).await?;
            vec![TerminalLine::info(format!("✓ Pushed {shown} to array \"{key}\""))]
        }
        DbCommand::Increment { key, amount } => {
            let next = kv.increment(&key, amount).await?;
            vec![TerminalLine::info(format!(
                "✓ Incremented \"{key}\" to {}",
                KvValue::Number(next)
            ))]
        }
        DbCommand::Clear { confirmed: false } => vec![TerminalLine::log(
            "NoSQL database clear cancelled. Run 'db clear --yes' to remove all data",
        )],
        DbCommand::Clear { confirmed: true } => {
            let removed = kv.clear().await?;
            vec![TerminalLine::info(format!(
                "✓ Cleared NoSQL database ({removed} items removed)"
            ))]
        }
        DbCommand::Export => {
            let written = session.export_kv_to_sql().await?;
            vec![TerminalLine::info(format!(
                "✓ Exported {written} item(s) to SQL table \"{EXPORT_TABLE}\""
            ))]
        }
        DbCommand::Import {
            table,
            key_column,
            value_column,
        } => {
            let imported = session
                .import_sql_to_kv(&table, &key_column, &value_column)
                .await?;
            vec![TerminalLine::info(format!(
                "✓ Imported {imported} record(s) from SQL table \"{table}\""
            ))]
        }
        DbCommand::Help => db_help(),
        DbCommand::Sql(_) => Vec::new(),
    };
    Ok(lines)
}

async fn run_sql(session: &Session, sql: &str) -> Vec<TerminalLine> {
    let db = match session.sql() {
        Ok(db) => db,
        Err(_) => return vec![TerminalLine::error("SQL Database not available")],
    };
    if !db.state().is_ready() {
        return vec![TerminalLine::error(
            "SQL Database not ready. Please wait for initialization to complete.",
        )];
    }
    match db.query(sql).await {
        Ok(results) => format_results(&results),
        Err(e) => vec![TerminalLine::error(format!("SQL Error: {e}"))],
    }
}

pub fn format_results(results: &[QueryResult]) -> Vec<TerminalLine> {
    if results.is_empty() {
        return vec![TerminalLine::info("✓ SQL query executed successfully (no results)")];
    }
    let mut lines = Vec::new();
    for (index, result) in results.iter().enumerate() {
        let n = index + 1;
        if result.values.is_empty() {
            lines.push(TerminalLine::info(format!(
                "✓ SQL Result {n}: Query executed successfully"
            )));
            continue;
        }
        lines.push(TerminalLine::info(format!(
            "✓ SQL Result {n}: {} row(s)",
            result.values.len()
        )));
        lines.push(TerminalLine::log(format!("Columns: {}", result.columns.join(", "))));
        for (i, row) in result.values.iter().take(MAX_ROWS).enumerate() {
            let cells: Vec<String> = row.iter().map(format_cell).collect();
            lines.push(TerminalLine::log(format!("Row {}: {}", i + 1, cells.join(", "))));
        }
        if result.values.len() > MAX_ROWS {
            lines.push(TerminalLine::log(format!(
                "... and {} more rows",
                result.values.len() - MAX_ROWS
            )));
        }
    }
    lines
}

fn format_cell(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(r) => r.to_string(),
        SqlValue::Text(t) => t.clone(),
        SqlValue::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|at| at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn run_general(session: &Session, command: Command) -> Result<Vec<TerminalLine>, SyncError> {
    let files = session.files();
    let lines = match command {
        Command::Files => {
            let docs = files.documents();
            if docs.is_empty() {
                vec![TerminalLine::log("No files")]
            } else {
                let current = files.current().map(|doc| doc.name);
                docs.into_iter()
                    .map(|doc| {
                        let marker = if current.as_deref() == Some(doc.name.as_str()) { "*" } else { " " };
                        let editors: Vec<String> = session
                            .presence()
                            .editors_of(&doc.name)
                            .into_iter()
                            .map(|peer| peer.name)
                            .collect();
                        let mut line = format!("{marker} {} ({})", doc.name, doc.doc_type);
                        if !editors.is_empty() {
                            line.push_str(&format!(" editing: {}", editors.join(", ")));
                        }
                        TerminalLine::log(line)
                    })
                    .collect()
            }
        }
        Command::Open(name) => {
            let doc = session.open_document(&name).await?;
            vec![TerminalLine::info(format!("Opened {} ({})", doc.name, doc.doc_type))]
        }
        Command::New(name) => {
            let doc = files.create(&name, None).await?;
            vec![TerminalLine::info(format!("✓ Created {} ({})", doc.name, doc.doc_type))]
        }
        Command::Remove(name) => {
            files.delete(&name).await?;
            vec![TerminalLine::info(format!("✓ Deleted {name}"))]
        }
        Command::Rename { from, to } => {
            let doc = files.rename(&from, &to).await?;
            vec![TerminalLine::info(format!("✓ Renamed {from} to {}", doc.name))]
        }
        Command::Cat(name) => match files.document(&name) {
            Some(doc) => doc.content.lines().map(TerminalLine::log).collect(),
            None => vec![TerminalLine::warn(format!("File \"{name}\" not found"))],
        },
        Command::Who => {
            let me = session.presence().me().map(|peer| peer.id);
            let peers = session.presence().peers();
            let mut lines = vec![TerminalLine::info(format!("{} user(s) online", peers.len()))];
            lines.extend(peers.into_iter().map(|peer| {
                let you = if me.as_deref() == Some(peer.id.as_str()) { " (you)" } else { "" };
                let file = peer.active_file.as_deref().unwrap_or("-");
                TerminalLine::log(format!("  {}{you} {} {file}", peer.name, peer.color))
            }));
            lines
        }
        Command::Share => {
            let room = session.room();
            let mut lines = Vec::new();
            if !room.is_read_only() {
                lines.push(TerminalLine::log(format!("Collaborate: #{}", room.share_fragment())));
            }
            lines.push(TerminalLine::log(format!("View only:   #{}", room.view_fragment())));
            lines
        }
        Command::Help => help(),
        Command::Db(_) => Vec::new(),
    };
    Ok(lines)
}

fn help() -> Vec<TerminalLine> {
    vec![
        TerminalLine::info("Available commands:"),
        TerminalLine::log("  files                    List documents"),
        TerminalLine::log("  open <file>              Open a document"),
        TerminalLine::log("  new <file>               Create a document"),
        TerminalLine::log("  rm <file>                Delete a document"),
        TerminalLine::log("  mv <from> <to>           Rename a document"),
        TerminalLine::log("  cat <file>               Print a document"),
        TerminalLine::log("  who                      List users in the room"),
        TerminalLine::log("  share                    Show room links"),
        TerminalLine::log("  db help                  Show database help"),
    ]
}

fn db_help() -> Vec<TerminalLine> {
    vec![
        TerminalLine::info("CodeMate Database - Available Commands"),
        TerminalLine::info("Key-value operations:"),
        TerminalLine::log("  db set <key> <value>     Store a value"),
        TerminalLine::log("  db get <key>             Retrieve a value"),
        TerminalLine::log("  db delete <key>          Delete a key"),
        TerminalLine::log("  db list                  List all data"),
        TerminalLine::log("  db push <key> <value>    Add to array"),
        TerminalLine::log("  db increment <key> [n]   Increment number"),
        TerminalLine::log("  db clear --yes           Clear all data"),
        TerminalLine::info("SQL operations (SQLite):"),
        TerminalLine::log("  db sql SELECT * FROM kv_store      Run SQL query"),
        TerminalLine::log("  db sql CREATE TABLE ...            Create table"),
        TerminalLine::log("  db sql INSERT INTO ...             Insert data"),
        TerminalLine::info("Between the two:"),
        TerminalLine::log("  db export                          Copy key-value data to nosql_export"),
        TerminalLine::log("  db import <table> <key> <value>    Copy SQL rows to sql_<key>"),
    ]
}
