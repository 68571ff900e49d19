//! Tandem CLI Client
//!
//! Interactive editor for a shared Tandem document.
//!
//! # Usage
//!
//! ```bash
//! # Join the default document on a local server
//! tandem
//!
//! # Join a named document on a remote server
//! tandem --url ws://example.com:7070 --doc notes:today --name Ada
//!
//! # Execute single command and exit
//! tandem -c "append hello"
//! ```

mod command;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::runtime::Runtime;

use tandem_client::{ClientConfig, ClientHandle, Snapshot, SurfaceEvent, SyncClient, WebSocketTransport};
use tandem_core::{author_color, AuthorPatch, DocumentName};
use tandem_protocol::Codec;

use crate::command::{delete_step, Command};

/// Tandem Command Line Interface
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(author, version, about = "Tandem CLI - collaborative text editing client")]
struct Args {
    /// Server WebSocket URL
    #[arg(short, long, default_value = "ws://127.0.0.1:7070", env = "TANDEM_URL")]
    url: String,

    /// Document to join
    #[arg(short, long, default_value = "scratch", env = "TANDEM_DOC")]
    doc: String,

    /// Display name announced to collaborators
    #[arg(short, long, env = "TANDEM_NAME")]
    name: Option<String>,

    /// Use MessagePack frames instead of JSON
    #[arg(long)]
    msgpack: bool,

    /// Execute command and exit
    #[arg(short, long)]
    command: Option<String>,

    /// Quiet mode (no banner, no collaborator notices)
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let runtime = Runtime::new()?;
    let doc = DocumentName::new(args.doc.clone())?;
    let codec = if args.msgpack { Codec::MessagePack } else { Codec::Json };

    let transport = runtime
        .block_on(WebSocketTransport::connect(&args.url))
        .with_context(|| format!("Failed to connect to {}", args.url))?;

    let client = {
        let _guard = runtime.enter();
        let (client, events, task) = SyncClient::spawn(transport, ClientConfig::new(doc.clone()).with_codec(codec));
        if !args.quiet {
            runtime.spawn(print_events(events));
        }
        runtime.spawn(async move {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => eprintln!("\n{} {}", "Disconnected:".red(), e),
                Err(e) => eprintln!("\n{} {}", "Client task failed:".red(), e),
            }
        });
        client
    };

    let snapshot = runtime
        .block_on(wait_joined(&client))
        .context("Server did not send the document")?;

    if let Some(name) = &args.name {
        client.change_author(AuthorPatch {
            name: Some(name.clone()),
            color: None,
        })?;
    }

    if !args.quiet {
        println!(
            "{}",
            format!(
                r#"
  ╔╦╗  CLI
   ║   Editing '{}' on {} as author {}
   ╩   Type 'help' for commands, 'quit' to exit
"#,
                doc,
                args.url,
                snapshot.author_id.unwrap_or_default()
            )
            .cyan()
        );
    }

    // Single command mode
    if let Some(line) = args.command {
        let result = execute(&runtime, &client, &line);
        runtime.block_on(shutdown(&client));
        return result.map(|_| ());
    }

    let mut rl = DefaultEditor::new()?;
    let history_path = home_dir().map(|p| p.join(".tandem_history")).unwrap_or_default();
    let _ = rl.load_history(&history_path);

    loop {
        let prompt = format!("{}> ", doc.as_str().green());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match execute(&runtime, &client, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        eprintln!("{} {}", "Error:".red(), e);
                        if client.snapshot_blocking(&runtime).is_err() {
                            eprintln!("{}", "Connection lost.".red());
                            break;
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    runtime.block_on(shutdown(&client));
    Ok(())
}

trait BlockingSnapshot {
    fn snapshot_blocking(&self, runtime: &Runtime) -> Result<Snapshot>;
}

impl BlockingSnapshot for ClientHandle {
    fn snapshot_blocking(&self, runtime: &Runtime) -> Result<Snapshot> {
        Ok(runtime.block_on(self.snapshot())?)
    }
}

/// Run one REPL line. Returns false when the session should end.
fn execute(runtime: &Runtime, client: &ClientHandle, line: &str) -> Result<bool> {
    let command = Command::parse(line).map_err(|e| anyhow::anyhow!(e))?;

    match command {
        Command::Show => {
            let snapshot = client.snapshot_blocking(runtime)?;
            print_text(&snapshot);
        }
        Command::Status => {
            let snapshot = client.snapshot_blocking(runtime)?;
            println!(
                "{} {}  {} {}  {} {}",
                "history:".yellow(),
                snapshot.history.end(),
                "committed:".yellow(),
                snapshot.commit_length,
                "sent:".yellow(),
                snapshot.sent_length
            );
        }
        Command::Authors => {
            let snapshot = client.snapshot_blocking(runtime)?;
            for (id, author) in &snapshot.authors {
                let me = if Some(*id) == snapshot.author_id { " (you)" } else { "" };
                let selection = snapshot
                    .selections
                    .get(id)
                    .map(|s| format!(" at {}..{}", s.anchor, s.head))
                    .unwrap_or_default();
                println!("{}) {} {}{}{}", id, author.name.bold(), author.color.dimmed(), selection, me);
            }
        }
        Command::Insert { pos, text } => client.insert(pos, text)?,
        Command::Append(text) => {
            let snapshot = client.snapshot_blocking(runtime)?;
            client.insert(snapshot.text.chars().count(), text)?;
        }
        Command::Delete { pos, len } => {
            let snapshot = client.snapshot_blocking(runtime)?;
            let step = delete_step(&snapshot.text, pos, len).map_err(|e| anyhow::anyhow!(e))?;
            client.edit(vec![step])?;
        }
        Command::Select(selection) => client.select(selection)?,
        Command::Name(name) => client.change_author(AuthorPatch {
            name: Some(name),
            color: None,
        })?,
        Command::Color(color) => client.change_author(AuthorPatch {
            name: None,
            color: Some(color),
        })?,
        Command::Help => print_help(),
        Command::Clear => print!("\x1B[2J\x1B[1;1H"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

async fn wait_joined(client: &ClientHandle) -> Result<Snapshot> {
    let wait = async {
        loop {
            let snapshot = client.snapshot().await?;
            if snapshot.initialized {
                return Ok::<_, anyhow::Error>(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await?
}

/// Flush pending edits and give the server a moment to confirm them
async fn shutdown(client: &ClientHandle) {
    let settle = async {
        while let Ok(snapshot) = client.snapshot().await {
            if snapshot.is_settled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), settle).await;
    let _ = client.shutdown();
}

async fn print_events(mut events: tokio::sync::mpsc::UnboundedReceiver<SurfaceEvent>) {
    let mut known: std::collections::BTreeMap<u32, tandem_core::AuthorData> = std::collections::BTreeMap::new();
    while let Some(event) = events.recv().await {
        if let SurfaceEvent::AuthorsChanged(authors) = event {
            for (id, author) in &authors {
                if !known.contains_key(id) {
                    println!("{}", format!("* {} joined", author.name).dimmed());
                }
            }
            for (id, author) in &known {
                if !authors.contains_key(id) {
                    println!("{}", format!("* {} left", author.name).dimmed());
                }
            }
            known = authors;
        }
    }
}

fn print_text(snapshot: &Snapshot) {
    if snapshot.text.is_empty() {
        println!("{}", "(empty)".dimmed());
        return;
    }
    // Mark collaborator carets in the text
    let mut carets: Vec<(usize, u32)> = snapshot
        .selections
        .iter()
        .map(|(id, selection)| (selection.head, *id))
        .collect();
    carets.sort();

    let mut out = String::new();
    let mut next = carets.iter().peekable();
    for (i, c) in snapshot.text.chars().enumerate() {
        while let Some((_, id)) = next.next_if(|(pos, _)| *pos == i) {
            out.push_str(&caret(*id));
        }
        out.push(c);
    }
    for (_, id) in next {
        out.push_str(&caret(*id));
    }
    println!("{}", out);
}

fn caret(author_id: u32) -> String {
    let hex = author_color(author_id).trim_start_matches('#');
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2).unwrap_or("ff"), 16).unwrap_or(255);
    "|".truecolor(channel(0), channel(2), channel(4)).bold().to_string()
}

fn print_help() {
    println!(
        r#"
{}

{}
  insert <pos> <text>                    Insert text at a character offset
  append <text>                          Insert text at the end
  delete <pos> <len>                     Delete characters
  select <anchor> [head]                 Move your cursor or selection

{}
  show                                   Print the document
  status                                 History and confirmation watermarks
  authors                                List active collaborators

{}
  name <name>                            Change your display name
  color <#rrggbb>                        Change your color

{}
  help                                   Show this help
  clear                                  Clear screen
  quit/exit                              Exit CLI
"#,
        "Tandem Commands".cyan().bold(),
        "Editing".yellow().bold(),
        "Viewing".yellow().bold(),
        "Identity".yellow().bold(),
        "Local".yellow().bold(),
    );
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
