use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use txevents::prelude::*;
use txevents::{ENGINE_NAME, VERSION as LIB_VERSION};

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", "txshell".cyan().bold());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!("{}", "-".repeat(64).dimmed());
}

/// Storage stand-in whose next commit can be told to fail.
#[derive(Default)]
struct ScratchStore {
    fail_next_commit: bool,
    commits: usize,
    rollbacks: usize,
}

impl TransactionalResource for ScratchStore {
    fn commit(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_commit) {
            anyhow::bail!("commit failure requested from the shell");
        }
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.rollbacks += 1;
        Ok(())
    }
}

/// Registers the listeners the shell reports on: one printer per phase, a
/// BEFORE_COMMIT veto armed by `fail-next validate`, and an ASYNC notifier.
fn register_listeners(bus: &EventBus, veto_next: Arc<AtomicBool>) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for phase in Phase::ALL {
        let listener = Listener::sync(
            format!("print-{}", phase.as_str().to_lowercase()),
            EventTypeMatcher::Any,
            phase,
            |delivery| {
                let outcome = delivery
                    .outcome()
                    .map(|outcome| format!(" [{outcome}]"))
                    .unwrap_or_default();
                println!(
                    "<-- [{}] {}{}",
                    delivery.phase().to_string().green(),
                    delivery.event().event_type(),
                    outcome
                );
                Ok(())
            },
        );
        names.push(listener.name().to_string());
        bus.subscribe(listener)?;
    }

    let veto = Listener::sync("veto", EventTypeMatcher::Any, Phase::BeforeCommit, move |delivery| {
        if veto_next.swap(false, Ordering::Relaxed) {
            anyhow::bail!("veto armed for `{}`", delivery.event().event_type());
        }
        Ok(())
    })
    .priority(100);
    names.push(veto.name().to_string());
    bus.subscribe(veto)?;

    let notifier = Listener::asynchronous(
        "async-notifier",
        EventTypeMatcher::Any,
        Phase::AfterCommit,
        |delivery| async move {
            println!(
                "<-- [{}] {} delivered off-thread",
                "ASYNC".magenta(),
                delivery.event().event_type()
            );
            anyhow::Ok(())
        },
    );
    names.push(notifier.name().to_string());
    bus.subscribe(notifier)?;

    Ok(names)
}

fn print_report(report: &CompletionReport) {
    let outcome = if report.committed() {
        report.outcome.to_string().green().bold()
    } else {
        report.outcome.to_string().red().bold()
    };
    println!(
        "--> {} {} ({} event(s), {} listener call(s))",
        report.transaction, outcome, report.events, report.invocations
    );
    if let Some(rejection) = &report.rejection {
        for failure in &rejection.failures {
            println!("    {} {}", "vetoed:".yellow(), failure);
        }
    }
    if let Some(error) = &report.commit_error {
        println!("    {} {}", "commit failed:".yellow(), error);
    }
}

fn print_status(ctx: &ExecutionContext, store: &ScratchStore) {
    match ctx.current() {
        Some(tx) => {
            println!(
                "Transaction {} is {} (begun {}), {} pending event(s):",
                tx.id().to_string().bold(),
                tx.state().to_string().cyan(),
                tx.begun_at().format("%H:%M:%S%.3f"),
                tx.pending_len()
            );
            for pending in tx.pending() {
                println!(
                    "  {} (enqueued {})",
                    pending.event.event_type(),
                    pending.enqueued_at.format("%H:%M:%S%.3f")
                );
            }
        }
        None => println!("No transaction is active."),
    }
    println!(
        "Store: {} commit(s), {} rollback(s), next commit {}",
        store.commits,
        store.rollbacks,
        if store.fail_next_commit { "fails".red() } else { "succeeds".green() }
    );
}

fn print_help() {
    println!("Available commands:");
    println!("  begin                     - Starts a transaction.");
    println!("  publish <TYPE> [KIND#ID]  - Publishes an event (deferred inside a transaction).");
    println!("  commit                    - Runs BEFORE_COMMIT, commits, then the after phases.");
    println!("  rollback                  - Rolls the transaction back.");
    println!("  fail-next commit          - Makes the next storage commit fail.");
    println!("  fail-next validate        - Makes the next BEFORE_COMMIT run veto the commit.");
    println!("  status                    - Shows the current transaction and store.");
    println!("  listeners                 - Lists registered listeners.");
    println!("  exit                      - Quits the shell.");
}

fn parse_source(raw: &str) -> Option<SourceRef> {
    let (kind, id) = raw.split_once('#')?;
    Some(SourceRef::new(kind, id))
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let bus = EventBus::new(BusConfig::load(None)?)?;
    let veto_next = Arc::new(AtomicBool::new(false));
    let listener_names = register_listeners(&bus, veto_next.clone())?;
    bus.seal()?;
    info!("{} ready with {} listeners", ENGINE_NAME.cyan(), listener_names.len());

    let scheduler = bus.scheduler();
    let mut ctx = ExecutionContext::new();
    let mut store = ScratchStore::default();

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!("Type 'help' for commands or 'exit' to quit.");

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();

                let Some(command) = args.first() else {
                    continue;
                };
                match *command {
                    "begin" => match bus.begin(&mut ctx) {
                        Ok(id) => println!("--> Began {}", id.to_string().bold()),
                        Err(e) => println!("Error: {}", e),
                    },
                    "publish" => {
                        let Some(event_type) = args.get(1) else {
                            println!("Usage: publish <TYPE> [KIND#ID]");
                            continue;
                        };
                        let mut event = Event::new(*event_type, line.clone());
                        if let Some(raw) = args.get(2) {
                            match parse_source(raw) {
                                Some(source) => event = event.with_source(source),
                                None => {
                                    println!("Error: source must look like 'user#42'.");
                                    continue;
                                }
                            }
                        }
                        let deferred = ctx.in_transaction();
                        match bus.publish(&mut ctx, event) {
                            Ok(()) if deferred => println!("--> Queued '{}'", event_type),
                            Ok(()) => println!("--> Published '{}'", event_type),
                            Err(e) => println!("Error: {}", e),
                        }
                    }
                    "commit" => match scheduler.complete(&mut ctx, &mut store) {
                        Ok(report) => print_report(&report),
                        Err(e) => println!("Error: {}", e),
                    },
                    "rollback" => match scheduler.rollback(&mut ctx, &mut store) {
                        Ok(report) => print_report(&report),
                        Err(e) => println!("Error: {}", e),
                    },
                    "fail-next" => match args.get(1).copied() {
                        Some("commit") => {
                            store.fail_next_commit = true;
                            println!("--> The next commit will fail.");
                        }
                        Some("validate") => {
                            veto_next.store(true, Ordering::Relaxed);
                            println!("--> The next BEFORE_COMMIT run will veto.");
                        }
                        _ => println!("Usage: fail-next <commit|validate>"),
                    },
                    "status" => print_status(&ctx, &store),
                    "listeners" => {
                        println!("Registered Listeners:");
                        for name in &listener_names {
                            println!("  {}", name);
                        }
                    }
                    "help" => print_help(),
                    "exit" => break,
                    _ => println!("Unknown command: '{}'. Type 'help'.", line),
                }
            }
            Err(_) => break,
        }
    }

    println!("Exiting txshell...");
    bus.shutdown();
    Ok(())
}
