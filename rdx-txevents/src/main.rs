use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use txevents::prelude::*;

const DEFAULT_CONFIG: &str = "txevents.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // 2. Load the bus configuration (file is optional, env overrides apply).
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = BusConfig::load(Some(config_path.as_path()))?;
    info!(?config, "Configuration loaded");

    // 3. Create the bus and watch its system events.
    let bus = EventBus::new(config)?;
    spawn_system_event_logger(&bus);

    // 4. Register listeners for every phase, then close the startup window.
    let mails_sent = Arc::new(AtomicUsize::new(0));
    register_listeners(&bus, mails_sent.clone())?;
    bus.seal()?;

    let users = EntityLifecycleDispatcher::<User>::new(bus.clone()).with_timestamps();
    let mut store = MemoryStore::default();

    // 5. Walk through the scenarios.
    heading("publish outside a transaction");
    let mut ctx = ExecutionContext::new();
    bus.publish(
        &mut ctx,
        Event::new("system.heartbeat", ()).with_source(SourceRef::new("txdev", 0)),
    )?;

    heading("create a user and fill a cart, then commit");
    bus.begin(&mut ctx)?;
    let mut ada = User::new("ada@example.com");
    users.wrap_create(&mut ctx, &mut ada, |user| store.insert_user(user))?;
    let mut cart = Cart::new(store.next_id(), ada.id);
    let item = cart.add_item("book-042", 2);
    bus.publish(
        &mut ctx,
        Event::new("cart.item_added", item).with_source(SourceRef::new("cart", cart.id)),
    )?;
    let report = bus.scheduler().complete(&mut ctx, &mut store)?;
    summarize(&report);

    heading("create a blocked user, BEFORE_COMMIT vetoes it");
    bus.begin(&mut ctx)?;
    let mut mallory = User::new("mallory@blocked.test");
    users.wrap_create(&mut ctx, &mut mallory, |user| store.insert_user(user))?;
    let report = bus.scheduler().complete(&mut ctx, &mut store)?;
    summarize(&report);

    heading("update a user, storage fails to commit");
    bus.begin(&mut ctx)?;
    users.wrap_update(&mut ctx, &mut ada, |user| {
        user.email = "ada@lovelace.example".to_string();
        store.update_user(user)
    })?;
    store.fail_next_commit = true;
    let report = bus.scheduler().complete(&mut ctx, &mut store)?;
    summarize(&report);

    // 6. Give the ASYNC mailer a moment, then stop the workers.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(
        mails = mails_sent.load(Ordering::Relaxed),
        users = store.users.len(),
        "Demo finished"
    );
    bus.shutdown();

    Ok(())
}

fn heading(title: &str) {
    println!("\n{}", format!("== {title} ==").bold().cyan());
}

fn summarize(report: &CompletionReport) {
    let outcome = if report.committed() {
        report.outcome.to_string().green()
    } else {
        report.outcome.to_string().red()
    };
    println!(
        "{} {} ({} event(s), {} listener call(s))",
        report.transaction.to_string().bold(),
        outcome,
        report.events,
        report.invocations
    );
    if let Some(rejection) = &report.rejection {
        for failure in &rejection.failures {
            println!("  {} {}", "vetoed:".yellow(), failure);
        }
    }
    if let Some(error) = &report.commit_error {
        println!("  {} {}", "commit failed:".yellow(), error);
    }
}

fn spawn_system_event_logger(bus: &EventBus) {
    let mut system_rx = bus.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            info!("[SYSTEM] => {:?}", event);
        }
    });
}

/// Registers one listener per concern, across all phases.
fn register_listeners(bus: &EventBus, mails_sent: Arc<AtomicUsize>) -> Result<()> {
    bus.subscribe(Listener::sync(
        "heartbeat-log",
        "system.heartbeat",
        Phase::Immediate,
        |delivery| {
            info!(source = ?delivery.event().source(), "[IMMEDIATE] heartbeat");
            Ok(())
        },
    ))?;

    bus.subscribe(Listener::sync(
        "blocked-domain-check",
        "user.created",
        Phase::BeforeCommit,
        |delivery| {
            let changed = delivery
                .event()
                .payload::<EntityChanged<User>>()
                .ok_or_else(|| anyhow::anyhow!("unexpected payload"))?;
            if let Some(user) = &changed.after {
                if user.email.ends_with("@blocked.test") {
                    anyhow::bail!("{} is on a blocked domain", user.email);
                }
            }
            Ok(())
        },
    ))?;

    bus.subscribe(
        Listener::sync(
            "user-cache-invalidator",
            EventTypeMatcher::prefix("user."),
            Phase::AfterCommit,
            |delivery| {
                info!(source = ?delivery.event().source(), "[AFTER_COMMIT] cache entry evicted");
                Ok(())
            },
        )
        .priority(-10),
    )?;

    bus.subscribe(Listener::asynchronous(
        "welcome-mailer",
        "user.created",
        Phase::AfterCommit,
        move |delivery| {
            let mails_sent = mails_sent.clone();
            async move {
                let email = delivery
                    .event()
                    .payload::<EntityChanged<User>>()
                    .and_then(|changed| changed.after.as_ref())
                    .map(|user| user.email.clone())
                    .unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(50)).await;
                mails_sent.fetch_add(1, Ordering::Relaxed);
                info!(%email, "[ASYNC] welcome mail sent");
                anyhow::Ok(())
            }
        },
    ))?;

    bus.subscribe(Listener::sync(
        "cart-recalculator",
        EventTypeMatcher::prefix("cart."),
        Phase::AfterCommit,
        |delivery| {
            if let Some(item) = delivery.event().payload::<CartItem>() {
                info!(
                    cart = item.cart_id,
                    sku = %item.sku,
                    quantity = item.quantity,
                    "[AFTER_COMMIT] cart totals refreshed"
                );
            }
            Ok(())
        },
    ))?;

    bus.subscribe(Listener::sync(
        "rollback-alert",
        EventTypeMatcher::Any,
        Phase::AfterRollback,
        |delivery| {
            warn!(
                event_type = delivery.event().event_type(),
                transaction = ?delivery.event().transaction_id(),
                "[AFTER_ROLLBACK] discarded"
            );
            Ok(())
        },
    ))?;

    bus.subscribe(Listener::sync(
        "audit-trail",
        EventTypeMatcher::Any,
        Phase::AfterCompletion,
        |delivery| {
            info!(
                event_type = delivery.event().event_type(),
                outcome = ?delivery.outcome(),
                "[AFTER_COMPLETION] audited"
            );
            Ok(())
        },
    ))?;

    Ok(())
}

#[derive(Debug, Clone)]
struct User {
    id: u64,
    email: String,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl User {
    fn new(email: &str) -> Self {
        Self {
            id: 0,
            email: email.to_string(),
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for User {
    const KIND: &'static str = "user";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

impl Timestamped for User {
    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

/// Items refer back to their cart by id, not by pointer.
#[derive(Debug, Clone)]
struct CartItem {
    cart_id: u64,
    sku: String,
    quantity: u32,
}

#[derive(Debug)]
struct Cart {
    id: u64,
    owner: u64,
    items: Vec<CartItem>,
}

impl Cart {
    fn new(id: u64, owner: u64) -> Self {
        Self {
            id,
            owner,
            items: Vec::new(),
        }
    }

    /// Adds an item and sets its back-reference in one step, so the two
    /// sides of the relation cannot drift apart.
    fn add_item(&mut self, sku: &str, quantity: u32) -> CartItem {
        let item = CartItem {
            cart_id: self.id,
            sku: sku.to_string(),
            quantity,
        };
        self.items.push(item.clone());
        info!(cart = self.id, owner = self.owner, items = self.items.len(), "Item added to cart");
        item
    }
}

/// A toy store with a staging area that only becomes visible on commit.
#[derive(Default)]
struct MemoryStore {
    users: HashMap<u64, User>,
    staged: Vec<User>,
    last_id: u64,
    fail_next_commit: bool,
}

impl MemoryStore {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn insert_user(&mut self, user: &mut User) -> Result<()> {
        user.id = self.next_id();
        self.staged.push(user.clone());
        Ok(())
    }

    fn update_user(&mut self, user: &mut User) -> Result<()> {
        if !self.users.contains_key(&user.id) {
            anyhow::bail!("user {} does not exist", user.id);
        }
        self.staged.push(user.clone());
        Ok(())
    }
}

impl TransactionalResource for MemoryStore {
    fn commit(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_commit) {
            anyhow::bail!("simulated storage failure");
        }
        for user in self.staged.drain(..) {
            self.users.insert(user.id, user);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.staged.clear();
        Ok(())
    }
}
