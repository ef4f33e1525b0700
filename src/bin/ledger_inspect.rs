//! Ledger Inspection Tool
//!
//! CLI tool to review client ledgers, audit entry histories, check the
//! aggregate/entry-sum invariant and read the cash journal without going
//! through an embedding application.
//!
//! Usage:
//!   cargo run --bin ledger_inspect -- clients --query ivan
//!   cargo run --bin ledger_inspect -- entries 42 --history
//!   cargo run --bin ledger_inspect -- reconcile --fix
//!   cargo run --bin ledger_inspect -- cashbook 2026-08-25 --filter expense

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use debtbook_backend::cashflow::CashBook;
use debtbook_backend::ledger::LedgerService;
use debtbook_backend::models::{Config, EntryOrder, FlowFilter};

/// Ledger Inspection Tool for the debtbook database
#[derive(Parser, Debug)]
#[command(name = "ledger_inspect")]
#[command(about = "Inspect client ledgers, audit histories and the cash journal")]
struct Cli {
    /// Path to the SQLite database (falls back to DEBTBOOK_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List clients, pinned first
    Clients {
        /// Substring to match against client names
        #[arg(short, long, default_value = "")]
        query: String,

        /// Include clients with a settled (zero) balance
        #[arg(long)]
        all: bool,
    },

    /// Show a client's ledger entries
    Entries {
        /// Client id to inspect
        client_id: i64,

        /// Only entries that are still valid
        #[arg(long)]
        valid_only: bool,

        /// Print each entry's audit history
        #[arg(long)]
        history: bool,
    },

    /// List employees
    Employees,

    /// Check every client's aggregate against its valid-entry sum
    Reconcile {
        /// Rewrite drifted aggregates to the entry sums
        #[arg(long)]
        fix: bool,
    },

    /// Show the cash journal for one day (defaults to today, UTC)
    Cashbook {
        /// Day to show, YYYY-MM-DD
        date: Option<String>,

        /// all, income or expense
        #[arg(long, default_value = "all")]
        filter: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("debtbook_backend=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.db_path {
        config.database_path = path;
    }

    println!("Database: {}", config.database_path);
    println!();

    match cli.command {
        Commands::Clients { query, all } => {
            let service = LedgerService::new(&config)?;
            list_clients(&service, &query, all).await?;
        }
        Commands::Entries {
            client_id,
            valid_only,
            history,
        } => {
            let service = LedgerService::new(&config)?;
            show_entries(&service, client_id, valid_only, history).await?;
        }
        Commands::Employees => {
            let service = LedgerService::new(&config)?;
            list_employees(&service).await?;
        }
        Commands::Reconcile { fix } => {
            let service = LedgerService::new(&config)?;
            run_reconcile(&service, fix).await?;
        }
        Commands::Cashbook { date, filter } => {
            let book = CashBook::new(&config.database_path, config.busy_timeout_ms)?;
            let day = match date {
                Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))?,
                None => Utc::now().date_naive(),
            };
            let filter = FlowFilter::from_str(&filter)
                .context("filter must be all, income or expense")?;
            show_cashbook(&book, day, filter).await?;
        }
    }

    Ok(())
}

async fn list_clients(service: &LedgerService, query: &str, all: bool) -> Result<()> {
    println!("=== Clients ===\n");

    let clients = service.search_clients(query, all, 500).await?;
    if clients.is_empty() {
        println!("No matching clients.");
        return Ok(());
    }

    println!(
        "{:>6} {:<24} {:>12} {:>7} {:>20} {:<16}",
        "ID", "Name", "Balance", "Pinned", "Last Activity", "Phone"
    );
    println!("{}", "-".repeat(90));

    for c in clients {
        println!(
            "{:>6} {:<24} {:>12} {:>7} {:>20} {:<16}",
            c.id,
            c.name,
            c.balance,
            if c.pinned { "yes" } else { "" },
            c.last_activity.format("%Y-%m-%d %H:%M:%S"),
            c.phone,
        );
    }
    Ok(())
}

async fn show_entries(
    service: &LedgerService,
    client_id: i64,
    valid_only: bool,
    history: bool,
) -> Result<()> {
    let client = service.get_client(client_id).await?;
    println!(
        "=== Ledger of client {} ({}) - balance {} ===\n",
        client.id, client.name, client.balance
    );

    let entries = service
        .list_entries(client_id, valid_only, EntryOrder::Chronological)
        .await?;
    if entries.is_empty() {
        println!("No entries.");
        return Ok(());
    }

    println!(
        "{:>6} {:>20} {:>10} {:>10} {:<18} {:>9} {:>20}",
        "ID", "Created", "Value", "Original", "State", "Employee", "Repaid"
    );
    println!("{}", "-".repeat(100));

    for e in &entries {
        println!(
            "{:>6} {:>20} {:>10} {:>10} {:<18} {:>9} {:>20}",
            e.id,
            e.created_at.format("%Y-%m-%d %H:%M:%S"),
            e.value,
            e.original_value,
            e.state().as_str(),
            e.employee_id,
            e.repaid_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if history {
            for line in e.history.lines() {
                println!("         | {}", line);
            }
        }
    }

    let valid_sum: i64 = entries
        .iter()
        .filter(|e| e.is_valid)
        .map(|e| e.value)
        .sum();
    if !valid_only {
        println!("\nValid entry sum: {}", valid_sum);
        if valid_sum != client.balance {
            println!(
                "WARNING: aggregate {} != entry sum {} (run reconcile)",
                client.balance, valid_sum
            );
        }
    }
    Ok(())
}

async fn list_employees(service: &LedgerService) -> Result<()> {
    println!("=== Employees ===\n");

    let employees = service.list_employees().await?;
    if employees.is_empty() {
        println!("No employees.");
        return Ok(());
    }

    println!("{:>6} {:<24} {:>20}", "ID", "Name", "Created");
    println!("{}", "-".repeat(54));
    for e in employees {
        println!(
            "{:>6} {:<24} {:>20}",
            e.id,
            e.name,
            e.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_reconcile(service: &LedgerService, fix: bool) -> Result<()> {
    println!("=== Reconciliation ===\n");

    let reports = service.reconcile(fix).await?;
    if reports.is_empty() {
        println!("All client aggregates match their valid-entry sums.");
        return Ok(());
    }

    println!(
        "{:>6} {:<24} {:>12} {:>12} {:>12}",
        "ID", "Name", "Balance", "Entry Sum", "Drift"
    );
    println!("{}", "-".repeat(72));
    for r in &reports {
        println!(
            "{:>6} {:<24} {:>12} {:>12} {:>12}",
            r.client_id, r.name, r.balance, r.entry_sum, r.drift
        );
    }

    if fix {
        println!("\n{} aggregate(s) rewritten to the entry sums.", reports.len());
    } else {
        println!("\n{} drifted client(s). Re-run with --fix to repair.", reports.len());
    }
    Ok(())
}

async fn show_cashbook(book: &CashBook, day: NaiveDate, filter: FlowFilter) -> Result<()> {
    println!("=== Cash journal {} ({}) ===\n", day, filter.as_str());

    let flows = book.entries_for_day(day, filter).await?;
    if flows.is_empty() {
        println!("No journal lines.");
    } else {
        println!("{:>6} {:>20} {:>10}  {}", "ID", "Time", "Amount", "Description");
        println!("{}", "-".repeat(70));
        for f in &flows {
            println!(
                "{:>6} {:>20} {:>10}  {}",
                f.id,
                f.created_at.format("%Y-%m-%d %H:%M:%S"),
                f.amount,
                f.description
            );
        }
    }

    let totals = book.day_totals(day).await?;
    println!(
        "\nIncome: {}   Expense: {}   Net: {}",
        totals.income, totals.expense, totals.net
    );
    Ok(())
}
