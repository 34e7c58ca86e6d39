//! cycle-runner: headless runner for the billing reconciliation engine.
//!
//! Usage:
//!   cycle-runner --db billing.db --data-dir ./data
//!   cycle-runner --db billing.db --date 2026-04-16
//!   cycle-runner --db billing.db --drain 200
//!   cycle-runner --db billing.db --ipc-mode < commands.jsonl

use anyhow::{Context, Result};
use chrono::NaiveDate;
use netbill_core::{
    clock::{Clock, FixedClock, SystemClock},
    command::{execute, CommandResponse, LedgerCommand},
    config::BillingConfig,
    network::ServiceEnforcer,
    scope::BillingScope,
    store::BillingStore,
    CycleReport, ReconciliationEngine,
};
use std::env;
use std::io::{self, BufRead, Write};

#[derive(serde::Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Control {
    Quit,
    CheckInvariant,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum IpcLine {
    Control(Control),
    Command(LedgerCommand),
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = flag_value(&args, "--db").unwrap_or("billing.db");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");
    let date = flag_value(&args, "--date")
        .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
        .transpose()
        .context("--date must be YYYY-MM-DD")?;
    let drain = flag_value(&args, "--drain")
        .map(str::parse::<usize>)
        .transpose()
        .context("--drain must be a number")?;

    if !ipc_mode {
        println!("netbill cycle-runner");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        if let Some(date) = date {
            println!("  date:      {date}");
        }
        println!();
    }

    let config = BillingConfig::load(data_dir)
        .with_context(|| format!("loading configuration from {data_dir}"))?;
    let store = BillingStore::open(db)?;
    store.migrate()?;

    let clock: Box<dyn Clock> = match date {
        Some(date) => Box::new(FixedClock::on(date)),
        None => Box::new(SystemClock),
    };
    // Vendor integrations are linked in by the deploying application; the
    // runner only logs the device actions it would take.
    let mut engine = ReconciliationEngine::build(store, config, clock, ServiceEnforcer::dry_run());

    if ipc_mode {
        return run_ipc_loop(&mut engine);
    }

    if let Some(limit) = drain {
        let report = engine.drain_pending_operations(limit)?;
        println!(
            "Drained {} queued operations: {} done, {} still queued",
            report.attempted, report.succeeded, report.failed
        );
        return Ok(());
    }

    let report = engine.run_daily_cycle(&BillingScope::all())?;
    print_summary(&report);
    let broken = engine.invariant_violations()?;
    if !broken.is_empty() {
        log::warn!("Balance invariant broken for {} subscribers", broken.len());
        println!("  invariant violations: {}", broken.join(", "));
    }
    Ok(())
}

fn run_ipc_loop(engine: &mut ReconciliationEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let line: IpcLine = match serde_json::from_str(&buffer) {
            Ok(l) => l,
            Err(e) => {
                let err_json = serde_json::json!({ "ok": false, "code": "BAD_REQUEST", "message": e.to_string() });
                writeln!(stdout, "{err_json}")?;
                stdout.flush()?;
                continue;
            }
        };

        let response = match line {
            IpcLine::Control(Control::Quit) => break,
            IpcLine::Control(Control::CheckInvariant) => CommandResponse::from_result(
                engine
                    .invariant_violations()
                    .map(|broken| serde_json::json!({ "violations": broken })),
            ),
            IpcLine::Command(command) => CommandResponse::from_result(execute(engine, command)),
        };
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }
    Ok(())
}

fn print_summary(report: &CycleReport) {
    println!("Cycle {} for {}", report.run_id, report.date);
    println!("  invoices issued:    {}", report.invoices_issued);
    println!("  invoices promoted:  {}", report.invoices_promoted);
    println!("  prorated:           {}", report.prorated);
    println!("  suspended:          {}", report.suspended);
    println!("  restored:           {}", report.restored);
    println!("  corrected:          {}", report.corrected);
    println!("  promises broken:    {}", report.promises_broken);
    println!("  frozen (skipped):   {}", report.skipped_frozen);
    println!("  device deferred:    {}", report.device_deferred);
    println!("  errors:             {}", report.error_count);
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
