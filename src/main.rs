use std::env;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use dues_ledger::config::{self, Config};
use dues_ledger::domain::{cycle, group, member, notification, obligation, DepositNotice};
use dues_ledger::{dashboard, db, fees, import, reminder, ReconciliationEngine};

fn main() -> Result<()> {
    config::init_tracing();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    if command == "help" || command == "--help" {
        print_usage();
        return Ok(());
    }

    let config = Config::from_env();
    let mut conn = db::open_database(&config.database_path)?;

    match command {
        "init" => run_init(&config),
        "demo" => run_demo(&mut conn),
        "add-group" => run_add_group(&conn, &args),
        "groups" => run_groups(&conn),
        "add-member" => run_add_member(&conn, &args),
        "update-member" => run_update_member(&conn, &args),
        "members" => run_members(&conn, &args),
        "remove-member" => run_remove_member(&conn, &args),
        "import-members" => run_import_members(&conn, &args),
        "open-cycle" => run_open_cycle(&conn, &args),
        "close-cycle" => run_close_cycle(&conn, &args),
        "ingest" => run_ingest(&mut conn, &args),
        "fees" => run_fees(&conn, &args),
        "dashboard" => run_dashboard(&conn, &args),
        "remind" => run_remind(&conn, &args),
        "log" => run_log(&conn, &args),
        other => {
            eprintln!("❌ Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("dues-ledger {} - dues tracking and deposit reconciliation", dues_ledger::VERSION);
    println!();
    println!("Usage: dues-ledger <command> [args]");
    println!();
    println!("  init                                     create the database file");
    println!("  demo                                     seed sample data and run sample notices");
    println!("  add-group <name> <fee> <account>         register a group");
    println!("  groups                                   list groups");
    println!("  add-member <group> <name> [email] [phone] [--admin]");
    println!("  update-member <member> <name> [email] [phone]");
    println!("  members <group>                          list a group's roster");
    println!("  remove-member <member>                   remove a member (admins refused)");
    println!("  import-members <group> <roster.csv>      bulk-enroll from CSV");
    println!("  open-cycle <group> <period> [due-date]   open a cycle and schedule dues");
    println!("  close-cycle <group>                      close the active cycle");
    println!("  ingest <json>                            ingest one deposit notice");
    println!("  fees <group> <period>                    per-member fee standing");
    println!("  dashboard <group>                        group collection dashboard");
    println!("  remind <group> <period>                  send reminders to unpaid members");
    println!("  log [limit]                              recent notifications");
    println!();
    println!("Database: $DUES_DB (default dues.db)");
}

fn require<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument: {}", what))
}

fn require_id(args: &[String], idx: usize, what: &str) -> Result<i64> {
    require(args, idx, what)?
        .parse::<i64>()
        .with_context(|| format!("{} must be a number", what))
}

fn parse_due_date(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(s) => {
            let parsed = DateTime::parse_from_rfc3339(s)
                .with_context(|| format!("due date must be RFC 3339, got {:?}", s))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
    }
}

// ============================================================================
// SETUP COMMANDS
// ============================================================================

fn run_init(config: &Config) -> Result<()> {
    println!("🔧 Database ready at {}", config.database_path.display());
    Ok(())
}

fn run_demo(conn: &mut Connection) -> Result<()> {
    println!("🌱 Seeding demo data...");

    let g = group::create(conn, "Hiking Club", 10000, "110-123-456789")?;
    member::add(conn, g.id, "Kim Minsu", Some("minsu@example.com"), Some("010-1111-2222"), true)?;
    member::add(conn, g.id, "Kim Minsu", Some("minsu2@example.com"), Some("010-3333-4444"), false)?;
    member::add(conn, g.id, "Lee Jung", Some("jung@example.com"), Some("010-5555-6666"), false)?;
    member::add(conn, g.id, "Park Soyeon", None, Some("010-7777-8888"), false)?;
    println!("✓ Group '{}' with 4 members (two share a name)", g.name);

    let c = cycle::open(conn, g.id, "2025-06")?;
    let due = Utc::now() + chrono::Duration::days(14);
    let scheduled = obligation::schedule_for_cycle(conn, g.id, &c.period, g.fee, Some(due))?;
    println!("✓ Cycle {} open, {} obligations scheduled", c.period, scheduled);

    let engine = ReconciliationEngine::new();
    let samples = [
        ("Kim Minsu", 10000),
        ("Lee Jung", 5000),
        ("Choi Stranger", 10000),
    ];
    println!("\n📬 Ingesting {} sample notices...", samples.len());
    for (payer, amount) in samples {
        let receipt = engine.ingest(
            conn,
            DepositNotice {
                payer_name: payer.to_string(),
                amount,
                destination_account: g.account_label.clone(),
                received_at: None,
            },
        )?;
        println!("  {} {} → {}", payer, amount, receipt.outcome.label());
    }

    println!("\n✓ Demo ready. Try: dues-ledger dashboard {}", g.id);
    Ok(())
}

// ============================================================================
// GROUP / MEMBER MANAGEMENT
// ============================================================================

fn run_add_group(conn: &Connection, args: &[String]) -> Result<()> {
    let name = require(args, 2, "group name")?;
    let fee = require_id(args, 3, "fee")?;
    let account = require(args, 4, "account label")?;

    let g = group::create(conn, name, fee, account)?;
    println!("✓ Group {} '{}' (fee {}, account {})", g.id, g.name, g.fee, g.account_label);
    Ok(())
}

fn run_groups(conn: &Connection) -> Result<()> {
    let groups = group::list(conn)?;
    if groups.is_empty() {
        println!("No groups yet. Add one with: dues-ledger add-group <name> <fee> <account>");
        return Ok(());
    }

    println!("{:<5} {:<24} {:>8}  {}", "ID", "NAME", "FEE", "ACCOUNT");
    for g in groups {
        println!("{:<5} {:<24} {:>8}  {}", g.id, g.name, g.fee, g.account_label);
    }
    Ok(())
}

fn run_add_member(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let name = require(args, 3, "member name")?;

    let positional: Vec<&str> = args[4..]
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "--admin")
        .collect();
    let email = positional.first().copied();
    let phone = positional.get(1).copied();
    let is_admin = args.iter().any(|a| a == "--admin");

    let m = member::add(conn, group_id, name, email, phone, is_admin)?;
    println!("✓ Member {} '{}'{}", m.id, m.name, if m.is_admin { " (admin)" } else { "" });
    Ok(())
}

fn run_update_member(conn: &Connection, args: &[String]) -> Result<()> {
    let member_id = require_id(args, 2, "member id")?;
    let name = require(args, 3, "member name")?;
    let email = args.get(4).map(String::as_str);
    let phone = args.get(5).map(String::as_str);

    let m = member::update(conn, member_id, name, email, phone)?;
    println!("✓ Member {} '{}' updated", m.id, m.name);
    Ok(())
}

fn run_members(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let roster = member::list_by_group(conn, group_id)?;

    println!("{:<5} {:<20} {:<26} {:<15} {}", "ID", "NAME", "EMAIL", "PHONE", "ROLE");
    for m in roster {
        println!(
            "{:<5} {:<20} {:<26} {:<15} {}",
            m.id,
            m.name,
            m.email.as_deref().unwrap_or("-"),
            m.phone.as_deref().unwrap_or("-"),
            if m.is_admin { "admin" } else { "member" }
        );
    }
    Ok(())
}

fn run_remove_member(conn: &Connection, args: &[String]) -> Result<()> {
    let member_id = require_id(args, 2, "member id")?;
    member::remove(conn, member_id)?;
    println!("✓ Member {} removed", member_id);
    Ok(())
}

fn run_import_members(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let path = require(args, 3, "roster file")?;

    println!("📥 Importing roster from {}...", path);
    let report = import::import_roster(conn, group_id, Path::new(path))?;

    println!("✓ {} rows: {} added, {} skipped", report.rows, report.added, report.skipped.len());
    for row in &report.skipped {
        println!("  line {}: {} ({})", row.line, row.name, row.reason);
    }
    Ok(())
}

// ============================================================================
// CYCLE MANAGEMENT
// ============================================================================

fn run_open_cycle(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let period = require(args, 3, "period")?;
    let due_date = parse_due_date(args.get(4).map(String::as_str))?;

    let g = match group::find_by_id(conn, group_id)? {
        Some(g) => g,
        None => bail!("group {} not found", group_id),
    };

    let c = cycle::open(conn, group_id, period)?;
    let scheduled = obligation::schedule_for_cycle(conn, group_id, period, g.fee, due_date)?;

    println!("✓ Cycle {} open for '{}', {} obligations at {} each", c.period, g.name, scheduled, g.fee);
    Ok(())
}

fn run_close_cycle(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;

    let active = match cycle::find_active(conn, group_id)? {
        Some(c) => c,
        None => bail!("group {} has no active cycle", group_id),
    };

    cycle::close(conn, active.id)?;
    println!("✓ Cycle {} closed", active.period);
    Ok(())
}

// ============================================================================
// RECONCILIATION + REPORTS
// ============================================================================

fn run_ingest(conn: &mut Connection, args: &[String]) -> Result<()> {
    let payload = require(args, 2, "notice JSON")?;
    let notice: DepositNotice =
        serde_json::from_str(payload).context("notice must be JSON: {\"payer_name\", \"amount\", \"destination_account\", \"received_at\"?}")?;

    let receipt = ReconciliationEngine::new().ingest(conn, notice)?;

    println!("✓ Notice recorded: {}", receipt.receipt);
    println!("  outcome: {}", receipt.outcome.label());
    println!("  detail:  {}", serde_json::to_string(&receipt.outcome)?);
    Ok(())
}

fn run_fees(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let period = require(args, 3, "period")?;

    let report = fees::report(conn, group_id, period, Utc::now())?;

    println!("📋 Fee standing for group {} - {}", group_id, report.period);
    println!("{:<5} {:<20} {:>8}  {:<8} {}", "ID", "NAME", "AMOUNT", "STATE", "PAID AT");
    for e in &report.entries {
        println!(
            "{:<5} {:<20} {:>8}  {:<8} {}",
            e.member_id,
            e.member_name,
            e.amount,
            e.state.as_str(),
            e.paid_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
        );
    }
    println!(
        "\n✓ {}/{} paid ({}%), {} overdue | collected {} of {}",
        report.paid_count,
        report.total_members,
        report.payment_rate,
        report.overdue_count,
        report.collected,
        report.expected
    );
    Ok(())
}

fn run_dashboard(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let d = dashboard::compute(conn, group_id, Utc::now())?;

    println!("📊 {} - {}", d.group_name, d.period.as_deref().unwrap_or("no active cycle"));
    println!("  members:   {}", d.total_members);
    println!("  paid:      {} | pending: {} | overdue: {}", d.paid_count, d.pending_count, d.overdue_count);
    println!("  collected: {}", d.collected);
    println!("  rate:      {}%", d.payment_rate);

    if !d.recent_payments.is_empty() {
        println!("  recent:");
        for p in &d.recent_payments {
            println!("    {} {} at {}", p.member_name, p.amount, p.paid_at.to_rfc3339());
        }
    }
    Ok(())
}

fn run_remind(conn: &Connection, args: &[String]) -> Result<()> {
    let group_id = require_id(args, 2, "group id")?;
    let period = require(args, 3, "period")?;

    println!("🔔 Reminding unpaid members of group {} for {}...", group_id, period);
    let report =
        reminder::remind_unpaid(conn, group_id, period, Utc::now(), &reminder::ConsoleSender)?;

    println!("✓ {} unpaid, {} reminded, {} skipped", report.considered, report.sent, report.skipped.len());
    for (member_id, reason) in &report.skipped {
        println!("  member {}: {}", member_id, reason);
    }
    Ok(())
}

fn run_log(conn: &Connection, args: &[String]) -> Result<()> {
    let limit = args
        .get(2)
        .map(|s| s.parse::<i64>().context("limit must be a number"))
        .transpose()?
        .unwrap_or(20);

    let notifications = notification::list_recent(conn, limit)?;
    if notifications.is_empty() {
        println!("No notifications yet.");
        return Ok(());
    }

    for n in notifications {
        let repeats = notification::count_by_fingerprint(conn, &n.fingerprint)?;
        let repeat_note = if repeats > 1 {
            format!("  (payload seen {}x)", repeats)
        } else {
            String::new()
        };
        let provenance = n
            .settled_obligation_id
            .map(|id| format!("settled obligation {}", id))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{}  {:<20} {:>8} → {:<16} {}{}",
            n.received_at.to_rfc3339(),
            n.payer_name,
            n.amount,
            n.destination_account,
            provenance,
            repeat_note
        );
    }
    Ok(())
}
