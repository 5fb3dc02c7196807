mod cli;
mod prompts;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crets_core::bridge::PendingRecord;
use crets_core::scope::parse_scoped_key;
use crets_core::{
    flatten_tree, generate_temporary_scope_id, get_settings_path, is_removed, Broadcaster,
    Catalog, Confirmer, ConsumeOutcome, Payload, PendingWatcher, Persistence, Requirement,
    RequirementEdit, ScopedStore, Settings, StaticHost, WorkItemSurface, PENDING_KEY,
};

use crate::cli::{CatalogCommand, Cli, Command, ConfigCommand, ItemCommand};
use crate::prompts::{confirm_action, FixedAnswer, TerminalConfirmer};

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let settings_path = match &cli.config {
        Some(path) => path.clone(),
        None => get_settings_path()?,
    };
    let settings = load_settings(&cli, &settings_path)?;

    if let Command::Config(config_cmd) = &cli.command {
        return handle_config_command(config_cmd, &settings, &settings_path);
    }

    let (persistence, availability) = Persistence::open_or_session(&settings);
    if let Some(banner) = availability.banner() {
        eprintln!("{}", banner.red().bold());
    }

    match &cli.command {
        Command::Catalog(catalog_cmd) => {
            handle_catalog_command(catalog_cmd, &Catalog::new(persistence))?;
        }
        Command::Apply { ids, json } => {
            publish_batch(&persistence, &settings, ids, *json)?;
        }
        Command::Item(item_cmd) => {
            handle_item_command(item_cmd, &cli, &persistence, &settings)?;
        }
        Command::Watch { yes, seconds } => {
            watch(&cli, &persistence, &settings, *yes, *seconds)?;
        }
        Command::Cleanup => {
            let removed = ScopedStore::new(persistence).cleanup_legacy_keys();
            println!("{} legacy key(s) removed", removed);
        }
        Command::Report => {
            print_store_report(&persistence);
        }
        // Handled before the store is opened
        Command::Config(_) => {}
    }

    Ok(())
}

/// Settings file, then command-line overrides
fn load_settings(cli: &Cli, path: &Path) -> Result<Settings> {
    let mut settings = Settings::load_or_default(path)?;
    if let Some(store) = &cli.store {
        settings.store_path = store.clone();
    }
    if cli.backend.is_some() {
        settings.backend = cli.backend;
    }
    Ok(settings)
}

/// Scope id selected on the command line
fn selected_scope(cli: &Cli) -> Result<String> {
    if cli.new_item {
        let id = generate_temporary_scope_id();
        println!("{} {}", "Using temporary work item id".yellow(), id);
        return Ok(id);
    }
    cli.work_item
        .clone()
        .context("No work item selected; pass --work-item <id> or --new")
}

fn selected_host(cli: &Cli) -> Result<StaticHost> {
    if cli.new_item {
        return Ok(StaticHost::new_item());
    }
    let id = cli
        .work_item
        .as_deref()
        .context("No work item selected; pass --work-item <id> or --new")?;
    Ok(StaticHost::existing(id))
}

fn handle_config_command(
    cmd: &ConfigCommand,
    settings: &Settings,
    settings_path: &Path,
) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            print!("{}", serde_yaml::to_string(settings)?);
        }
        ConfigCommand::Path => {
            println!("{}", settings_path.display());
        }
        ConfigCommand::Init { force } => {
            if settings_path.exists() && !force {
                bail!(
                    "Settings file {} already exists (use --force to overwrite)",
                    settings_path.display()
                );
            }
            settings.save(settings_path)?;
            println!(
                "{} {}",
                "Settings written to".green(),
                settings_path.display()
            );
        }
    }
    Ok(())
}

fn handle_catalog_command(cmd: &CatalogCommand, catalog: &Catalog) -> Result<()> {
    match cmd {
        CatalogCommand::List { tree } => {
            let entries = catalog.load();
            if entries.is_empty() {
                println!("{}", "Catalog is empty.".yellow());
                return Ok(());
            }
            if *tree {
                print_tree(&entries, &[], false);
            } else {
                println!("{:<14} | {:<10} | {}", "ID", "Parent", "Detail");
                println!("{}", "-".repeat(72));
                for req in &entries {
                    println!(
                        "{:<14} | {:<10} | {}",
                        req.code(),
                        req.parent_id.as_deref().unwrap_or("-"),
                        req.attrs.detail
                    );
                }
            }
        }
        CatalogCommand::Show { id } => {
            let req = catalog.get(id).context("Requirement not found")?;
            print_requirement(&req);
        }
        CatalogCommand::Import { file, yes } => {
            if !yes && !confirm_action("Replace the whole catalog with this file?")? {
                println!("{}", "Import cancelled.".yellow());
                return Ok(());
            }
            let count = catalog.import_file(file)?;
            println!("{} {} requirement(s)", "Imported".green(), count);
        }
        CatalogCommand::Add {
            id,
            detail,
            parent,
            justification,
            interactive,
        } => {
            let req = if *interactive || id.is_none() || detail.is_none() {
                crate::prompts::prompt_new_requirement(id.clone(), detail.clone(), parent.clone())?
            } else {
                let mut req = Requirement::new(
                    id.clone().unwrap_or_default(),
                    detail.clone().unwrap_or_default(),
                );
                if let Some(parent) = parent {
                    req = req.with_parent(parent.clone());
                }
                req.attrs.justification = justification.clone();
                req
            };
            let code = req.code().to_string();
            catalog.create(req)?;
            println!("{} {}", "Added".green(), code);
        }
        CatalogCommand::Edit {
            id,
            detail,
            justification,
            discussion,
        } => {
            if detail.is_none() && justification.is_none() && discussion.is_none() {
                bail!("Nothing to change; pass --detail, --justification or --discussion");
            }
            let mut req = catalog.get(id).context("Requirement not found")?;
            if let Some(detail) = detail {
                req.attrs.detail = detail.clone();
            }
            if let Some(justification) = justification {
                req.attrs.justification = Some(justification.clone());
            }
            if let Some(discussion) = discussion {
                req.attrs.discussion = Some(discussion.clone());
            }
            catalog.update(req)?;
            println!("{} {}", "Updated".green(), id);
        }
        CatalogCommand::Delete { id, yes } => {
            let req = catalog.get(id).context("Requirement not found")?;
            println!("{}", "Requirement to delete:".yellow());
            println!("  {} {}", req.code(), req.attrs.detail);

            if !yes
                && !confirm_action("Delete this requirement and everything below it?")?
            {
                println!("{}", "Deletion cancelled.".yellow());
                return Ok(());
            }
            let removed = catalog.delete(id)?;
            println!("{} {}", "Deleted:".green(), removed.join(", "));
        }
    }
    Ok(())
}

fn publish_batch(
    persistence: &Persistence,
    settings: &Settings,
    ids: &[String],
    json: bool,
) -> Result<()> {
    let catalog = Catalog::new(persistence.clone());
    let selected = catalog.select(ids)?;

    let broadcaster = Broadcaster::new(persistence.clone(), settings.source_tag.clone());
    let report = broadcaster.publish(&selected)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} {} requirement(s) as {}",
        "Published".green(),
        report.count,
        report.batch_key
    );
    if let Some(old) = &report.superseded {
        println!("{} {}", "Replaced unconsumed batch".yellow(), old);
    }
    println!(
        "Open a work item (crets item pending -w <id>) within {} seconds to apply it.",
        settings.stale_after_secs
    );
    Ok(())
}

fn handle_item_command(
    cmd: &ItemCommand,
    cli: &Cli,
    persistence: &Persistence,
    settings: &Settings,
) -> Result<()> {
    match cmd {
        ItemCommand::Show { all, json } => {
            let store = ScopedStore::with_scope(persistence.clone(), &selected_scope(cli)?);
            let applied = store.get_applied();
            let removed = store.get_removed();

            if *json {
                let visible = if *all { applied } else { store.visible() };
                println!("{}", serde_json::to_string_pretty(&visible)?);
                return Ok(());
            }
            if applied.is_empty() {
                println!("{}", "No requirements applied to this work item.".yellow());
                return Ok(());
            }
            print_tree(&applied, &removed, *all);
        }
        ItemCommand::Pending { yes, decline } => {
            let host = selected_host(cli)?;
            let mut confirmer = confirmer_for(*yes, *decline);
            let mut surface = WorkItemSurface::from_settings(persistence.clone(), settings);
            let report = surface.initialize(&host, confirmer.as_mut());

            if let Some(scope) = &report.scope {
                println!("{} {}", "Work item:".blue(), scope);
            }
            if report.legacy_keys_removed > 0 {
                println!("{} legacy key(s) cleaned up", report.legacy_keys_removed);
            }
            if !report.independent {
                println!("{}", "Warning: work item data is not fully isolated".yellow());
            }
            print_outcome(&report.pending);
        }
        ItemCommand::Edit {
            id,
            detail,
            justification,
            discussion,
        } => {
            let store = ScopedStore::with_scope(persistence.clone(), &selected_scope(cli)?);
            let edit = RequirementEdit {
                detail: detail.clone(),
                justification: justification.clone(),
                discussion: discussion.clone(),
            };
            let edited = store.apply_edit(id, &edit)?;
            println!("{} {} (local copy)", "Edited".green(), edited.code());
        }
        ItemCommand::Restore { id } => {
            let store = ScopedStore::with_scope(persistence.clone(), &selected_scope(cli)?);
            if store.restore(id)? {
                println!("{} {}", "Restored".green(), id);
            } else {
                println!("{} has no local edits", id);
            }
        }
        ItemCommand::Remove { id, yes } => {
            let store = ScopedStore::with_scope(persistence.clone(), &selected_scope(cli)?);
            if !yes && !confirm_action(&format!("Remove {} and everything below it?", id))? {
                println!("{}", "Removal cancelled.".yellow());
                return Ok(());
            }
            let before = store.get_removed().len();
            let removed = store.remove_cascade(id)?;
            println!(
                "{} {} requirement(s)",
                "Removed".green(),
                removed.len() - before
            );
        }
        ItemCommand::Verify => {
            let store = ScopedStore::with_scope(persistence.clone(), &selected_scope(cli)?);
            if store.verify_isolation() {
                println!("{}", "Work item data is isolated.".green());
            } else {
                println!("{}", "Work item data is NOT isolated.".red());
            }
            if let Some(report) = store.independence_report() {
                println!("{}: {}", "Own keys".blue(), report.own_keys.join(", "));
                println!("{}: {}", "Other items' keys".blue(), report.other_keys);
                println!("{}: {}", "Work items in store".blue(), report.scopes);
            }
        }
        ItemCommand::Save { permanent_id } => {
            let scope = selected_scope(cli)?;
            let mut surface = WorkItemSurface::from_settings(persistence.clone(), settings);
            surface.on_loaded(&scope);
            match surface.on_saved(permanent_id)? {
                Some(report) => println!(
                    "{} {} -> {} ({} applied, {} removed)",
                    "Migrated".green(),
                    scope,
                    permanent_id,
                    report.applied,
                    report.removed
                ),
                None => println!("Nothing to migrate for {}", scope),
            }
        }
        ItemCommand::Migrate { from, to } => {
            let mut store = ScopedStore::new(persistence.clone());
            let report = store.migrate_scope(from, to)?;
            println!(
                "{} {} -> {} ({} applied, {} removed)",
                "Migrated".green(),
                from,
                to,
                report.applied,
                report.removed
            );
        }
    }
    Ok(())
}

fn confirmer_for(yes: bool, decline: bool) -> Box<dyn Confirmer> {
    if yes {
        Box::new(FixedAnswer(true))
    } else if decline {
        Box::new(FixedAnswer(false))
    } else {
        Box::new(TerminalConfirmer)
    }
}

fn watch(
    cli: &Cli,
    persistence: &Persistence,
    settings: &Settings,
    yes: bool,
    seconds: Option<u64>,
) -> Result<()> {
    let host = selected_host(cli)?;
    let mut confirmer = confirmer_for(yes, false);
    let mut surface = WorkItemSurface::from_settings(persistence.clone(), settings);

    let report = surface.initialize(&host, confirmer.as_mut());
    let scope = report.scope.clone().unwrap_or_default();
    println!("{} {}", "Watching for batches for work item".blue(), scope);
    print_outcome(&report.pending);

    let watcher = PendingWatcher::start(persistence.clone(), settings.poll_interval());
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if let Some(record) = watcher.recv_timeout(Duration::from_millis(500)) {
            log::debug!("watcher reported {}", record.batch_key);
            let outcome = surface.check_pending(confirmer.as_mut());
            print_outcome(&outcome);
        }
        if !watcher.is_running() {
            bail!("Pending watcher stopped unexpectedly");
        }
    }

    surface.teardown();
    Ok(())
}

fn print_outcome(outcome: &ConsumeOutcome) {
    match outcome {
        ConsumeOutcome::NothingPending => println!("No pending batch."),
        ConsumeOutcome::Busy => println!("{}", "Another batch is being applied.".yellow()),
        ConsumeOutcome::Unscoped => {
            println!("{}", "No work item open; batch left for later.".yellow())
        }
        ConsumeOutcome::Stale => println!("{}", "Pending batch expired and was discarded.".yellow()),
        ConsumeOutcome::Incomplete => {
            println!("{}", "Pending batch was incomplete and was discarded.".yellow())
        }
        ConsumeOutcome::MissingPayload => {
            println!("{}", "Pending batch payload was missing.".yellow())
        }
        ConsumeOutcome::Declined => println!("Batch declined."),
        ConsumeOutcome::Applied { added, total } => println!(
            "{} {} new requirement(s); {} applied in total",
            "Applied".green(),
            added,
            total
        ),
        ConsumeOutcome::Failed { reason } => {
            println!("{} {}", "Failed to apply batch:".red(), reason)
        }
        ConsumeOutcome::Abandoned => println!("{}", "Work item closed.".yellow()),
        ConsumeOutcome::Refresh => {}
    }
}

fn print_tree(entries: &[Requirement], removed: &[String], show_removed: bool) {
    let hidden: &[String] = if show_removed { &[] } else { removed };
    for (req, depth) in flatten_tree(entries, hidden) {
        let mut line = format!(
            "{}{} {}",
            "  ".repeat(depth),
            req.code().bold(),
            req.attrs.detail
        );
        if req.is_modified {
            line.push_str(&format!(" {}", "(edited)".yellow()));
        }
        if show_removed && is_removed(removed, &req.id) {
            line = format!("{} {}", line.as_str().dimmed(), "(removed)".red());
        }
        println!("{}", line);
    }
}

fn print_requirement(req: &Requirement) {
    println!("{}: {}", "ID".blue(), req.code());
    if let Some(parent) = &req.parent_id {
        println!("{}: {}", "Parent".blue(), parent);
    }
    println!("{}: {}", "Detail".blue(), req.attrs.detail);
    if let Some(justification) = &req.attrs.justification {
        println!("{}: {}", "Justification".blue(), justification);
    }
    if let Some(discussion) = &req.attrs.discussion {
        println!("{}: {}", "Discussion".blue(), discussion);
    }
    if let Some(children) = req.children.as_deref().filter(|c| !c.is_empty()) {
        println!("{}: {}", "Children".blue(), children.join(", "));
    }
    if let Some(modified) = req.modified_date {
        println!(
            "{}: {}",
            "Edited".blue(),
            modified.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

fn print_store_report(persistence: &Persistence) {
    let mut scopes: BTreeMap<String, usize> = BTreeMap::new();
    let mut other = 0;
    for key in persistence.keys() {
        match parse_scoped_key(&key) {
            Some((scope, _)) => *scopes.entry(scope.to_string()).or_default() += 1,
            None => other += 1,
        }
    }

    println!("{}: {}", "Backend".blue(), persistence.backend_type());
    println!("{}: {}", "Work items".blue(), scopes.len());
    for (scope, keys) in &scopes {
        println!("  {:<32} {} key(s)", scope, keys);
    }
    println!("{}: {}", "Unscoped keys".blue(), other);

    match persistence.inspect::<PendingRecord>(PENDING_KEY) {
        Payload::Absent => println!("{}: none", "Pending batch".blue()),
        Payload::Valid(record) => println!(
            "{}: {} ({} requirement(s), from {})",
            "Pending batch".blue(),
            record.batch_key,
            record.count,
            record.source_tag
        ),
        Payload::Corrupt(reason) => {
            println!("{}: {} {}", "Pending batch".blue(), "corrupt".red(), reason)
        }
    }
}
