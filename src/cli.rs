use crate::{
    analysis::FullAnalysis,
    config::{DataPaths, Settings},
    context::Workspace,
    correct::CorrectionResult,
    diagnose::Violation,
    item::{extract_item_id, tag_labels, TreeFilters},
    logging,
    missing::MissingReport,
    report::render_html,
    rules::{RuleList, RuleSet},
    store::CacheListing,
    translations::TranslationMatch,
    tree::{render_dot, render_text, TreeNode},
    worker::{Selection, Task, TaskResult, Worker, WorkerEvent},
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::PathBuf,
};
use tracing::{debug, info};

/// Dependency analysis and load order repair for Mod Organizer profiles
#[derive(Parser)]
#[command(name = "modorder")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding settings, rules, cache and log
    #[arg(long, global = true, env = "MODORDER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Mod Organizer instance directory (overrides instance_dir in settings)
    #[arg(long, global = true)]
    instance: Option<PathBuf>,

    /// Mod Organizer profile name
    #[arg(long, global = true)]
    profile: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable verbose logging (sets log level to DEBUG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the requirement tree of one item
    Tree(TreeArgs),
    /// Build the dependency network and report missing requirements and load order
    Analyze(AnalyzeArgs),
    /// List requirements placed after the mods that need them
    Diagnose,
    /// Propose (and optionally apply) a load order that fixes violations
    Correct(CorrectArgs),
    /// Find translations of installed mods that are not installed
    Translations {
        /// Language to look for, matched as a case-insensitive substring
        language: String,
        /// Show when the original mod was updated instead of the translation
        #[arg(long)]
        original_dates: bool,
    },
    /// Inspect or prune the metadata cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Inspect or edit rules.toml
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Print effective settings and file locations
    Settings,
}

#[derive(Args)]
struct TreeArgs {
    /// Item id or mod page URL
    item: String,
    #[arg(long)]
    hide_vr: bool,
    #[arg(long)]
    hide_optional: bool,
    #[arg(long)]
    hide_recommended: bool,
    /// Also write the tree as Graphviz source
    #[arg(long, value_name = "FILE")]
    dot: Option<PathBuf>,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Skip the load order check
    #[arg(long)]
    no_diagnose: bool,
    /// Write the full analysis as JSON
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,
    /// Write a standalone HTML report
    #[arg(long, value_name = "FILE")]
    export_html: Option<PathBuf>,
}

#[derive(Args)]
struct CorrectArgs {
    /// Violation to fix, as "DEPENDENT=>PROVIDER" folder names (repeatable)
    #[arg(long = "select", value_name = "DEP=>PROVIDER")]
    select: Vec<String>,
    /// Fix every current violation
    #[arg(long, conflicts_with = "select")]
    all: bool,
    /// Write the proposed order to modlist.txt (previous file kept as modlist.txt.bak)
    #[arg(long)]
    apply: bool,
}

#[derive(Subcommand)]
enum CacheAction {
    List,
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Clear,
}

#[derive(Subcommand)]
enum RulesAction {
    Show,
    Add {
        #[arg(value_enum)]
        list: RuleListArg,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Replace {
        old: String,
        new: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RuleListArg {
    Ignore,
    IgnoreRequirementsOf,
}

impl From<RuleListArg> for RuleList {
    fn from(value: RuleListArg) -> Self {
        match value {
            RuleListArg::Ignore => RuleList::Ignore,
            RuleListArg::IgnoreRequirementsOf => RuleList::IgnoreRequirementsOf,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    let log = logging::init(cli.verbose, &paths.log())?;
    let settings = Settings::load_or_create(&paths.settings())?;
    log.apply_level(&settings.log_level);
    debug!("data dir {}", paths.data_dir.display());

    let workspace = Workspace::new(paths, settings, cli.instance, cli.profile);
    let format = cli.format;
    match cli.command {
        Commands::Tree(args) => run_tree(&workspace, args, format),
        Commands::Analyze(args) => run_analyze(&workspace, args, format),
        Commands::Diagnose => run_diagnose(&workspace, format),
        Commands::Correct(args) => run_correct(&workspace, args, format),
        Commands::Translations {
            language,
            original_dates,
        } => run_translations(&workspace, &language, original_dates, format),
        Commands::Cache { action } => run_cache(&workspace, action, format),
        Commands::Rules { action } => run_rules(&workspace, action, format),
        Commands::Settings => print_settings(&workspace, format),
    }
}

/// Runs one task on the background worker and waits for its terminal event.
fn run_task(workspace: &Workspace, task: Task) -> Result<Option<TaskResult>> {
    let worker = Worker::spawn(workspace.clone(), workspace.open_store()?);
    worker.submit(task)?;
    let event = worker.wait(|line| info!("{line}"));
    worker.shutdown();
    match event {
        WorkerEvent::Completed(result) => Ok(Some(result)),
        WorkerEvent::Cancelled => {
            eprintln!("Cancelled.");
            Ok(None)
        }
        WorkerEvent::Failed(error) => bail!(error),
        WorkerEvent::Progress(_) => Ok(None),
    }
}

fn run_tree(workspace: &Workspace, args: TreeArgs, format: OutputFormat) -> Result<()> {
    let Some(id) = extract_item_id(&args.item) else {
        bail!("{} is not an item id or mod page URL", args.item);
    };
    let filters = TreeFilters {
        hide_vr: args.hide_vr,
        hide_optional: args.hide_optional,
        hide_recommended: args.hide_recommended,
    };
    let Some(TaskResult::Tree(root)) = run_task(workspace, Task::AnalyzeItem { id: id.clone(), filters })?
    else {
        return Ok(());
    };
    let Some(root) = root else {
        println!("Item {id} is on the ignore list.");
        return Ok(());
    };
    if let Some(path) = &args.dot {
        fs::write(path, render_dot(&root))
            .with_context(|| format!("write {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    print_tree(&root, format)
}

fn print_tree(root: &TreeNode, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(root)?),
        OutputFormat::Text => {
            print!("{}", render_text(root));
            if root.is_fully_satisfied {
                println!("All requirements satisfied.");
            } else {
                println!("Some requirements are missing.");
            }
        }
    }
    Ok(())
}

fn run_analyze(workspace: &Workspace, args: AnalyzeArgs, format: OutputFormat) -> Result<()> {
    let task = Task::FullAnalysis {
        diagnose: !args.no_diagnose,
    };
    let Some(TaskResult::Analysis(analysis)) = run_task(workspace, task)? else {
        return Ok(());
    };
    if let Some(path) = &args.export {
        let raw = serde_json::to_string_pretty(&analysis).context("serialize analysis")?;
        fs::write(path, raw).with_context(|| format!("write {}", path.display()))?;
        info!("exported analysis to {}", path.display());
    }
    if let Some(path) = &args.export_html {
        fs::write(path, render_html(&analysis, &workspace.settings))
            .with_context(|| format!("write {}", path.display()))?;
        info!("wrote report {}", path.display());
    }
    print_analysis(&analysis, format)
}

#[derive(Serialize)]
struct AnalysisOutput<'a> {
    order: &'a [String],
    cycle_breaks: &'a [String],
    missing: Vec<&'a MissingReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    violations: Option<&'a [Violation]>,
}

fn print_analysis(analysis: &FullAnalysis, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let output = AnalysisOutput {
                order: &analysis.sorted.order,
                cycle_breaks: &analysis.sorted.cycle_breaks,
                missing: analysis.missing.values().collect(),
                violations: analysis.violations.as_deref(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Recommended load order (lowest priority first):");
            for (index, folder) in analysis.sorted.order.iter().enumerate() {
                let marker = if analysis.sorted.cycle_breaks.contains(folder) {
                    "  [cycle break]"
                } else {
                    ""
                };
                println!("{:>4}. {folder}{marker}", index + 1);
            }

            println!();
            if analysis.missing.is_empty() {
                println!("No missing requirements detected.");
            } else {
                println!("Missing requirements:");
                for report in analysis.missing.values() {
                    let mut header = format!("  {} ({})", report.name, report.id);
                    if let (Some(id), Some(name)) = (&report.effective_id, &report.effective_name) {
                        header.push_str(&format!(" -> replaced by {name} ({id})"));
                    }
                    println!("{header}");
                    for requirer in &report.required_by_installed {
                        let tags = tag_labels(&requirer.tags);
                        let tags = if tags.is_empty() {
                            String::new()
                        } else {
                            format!(" [{}]", tags.join(", "))
                        };
                        println!("      needed by {}{tags}", requirer.folder);
                    }
                    for requirer in &report.required_by_missing {
                        println!("      needed by missing {} ({})", requirer.name, requirer.id);
                    }
                }
            }

            if let Some(violations) = &analysis.violations {
                println!();
                print_violation_lines(violations);
            }
        }
    }
    Ok(())
}

fn run_diagnose(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let Some(TaskResult::Violations(violations)) = run_task(workspace, Task::Diagnose)? else {
        return Ok(());
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&violations)?),
        OutputFormat::Text => print_violation_lines(&violations),
    }
    Ok(())
}

fn print_violation_lines(violations: &[Violation]) {
    if violations.is_empty() {
        println!("No load order violations detected.");
        return;
    }
    println!("Load order violations:");
    for violation in violations {
        let notes = if violation.notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", violation.notes)
        };
        println!(
            "  [{}] {} loads before its requirement {}{notes}",
            violation.separator, violation.dependent, violation.provider
        );
    }
}

fn run_correct(workspace: &Workspace, args: CorrectArgs, format: OutputFormat) -> Result<()> {
    let selection = if args.all {
        Selection::All
    } else if args.select.is_empty() {
        bail!("choose violations with --select DEP=>PROVIDER or pass --all");
    } else {
        Selection::Pairs(
            args.select
                .iter()
                .map(|raw| parse_selection(raw))
                .collect::<Result<_>>()?,
        )
    };
    let Some(TaskResult::Correction { result, selected }) =
        run_task(workspace, Task::Correct { selection })?
    else {
        return Ok(());
    };

    let mut applied = false;
    if let (CorrectionResult::Proposed(correction), true) = (&result, args.apply) {
        let Some(instance) = &workspace.instance else {
            bail!("no Mod Organizer instance configured");
        };
        workspace
            .mod_list()?
            .reordered(&correction.proposed_order)
            .save(instance, &workspace.profile)?;
        applied = true;
        info!("applied new order to profile {}", workspace.profile);
    }
    print_correction(&result, &selected, applied, format)
}

fn parse_selection(raw: &str) -> Result<(String, String)> {
    let Some((dependent, provider)) = raw.split_once("=>") else {
        bail!("selection {raw:?} must look like DEPENDENT=>PROVIDER");
    };
    let (dependent, provider) = (dependent.trim(), provider.trim());
    if dependent.is_empty() || provider.is_empty() {
        bail!("selection {raw:?} is missing a folder name");
    }
    Ok((dependent.to_string(), provider.to_string()))
}

#[derive(Serialize)]
struct CorrectionOutput<'a> {
    selected: &'a [Violation],
    applied: bool,
    #[serde(flatten)]
    result: &'a CorrectionResult,
}

fn print_correction(
    result: &CorrectionResult,
    selected: &[Violation],
    applied: bool,
    format: OutputFormat,
) -> Result<()> {
    if format == OutputFormat::Json {
        let output = CorrectionOutput {
            selected,
            applied,
            result,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if selected.is_empty() {
        println!("No matching violations selected.");
    }
    let residual = match result {
        CorrectionResult::NoChange { residual } => {
            println!("No change needed.");
            residual
        }
        CorrectionResult::Proposed(correction) => {
            println!(
                "Proposed order moves {} folder(s); disruption {} -> {}.",
                correction.moved.len(),
                correction.disruption_before,
                correction.disruption_after
            );
            for folder in &correction.moved {
                let selected_marker = if correction.selected_dependents.contains(folder) {
                    "*"
                } else {
                    " "
                };
                println!("  {selected_marker} {folder}");
            }
            println!();
            println!("Proposed order (lowest priority first):");
            for (index, folder) in correction.proposed_order.iter().enumerate() {
                println!("{:>4}. {folder}", index + 1);
            }
            if applied {
                println!("Applied to modlist.txt (backup at modlist.txt.bak).");
            }
            &correction.residual
        }
    };
    if !residual.is_empty() {
        println!();
        println!("Could not resolve:");
        for violation in residual {
            println!("  {} still loads before {}", violation.dependent, violation.provider);
        }
    }
    Ok(())
}

fn run_translations(
    workspace: &Workspace,
    language: &str,
    original_dates: bool,
    format: OutputFormat,
) -> Result<()> {
    let task = Task::FindTranslations {
        language: language.to_string(),
    };
    let Some(TaskResult::Translations(found)) = run_task(workspace, task)? else {
        return Ok(());
    };
    print_translations(&found, language, original_dates, format)
}

fn print_translations(
    found: &[TranslationMatch],
    language: &str,
    original_dates: bool,
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(found)?),
        OutputFormat::Text => {
            if found.is_empty() {
                println!("No missing {language} translations found.");
            }
            for entry in found {
                println!(
                    "{}  {} ({}) -> {} ({}) [{}]",
                    format_date_cell(Some(if original_dates {
                        entry.original_update_timestamp
                    } else {
                        entry.update_timestamp
                    })),
                    entry.original_name,
                    entry.folders.join(", "),
                    entry.translation_name,
                    entry.translation_id,
                    entry.language
                );
            }
        }
    }
    Ok(())
}

fn run_cache(workspace: &Workspace, action: CacheAction, format: OutputFormat) -> Result<()> {
    match action {
        CacheAction::List => {
            let entries = workspace.open_store()?.entries();
            print_cache_entries(&entries, format)
        }
        CacheAction::Delete { ids } => {
            let ids: Vec<String> = ids
                .iter()
                .map(|raw| extract_item_id(raw).unwrap_or_else(|| raw.trim().to_string()))
                .collect();
            let removed = workspace.open_store()?.delete(&ids)?;
            println!("Removed {removed} cache entr{}.", if removed == 1 { "y" } else { "ies" });
            Ok(())
        }
        CacheAction::Clear => {
            if run_task(workspace, Task::ClearCache)?.is_some() {
                println!("Cache cleared.");
            }
            Ok(())
        }
    }
}

fn print_cache_entries(entries: &[CacheListing], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("Cache is empty.");
            }
            for entry in entries {
                println!(
                    "{:>8}  {}  {} [{}]",
                    entry.id, entry.cached_at, entry.name, entry.category
                );
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RulesOutput<'a> {
    path: String,
    ignore: &'a BTreeSet<String>,
    replace: &'a BTreeMap<String, String>,
    ignore_requirements_of: &'a BTreeSet<String>,
}

fn run_rules(workspace: &Workspace, action: RulesAction, format: OutputFormat) -> Result<()> {
    let path = workspace.paths.rules();
    match action {
        RulesAction::Show => {
            let rules = RuleSet::load(&path);
            match format {
                OutputFormat::Json => {
                    let output = RulesOutput {
                        path: path.display().to_string(),
                        ignore: &rules.ignore,
                        replace: &rules.replace,
                        ignore_requirements_of: &rules.ignore_requirements_of,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Text => {
                    println!("# {}", path.display());
                    print!("{}", rules.to_toml().context("serialize rules")?);
                }
            }
            Ok(())
        }
        RulesAction::Add { list, ids } => {
            let ids: Vec<String> = ids
                .iter()
                .map(|raw| {
                    extract_item_id(raw).with_context(|| format!("{raw} is not an item id"))
                })
                .collect::<Result<_>>()?;
            let added = RuleSet::add_ids(&path, list.into(), &ids)?;
            println!("Added {added} id(s).");
            Ok(())
        }
        RulesAction::Replace { old, new } => {
            let old = extract_item_id(&old).with_context(|| format!("{old} is not an item id"))?;
            let new = extract_item_id(&new).with_context(|| format!("{new} is not an item id"))?;
            RuleSet::add_replacement(&path, &old, &new)?;
            println!("{old} now resolves to {new}.");
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct SettingsOutput<'a> {
    data_dir: String,
    settings_file: String,
    rules_file: String,
    cache_file: String,
    log_file: String,
    instance: Option<String>,
    profile: &'a str,
    settings: &'a Settings,
}

fn print_settings(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let paths = &workspace.paths;
    let output = SettingsOutput {
        data_dir: paths.data_dir.display().to_string(),
        settings_file: paths.settings().display().to_string(),
        rules_file: paths.rules().display().to_string(),
        cache_file: paths.cache(&workspace.settings).display().to_string(),
        log_file: paths.log().display().to_string(),
        instance: workspace
            .instance
            .as_ref()
            .map(|path| path.display().to_string()),
        profile: &workspace.profile,
        settings: &workspace.settings,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Text => {
            println!("Data dir: {}", output.data_dir);
            println!("Settings: {}", output.settings_file);
            println!("Rules: {}", output.rules_file);
            println!("Cache: {}", output.cache_file);
            println!("Log: {}", output.log_file);
            println!(
                "Instance: {}",
                output.instance.as_deref().unwrap_or("(not configured)")
            );
            println!("Profile: {}", output.profile);
            let settings = output.settings;
            println!("Game: {}", settings.game_name);
            println!("Metadata endpoint: {}", settings.metadata_endpoint);
            println!("Mod pages: {}", settings.site_url);
            println!(
                "Cache expiration: {} day(s){}",
                settings.cache_expiration_days,
                if settings.cache_expiration_days == 0 { " (never)" } else { "" }
            );
            println!("Max recursion depth: {}", settings.max_recursion_depth);
            println!("Uninstalled fetch depth: {}", settings.uninstalled_fetch_depth);
            println!(
                "Requests: {} worker(s), {} ms delay, {} retries ({} ms apart), {} ms timeout",
                settings.max_workers,
                settings.request_delay_ms,
                settings.max_retries,
                settings.retry_delay_ms,
                settings.request_timeout_ms
            );
            println!("Log level: {}", settings.log_level);
        }
    }
    Ok(())
}

fn format_date_cell(value: Option<i64>) -> String {
    if let Some(value) = value {
        if let Some(formatted) = format_short_date(value) {
            return formatted;
        }
    }
    format_blank_date()
}

fn format_short_date(timestamp: i64) -> Option<String> {
    if timestamp <= 0 {
        return None;
    }
    let date = time::OffsetDateTime::from_unix_timestamp(timestamp).ok()?;
    let year = date.year();
    let month = date.month() as u8;
    let day = date.day();
    let locale = locale_hint();
    let formatted = if prefers_mdy(&locale) {
        format!("{month:02}-{day:02}-{year:04}")
    } else if prefers_ymd(&locale) {
        format!("{year:04}-{month:02}-{day:02}")
    } else {
        format!("{day:02}-{month:02}-{year:04}")
    };
    Some(formatted)
}

fn format_blank_date() -> String {
    let locale = locale_hint();
    if prefers_ymd(&locale) {
        "---- -- --".to_string()
    } else {
        "-- -- ----".to_string()
    }
}

fn locale_hint() -> String {
    std::env::var("LC_TIME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| std::env::var("LANG").ok())
        .unwrap_or_default()
        .to_ascii_uppercase()
}

fn prefers_mdy(locale: &str) -> bool {
    locale.contains("US") || locale.contains("PH")
}

fn prefers_ymd(locale: &str) -> bool {
    locale.contains("CN")
        || locale.contains("JP")
        || locale.contains("KR")
        || locale.contains("TW")
        || locale.contains("HU")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "modorder",
            "correct",
            "--select",
            "DLC: Patch=>Base Lib",
            "--format",
            "json",
            "--profile",
            "Survival",
        ])
        .unwrap();
        assert!(cli.format == OutputFormat::Json);
        assert_eq!(cli.profile.as_deref(), Some("Survival"));
        let Commands::Correct(args) = cli.command else {
            panic!("expected correct");
        };
        assert_eq!(
            parse_selection(&args.select[0]).unwrap(),
            ("DLC: Patch".to_string(), "Base Lib".to_string())
        );
    }

    #[test]
    fn parses_report_and_translation_flags() {
        let cli = Cli::try_parse_from(["modorder", "analyze", "--export-html", "report.html"]).unwrap();
        let Commands::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.export_html, Some(PathBuf::from("report.html")));

        let cli = Cli::try_parse_from(["modorder", "translations", "German", "--original-dates"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Translations { original_dates: true, .. }
        ));
    }

    #[test]
    fn rejects_malformed_selection() {
        assert!(parse_selection("A-B").is_err());
        assert!(parse_selection("=>B").is_err());
    }

    #[test]
    fn rule_list_names_are_kebab_case() {
        let cli = Cli::try_parse_from(["modorder", "rules", "add", "ignore-requirements-of", "42"]).unwrap();
        let Commands::Rules {
            action: RulesAction::Add { list, ids },
        } = cli.command
        else {
            panic!("expected rules add");
        };
        assert!(matches!(RuleList::from(list), RuleList::IgnoreRequirementsOf));
        assert_eq!(ids, vec!["42".to_string()]);
    }

    #[test]
    fn blank_dates_for_missing_timestamps() {
        assert!(format_short_date(0).is_none());
        assert_eq!(format_date_cell(None), format_blank_date());
    }
}
