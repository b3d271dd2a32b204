use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use clinic_bundle_lib::checksum::{add_checksum, generate_checksum, verify_checksum};
use clinic_bundle_lib::config::BundleConfig;
use clinic_bundle_lib::export::{ExportOptions, Exporter};
use clinic_bundle_lib::import::{CancelToken, ImportOptions, Importer};
use clinic_bundle_lib::migrator::{MigrateOptions, Migrator};
use clinic_bundle_lib::store::SqliteStore;
use clinic_bundle_lib::validator::Validator;
use clinic_bundle_lib::{logging, migrations, Bundle};

#[derive(Debug, Parser)]
#[command(
    name = "clinic-bundle",
    about = "Export, upgrade, validate and import workspace bundles",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every validation pass and print the report.
    Validate {
        #[arg(value_name = "BUNDLE")]
        file: PathBuf,
        /// Emit the raw JSON report instead of the summary view.
        #[arg(long)]
        json: bool,
    },
    /// Print the bundle checksum and whether it matches the stored one.
    Checksum {
        #[arg(value_name = "BUNDLE")]
        file: PathBuf,
        /// Reseal the file in place with the computed checksum.
        #[arg(long)]
        write: bool,
    },
    /// Show which migrations an import of this bundle would apply.
    Preview {
        #[arg(value_name = "BUNDLE")]
        file: PathBuf,
    },
    /// Upgrade a bundle to the current schema version.
    Migrate {
        #[arg(value_name = "BUNDLE")]
        file: PathBuf,
        /// Where to write the upgraded bundle.
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
        /// Run each step's post-condition checks.
        #[arg(long)]
        validate_steps: bool,
    },
    /// Describe the compiled migration catalog.
    Registry,
    /// Export one workspace from a database into a bundle file.
    Export {
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        #[arg(long, value_name = "ID")]
        workspace: String,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
        /// Include the workspace activity log.
        #[arg(long)]
        audit_logs: bool,
        #[arg(long, value_name = "ID")]
        user_id: Option<String>,
        #[arg(long, value_name = "EMAIL")]
        user_email: Option<String>,
        /// Tables fetched in parallel per clinic.
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
    },
    /// Import a bundle into a database as a new workspace.
    Import {
        #[arg(long, value_name = "PATH")]
        db: PathBuf,
        #[arg(value_name = "BUNDLE")]
        file: PathBuf,
        /// Owner of the created workspace.
        #[arg(long, value_name = "ID")]
        user_id: String,
        /// Run migration and validation only.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        skip_validation: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = BundleConfig::from_env().context("read configuration")?;
    let _guard = logging::init(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    match cli.command {
        Commands::Validate { file, json } => handle_validate(&config, &file, json),
        Commands::Checksum { file, write } => handle_checksum(&file, write),
        Commands::Preview { file } => handle_preview(&file),
        Commands::Migrate {
            file,
            out,
            validate_steps,
        } => handle_migrate(&file, &out, validate_steps),
        Commands::Registry => handle_registry(),
        Commands::Export {
            db,
            workspace,
            out,
            audit_logs,
            user_id,
            user_email,
            concurrency,
        } => runtime.block_on(async {
            let store = SqliteStore::open(&db)
                .await
                .with_context(|| format!("open database {}", db.display()))?;
            let options = ExportOptions {
                include_audit_logs: audit_logs,
                user_id,
                user_email,
                app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            };
            let (bundle, stats) = Exporter::new(&store)
                .with_concurrency(concurrency.unwrap_or(config.export_concurrency))
                .export(&workspace, &options)
                .await
                .with_context(|| format!("export workspace {workspace}"))?;
            bundle
                .save(&out)
                .with_context(|| format!("write bundle {}", out.display()))?;
            print_json(&json!({ "path": out, "stats": stats }))?;
            Ok(0)
        }),
        Commands::Import {
            db,
            file,
            user_id,
            dry_run,
            skip_validation,
        } => {
            let bundle = load(&file)?;
            runtime.block_on(async {
                let store = SqliteStore::open(&db)
                    .await
                    .with_context(|| format!("open database {}", db.display()))?;

                let cancel = CancelToken::new();
                let on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!(target: "clinic_bundle", event = "import_interrupted");
                        on_signal.cancel();
                    }
                });

                let mut options = ImportOptions::new(user_id);
                options.dry_run = dry_run;
                options.skip_validation = skip_validation;
                options.cancel = Some(cancel);

                let result = Importer::new(&store)
                    .with_records_per_second(config.records_per_second)
                    .import(&bundle, &options)
                    .await;
                print_json(&result)?;
                Ok(if result.success { 0 } else { 1 })
            })
        }
    }
}

fn load(path: &Path) -> Result<Bundle> {
    Bundle::load(path).with_context(|| format!("read bundle {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{serialized}");
    Ok(())
}

fn handle_validate(config: &BundleConfig, file: &Path, emit_json: bool) -> Result<i32> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("read bundle {}", file.display()))?;
    let document: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", file.display()))?;
    let report = Validator::new(migrations::registry(), config.records_per_second)
        .validate_document(&document)
        .context("validate bundle")?;

    if emit_json {
        print_json(&report)?;
    } else {
        println!(
            "{}: {} error(s), {} warning(s), {} record(s)",
            if report.valid { "valid" } else { "invalid" },
            report.errors.len(),
            report.warnings.len(),
            report.stats.records_to_import
        );
        for error in &report.errors {
            println!("  error   {:?}: {}", error.kind, error.message);
        }
        for warning in &report.warnings {
            println!("  warning {:?}: {}", warning.kind, warning.message);
        }
    }
    Ok(if report.valid { 0 } else { 1 })
}

fn handle_checksum(file: &Path, write: bool) -> Result<i32> {
    let bundle = load(file)?;
    let computed = generate_checksum(&bundle).context("compute checksum")?;
    let matches = verify_checksum(&bundle).context("verify checksum")?;
    if write && !matches {
        let sealed = add_checksum(&bundle).context("seal bundle")?;
        sealed
            .save(file)
            .with_context(|| format!("write bundle {}", file.display()))?;
    }
    print_json(&json!({
        "checksum": computed,
        "stored": bundle.metadata.checksum,
        "matches": matches,
        "written": write && !matches,
    }))?;
    Ok(if matches || write { 0 } else { 1 })
}

fn handle_preview(file: &Path) -> Result<i32> {
    let bundle = load(file)?;
    let preview = Migrator::new()
        .context("load migration catalog")?
        .preview_migration(&bundle);
    print_json(&preview)?;
    Ok(if preview.can_migrate { 0 } else { 1 })
}

fn handle_migrate(file: &Path, out: &Path, validate_steps: bool) -> Result<i32> {
    let bundle = load(file)?;
    let options = MigrateOptions {
        validate_each_step: validate_steps,
        continue_on_warnings: false,
    };
    let result = Migrator::new()
        .context("load migration catalog")?
        .migrate(&bundle, options)
        .context("migrate bundle")?;
    result
        .bundle
        .save(out)
        .with_context(|| format!("write bundle {}", out.display()))?;
    print_json(&json!({
        "originalVersion": result.original_version,
        "finalVersion": result.final_version,
        "migrationsApplied": result.migrations_applied,
        "migrationsSummary": result.migrations_summary,
        "warnings": result.warnings,
        "path": out,
    }))?;
    Ok(0)
}

fn handle_registry() -> Result<i32> {
    let info = Migrator::new()
        .context("load migration catalog")?
        .system_info();
    print_json(&info)?;
    Ok(if info.registry_errors.is_empty() { 0 } else { 1 })
}
