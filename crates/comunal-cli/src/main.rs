use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use comunal_core::audit::AuditTrail;
use comunal_core::backup::BackupManager;
use comunal_core::document::Inhabitant;
use comunal_core::folio::allocate_folio;
use comunal_core::{DocumentKind, StoreConfig, Workspace};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "comunal")]
#[command(about = "Encrypted community registry storage", long_about = None)]
struct Cli {
    /// Data directory (defaults to COMUNAL_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Document password; prompted for when omitted
    #[arg(long, global = true, env = "COMUNAL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// User recorded in the audit trail
    #[arg(long, global = true, default_value = "admin")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create any missing document and report how each one loaded
    Init,

    /// Show how each document loaded with the given password
    Status,

    /// Print a decrypted document as JSON
    Show {
        /// habitantes, cooperaciones, faenas or perfiles
        document: String,
    },

    /// Replace a document with the contents of a JSON file
    Import {
        document: String,
        file: PathBuf,
    },

    /// Register an inhabitant under the next free folio
    AddInhabitant {
        nombre: String,
        #[arg(long)]
        notas: Option<String>,
    },

    /// Manage snapshots
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Query the audit trail
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Snapshot every document now
    Create,
    /// List snapshots, newest first
    List,
    /// Copy a snapshot back over the live documents
    Restore { name: String },
    /// Delete snapshots older than the given number of days
    Prune {
        #[arg(long, default_value = "30")]
        days: i64,
    },
    /// Delete one snapshot
    Delete { name: String },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Most recent entries, newest first
    Recent {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Entries about one entity
    Entity { kind: String, id: String },
    /// Entries made by one user
    Actor { user: String },
    /// Counts per action, entity and user
    Stats,
    /// Write every entry to a JSON file
    Export { file: PathBuf },
}

fn parse_kind(name: &str) -> Result<DocumentKind> {
    DocumentKind::parse(name).ok_or_else(|| anyhow!("unknown document: {name}"))
}

fn read_password(cli_value: Option<String>) -> Result<Zeroizing<String>> {
    match cli_value {
        Some(password) => Ok(Zeroizing::new(password)),
        None => rpassword::prompt_password("Contraseña: ")
            .map(Zeroizing::new)
            .context("read password"),
    }
}

fn open_workspace(config: StoreConfig, password: Option<String>) -> Result<Workspace> {
    let password = read_password(password)?;
    Workspace::open(config, &password)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::load(cli.data_dir)?;

    match cli.command {
        Commands::Init => {
            let ws = open_workspace(config, cli.password)?;
            for (kind, status) in ws.load_report() {
                if !ws.store().exists(&kind.file_name()) {
                    ws.save(kind, true)?;
                    println!("{kind}: created");
                } else {
                    println!("{kind}: {status:?}");
                }
            }
            ws.close();
        }

        Commands::Status => {
            let ws = open_workspace(config, cli.password)?;
            for (kind, status) in ws.load_report() {
                println!("{kind}: {status:?}");
            }
        }

        Commands::Show { document } => {
            let kind = parse_kind(&document)?;
            let ws = open_workspace(config, cli.password)?;
            print_json(&ws.document_json(kind)?)?;
        }

        Commands::Import { document, file } => {
            let kind = parse_kind(&document)?;
            let data = std::fs::read(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let payload: serde_json::Value = serde_json::from_slice(&data)
                .with_context(|| format!("parse {}", file.display()))?;
            let ws = open_workspace(config, cli.password)?;
            ws.import_document(kind, payload, &cli.actor)?;
            println!("{kind}: imported");
            ws.close();
        }

        Commands::AddInhabitant { nombre, notas } => {
            let ws = open_workspace(config, cli.password)?;
            let repo = ws.inhabitants();
            let folio = repo.read(|doc| allocate_folio(None, &nombre, doc.folios()));
            let inhabitant = Inhabitant {
                folio: folio.clone(),
                nombre,
                fecha_registro: Some(Local::now().format("%Y-%m-%d").to_string()),
                activo: true,
                notas: notas.unwrap_or_default(),
                ..Default::default()
            };
            let fields = serde_json::to_value(&inhabitant)?;
            repo.update(|doc| doc.habitantes.push(inhabitant));
            ws.save(DocumentKind::Habitantes, true)?;
            ws.audit().record_create("habitante", &folio, &fields, &cli.actor);
            println!("{folio}");
            ws.close();
        }

        Commands::Backup(command) => {
            let backups = BackupManager::new(
                &config.data_dir,
                config.backup_dir(),
                config.documents.clone(),
            )
            .with_retention(config.backup_retention);
            match command {
                BackupCommand::Create => {
                    let info = backups.create_full_snapshot()?;
                    println!("{}", info.name);
                }
                BackupCommand::List => {
                    for snapshot in backups.list_snapshots()? {
                        println!(
                            "{}\t{}\t{} files\t{} bytes",
                            snapshot.name,
                            snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                            snapshot.files.len(),
                            snapshot.total_size
                        );
                    }
                }
                BackupCommand::Restore { name } => {
                    let ws = open_workspace(config, cli.password)?;
                    let report = ws.restore_snapshot(&name, &cli.actor)?;
                    for file in &report.restored {
                        println!("restored {file}");
                    }
                    for (file, reason) in &report.failed {
                        warn!(file = %file, "not restored: {reason}");
                    }
                    if !report.is_complete() {
                        return Err(anyhow!("snapshot {name} only partially restored"));
                    }
                }
                BackupCommand::Prune { days } => {
                    for name in backups.prune_older_than(days)? {
                        println!("deleted {name}");
                    }
                }
                BackupCommand::Delete { name } => {
                    backups.delete_snapshot(&name)?;
                    println!("deleted {name}");
                }
            }
        }

        Commands::Audit(command) => {
            let audit = AuditTrail::open(config.audit_path(), config.audit_cap)?;
            match command {
                AuditCommand::Recent { limit } => print_json(&audit.recent(limit))?,
                AuditCommand::Entity { kind, id } => print_json(&audit.by_entity(&kind, &id))?,
                AuditCommand::Actor { user } => print_json(&audit.by_actor(&user))?,
                AuditCommand::Stats => print_json(&audit.compute_statistics())?,
                AuditCommand::Export { file } => {
                    let count = audit.export_all(&file)?;
                    println!("{count} entries written to {}", file.display());
                }
            }
        }
    }

    Ok(())
}
