// Ledger Desk - command line front end
// Every data command signs in with the given credentials first.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ledger_desk::auth::SignUpMetadata;
use ledger_desk::config::DEFAULT_CONFIG_FILE;
use ledger_desk::{
    clients, files, merge, records, routes, AppContext, Config, FileFilters, ListOptions, Role,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "ledger-desk")]
#[command(version)]
#[command(about = "Accountant ledger desk: files, records, clients and merge reports", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(long, env = "LEDGER_DESK_EMAIL")]
    email: String,
    #[arg(long, env = "LEDGER_DESK_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema and storage directories
    Init,
    /// Register a new user
    Signup {
        #[command(flatten)]
        credentials: Credentials,
        /// accountant or client
        #[arg(long, default_value = "client")]
        role: String,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        company_name: Option<String>,
    },
    /// Upload a ledger file
    Upload {
        #[command(flatten)]
        credentials: Credentials,
        path: PathBuf,
    },
    /// List uploaded files
    Files {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Show record totals, optionally for one file
    Stats {
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        file_id: Option<String>,
    },
    /// Print one page of records
    Records {
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        file_id: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = records::DEFAULT_PAGE_SIZE)]
        limit: u32,
    },
    /// Export records as CSV
    Export {
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        file_id: Option<String>,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Invite a client by email (accountants only)
    Invite {
        #[command(flatten)]
        credentials: Credentials,
        client_email: String,
    },
    /// Accept an invitation token
    Accept {
        #[command(flatten)]
        credentials: Credentials,
        token: String,
    },
    /// Merge job commands (accountants only)
    Merge {
        #[command(flatten)]
        credentials: Credentials,
        #[command(subcommand)]
        action: MergeAction,
    },
    /// Show what the navigation guard decides for a page path
    Guard {
        path: String,
        /// Evaluate as this user instead of signed out
        #[arg(long)]
        email: Option<String>,
        #[arg(long, env = "LEDGER_DESK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum MergeAction {
    /// Create a job over two or more files, in the given order
    Create {
        #[arg(long)]
        name: Option<String>,
        #[arg(required = true, num_args = 2..)]
        file_ids: Vec<String>,
    },
    /// List jobs
    List,
    /// Print the merge statistics of a job
    Report { job_id: String },
    /// Export a job as CSV (to a file, or into storage with --store)
    Export {
        job_id: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Register the export as a file in the exports bucket
        #[arg(long)]
        store: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let mut ctx = AppContext::open(config).context("Failed to open ledger desk storage")?;

    match cli.command {
        Command::Init => {
            println!("✓ Database ready at {}", ctx.config().database.path.display());
            println!("✓ Storage ready at {}", ctx.config().storage.root.display());
        }
        Command::Signup {
            credentials,
            role,
            full_name,
            company_name,
        } => {
            let role = Role::parse(&role)
                .with_context(|| format!("Unknown role '{}' (use accountant or client)", role))?;
            let metadata = SignUpMetadata {
                role: Some(role),
                full_name,
                company_name,
            };
            let session = ctx.sign_up(&credentials.email, &credentials.password, &metadata)?;
            println!("✓ Registered {} as {}", session.profile.email, role.as_str());
        }
        Command::Upload { credentials, path } => {
            sign_in(&mut ctx, &credentials)?;
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file = files::upload_file(
                ctx.conn(),
                ctx.store(),
                ctx.require_session()?,
                &display_name(&path),
                &bytes,
            )?;
            println!("✓ Uploaded {} ({} bytes) as {}", file.file_name, file.file_size, file.id);
        }
        Command::Files { credentials } => {
            sign_in(&mut ctx, &credentials)?;
            let rows = files::list_files(ctx.conn(), ctx.require_session()?, &FileFilters::default())?;
            println!("📁 {} files", rows.len());
            for file in rows {
                println!(
                    "  {}  {:<40} {:<10} {:>6} records",
                    file.id,
                    file.file_name,
                    file.status.as_str(),
                    file.record_count
                );
            }
        }
        Command::Stats {
            credentials,
            file_id,
        } => {
            sign_in(&mut ctx, &credentials)?;
            let stats = records::record_stats(ctx.conn(), ctx.require_session()?, file_id.as_deref())?;
            println!("📊 Records:   {}", stats.total_records);
            println!("   Dolguja:   {:.2}", stats.total_dolguja);
            println!("   Pobaruva:  {:.2}", stats.total_pobaruva);
            println!("   Balance:   {:.2}", stats.balance);
        }
        Command::Records {
            credentials,
            file_id,
            search,
            page,
            limit,
        } => {
            sign_in(&mut ctx, &credentials)?;
            let options = ListOptions {
                file_id,
                search,
                page,
                limit,
                ..ListOptions::default()
            };
            let result = records::list_records(ctx.conn(), ctx.require_session()?, &options)?;
            println!(
                "📒 Page {}/{} ({} records)",
                result.page, result.total_pages, result.total
            );
            for row in result.records {
                let r = row.record;
                println!(
                    "  {:<12} {:<10} {:>12} {:>12}  {}",
                    r.data.as_deref().unwrap_or(""),
                    r.nalog.as_deref().unwrap_or(""),
                    r.dolguja.as_deref().unwrap_or(""),
                    r.pobaruva.as_deref().unwrap_or(""),
                    r.opis.as_deref().unwrap_or("")
                );
            }
        }
        Command::Export {
            credentials,
            file_id,
            out,
        } => {
            sign_in(&mut ctx, &credentials)?;
            let csv = records::export_records(ctx.conn(), ctx.require_session()?, file_id.as_deref())?;
            write_output(out.as_deref(), &csv)?;
        }
        Command::Invite {
            credentials,
            client_email,
        } => {
            sign_in(&mut ctx, &credentials)?;
            let invite = clients::invite_client(ctx.conn(), ctx.require_session()?, &client_email)?;
            let token = invite.invite_token.unwrap_or_default();
            println!("✉️  Invited {}", invite.invited_email);
            println!(
                "   Link: {}/invite/{}",
                ctx.config().server.public_url.trim_end_matches('/'),
                token
            );
            println!("   Expires: {}", invite.expires_at.format("%d.%m.%Y %H:%M"));
        }
        Command::Accept { credentials, token } => {
            sign_in(&mut ctx, &credentials)?;
            let relationship = clients::accept_invitation(ctx.conn(), ctx.require_session()?, &token)?;
            println!("✓ Linked to accountant {}", relationship.accountant_id);
        }
        Command::Merge {
            credentials,
            action,
        } => {
            sign_in(&mut ctx, &credentials)?;
            run_merge(&mut ctx, action)?;
        }
        Command::Guard {
            path,
            email,
            password,
        } => {
            if let (Some(email), Some(password)) = (email, password) {
                ctx.sign_in(&email, &password)?;
            }
            let decision = routes::guard(&path, ctx.session());
            match decision.location() {
                Some(location) => println!("↪ redirect to {}", location),
                None => println!("✓ allow {}", path),
            }
        }
    }

    ctx.sign_out()?;
    Ok(())
}

fn run_merge(ctx: &mut AppContext, action: MergeAction) -> Result<()> {
    match action {
        MergeAction::Create { name, file_ids } => {
            let (conn, _store, session) = ctx.split_mut()?;
            let job = merge::create_merge_job(conn, session, name.as_deref(), &file_ids)?;
            println!("🔀 Created merge job {} ({})", job.job.id, job.job.name);
        }
        MergeAction::List => {
            let jobs = merge::list_merge_jobs(ctx.conn(), ctx.require_session()?)?;
            println!("🔀 {} merge jobs", jobs.len());
            for job in jobs {
                println!(
                    "  {}  {:<30} {:<10} {} files",
                    job.job.id,
                    job.job.name,
                    job.job.status.as_str(),
                    job.files.len()
                );
            }
        }
        MergeAction::Report { job_id } => {
            let result = merge::get_merge_result(ctx.conn(), ctx.require_session()?, &job_id)?;
            let stats = &result.stats;
            println!("🔀 {}", result.job.job.name);
            println!("   Records:   {}", stats.total_records);
            println!("   Dolguja:   {:.2}", stats.total_dolguja);
            println!("   Pobaruva:  {:.2}", stats.total_pobaruva);
            println!("   Balance:   {:.2}", stats.balance);
            println!("   By source:");
            for (source, totals) in &stats.by_source {
                println!(
                    "     {:<30} {:>6} {:>14.2} {:>14.2}",
                    source, totals.count, totals.dolguja, totals.pobaruva
                );
            }
            if stats.overlap_count > 0 {
                println!(
                    "   ⚠️  {} overlapping invoices: {}",
                    stats.overlap_count,
                    stats.overlapping_invoices.join(", ")
                );
            }
        }
        MergeAction::Export { job_id, out, store } => {
            if store {
                let (conn, store, session) = ctx.split_mut()?;
                let job = merge::export_merge_to_file(conn, store, session, &job_id)?;
                if let Some(file) = job.output_file {
                    println!("✓ Exported to {} ({})", file.storage_path, file.id);
                }
            } else {
                let result = merge::get_merge_result(ctx.conn(), ctx.require_session()?, &job_id)?;
                let csv = merge::export_merge_to_csv(&result.records)?;
                write_output(out.as_deref(), &csv)?;
            }
        }
    }
    Ok(())
}

fn sign_in(ctx: &mut AppContext, credentials: &Credentials) -> Result<()> {
    ctx.sign_in(&credentials.email, &credentials.password)
        .context("Sign-in failed")?;
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn write_output(out: Option<&Path>, csv: &str) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, csv)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Wrote {}", path.display());
        }
        None => println!("{}", csv),
    }
    Ok(())
}
