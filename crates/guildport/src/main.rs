use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use guildport_core::config::{AuthConfig, MigrateConfig, load_config, resolve_config_path};
use guildport_core::migrate::{MigrateOptions, fetch_template, run_migration, scan};
use guildport_core::permissions::{parse_discord_permissions, translate_bits, unmapped_bits};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "guildport",
    version,
    about = "Copy a Discord guild template onto a Stoat server"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Report what a migration would leave behind or change")]
    Scan(TargetArgs),
    #[command(about = "Convert roles, channels and settings onto the Stoat server")]
    Migrate(MigrateArgs),
    #[command(about = "Fetch a Discord guild template and summarise it")]
    Template(TemplateArgs),
    #[command(about = "Translate a Discord permission value into a Stoat mask")]
    Translate(TranslateArgs),
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long, value_name = "CODE", help = "Discord guild template code")]
    template: String,
    #[arg(long, value_name = "ID", help = "Target Stoat server id")]
    server: String,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long, help = "Refuse to migrate when the pre-flight scan reports warnings")]
    strict: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct TemplateArgs {
    code: String,
    #[arg(long, help = "Dump the raw template as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct TranslateArgs {
    #[arg(value_name = "VALUE", help = "Decimal Discord permission value")]
    value: String,
}

impl TargetArgs {
    fn options(&self, strict: bool) -> MigrateOptions {
        MigrateOptions {
            template_code: self.template.clone(),
            server_id: self.server.clone(),
            strict,
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Scan(args)) => run_scan(cli.config.as_deref(), args),
        Some(Commands::Migrate(args)) => run_migrate(cli.config.as_deref(), args),
        Some(Commands::Template(args)) => run_template(cli.config.as_deref(), args),
        Some(Commands::Translate(args)) => run_translate(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn load_runtime_config(flag: Option<&Path>) -> Result<MigrateConfig> {
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let path = resolve_config_path(flag, &cwd);
    debug!(path = %normalize_path(&path), "loading config");
    load_config(&path)
}

fn run_scan(config_flag: Option<&Path>, args: TargetArgs) -> Result<()> {
    let config = load_runtime_config(config_flag)?;
    let auth = AuthConfig::from_env()?;
    let report = scan(&config, &auth, &args.options(false))?;

    println!("scan");
    println!("template: {} ({})", report.template_code, report.guild_name);
    println!("server: {} ({})", report.server_id, report.server_name);
    println!("request_count: {}", report.request_count);
    print_warnings(&report.warnings);
    Ok(())
}

fn run_migrate(config_flag: Option<&Path>, args: MigrateArgs) -> Result<()> {
    let config = load_runtime_config(config_flag)?;
    let auth = AuthConfig::from_env()?;
    let report = run_migration(&config, &auth, &args.target.options(args.strict))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("migrate");
        println!("template: {}", report.template_code);
        println!("server: {}", report.server_id);
        println!("success: {}", format_flag(report.success));
        println!("roles_converted: {}", report.roles_converted);
        println!("channels_converted: {}", report.channels_converted);
        println!("categories: {}", report.categories);
        println!(
            "skipped_member_overwrites: {}",
            report.skipped_member_overwrites
        );
        println!("request_count: {}", report.request_count);
        print_warnings(&report.warnings);
    }

    if !report.success {
        bail!(
            "pre-flight scan reported {} warning(s); resolve them or rerun without --strict",
            report.warnings.len()
        );
    }
    Ok(())
}

fn run_template(config_flag: Option<&Path>, args: TemplateArgs) -> Result<()> {
    let config = load_runtime_config(config_flag)?;
    let template = fetch_template(&config, &args.code)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&template)?);
        return Ok(());
    }

    let guild = template.into_guild();
    println!("template: {}", args.code);
    println!("guild: {} ({})", guild.name, guild.id);
    println!("roles: {}", guild.roles.len());
    println!("categories: {}", guild.categories().count());
    println!(
        "channels: {}",
        guild.channels.len() - guild.categories().count()
    );
    println!("banner: {}", guild.banner_hash().unwrap_or("<none>"));
    println!(
        "system_channel: {}",
        guild.system_channel_id.as_deref().unwrap_or("<none>")
    );
    Ok(())
}

fn run_translate(args: TranslateArgs) -> Result<()> {
    let value = parse_discord_permissions(&args.value)?;
    let translated = translate_bits(&value);
    let unmapped = unmapped_bits(&value);

    println!("discord: {value}");
    println!("stoat: {translated}");
    println!("stoat_hex: {translated:#x}");
    if unmapped.is_empty() {
        println!("unmapped_bits: <none>");
    } else {
        let bits = unmapped
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("unmapped_bits: {bits}");
    }
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    println!("warnings: {}", warnings.len());
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
