use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use comfy_table::Table;
use common::{EnvironmentConfig, RotationJob, ServiceConfig, ValidatedServices};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about = "Inspect and run logwheel rotation schedules", long_about = None)]
struct Cli {
    /// Directory holding one service file per environment
    #[arg(long, global = true, default_value = common::DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,
    /// Timezone cron expressions are evaluated in
    #[arg(long, global = true, default_value = common::DEFAULT_TIMEZONE)]
    timezone: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an environment and list its services
    Check {
        env: String,
    },
    /// Show upcoming rotation times
    Next {
        env: String,
        /// Only this service
        #[arg(short, long)]
        service: Option<String>,
        /// How many fire times per service
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Run one rotation pass now
    Rotate {
        env: String,
        /// Only this service
        #[arg(short, long)]
        service: Option<String>,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let timezone = common::parse_timezone(&cli.timezone)?;

    match cli.command {
        Commands::Check { env } => {
            let validated = load(&cli.config_dir, &env)?;
            let mut table = Table::new();
            table.set_header(vec!["Service", "Naming", "Compression", "Max MB", "Retain", "Schedule", "Next fire"]);

            let mut bad_schedules = 0;
            for service in &validated.services {
                let next = match common::compute_next_fire(&service.cron_schedule, &Utc::now().with_timezone(&timezone)) {
                    Ok(next) => next.to_string(),
                    Err(e) => {
                        bad_schedules += 1;
                        format!("invalid: {}", e)
                    }
                };
                table.add_row(vec![
                    service.name.clone(),
                    naming_label(service),
                    service.compression.to_string(),
                    service.max_size_mb.to_string(),
                    service.retain_count.to_string(),
                    service.cron_schedule.clone(),
                    next,
                ]);
            }
            println!("{table}");

            for rejected in &validated.rejected {
                eprintln!("Rejected {}: {}", rejected.label, rejected.error);
            }
            if validated.rejected.is_empty() && bad_schedules == 0 {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Next { env, service, count } => {
            let validated = load(&cli.config_dir, &env)?;
            let now = Utc::now().with_timezone(&timezone);
            let mut table = Table::new();
            table.set_header(vec!["Service", "Schedule", "Fire time"]);

            for config in select(&validated, service.as_deref())? {
                let expr = common::parse_cron(&config.cron_schedule)
                    .with_context(|| format!("Service {}", config.name))?;
                for fire in expr.upcoming(&now, count) {
                    table.add_row(vec![config.name.clone(), expr.to_string(), fire.to_string()]);
                }
            }
            println!("{table}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rotate { env, service } => {
            let validated = load(&cli.config_dir, &env)?;
            let mut table = Table::new();
            table.set_header(vec!["Service", "Source", "Archive"]);
            let mut failed = false;

            for config in select(&validated, service.as_deref())? {
                match RotationJob::new(config.clone()).run() {
                    Ok(report) => {
                        for rotated in &report.rotated {
                            table.add_row(vec![
                                report.service.clone(),
                                rotated.source.display().to_string(),
                                rotated.archive.display().to_string(),
                            ]);
                        }
                        for failure in &report.failures {
                            failed = true;
                            eprintln!("{}: {}: {}", report.service, failure.path.display(), failure.error);
                        }
                        println!(
                            "{}: rotated {}, deleted {} old archive(s), retaining {}",
                            report.service,
                            report.rotated.len(),
                            report.retention.deleted.len(),
                            report.retain_count
                        );
                    }
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: rotation failed: {}", config.name, e);
                    }
                }
            }
            println!("{table}");
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}

fn load(config_dir: &Path, env: &str) -> anyhow::Result<ValidatedServices> {
    let environment = EnvironmentConfig::load(config_dir, env)
        .with_context(|| format!("Failed to load environment '{}'", env))?;
    Ok(environment.validate())
}

fn select<'a>(validated: &'a ValidatedServices, name: Option<&str>) -> anyhow::Result<Vec<&'a ServiceConfig>> {
    match name {
        None => Ok(validated.services.iter().collect()),
        Some(name) => validated
            .services
            .iter()
            .find(|s| s.name == name)
            .map(|s| vec![s])
            .ok_or_else(|| anyhow::anyhow!("No valid service named '{}'", name)),
    }
}

fn naming_label(service: &ServiceConfig) -> String {
    match &service.custom_name {
        Some(custom) => format!("{} ({})", service.file_naming, custom),
        None => service.file_naming.to_string(),
    }
}
