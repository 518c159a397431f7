use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tether_core::builtin::{self, PROCESS_RUN, PROCESS_RUN_SHELL};
use tether_core::{AppBuilder, LogFormat, LoggingConfig};
use tether_tools::{FieldClass, InputGuard, ToolEvent};

#[derive(Parser)]
#[command(name = "tether", version)]
#[command(about = "Guarded subprocess execution and output shaping for CLI tool adapters", long_about = None)]
struct Cli {
    /// Config file (falls back to TETHER_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program through the policy gate and print the shaped result
    Run {
        /// Working directory
        #[arg(long)]
        cwd: Option<String>,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Treat the first word as a shell script; the rest become $1..$n
        #[arg(long)]
        shell: bool,
        /// Pass only PATH from this environment
        #[arg(long)]
        clean_env: bool,
        /// Always emit the full structured payload
        #[arg(long)]
        full: bool,
        /// Program (or script) followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Invoke a registered tool with JSON parameters
    Call {
        name: String,
        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },
    /// List advertised tools
    Tools {
        /// Activate every deferred tool first
        #[arg(long)]
        all: bool,
    },
    /// Load and validate the configuration
    Check,
    /// Check a value the way adapters check positional arguments
    Guard {
        field: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
        #[arg(long, value_enum, default_value_t = ClassArg::Identifier)]
        class: ClassArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Identifier,
    Path,
    Text,
    Message,
}

impl From<ClassArg> for FieldClass {
    fn from(class: ClassArg) -> Self {
        match class {
            ClassArg::Identifier => Self::Identifier,
            ClassArg::Path => Self::Path,
            ClassArg::Text => Self::Text,
            ClassArg::Message => Self::Message,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let app = AppBuilder::load(cli.config.as_deref())?;
    init_subscriber(&app.config().logging);
    tracing::debug!(path = %app.config_path().display(), "configuration loaded");

    match cli.command {
        Commands::Check => {
            let policy = app.build_policy()?;
            println!("configuration ok: {}", app.config_path().display());
            println!(
                "families with command rules: {}",
                policy.families_with_command_rules().join(", ")
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Guard {
            field,
            value,
            class,
        } => {
            let guard = InputGuard::new(app.config().tools.limits);
            match guard.check_positional(&value, &field, class.into()) {
                Ok(()) => {
                    println!("ok");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Tools { all } => {
            let runtime = app.build(None).await?;
            if all {
                runtime.registry.activate_all();
            }
            print!("{}", runtime.registry.format_listing());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Call { name, params } => {
            let params: serde_json::Value = serde_json::from_str(&params)?;
            call_and_print(&app, &name, params).await
        }
        Commands::Run {
            cwd,
            timeout,
            shell,
            clean_env,
            full,
            command,
        } => {
            let mut words = command.into_iter();
            let first = words.next().unwrap_or_default();
            let args: Vec<String> = words.collect();
            let (name, params) = if shell {
                (
                    PROCESS_RUN_SHELL,
                    serde_json::json!({
                        "script": first, "args": args, "cwd": cwd,
                        "timeout_secs": timeout, "clean_env": clean_env, "full_output": full,
                    }),
                )
            } else {
                (
                    PROCESS_RUN,
                    serde_json::json!({
                        "program": first, "args": args, "cwd": cwd,
                        "timeout_secs": timeout, "clean_env": clean_env, "full_output": full,
                    }),
                )
            };
            call_and_print(&app, name, params).await
        }
    }
}

async fn call_and_print(
    app: &AppBuilder,
    name: &str,
    params: serde_json::Value,
) -> anyhow::Result<ExitCode> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let runtime = app.build(Some(tx)).await?;
    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_tool_event(&event);
        }
    });

    // Operator invocations may reach deferred tools without a discovery round-trip.
    if name != tether_tools::DISCOVER_TOOL {
        let _ = runtime.registry.activate(name);
    }
    let result = builtin::call(&runtime.host, &runtime.registry, name, params).await;
    drop(runtime);
    let _ = forward.await;

    match result {
        Ok(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope.to_tool_result())?);
            Ok(if envelope.is_error {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Err(e) => {
            tracing::warn!(category = ?e.category(), "{e}");
            eprintln!("error: {e}");
            Ok(ExitCode::from(2))
        }
    }
}

fn log_tool_event(event: &ToolEvent) {
    match event {
        ToolEvent::Started { command, .. } => tracing::debug!(command, "tool started"),
        ToolEvent::Completed {
            command,
            exit_code,
            duration_ms,
            ..
        } => tracing::debug!(command, exit_code, duration_ms, "tool completed"),
        ToolEvent::Failed { command, error, .. } => {
            tracing::debug!(command, error, "tool failed");
        }
    }
}

fn init_subscriber(logging: &LoggingConfig) {
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.filter));
    let fmt_layer = match logging.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
