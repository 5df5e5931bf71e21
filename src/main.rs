mod action;
mod adb;
mod agent;
mod bridge;
mod config;
mod cron;
mod dashboard;
mod emulator;
mod errors;
mod gateway;
mod heartbeat;
mod logbuf;
mod model;
mod paths;
mod relay;
mod scaler;
mod script;
mod session;
mod skills;
mod supervisor;
mod telegram;
mod testapp;
mod tunnel;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::adb::AdbClient;
use crate::agent::{AgentDeps, AgentEvent, AgentLoop, TaskHandle, TaskState};
use crate::bridge::HumanAuthBridge;
use crate::config::Config;
use crate::emulator::EmulatorManager;
use crate::errors::TaskError;
use crate::paths::Paths;
use crate::script::ScriptExecutor;
use crate::skills::SkillLoader;
use crate::telegram::TelegramClient;

#[derive(Parser)]
#[command(name = "openpocket", version, about = "Local always-on phone-use agent")]
struct Cli {
    /// Override the config file path.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Symlink the binary into ~/.local/bin.
    InstallCli,
    /// Create the config file and directory layout.
    Onboard,
    /// Print the normalized config (secrets masked).
    ConfigShow,
    /// Emulator lifecycle and raw input.
    Emulator {
        #[command(subcommand)]
        action: EmulatorCommand,
    },
    /// Run a single task against the device.
    Agent {
        #[arg(long)]
        model: Option<String>,
        /// The task, in natural language.
        task: Vec<String>,
    },
    /// Skill inspection.
    Skills {
        #[command(subcommand)]
        action: SkillsCommand,
    },
    /// Sandboxed script execution.
    Script {
        #[command(subcommand)]
        action: ScriptCommand,
    },
    /// Telegram bot setup.
    Telegram {
        #[command(subcommand)]
        action: TelegramCommand,
    },
    /// The long-running chat gateway.
    Gateway {
        #[command(subcommand)]
        action: GatewayCommand,
    },
    /// Read-only dashboard API.
    Dashboard {
        #[command(subcommand)]
        action: DashboardCommand,
    },
    /// Standalone human-auth relay service.
    HumanAuthRelay {
        #[command(subcommand)]
        action: RelayCommand,
    },
    /// Test fixtures.
    Test {
        #[command(subcommand)]
        action: TestCommand,
    },
}

#[derive(Subcommand)]
enum EmulatorCommand {
    Status,
    Start,
    Stop,
    Hide,
    Show,
    ListAvds,
    Screenshot {
        #[arg(long)]
        out: Option<String>,
    },
    Tap {
        #[arg(long)]
        x: i64,
        #[arg(long)]
        y: i64,
        #[arg(long)]
        device: Option<String>,
    },
    Type {
        #[arg(long)]
        text: String,
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(Subcommand)]
enum SkillsCommand {
    List,
}

#[derive(Subcommand)]
enum ScriptCommand {
    Run {
        #[arg(long, conflicts_with = "text")]
        file: Option<String>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TelegramCommand {
    /// Store the bot token in the config and verify it.
    Setup {
        #[arg(long)]
        token: Option<String>,
    },
    /// Show the configured bot identity.
    Whoami,
}

#[derive(Subcommand)]
enum GatewayCommand {
    Start,
}

#[derive(Subcommand)]
enum DashboardCommand {
    Start {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum RelayCommand {
    Start {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        public_base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        state_file: Option<String>,
    },
}

#[derive(Subcommand)]
enum TestCommand {
    /// Drive the bundled permission test app.
    PermissionApp {
        #[command(subcommand)]
        action: PermissionAppCommand,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct PermissionAppArgs {
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    clean: bool,
    #[arg(long)]
    case: Option<String>,
    #[arg(long)]
    send: bool,
    #[arg(long)]
    chat: Option<i64>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Subcommand, Debug)]
enum PermissionAppCommand {
    Deploy(PermissionAppArgs),
    Install(PermissionAppArgs),
    Launch(PermissionAppArgs),
    Reset(PermissionAppArgs),
    Uninstall(PermissionAppArgs),
    Task(PermissionAppArgs),
    Run(PermissionAppArgs),
    Cases,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openpocket=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("OPENPOCKET_CONFIG_PATH", path);
    }

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            let kind = e
                .downcast_ref::<TaskError>()
                .map(|t| t.kind)
                .unwrap_or(crate::errors::ErrorKind::Internal);
            eprintln!("error: {}: {}", kind, root_detail(&e));
            std::process::exit(kind.exit_code());
        }
    }
}

fn root_detail(e: &anyhow::Error) -> String {
    match e.downcast_ref::<TaskError>() {
        Some(t) => t.detail.clone(),
        None => e.to_string(),
    }
}

/// Config problems are user errors, not infrastructure failures.
fn load_config(paths: &Paths) -> anyhow::Result<Config> {
    Config::load(paths).map_err(|e| {
        TaskError::new(crate::errors::ErrorKind::ConfigInvalid, e.to_string()).into()
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = Paths::resolve();

    match cli.command {
        Command::InstallCli => install_cli(),
        Command::Onboard => onboard(&paths),
        Command::ConfigShow => {
            let config = load_config(&paths)?;
            println!("{}", masked_config_json(&config)?);
            Ok(())
        }
        Command::Emulator { action } => {
            let config = load_config(&paths)?;
            let adb = AdbClient::new(Some(config.emulator.device.clone()));
            let emulator = EmulatorManager::new(config.emulator.clone(), adb.clone());
            match action {
                EmulatorCommand::Status => {
                    let status = emulator.status().await?;
                    println!("AVD:     {}", status.avd_name);
                    println!("Devices: {}", status.devices.join(", "));
                    println!("Booted:  {}", status.booted_devices.join(", "));
                }
                EmulatorCommand::Start => println!("{}", emulator.start(true).await?),
                EmulatorCommand::Stop => println!("{}", emulator.stop().await?),
                EmulatorCommand::Hide => println!("{}", emulator.hide_window().await?),
                EmulatorCommand::Show => println!("{}", emulator.show_window().await?),
                EmulatorCommand::ListAvds => {
                    for avd in emulator.list_avds().await? {
                        println!("{}", avd);
                    }
                }
                EmulatorCommand::Screenshot { out } => {
                    let device = adb.select_device(None).await?;
                    let png = adb.capture_screenshot(&device).await?;
                    let out = out.unwrap_or_else(|| "screenshot.png".into());
                    std::fs::write(&out, &png)?;
                    println!("Saved {} bytes to {}", png.len(), out);
                }
                EmulatorCommand::Tap { x, y, device } => {
                    let device = adb.select_device(device.as_deref()).await?;
                    println!("{}", adb.tap(&device, x, y).await?);
                }
                EmulatorCommand::Type { text, device } => {
                    let device = adb.select_device(device.as_deref()).await?;
                    println!("{}", adb.type_text(&device, &text).await?);
                }
            }
            Ok(())
        }
        Command::Agent { model, task } => {
            let task_text = task.join(" ");
            if task_text.trim().is_empty() {
                anyhow::bail!("usage: openpocket agent [--model <name>] <task>");
            }
            let config = Arc::new(load_config(&paths)?);
            let outcome = run_cli_agent(config, &paths, &task_text, model).await;
            println!(
                "{}: {} ({} step(s))",
                match outcome.state {
                    TaskState::Succeeded => "succeeded",
                    TaskState::Cancelled => "cancelled",
                    _ => "failed",
                },
                outcome.message,
                outcome.steps
            );
            if let Some(kind) = outcome.error {
                return Err(TaskError::new(kind, outcome.message).into());
            }
            Ok(())
        }
        Command::Skills { action: SkillsCommand::List } => {
            let config = load_config(&paths)?;
            let loader = SkillLoader::new(&paths.home, &PathBuf::from(&config.paths.workspace));
            let skills = loader.load();
            if skills.is_empty() {
                println!("No skills installed.");
            }
            for skill in skills {
                println!(
                    "{:<20} {:<10} {}",
                    skill.id,
                    format!("{:?}", skill.source).to_lowercase(),
                    skill.description
                );
            }
            Ok(())
        }
        Command::Script { action: ScriptCommand::Run { file, text, timeout } } => {
            let config = load_config(&paths)?;
            let script = match (file, text) {
                (Some(path), None) => std::fs::read_to_string(path)?,
                (None, Some(text)) => text,
                _ => anyhow::bail!("usage: openpocket script run [--file <path> | --text <script>]"),
            };
            let executor = ScriptExecutor::new(
                config.script_executor.clone(),
                PathBuf::from(&config.paths.workspace).join("scripts").join("runs"),
            );
            let result = executor.execute(&script, timeout).await?;
            println!(
                "ok={} exit={:?} timed_out={} duration={}ms",
                result.ok, result.exit_code, result.timed_out, result.duration_ms
            );
            if !result.run_dir.is_empty() {
                println!("artifacts: {}", result.run_dir);
            }
            if !result.stdout.is_empty() {
                println!("--- stdout ---\n{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                println!("--- stderr ---\n{}", result.stderr);
            }
            if !result.ok {
                let kind = if result.timed_out {
                    crate::errors::ErrorKind::ScriptTimeout
                } else if result.run_dir.is_empty() {
                    crate::errors::ErrorKind::ScriptBlocked
                } else {
                    crate::errors::ErrorKind::ScriptFailed
                };
                return Err(TaskError::new(kind, result.stderr).into());
            }
            Ok(())
        }
        Command::Telegram { action } => {
            let mut config = load_config(&paths)?;
            match action {
                TelegramCommand::Setup { token } => {
                    let token = token
                        .or_else(|| config.telegram.resolve_token())
                        .ok_or_else(|| {
                            anyhow::anyhow!(
                                "no token: pass --token or set {}",
                                config.telegram.bot_token_env
                            )
                        })?;
                    let client = TelegramClient::new(token.clone(), 10);
                    let me = client.get_me().await?;
                    config.telegram.bot_token = token;
                    config.save(&paths.config_file())?;
                    println!(
                        "Bot @{} ({}) saved to config.",
                        me.username.unwrap_or_default(),
                        me.first_name
                    );
                }
                TelegramCommand::Whoami => {
                    let token = config.telegram.resolve_token().ok_or_else(|| {
                        anyhow::anyhow!("no Telegram token configured; run `openpocket telegram setup`")
                    })?;
                    let client = TelegramClient::new(token, 10);
                    let me = client.get_me().await?;
                    println!(
                        "Bot: @{} ({}) id={}",
                        me.username.unwrap_or_default(),
                        me.first_name,
                        me.id
                    );
                }
            }
            Ok(())
        }
        Command::Gateway { action: GatewayCommand::Start } => {
            paths.ensure_layout()?;
            info!("openpocket gateway v{}", env!("CARGO_PKG_VERSION"));
            supervisor::run(paths).await
        }
        Command::Dashboard { action: DashboardCommand::Start { host, port } } => {
            let config = load_config(&paths)?;
            let adb = AdbClient::new(Some(config.emulator.device.clone()));
            let state = dashboard::DashboardState {
                adb: adb.clone(),
                emulator: EmulatorManager::new(config.emulator.clone(), adb),
                gateway_status: None,
                log: None,
            };
            let host = host.unwrap_or_else(|| config.dashboard.host.clone());
            let port = port.unwrap_or(config.dashboard.port);
            dashboard::serve(&host, port, state).await
        }
        Command::HumanAuthRelay {
            action: RelayCommand::Start { host, port, public_base_url, api_key, state_file },
        } => {
            let config = load_config(&paths)?;
            let relay_config = relay::RelayServerConfig {
                host: host.unwrap_or_else(|| "127.0.0.1".into()),
                port: port.unwrap_or(config.human_auth.local_relay_port),
                public_base_url: public_base_url
                    .unwrap_or_else(|| config.human_auth.public_base_url.clone()),
                api_key: api_key
                    .or_else(|| config.human_auth.resolve_api_key())
                    .unwrap_or_default(),
                state_file: state_file
                    .map(PathBuf::from)
                    .unwrap_or_else(|| paths.relay_state_file()),
            };
            relay::serve(relay_config).await
        }
        Command::Test { action: TestCommand::PermissionApp { action } } => {
            run_permission_app(&paths, action).await
        }
    }
}

// ── One-shot agent (CLI `agent` verb and `test permission-app run`) ─────────

async fn run_cli_agent(
    config: Arc<Config>,
    paths: &Paths,
    task_text: &str,
    model: Option<String>,
) -> agent::TaskOutcome {
    let _ = paths.ensure_layout();
    let adb = AdbClient::new(Some(config.emulator.device.clone()));
    let bridge = Arc::new(HumanAuthBridge::new(
        config.human_auth.clone(),
        paths.auth_artifacts_dir(),
    ));
    let deps = AgentDeps {
        config: config.clone(),
        adb,
        bridge,
        script: ScriptExecutor::new(
            config.script_executor.clone(),
            PathBuf::from(&config.paths.workspace).join("scripts").join("runs"),
        ),
        skills: SkillLoader::new(&paths.home, &PathBuf::from(&config.paths.workspace)),
    };

    let (model_name, _, warning) = config.resolve_profile(model.as_deref());
    if let Some(w) = warning {
        println!("{}", w);
    }
    let handle = TaskHandle::new(None, task_text, &model_name);

    // Ctrl-C cancels cooperatively.
    let cancel_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling after the current step…");
            cancel_handle.cancel();
        }
    });

    let notify: Arc<dyn Fn(AgentEvent) + Send + Sync> = Arc::new(|event| match event {
        AgentEvent::AuthOpened(opened) => {
            println!("Approval needed ({}): {}", opened.capability, opened.instruction);
            if let Some(url) = &opened.open_url {
                println!("  open: {}", url);
            }
            println!("  or via chat: /auth approve {}", opened.id);
        }
        AgentEvent::Progress { step, message } => {
            println!("[{}] {}", step, message);
        }
    });

    AgentLoop::new(deps, handle, notify).run().await
}

async fn run_permission_app(paths: &Paths, action: PermissionAppCommand) -> anyhow::Result<()> {
    use crate::testapp::*;

    if let PermissionAppCommand::Cases = action {
        print!("{}", cases_text());
        return Ok(());
    }

    let config = Arc::new(load_config(paths)?);

    let (args, verb): (PermissionAppArgs, &str) = match &action {
        PermissionAppCommand::Deploy(a) => (a.clone(), "deploy"),
        PermissionAppCommand::Install(a) => (a.clone(), "install"),
        PermissionAppCommand::Launch(a) => (a.clone(), "launch"),
        PermissionAppCommand::Reset(a) => (a.clone(), "reset"),
        PermissionAppCommand::Uninstall(a) => (a.clone(), "uninstall"),
        PermissionAppCommand::Task(a) => (a.clone(), "task"),
        PermissionAppCommand::Run(a) => (a.clone(), "run"),
        PermissionAppCommand::Cases => unreachable!(),
    };

    let case = match &args.case {
        Some(id) => Some(
            find_case(id)
                .ok_or_else(|| anyhow::anyhow!("unknown case '{}'; see `cases`", id))?,
        ),
        None => None,
    };

    match verb {
        "task" => {
            println!("{}", canonical_task(case));
            return Ok(());
        }
        "run" => {
            let task = canonical_task(case);
            let outcome =
                run_cli_agent(config.clone(), paths, &task, args.model.clone()).await;
            let summary = format!(
                "permission-app run {}: {}",
                match outcome.state {
                    TaskState::Succeeded => "succeeded",
                    TaskState::Cancelled => "cancelled",
                    _ => "failed",
                },
                outcome.message
            );
            println!("{}", summary);
            if args.send {
                let chat = args
                    .chat
                    .ok_or_else(|| anyhow::anyhow!("--send requires --chat <id>"))?;
                let token = config.telegram.resolve_token().ok_or_else(|| {
                    anyhow::anyhow!("no Telegram token configured for --send")
                })?;
                let client = TelegramClient::new(token, 10);
                client
                    .send_message(chat, &gateway::sanitize::sanitize_outbound(&summary))
                    .await?;
            }
            if let Some(kind) = outcome.error {
                return Err(TaskError::new(kind, outcome.message).into());
            }
            return Ok(());
        }
        _ => {}
    }

    let adb = AdbClient::new(Some(config.emulator.device.clone()));
    let driver = TestAppDriver::connect(adb, args.device.as_deref()).await?;
    let message = match verb {
        "deploy" => driver.deploy(args.clean).await?,
        "install" => driver.install().await?,
        "launch" => driver.launch(case).await?,
        "reset" => driver.reset().await?,
        "uninstall" => driver.uninstall().await?,
        _ => unreachable!(),
    };
    println!("{}", message);
    Ok(())
}

// ── Small verbs ─────────────────────────────────────────────────────────────

fn install_cli() -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let home = std::env::var("HOME")?;
    let bin_dir = PathBuf::from(&home).join(".local").join("bin");
    std::fs::create_dir_all(&bin_dir)?;
    let target = bin_dir.join("openpocket");
    if target.exists() {
        std::fs::remove_file(&target)?;
    }
    std::os::unix::fs::symlink(&exe, &target)?;
    println!("Linked {} -> {}", target.display(), exe.display());

    // OPENPOCKET_SKIP_ENV_SETUP suppresses shell-profile advice (set by
    // installers that manage PATH themselves).
    let skip_env = std::env::var("OPENPOCKET_SKIP_ENV_SETUP")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false);
    let on_path = std::env::var("PATH")
        .map(|p| p.split(':').any(|seg| seg == bin_dir.to_string_lossy()))
        .unwrap_or(false);
    if !on_path && !skip_env {
        println!(
            "Note: {} is not on your PATH; add it to your shell profile.",
            bin_dir.display()
        );
    }
    Ok(())
}

fn onboard(paths: &Paths) -> anyhow::Result<()> {
    paths.ensure_layout()?;
    let created = !paths.config_file().exists();
    let _ = Config::load(paths)?;
    if created {
        println!("Created {}", paths.config_file().display());
    } else {
        println!("Config already present at {}", paths.config_file().display());
    }

    let onboarding = serde_json::json!({
        "completedAt": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    paths::write_atomic(
        &paths.onboarding_file(),
        serde_json::to_string_pretty(&onboarding)?.as_bytes(),
    )?;
    println!("Workspace ready under {}", paths.home.display());
    println!("Next: `openpocket telegram setup --token <bot-token>` then `openpocket gateway start`");
    Ok(())
}

fn masked_config_json(config: &Config) -> anyhow::Result<String> {
    let mut value = serde_json::to_value(config)?;
    mask_keys(&mut value);
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Replace non-empty secret values so `config-show` is safe to paste.
fn mask_keys(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let is_secret = matches!(key.as_str(), "apiKey" | "botToken");
                if is_secret {
                    if let Some(s) = v.as_str() {
                        if !s.is_empty() {
                            *v = serde_json::Value::String("***".into());
                        }
                    }
                } else {
                    mask_keys(v);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                mask_keys(item);
            }
        }
        _ => {}
    }
}
