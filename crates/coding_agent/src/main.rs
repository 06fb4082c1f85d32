use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use agent_provider::{cancel_signal, CancelSignal, CompletionProvider};
use anyhow::Context;
use clap::{Parser, Subcommand};
use coding_agent::agent::{Agent, CodeTaskOptions, CommandOptions};
use coding_agent::cancel::install_interrupt_handler;
use coding_agent::chat::ChatRepl;
use coding_agent::config::{persist_model, AgentConfig, PROVIDER_ENV_VAR};
use coding_agent::doctor::run_checks;
use coding_agent::logging;
use coding_agent::logs::DEFAULT_TAIL_LINES;
use coding_agent::models::{render_model_list, switch_model};
use coding_agent::patch::{apply_patch_file, preview_patch, PatchApplied};
use coding_agent::planner::PlannerOptions;
use coding_agent::providers::{provider_for_config, RequestIds};
use coding_agent::render::{render_session, render_session_list};
use coding_agent::safety::{Allowlist, SafetyGate, TerminalConfirmer};
use coding_agent::testgen::{TestTarget, TestgenOptions, DEFAULT_FRAMEWORK};
use coding_agent::tools::ToolRegistry;
use session_store::{SessionSelector, SessionStore};

/// Terminal coding agent backed by a hosted model.
#[derive(Debug, Parser)]
#[command(name = "nv", version)]
struct Cli {
    /// Config file (default: $CODING_AGENT_CONFIG_PATH or ~/.nvcli/config.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider id (`nim` or `mock`); overrides the config file.
    #[arg(long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan and execute a coding task.
    Code {
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
        /// Approve every step without asking.
        #[arg(long, short = 'y')]
        yes: bool,
        /// Print the plan and stop.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        model: Option<String>,
        /// Append to an existing session (`latest` or an id prefix).
        #[arg(long)]
        session: Option<SessionSelector>,
    },
    /// Run one shell command through the safety gate.
    Run {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        /// On failure, plan a fix and re-run (up to 3 times).
        #[arg(long)]
        fix: bool,
        #[arg(long, short = 'y')]
        yes: bool,
        /// Timeout in seconds for this command.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Interactive chat that resumes the latest session.
    Chat {
        /// Start a new session instead of resuming.
        #[arg(long)]
        new: bool,
        #[arg(long)]
        model: Option<String>,
    },
    /// Check or apply a unified diff.
    Patch {
        #[command(subcommand)]
        action: PatchAction,
    },
    /// Inspect saved sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Ask the model for a root-cause analysis of a log.
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },
    /// Generate tests for a file or one of its symbols (`file[:symbol]`).
    Testgen {
        target: TestTarget,
        /// Where to write the tests (default: test_<stem>[_<symbol>] next to the source).
        #[arg(long, short = 'o')]
        output: Option<String>,
        #[arg(long, default_value = DEFAULT_FRAMEWORK)]
        framework: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Check configuration, credentials and connectivity.
    Doctor,
    /// List or switch models.
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
}

#[derive(Debug, Subcommand)]
enum LogsAction {
    /// Analyze the tail of a log file, or stdin when no file is given.
    Analyze {
        file: Option<PathBuf>,
        /// Number of trailing lines to send.
        #[arg(long, default_value_t = DEFAULT_TAIL_LINES)]
        tail: usize,
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ModelsAction {
    List,
    /// Make MODEL the default and save it to the config file.
    Use { model: String },
}

#[derive(Debug, Subcommand)]
enum PatchAction {
    /// List the files a diff touches and check that it applies.
    Preview {
        file: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Confirm, then apply a diff.
    Apply {
        file: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsAction {
    List,
    Show {
        #[arg(default_value = "latest")]
        session: SessionSelector,
    },
}

fn main() -> ExitCode {
    logging::init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("nv: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // The doctor reports a broken config instead of failing on it.
    if matches!(cli.command, Command::Doctor) {
        return run_doctor(cli.config.as_deref(), cli.provider.as_deref());
    }
    let mut config = load_config(&cli)?;
    let cwd = std::env::current_dir().context("resolving current directory")?;

    match cli.command {
        Command::Code {
            task,
            yes,
            dry_run,
            model,
            session,
        } => {
            if let Some(model) = &model {
                config.model.clone_from(model);
            }
            let mut run_context = RunContext::open(&config, &cwd, session.as_ref(), model)?;
            let summary = run_context.agent(&config, yes, |agent| {
                agent.run_code_task(
                    &task.join(" "),
                    CodeTaskOptions {
                        dry_run: dry_run || config.dry_run,
                    },
                )
            })?;
            Ok(if summary.failed() == 0 && !summary.aborted {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Run {
            command,
            fix,
            yes,
            timeout,
        } => {
            let mut run_context = RunContext::open(&config, &cwd, None, None)?;
            let options = CommandOptions {
                fix,
                timeout_sec: timeout,
            };
            let outcome =
                run_context.agent(&config, yes, |agent| agent.run_command(&command.join(" "), &options))?;
            if outcome.fix_iterations > 0 {
                println!(
                    "{} after {} fix attempt(s).",
                    if outcome.succeeded() { "Passing" } else { "Still failing" },
                    outcome.fix_iterations
                );
            }
            Ok(command_exit_code(outcome.exit_code))
        }
        Command::Chat { new, model } => {
            if let Some(model) = &model {
                config.model.clone_from(model);
            }
            let provider = provider_for_config(&config)?;
            let cancel = cancel_signal();
            let _interrupts = install_interrupt_handler(cancel.clone())
                .context("installing the Ctrl+C handler")?;
            let request_ids = RequestIds::default();

            let mut repl = ChatRepl::open(
                provider.as_ref(),
                &request_ids,
                cancel,
                model,
                &config.session_root(&cwd),
                &cwd,
                new,
                io::stdin().lock(),
                io::stdout(),
            )?;
            repl.run()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Patch { action } => run_patch(action, &cwd),
        Command::Sessions { action } => {
            let root = config.session_root(&cwd);
            let mut stdout = io::stdout().lock();
            match action {
                SessionsAction::List => {
                    let sessions = SessionStore::list(&root)?;
                    write!(stdout, "{}", render_session_list(&sessions))?;
                }
                SessionsAction::Show { session } => {
                    let store = SessionStore::load(&root, &session)?;
                    write!(stdout, "{}", render_session(store.session()))?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs {
            action: LogsAction::Analyze { file, tail, model },
        } => {
            let (source, log) = match &file {
                Some(path) => (
                    path.display().to_string(),
                    fs::read_to_string(path)
                        .with_context(|| format!("reading log {}", path.display()))?,
                ),
                None => {
                    let mut log = String::new();
                    io::stdin()
                        .read_to_string(&mut log)
                        .context("reading log from stdin")?;
                    ("stdin".to_string(), log)
                }
            };
            let mut run_context = RunContext::open(&config, &cwd, None, model)?;
            run_context.agent(&config, false, |agent| agent.analyze_logs(&source, &log, tail))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Testgen {
            target,
            output,
            framework,
            model,
            yes,
        } => {
            let mut run_context = RunContext::open(&config, &cwd, None, model)?;
            let options = TestgenOptions { output, framework };
            let summary =
                run_context.agent(&config, yes, |agent| agent.generate_tests(&target, &options))?;
            Ok(if summary.executed() == 1 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Doctor => run_doctor(cli.config.as_deref(), cli.provider.as_deref()),
        Command::Models { action } => run_models(action, cli.config.as_deref(), &config),
    }
}

fn run_doctor(config_path: Option<&Path>, provider: Option<&str>) -> anyhow::Result<ExitCode> {
    let cwd = std::env::current_dir().context("resolving current directory")?;
    let config_path = config_path
        .map(Path::to_path_buf)
        .or_else(AgentConfig::default_path);
    let env = |key: &str| match provider {
        Some(provider) if key == PROVIDER_ENV_VAR => Some(provider.to_string()),
        _ => std::env::var(key).ok(),
    };

    println!("Checking nv environment...");
    let report = run_checks(config_path.as_deref(), env, &cwd, |config| {
        let provider = provider_for_config(config).map_err(|error| format!("{error:#}"))?;
        provider.list_models(cancel_signal())
    });
    print!("{}", report.render());
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_models(
    action: ModelsAction,
    config_path: Option<&Path>,
    config: &AgentConfig,
) -> anyhow::Result<ExitCode> {
    let provider = provider_for_config(config)?;
    match action {
        ModelsAction::List => {
            let models = provider
                .list_models(cancel_signal())
                .map_err(anyhow::Error::msg)
                .context("listing models")?;
            print!("{}", render_model_list(&models, &config.model, &config.base_url));
        }
        ModelsAction::Use { model } => {
            let profile = switch_model(provider.as_ref(), &model, cancel_signal())?;
            let path = config_path
                .map(Path::to_path_buf)
                .or_else(AgentConfig::default_path)
                .context("no config path; pass --config")?;
            persist_model(&path, &profile.model_id)?;
            println!(
                "Default model set to {} (saved to {})",
                profile.model_id,
                path.display()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load_with(Some(path), |key| std::env::var(key).ok()),
        None => AgentConfig::load(),
    }
    .context("loading configuration")?;

    if let Some(provider) = &cli.provider {
        config.provider.clone_from(provider);
        tracing::debug!(provider, "provider overridden on the command line");
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

/// Everything `nv code` and `nv run` share for one invocation.
struct RunContext {
    provider: Arc<dyn CompletionProvider>,
    store: SessionStore,
    tools: ToolRegistry,
    cancel: CancelSignal,
    workspace_root: PathBuf,
    model: Option<String>,
}

impl RunContext {
    fn open(
        config: &AgentConfig,
        cwd: &Path,
        selector: Option<&SessionSelector>,
        model: Option<String>,
    ) -> anyhow::Result<Self> {
        let provider = provider_for_config(config)?;
        let session_root = config.session_root(cwd);
        let store = match selector {
            Some(selector) => SessionStore::load(&session_root, selector)?,
            None => SessionStore::create_in(&session_root, cwd)?,
        };
        tracing::info!(session = store.id(), path = %store.path().display(), "session ready");

        let tools = ToolRegistry::new(cwd)
            .map_err(anyhow::Error::msg)
            .context("opening the workspace")?
            .with_shell_timeout(config.shell_timeout())
            .excluding(&session_root);

        Ok(Self {
            provider,
            store,
            tools,
            cancel: cancel_signal(),
            workspace_root: cwd.to_path_buf(),
            model,
        })
    }

    fn agent<T>(
        &mut self,
        config: &AgentConfig,
        yes: bool,
        body: impl FnOnce(&mut Agent<'_>) -> Result<T, coding_agent::AgentError>,
    ) -> anyhow::Result<T> {
        let _interrupts = install_interrupt_handler(self.cancel.clone())
            .context("installing the Ctrl+C handler")?;
        let request_ids = RequestIds::default();
        let mut confirmer = TerminalConfirmer::stdio(self.cancel.clone());
        let mut stdout = io::stdout();

        let mut agent = Agent {
            provider: self.provider.as_ref(),
            tools: &mut self.tools,
            gate: SafetyGate::new(Allowlist::new(&config.command_allowlist), yes),
            confirmer: &mut confirmer,
            store: &mut self.store,
            request_ids: &request_ids,
            cancel: self.cancel.clone(),
            out: &mut stdout,
            workspace_root: self.workspace_root.clone(),
            planner: PlannerOptions {
                max_steps: config.max_plan_steps,
                model: self.model.clone(),
            },
        };
        Ok(body(&mut agent)?)
    }
}

fn run_patch(action: PatchAction, cwd: &Path) -> anyhow::Result<ExitCode> {
    let mut stdout = io::stdout().lock();
    match action {
        PatchAction::Preview { file, root } => {
            let diff = read_diff(&file)?;
            let root = root.unwrap_or_else(|| cwd.to_path_buf());
            preview_patch(&diff, &root, &mut stdout)
                .with_context(|| format!("checking {} under {}", file.display(), root.display()))?;
            Ok(ExitCode::SUCCESS)
        }
        PatchAction::Apply { file, root, yes } => {
            let diff = read_diff(&file)?;
            let root = root.unwrap_or_else(|| cwd.to_path_buf());
            let cancel = cancel_signal();
            let _interrupts = install_interrupt_handler(cancel.clone())
                .context("installing the Ctrl+C handler")?;
            let mut gate = SafetyGate::new(Allowlist::default(), yes);
            let mut confirmer = TerminalConfirmer::stdio(cancel.clone());

            let applied =
                apply_patch_file(&diff, &root, &mut gate, &mut confirmer, &cancel, &mut stdout)
                    .with_context(|| {
                        format!("applying {} under {}", file.display(), root.display())
                    })?;
            Ok(match applied {
                PatchApplied::Applied(_) => ExitCode::SUCCESS,
                PatchApplied::Rejected => ExitCode::FAILURE,
            })
        }
    }
}

fn read_diff(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading diff {}", path.display()))
}

/// The command's own status when it ran; 1 when it never completed.
fn command_exit_code(exit_code: Option<i32>) -> ExitCode {
    match exit_code.and_then(|code| u8::try_from(code).ok()) {
        Some(code) => ExitCode::from(code),
        None => ExitCode::FAILURE,
    }
}
