//! Purpose: `gedis` CLI entry point: serve packages over RESP, check package sources.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Per-command wire failures never terminate the server process.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};

mod command_dispatch;
mod serve;

use gedis::api::{
    DEFAULT_POOL_SIZE, Error, ErrorKind, LogModule, MemModule, Module, check_dir, to_exit_code,
};
use gedis::resp::DEFAULT_MAX_FRAME_BYTES;

const DEFAULT_BIND: &str = "127.0.0.1:9091";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint(clap_error_hint(&err)),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    dispatch_command(cli.command)
        .map_err(add_io_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "gedis",
    version,
    about = "Redis-protocol command router for script packages",
    long_about = None,
    after_help = r#"EXAMPLES
  $ gedis serve --packages ./packages
  $ redis-cli -p 9091 calc.add 1 2
  $ redis-cli -p 9091 .package.add calc ./packages/calc
  $ gedis check ./packages/calc"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve packages over the Redis protocol",
        long_about = r#"Listen for RESP clients and route `<package>.<action>` commands to script packages.

Every subdirectory of --packages is loaded at startup under its directory name.
Packages can also be added and removed at runtime with `.package.add` / `.package.remove`."#
    )]
    Serve(ServeArgs),
    #[command(
        arg_required_else_help = true,
        about = "Compile package directories and report problems",
        long_about = r#"Compile every source file of each package directory without running it.

Prints a JSON report; exits non-zero if any package fails to compile."#
    )]
    Check {
        #[arg(required = true, value_hint = ValueHint::DirPath, help = "Package directories")]
        dirs: Vec<PathBuf>,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = DEFAULT_BIND, help = "Address to listen on (host:port)")]
    bind: String,
    #[arg(
        long,
        value_hint = ValueHint::DirPath,
        help = "Directory whose subdirectories are loaded as packages at startup"
    )]
    packages: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = DEFAULT_POOL_SIZE,
        help = "Maximum interpreter instances per package"
    )]
    pool_size: usize,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_FRAME_BYTES,
        help = "Largest accepted request frame, in bytes"
    )]
    max_frame_bytes: usize,
}

fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Serve(args) => {
            let config = serve_config_from_args(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Check { dirs } => {
            let (report, failure) = check_report(&dirs);
            emit_json(report);
            Ok(failure.map_or_else(RunOutcome::ok, |kind| {
                RunOutcome::with_code(to_exit_code(kind))
            }))
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "gedis", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
    }
}

fn serve_config_from_args(args: ServeArgs) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint(format!("Use a host:port value like {DEFAULT_BIND}."))
    })?;
    Ok(serve::ServeConfig {
        bind,
        packages: args.packages,
        pool_size: args.pool_size,
        max_frame_bytes: args.max_frame_bytes,
    })
}

/// Builds the `check` report and the kind of the first failure, if any.
fn check_report(dirs: &[PathBuf]) -> (Value, Option<ErrorKind>) {
    let modules: Vec<Arc<dyn Module>> = vec![Arc::new(MemModule::new()), Arc::new(LogModule)];
    let mut failure = None;
    let packages: Vec<Value> = dirs
        .iter()
        .map(|dir| match check_dir(dir, &modules) {
            Ok(files) => json!({
                "path": dir.display().to_string(),
                "files": files
                    .iter()
                    .map(|file| file.display().to_string())
                    .collect::<Vec<_>>(),
                "ok": true,
            }),
            Err(err) => {
                failure.get_or_insert(err.kind());
                json!({
                    "path": dir.display().to_string(),
                    "files": [],
                    "ok": false,
                    "error": error_json(&err)["error"].clone(),
                })
            }
        })
        .collect();
    (json!({ "packages": packages }), failure)
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check that the path exists and is readable.")
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Compile => "compile error".to_string(),
        ErrorKind::Script => "script error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(package) = err.package() {
        inner.insert("package".to_string(), json!(package));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(package) = err.package() {
        lines.push(format!(
            "{} {package}",
            colorize_label("package:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let subcommand = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .and_then(|usage| {
            let mut tokens = usage.split_whitespace().skip_while(|token| *token != "gedis");
            tokens.next()?;
            tokens.next().filter(|token| {
                !token.starts_with('-') && !token.starts_with('<') && !token.starts_with('[')
            })
        });
    match subcommand {
        Some(subcommand) => format!("Try `gedis {subcommand} --help`."),
        None => "Try `gedis --help`.".to_string(),
    }
}
