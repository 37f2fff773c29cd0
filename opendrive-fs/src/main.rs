use std::io::BufRead;

use anyhow::Context;
use opendrive_fs::config::{self, DriverConfig};
use opendrive_fs::dircache::listing::{DirEntry, Entry, FileEntry, ListSink, Visit};
use opendrive_fs::error::DriverError;
use opendrive_fs::fs::OpenDriveFs;
use opendrive_fs::logging;
use opendrive_fs::storage::PasswordStorage;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Ls(String),
    /// `None` depth falls back to the configured default.
    Lsr {
        path: String,
        depth: Option<Option<u32>>,
    },
    Mkdir(String),
    Rmdir(String),
    Stat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run(Command),
    SavePassword,
    ForgetPassword,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    json: bool,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut json = false;
    let mut flag_mode = None;
    let mut depth = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--save-password" => flag_mode = Some(CliMode::SavePassword),
            "--forget-password" => flag_mode = Some(CliMode::ForgetPassword),
            "--help" | "-h" => flag_mode = Some(CliMode::Help),
            "--json" => json = true,
            "--depth" => {
                let value = args.next().context("--depth needs a value")?;
                depth = Some(config::parse_depth(&value)?);
            }
            other if other.starts_with('-') && other.len() > 1 => {
                anyhow::bail!("unknown argument: {other}")
            }
            _ => positional.push(arg),
        }
    }

    if let Some(mode) = flag_mode {
        return Ok(Cli { mode, json });
    }

    let mut positional = positional.into_iter();
    let Some(command) = positional.next() else {
        return Ok(Cli {
            mode: CliMode::Help,
            json,
        });
    };
    let path = positional.next();
    if let Some(extra) = positional.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    if depth.is_some() && command != "lsr" {
        anyhow::bail!("--depth only applies to lsr");
    }
    let required = |path: Option<String>| path.with_context(|| format!("{command} needs a PATH"));
    let command = match command.as_str() {
        "ls" => Command::Ls(path.unwrap_or_default()),
        "lsr" => Command::Lsr {
            path: path.unwrap_or_default(),
            depth,
        },
        "mkdir" => Command::Mkdir(required(path)?),
        "rmdir" => Command::Rmdir(required(path)?),
        "stat" => Command::Stat(required(path)?),
        other => anyhow::bail!("unknown command: {other}"),
    };
    Ok(Cli {
        mode: CliMode::Run(command),
        json,
    })
}

fn print_usage() {
    println!("Usage: opendrive-fs [--json] <command>");
    println!("  ls [PATH]                 List a directory");
    println!("  lsr [PATH] [--depth N]    List recursively, breadth first (negative N = unbounded)");
    println!("  mkdir PATH                Create a directory and missing parents");
    println!("  rmdir PATH                Remove an empty directory");
    println!("  stat PATH                 Show one file or directory");
    println!("  --save-password           Store the account password in the keyring");
    println!("  --forget-password         Remove the stored password");
}

/// Writes entries to stdout as soon as the listing produces them.
struct PrintSink {
    json: bool,
    errors: usize,
}

impl PrintSink {
    fn print(&self, entry: &Entry) -> Visit {
        print_entry(entry, self.json);
        Visit::Continue
    }
}

impl ListSink for PrintSink {
    fn add_dir(&mut self, dir: DirEntry) -> Visit {
        self.print(&Entry::Dir(dir))
    }

    fn add_file(&mut self, file: FileEntry) -> Visit {
        self.print(&Entry::File(file))
    }

    fn set_error(&mut self, path: &str, err: DriverError) {
        self.errors += 1;
        eprintln!("opendrive-fs: cannot list {path}: {err}");
    }
}

fn print_entry(entry: &Entry, json: bool) {
    if json {
        match serde_json::to_string(entry) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("opendrive-fs: cannot encode {}: {err}", entry.path()),
        }
        return;
    }
    match entry {
        Entry::Dir(dir) => println!("{:>12}  {}/", "-", dir.path),
        Entry::File(file) => println!("{:>12}  {}", file.size, file.path),
    }
}

fn resolve_password(config: &DriverConfig) -> anyhow::Result<String> {
    if let Some(password) = &config.password {
        return Ok(password.clone());
    }
    let storage = PasswordStorage::new(&config.username)
        .context("failed to initialize password storage")?;
    storage.get_password().with_context(|| {
        format!(
            "no password for {}: set OPENDRIVE_PASSWORD or run --save-password",
            config.username
        )
    })
}

fn read_password_from_stdin() -> anyhow::Result<String> {
    eprint!("OpenDRIVE password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    anyhow::ensure!(!password.is_empty(), "empty password");
    Ok(password)
}

async fn run(command: Command, config: &DriverConfig, json: bool) -> anyhow::Result<()> {
    let password = resolve_password(config)?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling pending retries");
                cancel.cancel();
            }
        }
    });
    let fs = OpenDriveFs::connect_with_cancellation(config, &password, cancel)
        .await
        .context("failed to connect to OpenDRIVE")?;

    match command {
        Command::Ls(path) => {
            for entry in fs.list(&path).await.with_context(|| format!("ls {path}"))? {
                print_entry(&entry, json);
            }
        }
        Command::Lsr { path, depth } => {
            let mut sink = PrintSink { json, errors: 0 };
            let depth = depth.unwrap_or(fs.max_depth());
            let summary = fs
                .list_recursive(&path, depth, &mut sink)
                .await
                .with_context(|| format!("lsr {path}"))?;
            tracing::info!(
                dirs = summary.dirs,
                files = summary.files,
                failed = summary.failed,
                "listing finished"
            );
            anyhow::ensure!(
                sink.errors == 0,
                "{} director{} could not be listed",
                sink.errors,
                if sink.errors == 1 { "y" } else { "ies" }
            );
        }
        Command::Mkdir(path) => {
            let id = fs.mkdir(&path).await.with_context(|| format!("mkdir {path}"))?;
            if json {
                println!("{}", serde_json::json!({ "path": path, "id": id }));
            }
        }
        Command::Rmdir(path) => {
            fs.rmdir(&path).await.with_context(|| format!("rmdir {path}"))?;
        }
        Command::Stat(path) => {
            let entry = fs.stat(&path).await.with_context(|| format!("stat {path}"))?;
            print_entry(&entry, json);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli_mode(std::env::args())?;
    if cli.mode == CliMode::Help {
        print_usage();
        return Ok(());
    }

    logging::init_tracing()?;
    let config = DriverConfig::from_env()?;
    match cli.mode {
        CliMode::SavePassword => {
            let password = match &config.password {
                Some(password) => password.clone(),
                None => read_password_from_stdin()?,
            };
            PasswordStorage::new(&config.username)?.save_password(&password)?;
            eprintln!("[opendrive-fs] password saved for {}", config.username);
            Ok(())
        }
        CliMode::ForgetPassword => {
            PasswordStorage::new(&config.username)?.delete_password()?;
            eprintln!("[opendrive-fs] saved password removed for {}", config.username);
            Ok(())
        }
        CliMode::Run(command) => run(command, &config, cli.json).await,
        CliMode::Help => Ok(()),
    }
}
