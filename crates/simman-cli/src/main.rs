use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simman_runner::{
    MetadataRecord, MetadataRecorder, PathSet, RunError, SimmanConfig, SimulationSession,
    CONFIG_FILE, CONFIG_TEMPLATE,
};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "simman", version, about = "Reproducible simulation run manager")]
struct Cli {
    /// Config file; defaults to the nearest .simman.yaml above the working directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum SubpatchAction {
    /// Write the patch stream of the current repository to stdout.
    Make,
    /// Apply a patch stream read from stdin to the current repository.
    Apply,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside a new sealed run directory.
    Run {
        name: String,
        #[arg(long, env = "SIMMAN_ROOT")]
        root: Option<PathBuf>,
        #[arg(long)]
        source_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    Subpatch {
        #[command(subcommand)]
        action: SubpatchAction,
    },
    /// Rebuild the code state recorded in a run directory.
    Checkout {
        output_dir: PathBuf,
        #[arg(long)]
        repo: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Seal {
        dir: PathBuf,
        #[arg(long)]
        no_recursive: bool,
        #[arg(long)]
        json: bool,
    },
    Unseal {
        dir: PathBuf,
        #[arg(long)]
        no_recursive: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the layout and recorded metadata of a run directory.
    Paths {
        output_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, cli.config.as_deref());
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SIMMAN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(config: Option<&Path>) -> Result<SimmanConfig> {
    let config = match config {
        Some(path) => SimmanConfig::load(path)?,
        None => SimmanConfig::discover(&std::env::current_dir()?)?,
    };
    debug!(
        root_dir = ?config.root_dir,
        source_dir = %config.source_dir.display(),
        "resolved config"
    );
    Ok(config)
}

fn run_command(command: Commands, config_path: Option<&Path>) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            name,
            root,
            source_dir,
            json,
            command,
        } => {
            let mut config = load_config(config_path)?.with_root_dir(root);
            if let Some(dir) = source_dir {
                config.source_dir = dir;
            }
            let session = SimulationSession::from_config(&name, &config)?
                .with_command(simman_runner::shell_join(&command));
            let mut run_dir = None;
            let outcome = session.run(|paths| {
                run_dir = Some(paths.output_dir().to_path_buf());
                run_in_paths(&command, paths)
            });
            let run_dir = run_dir.unwrap_or_default();
            match outcome {
                Ok(status) => {
                    info!(run_dir = %run_dir.display(), status, "run finished");
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "run",
                            "run_dir": run_dir.display().to_string(),
                            "exit_status": status,
                        })));
                    }
                    println!("run_dir: {}", run_dir.display());
                    println!("exit_status: {}", status);
                }
                Err(RunError::Body { error, finalize }) => {
                    if let Some(fin) = finalize {
                        eprintln!("seal incomplete: {}", fin);
                    }
                    return Err(error.context(format!("run {} failed", run_dir.display())));
                }
                Err(RunError::Setup(e)) | Err(RunError::Finalize(e)) => return Err(e.into()),
            }
        }
        Commands::Subpatch { action } => {
            let config = load_config(config_path)?;
            let recorder = MetadataRecorder::new(config.volatile_paths);
            let cwd = std::env::current_dir()?;
            match action {
                SubpatchAction::Make => {
                    let stream = recorder.make_patch(&cwd)?;
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(stream.as_bytes())?;
                    stdout.flush()?;
                }
                SubpatchAction::Apply => {
                    let mut stream = String::new();
                    std::io::stdin().read_to_string(&mut stream)?;
                    recorder.apply_patch(&stream, &cwd)?;
                }
            }
        }
        Commands::Checkout {
            output_dir,
            repo,
            json,
        } => {
            let config = load_config(config_path)?;
            let repo = match repo {
                Some(r) => r,
                None => std::env::current_dir()?,
            };
            let recorder = MetadataRecorder::new(config.volatile_paths);
            let record = simman_runner::checkout_simulation(&output_dir, &repo, &recorder)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "checkout",
                    "output_dir": output_dir.display().to_string(),
                    "commit_id": record.commit_id,
                    "chunks": record.patch.chunks.len(),
                })));
            }
            println!("commit_id: {}", record.commit_id);
            println!("chunks: {}", record.patch.chunks.len());
        }
        Commands::Seal {
            dir,
            no_recursive,
            json,
        } => {
            simman_runner::seal(&dir, !no_recursive)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "seal",
                    "dir": dir.display().to_string(),
                })));
            }
            println!("sealed: {}", dir.display());
        }
        Commands::Unseal {
            dir,
            no_recursive,
            json,
        } => {
            simman_runner::unseal(&dir, !no_recursive)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "unseal",
                    "dir": dir.display().to_string(),
                })));
            }
            println!("unsealed: {}", dir.display());
        }
        Commands::Paths { output_dir, json } => {
            if !output_dir.is_dir() {
                return Err(anyhow!("not a run directory: {}", output_dir.display()));
            }
            let paths = PathSet::for_output_dir(&output_dir);
            let (record, record_error) = load_record(&paths);
            let payload = paths_to_json(&paths, record.as_ref(), record_error.as_deref());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "paths",
                    "paths": payload,
                })));
            }
            print_paths(&paths, record.as_ref(), record_error.as_deref());
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join(CONFIG_FILE);
            if !force && path.exists() {
                return Err(anyhow!(
                    "config already exists (use --force): {}",
                    path.display()
                ));
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: set root_dir in {}", CONFIG_FILE);
        }
    }
    Ok(None)
}

/// Runs `command` with its output captured under `logs/`.
fn run_in_paths(command: &[String], paths: &PathSet) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("no command given"))?;
    let stdout = File::create(paths.logs_dir().join("stdout.log"))?;
    let stderr = File::create(paths.logs_dir().join("stderr.log"))?;
    let status = Command::new(program)
        .args(args)
        .env("SIMMAN_OUTPUT_DIR", paths.output_dir())
        .env("SIMMAN_DATA_DIR", paths.data_dir())
        .env("SIMMAN_LOGS_DIR", paths.logs_dir())
        .env("SIMMAN_SIMULATION_DIR", paths.simulation_dir())
        .env("SIMMAN_RESULTS_DIR", paths.results_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()
        .map_err(|e| anyhow!("failed to spawn {}: {}", program, e))?;
    match status.code() {
        Some(0) => Ok(0),
        Some(code) => Err(anyhow!("{} exited with status {}", program, code)),
        None => Err(anyhow!("{} terminated by signal", program)),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Checkout { json, .. }
        | Commands::Seal { json, .. }
        | Commands::Unseal { json, .. }
        | Commands::Paths { json, .. } => *json,
        _ => false,
    }
}

/// A missing or damaged record is reported, not treated as absent.
fn load_record(paths: &PathSet) -> (Option<MetadataRecord>, Option<String>) {
    match MetadataRecord::load(paths) {
        Ok(record) => (Some(record), None),
        Err(e) => (None, Some(e.to_string())),
    }
}

fn paths_to_json(
    paths: &PathSet,
    record: Option<&MetadataRecord>,
    record_error: Option<&str>,
) -> Value {
    json!({
        "output_dir": paths.output_dir().display().to_string(),
        "data": paths.data_dir().display().to_string(),
        "logs": paths.logs_dir().display().to_string(),
        "simulation": paths.simulation_dir().display().to_string(),
        "results": paths.results_dir().display().to_string(),
        "commit_id": record.map(|r| r.commit_id.clone()),
        "captured_at": record.map(|r| r.captured_at.to_rfc3339()),
        "command": record.and_then(|r| r.command.clone()),
        "sealed": paths.sealed_marker().exists(),
        "failed": paths.error_marker().exists(),
        "record_error": record_error,
    })
}

fn print_paths(paths: &PathSet, record: Option<&MetadataRecord>, record_error: Option<&str>) {
    println!("output_dir: {}", paths.output_dir().display());
    println!("data: {}", paths.data_dir().display());
    println!("logs: {}", paths.logs_dir().display());
    println!("simulation: {}", paths.simulation_dir().display());
    println!("results: {}", paths.results_dir().display());
    if let Some(record) = record {
        println!("commit_id: {}", record.commit_id);
        println!("captured_at: {}", record.captured_at.to_rfc3339());
        if let Some(command) = &record.command {
            println!("command: {}", command);
        }
    }
    println!("sealed: {}", paths.sealed_marker().exists());
    println!("failed: {}", paths.error_marker().exists());
    if let Some(e) = record_error {
        println!("record_error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_trailing_command() {
        let cli = Cli::try_parse_from([
            "simman", "run", "dice", "--root", "/tmp/out", "python", "dice.py", "--seed", "3",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                name,
                root,
                command,
                ..
            } => {
                assert_eq!(name, "dice");
                assert_eq!(root, Some(PathBuf::from("/tmp/out")));
                assert_eq!(command, vec!["python", "dice.py", "--seed", "3"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn subpatch_actions_parse() {
        let cli = Cli::try_parse_from(["simman", "subpatch", "make"]).expect("make");
        assert!(matches!(
            cli.command,
            Commands::Subpatch {
                action: SubpatchAction::Make
            }
        ));
        let cli = Cli::try_parse_from(["simman", "subpatch", "apply"]).expect("apply");
        assert!(matches!(
            cli.command,
            Commands::Subpatch {
                action: SubpatchAction::Apply
            }
        ));
    }

    #[test]
    fn json_error_envelope_shape() {
        let v = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(v["ok"], json!(false));
        assert_eq!(v["error"]["code"], json!("command_failed"));
        assert_eq!(v["error"]["message"], json!("boom"));
    }

    #[test]
    fn paths_json_without_record() {
        let paths = PathSet::for_output_dir("/tmp/out/dice/0");
        let v = paths_to_json(&paths, None, None);
        assert_eq!(v["simulation"], json!("/tmp/out/dice/0/simulation"));
        assert_eq!(v["commit_id"], Value::Null);
        assert_eq!(v["record_error"], Value::Null);
    }

    #[test]
    fn damaged_record_is_reported() {
        let dir = std::env::temp_dir().join(format!(
            "simman_cli_paths_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join(".commit_id"), "a".repeat(40)).expect("commit id");
        std::fs::write(dir.join(".patch"), "not a patch stream\n").expect("patch");

        let paths = PathSet::for_output_dir(&dir);
        let (record, error) = load_record(&paths);
        assert!(record.is_none());
        let error = error.expect("load error");
        assert!(error.contains(".patch"), "{}", error);

        let v = paths_to_json(&paths, record.as_ref(), Some(error.as_str()));
        assert_eq!(v["record_error"], json!(error));
        assert_eq!(v["commit_id"], Value::Null);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
