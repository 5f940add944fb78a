use std::{
    env,
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::Parser;
use flying::{Client, FlyingError, MultiWriter};

#[derive(Parser, Debug)]
#[command(
    name = "flying",
    about = "Runs a command and appends its stamped output to flying.<command>.log",
    override_usage = "flying command [args]..."
)]
struct Cli {
    /// Command to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            match err.downcast_ref::<FlyingError>() {
                Some(FlyingError::Exit(status)) => status
                    .code()
                    .and_then(|c| u8::try_from(c).ok())
                    .map(ExitCode::from)
                    .unwrap_or(ExitCode::FAILURE),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(command: &[String]) -> anyhow::Result<()> {
    let path = log_path(&command[0])?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;

    let log = MultiWriter::new(vec![Box::new(file), Box::new(io::stdout())]);
    Client::new(log).run(command).await?;
    Ok(())
}

/// `flying.<command>.log` beside the flying executable.
fn log_path(program: &str) -> anyhow::Result<PathBuf> {
    let exe = env::current_exe().context("locating the flying executable")?;
    let dir = exe.parent().unwrap_or(Path::new("."));
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string());
    Ok(dir.join(format!("flying.{name}.log")))
}
