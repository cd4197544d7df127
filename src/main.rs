use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use treesel::listing;
use treesel::{EngineConfig, FileRecord, SelectionSession};

/// Main treesel entry point
#[derive(Parser)]
#[command(name = "treesel")]
#[command(about = "Show tri-state folder selection for a directory after a scripted set of selections")]
#[command(version = "0.1.0")]
#[command(long_about = None)]
struct Cli {
  /// Directory to scan for files (defaults to current dir)
  #[arg(value_name = "DIRECTORY")]
  directory: Option<PathBuf>,

  /// File or folder to select, relative to DIRECTORY (repeatable)
  #[arg(long, value_name = "PATH")]
  select: Vec<PathBuf>,

  /// File or folder to deselect, applied after every --select (repeatable)
  #[arg(long, value_name = "PATH")]
  deselect: Vec<PathBuf>,

  /// Select every file before applying --select/--deselect
  #[arg(long)]
  all: bool,

  /// Read engine settings from this file instead of the user config
  #[arg(long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Enable verbose output for debugging
  #[arg(short, long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  if let Err(e) = run(cli).await {
    eprintln!("Error: {}", e);

    // print the error chain for debugging
    let mut source = e.source();
    while let Some(err) = source {
      eprintln!("  Caused by: {}", err);
      source = err.source();
    }

    std::process::exit(1);
  }

  Ok(())
}

/// Installs the stderr log subscriber, RUST_LOG wins over --verbose.
fn init_logging(verbose: bool) {
  use tracing_subscriber::{fmt, EnvFilter};

  let default_level = if verbose { "treesel=debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn run(cli: Cli) -> Result<()> {
  let target_directory = cli.directory.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

  // validate that the dir exists
  if !target_directory.exists() {
    anyhow::bail!("Directory does not exist: {}", target_directory.display());
  }

  if !target_directory.is_dir() {
    anyhow::bail!("Path is not a directory: {}", target_directory.display());
  }

  let mut config = match &cli.config {
    Some(path) => EngineConfig::load_from(path)?,
    None => EngineConfig::load().unwrap_or_else(|e| {
      tracing::warn!(error = %e, "could not load user config, using defaults");
      EngineConfig::default()
    }),
  };
  // scripted gestures are never repeated clicks
  config.coalesce_window_ms = 0;

  let root = target_directory.canonicalize().with_context(|| format!("Error: failed to resolve directory: {}", target_directory.display()))?;
  let files = listing::scan_directory(&root)?;
  tracing::debug!(root = %root.display(), entries = files.len(), "listing ready");

  let session = SelectionSession::with_files(config, &files);

  if cli.all {
    session.select_all(&files).await;
  }
  for path in &cli.select {
    apply(&session, &root, path, true).await;
  }
  for path in &cli.deselect {
    apply(&session, &root, path, false).await;
  }

  session.wait_idle().await;
  print_states(&session, &root, &files);
  session.shutdown();

  Ok(())
}

/// Selects or deselects one file or folder given relative to the root.
async fn apply(session: &SelectionSession, root: &Path, relative: &Path, selected: bool) {
  let path = root.join(relative).to_string_lossy().into_owned();
  let index = session.cache().index();

  if index.contains_directory(&path) {
    session.toggle_folder(&path, selected).await;
  } else if index.contains_file(&path) {
    if session.is_selected(&path) != selected {
      session.toggle_file(&path).await;
    }
  } else {
    eprintln!("Warning: nothing selectable at {}", relative.display());
  }
}

/// Prints the root and every listed directory with its checkbox marker.
fn print_states(session: &SelectionSession, root: &Path, files: &[FileRecord]) {
  let root_path = root.to_string_lossy();
  println!("{} .", session.get(&root_path).marker());

  for record in files.iter().filter(|record| record.is_directory) {
    let relative = Path::new(&record.path).strip_prefix(root).unwrap_or(Path::new(&record.path));
    println!("{} {}", session.get(&record.path).marker(), relative.display());
  }

  println!("{} file(s) selected", session.selected_file_count());
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  #[test]
  fn test_cli_parsing() {
    // test default case
    let cli = Cli::parse_from(["treesel"]);
    assert!(cli.directory.is_none());
    assert!(!cli.verbose);
    assert!(!cli.all);

    let cli = Cli::parse_from(["treesel", "/tmp", "--select", "src", "--select", "README.md", "--deselect", "src/gen"]);
    assert_eq!(cli.directory, Some(PathBuf::from("/tmp")));
    assert_eq!(cli.select, vec![PathBuf::from("src"), PathBuf::from("README.md")]);
    assert_eq!(cli.deselect, vec![PathBuf::from("src/gen")]);

    let cli = Cli::parse_from(["treesel", "--all", "-v", "--config", "engine.json"]);
    assert!(cli.all);
    assert!(cli.verbose);
    assert_eq!(cli.config, Some(PathBuf::from("engine.json")));
  }

  #[tokio::test]
  async fn test_apply_gestures() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();
    fs::create_dir(root.join("src")).unwrap();
    fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
    fs::write(root.join("src/lib.rs"), "").unwrap();
    fs::write(root.join("README.md"), "# readme").unwrap();

    let files = listing::scan_directory(&root).unwrap();
    let config = EngineConfig {
      use_worker: false,
      coalesce_window_ms: 0,
      ..EngineConfig::default()
    };
    let session = SelectionSession::with_files(config, &files);

    apply(&session, &root, Path::new("src"), true).await;
    apply(&session, &root, Path::new("src/lib.rs"), false).await;
    apply(&session, &root, Path::new("README.md"), true).await;
    // selecting twice must not flip it back
    apply(&session, &root, Path::new("README.md"), true).await;
    session.wait_idle().await;

    assert_eq!(session.selected_file_count(), 2);
    assert_eq!(session.cache().get(&root.join("src").to_string_lossy()), treesel::SelectionState::Partial);
  }

  #[tokio::test]
  async fn test_run_rejects_missing_directory() {
    let cli = Cli::parse_from(["treesel", "/this/path/does/not/exist"]);
    assert!(run(cli).await.is_err());
  }
}
