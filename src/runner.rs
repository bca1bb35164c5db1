//! External model runner.
//!
//! The phylogenetic regression is fitted by an R script. This module only
//! resolves the interpreter, hands it the tree and table paths plus the three
//! output paths, and captures everything it prints into the fit log.

use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::pipeline::ArtifactPaths;

/// Locates `name` on `PATH`, or accepts it as-is when it is an existing path.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 && path.is_file() {
        return Ok(path.to_path_buf());
    }

    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let full_path = dir.join(name);
            if full_path.is_file() {
                return Ok(full_path);
            }
        }
    }

    Err(PipelineError::input(format!(
        "{} not found in PATH. Please install it or add it to your PATH.",
        name
    )))
}

#[derive(Debug, Clone)]
pub struct ModelRunner {
    program: PathBuf,
    script: PathBuf,
}

impl ModelRunner {
    /// # Errors
    /// `PipelineError::Input` if the interpreter or the script cannot be found.
    pub fn new(program: &str, script: &Path) -> Result<Self> {
        let program = find_executable(program)?;
        if !script.is_file() {
            return Err(PipelineError::input(format!(
                "model script not found: {}",
                script.display()
            )));
        }
        Ok(Self {
            program,
            script: script.to_path_buf(),
        })
    }

    fn command_line(&self, paths: &ArtifactPaths) -> Vec<PathBuf> {
        vec![
            self.script.clone(),
            paths.tree.clone(),
            paths.filtered.clone(),
            paths.result.clone(),
            paths.model.clone(),
            paths.results_row.clone(),
        ]
    }

    /// Runs the fit, blocking until the interpreter exits.
    ///
    /// Both output streams are written to `paths.fit_log`. On a non-zero exit
    /// `paths.err_log` receives the exit status and the command line.
    pub fn run(&self, paths: &ArtifactPaths) -> Result<()> {
        let args = self.command_line(paths);
        let log = File::create(&paths.fit_log)?;

        info!("Fitting model with {}", self.script.display());
        debug!("Command: {} {:?}", self.program.display(), args);
        let start = Instant::now();

        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .status()
            .map_err(|e| {
                PipelineError::input(format!("failed to launch {}: {}", self.program.display(), e))
            })?;

        if !status.success() {
            let rendered: Vec<String> = std::iter::once(self.program.display().to_string())
                .chain(args.iter().map(|a| a.display().to_string()))
                .collect();
            fs::write(
                &paths.err_log,
                format!("exit status: {}\ncommand: {}\n", status, rendered.join(" ")),
            )?;
            error!("Model runner failed, see {}", paths.fit_log.display());
            return Err(PipelineError::ModelRunner {
                code: status.code(),
                log: paths.fit_log.clone(),
            });
        }

        info!("Model fit finished in {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}
