use std::{io, path::PathBuf, process::ExitStatus, time::Duration};
use tokio::process::Command;

#[derive(Clone, Debug)]
pub struct Config {
    /// The `ovn-nbctl` executable.
    pub path: PathBuf,

    /// The northbound database to connect to. When unset, `ovn-nbctl` uses its
    /// own default.
    pub db: Option<String>,

    /// Bounds how long `ovn-nbctl` waits on the database.
    pub timeout: Option<Duration>,
}

/// Runs `ovn-nbctl` commands.
#[derive(Clone, Debug)]
pub struct Nbctl {
    config: Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to run {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("ovn-nbctl {command} failed ({status}): {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ovn-nbctl"),
            db: None,
            timeout: None,
        }
    }
}

// === impl Nbctl ===

impl Nbctl {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The global options that precede every command.
    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(2);
        if let Some(db) = &self.config.db {
            args.push(format!("--db={db}"));
        }
        if let Some(timeout) = self.config.timeout {
            // ovn-nbctl only accepts whole seconds; zero disables the timeout.
            args.push(format!("--timeout={}", timeout.as_secs().max(1)));
        }
        args
    }

    /// Runs a command, returning its trimmed standard output.
    pub(crate) async fn run(&self, args: &[&str]) -> Result<String, Error> {
        let command = args.join(" ");
        tracing::debug!(%command, "Running ovn-nbctl");

        let output = Command::new(&self.config.path)
            .args(self.global_args())
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                path: self.config.path.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::Exit {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::trace!(%stdout);
        Ok(stdout)
    }
}
