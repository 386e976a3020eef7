//! Helper tool status and installation.
//!
//! The relay shells out to two external tools: the stdio bridge (installed
//! globally with npm) and the tunnel binary (installed with Homebrew). This
//! module answers "what's installed?" and installs what's missing, reporting
//! progress over a channel so a CLI or UI can render it.

use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Which helper tools are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    pub ngrok: bool,
    pub supergateway: bool,
    pub brew: bool,
}

impl DependencyStatus {
    pub fn all_present(&self) -> bool {
        self.ngrok && self.supergateway
    }
}

/// One step of [`DependencyManager::install_missing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub total: usize,
    pub current: usize,
    pub current_package: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DepsError {
    #[error("Homebrew is not installed. Please install Homebrew first: https://brew.sh")]
    BrewMissing,
    #[error("ngrok is not installed. Please install dependencies first.")]
    NgrokMissing,
    #[error("Auth token is required")]
    EmptyToken,
    #[error("Failed to install {package} with {installer}")]
    InstallFailed { package: String, installer: String },
    #[error("Failed to configure ngrok: {0}")]
    Configure(String),
    #[error("Failed to run {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
enum Installer {
    Brew,
    Npm,
}

/// Program names used for probing and installing. Overridable for tests.
#[derive(Debug, Clone)]
pub struct DependencyManager {
    pub ngrok: String,
    pub npm: String,
    pub brew: String,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self {
            ngrok: "ngrok".to_string(),
            npm: "npm".to_string(),
            brew: "brew".to_string(),
        }
    }
}

impl DependencyManager {
    /// Probe `ngrok --version`, `npm list -g supergateway` and `brew --version`.
    pub async fn check(&self) -> DependencyStatus {
        let (ngrok, supergateway, brew) = tokio::join!(
            succeeds(&self.ngrok, &["--version"]),
            succeeds(&self.npm, &["list", "-g", "supergateway"]),
            succeeds(&self.brew, &["--version"]),
        );
        DependencyStatus {
            ngrok,
            supergateway,
            brew,
        }
    }

    /// Install every missing tool, sending one progress event per package and
    /// a final summary. Homebrew must be present.
    pub async fn install_missing(
        &self,
        progress: &mpsc::Sender<InstallProgress>,
    ) -> Result<(), DepsError> {
        let status = self.check().await;
        if !status.brew {
            return Err(DepsError::BrewMissing);
        }

        let mut plan = Vec::new();
        if !status.ngrok {
            plan.push(("ngrok", Installer::Brew));
        }
        if !status.supergateway {
            plan.push(("supergateway", Installer::Npm));
        }

        let total = plan.len();
        for (index, (package, installer)) in plan.into_iter().enumerate() {
            let _ = progress
                .send(InstallProgress {
                    total,
                    current: index + 1,
                    current_package: package.to_string(),
                    message: format!("Installing {package}..."),
                })
                .await;
            self.install(package, installer).await?;
        }

        if total > 0 {
            let _ = progress
                .send(InstallProgress {
                    total,
                    current: total,
                    current_package: String::new(),
                    message: "All dependencies installed successfully!".to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn install(&self, package: &str, installer: Installer) -> Result<(), DepsError> {
        let (program, args, name): (&str, Vec<&str>, &str) = match installer {
            Installer::Brew => (self.brew.as_str(), vec!["install", package], "brew"),
            Installer::Npm => (self.npm.as_str(), vec!["install", "-g", package], "npm"),
        };
        info!(package, installer = name, "Installing dependency");
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DepsError::Io {
                program: program.to_string(),
                source,
            })?;
        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "{name} install {package} finished"
        );
        if output.status.success() {
            Ok(())
        } else {
            Err(DepsError::InstallFailed {
                package: package.to_string(),
                installer: name.to_string(),
            })
        }
    }

    /// Store the tunnel auth token with `ngrok config add-authtoken`.
    pub async fn configure_ngrok(&self, authtoken: &str) -> Result<(), DepsError> {
        let token = authtoken.trim();
        if token.is_empty() {
            return Err(DepsError::EmptyToken);
        }
        if !succeeds(&self.ngrok, &["--version"]).await {
            return Err(DepsError::NgrokMissing);
        }
        let output = Command::new(&self.ngrok)
            .args(["config", "add-authtoken", token])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DepsError::Io {
                program: self.ngrok.clone(),
                source,
            })?;
        if output.status.success() {
            info!("ngrok configured successfully");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).into_owned()
        } else {
            stderr.into_owned()
        };
        Err(DepsError::Configure(detail.trim().to_string()))
    }
}

/// Whether `program args…` runs and exits successfully.
async fn succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ngrok: &str, npm: &str, brew: &str) -> DependencyManager {
        DependencyManager {
            ngrok: ngrok.to_string(),
            npm: npm.to_string(),
            brew: brew.to_string(),
        }
    }

    #[tokio::test]
    async fn check_reflects_exit_status() {
        let status = manager("true", "false", "no-such-brew-xyz").check().await;
        assert_eq!(
            status,
            DependencyStatus {
                ngrok: true,
                supergateway: false,
                brew: false,
            }
        );
        assert!(!status.all_present());
    }

    #[tokio::test]
    async fn install_requires_brew() {
        let (tx, _rx) = mpsc::channel(4);
        let err = manager("false", "false", "false")
            .install_missing(&tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DepsError::BrewMissing));
    }

    #[tokio::test]
    async fn nothing_missing_sends_no_progress() {
        let (tx, mut rx) = mpsc::channel(4);
        manager("true", "true", "true").install_missing(&tx).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_install_reports_package() {
        let (tx, mut rx) = mpsc::channel(4);
        let err = manager("false", "false", "true")
            .install_missing(&tx)
            .await
            .unwrap_err();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.current_package, "ngrok");
        // `true install ngrok` succeeds, `false install -g supergateway` doesn't.
        assert!(matches!(
            err,
            DepsError::InstallFailed { ref package, .. } if package == "supergateway"
        ));
    }

    #[tokio::test]
    async fn empty_authtoken_is_rejected() {
        let err = manager("true", "true", "true")
            .configure_ngrok("   ")
            .await
            .unwrap_err();
        assert!(matches!(err, DepsError::EmptyToken));
    }

    #[tokio::test]
    async fn configure_requires_ngrok() {
        let err = manager("false", "true", "true")
            .configure_ngrok("tok")
            .await
            .unwrap_err();
        assert!(matches!(err, DepsError::NgrokMissing));
    }
}
