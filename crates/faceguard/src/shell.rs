//! Host-side controls around a [`FaceGuard`]: button enablement, the status
//! line, the enrolled-user list and export/import files.

use crate::events::{StatusKind, StatusLine};
use crate::guard::{FaceGuard, GuardError, GuardState};
use faceguard_core::{format_file_size, StorageData};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Shown in place of the user list when nobody is enrolled.
pub const NO_USERS_TEXT: &str = "No users enrolled";

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Please enter a name")]
    EmptyName,
    #[error("invalid file format: {0}")]
    InvalidFormat(String),
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Guard(#[from] GuardError),
}

/// Which controls are enabled (or, for `retry`, shown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlState {
    pub start: bool,
    pub stop: bool,
    pub name_input: bool,
    pub enroll: bool,
    pub clear: bool,
    pub export: bool,
    pub import: bool,
    pub retry: bool,
}

/// One enrolled user in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserChip {
    pub label: String,
    pub count: usize,
}

pub struct HostShell {
    guard: FaceGuard,
    name_input: String,
}

impl HostShell {
    pub fn new(guard: FaceGuard) -> Self {
        Self {
            guard,
            name_input: String::new(),
        }
    }

    pub fn guard(&self) -> &FaceGuard {
        &self.guard
    }

    pub fn guard_mut(&mut self) -> &mut FaceGuard {
        &mut self.guard
    }

    pub fn controls(&self) -> ControlState {
        let state = self.guard.state();
        let loaded = state.models_loaded();
        ControlState {
            start: state.can_start(),
            stop: *state == GuardState::Live,
            name_input: loaded,
            enroll: *state == GuardState::Live,
            clear: loaded,
            export: loaded,
            import: loaded,
            retry: matches!(state, GuardState::Error { .. }),
        }
    }

    pub fn status_line(&self) -> StatusLine {
        self.guard.status().clone()
    }

    /// Enrolled users sorted by label.
    pub fn user_chips(&self) -> Vec<UserChip> {
        let mut chips: Vec<UserChip> = self
            .guard
            .identities()
            .iter()
            .map(|u| UserChip {
                label: u.label.clone(),
                count: u.sample_count(),
            })
            .collect();
        chips.sort_by(|a, b| a.label.cmp(&b.label));
        chips
    }

    /// Text lines for the user list, `"Alice (2)"` per user.
    pub fn user_list_lines(&self) -> Vec<String> {
        let chips = self.user_chips();
        if chips.is_empty() {
            return vec![NO_USERS_TEXT.to_string()];
        }
        chips
            .into_iter()
            .map(|chip| format!("{} ({})", chip.label, chip.count))
            .collect()
    }

    pub fn name_input(&self) -> &str {
        &self.name_input
    }

    pub fn set_name_input(&mut self, name: impl Into<String>) {
        self.name_input = name.into();
    }

    pub async fn attach(&mut self) -> Result<(), ShellError> {
        Ok(self.guard.attach().await?)
    }

    pub async fn start(&mut self) -> Result<(), ShellError> {
        Ok(self.guard.start().await?)
    }

    pub fn stop(&mut self) {
        self.guard.stop();
    }

    /// Retry after an error: restarts the camera when that is what failed.
    /// Model failures need a fresh component and are left as they are.
    pub async fn retry(&mut self) -> Result<(), ShellError> {
        if self.guard.state().can_start() {
            self.start().await?;
        }
        Ok(())
    }

    /// Enroll `name`, clearing the name input on success.
    pub async fn submit_enroll(&mut self, name: &str) -> Result<usize, ShellError> {
        let name = name.trim();
        if name.is_empty() {
            self.guard
                .report_status(ShellError::EmptyName.to_string(), StatusKind::Error);
            return Err(ShellError::EmptyName);
        }
        let count = self.guard.enroll(name).await?;
        self.name_input.clear();
        Ok(count)
    }

    pub async fn delete_user(&mut self, label: &str) -> Result<bool, ShellError> {
        Ok(self.guard.delete_identity(label).await?)
    }

    pub async fn clear_users(&mut self) -> Result<(), ShellError> {
        Ok(self.guard.clear_identities().await?)
    }

    /// Write the gallery to `faceguard-users-YYYY-MM-DD.json` in `dir`.
    pub async fn export_to(&mut self, dir: &Path) -> Result<PathBuf, ShellError> {
        let data = self.guard.export_snapshot().await?;
        let path = dir.join(export_file_name(chrono::Utc::now().date_naive()));

        let written = async {
            let json = serde_json::to_string_pretty(&data)?;
            tokio::fs::write(&path, &json).await?;
            Ok::<_, ShellError>(json.len())
        }
        .await;

        match written {
            Ok(size) => {
                self.guard.report_status(
                    format!(
                        "Exported {} users ({})",
                        data.users.len(),
                        format_file_size(size as u64)
                    ),
                    StatusKind::Ready,
                );
                tracing::info!(path = %path.display(), users = data.users.len(), "users exported");
                Ok(path)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "export failed");
                self.guard.report_status("Export failed", StatusKind::Error);
                Err(e)
            }
        }
    }

    /// Replace the gallery with the contents of an export file.
    ///
    /// The envelope is checked before typed parsing; on any failure the
    /// store is left as it was.
    pub async fn import_from(&mut self, path: &Path) -> Result<usize, ShellError> {
        let data = match read_export_file(path).await {
            Ok(data) => data,
            Err(e) => {
                self.guard.import_failed(&e);
                return Err(e);
            }
        };
        Ok(self.guard.import_snapshot(&data).await?)
    }
}

/// `faceguard-users-2024-05-01.json`
pub fn export_file_name(date: chrono::NaiveDate) -> String {
    format!("faceguard-users-{}.json", date.format("%Y-%m-%d"))
}

/// Parse an export file, rejecting anything whose `users` is not an array.
pub async fn read_export_file(path: &Path) -> Result<StorageData, ShellError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_export(&text)
}

pub fn parse_export(text: &str) -> Result<StorageData, ShellError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.get("users").is_some_and(serde_json::Value::is_array) {
        return Err(ShellError::InvalidFormat("`users` must be an array".into()));
    }
    Ok(serde_json::from_value(value)?)
}
