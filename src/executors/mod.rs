//! Executors that serve capability requests for a real project.
//!
//! [`PipelineExecutor`] routes each request to the configured shell command and
//! falls back to the built-in git commit for `publish` and the webhook (or a
//! disabled notifier) for `notify`.

mod command;
mod webhook;

pub use command::CommandExecutor;
pub use webhook::WebhookNotifier;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::capability::{
    Capability, CapabilityRequest, ExecutionResult, PublishRequest, TaskExecutor,
};
use crate::config::GateworkConfig;
use crate::error::{ExecutorError, PipelineError};
use crate::git::GitManager;

pub struct PipelineExecutor {
    commands: CommandExecutor,
    workdir: PathBuf,
    state_dir: String,
    webhook: Option<WebhookNotifier>,
}

impl PipelineExecutor {
    pub fn from_config(config: &GateworkConfig, workdir: &Path) -> Result<Self, PipelineError> {
        if config.command_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "command_timeout_secs must be greater than zero".into(),
            ));
        }
        let commands = CommandExecutor::new(
            config.executors.clone(),
            workdir,
            Duration::from_secs(config.command_timeout_secs),
        );
        let webhook = match config.executors.webhook_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Some(WebhookNotifier::new(url)?),
            _ => None,
        };
        let state_dir = config
            .state_dir
            .strip_prefix(workdir)
            .unwrap_or(&config.state_dir)
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            commands,
            workdir: workdir.to_path_buf(),
            state_dir,
            webhook,
        })
    }

    /// Commit on the blocking pool so the other wrap-up branches keep running.
    async fn publish_builtin(&self, request: &PublishRequest) -> Result<ExecutionResult, ExecutorError> {
        let workdir = self.workdir.clone();
        let state_dir = self.state_dir.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || commit_with_git(&workdir, &state_dir, &request))
            .await
            .map_err(|e| ExecutorError::Failed(format!("publish task failed: {e}")))?
    }

    async fn notify_builtin(&self, text: &str) -> Result<ExecutionResult, ExecutorError> {
        match &self.webhook {
            Some(webhook) => {
                webhook.send(text).await?;
                Ok(ExecutionResult {
                    summary: "notification sent".into(),
                    ..Default::default()
                })
            }
            None => {
                warn!("no notify command or webhook configured, notifications disabled");
                Ok(ExecutionResult {
                    summary: "notifications disabled".into(),
                    ..Default::default()
                })
            }
        }
    }
}

fn commit_with_git(
    workdir: &Path,
    state_dir: &str,
    request: &PublishRequest,
) -> Result<ExecutionResult, ExecutorError> {
    let git = GitManager::open(workdir)
        .map_err(|e| ExecutorError::Failed(format!("{e:#}")))?
        .exclude_dir(state_dir);
    let (hash, summary) = match request {
        PublishRequest::Commit {
            item_id,
            title,
            category,
            ..
        } => {
            let hash = git
                .commit_item(item_id, title, category)
                .map_err(|e| ExecutorError::Failed(format!("{e:#}")))?;
            (hash, format!("committed {item_id}"))
        }
        PublishRequest::Summary { text } => {
            let message = format!("gatework: project complete\n\n{text}");
            let hash = git
                .commit(&message)
                .map_err(|e| ExecutorError::Failed(format!("{e:#}")))?;
            (hash, "published completion summary".to_string())
        }
    };
    info!(commit = %hash, "publish");
    Ok(ExecutionResult {
        evidence: vec![hash.clone()],
        reference: Some(hash),
        summary,
        ..Default::default()
    })
}

impl TaskExecutor for PipelineExecutor {
    fn capabilities(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| {
                matches!(c, Capability::Publish | Capability::Notify) || self.commands.supports(*c)
            })
            .collect()
    }

    async fn invoke(&self, request: &CapabilityRequest) -> Result<ExecutionResult, ExecutorError> {
        let capability = request.capability();
        if self.commands.supports(capability) {
            return self.commands.run(request).await;
        }
        match request {
            CapabilityRequest::Publish(req) => self.publish_builtin(req).await,
            CapabilityRequest::Notify(req) => self.notify_builtin(&req.text).await,
            _ => Err(ExecutorError::Unsupported(capability)),
        }
    }
}
