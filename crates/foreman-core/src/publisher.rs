use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::PublishError,
    git::SourceControl,
    github::{OpenedRequest, PullRequestHost},
    process::tail_chars,
    queue::QueueClient,
    types::{PullRequestRecord, Task},
};

const SLUG_MAX: usize = 40;
const BODY_OUTPUT_CHARS: usize = 1000;

/// Lower-case, collapse every non-alphanumeric run into one `-`, trim the
/// edges and cap the length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.chars().take(SLUG_MAX).collect();
    slug.trim_matches('-').to_string()
}

/// `<prefix>/<first 8 chars of id>-<slug>`.
pub fn branch_name(prefix: &str, task: &Task) -> String {
    let slug = slugify(&task.title);
    if slug.is_empty() {
        format!("{prefix}/{}", task.short_id())
    } else {
        format!("{prefix}/{}-{slug}", task.short_id())
    }
}

pub fn request_title(task: &Task) -> String {
    if task.category.is_empty() {
        task.title.clone()
    } else {
        format!("[{}] {}", task.category, task.title)
    }
}

pub fn request_body(task: &Task, agent_id: &str, build_output: &str) -> String {
    let description = if task.description.is_empty() {
        "_No description._"
    } else {
        task.description.as_str()
    };
    format!(
        "## Roadmap Task\n\n\
         **Module:** {}\n\
         **Priority:** {}\n\
         **Agent:** `{agent_id}`\n\n\
         {description}\n\n\
         ---\n\n\
         ### Build Output (last {BODY_OUTPUT_CHARS} chars)\n\
         ```\n{}\n```\n\n\
         Built by foreman worker agent `{agent_id}`\n",
        task.category,
        task.priority,
        tail_chars(build_output, BODY_OUTPUT_CHARS).trim_end(),
    )
}

/// One sub-step of branch setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: &'static str,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Result of [`Publisher::create_branch`]. `branch` is `None` when any step
/// failed; later steps are not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSetup {
    pub branch: Option<String>,
    pub steps: Vec<StepReport>,
}

impl BranchSetup {
    /// `step: detail` of the first failed step.
    pub fn failure(&self) -> Option<String> {
        self.steps.iter().find(|s| !s.ok).map(|s| match &s.detail {
            Some(detail) => format!("{}: {detail}", s.step),
            None => s.step.to_string(),
        })
    }
}

/// Branch, push and pull-request side effects for one working tree.
pub struct Publisher {
    scm: Arc<dyn SourceControl>,
    host: Option<Arc<dyn PullRequestHost>>,
    queue: QueueClient,
    default_branch: String,
    branch_prefix: String,
}

impl Publisher {
    pub fn new(
        scm: Arc<dyn SourceControl>,
        host: Option<Arc<dyn PullRequestHost>>,
        queue: QueueClient,
        default_branch: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            scm,
            host,
            queue,
            default_branch: default_branch.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    async fn step<F>(steps: &mut Vec<StepReport>, step: &'static str, fut: F) -> bool
    where
        F: Future<Output = Result<(), PublishError>>,
    {
        match fut.await {
            Ok(()) => {
                steps.push(StepReport {
                    step,
                    ok: true,
                    detail: None,
                });
                true
            }
            Err(e) => {
                warn!(step, error = %e, "branch setup step failed");
                steps.push(StepReport {
                    step,
                    ok: false,
                    detail: Some(e.to_string()),
                });
                false
            }
        }
    }

    /// Switch to the default branch, pull, then create and check out the
    /// task branch. Stops at the first failed step.
    pub async fn create_branch(&self, task: &Task) -> BranchSetup {
        let name = branch_name(&self.branch_prefix, task);
        let mut steps = Vec::with_capacity(3);
        let ok = Self::step(&mut steps, "checkout", self.scm.checkout(&self.default_branch)).await
            && Self::step(&mut steps, "pull", self.scm.pull(&self.default_branch)).await
            && Self::step(&mut steps, "create_branch", self.scm.create_branch(&name)).await;
        if ok {
            info!(task_id = %task.id, branch = %name, "created task branch");
        }
        BranchSetup {
            branch: ok.then_some(name),
            steps,
        }
    }

    pub async fn push(&self, branch: &str) -> bool {
        match self.scm.push(branch).await {
            Ok(()) => {
                info!(branch, "pushed branch");
                true
            }
            Err(e) => {
                warn!(branch, error = %e, "push failed");
                false
            }
        }
    }

    /// Open a pull request for `branch`. `None` when no host credential is
    /// configured or the host call failed.
    pub async fn open_request(
        &self,
        task: &Task,
        branch: &str,
        build_output: &str,
    ) -> Option<OpenedRequest> {
        let Some(host) = &self.host else {
            debug!(task_id = %task.id, "no pull request credential configured, skipping");
            return None;
        };
        let title = request_title(task);
        let body = request_body(task, self.queue.agent_id(), build_output);
        let opened = match host
            .open_pull_request(branch, &self.default_branch, &title, &body)
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                warn!(task_id = %task.id, branch, error = %e, "failed to open pull request");
                return None;
            }
        };
        info!(task_id = %task.id, pr = opened.number, url = %opened.html_url, "opened pull request");

        self.queue
            .record_pull_request(&PullRequestRecord {
                roadmap_item_id: task.id.clone(),
                agent_id: self.queue.agent_id().to_string(),
                pr_number: opened.number,
                branch_name: branch.to_string(),
                title,
                body,
                status: "open".into(),
                github_url: opened.html_url.clone(),
            })
            .await;
        Some(opened)
    }

    /// Put the working tree back on a clean default branch, whatever the
    /// build left behind.
    pub async fn restore_default(&self) -> bool {
        match self.scm.restore(&self.default_branch).await {
            Ok(()) => true,
            Err(e) => {
                warn!(branch = %self.default_branch, error = %e, "failed to restore default branch");
                false
            }
        }
    }
}
