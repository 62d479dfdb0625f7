use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::{github::DEFAULT_API_URL, lifecycle::AgentIdentity};

/// Startup configuration. Read once; there is no reload.
#[derive(Clone)]
pub struct Config {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub machine_url: String,
    /// Per-cycle build timeout.
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub repo_path: PathBuf,
    pub default_branch: String,
    pub branch_prefix: String,
    pub build_cmd: String,
    pub build_args: Vec<String>,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub followup_delay: Duration,
    pub output_window: usize,
    pub proceed_without_branch: bool,
    pub store_url: String,
    pub store_key: String,
    pub github_token: String,
    pub github_repo: String,
    pub github_api_url: String,
}

pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                .unwrap_or(v);
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

/// `--key=value` flags; a bare `--flag` reads as `true`. Positional
/// arguments are ignored.
pub fn parse_args<I>(args: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .filter_map(|arg| {
            let flag = arg.strip_prefix("--")?;
            Some(match flag.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (flag.to_string(), "true".to_string()),
            })
        })
        .collect()
}

struct Sources<'a> {
    args: HashMap<String, String>,
    env: &'a dyn Fn(&str) -> Option<String>,
    dotenv: HashMap<String, String>,
}

impl Sources<'_> {
    /// Flag, then environment, then `.env`. Blank values count as unset.
    fn get(&self, key: &str, flag: Option<&str>) -> Option<String> {
        flag.and_then(|f| self.args.get(f).cloned())
            .or_else(|| (self.env)(key))
            .or_else(|| self.dotenv.get(key).cloned())
            .filter(|v| !v.trim().is_empty())
    }

    fn get_str(&self, key: &str, flag: Option<&str>, default: &str) -> String {
        self.get(key, flag).unwrap_or_else(|| default.to_string())
    }

    fn get_u64(&self, key: &str, flag: Option<&str>, default: u64) -> Result<u64> {
        match self.get(key, flag) {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a non-negative integer, got {v:?}")),
            None => Ok(default),
        }
    }

    fn get_secs(&self, key: &str, flag: Option<&str>, default: u64) -> Result<Duration> {
        let secs = self.get_u64(key, flag, default)?;
        if secs == 0 {
            bail!("{key} must be greater than zero");
        }
        Ok(Duration::from_secs(secs))
    }

    fn get_bool(&self, key: &str, flag: Option<&str>, default: bool) -> Result<bool> {
        match self.get(key, flag).as_deref().map(str::trim) {
            Some("true") | Some("1") | Some("yes") => Ok(true),
            Some("false") | Some("0") | Some("no") => Ok(false),
            Some(other) => bail!("{key} must be true or false, got {other:?}"),
            None => Ok(default),
        }
    }

    fn get_list(&self, key: &str, flag: Option<&str>, default: &str) -> Vec<String> {
        self.get_str(key, flag, default)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

impl Config {
    /// Command line, process environment, then `.env` in the working directory.
    pub fn from_env() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        Self::from_sources(
            parse_args(std::env::args().skip(1)),
            &env,
            parse_dotenv(Path::new(".env")),
        )
    }

    pub fn from_sources(
        args: HashMap<String, String>,
        env: &dyn Fn(&str) -> Option<String>,
        dotenv: HashMap<String, String>,
    ) -> Result<Self> {
        let src = Sources { args, env, dotenv };

        let default_id = format!("builder-{}", chrono::Utc::now().timestamp_millis());
        let default_machine = format!("local://{}", hostname());
        let default_repo = std::env::current_dir()
            .context("failed to read current directory")?
            .to_string_lossy()
            .into_owned();

        let store_url = src
            .get("STORE_URL", Some("store-url"))
            .context("STORE_URL is required (postgres://…, https://… or memory://)")?;
        let store_key = src
            .get("STORE_KEY", None)
            .or_else(|| src.get("SUPABASE_SERVICE_KEY", None))
            .unwrap_or_default();

        let output_window = usize::try_from(src.get_u64("FOREMAN_OUTPUT_WINDOW", None, 4000)?)
            .context("FOREMAN_OUTPUT_WINDOW out of range")?;

        Ok(Self {
            agent_id: src.get_str("FOREMAN_AGENT_ID", Some("agent-id"), &default_id),
            agent_type: src.get_str("FOREMAN_AGENT_TYPE", Some("type"), "builder"),
            capabilities: src.get_list(
                "FOREMAN_CAPABILITIES",
                Some("capabilities"),
                "build,test,deploy",
            ),
            machine_url: src.get_str("FOREMAN_MACHINE_URL", Some("machine-url"), &default_machine),
            timeout: src.get_secs("FOREMAN_TIMEOUT_S", Some("timeout"), 600)?,
            kill_grace: src.get_secs("FOREMAN_KILL_GRACE_S", None, 10)?,
            repo_path: PathBuf::from(src.get_str("FOREMAN_REPO_PATH", Some("repo"), &default_repo)),
            default_branch: src.get_str("FOREMAN_DEFAULT_BRANCH", None, "main"),
            branch_prefix: src.get_str("FOREMAN_BRANCH_PREFIX", None, "roadmap"),
            build_cmd: src.get_str("FOREMAN_BUILD_CMD", None, "claude"),
            build_args: src
                .get_str("FOREMAN_BUILD_ARGS", None, "-p --verbose")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            heartbeat_interval: src.get_secs("FOREMAN_HEARTBEAT_S", None, 30)?,
            poll_interval: src.get_secs("FOREMAN_POLL_S", None, 30)?,
            followup_delay: src.get_secs("FOREMAN_FOLLOWUP_S", None, 3)?,
            output_window,
            proceed_without_branch: src.get_bool("FOREMAN_PROCEED_WITHOUT_BRANCH", None, false)?,
            store_url,
            store_key,
            github_token: src.get_str("GITHUB_TOKEN", None, ""),
            github_repo: src.get_str("GITHUB_REPO", None, ""),
            github_api_url: src.get_str("GITHUB_API_URL", None, DEFAULT_API_URL),
        })
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.clone(),
            machine_url: self.machine_url.clone(),
            timeout: self.timeout,
        }
    }

    /// `true` when both a host token and a repository are configured.
    pub fn pull_requests_enabled(&self) -> bool {
        !self.github_token.is_empty() && !self.github_repo.is_empty()
    }
}
