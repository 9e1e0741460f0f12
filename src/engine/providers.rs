//! Ticket tracker and VCS provider seams.
//!
//! Concrete tracker clients live outside this crate; they plug in through
//! `ProviderRegistry::register`. A kind with no registered adapter resolves
//! to one that fails every call with `ProviderError::NotConfigured`, so the
//! execution loop can call providers unconditionally and log the outcome.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use super::models::TicketData;
use crate::errors::ProviderError;

pub const STATUS_IN_PROGRESS: &str = "In Progress";
pub const STATUS_DONE: &str = "Done";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketProviderKind {
    Linear,
    Notion,
    Jira,
}

impl TicketProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Notion => "notion",
            Self::Jira => "jira",
        }
    }
}

impl fmt::Display for TicketProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "notion" => Ok(Self::Notion),
            "jira" => Ok(Self::Jira),
            _ => Err(format!("Unknown ticket provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VcsProviderKind {
    Github,
    Gitlab,
}

impl VcsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
        }
    }

    /// Username paired with a token in an HTTPS clone URL.
    fn token_user(&self) -> &'static str {
        match self {
            Self::Github => "x-access-token",
            Self::Gitlab => "oauth2",
        }
    }
}

impl fmt::Display for VcsProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VcsProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            _ => Err(format!("Unknown VCS provider: {}", s)),
        }
    }
}

/// Credentials and provider-specific settings for one project.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub token: Option<String>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait TicketProvider: Send + Sync {
    /// Tickets ready to be picked up.
    async fn fetch_ready(&self, config: &ProviderConfig) -> Result<Vec<TicketData>, ProviderError>;

    async fn update_status(
        &self,
        external_id: &str,
        status: &str,
        config: &ProviderConfig,
    ) -> Result<(), ProviderError>;

    async fn add_comment(
        &self,
        external_id: &str,
        body: &str,
        config: &ProviderConfig,
    ) -> Result<(), ProviderError>;
}

/// Stand-in for a kind nobody registered an adapter for.
struct UnavailableProvider {
    kind: String,
}

impl UnavailableProvider {
    fn error(&self) -> ProviderError {
        ProviderError::NotConfigured {
            provider: self.kind.clone(),
        }
    }
}

#[async_trait]
impl TicketProvider for UnavailableProvider {
    async fn fetch_ready(&self, _config: &ProviderConfig) -> Result<Vec<TicketData>, ProviderError> {
        Err(self.error())
    }

    async fn update_status(
        &self,
        _external_id: &str,
        _status: &str,
        _config: &ProviderConfig,
    ) -> Result<(), ProviderError> {
        Err(self.error())
    }

    async fn add_comment(
        &self,
        _external_id: &str,
        _body: &str,
        _config: &ProviderConfig,
    ) -> Result<(), ProviderError> {
        Err(self.error())
    }
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<TicketProviderKind, Arc<dyn TicketProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TicketProviderKind, provider: Arc<dyn TicketProvider>) {
        self.providers.insert(kind, provider);
    }

    pub fn resolve(&self, kind: TicketProviderKind) -> Arc<dyn TicketProvider> {
        match self.providers.get(&kind) {
            Some(provider) => provider.clone(),
            None => Arc::new(UnavailableProvider {
                kind: kind.to_string(),
            }),
        }
    }

    /// Resolve from the stored provider name. `None` means the project has
    /// no tracker configured at all.
    pub fn resolve_name(&self, name: Option<&str>) -> Option<Arc<dyn TicketProvider>> {
        let name = name?;
        Some(match name.parse::<TicketProviderKind>() {
            Ok(kind) => self.resolve(kind),
            Err(_) => Arc::new(UnavailableProvider {
                kind: name.to_string(),
            }),
        })
    }
}

static SCP_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[\w.-]+@)?([\w.-]+):(.+)$").unwrap());

/// HTTPS clone URL with the token embedded as userinfo. `git@host:path`
/// remotes are rewritten to HTTPS first. Without a token the URL is returned
/// unchanged.
pub fn authenticated_clone_url(
    repo_url: &str,
    vcs: VcsProviderKind,
    token: Option<&str>,
) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return repo_url.to_string();
    };
    let https = if let Some(rest) = repo_url.strip_prefix("https://") {
        rest.to_string()
    } else if let Some(rest) = repo_url.strip_prefix("http://") {
        rest.to_string()
    } else if repo_url.contains("://") {
        return repo_url.to_string();
    } else if let Some(caps) = SCP_URL.captures(repo_url) {
        format!("{}/{}", &caps[1], &caps[2])
    } else {
        return repo_url.to_string();
    };
    // Drop any userinfo already present.
    let host_and_path = match https.split_once('@') {
        Some((userinfo, rest)) if !userinfo.contains('/') => rest.to_string(),
        _ => https.clone(),
    };
    format!("https://{}:{}@{}", vcs.token_user(), token, host_and_path)
}
