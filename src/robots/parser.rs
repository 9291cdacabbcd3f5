//! Robots.txt rules backed by the robotstxt crate

use robotstxt::DefaultMatcher;
use url::Url;

/// robots.txt rules for one website
#[derive(Debug, Clone)]
pub struct RobotsRules {
    /// Raw robots.txt content (empty string means allow all)
    content: String,
    agent: String,
}

impl RobotsRules {
    /// Builds rules from raw robots.txt content for the given user-agent token
    pub fn from_content(content: &str, agent: &str) -> Self {
        Self {
            content: content.to_string(),
            agent: agent.to_string(),
        }
    }

    /// Permissive rules used when robots.txt is missing or not respected
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
            agent: String::new(),
        }
    }

    pub fn is_allowed(&self, url: &Url) -> bool {
        if self.content.trim().is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, &self.agent, url.as_str())
    }
}
