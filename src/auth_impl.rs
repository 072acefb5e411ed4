// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use tracing::{trace, warn};

use crate::reason_code::ReasonCode;

/// Outcome of the authentication callback invoked on CONNECT and AUTH.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    Accept,
    /// Continue the AUTH exchange with the given server data.
    AcceptWithChallenge(Vec<u8>),
    Deny(ReasonCode),
}

/// Authentication boundary the broker core calls into. The core never blocks
/// on this: implementations must answer synchronously.
pub trait Authenticator {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        auth_method: Option<&str>,
        auth_data: Option<&[u8]>,
    ) -> AuthDecision;

    /// Topic-level publish permission for an authenticated user.
    fn allow_publish(&self, username: Option<&str>, topic: &str) -> bool {
        let _ = (username, topic);
        true
    }

    /// Topic-level subscribe permission for an authenticated user.
    fn allow_subscribe(&self, username: Option<&str>, topic_filter: &str) -> bool {
        let _ = (username, topic_filter);
        true
    }
}

/// Accepts everyone; the default when no auth config is given.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
        _auth_method: Option<&str>,
        _auth_data: Option<&[u8]>,
    ) -> AuthDecision {
        AuthDecision::Accept
    }
}

/// Authentication method for a user entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Salted SHA256 password digest
    Sha256,
    /// Plain text password (not recommended for production)
    PlainPassword,
    /// Anonymous user (no credentials required)
    Anonymous,
    /// Unauthenticated user (connection allowed without authentication)
    Unauthenticated,
}

/// Authentication entry for a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationEntry {
    /// Username
    pub name: String,
    /// Authentication method
    pub method: AuthMethod,
    /// Password digest (SHA256 hash or plain password)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Alternative field name for plain_password method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Salt for SHA256 hashing
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub salt: String,
}

/// Authorization type (allow or deny)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationType {
    Allow,
    Deny,
}

/// Authorization rule for a topic
#[derive(Debug, Clone)]
struct Authorization {
    /// Topic filter tokens (split by '/')
    topic_tokens: Vec<String>,
    /// Subscribe authorization type and users/groups it names
    sub_type: Option<AuthorizationType>,
    sub_perm: HashSet<String>,
    /// Publish authorization type and users/groups it names
    pub_type: Option<AuthorizationType>,
    pub_perm: HashSet<String>,
}

/// Authorization entry for JSON deserialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationEntry {
    /// Topic filter
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<AuthorizationRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<AuthorizationRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "pub")]
    pub publish: Vec<String>,
}

/// Group definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group name (must start with '@')
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// Root configuration structure for JSON deserialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub authentication: Vec<AuthenticationEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group: Vec<Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization: Vec<AuthorizationEntry>,
}

/// Main authentication and authorization manager
pub struct Security {
    /// Authentication map: username -> AuthenticationEntry
    authentication: HashMap<String, AuthenticationEntry>,
    /// Groups map: group_name -> members
    groups: HashMap<String, Vec<String>>,
    /// Authorization rules in file order (later rules win)
    authorization: Vec<Authorization>,
    /// Anonymous username (if configured)
    anonymous: Option<String>,
    /// Unauthenticated username (if configured)
    unauthenticated: Option<String>,
}

impl Security {
    /// Load from a JSON config file.
    pub fn from_file(path: &str) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| anyhow!("Failed to open auth config file '{path}': {e}"))?;
        let config: AuthConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| anyhow!("Failed to parse auth config file '{path}': {e}"))?;
        Self::from_config(config)
    }

    pub fn from_config(config: AuthConfig) -> Result<Self> {
        let mut authentication = HashMap::new();
        let mut anonymous = None;
        let mut unauthenticated = None;

        for entry in config.authentication {
            match entry.method {
                AuthMethod::Anonymous => anonymous = Some(entry.name.clone()),
                AuthMethod::Unauthenticated => unauthenticated = Some(entry.name.clone()),
                AuthMethod::Sha256 if entry.digest.is_none() => {
                    return Err(anyhow!("sha256 entry '{}' is missing a digest", entry.name));
                }
                AuthMethod::PlainPassword
                    if entry.password.is_none() && entry.digest.is_none() =>
                {
                    return Err(anyhow!(
                        "plain_password entry '{}' is missing a password",
                        entry.name
                    ));
                }
                _ => {}
            }
            authentication.insert(entry.name.clone(), entry);
        }

        let mut groups = HashMap::new();
        for group in config.group {
            if !group.name.starts_with('@') {
                return Err(anyhow!("group name '{}' must start with '@'", group.name));
            }
            groups.insert(group.name.clone(), group.members);
        }

        let mut authorization = Vec::new();
        for entry in config.authorization {
            let topic_tokens: Vec<String> =
                entry.topic.split('/').map(str::to_string).collect();
            if let Some(allow) = entry.allow {
                authorization.push(Authorization {
                    topic_tokens: topic_tokens.clone(),
                    sub_type: (!allow.sub.is_empty()).then_some(AuthorizationType::Allow),
                    sub_perm: allow.sub.into_iter().collect(),
                    pub_type: (!allow.publish.is_empty()).then_some(AuthorizationType::Allow),
                    pub_perm: allow.publish.into_iter().collect(),
                });
            }
            if let Some(deny) = entry.deny {
                authorization.push(Authorization {
                    topic_tokens,
                    sub_type: (!deny.sub.is_empty()).then_some(AuthorizationType::Deny),
                    sub_perm: deny.sub.into_iter().collect(),
                    pub_type: (!deny.publish.is_empty()).then_some(AuthorizationType::Deny),
                    pub_perm: deny.publish.into_iter().collect(),
                });
            }
        }

        Ok(Self {
            authentication,
            groups,
            authorization,
            anonymous,
            unauthenticated,
        })
    }

    /// Salted SHA256 digest, hex encoded
    pub fn sha256hash(message: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Effective username for authorization checks: the authenticated name,
    /// or the configured anonymous/unauthenticated identity.
    fn effective_user(&self, username: Option<&str>) -> Option<String> {
        match username {
            Some(name) => Some(name.to_string()),
            None => self.anonymous.clone().or_else(|| self.unauthenticated.clone()),
        }
    }

    /// Whether `user` is named by `perm` directly or through a group.
    fn permits(&self, perm: &HashSet<String>, user: &str) -> bool {
        if perm.contains(user) {
            return true;
        }
        perm.iter()
            .filter(|name| name.starts_with('@'))
            .any(|group_name| {
                self.groups
                    .get(group_name.as_str())
                    .is_some_and(|members| members.iter().any(|m| m == user))
            })
    }

    /// Topic-to-rule matching: rule tokens may contain `+` and a trailing `#`.
    fn rule_matches(tokens: &[String], topic: &str) -> bool {
        let topic_tokens: Vec<&str> = topic.split('/').collect();
        let mut i = 0;
        for token in tokens {
            if token == "#" {
                return true;
            }
            match topic_tokens.get(i) {
                Some(t) if token == "+" || token == t => i += 1,
                _ => return false,
            }
        }
        i == topic_tokens.len()
    }

    fn check(
        &self,
        username: Option<&str>,
        topic: &str,
        publish: bool,
    ) -> bool {
        let Some(user) = self.effective_user(username) else {
            return false;
        };

        // Later rules override earlier ones; default is deny when any rules
        // exist, allow when the rule list is empty.
        let mut decision = self.authorization.is_empty();
        for rule in &self.authorization {
            let (rule_type, perm) = if publish {
                (rule.pub_type, &rule.pub_perm)
            } else {
                (rule.sub_type, &rule.sub_perm)
            };
            let Some(rule_type) = rule_type else { continue };
            if !Self::rule_matches(&rule.topic_tokens, topic) {
                continue;
            }
            if self.permits(perm, &user) {
                decision = rule_type == AuthorizationType::Allow;
            }
        }
        decision
    }
}

impl Authenticator for Security {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        auth_method: Option<&str>,
        _auth_data: Option<&[u8]>,
    ) -> AuthDecision {
        // Enhanced-auth methods are not configured in the file-backed
        // security engine; reject them outright.
        if auth_method.is_some() {
            return AuthDecision::Deny(ReasonCode::BadAuthenticationMethod);
        }

        let Some(username) = username else {
            if self.anonymous.is_some() || self.unauthenticated.is_some() {
                trace!("client '{client_id}' accepted without credentials");
                return AuthDecision::Accept;
            }
            return AuthDecision::Deny(ReasonCode::NotAuthorized);
        };

        let Some(entry) = self.authentication.get(username) else {
            warn!("unknown user '{username}' from client '{client_id}'");
            return AuthDecision::Deny(ReasonCode::BadUserNameOrPassword);
        };

        let accepted = match entry.method {
            AuthMethod::Anonymous | AuthMethod::Unauthenticated => true,
            AuthMethod::PlainPassword => {
                let expected = entry.password.as_deref().or(entry.digest.as_deref());
                match (expected, password) {
                    (Some(expected), Some(given)) => expected.as_bytes() == given,
                    _ => false,
                }
            }
            AuthMethod::Sha256 => match (&entry.digest, password) {
                (Some(digest), Some(given)) => {
                    let Ok(given) = std::str::from_utf8(given) else {
                        return AuthDecision::Deny(ReasonCode::BadUserNameOrPassword);
                    };
                    let salted = format!("{}{}", entry.salt, given);
                    Self::sha256hash(&salted).eq_ignore_ascii_case(digest)
                }
                _ => false,
            },
        };

        if accepted {
            AuthDecision::Accept
        } else {
            warn!("authentication failed for user '{username}' from client '{client_id}'");
            AuthDecision::Deny(ReasonCode::BadUserNameOrPassword)
        }
    }

    fn allow_publish(&self, username: Option<&str>, topic: &str) -> bool {
        self.check(username, topic, true)
    }

    fn allow_subscribe(&self, username: Option<&str>, topic_filter: &str) -> bool {
        self.check(username, topic_filter, false)
    }
}
