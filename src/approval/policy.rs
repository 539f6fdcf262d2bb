// src/approval/policy.rs

//! Risk classification of actions before they run.

use std::sync::LazyLock;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use crate::config::ApprovalSettings;
use crate::errors::{MarathonError, Result};
use crate::types::RiskTier;

static DELETE_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(rm|rmdir|unlink|del|delete|deletes|deleting|remove|removes|removing|erase|wipe|purge|truncate)\b")
        .expect("invalid delete pattern")
});

static PAYMENT_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pay|pays|payment|payments|purchase|buy|charge|refund|invoice|checkout|billing|wire transfer|transfer funds|credit card)\b")
        .expect("invalid payment pattern")
});

static OUTBOUND_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(emails?|e-mails?|emailing|tweets?|tweeting|sms|slack message|direct message|post to|post on|publish to|publish on|reply to)\b",
        r"|\bsend(s|ing)?\s+(\w+\s+){0,3}?(messages?|texts?|newsletters?|notifications?|invites?|invitations?)\b",
    ))
        .expect("invalid outbound message pattern")
});

/// Why an action needs approval, and how risky it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    /// Highest tier among all matched rules.
    pub tier: RiskTier,
    pub reasons: Vec<String>,
}

/// Compiled form of [`ApprovalSettings`].
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    require_for_file_delete: bool,
    /// `None` = any deleted path needs approval.
    delete_globs: Option<GlobSet>,
    flagged_commands: Vec<String>,
    require_for_payments: bool,
    require_for_outbound_messages: bool,
    custom: Vec<Regex>,
    auto_approve_after: Option<Duration>,
    expires_after: Option<Duration>,
    notify_channel: Option<String>,
}

impl ApprovalPolicy {
    pub fn compile(settings: &ApprovalSettings) -> Result<Self> {
        let delete_globs = if settings.delete_patterns.is_empty() {
            None
        } else {
            Some(build_globset(&settings.delete_patterns)?)
        };

        let custom = settings
            .custom_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    MarathonError::ConfigError(format!(
                        "[approval].custom_patterns: invalid regex {p:?}: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            require_for_file_delete: settings.require_for_file_delete,
            delete_globs,
            flagged_commands: settings
                .flagged_commands
                .iter()
                .filter(|c| !c.trim().is_empty())
                .map(|c| c.to_lowercase())
                .collect(),
            require_for_payments: settings.require_for_payments,
            require_for_outbound_messages: settings.require_for_outbound_messages,
            custom,
            auto_approve_after: settings.auto_approve_after,
            expires_after: settings.expires_after,
            notify_channel: settings.notify_channel.clone(),
        })
    }

    /// A policy that never asks for approval.
    pub fn permissive() -> Self {
        Self {
            require_for_file_delete: false,
            delete_globs: None,
            flagged_commands: Vec::new(),
            require_for_payments: false,
            require_for_outbound_messages: false,
            custom: Vec::new(),
            auto_approve_after: None,
            expires_after: None,
            notify_channel: None,
        }
    }

    /// Classify `action`. `None` means it may run without approval.
    pub fn assess(&self, action: &str) -> Option<RiskAssessment> {
        let mut hits: Vec<(RiskTier, String)> = Vec::new();

        if self.require_for_file_delete && self.mentions_guarded_delete(action) {
            hits.push((RiskTier::High, "file deletion".to_string()));
        }

        let lowered = action.to_lowercase();
        for cmd in &self.flagged_commands {
            if lowered.contains(cmd.as_str()) {
                hits.push((RiskTier::High, format!("flagged command {:?}", cmd.trim())));
            }
        }

        if self.require_for_payments && PAYMENT_TERMS.is_match(action) {
            hits.push((RiskTier::Critical, "payment".to_string()));
        }

        if self.require_for_outbound_messages && OUTBOUND_TERMS.is_match(action) {
            hits.push((RiskTier::Medium, "outbound message".to_string()));
        }

        for re in &self.custom {
            if re.is_match(action) {
                hits.push((RiskTier::Medium, format!("matches pattern {:?}", re.as_str())));
            }
        }

        let tier = hits.iter().map(|(tier, _)| *tier).max()?;
        Some(RiskAssessment {
            tier,
            reasons: hits.into_iter().map(|(_, reason)| reason).collect(),
        })
    }

    /// Deadline after which requests resolve themselves (auto-approve) or,
    /// failing that, are reported as overdue. Auto-approval wins when both
    /// are configured.
    pub fn expiry(&self) -> (Option<Duration>, bool) {
        match (self.auto_approve_after, self.expires_after) {
            (Some(after), _) => (Some(after), true),
            (None, expires) => (expires, false),
        }
    }

    pub fn notify_channel(&self) -> Option<&str> {
        self.notify_channel.as_deref()
    }

    fn mentions_guarded_delete(&self, action: &str) -> bool {
        if !DELETE_VERBS.is_match(action) {
            return false;
        }
        match &self.delete_globs {
            None => true,
            Some(globs) => action
                .split_whitespace()
                .map(|token| token.trim_matches(|c: char| "\"'`,;:()[]{}".contains(c)))
                .filter(|token| !token.is_empty())
                .any(|token| globs.is_match(token)),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).map_err(|e| {
            MarathonError::ConfigError(format!(
                "[approval].delete_patterns: invalid glob {pat:?}: {e}"
            ))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| MarathonError::ConfigError(format!("[approval].delete_patterns: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(f: impl FnOnce(&mut ApprovalSettings)) -> ApprovalPolicy {
        let mut settings = ApprovalSettings::default();
        f(&mut settings);
        ApprovalPolicy::compile(&settings).unwrap()
    }

    #[test]
    fn harmless_actions_need_no_approval() {
        let p = policy(|_| {});
        assert_eq!(p.assess("Write unit tests for the parser"), None);
        assert_eq!(p.assess("Refactor config loading"), None);
    }

    #[test]
    fn highest_tier_wins() {
        let p = policy(|_| {});
        let a = p
            .assess("Delete old invoices with rm -rf, then pay the vendor")
            .unwrap();
        assert_eq!(a.tier, RiskTier::Critical);
        assert!(a.reasons.iter().any(|r| r == "file deletion"));
        assert!(a.reasons.iter().any(|r| r == "payment"));
    }

    #[test]
    fn delete_patterns_limit_guarded_paths() {
        let p = policy(|s| {
            s.delete_patterns = vec!["/backups/**".to_string()];
            s.flagged_commands = Vec::new();
        });
        assert_eq!(
            p.assess("rm '/backups/2024/db.tar'").map(|a| a.tier),
            Some(RiskTier::High)
        );
        assert_eq!(p.assess("rm target/debug/app"), None);
    }

    #[test]
    fn outbound_and_custom_patterns_are_medium() {
        let p = policy(|s| s.custom_patterns = vec![r"(?i)\bdeploy\b".to_string()]);
        assert_eq!(
            p.assess("Send the release notes by email").map(|a| a.tier),
            Some(RiskTier::Medium)
        );
        assert_eq!(
            p.assess("Deploy staging").map(|a| a.tier),
            Some(RiskTier::Medium)
        );
        assert_eq!(
            p.assess("Send a welcome message to new users").map(|a| a.tier),
            Some(RiskTier::Medium)
        );
        assert_eq!(
            p.assess("Post to the team channel").map(|a| a.tier),
            Some(RiskTier::Medium)
        );
    }

    #[test]
    fn everyday_send_and_publish_do_not_need_approval() {
        let p = policy(|_| {});
        assert_eq!(p.assess("Publish docs"), None);
        assert_eq!(p.assess("Send the parsed rows back to the caller"), None);
        assert_eq!(p.assess("Publish the crate docs locally"), None);
    }

    #[test]
    fn disabled_rules_do_not_fire() {
        let p = policy(|s| {
            s.require_for_file_delete = false;
            s.require_for_payments = false;
            s.flagged_commands = Vec::new();
        });
        assert_eq!(p.assess("delete the cache and buy more storage"), None);
        assert_eq!(ApprovalPolicy::permissive().assess("rm -rf / && sudo pay"), None);
    }

    #[test]
    fn invalid_patterns_are_config_errors() {
        let mut settings = ApprovalSettings::default();
        settings.delete_patterns = vec!["a[".to_string()];
        assert!(matches!(
            ApprovalPolicy::compile(&settings),
            Err(MarathonError::ConfigError(_))
        ));
    }

    #[test]
    fn auto_approval_takes_precedence_over_plain_expiry() {
        let p = policy(|s| {
            s.auto_approve_after = Some(Duration::from_secs(60));
            s.expires_after = Some(Duration::from_secs(10));
        });
        assert_eq!(p.expiry(), (Some(Duration::from_secs(60)), true));

        let p = policy(|s| s.expires_after = Some(Duration::from_secs(10)));
        assert_eq!(p.expiry(), (Some(Duration::from_secs(10)), false));
    }
}
