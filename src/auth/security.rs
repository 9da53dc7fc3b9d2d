//! Access rules per client ip

use std::net::IpAddr;
use std::sync::Arc;

use crate::error::AuthError;
use crate::protocol::ConnType;
use crate::server::config::{RuleAction, RuleMethod};
use crate::server::reload::ConfigStore;

/// Evaluates access rules for a client action
///
/// Implementations must not block; the check runs inline on the
/// connection task.
pub trait SecurityChecker: Send + Sync + 'static {
    fn check(&self, action: ConnType, ip: IpAddr, vhost: &str) -> Result<(), AuthError>;
}

/// Rule evaluator backed by the vhost security config
///
/// When security is enabled for the vhost, at least one `allow` rule for the
/// action must match the client and no `deny` rule may match. Publish rules
/// cover every publish flavor.
pub struct RuleSecurity {
    config: Arc<ConfigStore>,
}

impl RuleSecurity {
    /// Evaluate against the live configuration, so reloaded rules apply to
    /// the next check
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }
}

impl SecurityChecker for RuleSecurity {
    fn check(&self, action: ConnType, ip: IpAddr, vhost: &str) -> Result<(), AuthError> {
        let config = self.config.current();
        let Some(vhost_config) = config.vhosts.get(vhost) else {
            return Ok(());
        };
        let security = &vhost_config.security;
        if !security.enabled {
            return Ok(());
        }

        let method = match action {
            ConnType::Play => RuleMethod::Play,
            ConnType::Publish(_) => RuleMethod::Publish,
            ConnType::Unknown => {
                return Err(AuthError::SecurityDenied {
                    action: action.action(),
                    ip,
                })
            }
        };

        let matching = || {
            security
                .rules
                .iter()
                .filter(move |rule| rule.method == method && rule.target.matches(ip))
        };

        let allowed = matching().any(|rule| rule.action == RuleAction::Allow);
        let denied = matching().any(|rule| rule.action == RuleAction::Deny);

        if allowed && !denied {
            Ok(())
        } else {
            tracing::warn!(vhost = %vhost, ip = %ip, action = action.action(), "Security denied");
            Err(AuthError::SecurityDenied {
                action: action.action(),
                ip,
            })
        }
    }
}
