//! Authorization gate
//!
//! Runs the vhost, referer and security checks for an identified client and,
//! for edge vhosts, the token traverse round trip. Every denial is an
//! [`AuthError`] and ends the session.

use std::sync::Arc;

use super::refer;
use super::security::SecurityChecker;
use super::token::token_traverse;
use crate::error::AuthError;
use crate::protocol::{Request, UpstreamConnector};
use crate::server::config::{AuthOrder, VhostConfig};
use crate::server::reload::ConfigStore;
use crate::session::ClientInfo;

pub struct AuthGate {
    config: Arc<ConfigStore>,
    security: Arc<dyn SecurityChecker>,
    upstream: Option<Arc<dyn UpstreamConnector>>,
}

impl AuthGate {
    pub fn new(config: Arc<ConfigStore>, security: Arc<dyn SecurityChecker>) -> Self {
        Self {
            config,
            security,
            upstream: None,
        }
    }

    /// Connector used for edge token traverse
    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamConnector>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Resolve and validate the request's vhost
    ///
    /// With `try_default_vhost`, an unknown vhost binds to the default vhost
    /// when one is configured; this is the only place that fallback happens.
    /// On success `req.vhost` names the bound vhost and its settings are
    /// returned.
    pub fn check_vhost(
        &self,
        req: &mut Request,
        try_default_vhost: bool,
    ) -> Result<VhostConfig, AuthError> {
        let config = self.config.current();
        let Some((name, vhost)) = config.resolve_vhost(&req.vhost, try_default_vhost) else {
            tracing::warn!(vhost = %req.vhost, "Vhost not found");
            return Err(AuthError::VhostNotFound(req.vhost.clone()));
        };

        if !vhost.enabled {
            return Err(AuthError::VhostDisabled(name.to_string()));
        }

        if name != req.vhost {
            tracing::debug!(requested = %req.vhost, bound = %name, "Vhost resolved");
            req.vhost = name.to_string();
        }

        if vhost.refer.enabled {
            refer::check(&req.page_url, &vhost.refer.all)?;
        }

        Ok(vhost.clone())
    }

    /// Referer and security checks for the identified action
    ///
    /// Edge connections skip the per-action referer lists; their origin
    /// enforces those.
    pub fn authorize(&self, info: &ClientInfo, vhost: &VhostConfig) -> Result<(), AuthError> {
        let referer = || -> Result<(), AuthError> {
            if !vhost.refer.enabled || info.edge {
                return Ok(());
            }
            let domains = if info.conn_type.is_play() {
                &vhost.refer.play
            } else {
                &vhost.refer.publish
            };
            refer::check(&info.req.page_url, domains)
        };
        let security = || {
            self.security
                .check(info.conn_type, info.req.ip, &info.req.vhost)
        };

        match self.config.current().auth_order {
            AuthOrder::RefererFirst => {
                referer()?;
                security()
            }
            AuthOrder::SecurityFirst => {
                security()?;
                referer()
            }
        }
    }

    /// Edge token traverse, when the vhost asks for it
    pub async fn traverse_token(&self, req: &Request, vhost: &VhostConfig) -> Result<(), AuthError> {
        if !vhost.edge || !vhost.token_traverse {
            return Ok(());
        }

        let Some(upstream) = &self.upstream else {
            return Err(AuthError::TokenTraverse(
                "no upstream connector configured".to_string(),
            ));
        };

        token_traverse(
            upstream.as_ref(),
            &vhost.edge_origins,
            req,
            vhost.token_traverse_timeout,
        )
        .await
    }
}
