//! Edge token traverse
//!
//! An edge relays the client's connect to its origin before serving the
//! client. Origins are tried in order and unreachable ones are skipped; the
//! first origin that accepts the connection decides the outcome.

use std::time::Duration;

use tokio::time::timeout;

use crate::error::{AuthError, Error};
use crate::protocol::{Request, UpstreamConnector};

/// Authenticate `req` against the first reachable origin
///
/// Each connect attempt and the handshake/connect exchange that follows are
/// bounded by `deadline`.
pub async fn token_traverse(
    connector: &dyn UpstreamConnector,
    origins: &[String],
    req: &Request,
    deadline: Duration,
) -> Result<(), AuthError> {
    for origin in origins {
        let mut client = match timeout(deadline, connector.connect(origin)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                tracing::debug!(origin = %origin, error = %e, "Origin unreachable, trying next");
                continue;
            }
            Err(_) => {
                tracing::debug!(origin = %origin, "Origin connect timed out, trying next");
                continue;
            }
        };

        let exchange = async {
            client.handshake().await?;
            client.connect_app(req).await
        };

        return match timeout(deadline, exchange).await {
            Ok(Ok(())) => {
                tracing::info!(origin = %origin, tc_url = %req.tc_url, "Token traverse passed");
                Ok(())
            }
            Ok(Err(e)) => Err(rejected(origin, &e)),
            Err(_) => Err(AuthError::TokenTraverse(format!(
                "origin {origin} did not answer within {}ms",
                deadline.as_millis()
            ))),
        };
    }

    Err(AuthError::TokenTraverse("no origin reachable".to_string()))
}

fn rejected(origin: &str, e: &Error) -> AuthError {
    tracing::warn!(origin = %origin, error = %e, "Token traverse rejected");
    AuthError::TokenTraverse(format!("origin {origin}: {e}"))
}
