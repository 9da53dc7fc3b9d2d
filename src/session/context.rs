//! Identified client

use crate::protocol::{ConnType, Request, Response};

/// What is known about the peer once it has been identified
///
/// Owned by its connection and never shared with another one.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub conn_type: ConnType,
    /// Served by an edge vhost
    pub edge: bool,
    pub req: Request,
    pub res: Response,
}

impl ClientInfo {
    pub fn new(req: Request) -> Self {
        Self {
            conn_type: ConnType::Unknown,
            edge: false,
            req,
            res: Response::default(),
        }
    }
}
