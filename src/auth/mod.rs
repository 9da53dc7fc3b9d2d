//! Client authorization
//!
//! Vhost resolution, referer lists, per-ip security rules and the edge token
//! traverse handshake.

pub mod gate;
pub mod refer;
pub mod security;
pub mod token;

pub use gate::AuthGate;
pub use security::{RuleSecurity, SecurityChecker};
pub use token::token_traverse;
