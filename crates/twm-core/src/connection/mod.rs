//! WhatsApp connection port (the protocol library is an external collaborator).

pub mod port;
pub mod types;
