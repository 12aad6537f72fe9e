//! Outbound messaging toward controllers (Telegram today).

pub mod port;
pub mod throttled;
pub mod types;
