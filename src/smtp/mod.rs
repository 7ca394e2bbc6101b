mod connection;
pub mod server;
mod session;

pub use server::{SmtpServer, SmtpServerError};
