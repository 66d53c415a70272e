//! Browser session and credential capture

pub mod browser;
pub mod credentials;

pub use browser::{SessionManager, SessionOptions};
pub use credentials::SlackCredentials;
