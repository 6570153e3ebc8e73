//! Dispatch transports.

mod github;

pub use github::{gh_command, GithubDispatchTransport};
