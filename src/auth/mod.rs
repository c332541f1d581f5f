mod credentials;

pub use credentials::{resolve_token, CredentialSource, SharedToken};
