mod settings;

pub use settings::{AnonymousPolicy, AuthConfig, ClientConfig, RealtimeConfig, Settings};
