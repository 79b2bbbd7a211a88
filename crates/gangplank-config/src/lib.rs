pub mod error;
pub mod secrets;
pub mod supervisor_context;
pub mod templating;

pub use error::{ConfigError, ConfigResult};
pub use secrets::{catalog, parse_kind, KeyProjection, SecretKind, SECRET_LABEL};
pub use supervisor_context::{ExternalStoreConfig, SshForwardConfig, SupervisorContext};
pub use templating::{BuildContext, JobContext, StageContext, TemplateContext};
