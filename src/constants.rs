//! Centralized constants for defaults, permissions, and naming.

/// Project configuration file, looked up at the project root.
pub const CONFIG_FILE: &str = "deploy.toml";

/// Environment variable overriding the project root.
pub const ROOT_ENV: &str = "KEYPAIR_MANAGER_ROOT";

/// Default control-plane directory, relative to the project root.
pub const DEFAULT_CLOUD_DIR: &str = ".cloud";

/// Default provisioning function name.
pub const DEFAULT_FUNCTION_NAME: &str = "ec2-keypair-init";

/// Default keypair name prefix (`<prefix>-<suffix>`).
pub const DEFAULT_KEYPAIR_PREFIX: &str = "keypair";

/// Default secret location prefix (`<prefix>/<keypair_name>/private`).
pub const DEFAULT_SECRET_PREFIX: &str = "ec2-ssh-key";

/// Default remote invocation timeout (10 minutes).
pub const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 600;

/// Default number of attempts for a unit failing with a retryable error.
pub const DEFAULT_INVOKE_ATTEMPTS: u32 = 2;

/// Length of the random suffix in generated keypair names.
pub const NAME_SUFFIX_LEN: usize = 6;

/// Default region label for the declarative units.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Permission mode for the control-plane directories.
pub const CLOUD_DIR_MODE: u32 = 0o700;

/// Permission mode for stored secrets.
pub const SECRET_FILE_MODE: u32 = 0o600;

/// Permission mode for state.json.
pub const STATE_FILE_MODE: u32 = 0o600;

/// Permission mode for the audit log.
pub const AUDIT_LOG_MODE: u32 = 0o640;

/// Permission mode for public keypair records.
pub const PUBLIC_KEY_MODE: u32 = 0o644;

/// Maximum accepted size of a function request or response payload.
pub const MAX_PAYLOAD_SIZE: usize = 262_144;

/// Permission to invoke the provisioning function.
pub const ACTION_INVOKE: &str = "function:Invoke";

/// Permission to create a keypair.
pub const ACTION_KEYPAIR_CREATE: &str = "keypair:Create";

/// Permission to create a secret.
pub const ACTION_SECRET_CREATE: &str = "secret:Create";
