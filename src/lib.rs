mod dispatch;
mod env;
mod error;
mod optimize;

pub mod providers;
pub mod server;
pub mod types;
pub mod utils;

pub use dispatch::{
    DEFAULT_TIMEOUT_SECS, Dispatcher, ModelTarget, QWEN_DEFAULT_TIMEOUT_SECS,
    default_timeout_secs,
};
pub use env::{Env, parse_dotenv};
pub use error::{RelayError, Result};
pub use optimize::{DEFAULT_ROLE_FILE, PromptOptimizer};
pub use providers::{ModelScopeImages, OpenRouterChat};
pub use server::{DEFAULT_STATIC_DIR, RelayState, router};
pub use types::{GenerateRequest, Generation};
