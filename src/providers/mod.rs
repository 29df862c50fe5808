pub mod modelscope;
pub mod openrouter;

pub use modelscope::ModelScopeImages;
pub use openrouter::{GEMINI_IMAGE_MODEL, GPT_IMAGE_MODEL, OpenRouterChat};
