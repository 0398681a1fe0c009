pub mod extractive;
pub mod gemini;

pub use extractive::ExtractiveBackend;
pub use gemini::{GeminiClient, GeminiEmbedder, GeminiGenerator};
