pub mod llm;
pub mod warehouse;
