pub mod chapterizer;
pub mod llm;
pub mod prompts;
pub mod render;
pub mod review;
pub mod sink;
pub mod slicer;
pub mod traits;
pub mod validator;
