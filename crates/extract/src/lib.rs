pub mod clean;
pub mod deterministic;
pub mod form990;
pub mod llm;
pub mod merge;
pub mod structured;

pub use clean::{clean_for_llm, Cleaned};
pub use deterministic::extract_deterministic;
pub use form990::{Form990Data, Form990Parser};
pub use llm::{LlmExtraction, WebsiteExtractor};
pub use merge::{merge_all, merge_field, MergedData};
pub use structured::extract_structured;
