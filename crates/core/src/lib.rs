pub mod config;
pub mod constants;
pub mod ein;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use ein::{ein_digits, ein_matches, normalize_ein};
pub use error::PipelineError;
pub use types::{
    BaselineNarrative, Charity, CharityDocument, Citation, ConfidenceScores, ContentType,
    Dimension, DocumentType, Evaluation, ExtractionResult, ExtractionStatus, FetchOutput,
    PageType, ParseOutput, PdfRecord, PhaseCacheEntry, RawPayload, RawRecord, RichNarrative,
    TransferStatus, WalletTag,
};
