pub mod answer;
pub mod builder;
pub mod cache;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod guard;
pub mod index;
pub mod pipeline;
pub mod retriever;
pub mod store;

pub use answer::{generate_answer, GeneratedAnswer, SYSTEM_PROMPT};
pub use builder::{BuildReport, CancelToken, IndexBuilder};
pub use config::{ProviderKind, RagConfig};
pub use context::{BudgetUnit, ContextAssembler, RecordLookup};
pub use embedding::{Embedder, EmbeddingProvider, HashProvider, OpenAiEmbeddingClient};
pub use error::{ProviderError, ProviderErrorKind, RagError, Result};
pub use eval::{evaluate, EvalCase, EvalReport};
pub use guard::{GuardDecision, GuardRejection, GuardRules, InputGuard, RuleCategory};
pub use index::{is_stale, Index, IndexEntry, IndexHeader};
pub use pipeline::{load_dataset, AskResponse, IndexStatus, RagEngine};
pub use retriever::{cosine_similarity, QueryResult, Retriever, ScoredRecord, SearchParams};
pub use store::IndexStore;
pub use finops_core::{Dataset, Origin, SourceRecord};
