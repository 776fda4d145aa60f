pub mod alias;
pub mod classify;
pub mod error;
pub mod include;
pub mod model;
mod parser;
pub mod resolver;
mod tokenizer;
pub mod writer;

pub use classify::{Classification, RuleBlock, RuleReason, classify};
pub use error::{Diagnostic, DiagnosticKind, LoadError, ResolutionError, WriteError};
pub use model::{
    Block, BlockId, BlockKind, ConfigDocument, ConnectableHostEntry, FileId, Keyword, SourceFile,
};
pub use resolver::{CancelToken, ConfigDump, EffectiveConfig, SshClient};
pub use writer::{Mutation, NewHost, PendingWrite, WriteOptions};
