pub mod acquisition;
pub mod chat;
pub mod claude_generator;
pub mod config;
pub mod envelope;
pub mod events;
pub mod generator;
pub mod metadata;
pub mod object_storage;
pub mod pipeline;
pub mod reference;
pub mod sequencing;
pub mod storage;
pub mod stream;

pub use acquisition::{GitCloneAcquirer, RepositoryAcquirer, WorkingDirectory};
pub use chat::{ChatBackend, Message, OpenAiChatBackend, Role};
pub use config::{ConfigError, ServiceConfig};
pub use envelope::{Acknowledgement, ActorKind, Envelope, ErrorCode, ErrorDetails};
pub use events::GenerationChunk;
pub use generator::{ClaudeGenerator, Generator};
pub use metadata::{GitHubMetadataClient, MetadataSource, RepositoryMetadata};
pub use object_storage::ObjectStorage;
pub use pipeline::{PipelineError, TeardownPipeline};
pub use reference::RepoReference;
pub use sequencing::StreamId;
pub use storage::{CacheKey, LocalStorage, StorageAdaptor};
pub use stream::StreamEmitter;
