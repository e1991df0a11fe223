pub mod key;
pub mod manifest;
pub mod sha;
pub mod spec;

pub use key::ResourceKey;
pub use manifest::Manifest;
pub use sha::CommitSha;
pub use spec::RepositorySpec;
