//! Concrete `PolicySource` implementations. The built-in one reads a
//! directory of policy documents from the local filesystem; a real
//! deployment typically also registers external sources (service catalog,
//! Git-synced config, ...) through the same trait.

pub mod file;

pub use file::FilePolicySource;
