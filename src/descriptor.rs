//! Descriptor discovery and resolution.
//!
//! `.proto` files are found by walking a directory and compiled at runtime,
//! so no generated bindings are needed for the services being mocked.

use crate::error::{ConfigError, DescriptorError};
use globset::{GlobBuilder, GlobMatcher};
use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Resolves a service and method to its message shapes.
pub trait DescriptorResolver: Send + Sync {
    fn resolve(&self, service: &str, method: &str) -> Result<MethodShape, DescriptorError>;
}

/// Input and output shape of a single method.
#[derive(Debug, Clone)]
pub struct MethodShape {
    /// Fully-qualified service name (`package.Service`)
    pub service: String,
    /// Method name as declared
    pub method: String,
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodShape {
    fn from_descriptor(method: &MethodDescriptor) -> Self {
        Self {
            service: method.parent_service().full_name().to_string(),
            method: method.name().to_string(),
            input: method.input(),
            output: method.output(),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
        }
    }

    /// True for client-streaming, server-streaming and bidirectional methods.
    pub fn is_streaming(&self) -> bool {
        self.client_streaming || self.server_streaming
    }

    /// HTTP/2 path the method is served on.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// A compiled, immutable set of descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    pool: DescriptorPool,
    files: Vec<PathBuf>,
}

impl DescriptorSet {
    /// Discover and compile every `.proto` file under `dir`.
    ///
    /// `dir` doubles as the import root, so imports are written relative
    /// to it.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let files = discover_proto_files(dir)?;
        let fds = protox::compile(&files, [dir]).map_err(|e| ConfigError::Compile {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let pool = DescriptorPool::from_file_descriptor_set(fds).map_err(|e| {
            ConfigError::Compile {
                path: dir.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        debug!(
            dir = %dir.display(),
            files = files.len(),
            services = pool.services().count(),
            "Compiled descriptors"
        );

        Ok(Self { pool, files })
    }

    /// Wrap an already-built pool.
    pub fn from_pool(pool: DescriptorPool) -> Self {
        Self {
            pool,
            files: Vec::new(),
        }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Files the set was compiled from (empty for [`DescriptorSet::from_pool`]).
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Every method of every service in the set.
    pub fn methods(&self) -> Vec<MethodShape> {
        self.pool
            .services()
            .flat_map(|service| service.methods().collect::<Vec<_>>())
            .map(|method| MethodShape::from_descriptor(&method))
            .collect()
    }
}

impl DescriptorResolver for DescriptorSet {
    fn resolve(&self, service: &str, method: &str) -> Result<MethodShape, DescriptorError> {
        let service_desc =
            self.pool
                .get_service_by_name(service)
                .ok_or_else(|| DescriptorError::ServiceNotFound {
                    service: service.to_string(),
                })?;

        let method_desc = service_desc
            .methods()
            .find(|m| m.name() == method)
            .ok_or_else(|| DescriptorError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            })?;

        Ok(MethodShape::from_descriptor(&method_desc))
    }
}

fn proto_matcher() -> Result<GlobMatcher, ConfigError> {
    GlobBuilder::new("*.proto")
        .case_insensitive(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// Recursively find `.proto` files under `dir`, extension matched
/// case-insensitively. Results are sorted for stable compilation order.
pub fn discover_proto_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if dir.as_os_str().is_empty() {
        return Err(ConfigError::EmptyDirectory);
    }
    if !dir.exists() {
        return Err(ConfigError::MissingDirectory(dir.to_path_buf()));
    }
    if !dir.is_dir() {
        return Err(ConfigError::NotADirectory(dir.to_path_buf()));
    }

    let matcher = proto_matcher()?;
    let mut files = Vec::new();

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|source| ConfigError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() && matcher.is_match(entry.file_name()) {
            files.push(entry.into_path());
        }
    }

    if files.is_empty() {
        return Err(ConfigError::NoDescriptorFiles(dir.to_path_buf()));
    }

    files.sort();
    Ok(files)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_discover_mixed_case_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.proto"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.PROTO"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = discover_proto_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("a.proto")));
        assert!(files.iter().any(|f| f.ends_with("sub/b.PROTO")));
    }

    #[test]
    fn test_discover_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_proto_files(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NoDescriptorFiles(_)));
    }

    #[test]
    fn test_discover_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = discover_proto_files(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::MissingDirectory(_)));

        let err = discover_proto_files(Path::new("")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDirectory));
    }

    #[test]
    fn test_load_and_resolve() {
        let set = kitchen();
        assert_eq!(set.files().len(), 1);

        let shape = set.resolve("kitchen.Greeter", "SayHello").unwrap();
        assert_eq!(shape.input.full_name(), "kitchen.HelloRequest");
        assert_eq!(shape.output.full_name(), "kitchen.HelloReply");
        assert!(!shape.is_streaming());
        assert_eq!(shape.path(), "/kitchen.Greeter/SayHello");

        let chat = set.resolve("kitchen.Greeter", "Chat").unwrap();
        assert!(chat.client_streaming && chat.server_streaming);
    }

    #[test]
    fn test_resolve_missing() {
        let set = kitchen();
        assert_eq!(
            set.resolve("kitchen.Nope", "SayHello").unwrap_err(),
            DescriptorError::ServiceNotFound {
                service: "kitchen.Nope".to_string()
            }
        );
        assert!(matches!(
            set.resolve("kitchen.Greeter", "Nope").unwrap_err(),
            DescriptorError::MethodNotFound { .. }
        ));
    }

    #[test]
    fn test_invalid_proto_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.proto"), "syntax = \"proto3\"; message {").unwrap();
        let err = DescriptorSet::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Compile { .. }));
    }

    #[test]
    fn test_methods_lists_every_rpc() {
        let set = kitchen();
        let mut paths: Vec<_> = set.methods().iter().map(|m| m.path()).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["/kitchen.Greeter/Chat", "/kitchen.Greeter/SayHello"]
        );
    }
}
