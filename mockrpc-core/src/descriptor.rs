//! Schema Loader: parses a directory of `.proto` files into an immutable
//! descriptor graph.
//!
//! Grounded in `descriptor_source_from_proto_files`/`find_symbol_in_pool`
//! from the teacher crate's reflection-source machinery: both build a
//! `prost_reflect::DescriptorPool` from `protox::compile` output. The
//! difference here is resilience — a directory of user-authored `.proto`
//! files is expected to occasionally contain one broken file, and the
//! loader must keep going rather than fail the whole load.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use prost_reflect::DescriptorPool;

use crate::error::{MockError, Result};

/// An immutable snapshot of all loaded `.proto` definitions.
#[derive(Clone)]
pub struct DescriptorGraph {
    pool: DescriptorPool,
}

/// Outcome of a schema-directory load: which files made it in, and why any
/// others were skipped.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub loaded_files: Vec<String>,
    pub skipped_files: Vec<(String, String)>,
}

impl DescriptorGraph {
    pub fn empty() -> Self {
        DescriptorGraph {
            pool: DescriptorPool::new(),
        }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn services(&self) -> impl Iterator<Item = prost_reflect::ServiceDescriptor> + '_ {
        self.pool.services()
    }

    pub fn find_service(&self, full_name: &str) -> Option<prost_reflect::ServiceDescriptor> {
        self.pool.get_service_by_name(full_name)
    }

    pub fn find_message(&self, full_name: &str) -> Option<prost_reflect::MessageDescriptor> {
        self.pool.get_message_by_name(full_name)
    }

    /// Loads every `.proto` file reachable under `root` (recursively),
    /// using `root` itself as the sole default include path when none is
    /// given — matching the teacher's `DescriptorSourceFromProtoFiles`
    /// default of `["."]` when `import_paths` is empty.
    ///
    /// A missing root directory is not an error: it yields an empty graph,
    /// per the Schema Loader's documented "missing directory" behavior.
    pub fn load_dir(root: &Path, include_paths: &[PathBuf]) -> (Self, LoadReport) {
        if !root.is_dir() {
            return (Self::empty(), LoadReport::default());
        }

        let proto_files = discover_proto_files(root);
        if proto_files.is_empty() {
            return (Self::empty(), LoadReport::default());
        }

        let mut includes: Vec<&Path> = vec![root];
        includes.extend(include_paths.iter().map(PathBuf::as_path));

        let file_args: Vec<String> = proto_files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        match protox::compile(&file_args, &includes) {
            Ok(fds) => {
                let loaded_files = fds.file.iter().filter_map(|f| f.name.clone()).collect();
                match DescriptorPool::from_file_descriptor_set(fds) {
                    Ok(pool) => (
                        DescriptorGraph { pool },
                        LoadReport {
                            loaded_files,
                            skipped_files: Vec::new(),
                        },
                    ),
                    Err(e) => {
                        eprintln!("schema loader: failed to build descriptor pool: {e}");
                        (Self::empty(), LoadReport::default())
                    }
                }
            }
            Err(_) => {
                // Batch compile failed; fall back to compiling one file at a
                // time so a single malformed file doesn't sink the others.
                compile_file_by_file(&proto_files, &includes)
            }
        }
    }

    /// Derives the rule-key for a method: `lowercase(package.service.method)`.
    pub fn rule_key_for(
        service: &prost_reflect::ServiceDescriptor,
        method: &prost_reflect::MethodDescriptor,
    ) -> String {
        format!("{}.{}", service.full_name(), method.name()).to_lowercase()
    }
}

fn discover_proto_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("proto") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

fn compile_file_by_file(files: &[PathBuf], includes: &[&Path]) -> (DescriptorGraph, LoadReport) {
    let mut report = LoadReport::default();
    let mut merged = prost_types::FileDescriptorSet::default();
    let mut merged_names = HashSet::new();

    for file in files {
        let file_str = file.to_string_lossy().into_owned();
        match protox::compile([&file_str], includes) {
            Ok(fds) => {
                for f in fds.file {
                    if let Some(name) = &f.name {
                        if merged_names.insert(name.clone()) {
                            merged.file.push(f);
                        }
                    }
                }
                report.loaded_files.push(file_str);
            }
            Err(e) => {
                eprintln!("schema loader: skipping {file_str}: {e}");
                report.skipped_files.push((file_str, e.to_string()));
            }
        }
    }

    match DescriptorPool::from_file_descriptor_set(merged) {
        Ok(pool) => (DescriptorGraph { pool }, report),
        Err(e) => {
            eprintln!("schema loader: failed to build descriptor pool from partial load: {e}");
            (DescriptorGraph::empty(), report)
        }
    }
}

/// Finds any symbol (service, method, message, enum, enum value, field, or
/// file) by fully-qualified name, mirroring the teacher's
/// `find_symbol_in_pool`. Used by the façade's reflection resolver (§4.9).
pub fn find_symbol(pool: &DescriptorPool, name: &str) -> Result<Symbol> {
    if let Some(svc) = pool.get_service_by_name(name) {
        return Ok(Symbol::Service(svc));
    }
    if let Some(msg) = pool.get_message_by_name(name) {
        return Ok(Symbol::Message(msg));
    }
    if let Some(e) = pool.get_enum_by_name(name) {
        return Ok(Symbol::Enum(e));
    }

    if let Some((parent, child)) = name.rsplit_once('.') {
        if let Some(svc) = pool.get_service_by_name(parent) {
            if let Some(method) = svc.methods().find(|m| m.name() == child) {
                return Ok(Symbol::Method(method));
            }
        }
        if let Some(msg) = pool.get_message_by_name(parent) {
            if let Some(field) = msg.fields().find(|f| f.name() == child) {
                return Ok(Symbol::Field(field));
            }
        }
        if let Some(e) = pool.get_enum_by_name(parent) {
            if let Some(v) = e.values().find(|v| v.name() == child) {
                return Ok(Symbol::EnumValue(v));
            }
        }
    }

    for file in pool.files() {
        if file.name() == name {
            return Ok(Symbol::File(file));
        }
    }

    Err(MockError::NotFound(name.to_string()))
}

#[derive(Debug, Clone)]
pub enum Symbol {
    Service(prost_reflect::ServiceDescriptor),
    Method(prost_reflect::MethodDescriptor),
    Message(prost_reflect::MessageDescriptor),
    Enum(prost_reflect::EnumDescriptor),
    Field(prost_reflect::FieldDescriptor),
    EnumValue(prost_reflect::EnumValueDescriptor),
    File(prost_reflect::FileDescriptor),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_proto(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn missing_directory_yields_empty_graph() {
        let (graph, report) = DescriptorGraph::load_dir(Path::new("/nonexistent/xyz"), &[]);
        assert_eq!(graph.services().count(), 0);
        assert!(report.loaded_files.is_empty());
    }

    #[test]
    fn loads_a_single_valid_service() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(
            dir.path(),
            "greeter.proto",
            r#"
                syntax = "proto3";
                package test.v1;
                message HelloRequest { string name = 1; }
                message HelloResponse { string message = 1; }
                service Greeter {
                    rpc SayHello(HelloRequest) returns (HelloResponse);
                }
            "#,
        );

        let (graph, report) = DescriptorGraph::load_dir(dir.path(), &[]);
        assert_eq!(report.loaded_files.len(), 1);
        let svc = graph.find_service("test.v1.Greeter").expect("service present");
        assert_eq!(svc.methods().count(), 1);
    }

    #[test]
    fn one_bad_file_does_not_sink_the_others() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(
            dir.path(),
            "good.proto",
            r#"
                syntax = "proto3";
                package test.v1;
                message Good { string x = 1; }
            "#,
        );
        write_proto(dir.path(), "bad.proto", "this is not valid proto syntax {{{");

        let (graph, report) = DescriptorGraph::load_dir(dir.path(), &[]);
        assert!(graph.find_message("test.v1.Good").is_some());
        assert_eq!(report.skipped_files.len(), 1);
    }

    #[test]
    fn rule_key_is_lowercase_dotted() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(
            dir.path(),
            "svc.proto",
            r#"
                syntax = "proto3";
                package My.Pkg;
                message Req {}
                message Resp {}
                service MyService {
                    rpc DoThing(Req) returns (Resp);
                }
            "#,
        );
        let (graph, _) = DescriptorGraph::load_dir(dir.path(), &[]);
        let svc = graph.find_service("My.Pkg.MyService").unwrap();
        let method = svc.methods().next().unwrap();
        assert_eq!(
            DescriptorGraph::rule_key_for(&svc, &method),
            "my.pkg.myservice.dothing"
        );
    }
}
