//! Service Registry (spec §4.7): a flat dispatch table built once per
//! reloaded snapshot, generalizing the teacher's `list_services`/
//! `list_methods` descriptor walk into entries the Streaming Dispatcher can
//! drive directly.

use prost_reflect::MethodDescriptor;

use crate::descriptor::DescriptorGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamShape {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidi,
}

impl StreamShape {
    fn from_method(method: &MethodDescriptor) -> Self {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => StreamShape::Unary,
            (false, true) => StreamShape::ServerStreaming,
            (true, false) => StreamShape::ClientStreaming,
            (true, true) => StreamShape::Bidi,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub service_full_name: String,
    pub method_name: String,
    pub rule_key: String,
    pub shape: StreamShape,
    pub method: MethodDescriptor,
}

impl MethodEntry {
    pub fn full_path(&self) -> String {
        format!("/{}/{}", self.service_full_name, self.method_name)
    }
}

/// All methods reachable from the loaded descriptor graph, keyed in
/// declaration order (iteration order is otherwise not meaningful).
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    entries: Vec<MethodEntry>,
}

impl ServiceRegistry {
    pub fn build(graph: &DescriptorGraph) -> Self {
        let mut entries = Vec::new();
        for service in graph.services() {
            for method in service.methods() {
                let rule_key = DescriptorGraph::rule_key_for(&service, &method);
                entries.push(MethodEntry {
                    service_full_name: service.full_name().to_string(),
                    method_name: method.name().to_string(),
                    rule_key,
                    shape: StreamShape::from_method(&method),
                    method,
                });
            }
        }
        ServiceRegistry { entries }
    }

    pub fn find(&self, service_full_name: &str, method_name: &str) -> Option<&MethodEntry> {
        self.entries
            .iter()
            .find(|e| e.service_full_name == service_full_name && e.method_name == method_name)
    }

    pub fn find_by_rule_key(&self, rule_key: &str) -> Option<&MethodEntry> {
        self.entries.iter().find(|e| e.rule_key == rule_key)
    }

    pub fn entries(&self) -> &[MethodEntry] {
        &self.entries
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.service_full_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_proto(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn builds_an_entry_per_method_with_stream_shape() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(
            dir.path(),
            "svc.proto",
            r#"
                syntax = "proto3";
                package test.v1;
                message Req {}
                message Resp {}
                service Demo {
                    rpc Unary(Req) returns (Resp);
                    rpc ServerStream(Req) returns (stream Resp);
                    rpc ClientStream(stream Req) returns (Resp);
                    rpc Bidi(stream Req) returns (stream Resp);
                }
            "#,
        );
        let (graph, _) = DescriptorGraph::load_dir(dir.path(), &[]);
        let registry = ServiceRegistry::build(&graph);

        assert_eq!(registry.entries().len(), 4);
        assert_eq!(registry.find("test.v1.Demo", "Unary").unwrap().shape, StreamShape::Unary);
        assert_eq!(
            registry.find("test.v1.Demo", "ServerStream").unwrap().shape,
            StreamShape::ServerStreaming
        );
        assert_eq!(
            registry.find("test.v1.Demo", "ClientStream").unwrap().shape,
            StreamShape::ClientStreaming
        );
        assert_eq!(registry.find("test.v1.Demo", "Bidi").unwrap().shape, StreamShape::Bidi);
    }

    #[test]
    fn looks_up_by_rule_key() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(
            dir.path(),
            "svc.proto",
            r#"
                syntax = "proto3";
                package test.v1;
                message Req {}
                message Resp {}
                service Demo { rpc DoThing(Req) returns (Resp); }
            "#,
        );
        let (graph, _) = DescriptorGraph::load_dir(dir.path(), &[]);
        let registry = ServiceRegistry::build(&graph);
        assert!(registry.find_by_rule_key("test.v1.demo.dothing").is_some());
    }
}
