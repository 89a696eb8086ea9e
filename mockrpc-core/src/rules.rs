//! Rule Loader: reads on-disk YAML rule documents into an index keyed by
//! `lowercase(package.service.method)`, the same key the Schema Loader
//! derives for each method (`DescriptorGraph::rule_key_for`).

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{MockError, Result};
use crate::value::Value;

/// One leaf of a match/when predicate (spec §3 "Match/when expression").
#[derive(Debug, Clone)]
pub enum Leaf {
    /// A bare literal: equality after string coercion.
    Eq(Value),
    Ne(Value),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<Value>),
    Contains(Value),
    Regex(String),
    Exists(bool),
    Not(Box<Leaf>),
}

/// A predicate: an (unordered-semantically, order-preserved) set of
/// `dotted.path -> leaf` conditions, all of which must hold.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    pub conditions: Vec<(String, Leaf)>,
}

impl Predicate {
    fn parse(raw: &serde_yaml::Value) -> Result<Self> {
        let mapping = raw
            .as_mapping()
            .ok_or_else(|| MockError::Parse("predicate must be a mapping".into()))?;
        let mut conditions = Vec::with_capacity(mapping.len());
        for (k, v) in mapping {
            let path = k
                .as_str()
                .ok_or_else(|| MockError::Parse("predicate keys must be strings".into()))?
                .to_string();
            conditions.push((path, Leaf::parse(v)?));
        }
        Ok(Predicate { conditions })
    }
}

impl Leaf {
    fn parse(raw: &serde_yaml::Value) -> Result<Self> {
        if let Some(mapping) = raw.as_mapping() {
            if mapping.len() == 1 {
                let (key, value) = mapping.iter().next().unwrap();
                if let Some(key) = key.as_str() {
                    return Leaf::parse_op(key, value);
                }
            }
        }
        Ok(Leaf::Eq(Value::from(raw)))
    }

    fn parse_op(op: &str, value: &serde_yaml::Value) -> Result<Self> {
        let as_number = || {
            value
                .as_f64()
                .ok_or_else(|| MockError::Parse(format!("{op} requires a numeric operand")))
        };
        Ok(match op {
            "eq" => Leaf::Eq(Value::from(value)),
            "ne" => Leaf::Ne(Value::from(value)),
            "gt" => Leaf::Gt(as_number()?),
            "gte" => Leaf::Gte(as_number()?),
            "lt" => Leaf::Lt(as_number()?),
            "lte" => Leaf::Lte(as_number()?),
            "in" => {
                let items = value
                    .as_sequence()
                    .ok_or_else(|| MockError::Parse("in requires an array operand".into()))?;
                Leaf::In(items.iter().map(Value::from).collect())
            }
            "contains" => Leaf::Contains(Value::from(value)),
            "regex" => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| MockError::Parse("regex requires a string operand".into()))?;
                Leaf::Regex(pattern.to_string())
            }
            "exists" => Leaf::Exists(value.as_bool().unwrap_or(true)),
            "not" => Leaf::Not(Box::new(Leaf::parse(value)?)),
            // Not a recognized operator key: treat the whole mapping as a
            // literal object to compare for equality, per the "leaves are
            // either literal scalars... or operator objects" rule — an
            // unrecognized single-key map falls back to scalar semantics.
            _ => Leaf::Eq(Value::Map(BTreeMap::from([(op.to_string(), Value::from(value))]))),
        })
    }
}

/// One candidate response a rule may select, per spec §3 "Rule document".
#[derive(Debug, Clone, Default)]
pub struct ResponseOption {
    pub when: Option<Predicate>,
    pub priority: i64,
    pub body: Option<serde_yaml::Value>,
    pub trailers: BTreeMap<String, String>,
    pub stream_items: Option<Vec<serde_yaml::Value>>,
    pub stream_delay_ms: Option<u64>,
    pub stream_loop: bool,
}

/// The top-level `match` block: subpredicates over metadata and/or request.
#[derive(Debug, Clone, Default)]
pub struct TopLevelMatch {
    pub metadata: Option<Predicate>,
    pub request: Option<Predicate>,
}

/// A rule document for one RPC method.
#[derive(Debug, Clone)]
pub struct RuleDocument {
    pub method: String,
    pub top_level_match: Option<TopLevelMatch>,
    pub responses: Vec<ResponseOption>,
}

/// `lowercase(package.service.method) -> RuleDocument`.
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    rules: BTreeMap<String, RuleDocument>,
}

impl RuleIndex {
    pub fn empty() -> Self {
        RuleIndex::default()
    }

    pub fn get(&self, rule_key: &str) -> Option<&RuleDocument> {
        self.rules.get(rule_key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Loads every `.yaml`/`.yml` file under `root`. A missing directory is
    /// not an error: it yields an empty index, matching the Schema Loader's
    /// own "missing directory" tolerance.
    pub fn load_dir(root: &Path) -> (Self, Vec<(String, String)>) {
        let mut index = RuleIndex::default();
        let mut errors = Vec::new();

        if !root.is_dir() {
            return (index, errors);
        }

        for path in discover_rule_files(root) {
            let path_str = path.to_string_lossy().into_owned();
            match std::fs::read_to_string(&path) {
                Ok(contents) => match parse_document(&contents) {
                    Ok(doc) => {
                        let key = doc.method.to_lowercase();
                        index.rules.insert(key, doc);
                    }
                    Err(e) => {
                        eprintln!("rule loader: skipping {path_str}: {e}");
                        errors.push((path_str, e.to_string()));
                    }
                },
                Err(e) => {
                    eprintln!("rule loader: could not read {path_str}: {e}");
                    errors.push((path_str, e.to_string()));
                }
            }
        }

        (index, errors)
    }
}

fn parse_document(contents: &str) -> Result<RuleDocument> {
    let raw: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|e| MockError::Parse(format!("invalid rule document: {e}")))?;
    let mapping = raw.as_mapping().ok_or_else(|| MockError::Parse("rule document must be a mapping".into()))?;

    let method = mapping
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MockError::Parse("rule document missing required 'method' field".into()))?
        .to_string();

    let top_level_match = match mapping.get("match") {
        Some(m) => {
            let mapping = m.as_mapping().ok_or_else(|| MockError::Parse("'match' must be a mapping".into()))?;
            Some(TopLevelMatch {
                metadata: mapping.get("metadata").map(Predicate::parse).transpose()?,
                request: mapping.get("request").map(Predicate::parse).transpose()?,
            })
        }
        None => None,
    };

    let responses = match mapping.get("responses") {
        Some(serde_yaml::Value::Sequence(items)) => {
            items.iter().map(parse_response_option).collect::<Result<Vec<_>>>()?
        }
        Some(_) => return Err(MockError::Parse("'responses' must be a list".into())),
        None => Vec::new(),
    };

    Ok(RuleDocument { method, top_level_match, responses })
}

fn parse_response_option(raw: &serde_yaml::Value) -> Result<ResponseOption> {
    let mapping = raw.as_mapping().ok_or_else(|| MockError::Parse("response option must be a mapping".into()))?;

    let when = mapping.get("when").map(Predicate::parse).transpose()?;
    let priority = mapping.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
    let body = mapping.get("body").cloned();
    let stream_items = mapping
        .get("stream_items")
        .and_then(|v| v.as_sequence())
        .map(|items| items.to_vec());
    let stream_delay_ms = mapping.get("stream_delay_ms").and_then(|v| v.as_u64());
    let stream_loop = mapping.get("stream_loop").and_then(|v| v.as_bool()).unwrap_or(false);

    let trailers = mapping
        .get("trailers")
        .and_then(|v| v.as_mapping())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    let key = k.as_str()?.to_string();
                    let value = v.as_str().map(String::from).or_else(|| v.as_i64().map(|n| n.to_string()));
                    value.map(|v| (key, v))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ResponseOption { when, priority, body, trailers, stream_items, stream_delay_ms, stream_loop })
}

fn discover_rule_files(root: &Path) -> Vec<std::path::PathBuf> {
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
            } else {
                let ext = path.extension().and_then(|e| e.to_str());
                if matches!(ext, Some("yaml") | Some("yml")) {
                    out.push(path);
                }
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rule(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn missing_directory_yields_empty_index() {
        let (index, errors) = RuleIndex::load_dir(Path::new("/nonexistent/rules"));
        assert!(index.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn loads_and_keys_by_lowercase_method() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "greeter.yaml",
            r#"
method: Test.V1.Greeter.SayHello
responses:
  - when:
      request.name: "admin"
    priority: 10
    body:
      reply: "hello, admin"
"#,
        );
        let (index, errors) = RuleIndex::load_dir(dir.path());
        assert!(errors.is_empty());
        let doc = index.get("test.v1.greeter.sayhello").expect("rule present");
        assert_eq!(doc.responses.len(), 1);
        assert_eq!(doc.responses[0].priority, 10);
    }

    #[test]
    fn malformed_document_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "good.yaml", "method: A.B.C\n");
        write_rule(dir.path(), "bad.yaml", "method: [this is not a valid scalar\n");
        let (index, errors) = RuleIndex::load_dir(dir.path());
        assert_eq!(index.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn operator_leaf_parses_from_single_key_map() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "r.yaml",
            r#"
method: A.B.C
responses:
  - when:
      request.age:
        gte: 18
    priority: 1
"#,
        );
        let (index, errors) = RuleIndex::load_dir(dir.path());
        assert!(errors.is_empty());
        let doc = index.get("a.b.c").unwrap();
        let (_, leaf) = &doc.responses[0].when.as_ref().unwrap().conditions[0];
        assert!(matches!(leaf, Leaf::Gte(n) if *n == 18.0));
    }
}
