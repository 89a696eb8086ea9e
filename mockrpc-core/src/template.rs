//! Template Engine (spec §4.5): renders `{{...}}` placeholders in a rule
//! document's response body against the request, metadata, and stream
//! context.
//!
//! The `{{VAR}}`-span scan is the same two-layer approach as the teacher's
//! `${VAR}` environment-variable expansion in `metadata.rs`: a regex finds
//! candidate spans, and each span's body is then parsed and evaluated on
//! its own. Unlike `expand_env_vars`, a substitution failure here never
//! propagates an error — the original `{{...}}` text is left in place, per
//! spec §4.5's "never throws" requirement.

use std::sync::LazyLock;

use regex::Regex;

use crate::value::Value;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder regex is valid"));

/// Stream position context, present only for streaming responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamContext {
    pub index: usize,
    pub total: Option<usize>,
}

impl StreamContext {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.total.map(|t| self.index + 1 == t).unwrap_or(false)
    }
}

/// Supplies the dynamic `utils.*` namespace. The default implementation uses
/// real wall-clock time, random numbers, and UUIDs; tests substitute a
/// deterministic one.
pub trait UtilsProvider {
    fn now_rfc3339(&self) -> String;
    fn uuid(&self) -> String;
    fn random(&self, min: f64, max: f64) -> f64;
}

pub struct DefaultUtils;

impl UtilsProvider for DefaultUtils {
    fn now_rfc3339(&self) -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn random(&self, min: f64, max: f64) -> f64 {
        // No `rand` dependency in the ambient stack: a small xorshift seeded
        // from the current time is adequate for mock-response jitter.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15);
        let mut x = seed ^ 0x2545F4914F6CDD1D;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        let unit = (x as f64) / (u64::MAX as f64);
        min + unit * (max - min)
    }
}

pub struct TemplateContext<'a> {
    pub request: &'a Value,
    pub metadata: &'a crate::match_engine::Metadata,
    pub stream: Option<StreamContext>,
    pub utils: &'a dyn UtilsProvider,
}

/// Renders every `{{...}}` span found in `input`. Only string leaves of the
/// response body tree are scanned; the caller is expected to walk the body
/// (e.g. a `serde_yaml::Value` converted to `Value`) and call this per
/// string leaf.
pub fn render(input: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;

    for cap in PLACEHOLDER_REGEX.captures_iter(input) {
        let full_match = cap.get(0).expect("regex match exists");
        let body = cap[1].trim();

        out.push_str(&input[last_end..full_match.start()]);
        match eval_placeholder(body, ctx) {
            Some(rendered) => out.push_str(&rendered),
            None => out.push_str(full_match.as_str()),
        }
        last_end = full_match.end();
    }
    out.push_str(&input[last_end..]);
    out
}

/// Walks a generic value tree, rendering every string leaf via `render`.
pub fn render_value(value: &Value, ctx: &TemplateContext) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, ctx)),
        Value::List(items) => Value::List(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Map(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), render_value(v, ctx))).collect()),
        other => other.clone(),
    }
}

fn eval_placeholder(body: &str, ctx: &TemplateContext) -> Option<String> {
    if let Some(rest) = body.strip_prefix("request.") {
        return ctx.request.get_path(rest).map(|v| v.coerce_string());
    }
    if let Some(rest) = body.strip_prefix("metadata.") {
        return ctx.metadata.get(rest).map(String::from);
    }
    if let Some(rest) = body.strip_prefix("stream.") {
        let stream = ctx.stream?;
        return Some(match rest {
            "index" => stream.index.to_string(),
            "total" => stream.total.map(|t| t.to_string())?,
            "isFirst" => stream.is_first().to_string(),
            "isLast" => stream.is_last().to_string(),
            _ => return None,
        });
    }
    if let Some(rest) = body.strip_prefix("utils.") {
        return eval_utils_call(rest, ctx);
    }
    None
}

/// Parses and evaluates a single `utils.<fn>(<args>)` call. Arguments are a
/// flat comma-separated list of string/number/bool literals — the template
/// grammar is intentionally not recursive.
fn eval_utils_call(call: &str, ctx: &TemplateContext) -> Option<String> {
    let open = call.find('(')?;
    let close = call.rfind(')')?;
    if close < open {
        return None;
    }
    let name = &call[..open];
    let args_str = &call[open + 1..close];
    let args = parse_args(args_str);

    match name {
        "now" => Some(ctx.utils.now_rfc3339()),
        "uuid" => Some(ctx.utils.uuid()),
        "random" => {
            let min = args.first()?.as_number()?;
            let max = args.get(1)?.as_number()?;
            Some(format!("{}", ctx.utils.random(min, max)))
        }
        "format" => {
            let template = args.first()?.as_string()?;
            Some(format_with_args(&template, &args[1..]))
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Arg {
    String(String),
    Number(f64),
    Bool(bool),
}

impl Arg {
    fn as_number(&self) -> Option<f64> {
        match self {
            Arg::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn as_string(&self) -> Option<String> {
        match self {
            Arg::String(s) => Some(s.clone()),
            Arg::Number(n) => Some(n.to_string()),
            Arg::Bool(b) => Some(b.to_string()),
        }
    }

    fn render(&self) -> String {
        match self {
            Arg::String(s) => s.clone(),
            Arg::Number(n) => n.to_string(),
            Arg::Bool(b) => b.to_string(),
        }
    }
}

fn parse_args(input: &str) -> Vec<Arg> {
    if input.trim().is_empty() {
        return Vec::new();
    }
    input
        .split(',')
        .map(str::trim)
        .map(|token| {
            if let Some(inner) = token.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                Arg::String(inner.to_string())
            } else if token == "true" {
                Arg::Bool(true)
            } else if token == "false" {
                Arg::Bool(false)
            } else if let Ok(n) = token.parse::<f64>() {
                Arg::Number(n)
            } else {
                Arg::String(token.to_string())
            }
        })
        .collect()
}

/// `format("{} had {} items", name, count)`-style positional substitution.
fn format_with_args(template: &str, args: &[Arg]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args_iter = args.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'}') {
            chars.next();
            match args_iter.next() {
                Some(a) => out.push_str(&a.render()),
                None => out.push_str("{}"),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_engine::Metadata;
    use std::collections::BTreeMap;

    struct FixedUtils;
    impl UtilsProvider for FixedUtils {
        fn now_rfc3339(&self) -> String {
            "2026-01-01T00:00:00Z".to_string()
        }
        fn uuid(&self) -> String {
            "00000000-0000-0000-0000-000000000000".to_string()
        }
        fn random(&self, min: f64, _max: f64) -> f64 {
            min
        }
    }

    fn req(fields: Vec<(&str, Value)>) -> Value {
        let mut m = BTreeMap::new();
        for (k, v) in fields {
            m.insert(k.to_string(), v);
        }
        Value::Map(m)
    }

    #[test]
    fn renders_request_path() {
        let request = req(vec![("name", Value::String("Ada".into()))]);
        let metadata = Metadata::new();
        let utils = FixedUtils;
        let ctx = TemplateContext { request: &request, metadata: &metadata, stream: None, utils: &utils };
        assert_eq!(render("hello, {{request.name}}!", &ctx), "hello, Ada!");
    }

    #[test]
    fn unresolvable_placeholder_is_left_verbatim() {
        let request = req(vec![]);
        let metadata = Metadata::new();
        let utils = FixedUtils;
        let ctx = TemplateContext { request: &request, metadata: &metadata, stream: None, utils: &utils };
        assert_eq!(render("{{request.missing}}", &ctx), "{{request.missing}}");
    }

    #[test]
    fn utils_uuid_and_now() {
        let request = req(vec![]);
        let metadata = Metadata::new();
        let utils = FixedUtils;
        let ctx = TemplateContext { request: &request, metadata: &metadata, stream: None, utils: &utils };
        assert_eq!(render("{{utils.uuid()}}", &ctx), "00000000-0000-0000-0000-000000000000");
        assert_eq!(render("{{utils.now()}}", &ctx), "2026-01-01T00:00:00Z");
    }

    #[test]
    fn stream_context_fields() {
        let request = req(vec![]);
        let metadata = Metadata::new();
        let utils = FixedUtils;
        let stream = StreamContext { index: 2, total: Some(3) };
        let ctx = TemplateContext { request: &request, metadata: &metadata, stream: Some(stream), utils: &utils };
        assert_eq!(render("{{stream.index}}", &ctx), "2");
        assert_eq!(render("{{stream.isLast}}", &ctx), "true");
        assert_eq!(render("{{stream.isFirst}}", &ctx), "false");
    }

    #[test]
    fn format_function_positional_args() {
        let request = req(vec![]);
        let metadata = Metadata::new();
        let utils = FixedUtils;
        let ctx = TemplateContext { request: &request, metadata: &metadata, stream: None, utils: &utils };
        assert_eq!(
            render(r#"{{utils.format("hi {}, you are {}", "Ada", 30)}}"#, &ctx),
            "hi Ada, you are 30"
        );
    }

    #[test]
    fn render_value_walks_nested_structures() {
        let request = req(vec![("id", Value::String("42".into()))]);
        let metadata = Metadata::new();
        let utils = FixedUtils;
        let ctx = TemplateContext { request: &request, metadata: &metadata, stream: None, utils: &utils };
        let body = Value::Map(BTreeMap::from([(
            "echoed".to_string(),
            Value::String("id={{request.id}}".to_string()),
        )]));
        let rendered = render_value(&body, &ctx);
        assert_eq!(rendered.get_field("echoed").unwrap().as_str(), Some("id=42"));
    }
}
