use moka::sync::Cache;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Derives the idempotency key of an invocation.
///
/// Returning `None` means no key can be derived; the coordinator refuses to
/// run the operation in that case.
pub trait KeyExtractor<C: ?Sized>: Send + Sync {
    fn extract(&self, context: &C) -> Option<String>;
}

impl<C: ?Sized, F> KeyExtractor<C> for F
where
    F: Fn(&C) -> Option<String> + Send + Sync,
{
    fn extract(&self, context: &C) -> Option<String> {
        self(context)
    }
}

/// A named call with its arguments, as seen by key extraction.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation<A> {
    pub operation: String,
    pub args: A,
}

impl<A> Invocation<A> {
    pub fn new(operation: impl Into<String>, args: A) -> Self {
        Self {
            operation: operation.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

/// Parsed form of a key template such as `"points-{customer_id}-{request_id}"`.
///
/// Placeholders are dot-separated paths into the serialized arguments; numeric
/// parts index arrays, so tuple arguments are reached with `{0.request_id}`.
/// `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTemplate {
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut path = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        path.push(c);
                    }
                    if !closed {
                        return Err(format!("unterminated placeholder in '{}'", template));
                    }
                    let parts: Vec<String> = path.trim().split('.').map(str::to_string).collect();
                    if parts.iter().any(|p| p.is_empty()) {
                        return Err(format!("empty field path in '{}'", template));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(parts));
                }
                '}' => return Err(format!("unmatched '}}' in '{}'", template)),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err("template is empty".to_string());
        }
        Ok(Self { segments })
    }

    /// Renders against serialized arguments. Missing, null or composite
    /// fields make the key underivable.
    pub fn render(&self, args: &Value) -> Option<String> {
        let mut key = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Field(path) => key.push_str(&scalar_to_string(lookup(args, path)?)?),
            }
        }
        Some(key)
    }
}

fn lookup<'v>(root: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(root, |value, part| match value {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Template-driven extractor with per-operation overrides.
///
/// Templates compile on first use and stay cached per operation name.
pub struct TemplateKeyExtractor {
    default_template: Option<String>,
    templates: HashMap<String, String>,
    compiled: Cache<String, Arc<CompiledTemplate>>,
}

impl TemplateKeyExtractor {
    pub fn new(default_template: impl Into<String>) -> Self {
        Self {
            default_template: Some(default_template.into()),
            ..Self::without_default()
        }
    }

    /// Extractor that only knows the operations registered on it.
    pub fn without_default() -> Self {
        Self {
            default_template: None,
            templates: HashMap::new(),
            compiled: Cache::new(1024),
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(operation.into(), template.into());
        self
    }

    fn template_for(&self, operation: &str) -> Option<Arc<CompiledTemplate>> {
        let source = self
            .templates
            .get(operation)
            .or(self.default_template.as_ref())?;

        self.compiled
            .try_get_with(operation.to_string(), || {
                CompiledTemplate::parse(source).map(Arc::new)
            })
            .map_err(|e| {
                tracing::warn!(operation, error = %e, "Invalid idempotency key template");
            })
            .ok()
    }
}

impl<A: Serialize> KeyExtractor<Invocation<A>> for TemplateKeyExtractor {
    fn extract(&self, invocation: &Invocation<A>) -> Option<String> {
        let template = self.template_for(&invocation.operation)?;
        let args = serde_json::to_value(&invocation.args).ok()?;
        template.render(&args)
    }
}

/// Condenses the key of another extractor into `"{prefix}_{sha256 hex}"`,
/// so arbitrarily long client keys fit the key column.
pub struct HashedKeyExtractor<K> {
    inner: K,
    prefix: String,
}

impl<K> HashedKeyExtractor<K> {
    pub fn new(inner: K, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }
}

pub fn hash_key(prefix: &str, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{}_{}", prefix, hex::encode(hasher.finalize()))
}

impl<C: ?Sized, K: KeyExtractor<C>> KeyExtractor<C> for HashedKeyExtractor<K> {
    fn extract(&self, context: &C) -> Option<String> {
        self.inner
            .extract(context)
            .map(|raw| hash_key(&self.prefix, &raw))
    }
}
