use std::any::Any;
use std::sync::Arc;

use ahash::AHashMap;
use serde_json::Value;
use tokio::time::Instant;

/// A template function callable as `{{ $name(arg, ...) }}`.
pub type CustomFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Engine-owned per-VU state, e.g. a connection.
pub type SessionHandle = Box<dyn Any + Send>;

/// Template functions available to every virtual user.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    fns: Arc<AHashMap<String, CustomFn>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.fns.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.fns).insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&CustomFn> {
        self.fns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

/// State of one virtual user, passed to hooks and engine steps.
pub struct VuContext {
    pub vu_id: u64,
    pub scenario: Arc<str>,
    pub worker: usize,
    pub started: Instant,
    pub vars: serde_json::Map<String, Value>,
    funcs: FunctionRegistry,
    session: Option<SessionHandle>,
}

impl std::fmt::Debug for VuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VuContext")
            .field("vu_id", &self.vu_id)
            .field("scenario", &self.scenario)
            .field("worker", &self.worker)
            .field("vars", &self.vars)
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

impl VuContext {
    pub fn new(vu_id: u64, scenario: Arc<str>, worker: usize, funcs: FunctionRegistry) -> Self {
        Self {
            vu_id,
            scenario,
            worker,
            started: Instant::now(),
            vars: serde_json::Map::new(),
            funcs,
            session: None,
        }
    }

    pub fn with_vars(mut self, vars: serde_json::Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn funcs(&self) -> &FunctionRegistry {
        &self.funcs
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Option<Value> {
        self.funcs.get(name).map(|f| f(args))
    }

    pub fn set_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }

    pub fn take_session(&mut self) -> Option<SessionHandle> {
        self.session.take()
    }

    pub fn session_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.session.as_mut().and_then(|s| s.downcast_mut::<T>())
    }

    /// Substitute `{{ var }}`, `{{ a.b }}` and `{{ $fn(arg, ...) }}` placeholders.
    ///
    /// Unknown variables render as an empty string; unknown functions are left as is.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                out.push_str(&rest[open..]);
                return out;
            };

            let expr = after[..close].trim();
            match self.eval(expr) {
                Some(v) => out.push_str(&display(&v)),
                None => out.push_str(&rest[open..open + 2 + close + 2]),
            }
            rest = &after[close + 2..];
        }

        out.push_str(rest);
        out
    }

    /// Render every string inside `value`.
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.render(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn eval(&self, expr: &str) -> Option<Value> {
        if expr.starts_with('$')
            && let Some(open) = expr.find('(')
            && expr.ends_with(')')
        {
            let name = expr[..open].trim();
            let args = parse_args(&expr[open + 1..expr.len() - 1]);
            return self.call(name, &args);
        }

        let mut parts = expr.split('.');
        let mut cur = self.vars.get(parts.next()?);
        for p in parts {
            cur = cur.and_then(|v| match v {
                Value::Object(m) => m.get(p),
                Value::Array(a) => p.parse::<usize>().ok().and_then(|i| a.get(i)),
                _ => None,
            });
        }
        Some(cur.cloned().unwrap_or(Value::Null))
    }
}

fn parse_args(raw: &str) -> Vec<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|a| {
            let a = a.trim();
            let unquoted = a
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| a.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
            match unquoted {
                Some(s) => Value::String(s.to_string()),
                None => serde_json::from_str(a).unwrap_or_else(|_| Value::String(a.to_string())),
            }
        })
        .collect()
}

fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx() -> VuContext {
        let mut funcs = FunctionRegistry::default();
        funcs.register("$upper", |args: &[Value]| {
            Value::String(
                args.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_uppercase)
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        });
        funcs.register("$sum", |args: &[Value]| {
            json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
        });

        let mut ctx = VuContext::new(7, Arc::from("checkout"), 0, funcs);
        ctx.set_var("user", json!({ "name": "ada", "tags": ["a", "b"] }));
        ctx.set_var("count", 3);
        ctx
    }

    #[tokio::test]
    async fn renders_variables_and_paths() {
        let ctx = ctx();
        assert_eq!(ctx.render("hi {{ user.name }}!"), "hi ada!");
        assert_eq!(ctx.render("{{count}}/{{ user.tags.1 }}"), "3/b");
        assert_eq!(ctx.render("[{{ missing }}]"), "[]");
        assert_eq!(ctx.render("no placeholders"), "no placeholders");
        assert_eq!(ctx.render("open {{ user.name"), "open {{ user.name");
    }

    #[tokio::test]
    async fn renders_function_calls() {
        let ctx = ctx();
        assert_eq!(ctx.render("{{ $upper(hello, 'world') }}"), "HELLO WORLD");
        assert_eq!(ctx.render("{{ $sum(1, 2, 3) }}"), "6");
        assert_eq!(ctx.render("{{ $nope() }}"), "{{ $nope() }}");
    }

    #[tokio::test]
    async fn render_value_walks_nested_params() {
        let ctx = ctx();
        let v = ctx.render_value(&json!({ "url": "/u/{{ user.name }}", "n": [1, "{{ count }}"] }));
        assert_eq!(v, json!({ "url": "/u/ada", "n": [1, "3"] }));
    }

    #[tokio::test]
    async fn sessions_downcast_to_their_type() {
        let mut ctx = ctx();
        assert!(ctx.session_mut::<u32>().is_none());
        ctx.set_session(Box::new(41u32));
        if let Some(v) = ctx.session_mut::<u32>() {
            *v += 1;
        }
        assert!(ctx.session_mut::<String>().is_none());
        let s = ctx.take_session().and_then(|s| s.downcast::<u32>().ok());
        assert_eq!(s.as_deref(), Some(&42));
    }

    #[test]
    fn function_registry_is_copy_on_write() {
        let mut a = FunctionRegistry::default();
        a.register("$one", |_: &[Value]| json!(1));
        let b = a.clone();
        a.register("$two", |_: &[Value]| json!(2));
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(b.contains("$one"));
    }
}
