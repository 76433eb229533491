//! Scoped variable contexts and the globals-overlay merge rule.

use std::collections::HashMap;
use std::path::Path;

use crate::value::Value;

/// Reserved context keys tracked by the VM itself.
pub const FILE_KEY: &str = "__FILE__";
pub const PATH_KEY: &str = "__PATH__";
pub const LINE_KEY: &str = "__LINE__";
pub const INLINE_KEY: &str = "__INLINE__";

/// A mapping from variable name to scalar value. Contexts are plain owned
/// maps cloned on every merge so a callee can never mutate a caller's
/// state — no context is ever shared mutably across frames (see
/// `ExecutionVM::_execute`).
#[derive(Debug, Clone, Default)]
pub struct Context(HashMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Context(HashMap::new())
    }

    /// Build the reserved `__FILE__`/`__PATH__` pair from a source path,
    /// as `merge(globals, current_local_context)` in `execute` begins with
    /// `parse_path(self.file)`.
    pub fn from_path(file: &str) -> Self {
        let mut ctx = Context::new();
        let path = Path::new(file);
        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = if dir == "." { String::new() } else { dir };
        ctx.0.insert(FILE_KEY.to_string(), Value::String(filename));
        ctx.0.insert(PATH_KEY.to_string(), Value::String(dir));
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_inline(&self) -> bool {
        self.get(INLINE_KEY).map(Value::truthy).unwrap_or(false)
    }

    pub fn file(&self) -> String {
        match self.get(FILE_KEY) {
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    pub fn path(&self) -> String {
        match self.get(PATH_KEY) {
            Some(v) => v.to_string(),
            None => String::new(),
        }
    }

    pub fn line(&self) -> u32 {
        match self.get(LINE_KEY) {
            Some(Value::Number(n)) => *n as u32,
            _ => 0,
        }
    }

    pub fn set_line(&mut self, line: u32) {
        self.insert(LINE_KEY, Value::Number(line as f64));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// `merge(a, b, ...)`: deep-clones `a`, then applies each subsequent
    /// map's keys on top in order — last writer wins per key. Used both
    /// for the globals-overlay-locals step before every instruction and
    /// for macro-argument binding (`merge(caller_context, macro_local)`).
    pub fn merge(maps: &[&Context]) -> Context {
        let mut result = Context::new();
        for map in maps {
            for (k, v) in map.0.iter() {
                result.0.insert(k.clone(), v.clone());
            }
        }
        result
    }
}
