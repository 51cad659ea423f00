//! Turning interpreter values into the host value model

use super::Host;
use crate::config::RenderLimits;
use crate::value::Value;
use boa_engine::{Context, JsObject, JsString, JsValue, js_string};

/// Introspect a value within the configured depth and breadth bounds
pub(crate) fn introspect(value: &JsValue, host: &Host, context: &mut Context) -> Value {
    let mut walker = Walker {
        keys: &host.object_keys,
        limits: host.run.config.render,
        ancestors: Vec::new(),
    };
    walker.walk(value, 0, context)
}

struct Walker<'a> {
    keys: &'a JsObject,
    limits: RenderLimits,
    ancestors: Vec<JsObject>,
}

impl Walker<'_> {
    fn walk(&mut self, value: &JsValue, depth: usize, context: &mut Context) -> Value {
        if value.is_undefined() || value.is_null() {
            return Value::Null;
        }
        if let Some(b) = value.as_boolean() {
            return Value::Bool(b);
        }
        if let Some(n) = value.as_number() {
            return Value::Number(n);
        }
        if let Some(s) = value.as_string() {
            return Value::String(s.to_std_string_escaped());
        }
        let Some(object) = value.as_object().cloned() else {
            // bigint and symbol
            return Value::Opaque(value.display().to_string());
        };

        if object.is_callable() {
            return Value::Opaque(function_marker(&object, context));
        }
        if self.ancestors.iter().any(|a| JsObject::equals(a, &object)) {
            return Value::Opaque("[Circular]".into());
        }

        let is_array = object.is_array();
        if depth >= self.limits.max_depth {
            return Value::Opaque(if is_array { "[Array]" } else { "[Object]" }.into());
        }

        if let Some(replacement) = to_json(&object, value, context) {
            return self.walk(&replacement, depth + 1, context);
        }

        self.ancestors.push(object.clone());
        let out = if is_array {
            self.walk_array(&object, depth, context)
        } else {
            self.walk_object(&object, value, depth, context)
        };
        self.ancestors.pop();
        out
    }

    #[allow(clippy::cast_possible_truncation)]
    fn walk_array(&mut self, array: &JsObject, depth: usize, context: &mut Context) -> Value {
        let len = array
            .get(js_string!("length"), context)
            .and_then(|v| v.to_length(context))
            .unwrap_or(0);
        let shown = len.min(self.limits.max_items as u64);

        let mut items = Vec::with_capacity(shown as usize);
        for i in 0..shown {
            let item = match array.get(i as u32, context) {
                Ok(v) => self.walk(&v, depth + 1, context),
                Err(_) => Value::Opaque("[Thrown]".into()),
            };
            items.push(item);
        }
        if len > shown {
            items.push(Value::Opaque(format!("... {} more items", len - shown)));
        }
        Value::Sequence(items)
    }

    fn walk_object(
        &mut self,
        object: &JsObject,
        value: &JsValue,
        depth: usize,
        context: &mut Context,
    ) -> Value {
        let keys = own_keys(self.keys, value, context);

        if keys.is_empty() {
            if let Some(marker) = error_marker(object, context) {
                return Value::Opaque(marker);
            }
        }

        let mut members = Vec::with_capacity(keys.len().min(self.limits.max_items));
        for key in keys.iter().take(self.limits.max_items) {
            let member = match object.get(key.clone(), context) {
                Ok(v) if v.is_undefined() => continue,
                Ok(v) => self.walk(&v, depth + 1, context),
                Err(_) => Value::Opaque("[Thrown]".into()),
            };
            members.push((key.to_std_string_escaped(), member));
        }
        if keys.len() > self.limits.max_items {
            members.push((
                "...".into(),
                Value::Opaque(format!("{} more keys", keys.len() - self.limits.max_items)),
            ));
        }
        Value::Mapping(members)
    }
}

/// Own enumerable string keys via the captured `Object.keys`
#[allow(clippy::cast_possible_truncation)]
fn own_keys(keys_fn: &JsObject, value: &JsValue, context: &mut Context) -> Vec<JsString> {
    let Ok(list) = keys_fn.call(&JsValue::undefined(), &[value.clone()], context) else {
        return Vec::new();
    };
    let Some(list) = list.as_object().cloned() else {
        return Vec::new();
    };
    let len = list
        .get(js_string!("length"), context)
        .and_then(|v| v.to_length(context))
        .unwrap_or(0);

    (0..len)
        .filter_map(|i| list.get(i as u32, context).ok())
        .filter_map(|k| k.as_string().cloned())
        .collect()
}

/// Objects with a callable `toJSON` render through it, as `JSON.stringify` does
fn to_json(object: &JsObject, value: &JsValue, context: &mut Context) -> Option<JsValue> {
    let method = object.get(js_string!("toJSON"), context).ok()?;
    let method = method.as_callable()?.clone();
    method.call(value, &[], context).ok()
}

fn function_marker(function: &JsObject, context: &mut Context) -> String {
    let name = function
        .get(js_string!("name"), context)
        .ok()
        .and_then(|v| v.as_string().map(JsString::to_std_string_escaped))
        .unwrap_or_default();

    if name.is_empty() {
        "[Function (anonymous)]".into()
    } else {
        format!("[Function: {name}]")
    }
}

/// `Name: message` for error-shaped objects without own enumerable members
fn error_marker(object: &JsObject, context: &mut Context) -> Option<String> {
    let mut read = |key: JsString| -> Option<String> {
        let v = object.get(key, context).ok()?;
        v.as_string().map(JsString::to_std_string_escaped)
    };
    let name = read(js_string!("name"))?;
    let message = read(js_string!("message"))?;

    Some(if message.is_empty() {
        name
    } else {
        format!("{name}: {message}")
    })
}
