//! `${path}` references between configuration fields
use super::{ComposeError, Value};

const OPEN: &str = "${";
const CLOSE: char = '}';

/// Replace every `${path}` reference in the tree with the referenced value.
///
/// A string consisting of a single reference takes the referenced value, type included.
/// References embedded in longer strings are substituted as text and must name scalars.
/// Paths are absolute, relative to `root`.
pub fn resolve_interpolations(root: &mut Value) -> Result<(), ComposeError> {
    let snapshot = root.clone();
    root.visit_strings_mut("", &mut |path, value| {
        let resolved = resolve_value(&snapshot, value, path, &mut Vec::new())?;
        *value = resolved;
        Ok(())
    })
}

fn resolve_value(
    root: &Value,
    value: &Value,
    path: &str,
    stack: &mut Vec<String>,
) -> Result<Value, ComposeError> {
    match value {
        Value::Str(s) if s.contains(OPEN) => resolve_string(root, s, path, stack),
        Value::Seq(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| resolve_value(root, item, &super::join(path, &i.to_string()), stack))
            .collect::<Result<_, _>>()
            .map(Value::Seq),
        Value::Map(node) => node
            .iter()
            .map(|(key, item)| {
                resolve_value(root, item, &super::join(path, key), stack)
                    .map(|resolved| (key.clone(), resolved))
            })
            .collect::<Result<_, _>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    root: &Value,
    text: &str,
    path: &str,
    stack: &mut Vec<String>,
) -> Result<Value, ComposeError> {
    let error = |reason: String| ComposeError::Interpolation {
        path: path.to_string(),
        expr: text.to_string(),
        reason,
    };

    // Whole-value reference keeps the referenced type
    if let Some(inner) = text.strip_prefix(OPEN).and_then(|t| t.strip_suffix(CLOSE)) {
        if !inner.contains(OPEN) && !inner.contains(CLOSE) {
            return lookup(root, inner.trim(), stack).map_err(error);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| error("unterminated reference".into()))?;
        let referenced = lookup(root, after[..end].trim(), stack).map_err(error)?;
        match referenced {
            Value::Seq(_) | Value::Map(_) => {
                return Err(error(format!(
                    "`{}` is a {} and cannot be embedded in a string",
                    after[..end].trim(),
                    referenced.kind()
                )))
            }
            scalar => out.push_str(&scalar.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::Str(out))
}

fn lookup(root: &Value, target: &str, stack: &mut Vec<String>) -> Result<Value, String> {
    if target.is_empty() {
        return Err("empty reference".into());
    }
    if stack.iter().any(|p| p == target) {
        stack.push(target.to_string());
        return Err(format!("reference cycle: {}", stack.join(" -> ")));
    }
    let value = root
        .lookup(target)
        .ok_or_else(|| format!("`{}` does not exist", target))?;
    stack.push(target.to_string());
    let resolved = resolve_value(root, value, target, stack).map_err(|err| err.to_string());
    stack.pop();
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(yaml: &str) -> Result<Value, ComposeError> {
        let mut value = Value::from_yaml(yaml).unwrap();
        resolve_interpolations(&mut value).map(|_| value)
    }

    #[test]
    fn whole_reference_keeps_type() {
        let value = resolved("{size: 10, storage: {max_size: '${size}'}}").unwrap();
        assert_eq!(value.lookup("storage.max_size"), Some(&Value::Int(10)));
    }

    #[test]
    fn embedded_reference_is_text() {
        let value = resolved("{name: cartpole, tag: 'run-${name}-${seed}', seed: 3}").unwrap();
        assert_eq!(value.lookup("tag"), Some(&Value::from("run-cartpole-3")));
    }

    #[test]
    fn chained_references() {
        let value = resolved("{a: '${b}', b: '${c}', c: [1, 2]}").unwrap();
        assert_eq!(value.lookup("a"), Some(&Value::from(vec![1_i64, 2])));
    }

    #[test]
    fn subtree_reference_resolves_inside() {
        let value = resolved("{a: {x: '${n}'}, b: '${a}', n: 4}").unwrap();
        assert_eq!(value.lookup("b.x"), Some(&Value::Int(4)));
    }

    #[test]
    fn missing_reference() {
        assert!(matches!(
            resolved("{a: '${nope}'}"),
            Err(ComposeError::Interpolation { path, .. }) if path == "a"
        ));
    }

    #[test]
    fn cycle_is_an_error() {
        let err = resolved("{a: '${b}', b: '${a}'}").unwrap_err();
        assert!(err.to_string().contains("cannot interpolate"));
    }

    #[test]
    fn embedded_mapping_is_an_error() {
        assert!(resolved("{a: 'x${b}', b: {c: 1}}").is_err());
    }
}
