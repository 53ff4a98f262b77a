//! `helm --set` style value lists (`a.b=1,c[0]=x`) parsed into a nested map.

use serde_json::{Map, Value};

use super::HelmError;

/// Largest list index accepted in a key, e.g. `hosts[9]`.
const MAX_INDEX: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parses `k=v[,k=v]*`. Values are typed the way `helm --set` types them:
/// `true`/`false`, `null` and integers without a leading zero become
/// booleans, null and numbers; `{a,b}` becomes a list; everything else is
/// a string. `\` escapes the next character (`\,`, `\.`, `\=`).
pub fn parse_set_values(input: &str) -> Result<Value, HelmError> {
    let mut root = Value::Object(Map::new());
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        let mut path = Vec::new();
        let mut current = String::new();
        let mut saw_equals = false;

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                '.' => {
                    if !current.is_empty() {
                        path.push(Segment::Key(std::mem::take(&mut current)));
                    }
                }
                '[' => {
                    if !current.is_empty() {
                        path.push(Segment::Key(std::mem::take(&mut current)));
                    }
                    let mut digits = String::new();
                    for d in chars.by_ref() {
                        if d == ']' {
                            break;
                        }
                        digits.push(d);
                    }
                    let index: usize = digits.trim().parse().map_err(|_| {
                        HelmError::InvalidValues(format!(
                            "bad list index [{}] in {:?}",
                            digits, input
                        ))
                    })?;
                    if index > MAX_INDEX {
                        return Err(HelmError::InvalidValues(format!(
                            "list index {} exceeds {}",
                            index, MAX_INDEX
                        )));
                    }
                    path.push(Segment::Index(index));
                }
                '=' => {
                    saw_equals = true;
                    break;
                }
                ',' => {
                    if current.trim().is_empty() && path.is_empty() {
                        break;
                    }
                    return Err(HelmError::InvalidValues(format!(
                        "key {:?} has no value",
                        current
                    )));
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            path.push(Segment::Key(current));
        }
        if path.is_empty() && !saw_equals {
            continue;
        }
        if !saw_equals {
            return Err(HelmError::InvalidValues(format!(
                "{:?} is not of the form key=value",
                input
            )));
        }
        if path.is_empty() {
            return Err(HelmError::InvalidValues(format!("empty key in {:?}", input)));
        }

        let value = if chars.peek() == Some(&'{') {
            chars.next();
            let mut items = Vec::new();
            let mut item = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            item.push(escaped);
                        }
                    }
                    ',' => items.push(typed(&std::mem::take(&mut item))),
                    '}' => break,
                    c => item.push(c),
                }
            }
            if !item.is_empty() || !items.is_empty() {
                items.push(typed(&item));
            }
            // Skip up to the next pair separator.
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
            }
            Value::Array(items)
        } else {
            let mut raw = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            raw.push(escaped);
                        }
                    }
                    ',' => break,
                    c => raw.push(c),
                }
            }
            typed(&raw)
        };

        set_path(&mut root, &path, value);
    }

    Ok(root)
}

fn typed(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if raw == "0" {
        return Value::from(0);
    }
    if !raw.starts_with('0') {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::from(n);
        }
    }
    Value::String(raw.to_string())
}

fn set_path(node: &mut Value, path: &[Segment], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    match head {
        Segment::Key(key) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(key.clone()).or_insert(Value::Null);
                set_path(child, rest, value);
            }
        }
        Segment::Index(index) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            if let Value::Array(items) = node {
                if items.len() <= *index {
                    items.resize(index + 1, Value::Null);
                }
                set_path(&mut items[*index], rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_keys_and_types() {
        let values = parse_set_values("a.b=1,c=x,d=true,e=null,f=0123,g=0").unwrap();
        assert_eq!(
            values,
            json!({ "a": { "b": 1 }, "c": "x", "d": true, "e": null, "f": "0123", "g": 0 })
        );
    }

    #[test]
    fn registration_values() {
        let values = parse_set_values(
            "tenantId=7f2c,bearerToken=abc.def,apiEndpoint=https://pds.example.com/api",
        )
        .unwrap();
        assert_eq!(values["tenantId"], "7f2c");
        assert_eq!(values["bearerToken"], "abc.def");
        assert_eq!(values["apiEndpoint"], "https://pds.example.com/api");
    }

    #[test]
    fn list_indices_and_literals() {
        let values = parse_set_values("hosts[1]=b,hosts[0]=a,args={--v,2}").unwrap();
        assert_eq!(values["hosts"], json!(["a", "b"]));
        assert_eq!(values["args"], json!(["--v", 2]));
    }

    #[test]
    fn escapes() {
        let values = parse_set_values(r"annotations.pds\.io/name=x,list=a\,b").unwrap();
        assert_eq!(values["annotations"]["pds.io/name"], "x");
        assert_eq!(values["list"], "a,b");
    }

    #[test]
    fn later_keys_override_earlier_ones() {
        let values = parse_set_values("installCRDs=false,installCRDs=true").unwrap();
        assert_eq!(values, json!({ "installCRDs": true }));
    }

    #[test]
    fn empty_input_is_empty_map() {
        assert_eq!(parse_set_values("").unwrap(), json!({}));
    }

    #[test]
    fn missing_value_is_rejected() {
        assert!(parse_set_values("novalue").is_err());
        assert!(parse_set_values("a=1,broken,c=2").is_err());
        assert!(parse_set_values("x[abc]=1").is_err());
    }
}
