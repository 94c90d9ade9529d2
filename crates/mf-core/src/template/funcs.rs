//! Function library available to legend templates.
//!
//! Argument order follows the usual template convention: the subject string
//! comes last so that it can be supplied through a pipeline
//! (`{{ .Labels.host | trimPrefix "srv-" | upper }}`).

use crate::datefmt::format_timestamp;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub(crate) type Func = fn(&[Value]) -> Result<Value, String>;

/// Upper bound on `repeat` counts and printf width/precision.
const MAX_EXPANSION: usize = 10_000;

/// Resolve a function by name.
pub(crate) fn lookup(name: &str) -> Option<Func> {
    let f: Func = match name {
        "upper" => |a| unary(a, "upper", |s| s.to_uppercase()),
        "lower" => |a| unary(a, "lower", |s| s.to_lowercase()),
        "title" => |a| unary(a, "title", title),
        "trim" => |a| unary(a, "trim", |s| s.trim().to_string()),
        "trimAll" => |a| {
            arity(a, 2, "trimAll")?;
            let cutset = display(&a[0]);
            Ok(display(&a[1])
                .trim_matches(|c: char| cutset.contains(c))
                .to_string()
                .into())
        },
        "trimPrefix" => |a| {
            arity(a, 2, "trimPrefix")?;
            let (prefix, s) = (display(&a[0]), display(&a[1]));
            Ok(s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string().into())
        },
        "trimSuffix" => |a| {
            arity(a, 2, "trimSuffix")?;
            let (suffix, s) = (display(&a[0]), display(&a[1]));
            Ok(s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string().into())
        },
        "replace" => |a| {
            arity(a, 3, "replace")?;
            Ok(display(&a[2])
                .replace(&display(&a[0]), &display(&a[1]))
                .into())
        },
        "repeat" => |a| {
            arity(a, 2, "repeat")?;
            let count = usize::try_from(to_i64(&a[0])).unwrap_or(0);
            if count > MAX_EXPANSION {
                return Err(format!("repeat count {} exceeds {}", count, MAX_EXPANSION));
            }
            Ok(display(&a[1]).repeat(count).into())
        },
        "substr" => |a| {
            arity(a, 3, "substr")?;
            Ok(substr(to_i64(&a[0]), to_i64(&a[1]), &display(&a[2])).into())
        },
        "trunc" => |a| {
            arity(a, 2, "trunc")?;
            Ok(trunc(to_i64(&a[0]), &display(&a[1])).into())
        },
        "contains" => |a| {
            arity(a, 2, "contains")?;
            Ok(display(&a[1]).contains(&display(&a[0])).into())
        },
        "hasPrefix" => |a| {
            arity(a, 2, "hasPrefix")?;
            Ok(display(&a[1]).starts_with(&display(&a[0])).into())
        },
        "hasSuffix" => |a| {
            arity(a, 2, "hasSuffix")?;
            Ok(display(&a[1]).ends_with(&display(&a[0])).into())
        },
        "quote" => |a| Ok(join_present(a, |v| format!("{:?}", display(v))).into()),
        "squote" => |a| Ok(join_present(a, |v| format!("'{}'", display(v))).into()),
        "cat" => |a| Ok(join_present(a, display).into()),
        "default" => |a| {
            if a.is_empty() || a.len() > 2 {
                return Err(format!("wrong number of args for default: want 1 or 2 got {}", a.len()));
            }
            match a.get(1) {
                Some(given) if truthy(given) => Ok(given.clone()),
                _ => Ok(a[0].clone()),
            }
        },
        "empty" => |a| {
            arity(a, 1, "empty")?;
            Ok((!truthy(&a[0])).into())
        },
        "coalesce" => |a| Ok(a.iter().find(|v| truthy(v)).cloned().unwrap_or(Value::Null)),
        "ternary" => |a| {
            arity(a, 3, "ternary")?;
            Ok(if truthy(&a[2]) { a[0].clone() } else { a[1].clone() })
        },
        "print" => |a| Ok(sprint(a).into()),
        "printf" => |a| {
            let (format, rest) = a
                .split_first()
                .ok_or_else(|| "wrong number of args for printf: want at least 1 got 0".to_string())?;
            Ok(sprintf(&display(format), rest)?.into())
        },
        "len" => |a| {
            arity(a, 1, "len")?;
            let n = match &a[0] {
                Value::String(s) => s.len(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => return Err(format!("len of type {}", type_name(other))),
            };
            Ok(n.into())
        },
        "index" => |a| {
            let (mut item, keys) = match a.split_first() {
                Some((first, keys)) => (first.clone(), keys),
                None => return Err("wrong number of args for index: want at least 1 got 0".into()),
            };
            for key in keys {
                item = index(&item, key)?;
            }
            Ok(item)
        },
        "eq" => |a| {
            let (first, others) = a
                .split_first()
                .ok_or_else(|| "missing argument for comparison".to_string())?;
            if others.is_empty() {
                return Err("missing argument for comparison".into());
            }
            Ok(others.iter().any(|o| equal(first, o)).into())
        },
        "ne" => |a| {
            arity(a, 2, "ne")?;
            Ok((!equal(&a[0], &a[1])).into())
        },
        "lt" => |a| ordered(a, "lt", Ordering::is_lt),
        "le" => |a| ordered(a, "le", Ordering::is_le),
        "gt" => |a| ordered(a, "gt", Ordering::is_gt),
        "ge" => |a| ordered(a, "ge", Ordering::is_ge),
        "not" => |a| {
            arity(a, 1, "not")?;
            Ok((!truthy(&a[0])).into())
        },
        "and" => |a| {
            let last = a.last().cloned().ok_or("wrong number of args for and")?;
            Ok(a.iter().find(|v| !truthy(v)).cloned().unwrap_or(last))
        },
        "or" => |a| {
            let last = a.last().cloned().ok_or("wrong number of args for or")?;
            Ok(a.iter().find(|v| truthy(v)).cloned().unwrap_or(last))
        },
        "add" => |a| Ok(a.iter().map(to_i64).fold(0_i64, i64::wrapping_add).into()),
        "mul" => |a| Ok(a.iter().map(to_i64).fold(1_i64, i64::wrapping_mul).into()),
        "sub" => |a| {
            arity(a, 2, "sub")?;
            Ok(to_i64(&a[0]).wrapping_sub(to_i64(&a[1])).into())
        },
        "div" => |a| {
            arity(a, 2, "div")?;
            to_i64(&a[0])
                .checked_div(to_i64(&a[1]))
                .map(Value::from)
                .ok_or_else(|| "integer divide by zero".to_string())
        },
        "mod" => |a| {
            arity(a, 2, "mod")?;
            to_i64(&a[0])
                .checked_rem(to_i64(&a[1]))
                .map(Value::from)
                .ok_or_else(|| "integer divide by zero".to_string())
        },
        "max" => |a| a.iter().map(to_i64).max().map(Value::from).ok_or_else(|| "wrong number of args for max".into()),
        "min" => |a| a.iter().map(to_i64).min().map(Value::from).ok_or_else(|| "wrong number of args for min".into()),
        "now" => |a| {
            arity(a, 0, "now")?;
            Ok(Utc::now().to_rfc3339().into())
        },
        "date" => |a| {
            arity(a, 2, "date")?;
            let time = to_time(&a[1])?;
            Ok(format_timestamp(&display(&a[0]), &time).into())
        },
        "toString" => |a| unary(a, "toString", |s| s),
        "atoi" => |a| {
            arity(a, 1, "atoi")?;
            Ok(display(&a[0]).trim().parse::<i64>().unwrap_or(0).into())
        },
        _ => return None,
    };
    Some(f)
}

fn arity(args: &[Value], want: usize, name: &str) -> Result<(), String> {
    if args.len() == want {
        Ok(())
    } else {
        Err(format!(
            "wrong number of args for {}: want {} got {}",
            name,
            want,
            args.len()
        ))
    }
}

fn unary(args: &[Value], name: &str, f: impl Fn(String) -> String) -> Result<Value, String> {
    arity(args, 1, name)?;
    Ok(f(display(&args[0])).into())
}

/// Render a value the way a template action prints it.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Null => "<no value>".to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => format_float(f),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(display).collect();
            format!("[{}]", inner.join(" "))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, display(&map[k])))
                .collect();
            format!("map[{}]", inner.join(" "))
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

/// Template truthiness: false, zero, null and empty collections are false.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn to_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Bool(true) => 1,
        _ => 0,
    }
}

fn to_time(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("cannot parse {:?} as a time: {}", s, e)),
        Value::Number(_) => DateTime::<Utc>::from_timestamp(to_i64(value), 0)
            .ok_or_else(|| "timestamp out of range".to_string()),
        other => Err(format!("cannot use {} as a time", type_name(other))),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

fn join_present(args: &[Value], f: impl Fn(&Value) -> String) -> String {
    args.iter()
        .filter(|v| !v.is_null())
        .map(f)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title(s: String) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = c.is_whitespace();
    }
    out
}

fn substr(start: i64, end: i64, s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let (from, to) = if start < 0 {
        (0, end.clamp(0, len))
    } else if end < 0 || end > len {
        (start.min(len), len)
    } else {
        (start.min(end), end)
    };
    chars[from as usize..to as usize].iter().collect()
}

fn trunc(n: i64, s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    if n < 0 && len + n > 0 {
        chars[(len + n) as usize..].iter().collect()
    } else if n >= 0 && len > n {
        chars[..n as usize].iter().collect()
    } else {
        s.to_string()
    }
}

fn index(item: &Value, key: &Value) -> Result<Value, String> {
    match item {
        Value::Object(map) => Ok(map.get(&display(key)).cloned().unwrap_or(Value::Null)),
        Value::Array(items) => {
            let ix = key
                .as_i64()
                .ok_or_else(|| format!("cannot index array with {}", type_name(key)))?;
            usize::try_from(ix)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or_else(|| format!("index out of range: {}", ix))
        }
        Value::Null => Err("index of untyped nil".into()),
        other => Err(format!("can't index item of type {}", type_name(other))),
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordered(args: &[Value], name: &str, accept: fn(Ordering) -> bool) -> Result<Value, String> {
    arity(args, 2, name)?;
    let ordering = match (&args[0], &args[1]) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    ordering
        .map(|o| accept(o).into())
        .ok_or_else(|| "incompatible types for comparison".to_string())
}

/// Operands are separated by a space when neither side is a string.
fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (ix, arg) in args.iter().enumerate() {
        if ix > 0 && !arg.is_string() && !args[ix - 1].is_string() {
            out.push(' ');
        }
        out.push_str(&display(arg));
    }
    out
}

/// A printf supporting the `%v %s %d %f %t %q %x %X %%` verbs with flags,
/// width and precision.
pub(crate) fn sprintf(format: &str, args: &[Value]) -> Result<String, String> {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut left = false;
        let mut zero = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left = true,
                '0' => zero = true,
                '+' | ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                p.push(d);
                chars.next();
            }
            precision = Some(bounded(&p, "precision")?);
        }
        let width = bounded(&width, "width")?;

        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = args.next() else {
            out.push_str(&format!("%!{}(MISSING)", verb));
            continue;
        };

        let rendered = match verb {
            'd' => to_i64(arg).to_string(),
            'f' | 'F' => format!("{:.*}", precision.unwrap_or(6), arg.as_f64().unwrap_or(0.0)),
            't' => truthy(arg).to_string(),
            'q' => format!("{:?}", display(arg)),
            'x' => hex_of(arg),
            'X' => hex_of(arg).to_uppercase(),
            's' | 'v' => {
                let s = display(arg);
                match precision {
                    Some(p) if verb == 's' => s.chars().take(p).collect(),
                    _ => s,
                }
            }
            other => format!("%!{}({})", other, display(arg)),
        };

        let pad = width.saturating_sub(rendered.chars().count());
        if left {
            out.push_str(&rendered);
            out.extend(std::iter::repeat(' ').take(pad));
        } else if zero && !matches!(verb, 's' | 'q' | 'v' | 't') {
            let (sign, digits) = match rendered.strip_prefix('-') {
                Some(d) => ("-", d),
                None => ("", rendered.as_str()),
            };
            out.push_str(sign);
            out.extend(std::iter::repeat('0').take(pad));
            out.push_str(digits);
        } else {
            out.extend(std::iter::repeat(' ').take(pad));
            out.push_str(&rendered);
        }
    }
    Ok(out)
}

fn bounded(digits: &str, what: &str) -> Result<usize, String> {
    if digits.is_empty() {
        return Ok(0);
    }
    match digits.parse::<usize>() {
        Ok(n) if n <= MAX_EXPANSION => Ok(n),
        _ => Err(format!("printf {} {} exceeds {}", what, digits, MAX_EXPANSION)),
    }
}

fn hex_of(value: &Value) -> String {
    match value {
        Value::Number(_) => format!("{:x}", to_i64(value)),
        other => hex::encode(display(other)),
    }
}

/// Build the `{Value, Labels}` data a legend template is rendered with.
pub(crate) fn legend_data<'a>(
    value: &str,
    labels: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Value {
    let labels: Map<String, Value> = labels
        .into_iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut data = Map::new();
    data.insert("Value".into(), Value::String(value.to_string()));
    data.insert("Labels".into(), Value::Object(labels));
    Value::Object(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        lookup(name).unwrap()(args)
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(call("upper", &[json!("abc")]).unwrap(), json!("ABC"));
        assert_eq!(call("title", &[json!("hello big world")]).unwrap(), json!("Hello Big World"));
        assert_eq!(call("trimPrefix", &[json!("srv-"), json!("srv-01")]).unwrap(), json!("01"));
        assert_eq!(call("trimAll", &[json!("$"), json!("$5.00$")]).unwrap(), json!("5.00"));
        assert_eq!(call("replace", &[json!("-"), json!("_"), json!("a-b-c")]).unwrap(), json!("a_b_c"));
        assert_eq!(call("substr", &[json!(1), json!(3), json!("hello")]).unwrap(), json!("el"));
        assert_eq!(call("trunc", &[json!(-2), json!("hello")]).unwrap(), json!("lo"));
        assert_eq!(call("quote", &[json!("a"), Value::Null, json!(1)]).unwrap(), json!("\"a\" \"1\""));
    }

    #[test]
    fn test_logic_and_comparison() {
        assert_eq!(call("eq", &[json!(1), json!(2), json!(1.0)]).unwrap(), json!(true));
        assert_eq!(call("lt", &[json!("a"), json!("b")]).unwrap(), json!(true));
        assert!(call("lt", &[json!("a"), json!(1)]).is_err());
        assert_eq!(call("and", &[json!(1), json!(""), json!(2)]).unwrap(), json!(""));
        assert_eq!(call("or", &[json!(0), json!("x")]).unwrap(), json!("x"));
        assert_eq!(call("default", &[json!("d"), json!("")]).unwrap(), json!("d"));
        assert_eq!(call("default", &[json!("d"), json!("v")]).unwrap(), json!("v"));
        assert_eq!(call("ternary", &[json!("y"), json!("n"), json!(false)]).unwrap(), json!("n"));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(call("add", &[json!(1), json!(2), json!("3")]).unwrap(), json!(6));
        assert_eq!(call("sub", &[json!(1), json!(2)]).unwrap(), json!(-1));
        assert_eq!(call("max", &[json!(1), json!(7), json!(3)]).unwrap(), json!(7));
        assert!(call("div", &[json!(1), json!(0)]).is_err());
    }

    #[test]
    fn test_printf_verbs() {
        assert_eq!(sprintf("%s=%d", &[json!("a"), json!(4)]).unwrap(), "a=4");
        assert_eq!(sprintf("%.2f%%", &[json!(12.3456)]).unwrap(), "12.35%");
        assert_eq!(
            sprintf("[%5s|%-3d|%03d]", &[json!("ab"), json!(7), json!(-5)]).unwrap(),
            "[   ab|7  |-05]"
        );
        assert_eq!(sprintf("%v %v", &[json!(1)]).unwrap(), "1 %!v(MISSING)");
    }

    #[test]
    fn test_expansion_is_bounded() {
        assert_eq!(call("repeat", &[json!(3), json!("ab")]).unwrap(), json!("ababab"));
        assert!(call("repeat", &[json!(10_000), json!("x")]).is_ok());
        let err = call("repeat", &[json!(99_999_999_999_i64), json!("x")]).unwrap_err();
        assert!(err.contains("exceeds 10000"));

        assert!(sprintf("%99999999999d", &[json!(1)]).unwrap_err().contains("width"));
        assert!(sprintf("%.20000f", &[json!(1.5)]).unwrap_err().contains("precision"));
        assert_eq!(sprintf("%10000d", &[json!(1)]).unwrap().len(), 10_000);

        let tmpl = crate::template::Template::parse("legend", "{{ repeat 20000 .Value }}").unwrap();
        assert!(tmpl.render(&json!({"Value": "x"})).is_err());
    }

    #[test]
    fn test_date_formats_layout() {
        let out = call("date", &[json!("2006-01-02 15:04"), json!("2023-11-14T22:13:20Z")]).unwrap();
        assert_eq!(out, json!("2023-11-14 22:13"));
        let out = call("date", &[json!("Jan 2"), json!(1_700_000_000)]).unwrap();
        assert_eq!(out, json!("Nov 14"));
    }

    #[test]
    fn test_display_matches_print() {
        assert_eq!(display(&json!(2.0)), "2");
        assert_eq!(display(&json!([1, "a"])), "[1 a]");
        assert_eq!(display(&json!({"b": 1, "a": 2})), "map[a:2 b:1]");
        assert_eq!(sprint(&[json!(1), json!(2), json!("x"), json!(3)]), "1 2x3");
    }
}
