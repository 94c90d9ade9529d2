//! # Legend Templates
//!
//! A small text-template engine for column display names. Only the action
//! subset legends need is supported: text, `{{ pipeline }}` actions with
//! `{{-` / `-}}` trimming, `{{/* comments */}}`, field chains on the dot,
//! literals, parenthesised sub-pipelines and the functions in [`funcs`].
//! Control structures (`if`, `range`, `with`, ...) are rejected at parse
//! time.

mod funcs;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("template: {name}: {message}")]
    Parse { name: String, message: String },
    #[error("template: {name}: executing: {message}")]
    Exec { name: String, message: String },
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Action(Pipeline),
}

#[derive(Debug, Clone)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug, Clone)]
struct Command {
    args: Vec<Arg>,
}

#[derive(Debug, Clone)]
enum Arg {
    /// Field chain on the dot; empty for the dot itself.
    Field(Vec<String>),
    Function(String, funcs::Func),
    Literal(Value),
    Pipeline(Box<Pipeline>),
}

/// A parsed template, ready to be rendered any number of times.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        let err = |message: String| TemplateError::Parse {
            name: name.to_string(),
            message,
        };
        let mut nodes = Vec::new();
        let mut rest = source;
        let mut trim_next_text = false;

        loop {
            let (text, action) = match rest.find("{{") {
                Some(start) => (&rest[..start], Some(&rest[start + 2..])),
                None => (rest, None),
            };

            let mut text = if trim_next_text { text.trim_start() } else { text };
            let Some(after_open) = action else {
                push_text(&mut nodes, text);
                break;
            };

            let (trim_left, body) = match after_open.strip_prefix('-') {
                Some(b) if b.starts_with(is_space) => (true, b),
                _ => (false, after_open),
            };
            if trim_left {
                text = text.trim_end();
            }
            push_text(&mut nodes, text);

            let (tokens, trim_right, remaining) = lex_action(body).map_err(err)?;
            trim_next_text = trim_right;
            rest = remaining;

            let Some(tokens) = tokens else {
                continue;
            };
            let mut pos = 0;
            let pipeline = parse_pipeline(&tokens, &mut pos).map_err(err)?;
            if pos != tokens.len() {
                return Err(err(format!("unexpected {} in operand", tokens[pos])));
            }
            nodes.push(Node::Action(pipeline));
        }

        Ok(Self {
            name: name.to_string(),
            nodes,
        })
    }

    /// Render with `data` bound to the dot.
    pub fn render(&self, data: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, data).map_err(|message| {
                        TemplateError::Exec {
                            name: self.name.clone(),
                            message,
                        }
                    })?;
                    out.push_str(&funcs::display(&value));
                }
            }
        }
        Ok(out)
    }

    /// Render a legend for one value column of a frame.
    pub fn render_legend<'a>(
        &self,
        value: &str,
        labels: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<String, TemplateError> {
        self.render(&funcs::legend_data(value, labels))
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Field(Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe,
    Open,
    Close,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(path) => write!(f, ".{}", path.join(".")),
            Self::Ident(name) => f.write_str(name),
            Self::Literal(v) => write!(f, "{}", v),
            Self::Pipe => f.write_str("|"),
            Self::Open => f.write_str("("),
            Self::Close => f.write_str(")"),
        }
    }
}

/// Lex one action body. Returns the tokens (`None` for a comment), whether
/// the action ended with a right trim marker, and the source following the
/// closing delimiter.
fn lex_action(body: &str) -> Result<(Option<Vec<Tok>>, bool, &str), String> {
    let mut tokens = Vec::new();
    let mut s = body.trim_start_matches(is_space);

    if let Some(comment) = s.strip_prefix("/*") {
        let end = comment.find("*/").ok_or("unclosed comment")?;
        let after = comment[end + 2..].trim_start_matches(is_space);
        if let Some(remaining) = after.strip_prefix("-}}") {
            return Ok((None, true, remaining));
        }
        if let Some(remaining) = after.strip_prefix("}}") {
            return Ok((None, false, remaining));
        }
        return Err("comment ends before closing delimiter".into());
    }

    loop {
        let trimmed = s.trim_start_matches(is_space);
        let had_space = trimmed.len() != s.len();
        s = trimmed;

        if had_space || tokens.is_empty() {
            if let Some(remaining) = s.strip_prefix("-}}") {
                return Ok((Some(tokens), true, remaining));
            }
        }
        if let Some(remaining) = s.strip_prefix("}}") {
            return Ok((Some(tokens), false, remaining));
        }

        let c = s.chars().next().ok_or("unclosed action")?;
        match c {
            '|' => {
                tokens.push(Tok::Pipe);
                s = &s[1..];
            }
            '(' => {
                tokens.push(Tok::Open);
                s = &s[1..];
            }
            ')' => {
                tokens.push(Tok::Close);
                s = &s[1..];
            }
            '.' => {
                let mut path = Vec::new();
                while let Some(after_dot) = s.strip_prefix('.') {
                    let end = after_dot
                        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                        .unwrap_or(after_dot.len());
                    if end == 0 {
                        s = after_dot;
                        break;
                    }
                    path.push(after_dot[..end].to_string());
                    s = &after_dot[end..];
                }
                tokens.push(Tok::Field(path));
            }
            '"' => {
                let (value, remaining) = lex_quoted(&s[1..])?;
                tokens.push(Tok::Literal(Value::String(value)));
                s = remaining;
            }
            '`' => {
                let end = s[1..].find('`').ok_or("unterminated raw quoted string")?;
                tokens.push(Tok::Literal(Value::String(s[1..1 + end].to_string())));
                s = &s[end + 2..];
            }
            '$' => return Err("variables are not supported".into()),
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let end = s[1..]
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_'))
                    .map_or(s.len(), |e| e + 1);
                let text = &s[..end];
                let value = text
                    .parse::<i64>()
                    .map(Value::from)
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().map(Value::from))
                    .ok_or_else(|| format!("bad number syntax: {:?}", text))?;
                tokens.push(Tok::Literal(value));
                s = &s[end..];
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = s
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(s.len());
                let word = &s[..end];
                let token = match word {
                    "true" => Tok::Literal(Value::Bool(true)),
                    "false" => Tok::Literal(Value::Bool(false)),
                    "nil" => Tok::Literal(Value::Null),
                    _ => Tok::Ident(word.to_string()),
                };
                tokens.push(token);
                s = &s[end..];
            }
            other => return Err(format!("unexpected {:?} in command", other)),
        }
    }
}

fn lex_quoted(s: &str) -> Result<(String, &str), String> {
    let mut out = String::new();
    let mut chars = s.char_indices();
    while let Some((ix, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &s[ix + 1..])),
            '\\' => {
                let (_, escaped) = chars.next().ok_or("unterminated quoted string")?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
            }
            '\n' => break,
            c => out.push(c),
        }
    }
    Err("unterminated quoted string".into())
}

// =============================================================================
// Parser
// =============================================================================

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "if", "else", "end", "range", "with", "define", "template", "block", "break", "continue",
];

fn parse_pipeline(tokens: &[Tok], pos: &mut usize) -> Result<Pipeline, String> {
    let mut commands = vec![parse_command(tokens, pos)?];
    while tokens.get(*pos) == Some(&Tok::Pipe) {
        *pos += 1;
        commands.push(parse_command(tokens, pos)?);
    }
    Ok(Pipeline { commands })
}

fn parse_command(tokens: &[Tok], pos: &mut usize) -> Result<Command, String> {
    let mut args = Vec::new();
    while let Some(token) = tokens.get(*pos) {
        let arg = match token {
            Tok::Pipe | Tok::Close => break,
            Tok::Field(path) => Arg::Field(path.clone()),
            Tok::Literal(value) => Arg::Literal(value.clone()),
            Tok::Ident(name) if UNSUPPORTED_KEYWORDS.contains(&name.as_str()) => {
                return Err(format!("unsupported action {:?}", name));
            }
            Tok::Ident(name) => {
                let func =
                    funcs::lookup(name).ok_or_else(|| format!("function {:?} not defined", name))?;
                Arg::Function(name.clone(), func)
            }
            Tok::Open => {
                *pos += 1;
                let inner = parse_pipeline(tokens, pos)?;
                if tokens.get(*pos) != Some(&Tok::Close) {
                    return Err("unclosed left paren".into());
                }
                Arg::Pipeline(Box::new(inner))
            }
        };
        args.push(arg);
        *pos += 1;
    }
    if args.is_empty() {
        return Err("missing value for command".into());
    }
    Ok(Command { args })
}

// =============================================================================
// Evaluation
// =============================================================================

fn eval_pipeline(pipeline: &Pipeline, dot: &Value) -> Result<Value, String> {
    let mut piped = None;
    for command in &pipeline.commands {
        piped = Some(eval_command(command, dot, piped)?);
    }
    Ok(piped.unwrap_or(Value::Null))
}

fn eval_command(command: &Command, dot: &Value, piped: Option<Value>) -> Result<Value, String> {
    let (first, rest) = command
        .args
        .split_first()
        .ok_or("missing value for command")?;

    if let Arg::Function(name, func) = first {
        let mut args = rest
            .iter()
            .map(|arg| eval_arg(arg, dot))
            .collect::<Result<Vec<_>, _>>()?;
        args.extend(piped);
        return func(&args).map_err(|e| format!("error calling {}: {}", name, e));
    }

    if !rest.is_empty() || piped.is_some() {
        return Err("can't give argument to non-function".into());
    }
    eval_arg(first, dot)
}

static NULL: Value = Value::Null;

fn eval_arg(arg: &Arg, dot: &Value) -> Result<Value, String> {
    match arg {
        Arg::Literal(value) => Ok(value.clone()),
        Arg::Pipeline(pipeline) => eval_pipeline(pipeline, dot),
        Arg::Function(name, func) => func(&[]).map_err(|e| format!("error calling {}: {}", name, e)),
        Arg::Field(path) => {
            let mut current = dot;
            for name in path {
                current = match current {
                    Value::Object(map) => map.get(name).unwrap_or(&NULL),
                    Value::Null => &NULL,
                    other => {
                        return Err(format!(
                            "can't evaluate field {} in type {}",
                            name,
                            funcs::type_name(other)
                        ))
                    }
                };
            }
            Ok(current.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn render(source: &str, data: &Value) -> String {
        Template::parse("legend", source).unwrap().render(data).unwrap()
    }

    #[test]
    fn test_value_and_labels() {
        let data = json!({"Value": "cpu", "Labels": {"host": "a"}});
        assert_eq!(render("{{.Value}} on {{.Labels.host}}", &data), "cpu on a");
        assert_eq!(render("{{ .Labels.missing }}", &data), "<no value>");
    }

    #[test]
    fn test_pipelines_and_functions() {
        let data = json!({"Value": "cpu", "Labels": {"host": "srv-a"}});
        assert_eq!(
            render(r#"{{ .Labels.host | trimPrefix "srv-" | upper }}"#, &data),
            "A"
        );
        assert_eq!(
            render(r#"{{ printf "%s/%s" .Value (.Labels.host | upper) }}"#, &data),
            "cpu/SRV-A"
        );
        assert_eq!(render(r#"{{ .Labels.zone | default "none" }}"#, &data), "none");
        assert_eq!(render("{{ add 1 2 | mul 3 }}", &data), "9");
        assert_eq!(render("{{ `raw {{` }}", &data), "raw {{");
    }

    #[test]
    fn test_trim_markers_and_comments() {
        let data = json!({"Value": "v"});
        assert_eq!(render("a  {{- .Value -}}  b", &data), "avb");
        assert_eq!(render("a {{/* note */}}b", &data), "a b");
        assert_eq!(render("x {{- /* note */ -}} y", &data), "xy");
        assert_eq!(render("{{ -3 }}", &data), "-3");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Template::parse("legend", "{{ nosuchfn .Value }}"),
            Err(TemplateError::Parse { .. })
        ));
        assert!(Template::parse("legend", "{{ if .Value }}x{{ end }}").is_err());
        assert!(Template::parse("legend", "{{ .Value").is_err());
        assert!(Template::parse("legend", "{{ (upper .Value }}").is_err());
        assert!(Template::parse("legend", "{{}}").is_err());
    }

    #[test]
    fn test_exec_errors() {
        let tmpl = Template::parse("legend", "{{ .Value.inner }}").unwrap();
        let err = tmpl.render(&json!({"Value": "flat"})).unwrap_err();
        assert!(matches!(err, TemplateError::Exec { .. }));

        let tmpl = Template::parse("legend", "{{ .Value 1 }}").unwrap();
        assert!(tmpl.render(&json!({"Value": "x"})).is_err());
    }

    #[test]
    fn test_render_legend() {
        let labels = BTreeMap::from([("k".to_string(), "A".to_string())]);
        let tmpl = Template::parse("legend", "{{.Value}} ({{.Labels.k}})").unwrap();
        assert_eq!(tmpl.render_legend("v", &labels).unwrap(), "v (A)");
    }
}
