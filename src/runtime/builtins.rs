//! Builtin functions and value methods of the page code dialect.

use indexmap::IndexMap;

use super::eval::{EvalError, Machine};
use super::value::Value;
use crate::code::ast::Span;

/// Names callable without qualification. Used by the attribute classifier
/// to decide which inline-handler arguments get lifted.
pub const BUILTIN_NAMES: &[&str] = &[
    "len", "str", "int", "float", "bool", "list", "dict", "range", "enumerate", "sorted",
    "reversed", "min", "max", "sum", "abs", "round", "print",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

pub fn call(
    machine: &mut Machine,
    name: &str,
    args: Vec<Value>,
    kwargs: IndexMap<String, Value>,
    span: Span,
) -> Result<Value, EvalError> {
    let arity = |expected: usize| -> Result<(), EvalError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(machine.fail_at(
                span,
                format!("{name}() takes {expected} argument(s) but {} were given", args.len()),
            ))
        }
    };

    match name {
        "print" => {
            let line = args
                .iter()
                .map(Value::to_display)
                .collect::<Vec<_>>()
                .join(" ");
            machine.console.push(line);
            Ok(Value::None)
        }
        "len" => {
            arity(1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(l) => l.len(),
                Value::Dict(d) => d.len(),
                other => {
                    return Err(machine.fail_at(
                        span,
                        format!("object of type '{}' has no len()", other.type_name()),
                    ))
                }
            };
            Ok(Value::Int(len as i64))
        }
        "str" => {
            arity(1)?;
            Ok(Value::Str(args[0].to_display()))
        }
        "int" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => Ok(Value::Int(*f as i64)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    machine.fail_at(span, format!("invalid literal for int(): '{s}'"))
                }),
                other => Err(machine.fail_at(
                    span,
                    format!("int() argument must be a number or string, not '{}'", other.type_name()),
                )),
            }
        }
        "float" => {
            arity(1)?;
            match &args[0] {
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    machine.fail_at(span, format!("could not convert string to float: '{s}'"))
                }),
                other => other
                    .as_float()
                    .map(Value::Float)
                    .ok_or_else(|| machine.fail_at(span, "float() argument must be a number or string")),
            }
        }
        "bool" => {
            arity(1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "list" => {
            if args.is_empty() {
                return Ok(Value::List(Vec::new()));
            }
            arity(1)?;
            args[0]
                .iterate()
                .map(Value::List)
                .ok_or_else(|| machine.fail_at(span, "list() argument must be iterable"))
        }
        "dict" => {
            if args.is_empty() {
                return Ok(Value::Dict(kwargs));
            }
            match &args[0] {
                Value::Dict(d) => Ok(Value::Dict(d.clone())),
                _ => Err(machine.fail_at(span, "dict() argument must be a dict")),
            }
        }
        "range" => {
            let (start, stop, step) = match args.len() {
                1 => (0, int_arg(machine, &args[0], name, span)?, 1),
                2 => (
                    int_arg(machine, &args[0], name, span)?,
                    int_arg(machine, &args[1], name, span)?,
                    1,
                ),
                3 => (
                    int_arg(machine, &args[0], name, span)?,
                    int_arg(machine, &args[1], name, span)?,
                    int_arg(machine, &args[2], name, span)?,
                ),
                _ => return Err(machine.fail_at(span, "range() takes 1 to 3 arguments")),
            };
            if step == 0 {
                return Err(machine.fail_at(span, "range() step must not be zero"));
            }
            let mut out = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                out.push(Value::Int(current));
                current += step;
                if out.len() > 1_000_000 {
                    return Err(machine.fail_at(span, "range() result too large"));
                }
            }
            Ok(Value::List(out))
        }
        "enumerate" => {
            arity(1)?;
            let items = args[0]
                .iterate()
                .ok_or_else(|| machine.fail_at(span, "enumerate() argument must be iterable"))?;
            Ok(Value::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Value::List(vec![Value::Int(i as i64), item]))
                    .collect(),
            ))
        }
        "sorted" => {
            arity(1)?;
            let mut items = args[0]
                .iterate()
                .ok_or_else(|| machine.fail_at(span, "sorted() argument must be iterable"))?;
            let reverse = kwargs
                .get("reverse")
                .map(Value::truthy)
                .unwrap_or(false);
            let mut failed = false;
            items.sort_by(|a, b| {
                a.order_with(b).unwrap_or_else(|| {
                    failed = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failed {
                return Err(machine.fail_at(span, "sorted() got incomparable elements"));
            }
            if reverse {
                items.reverse();
            }
            Ok(Value::List(items))
        }
        "reversed" => {
            arity(1)?;
            let mut items = args[0]
                .iterate()
                .ok_or_else(|| machine.fail_at(span, "reversed() argument must be iterable"))?;
            items.reverse();
            Ok(Value::List(items))
        }
        "min" | "max" => {
            let items = if args.len() == 1 {
                args[0]
                    .iterate()
                    .ok_or_else(|| machine.fail_at(span, format!("{name}() argument must be iterable")))?
            } else {
                args
            };
            if items.is_empty() {
                return Err(machine.fail_at(span, format!("{name}() of an empty sequence")));
            }
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ordering = item
                    .order_with(&best)
                    .ok_or_else(|| machine.fail_at(span, format!("{name}() got incomparable elements")))?;
                let better = match name {
                    "min" => ordering == std::cmp::Ordering::Less,
                    _ => ordering == std::cmp::Ordering::Greater,
                };
                if better {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        "sum" => {
            arity(1)?;
            let items = args[0]
                .iterate()
                .ok_or_else(|| machine.fail_at(span, "sum() argument must be iterable"))?;
            let mut int_total = 0i64;
            let mut float_total = 0f64;
            let mut is_float = false;
            for item in items {
                match item {
                    Value::Int(i) => int_total += i,
                    Value::Bool(b) => int_total += b as i64,
                    Value::Float(f) => {
                        is_float = true;
                        float_total += f;
                    }
                    other => {
                        return Err(machine.fail_at(
                            span,
                            format!("unsupported operand type for sum(): '{}'", other.type_name()),
                        ))
                    }
                }
            }
            if is_float {
                Ok(Value::Float(float_total + int_total as f64))
            } else {
                Ok(Value::Int(int_total))
            }
        }
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(machine.fail_at(
                    span,
                    format!("bad operand type for abs(): '{}'", other.type_name()),
                )),
            }
        }
        "round" => {
            let digits = match args.len() {
                1 => 0,
                2 => int_arg(machine, &args[1], name, span)?,
                _ => return Err(machine.fail_at(span, "round() takes 1 or 2 arguments")),
            };
            let value = args[0]
                .as_float()
                .ok_or_else(|| machine.fail_at(span, "round() argument must be a number"))?;
            let factor = 10f64.powi(digits as i32);
            let rounded = (value * factor).round() / factor;
            if digits == 0 {
                Ok(Value::Int(rounded as i64))
            } else {
                Ok(Value::Float(rounded))
            }
        }
        _ => Err(machine.fail_at(span, format!("name '{name}' is not defined"))),
    }
}

fn int_arg(machine: &Machine, value: &Value, func: &str, span: Span) -> Result<i64, EvalError> {
    value
        .as_int()
        .ok_or_else(|| machine.fail_at(span, format!("{func}() argument must be an integer")))
}

pub fn value_method(
    machine: &mut Machine,
    receiver: &mut Value,
    method: &str,
    args: Vec<Value>,
    kwargs: IndexMap<String, Value>,
    span: Span,
) -> Result<Value, EvalError> {
    // Only `format` and `sort` accept keywords.
    if !kwargs.is_empty() && !matches!(method, "format" | "sort") {
        return Err(machine.fail_at(span, format!("{method}() takes no keyword arguments")));
    }

    match receiver {
        Value::Str(s) => string_method(machine, s, method, args, kwargs, span),
        Value::List(items) => list_method(machine, items, method, args, kwargs, span),
        Value::Dict(pairs) => dict_method(machine, pairs, method, args, span),
        other => Err(machine.fail_at(
            span,
            format!("'{}' object has no method '{method}'", other.type_name()),
        )),
    }
}

fn string_method(
    machine: &mut Machine,
    s: &str,
    method: &str,
    args: Vec<Value>,
    kwargs: IndexMap<String, Value>,
    span: Span,
) -> Result<Value, EvalError> {
    let str_arg = |i: usize| -> Result<String, EvalError> {
        args.get(i)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| machine.fail_at(span, format!("str.{method}() expects a string argument")))
    };

    Ok(match method {
        "upper" => Value::Str(s.to_uppercase()),
        "lower" => Value::Str(s.to_lowercase()),
        "strip" => Value::Str(s.trim().to_string()),
        "lstrip" => Value::Str(s.trim_start().to_string()),
        "rstrip" => Value::Str(s.trim_end().to_string()),
        "title" => Value::Str(
            s.split(' ')
                .map(|w| {
                    let mut chars = w.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        ),
        "capitalize" => {
            let mut chars = s.chars();
            Value::Str(match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            })
        }
        "split" => {
            let parts: Vec<Value> = if args.is_empty() {
                s.split_whitespace().map(Value::from).collect()
            } else {
                let sep = str_arg(0)?;
                s.split(sep.as_str()).map(Value::from).collect()
            };
            Value::List(parts)
        }
        "join" => {
            let items = args
                .first()
                .and_then(Value::iterate)
                .ok_or_else(|| machine.fail_at(span, "str.join() expects an iterable"))?;
            Value::Str(
                items
                    .iter()
                    .map(Value::to_display)
                    .collect::<Vec<_>>()
                    .join(s),
            )
        }
        "replace" => Value::Str(s.replace(&str_arg(0)?, &str_arg(1)?)),
        "startswith" => Value::Bool(s.starts_with(&str_arg(0)?)),
        "endswith" => Value::Bool(s.ends_with(&str_arg(0)?)),
        "format" => {
            // Positional `{}` and named `{key}` substitution.
            let mut out = String::new();
            let mut rest = s;
            let mut index = 0;
            while let Some(pos) = rest.find("{}") {
                out.push_str(&rest[..pos]);
                if let Some(arg) = args.get(index) {
                    out.push_str(&arg.to_display());
                }
                index += 1;
                rest = &rest[pos + 2..];
            }
            out.push_str(rest);

            for (name, value) in &kwargs {
                out = out.replace(&format!("{{{name}}}"), &value.to_display());
            }
            Value::Str(out)
        }
        _ => {
            return Err(machine.fail_at(span, format!("'str' object has no method '{method}'")))
        }
    })
}

fn list_method(
    machine: &mut Machine,
    items: &mut Vec<Value>,
    method: &str,
    args: Vec<Value>,
    kwargs: IndexMap<String, Value>,
    span: Span,
) -> Result<Value, EvalError> {
    Ok(match method {
        "append" => {
            let value = args
                .into_iter()
                .next()
                .ok_or_else(|| machine.fail_at(span, "list.append() takes one argument"))?;
            items.push(value);
            Value::None
        }
        "insert" => {
            let mut args = args.into_iter();
            let index = args
                .next()
                .and_then(|v| v.as_int())
                .ok_or_else(|| machine.fail_at(span, "list.insert() expects an index"))?;
            let value = args
                .next()
                .ok_or_else(|| machine.fail_at(span, "list.insert() takes two arguments"))?;
            let idx = (index.max(0) as usize).min(items.len());
            items.insert(idx, value);
            Value::None
        }
        "pop" => {
            let index = match args.first() {
                Some(v) => v
                    .as_int()
                    .ok_or_else(|| machine.fail_at(span, "list.pop() expects an index"))?,
                None => items.len() as i64 - 1,
            };
            let len = items.len() as i64;
            let idx = if index < 0 { len + index } else { index };
            if idx < 0 || idx >= len {
                return Err(machine.fail_at(span, "pop index out of range"));
            }
            items.remove(idx as usize)
        }
        "remove" => {
            let needle = args
                .first()
                .ok_or_else(|| machine.fail_at(span, "list.remove() takes one argument"))?;
            match items.iter().position(|i| i == needle) {
                Some(pos) => {
                    items.remove(pos);
                    Value::None
                }
                None => return Err(machine.fail_at(span, "list.remove(x): x not in list")),
            }
        }
        "index" => {
            let needle = args
                .first()
                .ok_or_else(|| machine.fail_at(span, "list.index() takes one argument"))?;
            match items.iter().position(|i| i == needle) {
                Some(pos) => Value::Int(pos as i64),
                None => return Err(machine.fail_at(span, "value not in list")),
            }
        }
        "count" => {
            let needle = args
                .first()
                .ok_or_else(|| machine.fail_at(span, "list.count() takes one argument"))?;
            Value::Int(items.iter().filter(|i| *i == needle).count() as i64)
        }
        "reverse" => {
            items.reverse();
            Value::None
        }
        "sort" => {
            let mut failed = false;
            items.sort_by(|a, b| {
                a.order_with(b).unwrap_or_else(|| {
                    failed = true;
                    std::cmp::Ordering::Equal
                })
            });
            if failed {
                return Err(machine.fail_at(span, "list.sort() got incomparable elements"));
            }
            if kwargs.get("reverse").map(Value::truthy).unwrap_or(false) {
                items.reverse();
            }
            Value::None
        }
        "clear" => {
            items.clear();
            Value::None
        }
        _ => {
            return Err(machine.fail_at(span, format!("'list' object has no method '{method}'")))
        }
    })
}

fn dict_method(
    machine: &mut Machine,
    pairs: &mut IndexMap<String, Value>,
    method: &str,
    args: Vec<Value>,
    span: Span,
) -> Result<Value, EvalError> {
    Ok(match method {
        "get" => {
            let key = args
                .first()
                .map(Value::to_display)
                .ok_or_else(|| machine.fail_at(span, "dict.get() takes at least one argument"))?;
            pairs
                .get(&key)
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None))
        }
        "keys" => Value::List(pairs.keys().map(|k| Value::Str(k.clone())).collect()),
        "values" => Value::List(pairs.values().cloned().collect()),
        "items" => Value::List(
            pairs
                .iter()
                .map(|(k, v)| Value::List(vec![Value::Str(k.clone()), v.clone()]))
                .collect(),
        ),
        "pop" => {
            let key = args
                .first()
                .map(Value::to_display)
                .ok_or_else(|| machine.fail_at(span, "dict.pop() takes at least one argument"))?;
            match pairs.shift_remove(&key) {
                Some(value) => value,
                None => match args.get(1) {
                    Some(default) => default.clone(),
                    None => return Err(machine.fail_at(span, format!("KeyError: '{key}'"))),
                },
            }
        }
        "update" => {
            match args.first() {
                Some(Value::Dict(other)) => {
                    for (k, v) in other {
                        pairs.insert(k.clone(), v.clone());
                    }
                }
                _ => return Err(machine.fail_at(span, "dict.update() expects a dict")),
            }
            Value::None
        }
        "clear" => {
            pairs.clear();
            Value::None
        }
        _ => {
            return Err(machine.fail_at(span, format!("'dict' object has no method '{method}'")))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::parse_expression;
    use crate::runtime::eval::Locals;
    use std::collections::HashSet;

    fn eval_str(src: &str) -> Value {
        let expr = parse_expression(src).unwrap();
        let methods = IndexMap::new();
        let state_names = HashSet::new();
        let mut machine = Machine::new(&methods, &state_names);
        let mut state = IndexMap::new();
        let mut locals = Locals::new();
        machine.eval(&expr, &mut state, &mut locals).unwrap()
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval_str("'hello'.upper()"), Value::Str("HELLO".into()));
        assert_eq!(eval_str("' x '.strip()"), Value::Str("x".into()));
        assert_eq!(
            eval_str("', '.join(['a', 'b'])"),
            Value::Str("a, b".into())
        );
        assert_eq!(
            eval_str("'a-b-c'.split('-')"),
            Value::List(vec![
                Value::Str("a".into()),
                Value::Str("b".into()),
                Value::Str("c".into())
            ])
        );
        assert_eq!(
            eval_str("'Hi {}!'.format('Ada')"),
            Value::Str("Hi Ada!".into())
        );
    }

    #[test]
    fn range_and_sum() {
        assert_eq!(eval_str("sum(range(5))"), Value::Int(10));
        assert_eq!(eval_str("len(range(2, 10, 3))"), Value::Int(3));
    }

    #[test]
    fn sorted_with_reverse() {
        assert_eq!(
            eval_str("sorted([3, 1, 2], reverse=True)"),
            Value::List(vec![Value::Int(3), Value::Int(2), Value::Int(1)])
        );
    }

    #[test]
    fn dict_get_with_default() {
        assert_eq!(eval_str("{'a': 1}.get('b', 0)"), Value::Int(0));
        assert_eq!(eval_str("{'a': 1}.get('a')"), Value::Int(1));
    }

    #[test]
    fn enumerate_pairs() {
        assert_eq!(
            eval_str("enumerate(['x'])"),
            Value::List(vec![Value::List(vec![
                Value::Int(0),
                Value::Str("x".into())
            ])])
        );
    }

    #[test]
    fn round_behaviour() {
        assert_eq!(eval_str("round(2.5)"), Value::Int(3));
        assert_eq!(eval_str("round(2.345, 2)"), Value::Float(2.35));
    }
}
