// File: src/builtins.rs
//
// The built-in function table (spec.md §4.8): a process-wide, immutable,
// ordered sequence resolved by index via `OpGetBuiltinFunction`. Domain
// errors from a built-in are `Value::Error`, not engine-terminating —
// only the dispatch loop's own opcodes can abort a run.

use crate::engine::Engine;
use crate::value::Value;

pub type BuiltinFn = fn(&mut Engine, &[Value]) -> Value;

/// `(name, callable)` pairs, indexed by `OpGetBuiltinFunction`'s operand.
/// Order is part of the compiler/runtime contract — never reorder once a
/// compiler has shipped bytecode referencing these indices.
pub static BUILTINS: &[(&str, BuiltinFn)] = &[
    ("len", builtin_len),
    ("first", builtin_first),
    ("last", builtin_last),
    ("rest", builtin_rest),
    ("push", builtin_push),
    ("puts", builtin_puts),
    ("httpServer", builtin_http_server),
    ("writeHttp", builtin_write_http),
];

pub fn index_of(name: &str) -> Option<usize> {
    BUILTINS.iter().position(|(n, _)| *n == name)
}

fn arity_error(expected: usize, got: usize) -> Value {
    Value::error(format!("wrong number of arguments. expected={}. got={}", expected, got))
}

fn builtin_len(_engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 1 {
        return arity_error(1, args.len());
    }
    match &args[0] {
        Value::String(s) => Value::Integer(s.chars().count() as i64),
        Value::Array(elements) => Value::Integer(elements.len() as i64),
        other => Value::error(format!(
            "incorrect argument type, can not iterate. got=\"{}\"",
            other.type_name()
        )),
    }
}

fn builtin_first(_engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 1 {
        return arity_error(1, args.len());
    }
    match &args[0] {
        Value::Array(elements) => elements.first().cloned().unwrap_or(Value::Null),
        other => Value::error(format!(
            "incorrect argument type, can not iterate. got=\"{}\"",
            other.type_name()
        )),
    }
}

fn builtin_last(_engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 1 {
        return arity_error(1, args.len());
    }
    match &args[0] {
        Value::Array(elements) => elements.last().cloned().unwrap_or(Value::Null),
        other => Value::error(format!(
            "incorrect argument type, can not iterate. got=\"{}\"",
            other.type_name()
        )),
    }
}

fn builtin_rest(_engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 1 {
        return arity_error(1, args.len());
    }
    match &args[0] {
        Value::Array(elements) => {
            if elements.is_empty() {
                Value::Null
            } else {
                Value::array(elements[1..].to_vec())
            }
        }
        other => Value::error(format!(
            "incorrect argument type, can not iterate. got=\"{}\"",
            other.type_name()
        )),
    }
}

fn builtin_push(_engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 2 {
        return arity_error(2, args.len());
    }
    match &args[0] {
        Value::Array(elements) => {
            let mut next = elements.as_ref().clone();
            next.push(args[1].clone());
            Value::array(next)
        }
        other => Value::error(format!(
            "incorrect argument type, can not iterate. got=\"{}\"",
            other.type_name()
        )),
    }
}

fn builtin_puts(_engine: &mut Engine, args: &[Value]) -> Value {
    for arg in args {
        println!("{}", arg);
    }
    Value::Null
}

/// Serves HTTP requests, matching each request's path against the string
/// keys of `args[0]`'s HashMap and running the matched Closure against a
/// fresh per-request engine (spec.md §4.8, §5). Handlers are served one at
/// a time on the calling thread — the simplest conforming implementation
/// of "serialize sub-engine invocations" (spec.md §5).
fn builtin_http_server(engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 1 {
        return arity_error(1, args.len());
    }
    let routes = match &args[0] {
        Value::HashMap(pairs) => pairs.clone(),
        other => {
            return Value::error(format!(
                "incorrect argument type, can not serve. got=\"{}\"",
                other.type_name()
            ))
        }
    };

    let server = match tiny_http::Server::http("0.0.0.0:8080") {
        Ok(server) => server,
        Err(err) => return Value::error(format!("could not start http server: {}", err)),
    };
    println!("Server listening on http://localhost:8080");

    for request in server.incoming_requests() {
        let path = request.url().to_string();
        let handler = routes
            .values()
            .find(|(key, _)| matches!(key, Value::String(s) if s.as_ref() == path))
            .map(|(_, value)| value.clone());

        let body = match handler {
            Some(Value::Closure(closure)) => engine.run_http_handler(closure),
            Some(other) => format!("ERROR: route is not callable. got=\"{}\"", other.type_name()),
            None => "ERROR: no route registered for this path".to_string(),
        };

        let _ = request.respond(tiny_http::Response::from_string(body));
    }

    Value::Null
}

/// The single-argument String-consuming callable every `httpServer` handler
/// sub-engine finds pre-loaded into local slot 0 (spec.md §4.8). Appends its
/// argument to the engine's response buffer rather than returning a value —
/// handlers produce output by calling this, not by returning one.
fn builtin_write_http(engine: &mut Engine, args: &[Value]) -> Value {
    if args.len() != 1 {
        return arity_error(1, args.len());
    }
    match &args[0] {
        Value::String(s) => {
            engine.http_response.push_str(s);
            Value::Null
        }
        other => Value::error(format!("incorrect argument type, can not write. got=\"{}\"", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_reports_array_and_string_length() {
        let mut engine = Engine::construct(crate::image::BytecodeImage::new(vec![], vec![]));
        assert_eq!(
            builtin_len(&mut engine, &[Value::array(vec![Value::Integer(1), Value::Integer(2)])]),
            Value::Integer(2)
        );
        assert_eq!(builtin_len(&mut engine, &[Value::str("hi")]), Value::Integer(2));
    }

    #[test]
    fn len_rejects_non_iterable_types() {
        let mut engine = Engine::construct(crate::image::BytecodeImage::new(vec![], vec![]));
        let result = builtin_len(&mut engine, &[Value::Integer(5)]);
        assert_eq!(
            result,
            Value::error("incorrect argument type, can not iterate. got=\"INTEGER\"")
        );
    }

    #[test]
    fn first_last_rest_on_empty_array_yield_null() {
        let mut engine = Engine::construct(crate::image::BytecodeImage::new(vec![], vec![]));
        let empty = Value::array(vec![]);
        assert_eq!(builtin_first(&mut engine, &[empty.clone()]), Value::Null);
        assert_eq!(builtin_last(&mut engine, &[empty.clone()]), Value::Null);
        assert_eq!(builtin_rest(&mut engine, &[empty]), Value::Null);
    }

    #[test]
    fn push_returns_a_new_array_leaving_the_original_untouched() {
        let mut engine = Engine::construct(crate::image::BytecodeImage::new(vec![], vec![]));
        let original = Value::array(vec![Value::Integer(1)]);
        let pushed = builtin_push(&mut engine, &[original.clone(), Value::Integer(2)]);
        assert_eq!(pushed, Value::array(vec![Value::Integer(1), Value::Integer(2)]));
        assert_eq!(original, Value::array(vec![Value::Integer(1)]));
    }

    #[test]
    fn index_of_resolves_known_names() {
        assert_eq!(index_of("len"), Some(0));
        assert_eq!(index_of("httpServer"), Some(6));
        assert_eq!(index_of("writeHttp"), Some(7));
        assert_eq!(index_of("nope"), None);
    }

    #[test]
    fn write_http_appends_to_the_engine_response_buffer() {
        let mut engine = Engine::construct(crate::image::BytecodeImage::new(vec![], vec![]));
        builtin_write_http(&mut engine, &[Value::str("hello ")]);
        builtin_write_http(&mut engine, &[Value::str("world")]);
        assert_eq!(engine.http_response, "hello world");
    }

    #[test]
    fn write_http_rejects_non_string_arguments() {
        let mut engine = Engine::construct(crate::image::BytecodeImage::new(vec![], vec![]));
        let result = builtin_write_http(&mut engine, &[Value::Integer(5)]);
        assert_eq!(result, Value::error("incorrect argument type, can not write. got=\"INTEGER\""));
    }
}
