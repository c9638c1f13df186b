//! End-to-end script behaviour through the public API.

use open_rexx::{
    interpret, CallArgs, ErrorKind, FunctionError, FunctionTable, InterpError, Interpreter,
    InterpreterConfig, Value,
};
use proptest::prelude::*;

async fn output(source: &str) -> Vec<String> {
    match interpret(source).await {
        Ok(result) => result.output,
        Err(err) => panic!("script failed: {err}"),
    }
}

#[tokio::test]
async fn array_argument_is_shared_unless_copied() {
    let shared = r#"
arr = ["original"]
CALL modify arr
SAY arr[1]
EXIT
modify:
  PARSE ARG a
  a[1] = "changed"
  RETURN
"#;
    assert_eq!(output(shared).await, vec!["changed"]);

    let copied = r#"
arr = ["original"]
CALL modify COPY(arr)
SAY arr[1]
EXIT
modify:
  PARSE ARG a
  a[1] = "changed"
  RETURN
"#;
    assert_eq!(output(copied).await, vec!["original"]);
}

#[tokio::test]
async fn mutator_function_in_callee_changes_caller_array() {
    let src = r#"
arr = ["original", "second"]
CALL modify arr
SAY arr
EXIT
modify:
  PARSE ARG a
  CALL ARRAY_SET a, 1, "MUTATED_ARRAY"
  RETURN
"#;
    assert_eq!(output(src).await, vec![r#"["MUTATED_ARRAY","second"]"#]);
}

#[tokio::test]
async fn copy_of_self_containing_array() {
    let src = r#"
a = [1]
CALL ARRAY_PUSH a, a
b = COPY(a)
SAY ARRAY_LENGTH(b) b
"#;
    assert_eq!(output(src).await, vec![r#"2 [1,"[Circular]"]"#]);
}

#[tokio::test]
async fn do_range_runs_three_times() {
    let src = "count = 0\nDO i = 1 TO 3\n  count = count + 1\nEND\nSAY count i";
    assert_eq!(output(src).await, vec!["3 3"]);
}

#[tokio::test]
async fn select_runs_only_first_true_when() {
    let src = r#"
n = 10
SELECT
  WHEN n > 1 THEN SAY "one"
  WHEN n > 5 THEN SAY "five"
  WHEN n > 9 THEN SAY "nine"
  OTHERWISE SAY "none"
END
"#;
    assert_eq!(output(src).await, vec!["one"]);
}

#[tokio::test]
async fn division_by_zero_stops_script() {
    let mut interp = Interpreter::new();
    let err = interp
        .run_source("SAY 'start'\nx = 10 / 0\nSAY 'unreachable'")
        .await
        .unwrap_err();
    let InterpError::Runtime(err) = err else {
        panic!("expected runtime error, got {err:?}");
    };
    assert_eq!(err.line, 2);
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.to_string(), "line 2: Division by zero");
    assert_eq!(interp.output(), ["start"]);
}

#[tokio::test]
async fn nested_call_trace() {
    let src = "CALL sub1\nSAY \"done\"\nsub1:\nSAY \"in sub1\"\nCALL sub2\nRETURN\nsub2:\nSAY \"in sub2\"\nRETURN";
    let config = InterpreterConfig {
        trace: true,
        ..InterpreterConfig::default()
    };
    let result = Interpreter::with_config(config).run_source(src).await.unwrap();
    assert_eq!(
        result.trace,
        vec![
            ">> 1 CALL sub1 (0 args)",
            ">> 4 SAY \"in sub1\"",
            ">> 5 CALL sub2 (0 args)",
            ">> 8 SAY \"in sub2\"",
            ">> 2 SAY \"done\"",
        ]
    );
}

#[tokio::test]
async fn seq_zero_step_surfaces_function_error() {
    let err = interpret("list = SEQ(1, 5, 0)").await.unwrap_err();
    let InterpError::Runtime(err) = err else {
        panic!("expected runtime error");
    };
    assert_eq!(
        err.kind,
        ErrorKind::Function {
            name: "SEQ".to_string(),
            source: FunctionError::ZeroStep,
        }
    );
    assert!(err.to_string().contains("step cannot be zero"));
}

#[tokio::test]
async fn invalid_json_surfaces_unchanged() {
    let err = interpret("x = JSON_PARSE('{not json')").await.unwrap_err();
    let InterpError::Runtime(err) = err else {
        panic!("expected runtime error");
    };
    assert!(matches!(
        err.kind,
        ErrorKind::Function {
            source: FunctionError::InvalidJson(_),
            ..
        }
    ));
}

#[tokio::test]
async fn json_round_trip_through_script() {
    let src = r#"
data = JSON_PARSE('{"user": {"name": "Ada", "langs": ["en", "fr"]}}')
SAY data.user.name ARRAY_LENGTH(data.user.langs) data.user.langs.2
"#;
    assert_eq!(output(src).await, vec!["Ada 2 fr"]);
}

#[tokio::test]
async fn pipe_and_named_arguments() {
    let src = "SAY 'hello world' |> UPPER |> SUBSTR(start=7)";
    assert_eq!(output(src).await, vec!["WORLD"]);
}

#[tokio::test]
async fn interpolation_in_double_quoted_strings() {
    let src = "user.name = 'Ada'\nn = 3\nSAY \"{{user.name}} has {{n}} items, {{missing}} stays\"";
    assert_eq!(output(src).await, vec!["Ada has 3 items, {{missing}} stays"]);
}

#[tokio::test]
async fn missing_marker_replaces_unresolved_placeholders() {
    let mut config = InterpreterConfig::default();
    config.interpolation.missing_marker = Some("?".to_string());
    let result = Interpreter::with_config(config)
        .run_source("SAY \"[{{nothing}}]\"")
        .await
        .unwrap();
    assert_eq!(result.output, vec!["[?]"]);
}

#[tokio::test]
async fn host_registered_function() {
    let mut interp = Interpreter::new();
    interp
        .functions_mut()
        .register("GREET", &["name", "punct"], |args: &[Value]| {
            let name = args.first().map(Value::to_string).unwrap_or_default();
            let punct = args.get(1).map(Value::to_string).unwrap_or_else(|| "!".to_string());
            Ok(Value::String(format!("Hello, {name}{punct}")))
        });
    let result = interp
        .run_source("SAY GREET('Ada')\nSAY GREET(punct='?', name='Bob')\nLET g = GREET name='Cy'\nSAY g")
        .await
        .unwrap();
    assert_eq!(result.output, vec!["Hello, Ada!", "Hello, Bob?", "Hello, Cy!"]);
}

#[tokio::test]
async fn exit_value_becomes_rc() {
    let result = interpret("DO i = 1 TO 10\n  IF i = 4 THEN EXIT i * 2\nEND").await.unwrap();
    assert_eq!(result.rc, 8);
}

proptest! {
    #[test]
    fn seq_is_finite_and_bounded(start in -50i64..50, end in -50i64..50, step in 1i64..7) {
        let table = FunctionTable::with_builtins();
        let step = if end < start { -step } else { step };
        let args = CallArgs::positional(vec![
            Value::from(start),
            Value::from(end),
            Value::from(step),
        ]);
        let value = table.call("SEQ", args).unwrap().unwrap();
        let Value::Array(items) = value else {
            panic!("SEQ returned a non-array");
        };
        let items = items.borrow();
        let expected = (end - start).abs() / step.abs() + 1;
        prop_assert_eq!(items.len() as i64, expected);
        for item in items.iter() {
            let n = item.as_number().unwrap();
            prop_assert!(n >= start.min(end) as f64 && n <= start.max(end) as f64);
        }
    }
}
