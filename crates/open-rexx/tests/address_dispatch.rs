//! ADDRESS dispatch through registered async handlers.

use std::cell::RefCell;
use std::rc::Rc;

use open_rexx::{
    AddressRequest, AddressTarget, DispatchKind, ErrorKind, FailurePolicy, HandlerError,
    InterpError, Interpreter, InterpreterConfig, Response, Value,
};

type Log = Rc<RefCell<Vec<AddressRequest>>>;

/// A target that records every request and echoes the message back.
fn recording(name: &str) -> (AddressTarget, Log) {
    let log: Log = Rc::default();
    let sink = log.clone();
    let target = AddressTarget::new(name, move |request: AddressRequest| {
        let sink = sink.clone();
        async move {
            let message = request.message.clone();
            sink.borrow_mut().push(request);
            Ok::<_, HandlerError>(Response::success(message))
        }
    });
    (target, log)
}

fn calculator() -> AddressTarget {
    AddressTarget::new("calc", |request: AddressRequest| async move {
        let arg = |name: &str| request.param(name).and_then(Value::as_number).unwrap_or(0.0);
        match request.source.method.as_deref() {
            Some("add") => Ok(Response::success(arg("x") + arg("y"))),
            Some("divide") if arg("y") == 0.0 => Err(HandlerError::new("cannot divide by zero")),
            Some("divide") => Ok(Response::success(arg("x") / arg("y"))),
            _ => Ok(Response::failure("unsupported", "UsageError", "calc")),
        }
    })
    .with_methods(["add", "divide"])
}

async fn run(interp: &mut Interpreter, source: &str) -> Vec<String> {
    match interp.run_source(source).await {
        Ok(result) => result.output,
        Err(err) => panic!("script failed: {err}"),
    }
}

async fn runtime_error(interp: &mut Interpreter, source: &str) -> ErrorKind {
    match interp.run_source(source).await {
        Err(InterpError::Runtime(err)) => err.kind,
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[tokio::test]
async fn raw_instruction_goes_to_active_target() {
    let (target, log) = recording("shell");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    let out = run(&mut interp, "ADDRESS shell\nlist files now\nSAY RC RESULT").await;
    assert_eq!(out, vec!["0 list files now"]);

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].target, "shell");
    assert_eq!(log[0].source.kind, DispatchKind::Instruction);
    assert_eq!(log[0].source.line, 2);
}

#[tokio::test]
async fn payload_interpolation_and_context() {
    let (target, log) = recording("db");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    run(&mut interp, "table = 'users'\nADDRESS db \"SELECT * FROM {table}\"").await;

    let log = log.borrow();
    assert_eq!(log[0].message, "SELECT * FROM users");
    assert_eq!(log[0].source.kind, DispatchKind::Command);
    assert_eq!(log[0].variable("TABLE"), Some(&Value::string("users")));
}

#[tokio::test]
async fn target_without_interpolation_gets_verbatim_payload() {
    let (target, log) = recording("raw");
    let mut interp = Interpreter::new();
    interp.register_target(target.without_interpolation());
    run(&mut interp, "table = 'users'\nADDRESS raw \"x {table}\"").await;
    assert_eq!(log.borrow()[0].message, "x {table}");
}

#[tokio::test]
async fn lines_captures_following_lines_verbatim() {
    let (target, log) = recording("test");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    let src = "ADDRESS test LINES(2)\nfirst line\n  second line\nSAY 'resumed'";
    let out = run(&mut interp, src).await;
    assert_eq!(out, vec!["resumed"]);

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message, "first line\n  second line");
    assert_eq!(log[0].source.kind, DispatchKind::Lines);
}

#[tokio::test]
async fn heredoc_payload() {
    let (target, log) = recording("sql");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    let src = "ADDRESS sql <<SQL\nSELECT *\nFROM t\nSQL\nSAY RC";
    assert_eq!(run(&mut interp, src).await, vec!["0"]);
    assert_eq!(log.borrow()[0].message, "SELECT *\nFROM t");
    assert_eq!(log.borrow()[0].source.kind, DispatchKind::Heredoc);
}

#[tokio::test]
async fn bare_heredoc_uses_active_target() {
    let (target, log) = recording("sql");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    run(&mut interp, "ADDRESS sql\n<<END\nDELETE FROM t\nEND").await;
    assert_eq!(log.borrow()[0].message, "DELETE FROM t");
}

#[tokio::test]
async fn target_names_are_case_insensitive() {
    let (target, log) = recording("Shell");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    run(&mut interp, "ADDRESS SHELL 'ls'").await;
    assert_eq!(log.borrow().len(), 1);
}

#[tokio::test]
async fn missing_target() {
    let mut interp = Interpreter::new();
    let kind = runtime_error(&mut interp, "ADDRESS nowhere\nhello").await;
    assert_eq!(
        kind,
        ErrorKind::NoSuchAddressTarget {
            name: "nowhere".to_string()
        }
    );
}

#[tokio::test]
async fn address_reset_leaves_no_active_target() {
    let (target, _log) = recording("shell");
    let mut interp = Interpreter::new();
    interp.register_target(target);
    let kind = runtime_error(&mut interp, "ADDRESS shell\nADDRESS\nhello").await;
    assert!(matches!(kind, ErrorKind::NoActiveAddress { .. }));
}

#[tokio::test]
async fn default_target_from_config() {
    let (target, log) = recording("echo");
    let mut config = InterpreterConfig::default();
    config.address.default_target = Some("echo".to_string());
    let mut interp = Interpreter::with_config(config);
    interp.register_target(target);
    run(&mut interp, "ping").await;
    assert_eq!(log.borrow()[0].message, "ping");
}

#[tokio::test]
async fn method_call_binds_result() {
    let mut interp = Interpreter::new();
    interp.register_target(calculator());
    let out = run(&mut interp, "ADDRESS calc\nLET sum = add x=2 y=3\nSAY sum RC").await;
    assert_eq!(out, vec!["5 0"]);
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let mut interp = Interpreter::new();
    interp.register_target(calculator());
    let kind = runtime_error(&mut interp, "ADDRESS calc\nLET r = multiply x=2 y=3").await;
    assert_eq!(
        kind,
        ErrorKind::UnknownAddressMethod {
            target: "calc".to_string(),
            method: "multiply".to_string(),
        }
    );
}

#[tokio::test]
async fn handler_error_reports_by_default() {
    let mut interp = Interpreter::new();
    interp.register_target(calculator());
    let out = run(
        &mut interp,
        "ADDRESS calc\nLET r = divide x=1 y=0\nSAY RC ERRORTEXT\nLET r = divide x=6 y=3\nSAY RC r ERRORTEXT",
    )
    .await;
    // ERRORTEXT is dropped again after a success, so it renders as its name.
    assert_eq!(out, vec!["1 cannot divide by zero", "0 2 ERRORTEXT"]);
}

#[tokio::test]
async fn abort_policy_raises_handler_execution() {
    let mut config = InterpreterConfig::default();
    config.address.failure_policy = FailurePolicy::Abort;
    let mut interp = Interpreter::with_config(config);
    interp.register_target(calculator());
    let kind = runtime_error(&mut interp, "ADDRESS calc\nLET r = divide x=1 y=0").await;
    assert_eq!(
        kind,
        ErrorKind::HandlerExecution {
            target: "calc".to_string(),
            message: "cannot divide by zero".to_string(),
        }
    );
}

#[tokio::test]
async fn abort_policy_raises_address_failure() {
    let failing = AddressTarget::new("svc", |_request: AddressRequest| async {
        Ok::<_, HandlerError>(Response::failure("quota exceeded", "QuotaError", "write"))
    });
    let mut config = InterpreterConfig::default();
    config.address.failure_policy = FailurePolicy::Abort;
    let mut interp = Interpreter::with_config(config);
    interp.register_target(failing);
    let kind = runtime_error(&mut interp, "ADDRESS svc 'write x'").await;
    assert_eq!(
        kind,
        ErrorKind::AddressFailure {
            target: "svc".to_string(),
            message: "quota exceeded".to_string(),
        }
    );
}

#[tokio::test]
async fn address_is_scoped_to_the_call() {
    let (first, first_log) = recording("first");
    let (second, second_log) = recording("second");
    let mut interp = Interpreter::new();
    interp.register_target(first);
    interp.register_target(second);
    let src = "ADDRESS first\nCALL switch\nafter call\nEXIT\nswitch:\n  ADDRESS second\n  inside call\n  RETURN";
    run(&mut interp, src).await;
    assert_eq!(first_log.borrow()[0].message, "after call");
    assert_eq!(second_log.borrow()[0].message, "inside call");
}

#[tokio::test]
async fn script_name_reaches_handler() {
    let (target, log) = recording("shell");
    let mut interp = Interpreter::new();
    interp.set_script_name("deploy.rexx");
    interp.register_target(target);
    run(&mut interp, "ADDRESS shell 'go'").await;
    assert_eq!(log.borrow()[0].source.script.as_deref(), Some("deploy.rexx"));
}

#[tokio::test]
async fn response_envelope_json() {
    let json = Response::success(42.0).with_metadata("rows", 3i64).to_json();
    assert_eq!(json["success"], true);
    assert_eq!(json["result"], 42.0);
    assert_eq!(json["rows"], 3.0);
    assert!(json["timestamp"].is_string());

    let json = Response::handler_error(&HandlerError::new("boom")).to_json();
    assert_eq!(json["success"], false);
    assert_eq!(json["errorType"], "Error");
    assert_eq!(json["operation"], "handler_execution");
    assert_eq!(json["message"], "boom");
}
