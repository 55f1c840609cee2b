use std::{collections::BTreeSet, sync::Arc, time::Duration};

use camino::Utf8PathBuf;

use super::{ChannelScheduler, MOCK_API, TestHost, serial, utf8_dir, write_file};
use crate::{
    EvalError, HostError, HostOptions, HostState, InitError, LoadFailure, ScriptRuntimeHost,
    TimerScheduler,
};

fn host_in(dir: &tempfile::TempDir, options: HostOptions) -> ScriptRuntimeHost {
    let (scheduler, _callbacks) = ChannelScheduler::new();
    ScriptRuntimeHost::new(options.with_base_dir(utf8_dir(dir)), scheduler)
}

#[test]
fn test_synchronous_init_done_unblocks_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", "globalThis.loaded = 'yes'; __initDone(true);");
    let host = host_in(&dir, HostOptions::default());
    assert_eq!(host.state(), HostState::Uninitialized);

    host.initialize(&bundle, &[]).unwrap();

    assert_eq!(host.state(), HostState::Ready);
    assert_eq!(host.evaluate("loaded").unwrap(), "yes");
}

#[test]
fn test_init_done_from_microtask_unblocks_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(
        &dir,
        "abp.js",
        "(async () => { await Promise.resolve(); __initDone(true); })();",
    );
    let host = host_in(&dir, HostOptions::default());

    host.initialize(&bundle, &[]).unwrap();

    assert_eq!(host.state(), HostState::Ready);
}

#[test]
#[serial]
fn test_init_done_from_timer_unblocks_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", "setTimeout(() => __initDone(true), 20);");
    let host = ScriptRuntimeHost::new(
        HostOptions::default().with_init_timeout(Duration::from_secs(10)),
        Arc::new(TimerScheduler::new().unwrap()),
    );

    host.initialize(&bundle, &[]).unwrap();

    assert_eq!(host.state(), HostState::Ready);
}

#[test]
fn test_bundle_reporting_failure_rejects_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", "__initDone(false);");
    let host = host_in(&dir, HostOptions::default());

    let err = host.initialize(&bundle, &[]).unwrap_err();

    assert!(matches!(err, InitError::ScriptRejected));
    assert_eq!(host.state(), HostState::Failed);
}

#[test]
#[serial]
fn test_missing_init_done_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", "globalThis.idle = true;");
    let host = host_in(
        &dir,
        HostOptions::default().with_init_timeout(Duration::from_millis(200)),
    );

    let err = host.initialize(&bundle, &[]).unwrap_err();

    assert!(matches!(err, InitError::InitTimeout(t) if t == Duration::from_millis(200)));
    // the engine keeps running after the timeout
    assert_eq!(host.evaluate("idle").unwrap(), "true");
}

#[test]
fn test_second_initialize_is_rejected() {
    let host = TestHost::started();
    let bundle = Utf8PathBuf::from("abp.js");

    let err = host.host.initialize(&bundle, &[]).unwrap_err();

    assert!(matches!(err, InitError::AlreadyInitialized));
    assert_eq!(host.host.state(), HostState::Ready);
}

#[test]
fn test_second_init_done_throws_in_script() {
    let host = TestHost::started_with(
        r"__initDone(true);
        try {
            __initDone(true);
        } catch (e) {
            globalThis.secondCall = e.message;
        }",
    );

    assert_eq!(host.eval("secondCall"), "__initDone was already called");
}

#[test]
fn test_missing_bundle_is_a_load_failure() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_in(&dir, HostOptions::default());

    let err = host.initialize(&Utf8PathBuf::from("missing.js"), &[]).unwrap_err();

    match err {
        InitError::LoadFailure {
            path,
            source: LoadFailure::Map(map),
        } => {
            assert_eq!(path, utf8_dir(&dir).join("missing.js"));
            assert!(map.os_code().is_some());
        }
        other => panic!("Expected map failure, got {other:?}"),
    }
    assert_eq!(host.state(), HostState::Failed);
}

#[test]
fn test_throwing_bundle_is_a_load_failure_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", "throw new Error('bundle exploded');");
    let host = host_in(&dir, HostOptions::default());

    let err = host.initialize(&bundle, &[]).unwrap_err();

    match err {
        InitError::LoadFailure {
            source: LoadFailure::Script(e),
            ..
        } => assert!(e.message.contains("bundle exploded"), "got: {e}"),
        other => panic!("Expected script failure, got {other:?}"),
    }
}

#[test]
fn test_evaluate_before_initialize_fails() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_in(&dir, HostOptions::default());

    let err = host.evaluate("1 + 1").unwrap_err();

    assert!(matches!(err, EvalError::Host(HostError::NotInitialized)));
}

#[test]
fn test_evaluate_stringifies_results() {
    let host = TestHost::started();

    assert_eq!(host.eval("1 + 2"), "3");
    assert_eq!(host.eval("'text'"), "text");
    assert_eq!(host.eval("undefined"), "");
    assert_eq!(host.eval("null"), "null");
    assert_eq!(host.eval("[1, 'two', 3]"), "1,two,3");
    assert_eq!(host.eval("({ a: 1 })"), "[object Object]");
    assert_eq!(host.eval("true"), "true");
}

#[test]
fn test_evaluate_reports_exception_with_stack() {
    let host = TestHost::started();

    let err = host
        .host
        .evaluate("function explode() { throw new TypeError('bad input'); } explode();")
        .unwrap_err();

    let EvalError::Script(e) = err else {
        panic!("Expected script error, got {err:?}");
    };
    assert!(e.message.contains("TypeError: bad input"), "got: {e}");
    assert!(e.stack.as_deref().is_some_and(|s| s.contains("explode")));
}

#[test]
fn test_runtime_survives_script_errors() {
    let host = TestHost::started();

    assert!(host.host.evaluate("undefinedFunction()").is_err());
    assert_eq!(host.eval("40 + 2"), "42");
}

#[test]
fn test_log_accepts_any_level() {
    let host = TestHost::started();

    let result = host.eval(
        r#"__log("debug", "d"); __log("warn", "w"); __log("error", "e"); __log("verbose", 12)"#,
    );

    assert_eq!(result, "");
}

#[test]
fn test_init_done_requires_boolean() {
    let host = TestHost::started();

    let err = host.host.evaluate("__initDone('yes')").unwrap_err();

    assert!(err.to_string().contains("must be a boolean"), "{err}");
}

#[test]
#[serial]
fn test_concurrent_evaluations_never_interleave() {
    const THREADS: usize = 8;
    const CALLS: usize = 25;

    let host = TestHost::started_with("globalThis.counter = 0; __initDone(true);");
    let script = r"(() => {
        const before = counter;
        let spin = 0;
        for (let i = 0; i < 10000; i++) spin += i;
        counter = before + 1;
        return counter;
    })()";

    let seen: Vec<u64> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let host = host.host.clone();
                scope.spawn(move || {
                    (0..CALLS)
                        .map(|_| host.evaluate(script).unwrap().parse::<u64>().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect()
    });

    let total = (THREADS * CALLS) as u64;
    let distinct: BTreeSet<u64> = seen.iter().copied().collect();
    assert_eq!(distinct, (1..=total).collect::<BTreeSet<_>>());
    assert_eq!(host.eval("counter"), total.to_string());
}

#[test]
fn test_bootstrap_adds_every_rule_except_comments() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", &format!("{MOCK_API}\n__initDone(true);"));
    write_file(
        &dir,
        "easylist.txt",
        "! Title: Test list\r\n||ads.example.com^\n\n!comment without space\n||tracker.example.net^\r\n",
    );
    write_file(&dir, "exceptionrules.txt", "! Exceptions\n@@||ads.example.com/allowed^\n");
    let host = host_in(&dir, HostOptions::default());

    host.initialize(
        &bundle,
        &["easylist.txt".into(), "exceptionrules.txt".into()],
    )
    .unwrap();

    assert_eq!(
        host.evaluate("JSON.stringify([...filters])").unwrap(),
        r#"["||ads.example.com^","!comment without space","||tracker.example.net^","@@||ads.example.com/allowed^"]"#
    );
}

#[test]
fn test_bootstrap_stops_at_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", &format!("{MOCK_API}\n__initDone(true);"));
    write_file(&dir, "good.txt", "first.example\n");
    write_file(&dir, "bad.txt", "second.example\nINVALID rule\nthird.example\n");
    write_file(&dir, "later.txt", "fourth.example\n");
    let host = host_in(&dir, HostOptions::default());

    let err = host
        .initialize(
            &bundle,
            &["good.txt".into(), "bad.txt".into(), "later.txt".into()],
        )
        .unwrap_err();

    match err {
        InitError::BootstrapFailure { path, message } => {
            assert_eq!(path, Utf8PathBuf::from("bad.txt"));
            assert!(message.contains("Invalid filter: INVALID rule"), "got: {message}");
        }
        other => panic!("Expected bootstrap failure, got {other:?}"),
    }
    assert_eq!(host.state(), HostState::Failed);
    assert_eq!(
        host.evaluate("JSON.stringify([...filters])").unwrap(),
        r#"["first.example","second.example"]"#
    );
}

#[test]
fn test_missing_subscription_is_a_bootstrap_failure() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", &format!("{MOCK_API}\n__initDone(true);"));
    let host = host_in(&dir, HostOptions::default());

    let err = host
        .initialize(&bundle, &["missing.txt".into()])
        .unwrap_err();

    assert!(
        matches!(&err, InitError::BootstrapFailure { message, .. } if message.starts_with("Failed to open")),
        "{err}"
    );
}

#[test]
#[serial]
fn test_callers_wait_for_initialization_to_finish() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(
        &dir,
        "abp.js",
        &format!("setTimeout(() => {{\n{MOCK_API}\n__initDone(true);\n}}, 300);"),
    );
    write_file(&dir, "easylist.txt", "ads.example.com\nlate.example\n");
    let host = ScriptRuntimeHost::new(
        HostOptions::default().with_base_dir(utf8_dir(&dir)),
        Arc::new(TimerScheduler::new().unwrap()),
    );

    std::thread::scope(|scope| {
        let initializing = {
            let host = host.clone();
            scope.spawn(move || host.initialize(&bundle, &["easylist.txt".into()]))
        };
        while host.state() == HostState::Uninitialized {
            std::thread::yield_now();
        }

        let result = host.query_api(
            "checkFilterMatch",
            vec![
                "https://late.example/pixel".into(),
                4.into(),
                "".into(),
                "".into(),
                false.into(),
            ],
        );

        assert_eq!(host.state(), HostState::Ready);
        assert_eq!(result.unwrap(), serde_json::Value::from("blocking"));
        assert_eq!(host.evaluate("typeof API").unwrap(), "object");
        initializing.join().unwrap().unwrap();
    });
}

#[test]
fn test_callers_are_released_when_initialization_fails() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_file(&dir, "abp.js", "globalThis.rejected = true; __initDone(false);");
    let host = host_in(&dir, HostOptions::default());

    std::thread::scope(|scope| {
        let initializing = {
            let host = host.clone();
            scope.spawn(move || host.initialize(&bundle, &[]))
        };
        while host.state() == HostState::Uninitialized {
            std::thread::yield_now();
        }

        let evaluated = host.evaluate("rejected");

        assert_eq!(host.state(), HostState::Failed);
        assert_eq!(evaluated.unwrap(), "true");
        assert!(matches!(
            initializing.join().unwrap(),
            Err(InitError::ScriptRejected)
        ));
    });
}
