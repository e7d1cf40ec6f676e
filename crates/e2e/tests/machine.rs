//! Whole-file runs through the state machine with a fake browser
#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{FakeBrowser, SERVER_CMD, SERVER_URL};
use stagehand_e2e::browser::{ConsoleKind, ConsoleLocation, PageEvent};
use stagehand_e2e::config::Config;
use stagehand_e2e::platform::Platform;
use stagehand_e2e::{
    E2eError, E2eResult, FailureReason, FileExecutor, LogSource, LogStore, ReadyPredicate, RunParameters, TestFileLoader,
    TestFileRun, Verdict,
};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    file: PathBuf,
    browser: FakeBrowser,
    logs: LogStore,
    executor: FileExecutor,
}

fn fixture(loader: impl Fn(&Path, &mut TestFileRun) -> E2eResult<()> + Send + Sync + 'static) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("examples/demo/app.test.yaml");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, "").unwrap();

    let browser = FakeBrowser::default();
    let logs = LogStore::default();
    let loader: Arc<dyn TestFileLoader> = Arc::new(loader);
    let executor = FileExecutor::new(
        dir.path(),
        Arc::new(Config::defaults(Platform::current(), false)),
        logs.clone(),
        loader,
        Arc::new(browser.clone()),
    );
    Fixture {
        _dir: dir,
        file,
        browser,
        logs,
        executor,
    }
}

fn server() -> RunParameters {
    RunParameters::new(SERVER_CMD)
        .server_url(SERVER_URL)
        .ready_delay(Duration::ZERO)
}

#[tokio::test]
async fn passing_file_runs_every_step() {
    let fx = fixture(|_, run| {
        run.configure_run(server())?;
        run.test("opens the home page", |ctx| async move {
            ctx.goto("/").await?;
            Ok(())
        })?;
        run.test("reads the title", |ctx| async move {
            let text = ctx.page().text_content("h1").await?;
            anyhow::ensure!(text.as_deref() == Some("Hello"), "unexpected title {:?}", text);
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert_eq!(outcome.verdict, Verdict::Passed);
    assert!(!outcome.flaky);
    assert_eq!(*fx.browser.recorder.visited.lock(), vec![format!("{}/", SERVER_URL)]);
    assert_eq!(*fx.browser.recorder.pages_opened.lock(), 1);
    assert_eq!(*fx.browser.recorder.pages_closed.lock(), 1);
    // Logs of a passing file are discarded.
    assert!(fx.logs.is_empty());
}

#[tokio::test]
async fn throwing_step_stops_the_file() {
    let later_ran = Arc::new(AtomicBool::new(false));
    let flag = later_ran.clone();
    let fx = fixture(move |_, run| {
        run.configure_run(server().flaky(true))?;
        run.test("breaks", |_| async { anyhow::bail!("button missing") })?;
        let flag = flag.clone();
        run.test("never runs", move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, false).await;
    match &outcome.verdict {
        Verdict::Failed(FailureReason::StepThrew { index, error, .. }) => {
            assert_eq!(*index, 0);
            assert!(error.contains("button missing"));
        }
        other => panic!("unexpected verdict {:?}", other),
    }
    assert!(outcome.flaky);
    assert!(!later_ran.load(Ordering::SeqCst));
    assert_eq!(*fx.browser.recorder.pages_closed.lock(), 1);
}

#[tokio::test]
async fn browser_error_fails_the_step() {
    let fx = fixture(|_, run| {
        run.configure_run(server())?;
        run.test("hydrates", |ctx| async move {
            ctx.logs().add(LogSource::BrowserError, "Uncaught TypeError: x is undefined");
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert_eq!(
        outcome.verdict,
        Verdict::Failed(FailureReason::StepFailingLogs {
            index: 0,
            description: "hydrates".into()
        })
    );
}

#[tokio::test]
async fn console_error_from_the_page_fails_the_step() {
    let recorder = Arc::new(parking_lot::Mutex::new(None::<Arc<common::Recorder>>));
    let slot = recorder.clone();
    let fx = fixture(move |_, run| {
        run.configure_run(server())?;
        let slot = slot.clone();
        run.test("logs an error", move |_| async move {
            let recorder = slot.lock().clone();
            if let Some(recorder) = recorder {
                recorder.emit(PageEvent::Console {
                    kind: ConsoleKind::Error,
                    text: "Failed to load resource".into(),
                    location: ConsoleLocation::default(),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
    });
    *recorder.lock() = Some(fx.browser.recorder.clone());

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert!(
        matches!(outcome.verdict, Verdict::Failed(FailureReason::StepFailingLogs { .. })),
        "{:?}",
        outcome.verdict
    );
}

#[tokio::test]
async fn step_timeout_fails_the_step() {
    let fx = fixture(|_, run| {
        run.configure_run(server().step_timeout(Duration::from_millis(200)))?;
        run.test("hangs", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    match outcome.verdict {
        Verdict::Failed(FailureReason::StepThrew { error, .. }) => assert!(error.contains("Timeout"), "{}", error),
        other => panic!("unexpected verdict {:?}", other),
    }
}

#[tokio::test]
async fn skipped_file_never_boots() {
    let fx = fixture(|_, run| run.skip("needs a GPU"));

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert_eq!(outcome.verdict, Verdict::Skipped("needs a GPU".into()));
    assert_eq!(*fx.browser.recorder.pages_opened.lock(), 0);
}

#[tokio::test]
async fn missing_run_is_a_usage_failure() {
    let fx = fixture(|_, _| Ok(()));

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert!(outcome.is_usage_failure(), "{:?}", outcome.verdict);
}

#[tokio::test]
async fn failing_server_is_a_start_failure() {
    let step_ran = Arc::new(AtomicBool::new(false));
    let flag = step_ran.clone();
    let fx = fixture(move |_, run| {
        run.configure_run(RunParameters::new("echo 'cannot bind' >&2; exit 1").server_url(SERVER_URL))?;
        let flag = flag.clone();
        run.test("unreachable", move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    match &outcome.verdict {
        Verdict::Failed(reason @ FailureReason::ServerStart(_)) => {
            assert_eq!(reason.summary(), "server start failure");
        }
        other => panic!("unexpected verdict {:?}", other),
    }
    assert!(!step_ran.load(Ordering::SeqCst));
    assert_eq!(*fx.browser.recorder.pages_closed.lock(), 1);
}

#[tokio::test]
async fn server_exiting_after_its_banner_still_passes() {
    let fx = fixture(|_, run| {
        run.configure_run(
            RunParameters::new("echo 'Server running at :3000'")
                .server_url(SERVER_URL)
                .ready_when(ReadyPredicate::literal("Server running at"))
                .ready_delay(Duration::ZERO),
        )?;
        run.test("passes", |_| async { Ok(()) })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert_eq!(outcome.verdict, Verdict::Passed);
    assert!(fx.logs.is_empty());
}

#[tokio::test]
async fn edits_left_behind_fail_the_step_and_are_reverted() {
    let fx = fixture(|_, run| {
        run.configure_run(server())?;
        run.test("edits", |ctx| async move {
            ctx.edit_file("app.test.yaml", |s| format!("{}# edited\n", s))?;
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert!(outcome.is_failure());
    assert_eq!(std::fs::read_to_string(&fx.file).unwrap(), "");
}

#[tokio::test]
async fn file_runs_are_independent() {
    let fx = fixture(|_, run| {
        run.configure_run(server())?;
        run.test("ok", |_| async { Ok(()) })
    });

    for _ in 0..2 {
        let outcome = fx.executor.run_file(&fx.file, true).await;
        assert_eq!(outcome.verdict, Verdict::Passed);
    }
}

#[tokio::test]
async fn stderr_during_shutdown_is_a_termination_failure() {
    let fx = fixture(|_, run| {
        run.configure_run(
            RunParameters::new(
                "trap 'echo bye >&2; exit 0' TERM; echo 'Server running at :9'; while :; do sleep 0.05; done",
            )
            .server_url(SERVER_URL)
            .ready_delay(Duration::ZERO),
        )?;
        run.test("passes", |_| async { Ok(()) })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert_eq!(outcome.verdict, Verdict::Failed(FailureReason::Termination));
}

#[tokio::test]
async fn run_command_checks_exit_code_stderr_and_timeout() {
    let fx = fixture(|_, run| {
        run.configure_run(server())?;
        run.test("runs commands", |ctx| async move {
            let listing = ctx.run_command("ls", None).await?;
            anyhow::ensure!(listing.contains("app.test.yaml"), "ran elsewhere: {:?}", listing);

            for cmd in ["echo oops >&2", "exit 3"] {
                match ctx.run_command(cmd, None).await {
                    Err(E2eError::Command { reason, .. }) => {
                        anyhow::ensure!(reason.contains("oops") || reason.contains('3'), "{}", reason);
                    }
                    other => anyhow::bail!("`{}` should fail, got {:?}", cmd, other),
                }
            }

            let started = std::time::Instant::now();
            let err = ctx
                .run_command("sleep 5", Some(Duration::from_millis(200)))
                .await
                .unwrap_err();
            anyhow::ensure!(err.to_string().contains("timeout"), "{}", err);
            anyhow::ensure!(started.elapsed() < Duration::from_secs(3));
            Ok(())
        })
    });

    let outcome = fx.executor.run_file(&fx.file, true).await;
    assert_eq!(outcome.verdict, Verdict::Passed);
}

#[tokio::test]
async fn file_run_future_is_send() {
    fn assert_send<T: Send>(_: &T) {}
    let fx = fixture(|_, _| Ok(()));
    let run = fx.executor.run_file(&fx.file, true);
    assert_send(&run);
    assert!(run.await.is_usage_failure());
}
