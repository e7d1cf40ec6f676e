//! Batch runs of YAML test files through the runner with a fake browser
#![cfg(unix)]

mod common;

use std::path::Path;
use std::time::Duration;

use common::{FakeBrowser, SERVER_CMD, SERVER_URL};
use stagehand_e2e::config::Config;
use stagehand_e2e::discovery::FileFilter;
use stagehand_e2e::platform::Platform;
use stagehand_e2e::{RunnerConfig, TestRunner, Verdict};

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn server_test(title: &str) -> String {
    format!(
        r#"run:
  cmd: "{cmd}"
  server_url: {url}
  ready_delay_ms: 0
tests:
  - description: renders the title
    steps:
      - action: navigate
        url: /
      - action: assert_text
        selector: h1
        equals: {title}
      - action: log
        message: title checked
"#,
        cmd = SERVER_CMD,
        url = SERVER_URL,
        title = title,
    )
}

fn suite() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "examples/broken/app.test.yaml", &server_test("Goodbye"));
    write(dir.path(), "examples/hello/app.test.yaml", &server_test("Hello"));
    write(dir.path(), "examples/later/app.test.yaml", "skip: not supported yet\n");
    write(dir.path(), "examples/hello/README.md", "not a test file");
    dir
}

fn runner(root: &Path, config: RunnerConfig) -> TestRunner {
    TestRunner::with_settings(
        RunnerConfig {
            root: root.to_path_buf(),
            ..config
        },
        Config::defaults(Platform::current(), false),
    )
}

#[tokio::test]
async fn runs_every_discovered_file() {
    let dir = suite();
    let runner = runner(dir.path(), RunnerConfig::default());
    let browser = FakeBrowser::default();

    let files = runner.test_files().unwrap();
    assert_eq!(files.len(), 3);

    let report = runner.run_files(&browser, &files).await.unwrap();
    assert_eq!(report.failed, vec![dir.path().join("examples/broken/app.test.yaml")]);
    assert_eq!(report.outcomes.len(), 3);
    assert!(matches!(report.outcomes[2].verdict, Verdict::Skipped(_)));
    assert!(*browser.recorder.browser_closed.lock());
    // One page per booted file
    assert_eq!(*browser.recorder.pages_opened.lock(), 2);
}

#[tokio::test]
async fn bail_stops_after_the_first_failure() {
    let dir = suite();
    let runner = runner(
        dir.path(),
        RunnerConfig {
            bail: true,
            ..RunnerConfig::default()
        },
    );
    let browser = FakeBrowser::default();

    let files = runner.test_files().unwrap();
    let report = runner.run_files(&browser, &files).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.outcomes.len(), 1);
    assert!(!report.is_success());
}

#[tokio::test]
async fn filter_selects_files() {
    let dir = suite();
    let runner = runner(
        dir.path(),
        RunnerConfig {
            filter: FileFilter::new(vec!["hello".into()], false),
            ..RunnerConfig::default()
        },
    );
    let browser = FakeBrowser::default();

    let files = runner.test_files().unwrap();
    assert_eq!(files, vec![dir.path().join("examples/hello/app.test.yaml")]);
    let report = runner.run_files(&browser, &files).await.unwrap();
    assert!(report.is_success());
    assert_eq!(*browser.recorder.visited.lock(), vec![format!("{}/", SERVER_URL)]);
}

#[tokio::test]
async fn invalid_test_file_is_a_usage_failure() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "examples/typo/app.test.yaml", "runn:\n  cmd: npm start\n");
    let runner = runner(dir.path(), RunnerConfig::default());

    let files = runner.test_files().unwrap();
    let report = runner.run_files(&FakeBrowser::default(), &files).await.unwrap();
    assert!(report.outcomes[0].is_usage_failure());
    assert!(report.aborted);
}

#[tokio::test]
async fn run_command_action_fails_on_a_failing_command() {
    let dir = tempfile::tempdir().unwrap();
    let test = server_test("Hello").replace(
        "      - action: log\n",
        "      - action: run_command\n        cmd: touch built && exit 2\n      - action: log\n",
    );
    write(dir.path(), "examples/build/app.test.yaml", &test);
    let runner = runner(dir.path(), RunnerConfig::default());

    let files = runner.test_files().unwrap();
    let report = runner.run_files(&FakeBrowser::default(), &files).await.unwrap();
    assert!(!report.is_success());
    assert!(matches!(
        report.outcomes[0].verdict,
        Verdict::Failed(stagehand_e2e::FailureReason::StepThrew { .. })
    ));
    // Ran next to the test file
    assert!(dir.path().join("examples/build/built").exists());
}

#[tokio::test]
async fn dropped_run_leaves_no_server_behind() {
    let dir = tempfile::tempdir().unwrap();
    let test = server_test("Hello").replace(
        "      - action: log\n",
        "      - action: sleep\n        ms: 30000\n      - action: log\n",
    );
    write(dir.path(), "examples/slow/app.test.yaml", &test);
    let runner = runner(dir.path(), RunnerConfig::default());
    let browser = FakeBrowser::default();
    let files = runner.test_files().unwrap();

    let interrupted = tokio::time::timeout(Duration::from_millis(800), runner.run_files(&browser, &files)).await;
    assert!(interrupted.is_err());
    assert!(runner.wait_for_servers(Duration::from_secs(5)).await);
    assert_eq!(runner.live_servers().count(), 0);
}
