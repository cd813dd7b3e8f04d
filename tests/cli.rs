use std::fs;
use std::thread;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn bin() -> Command {
    Command::cargo_bin("thread-tracker").expect("thread-tracker binary")
}

#[test]
fn prints_version() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("thread-tracker"))
        .stdout(predicate::str::contains("--once"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn rejects_unknown_arguments() {
    bin()
        .arg("--frobnicate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown argument"));
}

fn serve(routes: Vec<(&'static str, &'static str)>) -> String {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let body = routes
                .iter()
                .find(|(path, _)| *path == request.url())
                .map(|(_, body)| *body);
            let response = match body {
                Some(body) => tiny_http::Response::from_string(body),
                None => tiny_http::Response::from_string("").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
    format!("http://127.0.0.1:{port}")
}

#[test]
fn once_syncs_and_prints_the_merged_feed() {
    let base = serve(vec![
        (
            "/b/catalog.json",
            r#"[{"threads":[{"no":100,"sub":"OTK general","com":"welcome"},{"no":200,"sub":"cats","com":"meow"}]}]"#,
        ),
        (
            "/b/thread/100.json",
            r#"{"posts":[{"no":100,"time":1700000000,"sub":"OTK general","com":"first post"},{"no":101,"time":1700000060,"com":"&gt;&gt;100<br>agreed"}]}"#,
        ),
    ]);
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(
        &config,
        format!(
            "board:\n  api_base: {base}\nstorage:\n  path: {}\n",
            dir.path().join("tracker.db").display()
        ),
    )
    .unwrap();

    bin()
        .arg("--once")
        .arg("--config")
        .arg(&config)
        .env("THREAD_TRACKER_LOG", "off")
        .assert()
        .success()
        .stdout(predicate::str::contains("OTK general (2 messages"))
        .stdout(predicate::str::contains("first post"))
        .stdout(predicate::str::contains("agreed"))
        .stdout(predicate::str::contains("cats").not());
}
