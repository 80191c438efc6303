mod fixtures;

use assert_cmd::cargo::cargo_bin_cmd;
use fixtures::{MODEL, quota_response, text_response, write_config};
use predicates::prelude::*;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn stream_path() -> String {
    format!("/models/{MODEL}:streamGenerateContent")
}

/// Every key passes the startup health probe.
async fn mount_probe(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"models":[]}"#))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_chat_streams_response() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .and(query_param("alt", "sse"))
        .and(header("x-goog-api-key", "key-a"))
        .respond_with(text_response("Hello, ", "world!"))
        .expect(1)
        .mount(&server)
        .await;

    let home = tempdir().unwrap();
    write_config(home.path(), &[("a", "key-a")]);

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env("GEMINI_BASE_URL", server.uri())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1] Hello, world!"));
}

#[tokio::test]
async fn test_chat_fails_over_on_quota() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .and(header("x-goog-api-key", "key-a"))
        .respond_with(quota_response())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .and(header("x-goog-api-key", "key-b"))
        .respond_with(text_response("from ", "b"))
        .expect(1)
        .mount(&server)
        .await;

    let home = tempdir().unwrap();
    write_config(home.path(), &[("a", "key-a"), ("b", "key-b")]);

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env("GEMINI_BASE_URL", server.uri())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1] from b"))
        .stderr(predicate::str::contains("Key failed, switching: a → b"));
}

#[tokio::test]
async fn test_chat_reports_exhausted_pool() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .respond_with(quota_response())
        .expect(2)
        .mount(&server)
        .await;

    let home = tempdir().unwrap();
    write_config(home.path(), &[("a", "key-a"), ("b", "key-b")]);

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env("GEMINI_BASE_URL", server.uri())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failover failed, no more keys available"))
        .stderr(predicate::str::contains("No response received"));
}

#[tokio::test]
async fn test_auto_reply_hands_response_to_peer() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .respond_with(text_response("po", "ng"))
        .expect(2)
        .mount(&server)
        .await;

    let home = tempdir().unwrap();
    write_config(home.path(), &[("a", "key-a")]);

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env("GEMINI_BASE_URL", server.uri())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "ping", "--auto-reply", "--turns", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1] pong"))
        .stdout(predicate::str::contains("[2] pong"));
}

/// The capped session's incoming countdown still fires before chaining stops.
#[tokio::test]
async fn test_auto_reply_after_countdown_respects_turns() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .respond_with(text_response("po", "ng"))
        .expect(2)
        .mount(&server)
        .await;

    let home = tempdir().unwrap();
    write_config(home.path(), &[("a", "key-a")]);

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env("GEMINI_BASE_URL", server.uri())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "ping", "--auto-reply", "--delay", "0.01", "--turns", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1] pong"))
        .stdout(predicate::str::contains("[2] pong"))
        .stderr(predicate::str::contains("[2] [Auto-reply to session 2 in 1 s.]"));
}

#[tokio::test]
async fn test_chat_without_model_fails_fast() {
    let home = tempdir().unwrap();

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Select a provider and model for session 1."));
}

#[tokio::test]
async fn test_save_writes_session_file() {
    let server = MockServer::start().await;
    mount_probe(&server).await;
    Mock::given(method("POST"))
        .and(path(stream_path()))
        .respond_with(text_response("saved ", "reply"))
        .mount(&server)
        .await;

    let home = tempdir().unwrap();
    write_config(home.path(), &[("a", "key-a")]);
    let session_path = home.path().join("session.json");

    cargo_bin_cmd!("duet")
        .env("DUET_HOME", home.path())
        .env("GEMINI_BASE_URL", server.uri())
        .env_remove("GEMINI_API_KEY")
        .args(["chat", "-p", "hi", "--save"])
        .arg(&session_path)
        .assert()
        .success();

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&session_path).unwrap()).unwrap();
    assert_eq!(saved["version"], 1);
    let history = saved["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["role"], "user");
    assert_eq!(history[0]["text"], "hi");
    assert_eq!(history[1]["role"], "model");
    assert_eq!(history[1]["text"], "saved reply");
}
