//! Gemini mock helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use wiremock::ResponseTemplate;

pub const GEMINI_TEXT: &str = include_str!("fixtures/gemini_text.sse");

pub const MODEL: &str = "gemini-test";

/// A two-chunk Gemini stream whose concatenated text is `first` + `second`.
pub fn text_sse(first: &str, second: &str) -> String {
    GEMINI_TEXT
        .replace("{{FIRST}}", &escape_json(first))
        .replace("{{SECOND}}", &escape_json(second))
}

pub fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

pub fn text_response(first: &str, second: &str) -> ResponseTemplate {
    sse_response(&text_sse(first, second))
}

pub fn quota_response() -> ResponseTemplate {
    ResponseTemplate::new(429).set_body_string(
        r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
    )
}

/// Writes a config with both sessions on Gemini and one pool entry per key.
pub fn write_config(home: &Path, keys: &[(&str, &str)]) {
    let mut config = format!(
        "auto_reply_delay = \"0\"\n\n\
         [session_1]\nprovider = \"gemini\"\nmodel = \"{MODEL}\"\n\n\
         [session_2]\nprovider = \"gemini\"\nmodel = \"{MODEL}\"\n"
    );
    for (id, secret) in keys {
        config.push_str(&format!(
            "\n[[providers.gemini.keys]]\nid = \"{id}\"\napi_key = \"{secret}\"\n"
        ));
    }
    fs::write(home.join("config.toml"), config).unwrap();
}

fn escape_json(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
