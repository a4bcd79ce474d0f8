//! Shared helpers for integration tests: stand in shell scripts for
//! the Python workers, since the relay only cares about the line
//! protocol on stdout.
#![allow(dead_code)]

use std::path::PathBuf;
use uuid::Uuid;

use lesson_relay::config::Config;
use lesson_relay::server::AppState;

pub struct StubWorkers {
    pub dir: PathBuf,
}

impl StubWorkers {
    pub fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("lesson-relay-it-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    /// Install a stub worker script under its protocol name.
    pub fn script(&self, name: &str, body: &str) -> &Self {
        std::fs::write(self.dir.join(name), body).unwrap();
        self
    }

    pub fn config(&self) -> Config {
        Config {
            python_bin: "sh".to_string(),
            workers_dir: self.dir.clone(),
            worker_timeout_secs: 5,
            ..Config::default()
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(self.config())
    }
}
