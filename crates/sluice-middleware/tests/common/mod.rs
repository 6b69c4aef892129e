//! Shared helpers for integration tests.

#![allow(dead_code)]

use sluice_middleware::Logger;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Keeps a logger's events in memory as JSON lines.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    pub fn logger(&self) -> Logger {
        let config = sluice_telemetry::LogConfig {
            level: "DEBUG".to_string(),
            ..sluice_telemetry::LogConfig::production()
        };
        let buf = Arc::clone(&self.0);
        Logger::new(sluice_telemetry::logging::dispatch(&config, move || {
            Sink(Arc::clone(&buf))
        }))
    }

    pub fn lines(&self) -> Vec<serde_json::Value> {
        let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
        raw.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn with_message(&self, message: &str) -> Vec<serde_json::Value> {
        self.lines()
            .into_iter()
            .filter(|line| line["fields"]["message"] == message)
            .collect()
    }
}

/// Gunzips a response body.
pub fn gunzip(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}
