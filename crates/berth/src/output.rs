//! Human and JSON rendering of command results.

use std::fmt::Display;

use chrono::{Local, TimeZone};
use colored::Colorize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
        }
    }
}

/// The machine-readable result object. Field names are stable.
pub fn envelope(status: Status, message: &str, data: Value) -> Value {
    json!({
        "status": status.as_str(),
        "message": message,
        "data": data,
    })
}

pub struct Reporter {
    json: bool,
}

impl Reporter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn success(&self, message: &str, data: Value) {
        if self.json {
            println!("{}", envelope(Status::Ok, message, data));
        } else {
            println!("{} {}", "✓".green(), message.green());
        }
    }

    pub fn failure(&self, message: &str, data: Value) {
        if self.json {
            println!("{}", envelope(Status::Error, message, data));
        } else {
            eprintln!("{} {}", "✗".red(), message.red());
        }
    }

    /// Human mode only.
    pub fn warn(&self, message: &str) {
        if !self.json {
            eprintln!("{} {}", "!".yellow(), message.yellow());
        }
    }

    /// A `label : value` line under the last status line. Human mode only.
    pub fn detail(&self, label: &str, value: impl Display) {
        if !self.json {
            println!("  {label:>10} : {value}");
        }
    }

    pub fn blank(&self) {
        if !self.json {
            println!();
        }
    }
}

/// Render a unix timestamp in local time.
pub fn timestamp(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}
