use serde::Deserialize;
use serde_json::{json, Value};

use crate::git::CommitDetails;

/// Operations the controller may request, tagged by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    Sync {
        url: String,
        branch: String,
        path: String,
        #[serde(default = "default_depth")]
        depth: u32,
    },

    Files {
        path: String,
        #[serde(default)]
        subpath: Option<String>,
    },

    Read {
        path: String,
        file: String,
    },

    Head {
        path: String,
    },

    Checkout {
        path: String,
        sha: String,
    },

    LsRemote {
        url: String,
        branch: String,
    },
}

fn default_depth() -> u32 {
    1
}

/// Build the `{"ok": …}` arm of the envelope.
pub fn ok(value: Value) -> Value {
    json!({ "ok": value })
}

pub fn ok_str(value: impl Into<String>) -> Value {
    ok(Value::String(value.into()))
}

pub fn ok_commit(details: &CommitDetails) -> Value {
    ok(serde_json::to_value(details).expect("commit details serialize"))
}

/// Build the `{"err": …}` arm of the envelope.
pub fn err(reason: impl std::fmt::Display) -> Value {
    json!({ "err": reason.to_string() })
}
