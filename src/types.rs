use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Name under which the server exposes [`crate::Data::get_data`].
pub const GET_DATA: &str = "Data.GetData";

/// Options represents the options shared by the demo server and its callers
#[derive(Clone, Debug)]
pub struct Options {
    /// Addr is the address the server listens on and the callers dial. default is 127.0.0.1:1234
    pub addr: String,
    /// Key is the flight key every caller uses. default is "foo"
    pub key: String,
    /// Callers is the number of concurrent callers. default is 100
    pub callers: usize,
    /// ServerDelay is how long the server works on each request. default is 1s
    /// should be long enough for every caller to join the flight.
    pub server_delay: Duration,
    /// Reply is what the server answers. default is "source Data from RPC server"
    pub reply: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:1234".to_string(),
            key: "foo".to_string(),
            callers: 100,
            server_delay: Duration::from_secs(1),
            reply: "source Data from RPC server".to_string(),
        }
    }
}

/// Arg is the argument of `Data.GetData`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arg {
    pub caller: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub arg: Arg,
}

/// Exactly one of `reply` and `error` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn reply(id: u64, reply: String) -> Self {
        Self {
            id,
            reply: Some(reply),
            error: None,
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            reply: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<String> {
        match (self.reply, self.error) {
            (_, Some(error)) => Err(Error::Remote(error)),
            (Some(reply), None) => Ok(reply),
            (None, None) => Err(Error::Remote(format!("empty response to request {}", self.id))),
        }
    }
}
