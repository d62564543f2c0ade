//! Upstream session acquisition.
//!
//! The console session is obtained once, before the listener is bound, by an
//! external collaborator. The resulting [`SessionDescriptor`] is immutable for
//! the rest of the process lifetime and is never refreshed.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::SessionError;

/// Flag asking the session command to log in and print the session only.
pub const SESSION_ONLY_FLAG: &str = "-S";

pub const DEFAULT_SESSION_COMMAND: &str = "/usr/local/bin/get_java_viewer";

/// Cookies (and opaque host metadata) of an authenticated console session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDescriptor {
    /// Cookie name/value pairs in the order the collaborator returned them.
    /// Names are unique.
    pub cookies: Vec<(String, String)>,
    /// Every other top-level key of the payload.
    pub metadata: Map<String, Value>,
}

impl SessionDescriptor {
    pub fn from_cookies<I, K, V>(cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut descriptor = Self::default();
        for (name, value) in cookies {
            descriptor.insert_cookie(name.into(), value.into());
        }
        descriptor
    }

    /// Parse the collaborator's JSON payload.
    pub fn from_json(payload: &str) -> Result<Self, SessionError> {
        let mut root: Map<String, Value> = serde_json::from_str(payload.trim())?;
        let cookies = match root.remove("cookies") {
            Some(Value::Object(cookies)) => cookies,
            _ => return Err(SessionError::MissingCookies),
        };

        let mut descriptor = Self {
            cookies: Vec::with_capacity(cookies.len()),
            metadata: root,
        };
        for (name, value) in cookies {
            match value {
                Value::String(value) => descriptor.insert_cookie(name, value),
                _ => return Err(SessionError::InvalidCookie { name }),
            }
        }
        Ok(descriptor)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn insert_cookie(&mut self, name: String, value: String) {
        match self.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.cookies.push((name, value)),
        }
    }
}

/// Source of the upstream session.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self, password: &str) -> Result<SessionDescriptor, SessionError>;
}

/// Runs an external login command. The password goes to the child's stdin,
/// never to its argument list; the session JSON is read from its stdout.
#[derive(Debug, Clone)]
pub struct CommandSessionProvider {
    program: String,
    args: Vec<String>,
}

impl CommandSessionProvider {
    /// `args` are passed through verbatim, followed by [`SESSION_ONLY_FLAG`].
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let mut args = args;
        args.push(SESSION_ONLY_FLAG.to_string());
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl SessionProvider for CommandSessionProvider {
    async fn acquire(&self, password: &str) -> Result<SessionDescriptor, SessionError> {
        debug!(program = %self.program, args = ?self.args, "Running session command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Collaborator logs go to our stderr.
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(password.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(SessionError::ExitStatus(output.status));
        }

        let payload = String::from_utf8_lossy(&output.stdout);
        let session = SessionDescriptor::from_json(&payload)?;
        info!(
            cookies = session.cookies.len(),
            metadata = ?session.metadata.keys().collect::<Vec<_>>(),
            "Acquired upstream session"
        );
        Ok(session)
    }
}
