//! Template copies prepared ahead of demand.
//!
//! Copying a template is fast but still costs a round trip through
//! `createdb`. While a test runs against one copy, a background task creates
//! the next one so the following request is served from the ready list.
//!
//! The engine refuses to copy a template that has open connections, and an
//! in-flight `createdb --template T` is itself a connection to `T`. Callers
//! must therefore [`PreparedCopies::settle`] before issuing their own copy of
//! a template or dropping it.

use crate::catalog::AdminTarget;
use crate::runner::CommandRunner;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(crate) struct PreparedCopies {
    ready: Arc<Mutex<HashMap<String, Vec<String>>>>,
    pending: Option<JoinHandle<()>>,
    max_prepared: usize,
}

impl PreparedCopies {
    pub fn new(max_prepared: usize) -> Self {
        Self {
            ready: Arc::default(),
            pending: None,
            max_prepared,
        }
    }

    fn with_ready<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<String>>) -> T) -> T {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut ready)
    }

    /// Pops a ready copy of `template`.
    pub fn take(&self, template: &str) -> Option<String> {
        self.with_ready(|ready| ready.get_mut(template).and_then(Vec::pop))
    }

    pub fn count(&self, template: &str) -> usize {
        self.with_ready(|ready| ready.get(template).map_or(0, Vec::len))
    }

    /// Whether copies of `name` have ever been prepared.
    pub fn is_template(&self, name: &str) -> bool {
        self.with_ready(|ready| ready.contains_key(name))
    }

    /// Whether another copy of `template` should be started now.
    pub fn wants_more(&self, template: &str) -> bool {
        let idle = self.pending.as_ref().is_none_or(JoinHandle::is_finished);
        idle && self.count(template) < self.max_prepared
    }

    /// Waits for the in-flight copy, if any.
    pub async fn settle(&mut self) {
        if let Some(handle) = self.pending.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "template preparation task failed");
            }
        }
    }

    /// Starts copying `template` into `name` in the background.
    pub fn spawn<R: CommandRunner>(
        &mut self,
        runner: Arc<R>,
        target: AdminTarget,
        template: &str,
        name: String,
    ) {
        let ready = Arc::clone(&self.ready);
        let template = template.to_string();
        ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(template.clone())
            .or_default();

        self.pending = Some(tokio::spawn(async move {
            let invocation = target.createdb(&name, Some(&template));
            match runner.run(&invocation).await {
                Ok(output) if output.success() => {
                    tracing::debug!(database = %name, template = %template, "prepared template copy");
                    ready
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(template)
                        .or_default()
                        .push(name);
                }
                Ok(output) => {
                    tracing::warn!(
                        database = %name,
                        template = %template,
                        output = %output.output.trim(),
                        "failed to prepare template copy"
                    );
                }
                Err(e) => {
                    tracing::warn!(database = %name, template = %template, error = %e, "failed to prepare template copy");
                }
            }
        }));
    }

    /// Forgets `template`, returning its unused copies.
    pub fn remove_template(&mut self, template: &str) -> Vec<String> {
        self.with_ready(|ready| ready.remove(template).unwrap_or_default())
    }

    /// Forgets every template, returning all unused copies.
    pub fn drain(&mut self) -> Vec<String> {
        self.with_ready(|ready| ready.drain().flat_map(|(_, copies)| copies).collect())
    }

    /// Cancels the in-flight copy without waiting.
    pub fn abort(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
