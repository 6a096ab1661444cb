//! Circuit-breaker interface and registry.
//!
//! The pipeline consults a breaker before each proxy attempt and feeds it the
//! outcome. Breaker policy itself is pluggable; the crate only ships the
//! pass-through [`AlwaysClosed`] default.

use std::{collections::HashMap, rc::Rc};

use http::StatusCode;
use thiserror::Error;

use crate::error::ServerError;

#[derive(Error, Debug)]
#[error("circuit breaker {name} is open")]
pub struct CircuitOpen {
    pub name: String,
}

pub trait CircuitBreaker {
    fn name(&self) -> &str;

    /// Called before an attempt. `Err` short-circuits the call without any
    /// downstream work happening.
    fn check(&self) -> Result<(), CircuitOpen>;

    /// Called once per attempt that produced a downstream response.
    fn on_success(&self, status: StatusCode);

    /// Called once per attempt that failed for infrastructure reasons.
    fn on_failure(&self, error: &ServerError);
}

/// Which breaker an endpoint or proxy target wants.
#[derive(Debug, Clone, Default)]
pub enum BreakerChoice {
    /// The registry's default breaker.
    #[default]
    Default,
    /// A named breaker registered by the embedder.
    Named(String),
    /// No breaking for this endpoint.
    Disabled,
}

/// Never opens. The registry default unless the embedder supplies policy.
#[derive(Debug, Default)]
pub struct AlwaysClosed;

impl CircuitBreaker for AlwaysClosed {
    fn name(&self) -> &str {
        "always-closed"
    }

    fn check(&self) -> Result<(), CircuitOpen> {
        Ok(())
    }

    fn on_success(&self, _status: StatusCode) {}

    fn on_failure(&self, _error: &ServerError) {}
}

pub struct BreakerRegistry {
    default: Rc<dyn CircuitBreaker>,
    named: HashMap<String, Rc<dyn CircuitBreaker>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        BreakerRegistry {
            default: Rc::new(AlwaysClosed),
            named: HashMap::new(),
        }
    }
}

impl BreakerRegistry {
    pub fn new(default: Rc<dyn CircuitBreaker>) -> Self {
        BreakerRegistry {
            default,
            named: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, breaker: Rc<dyn CircuitBreaker>) {
        self.named.insert(name.into(), breaker);
    }

    /// Resolves a choice to a breaker. An unknown name falls back to the
    /// default rather than silently disabling breaking.
    pub fn resolve(&self, choice: &BreakerChoice) -> Option<Rc<dyn CircuitBreaker>> {
        match choice {
            BreakerChoice::Disabled => None,
            BreakerChoice::Default => Some(self.default.clone()),
            BreakerChoice::Named(name) => Some(
                self.named
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.default.clone()),
            ),
        }
    }
}
